//! Subscriber ports: delivery-queue ownership and the subscription state
//! machine.
//!
//! State machine (initial NOT_SUBSCRIBED):
//!
//! ```text
//! NOT_SUBSCRIBED   --subscribe()-->  SUBSCRIBE_REQUESTED   (SUB to broker)
//! SUBSCRIBE_REQUESTED --ACK_SUB-->   SUBSCRIBED
//! SUBSCRIBE_REQUESTED --NACK_SUB-->  NOT_SUBSCRIBED        (error surfaced)
//! SUBSCRIBED       --unsubscribe()-> UNSUBSCRIBE_REQUESTED (UNSUB to broker)
//! UNSUBSCRIBE_REQUESTED --ACK_UNSUB-> NOT_SUBSCRIBED       (drain & release)
//! any              --STOP_OFFER-->   NOT_SUBSCRIBED        (drain & release)
//! ```
//!
//! Broker messages arrive on the port's inbox ring and are applied by the
//! owner inside [`SubscriberPort::process_discovery`], which the data-path
//! entry points call first — the state a caller observes is always current
//! as of its own call.

use std::cell::UnsafeCell;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use crate::discovery::capro::{CaproKind, CaproMessage};
use crate::discovery::channel::CaproRing;
use crate::discovery::service::ServiceDescriptor;
use crate::error::{fatal_invariant, AxonError, AxonResult};
use crate::memory::chunk::Chunk;
use crate::memory::offset_ptr::{OffsetPtr, ENCODED_NULL};
use crate::memory::segment::SegmentMap;
use crate::port::queue::{ChunkQueue, OverflowPolicy, MAX_QUEUE_CAPACITY};
use crate::port::{unique_port_id, PORT_ACTIVE, PORT_ZOMBIE};
use crate::waitset::notifier::Notifier;

/// Subscription lifecycle states.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    NotSubscribed = 0,
    SubscribeRequested = 1,
    Subscribed = 2,
    UnsubscribeRequested = 3,
}

impl SubscriptionState {
    fn from_u32(v: u32) -> Self {
        match v {
            1 => SubscriptionState::SubscribeRequested,
            2 => SubscriptionState::Subscribed,
            3 => SubscriptionState::UnsubscribeRequested,
            _ => SubscriptionState::NotSubscribed,
        }
    }
}

/// Options for [`SubscriberPort::subscribe`].
#[derive(Debug, Clone, Copy)]
pub struct SubscriptionOptions {
    /// Requested queue capacity (rounded up to a power of two,
    /// ≤ [`MAX_QUEUE_CAPACITY`]).
    pub queue_capacity: u32,
    pub policy: OverflowPolicy,
    /// Replay depth requested from each matched publisher's history.
    pub history_request: u32,
}

impl Default for SubscriptionOptions {
    fn default() -> Self {
        Self {
            queue_capacity: 16,
            policy: OverflowPolicy::DiscardNew,
            history_request: 0,
        }
    }
}

/// The shm control block of a subscriber port.
#[repr(C)]
pub struct SubscriberPortData {
    pub(crate) alloc_state: AtomicU32,
    state: AtomicU32,
    port_id: AtomicU64,
    pub(crate) owner_pid: AtomicU64,
    service: UnsafeCell<ServiceDescriptor>,
    history_request: AtomicU32,
    /// Set once by the broker on NACK_SUB; cleared by the owner when read.
    rejected: AtomicU32,
    /// Encoded location of the bound notifier block; ENCODED_NULL if none.
    notifier: AtomicU64,
    notifier_index: AtomicU32,
    _pad: u32,
    pub(crate) outbox: CaproRing,
    pub(crate) inbox: CaproRing,
    queue: ChunkQueue,
}

// SAFETY: the UnsafeCell'd service descriptor is written during claim (before
// the block is ACTIVE) and read-only afterwards; everything else is atomic.
unsafe impl Sync for SubscriberPortData {}

impl SubscriberPortData {
    /// Claim-time initialization, before the block becomes visible.
    pub(crate) fn init(&self, service: ServiceDescriptor) {
        // SAFETY: claim holds exclusive access until alloc_state goes ACTIVE.
        unsafe { *self.service.get() = service };
        self.state
            .store(SubscriptionState::NotSubscribed as u32, Ordering::Relaxed);
        self.port_id.store(unique_port_id(), Ordering::Relaxed);
        self.owner_pid
            .store(std::process::id() as u64, Ordering::Relaxed);
        self.history_request.store(0, Ordering::Relaxed);
        self.rejected.store(0, Ordering::Relaxed);
        self.notifier.store(ENCODED_NULL, Ordering::Relaxed);
        self.notifier_index.store(0, Ordering::Relaxed);
        self.outbox.reset();
        self.inbox.reset();
        self.queue.reset(1, OverflowPolicy::DiscardNew);
    }

    pub fn service(&self) -> ServiceDescriptor {
        // SAFETY: written before ACTIVE, immutable afterwards.
        unsafe { *self.service.get() }
    }

    pub fn port_id(&self) -> u64 {
        self.port_id.load(Ordering::Relaxed)
    }

    pub fn state(&self) -> SubscriptionState {
        SubscriptionState::from_u32(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, s: SubscriptionState) {
        self.state.store(s as u32, Ordering::Release)
    }

    pub(crate) fn history_request(&self) -> u32 {
        self.history_request.load(Ordering::Relaxed)
    }

    pub(crate) fn queue(&self) -> &ChunkQueue {
        &self.queue
    }

    /// Whether a publisher may push to this port right now.
    ///
    /// SUBSCRIBE_REQUESTED counts: the broker wires publishers in the same
    /// pass that acknowledges the subscriber, and the subscriber's local
    /// state only advances when it next drains its inbox — replayed history
    /// must not fall into that window.
    pub(crate) fn accepts_deliveries(&self) -> bool {
        self.alloc_state.load(Ordering::Acquire) == PORT_ACTIVE
            && matches!(
                self.state(),
                SubscriptionState::Subscribed | SubscriptionState::SubscribeRequested
            )
    }

    /// The bound notifier, if any: (notifier block location, trigger index).
    pub(crate) fn notifier_binding(&self) -> Option<(OffsetPtr, u32)> {
        let loc = OffsetPtr::decode(self.notifier.load(Ordering::Acquire))?;
        Some((loc, self.notifier_index.load(Ordering::Acquire)))
    }

    pub(crate) fn bind_notifier(&self, loc: OffsetPtr, index: u32) {
        self.notifier_index.store(index, Ordering::Relaxed);
        self.notifier.store(loc.encode(), Ordering::Release);
    }

    pub(crate) fn clear_notifier(&self) {
        self.notifier.store(ENCODED_NULL, Ordering::Release);
    }
}

/// Process-local handle to a subscriber port. Owned by the subscribing
/// process; drop tears the subscription down through discovery.
pub struct SubscriberPort {
    map: Arc<SegmentMap>,
    data: NonNull<SubscriberPortData>,
    location: OffsetPtr,
    /// Id read at claim time; a mismatch means the broker reaped this block.
    port_id: u64,
    broker_notifier: NonNull<Notifier>,
}

// SAFETY: the handle can move between threads; the control block it points
// at is shm-resident and atomic-coordinated. (Single-consumer queue
// discipline is preserved because the handle is not Clone and pops take
// `&mut self`.)
unsafe impl Send for SubscriberPort {}

impl SubscriberPort {
    /// Bind a handle to a claimed control block.
    ///
    /// # Safety
    /// `data` must be the claimed block at `location` in `map`'s management
    /// segment; `broker_notifier` must outlive the handle (it lives in the
    /// same segment).
    pub(crate) unsafe fn from_parts(
        map: Arc<SegmentMap>,
        data: NonNull<SubscriberPortData>,
        location: OffsetPtr,
        broker_notifier: NonNull<Notifier>,
    ) -> Self {
        let port_id = data.as_ref().port_id();
        Self {
            map,
            data,
            location,
            port_id,
            broker_notifier,
        }
    }

    /// Verify the control block still belongs to this handle.
    fn ensure_live(&self) -> AxonResult<()> {
        let data = self.data();
        if data.alloc_state.load(Ordering::Acquire) != PORT_ACTIVE
            || data.port_id() != self.port_id
        {
            return Err(AxonError::PortAlreadyDestroyed);
        }
        Ok(())
    }

    #[inline]
    pub(crate) fn data(&self) -> &SubscriberPortData {
        // SAFETY: from_parts guarantees a live mapped block.
        unsafe { self.data.as_ref() }
    }

    /// Location of the control block (used as this port's discovery handle).
    #[inline]
    pub fn location(&self) -> OffsetPtr {
        self.location
    }

    pub fn service(&self) -> ServiceDescriptor {
        self.data().service()
    }

    pub fn port_id(&self) -> u64 {
        self.data().port_id()
    }

    /// Current state, after applying any pending broker messages.
    pub fn state(&mut self) -> SubscriptionState {
        self.process_discovery();
        self.data().state()
    }

    /// Samples lost to a full queue since the last subscribe.
    pub fn overflow_count(&self) -> u64 {
        self.data().queue().overflow_count()
    }

    /// Request a subscription. Sends SUB through discovery and moves to
    /// SUBSCRIBE_REQUESTED; delivery starts once the broker acknowledges.
    pub fn subscribe(&mut self, opts: SubscriptionOptions) -> AxonResult<()> {
        self.ensure_live()?;
        self.process_discovery();
        let data = self.data();
        if data.state() != SubscriptionState::NotSubscribed {
            return Err(AxonError::InvalidPortState(
                "subscribe requires NOT_SUBSCRIBED",
            ));
        }
        if opts.queue_capacity == 0 || opts.queue_capacity > MAX_QUEUE_CAPACITY {
            return Err(AxonError::config(format!(
                "queue capacity must be 1..={MAX_QUEUE_CAPACITY}"
            )));
        }
        // Release anything a straggling publisher pushed since the last
        // teardown, then rebuild the queue for this subscription.
        self.drain_queue();
        data.queue().reset(opts.queue_capacity, opts.policy);
        data.history_request
            .store(opts.history_request, Ordering::Relaxed);
        data.rejected.store(0, Ordering::Relaxed);
        data.set_state(SubscriptionState::SubscribeRequested);
        let sent = data.outbox.push(CaproMessage::sub(
            data.service(),
            self.location,
            opts.history_request,
        ));
        self.wake_broker();
        if !sent {
            // State stays SUBSCRIBE_REQUESTED; the broker resyncs it from
            // the port once it sees the ring's drop counter.
            return Err(AxonError::DiscoveryChannelOverflow(
                "subscriber outbox".to_string(),
            ));
        }
        Ok(())
    }

    /// Request an unsubscribe. Legal only while SUBSCRIBED.
    pub fn unsubscribe(&mut self) -> AxonResult<()> {
        self.ensure_live()?;
        self.process_discovery();
        let data = self.data();
        match data.state() {
            SubscriptionState::Subscribed => {
                data.set_state(SubscriptionState::UnsubscribeRequested);
                let sent = data
                    .outbox
                    .push(CaproMessage::unsub(data.service(), self.location));
                self.wake_broker();
                if !sent {
                    return Err(AxonError::DiscoveryChannelOverflow(
                        "subscriber outbox".to_string(),
                    ));
                }
                Ok(())
            }
            _ => Err(AxonError::PortNotSubscribed),
        }
    }

    /// Whether the broker rejected the last subscription request. Reading
    /// clears the flag.
    pub fn take_rejection(&mut self) -> bool {
        self.process_discovery();
        self.data().rejected.swap(0, Ordering::AcqRel) != 0
    }

    /// Pop the next sample, transferring its reference to the caller.
    /// Never blocks; `None` means the queue is empty.
    pub fn try_get_chunk(&mut self) -> Option<Chunk> {
        self.process_discovery();
        self.pop_resolved()
    }

    /// Whether a sample is waiting.
    pub fn has_data(&self) -> bool {
        !self.data().queue().is_empty()
    }

    /// Drop one reference on a previously popped chunk.
    pub fn release(&self, chunk: Chunk) {
        self.map.release_chunk(chunk);
    }

    /// Apply pending broker messages to the state machine.
    pub fn process_discovery(&mut self) {
        while let Some(msg) = self.data().inbox.pop() {
            let Some(kind) = msg.kind() else {
                log::warn!("subscriber {:?}: corrupt discovery message", self.service());
                continue;
            };
            let data = self.data();
            match (kind, data.state()) {
                (CaproKind::AckSub, SubscriptionState::SubscribeRequested) => {
                    data.set_state(SubscriptionState::Subscribed);
                }
                (CaproKind::AckSub, _) => {
                    // Additional publishers matched an existing subscription.
                }
                (CaproKind::NackSub, SubscriptionState::SubscribeRequested) => {
                    data.rejected.store(1, Ordering::Release);
                    data.set_state(SubscriptionState::NotSubscribed);
                    log::warn!("subscription rejected for {:?}", self.service());
                }
                (CaproKind::AckUnsub, SubscriptionState::UnsubscribeRequested) => {
                    data.set_state(SubscriptionState::NotSubscribed);
                    self.drain_queue();
                }
                (CaproKind::StopOffer, _) => {
                    // Synthetic disconnect: a bound publisher is gone.
                    data.set_state(SubscriptionState::NotSubscribed);
                    self.drain_queue();
                }
                (k, s) => {
                    log::debug!("subscriber ignoring {k:?} in state {s:?}");
                }
            }
        }
        if self.data().inbox.take_dropped() > 0 {
            // The broker also sees its outbox drops and resyncs from port
            // state, but losing inbox messages can strand the state machine;
            // surface loudly.
            log::warn!(
                "subscriber {:?}: discovery inbox overflowed",
                self.service()
            );
        }
    }

    fn pop_resolved(&self) -> Option<Chunk> {
        let encoded = self.data().queue().pop()?;
        let Some(location) = OffsetPtr::decode(encoded) else {
            fatal_invariant("null chunk reference in delivery queue");
        };
        match self.map.resolve_chunk(location) {
            Ok(chunk) => Some(chunk),
            Err(_) => fatal_invariant("delivery queue reference outside mapped segments"),
        }
    }

    /// Pop-and-release everything (teardown path).
    fn drain_queue(&self) {
        while let Some(chunk) = self.pop_resolved() {
            self.map.release_chunk(chunk);
        }
    }

    fn wake_broker(&self) {
        // SAFETY: the broker notifier lives in the management segment, which
        // outlives every port handle bound to it.
        unsafe { self.broker_notifier.as_ref() }.arm(0);
    }
}

impl Drop for SubscriberPort {
    fn drop(&mut self) {
        if self.ensure_live().is_err() {
            // Reaped (and possibly reissued) by the broker; not ours.
            return;
        }
        let data = self.data();
        match data.state() {
            SubscriptionState::Subscribed | SubscriptionState::SubscribeRequested => {
                data.outbox
                    .push(CaproMessage::unsub(data.service(), self.location));
            }
            _ => {}
        }
        self.drain_queue();
        data.clear_notifier();
        // The broker reclaims the block (registry cleanup, then FREE).
        data.alloc_state.store(PORT_ZOMBIE, Ordering::Release);
        self.wake_broker();
    }
}
