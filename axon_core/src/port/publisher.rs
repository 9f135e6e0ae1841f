//! Publisher ports: loaning, publishing, fan-out, history replay.
//!
//! The connection list and history cache are owned by the publishing
//! process: the broker never touches them. Wiring requests (SUB/UNSUB
//! decided by the broker's matching) arrive on the port's inbox ring and
//! are applied by [`PublisherPort::update_connections`] — called at the top
//! of every `publish`, so steady-state wiring needs no extra calls. A
//! late-joining subscriber's history replay happens right when its
//! connection is applied, before any newer sample is delivered to it.

use std::cell::UnsafeCell;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use crate::discovery::capro::{CaproKind, CaproMessage};
use crate::discovery::channel::CaproRing;
use crate::discovery::service::ServiceDescriptor;
use crate::error::{fatal_invariant, AxonError, AxonResult, LoanError};
use crate::memory::chunk::Chunk;
use crate::memory::offset_ptr::{OffsetPtr, ENCODED_NULL};
use crate::memory::segment::SegmentMap;
use crate::port::history::{HistoryCache, MAX_HISTORY_DEPTH};
use crate::port::subscriber::SubscriberPortData;
use crate::port::{unique_port_id, PORT_ACTIVE, PORT_ZOMBIE};
use crate::waitset::notifier::Notifier;

/// Bounded connection list per publisher.
pub const MAX_SUBSCRIBERS_PER_PUBLISHER: usize = 16;

/// Options for publisher construction.
#[derive(Debug, Clone, Copy)]
pub struct PublisherOptions {
    /// Samples retained for late-joiner replay (≤ [`MAX_HISTORY_DEPTH`]).
    pub history_capacity: u32,
}

impl Default for PublisherOptions {
    fn default() -> Self {
        Self {
            history_capacity: 0,
        }
    }
}

/// The shm control block of a publisher port.
#[repr(C)]
pub struct PublisherPortData {
    pub(crate) alloc_state: AtomicU32,
    offering: AtomicU32,
    port_id: AtomicU64,
    pub(crate) owner_pid: AtomicU64,
    service: UnsafeCell<ServiceDescriptor>,
    next_sequence: AtomicU64,
    pub(crate) history: HistoryCache,
    /// Encoded subscriber-port locations; ENCODED_NULL marks a free slot.
    /// Owner-written, so plain atomic stores suffice.
    connections: [AtomicU64; MAX_SUBSCRIBERS_PER_PUBLISHER],
    pub(crate) outbox: CaproRing,
    pub(crate) inbox: CaproRing,
}

// SAFETY: the UnsafeCell'd service descriptor is written during claim (before
// the block is ACTIVE) and read-only afterwards; everything else is atomic.
unsafe impl Sync for PublisherPortData {}

impl PublisherPortData {
    /// Claim-time initialization, before the block becomes visible.
    pub(crate) fn init(&self, service: ServiceDescriptor, history_capacity: u32) {
        // SAFETY: claim holds exclusive access until alloc_state goes ACTIVE.
        unsafe { *self.service.get() = service };
        self.offering.store(0, Ordering::Relaxed);
        self.port_id.store(unique_port_id(), Ordering::Relaxed);
        self.owner_pid
            .store(std::process::id() as u64, Ordering::Relaxed);
        self.next_sequence.store(0, Ordering::Relaxed);
        self.history.reset(history_capacity.min(MAX_HISTORY_DEPTH));
        for c in &self.connections {
            c.store(ENCODED_NULL, Ordering::Relaxed);
        }
        self.outbox.reset();
        self.inbox.reset();
    }

    pub fn service(&self) -> ServiceDescriptor {
        // SAFETY: written before ACTIVE, immutable afterwards.
        unsafe { *self.service.get() }
    }

    pub fn port_id(&self) -> u64 {
        self.port_id.load(Ordering::Relaxed)
    }

    pub fn is_offering(&self) -> bool {
        self.offering.load(Ordering::Acquire) != 0
    }

    pub(crate) fn connection_count(&self) -> usize {
        self.connections
            .iter()
            .filter(|c| c.load(Ordering::Relaxed) != ENCODED_NULL)
            .count()
    }
}

/// Process-local handle to a publisher port.
pub struct PublisherPort {
    map: Arc<SegmentMap>,
    data: NonNull<PublisherPortData>,
    location: OffsetPtr,
    /// Id read at claim time; a mismatch means the broker reaped this block
    /// (e.g. our keepalive stalled) and possibly handed it to someone else.
    port_id: u64,
    broker_notifier: NonNull<Notifier>,
}

// SAFETY: the handle can move between threads; the control block is
// shm-resident and atomic-coordinated. Not Clone — the connection list and
// history are single-writer by construction.
unsafe impl Send for PublisherPort {}

impl PublisherPort {
    /// Bind a handle to a claimed control block.
    ///
    /// # Safety
    /// `data` must be the claimed block at `location` in `map`'s management
    /// segment; `broker_notifier` must outlive the handle.
    pub(crate) unsafe fn from_parts(
        map: Arc<SegmentMap>,
        data: NonNull<PublisherPortData>,
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
    pub(crate) fn data(&self) -> &PublisherPortData {
        // SAFETY: from_parts guarantees a live mapped block.
        unsafe { self.data.as_ref() }
    }

    #[inline]
    pub fn location(&self) -> OffsetPtr {
        self.location
    }

    pub fn service(&self) -> ServiceDescriptor {
        self.data().service()
    }

    /// Id stamped into every chunk this port publishes.
    pub fn id(&self) -> u64 {
        self.data().port_id()
    }

    /// Announce the service. Matching subscribers get wired by the broker.
    ///
    /// On discovery-ring overflow the offering flag is already set and the
    /// broker resynchronizes from it; the condition is still surfaced.
    pub fn offer(&mut self) -> AxonResult<()> {
        self.ensure_live()?;
        let data = self.data();
        if data.offering.swap(1, Ordering::AcqRel) == 0 {
            let sent = data.outbox.push(CaproMessage::offer(data.service()));
            self.wake_broker();
            if !sent {
                return Err(AxonError::DiscoveryChannelOverflow(
                    "publisher outbox".to_string(),
                ));
            }
        }
        Ok(())
    }

    /// Withdraw the service. Bound subscribers receive a synthetic
    /// disconnect through discovery; already-delivered chunks stay valid.
    pub fn stop_offer(&mut self) -> AxonResult<()> {
        self.ensure_live()?;
        let data = self.data();
        if data.offering.swap(0, Ordering::AcqRel) != 0 {
            let sent = data.outbox.push(CaproMessage::stop_offer(data.service()));
            self.wake_broker();
            self.update_connections();
            if !sent {
                return Err(AxonError::DiscoveryChannelOverflow(
                    "publisher outbox".to_string(),
                ));
            }
        }
        Ok(())
    }

    pub fn is_offering(&self) -> bool {
        self.data().is_offering()
    }

    /// Whether at least one subscriber is currently wired.
    pub fn has_subscribers(&mut self) -> bool {
        self.update_connections();
        self.data().connection_count() > 0
    }

    /// Loan a chunk for a payload of `size` bytes: smallest-fitting pool,
    /// publisher id stamped. The caller writes the payload in place and
    /// either publishes or releases the loan.
    pub fn loan(&self, size: u32) -> Result<Chunk, LoanError> {
        self.loan_with_user_header(size, 0)
    }

    /// Loan with an additional user header of `user_header_size` bytes
    /// between the chunk header and the payload.
    pub fn loan_with_user_header(
        &self,
        size: u32,
        user_header_size: u32,
    ) -> Result<Chunk, LoanError> {
        let chunk = self.map.loan(size, user_header_size)?;
        chunk.header().set_publisher_id(self.data().port_id());
        Ok(chunk)
    }

    /// Return a cancelled loan without publishing.
    pub fn release(&self, chunk: Chunk) {
        self.map.release_chunk(chunk);
    }

    /// Publish a loaned chunk: stamp the sequence number, install into the
    /// history cache, then fan out to every wired subscriber in connection
    /// order. A full queue applies that subscriber's overflow policy and
    /// never unwinds other deliveries.
    pub fn publish(&mut self, chunk: Chunk) {
        self.update_connections();
        let data = self.data();

        let seq = data.next_sequence.fetch_add(1, Ordering::Relaxed) + 1;
        chunk.header().set_sequence(seq);

        let encoded = chunk.location().encode();

        // History holds its own reference.
        if data.history.capacity() > 0 {
            chunk.header().retain();
            if let Some(evicted) = data.history.push(encoded) {
                self.release_encoded(evicted);
            }
        }

        for slot in &data.connections {
            let raw = slot.load(Ordering::Relaxed);
            let Some(sub_loc) = OffsetPtr::decode(raw) else {
                continue;
            };
            self.deliver(sub_loc, &chunk);
        }

        // The loan reference itself.
        self.map.release_chunk(chunk);
    }

    /// Apply pending wiring messages from the broker: SUB wires a
    /// subscriber (with history replay), UNSUB unwires it.
    pub fn update_connections(&mut self) {
        while let Some(msg) = self.data().inbox.pop() {
            let Some(kind) = msg.kind() else {
                log::warn!("publisher {:?}: corrupt discovery message", self.service());
                continue;
            };
            match kind {
                CaproKind::Sub => self.wire(msg.port, msg.history_request),
                CaproKind::Unsub => self.unwire(msg.port),
                k => log::debug!("publisher ignoring {k:?}"),
            }
        }
        if self.data().inbox.take_dropped() > 0 {
            log::warn!("publisher {:?}: discovery inbox overflowed", self.service());
        }
    }

    fn wire(&self, sub_loc: OffsetPtr, history_request: u32) {
        let data = self.data();
        let encoded = sub_loc.encode();
        if data
            .connections
            .iter()
            .any(|c| c.load(Ordering::Relaxed) == encoded)
        {
            return; // resync duplicate
        }
        let Some(slot) = data
            .connections
            .iter()
            .find(|c| c.load(Ordering::Relaxed) == ENCODED_NULL)
        else {
            // The broker bounds fan-out with NACK_SUB; hitting this means a
            // resync raced a full list. Drop the wiring request.
            log::warn!(
                "publisher {:?}: connection list full, dropping subscriber",
                self.service()
            );
            return;
        };

        // Replay history before the first live publish reaches this
        // subscriber, oldest to newest, honoring its overflow policy.
        if history_request > 0 {
            let mut delivered = false;
            data.history.for_latest(history_request, |entry| {
                if self.deliver_encoded(sub_loc, entry) {
                    delivered = true;
                }
            });
            if delivered {
                self.notify(sub_loc);
            }
        }

        slot.store(encoded, Ordering::Release);
    }

    fn unwire(&self, sub_loc: OffsetPtr) {
        let encoded = sub_loc.encode();
        for slot in &self.data().connections {
            if slot.load(Ordering::Relaxed) == encoded {
                slot.store(ENCODED_NULL, Ordering::Release);
            }
        }
    }

    /// Deliver one chunk to one subscriber queue (live publish path).
    fn deliver(&self, sub_loc: OffsetPtr, chunk: &Chunk) {
        if self.deliver_encoded(sub_loc, chunk.location().encode()) {
            self.notify(sub_loc);
        }
    }

    /// Push an encoded reference into the subscriber's queue with a fresh
    /// reference. Returns whether the queue accepted it.
    fn deliver_encoded(&self, sub_loc: OffsetPtr, encoded: u64) -> bool {
        let Some(sub) = self.resolve_subscriber(sub_loc) else {
            return false;
        };
        if !sub.accepts_deliveries() {
            return false;
        }
        let Some(location) = OffsetPtr::decode(encoded) else {
            return false;
        };
        let Ok(chunk) = self.map.resolve_chunk(location) else {
            fatal_invariant("publishing a chunk outside mapped segments");
        };
        chunk.header().retain();
        let pushed = sub.queue().push(encoded, |evicted| {
            self.release_encoded(evicted);
        });
        if !pushed {
            // DISCARD_NEW full: take the delivery reference back.
            self.map.release_chunk(chunk);
            return false;
        }
        // On success the reference lives in the queue now.
        true
    }

    fn notify(&self, sub_loc: OffsetPtr) {
        let Some(sub) = self.resolve_subscriber(sub_loc) else {
            return;
        };
        let Some((notifier_loc, index)) = sub.notifier_binding() else {
            return;
        };
        let Ok(raw) = self.map.ptr(notifier_loc) else {
            return;
        };
        // SAFETY: notifier blocks live in the management segment for its
        // whole lifetime; a stale binding at worst wakes a waiter spuriously.
        let notifier = unsafe { &*(raw as *const Notifier) };
        notifier.arm(index);
    }

    fn resolve_subscriber(&self, sub_loc: OffsetPtr) -> Option<&SubscriberPortData> {
        let raw = self.map.ptr(sub_loc).ok()?;
        // SAFETY: subscriber control blocks stay mapped for the management
        // segment's lifetime; liveness is checked via accepts_deliveries.
        Some(unsafe { &*(raw as *const SubscriberPortData) })
    }

    fn release_encoded(&self, encoded: u64) {
        let Some(location) = OffsetPtr::decode(encoded) else {
            return;
        };
        match self.map.resolve_chunk(location) {
            Ok(chunk) => self.map.release_chunk(chunk),
            Err(_) => fatal_invariant("releasing a chunk outside mapped segments"),
        }
    }

    fn wake_broker(&self) {
        // SAFETY: the broker notifier lives in the management segment, which
        // outlives every port handle bound to it.
        unsafe { self.broker_notifier.as_ref() }.arm(0);
    }
}

impl Drop for PublisherPort {
    fn drop(&mut self) {
        if self.ensure_live().is_err() {
            // The broker already reaped this block (and may have reissued
            // it); nothing here belongs to us anymore.
            return;
        }
        let data = self.data();
        if data.offering.swap(0, Ordering::AcqRel) != 0 {
            data.outbox.push(CaproMessage::stop_offer(data.service()));
        }
        // Drop the history's references; queued deliveries stay valid on
        // their own references.
        data.history.drain(|entry| self.release_encoded(entry));
        data.alloc_state.store(PORT_ZOMBIE, Ordering::Release);
        self.wake_broker();
    }
}
