//! WaitSet: block one thread on many event sources.
//!
//! A waitset owns one shm [`Notifier`] slot and a table of triggers. Each
//! trigger binds a subscriber port (or a user event source) to an index;
//! producers arm the notifier when they make the source ready, and
//! [`WaitSet::wait`] parks on the shared semaphore until any index fires,
//! the deadline passes, or the notifier is destroyed (e.g. broker
//! shutdown).
//!
//! Triggering is *level-corrected edge*: the wait swaps the bitset out, then
//! re-checks each fired subscriber source — if it still has data, its bit is
//! re-set and the semaphore re-posted before returning. An immediate second
//! wait with a non-empty queue therefore fires again; no wakeup is ever
//! lost in either direction.

use std::ptr::NonNull;
use std::sync::Arc;
use std::time::Instant;

use crate::error::{AxonError, AxonResult};
use crate::memory::offset_ptr::OffsetPtr;
use crate::memory::segment::SegmentMap;
use crate::port::subscriber::{SubscriberPort, SubscriberPortData};
use crate::waitset::notifier::{FiredTriggers, Notifier, Wake, MAX_TRIGGERS, NOTIFIER_FREE};

#[derive(Clone, Copy, PartialEq, Eq)]
enum TriggerKind {
    Empty,
    /// Bound subscriber port (location of its control block).
    Subscriber(OffsetPtr),
    /// User event source; armed manually through a [`UserTrigger`].
    User,
}

/// A waitset bound to one notifier slot in the management segment.
///
/// Exclusively owned by the waiting thread's process; producers interact
/// only with the underlying notifier.
pub struct WaitSet {
    map: Arc<SegmentMap>,
    notifier: NonNull<Notifier>,
    notifier_loc: OffsetPtr,
    triggers: [TriggerKind; MAX_TRIGGERS as usize],
}

// SAFETY: the notifier lives in the management segment for the segment's
// lifetime; the waitset value is used from one thread at a time.
unsafe impl Send for WaitSet {}

impl WaitSet {
    /// Bind to a claimed notifier slot.
    ///
    /// # Safety
    /// `notifier` must be the claimed, initialized block at `notifier_loc`
    /// in `map`'s management segment.
    pub(crate) unsafe fn from_parts(
        map: Arc<SegmentMap>,
        notifier: NonNull<Notifier>,
        notifier_loc: OffsetPtr,
    ) -> Self {
        Self {
            map,
            notifier,
            notifier_loc,
            triggers: [TriggerKind::Empty; MAX_TRIGGERS as usize],
        }
    }

    fn notifier(&self) -> &Notifier {
        // SAFETY: from_parts guarantees a live mapped notifier.
        unsafe { self.notifier.as_ref() }
    }

    /// Bind a subscriber port to trigger `index`. Publishers delivering to
    /// that port will arm the index on every push into an armed-empty queue.
    pub fn attach_subscriber(&mut self, sub: &SubscriberPort, index: u32) -> AxonResult<()> {
        self.claim_index(index)?;
        sub.data().bind_notifier(self.notifier_loc, index);
        self.triggers[index as usize] = TriggerKind::Subscriber(sub.location());
        // The subscription may already hold data; don't lose that edge.
        if sub.has_data() {
            self.notifier().arm(index);
        }
        Ok(())
    }

    /// Create a user event source on trigger `index`.
    pub fn user_trigger(&mut self, index: u32) -> AxonResult<UserTrigger> {
        self.claim_index(index)?;
        self.triggers[index as usize] = TriggerKind::User;
        Ok(UserTrigger {
            map: Arc::clone(&self.map),
            notifier_loc: self.notifier_loc,
            index,
        })
    }

    fn claim_index(&self, index: u32) -> AxonResult<()> {
        if index >= MAX_TRIGGERS {
            return Err(AxonError::config(format!(
                "trigger index must be < {MAX_TRIGGERS}"
            )));
        }
        if self.triggers[index as usize] != TriggerKind::Empty {
            return Err(AxonError::InvalidPortState("trigger index already bound"));
        }
        Ok(())
    }

    /// Unbind trigger `index`.
    pub fn detach(&mut self, index: u32) {
        if index >= MAX_TRIGGERS {
            return;
        }
        if let TriggerKind::Subscriber(loc) = self.triggers[index as usize] {
            if let Some(sub) = self.resolve_subscriber(loc) {
                sub.clear_notifier();
            }
        }
        self.triggers[index as usize] = TriggerKind::Empty;
    }

    /// Park until any trigger fires, `deadline` passes (`Wake::TimedOut`),
    /// or the notifier is destroyed (`Wake::Closed`).
    ///
    /// A subscriber index is reported fired only while its queue actually
    /// holds data, and it is re-armed before returning so the bit stays set
    /// until the queue is fully drained — an immediate second wait fires
    /// again, and a wait after draining does not. Producer arms whose data
    /// was consumed in between surface as internal spurious wakes and are
    /// absorbed by looping on the same deadline.
    pub fn wait(&self, deadline: Option<Instant>) -> Wake {
        loop {
            let wake = self.notifier().wait_until(deadline);
            let Wake::Fired(fired) = wake else {
                return wake;
            };
            let mut live = 0u64;
            for index in fired.iter() {
                match self.triggers[index as usize] {
                    TriggerKind::Subscriber(loc) => {
                        if self
                            .resolve_subscriber(loc)
                            .is_some_and(|sub| !sub.queue().is_empty())
                        {
                            live |= 1 << index;
                            // Keep the bit set until drained.
                            self.notifier().arm(index);
                        }
                    }
                    // User triggers are pure edges; report every firing.
                    TriggerKind::User => live |= 1 << index,
                    TriggerKind::Empty => {}
                }
            }
            if live != 0 {
                return Wake::Fired(FiredTriggers::from_bits(live));
            }
            // Everything fired was already drained; park again.
        }
    }

    fn resolve_subscriber(&self, loc: OffsetPtr) -> Option<&SubscriberPortData> {
        let raw = self.map.ptr(loc).ok()?;
        // SAFETY: subscriber control blocks stay mapped for the management
        // segment's lifetime.
        Some(unsafe { &*(raw as *const SubscriberPortData) })
    }
}

impl Drop for WaitSet {
    fn drop(&mut self) {
        for index in 0..MAX_TRIGGERS {
            self.detach(index);
        }
        // Release the notifier slot for reuse.
        self.notifier()
            .slot_state
            .store(NOTIFIER_FREE, std::sync::atomic::Ordering::Release);
    }
}

/// Handle for firing a user trigger from any thread or process that maps
/// the management segment.
pub struct UserTrigger {
    map: Arc<SegmentMap>,
    notifier_loc: OffsetPtr,
    index: u32,
}

impl UserTrigger {
    /// Arm the bound index: the waiting thread wakes with this index fired.
    pub fn trigger(&self) {
        let Ok(raw) = self.map.ptr(self.notifier_loc) else {
            return;
        };
        // SAFETY: notifier blocks live in the management segment.
        let notifier = unsafe { &*(raw as *const Notifier) };
        notifier.arm(self.index);
    }

    pub fn index(&self) -> u32 {
        self.index
    }
}
