//! The shared signaling primitive: a counting semaphore plus an atomic
//! bitset.
//!
//! Producers call [`Notifier::arm`] with a trigger index: the bit is set
//! and, only when it was clear, the semaphore is posted once. A waiter calls
//! [`Notifier::wait_until`], which atomically swaps the bitset out — the
//! swapped bits are the fired indices. The contract is *no lost wakeups*: a
//! bit set at any moment after the last swap makes a subsequent wait return
//! without blocking.
//!
//! Destruction sets a terminal bit and posts; waiters see [`Wake::Closed`]
//! immediately, on this and every later wait (the bit is sticky).

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Instant;

use crate::waitset::semaphore::ShmSemaphore;

/// Usable trigger indices are `0..MAX_TRIGGERS`; bit 63 is the terminal bit.
pub const MAX_TRIGGERS: u32 = 63;

const CLOSED_BIT: u64 = 1 << 63;

/// Slot states for notifier allocation in the management segment.
pub(crate) const NOTIFIER_FREE: u32 = 0;
pub(crate) const NOTIFIER_ACTIVE: u32 = 1;

/// Outcome of one wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wake {
    /// At least one trigger fired; the payload is the swapped-out bitset.
    Fired(FiredTriggers),
    /// The deadline passed with no trigger.
    TimedOut,
    /// The notifier was destroyed.
    Closed,
}

/// The fired indices of one wake, iterable as trigger ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FiredTriggers(u64);

impl FiredTriggers {
    pub(crate) fn from_bits(bits: u64) -> Self {
        Self(bits)
    }

    pub fn contains(&self, index: u32) -> bool {
        index < MAX_TRIGGERS && self.0 & (1 << index) != 0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = u32> + '_ {
        let bits = self.0;
        (0..MAX_TRIGGERS).filter(move |i| bits & (1 << i) != 0)
    }
}

/// Shm-resident notifier block.
#[repr(C)]
pub struct Notifier {
    /// Slot allocation state (management-segment bookkeeping).
    pub(crate) slot_state: AtomicU32,
    _pad: u32,
    bits: AtomicU64,
    sem: ShmSemaphore,
}

impl Notifier {
    /// Initialize in place at broker bring-up.
    ///
    /// # Safety
    /// Exactly once, on zeroed shared memory, before the segment is visible.
    pub(crate) unsafe fn init(&self) {
        self.slot_state.store(NOTIFIER_FREE, Ordering::Relaxed);
        self.bits.store(0, Ordering::Relaxed);
        self.sem.init();
    }

    /// Set trigger bit `index`; post the semaphore only on the clear→set
    /// transition, so rapid re-arms cost one atomic OR each.
    pub fn arm(&self, index: u32) {
        debug_assert!(index < MAX_TRIGGERS);
        let bit = 1u64 << index;
        let prev = self.bits.fetch_or(bit, Ordering::AcqRel);
        if prev & bit == 0 {
            self.sem.post();
        }
    }

    /// Destroy: set the terminal bit and wake the waiter. The bit is sticky,
    /// so every subsequent wait also returns [`Wake::Closed`].
    pub fn close(&self) {
        let prev = self.bits.fetch_or(CLOSED_BIT, Ordering::AcqRel);
        if prev & CLOSED_BIT == 0 {
            self.sem.post();
        }
    }

    /// Whether the terminal bit is set.
    pub fn is_closed(&self) -> bool {
        self.bits.load(Ordering::Acquire) & CLOSED_BIT != 0
    }

    /// Wait for any trigger, an absolute deadline, or destruction.
    ///
    /// Swaps the bitset out on wake; callers own the returned indices.
    /// Semaphore posts in excess of bit transitions (benign races) surface
    /// as internal spurious wakes and are retried here, never returned.
    pub fn wait_until(&self, deadline: Option<Instant>) -> Wake {
        loop {
            let bits = self.bits.swap(0, Ordering::AcqRel);
            if bits & CLOSED_BIT != 0 {
                // Keep the terminal bit observable forever.
                self.bits.fetch_or(CLOSED_BIT, Ordering::AcqRel);
                return Wake::Closed;
            }
            if bits != 0 {
                return Wake::Fired(FiredTriggers(bits));
            }
            if !self.sem.wait_until(deadline) {
                return Wake::TimedOut;
            }
        }
    }

    /// Non-blocking variant of the swap: take whatever has fired so far.
    pub fn poll(&self) -> Wake {
        let bits = self.bits.swap(0, Ordering::AcqRel);
        if bits & CLOSED_BIT != 0 {
            self.bits.fetch_or(CLOSED_BIT, Ordering::AcqRel);
            return Wake::Closed;
        }
        if bits != 0 {
            return Wake::Fired(FiredTriggers(bits));
        }
        Wake::TimedOut
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    fn make() -> Arc<Box<Notifier>> {
        // SAFETY: zeroed is the documented pre-init state; init follows.
        let n: Box<Notifier> = unsafe { Box::new(std::mem::zeroed()) };
        unsafe { n.init() };
        Arc::new(n)
    }

    #[test]
    fn arm_then_wait_fires() {
        let n = make();
        n.arm(3);
        match n.wait_until(Some(Instant::now() + Duration::from_millis(100))) {
            Wake::Fired(fired) => {
                assert!(fired.contains(3));
                assert_eq!(fired.iter().collect::<Vec<_>>(), vec![3]);
            }
            other => panic!("expected fired, got {other:?}"),
        }
    }

    #[test]
    fn wait_without_arm_times_out() {
        let n = make();
        assert_eq!(
            n.wait_until(Some(Instant::now() + Duration::from_millis(30))),
            Wake::TimedOut
        );
    }

    #[test]
    fn multiple_arms_one_wake() {
        let n = make();
        n.arm(1);
        n.arm(5);
        n.arm(1); // re-arm of a set bit: no extra post
        match n.wait_until(None) {
            Wake::Fired(fired) => {
                assert_eq!(fired.iter().collect::<Vec<_>>(), vec![1, 5]);
            }
            other => panic!("expected fired, got {other:?}"),
        }
        // The duplicate arm(1) left one extra semaphore count at most zero:
        // a second wait must time out, not spuriously fire.
        assert_eq!(
            n.wait_until(Some(Instant::now() + Duration::from_millis(30))),
            Wake::TimedOut
        );
    }

    #[test]
    fn arm_from_thread_wakes_parked_waiter() {
        let n = make();
        let waiter = {
            let n = Arc::clone(&n);
            std::thread::spawn(move || n.wait_until(Some(Instant::now() + Duration::from_secs(5))))
        };
        std::thread::sleep(Duration::from_millis(20));
        n.arm(0);
        match waiter.join().unwrap() {
            Wake::Fired(f) => assert!(f.contains(0)),
            other => panic!("expected fired, got {other:?}"),
        }
    }

    #[test]
    fn close_is_sticky() {
        let n = make();
        n.arm(2);
        n.close();
        assert_eq!(n.wait_until(None), Wake::Closed);
        assert_eq!(
            n.wait_until(Some(Instant::now() + Duration::from_millis(10))),
            Wake::Closed,
            "terminal bit persists across waits"
        );
    }
}
