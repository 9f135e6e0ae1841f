//! Bounded lock-free delivery queues of chunk references.
//!
//! Every subscriber port owns one [`ChunkQueue`] in shared memory. Producers
//! are the connected publishers (possibly several processes), the consumer
//! is the owning subscriber — but under `DROP_OLDEST` a full push *evicts*
//! the head, which makes producers occasional consumers too. The queue is
//! therefore sequence-coordinated on both ends (Vyukov-style): each slot
//! carries a sequence word that says exactly which ring pass may write or
//! read it, and both head and tail advance by CAS.
//!
//! Values are [`OffsetPtr::encode`]d chunk references, so a push is a single
//! u64 publish and the pop side re-binds the reference against the local
//! segment map.
//!
//! [`OffsetPtr::encode`]: crate::memory::OffsetPtr::encode

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// Hard cap on the slot array; the live capacity is chosen at subscribe
/// time and rounded up to a power of two.
pub const MAX_QUEUE_CAPACITY: u32 = 256;

/// What a full queue does with an incoming reference.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OverflowPolicy {
    /// Drop the incoming sample and bump the overflow counter.
    #[default]
    DiscardNew = 0,
    /// Evict the oldest queued sample (releasing its reference), then push.
    DropOldest = 1,
}

impl OverflowPolicy {
    pub(crate) fn from_u32(v: u32) -> Self {
        match v {
            1 => OverflowPolicy::DropOldest,
            _ => OverflowPolicy::DiscardNew,
        }
    }
}

#[repr(C)]
struct QueueSlot {
    sequence: AtomicU64,
    value: AtomicU64,
}

/// The shared-memory queue structure. Lives embedded in a subscriber port
/// control block; never constructed on the heap.
#[repr(C)]
pub struct ChunkQueue {
    head: AtomicU64,
    tail: AtomicU64,
    /// Live capacity (power of two, ≤ MAX_QUEUE_CAPACITY).
    capacity: AtomicU32,
    policy: AtomicU32,
    /// Samples lost to a full queue (drops and evictions both count).
    overflow: AtomicU64,
    slots: [QueueSlot; MAX_QUEUE_CAPACITY as usize],
}

impl ChunkQueue {
    /// Round a requested capacity to the implemented one.
    pub fn effective_capacity(requested: u32) -> u32 {
        requested
            .max(1)
            .next_power_of_two()
            .min(MAX_QUEUE_CAPACITY)
    }

    /// Reset for a fresh subscription. Only called while no producer is
    /// connected (the port is not yet wired, or fully unwired).
    pub(crate) fn reset(&self, requested_capacity: u32, policy: OverflowPolicy) {
        let cap = Self::effective_capacity(requested_capacity);
        for (i, slot) in self.slots.iter().enumerate().take(cap as usize) {
            slot.sequence.store(i as u64, Ordering::Relaxed);
            slot.value.store(0, Ordering::Relaxed);
        }
        self.capacity.store(cap, Ordering::Relaxed);
        self.policy.store(policy as u32, Ordering::Relaxed);
        self.overflow.store(0, Ordering::Relaxed);
        self.head.store(0, Ordering::Relaxed);
        self.tail.store(0, Ordering::Release);
    }

    #[inline]
    pub fn capacity(&self) -> u32 {
        self.capacity.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn policy(&self) -> OverflowPolicy {
        OverflowPolicy::from_u32(self.policy.load(Ordering::Relaxed))
    }

    /// Samples lost to overflow since the last reset.
    #[inline]
    pub fn overflow_count(&self) -> u64 {
        self.overflow.load(Ordering::Acquire)
    }

    /// Queued sample count (approximate under concurrency).
    #[inline]
    pub fn len(&self) -> u64 {
        let head = self.head.load(Ordering::Acquire);
        let tail = self.tail.load(Ordering::Acquire);
        head.saturating_sub(tail)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Push an encoded chunk reference.
    ///
    /// Returns `true` if the reference was enqueued (the queue now owns it).
    /// Returns `false` if it was dropped (`DISCARD_NEW` full) — the caller
    /// keeps ownership and must release.
    ///
    /// Under `DROP_OLDEST`, every evicted reference is handed to `on_evict`;
    /// the caller releases those. Evictions bump the overflow counter, as
    /// do drops.
    pub fn push(&self, value: u64, mut on_evict: impl FnMut(u64)) -> bool {
        let cap = self.capacity.load(Ordering::Relaxed) as u64;
        let mask = cap - 1;
        loop {
            let pos = self.head.load(Ordering::Relaxed);
            let slot = &self.slots[(pos & mask) as usize];
            let seq = slot.sequence.load(Ordering::Acquire);

            if seq == pos {
                // Slot free for this pass — claim it.
                if self
                    .head
                    .compare_exchange_weak(pos, pos + 1, Ordering::Relaxed, Ordering::Relaxed)
                    .is_ok()
                {
                    slot.value.store(value, Ordering::Relaxed);
                    slot.sequence.store(pos + 1, Ordering::Release);
                    return true;
                }
            } else if seq < pos {
                // A full ring pass behind us: the queue is full.
                match self.policy() {
                    OverflowPolicy::DiscardNew => {
                        self.overflow.fetch_add(1, Ordering::AcqRel);
                        return false;
                    }
                    OverflowPolicy::DropOldest => {
                        if let Some(evicted) = self.pop() {
                            self.overflow.fetch_add(1, Ordering::AcqRel);
                            on_evict(evicted);
                        }
                        // Either we freed a slot or the consumer did; retry.
                    }
                }
            }
            // seq > pos: another producer claimed this slot and is writing,
            // or the consumer is mid-release. Retry.
            std::hint::spin_loop();
        }
    }

    /// Pop the oldest reference, transferring its ownership to the caller.
    /// Never blocks; `None` means empty.
    pub fn pop(&self) -> Option<u64> {
        let cap = self.capacity.load(Ordering::Relaxed) as u64;
        let mask = cap - 1;
        loop {
            let pos = self.tail.load(Ordering::Relaxed);
            let slot = &self.slots[(pos & mask) as usize];
            let seq = slot.sequence.load(Ordering::Acquire);

            if seq == pos + 1 {
                // Written and unconsumed — claim it.
                if self
                    .tail
                    .compare_exchange_weak(pos, pos + 1, Ordering::Relaxed, Ordering::Relaxed)
                    .is_ok()
                {
                    let value = slot.value.load(Ordering::Relaxed);
                    // Free the slot for the pass `pos + cap`.
                    slot.sequence.store(pos + cap, Ordering::Release);
                    return Some(value);
                }
            } else if seq <= pos {
                // Nothing written at this position yet.
                return None;
            }
            // seq > pos + 1: another consumer (an evicting producer) won
            // this slot. Retry at the advanced tail.
            std::hint::spin_loop();
        }
    }
}
