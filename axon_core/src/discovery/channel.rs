//! Per-port discovery rings.
//!
//! Every port carries two [`CaproRing`]s in its control block: an *outbox*
//! (written by the port owner, drained by the broker) and an *inbox*
//! (written by the broker, drained by the port owner). Each ring is strictly
//! single-writer / single-reader, so the protocol is the plain SPSC
//! write-slot-then-publish-head scheme — no per-slot CAS.
//!
//! A full ring drops the message and bumps `dropped`. The broker reads that
//! counter with [`CaproRing::take_dropped`] and, when it moved, rebuilds its
//! view of the port from the port's discovery-visible state instead of
//! trusting the (now incomplete) message stream.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::discovery::capro::CaproMessage;

/// Slots per ring. Power of two; discovery traffic is a handful of messages
/// per port lifetime, so overflow only happens under gross broker stall.
pub const CAPRO_RING_CAPACITY: u64 = 16;

#[repr(C)]
struct CaproSlot(UnsafeCell<CaproMessage>);

/// Bounded SPSC ring of fixed-size CaPro messages, shm-resident.
#[repr(C)]
pub struct CaproRing {
    head: AtomicU64,
    tail: AtomicU64,
    dropped: AtomicU64,
    slots: [CaproSlot; CAPRO_RING_CAPACITY as usize],
}

// SAFETY: single-writer/single-reader discipline is assigned by role (port
// owner vs broker); the head/tail release-acquire pair orders slot access.
unsafe impl Sync for CaproRing {}

impl CaproRing {
    /// Reset at port-claim time, before the block becomes visible.
    pub(crate) fn reset(&self) {
        self.head.store(0, Ordering::Relaxed);
        self.tail.store(0, Ordering::Relaxed);
        self.dropped.store(0, Ordering::Release);
    }

    /// Push a message (single writer only). Returns `false` and counts the
    /// drop when the ring is full.
    pub fn push(&self, mut msg: CaproMessage) -> bool {
        let head = self.head.load(Ordering::Relaxed);
        let tail = self.tail.load(Ordering::Acquire);
        if head - tail >= CAPRO_RING_CAPACITY {
            self.dropped.fetch_add(1, Ordering::AcqRel);
            return false;
        }
        msg.seq = head;
        let slot = &self.slots[(head % CAPRO_RING_CAPACITY) as usize];
        // SAFETY: single-writer ring; the slot at `head` is outside the
        // reader's [tail, head) window until the head store below.
        unsafe { *slot.0.get() = msg };
        self.head.store(head + 1, Ordering::Release);
        true
    }

    /// Pop the oldest message (single reader only).
    pub fn pop(&self) -> Option<CaproMessage> {
        let tail = self.tail.load(Ordering::Relaxed);
        let head = self.head.load(Ordering::Acquire);
        if tail >= head {
            return None;
        }
        let slot = &self.slots[(tail % CAPRO_RING_CAPACITY) as usize];
        // SAFETY: single-reader ring; the slot is inside [tail, head), fully
        // written before the writer's head release.
        let msg = unsafe { *slot.0.get() };
        self.tail.store(tail + 1, Ordering::Release);
        Some(msg)
    }

    /// Messages waiting to be popped.
    pub fn len(&self) -> u64 {
        let head = self.head.load(Ordering::Acquire);
        let tail = self.tail.load(Ordering::Acquire);
        head.saturating_sub(tail)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Read-and-clear the drop counter. A nonzero return tells the reader
    /// messages were lost and a state snapshot resync is required.
    pub fn take_dropped(&self) -> u64 {
        self.dropped.swap(0, Ordering::AcqRel)
    }
}
