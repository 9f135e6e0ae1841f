//! Loom-based exhaustive interleaving checks for the two lock-free
//! algorithms at the heart of the data path: the sequence-coordinated
//! delivery queue (producers CAS head, consumer/evictors CAS tail) and the
//! tagged-head Treiber free list.
//!
//! The models are simplified copies of the production code in
//! `port::queue` and `memory::mempool`, rebuilt on loom's atomics so loom
//! can explore every execution order. Keep capacities and thread counts
//! tiny — interleavings grow exponentially.
//!
//! Run with: `cargo test --test loom_queue --release`

use loom::sync::atomic::{AtomicU64, Ordering};
use loom::sync::Arc;
use loom::thread;

// ============================================================================
// Model: sequence-coordinated value queue (ChunkQueue without policies)
// ============================================================================

struct LoomQueue {
    head: AtomicU64,
    tail: AtomicU64,
    seq: Vec<AtomicU64>,
    val: Vec<AtomicU64>,
    cap: u64,
}

impl LoomQueue {
    fn new(cap: usize) -> Self {
        Self {
            head: AtomicU64::new(0),
            tail: AtomicU64::new(0),
            seq: (0..cap).map(|i| AtomicU64::new(i as u64)).collect(),
            val: (0..cap).map(|_| AtomicU64::new(0)).collect(),
            cap: cap as u64,
        }
    }

    fn push(&self, value: u64) -> bool {
        loop {
            let pos = self.head.load(Ordering::Relaxed);
            let slot = (pos % self.cap) as usize;
            let seq = self.seq[slot].load(Ordering::Acquire);
            if seq == pos {
                if self
                    .head
                    .compare_exchange_weak(pos, pos + 1, Ordering::Relaxed, Ordering::Relaxed)
                    .is_ok()
                {
                    self.val[slot].store(value, Ordering::Relaxed);
                    self.seq[slot].store(pos + 1, Ordering::Release);
                    return true;
                }
            } else if seq < pos {
                return false; // full
            }
            thread::yield_now();
        }
    }

    fn pop(&self) -> Option<u64> {
        loop {
            let pos = self.tail.load(Ordering::Relaxed);
            let slot = (pos % self.cap) as usize;
            let seq = self.seq[slot].load(Ordering::Acquire);
            if seq == pos + 1 {
                if self
                    .tail
                    .compare_exchange_weak(pos, pos + 1, Ordering::Relaxed, Ordering::Relaxed)
                    .is_ok()
                {
                    let value = self.val[slot].load(Ordering::Relaxed);
                    self.seq[slot].store(pos + self.cap, Ordering::Release);
                    return Some(value);
                }
            } else if seq <= pos {
                return None; // empty
            }
            thread::yield_now();
        }
    }
}

#[test]
fn loom_queue_two_producers_no_loss_no_dup() {
    loom::model(|| {
        let q = Arc::new(LoomQueue::new(2));

        let p1 = {
            let q = Arc::clone(&q);
            thread::spawn(move || q.push(1))
        };
        let p2 = {
            let q = Arc::clone(&q);
            thread::spawn(move || q.push(2))
        };
        let pushed1 = p1.join().unwrap();
        let pushed2 = p2.join().unwrap();
        assert!(pushed1 && pushed2, "capacity 2 fits both pushes");

        let a = q.pop().expect("first value");
        let b = q.pop().expect("second value");
        assert!(q.pop().is_none());
        // Both values arrive exactly once, in some producer order.
        let mut seen = [a, b];
        seen.sort_unstable();
        assert_eq!(seen, [1, 2]);
    });
}

#[test]
fn loom_queue_concurrent_push_pop() {
    loom::model(|| {
        let q = Arc::new(LoomQueue::new(2));
        q.push(1);

        let producer = {
            let q = Arc::clone(&q);
            thread::spawn(move || {
                q.push(2);
            })
        };
        // Consumer races the producer; FIFO must hold for whatever it sees.
        let first = q.pop();
        producer.join().unwrap();
        let second = q.pop();

        assert_eq!(first, Some(1), "head is the oldest value");
        assert_eq!(second, Some(2));
    });
}

// ============================================================================
// Model: tagged-head Treiber free list (mempool free-list core)
// ============================================================================

const NIL: u32 = u32::MAX;

struct LoomFreeList {
    /// (tag << 32) | index
    head: AtomicU64,
    next: Vec<AtomicU64>,
}

impl LoomFreeList {
    fn new(count: usize) -> Self {
        Self {
            // tag 0, index 0 at the head; blocks chained in order.
            head: AtomicU64::new(0),
            next: (0..count)
                .map(|i| {
                    AtomicU64::new(if i + 1 < count { (i + 1) as u64 } else { NIL as u64 })
                })
                .collect(),
        }
    }

    fn pop(&self) -> Option<u32> {
        loop {
            let head = self.head.load(Ordering::Acquire);
            let (tag, index) = ((head >> 32) as u32, (head & 0xFFFF_FFFF) as u32);
            if index == NIL {
                return None;
            }
            let next = self.next[index as usize].load(Ordering::Acquire) as u32;
            let new = ((tag.wrapping_add(1) as u64) << 32) | next as u64;
            if self
                .head
                .compare_exchange_weak(head, new, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return Some(index);
            }
        }
    }

    fn push(&self, index: u32) {
        loop {
            let head = self.head.load(Ordering::Acquire);
            let (tag, current) = ((head >> 32) as u32, (head & 0xFFFF_FFFF) as u32);
            self.next[index as usize].store(current as u64, Ordering::Release);
            let new = ((tag.wrapping_add(1) as u64) << 32) | index as u64;
            if self
                .head
                .compare_exchange_weak(head, new, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return;
            }
        }
    }
}

#[test]
fn loom_freelist_pop_push_races() {
    loom::model(|| {
        let list = Arc::new(LoomFreeList::new(2));

        // Two threads each pop one block and push it back.
        let t1 = {
            let list = Arc::clone(&list);
            thread::spawn(move || {
                if let Some(i) = list.pop() {
                    list.push(i);
                }
            })
        };
        let t2 = {
            let list = Arc::clone(&list);
            thread::spawn(move || {
                if let Some(i) = list.pop() {
                    list.push(i);
                }
            })
        };
        t1.join().unwrap();
        t2.join().unwrap();

        // Quiescent: both blocks are on the list, each exactly once.
        let a = list.pop().expect("block available");
        let b = list.pop().expect("block available");
        assert!(list.pop().is_none(), "exactly two blocks exist");
        assert_ne!(a, b, "no duplicated block after the races");
    });
}
