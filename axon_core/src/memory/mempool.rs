//! Fixed-size chunk pools with a lock-free LIFO free list.
//!
//! Each pool owns a contiguous array of same-sized chunks inside a segment.
//! The free list is a Treiber stack threaded through the chunk headers'
//! `next_free` links, keyed by a 64-bit tagged head: the chunk index lives in
//! the low 32 bits, a monotonic tag in the high 32 bits so a pop/push/pop of
//! the same index between another thread's load and CAS cannot be mistaken
//! for an unchanged stack (ABA).
//!
//! Pool descriptors live in the segment's descriptor table right after the
//! segment header; chunks reach their descriptor back through
//! `origin_pool_offset` in the chunk header.

use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::{fatal_invariant, LoanError};
use crate::memory::chunk::{Chunk, ChunkHeader, CHUNK_HEADER_SIZE, INVALID_CHUNK_INDEX};
use crate::memory::offset_ptr::OffsetPtr;

/// Pack a free-list head: monotonic tag in the high 32 bits, chunk index in
/// the low 32 bits.
#[inline]
fn pack_head(tag: u32, index: u32) -> u64 {
    ((tag as u64) << 32) | index as u64
}

/// Unpack a free-list head into (tag, index).
#[inline]
fn unpack_head(head: u64) -> (u32, u32) {
    ((head >> 32) as u32, (head & 0xFFFF_FFFF) as u32)
}

/// Per-pool descriptor in the segment's descriptor table (32 bytes):
/// `{chunk_size, chunk_count, chunk_array_offset, free_head + usage (16B)}`.
#[repr(C)]
pub struct PoolDescriptor {
    /// Full block size in bytes: header + user header room + payload,
    /// 8-byte aligned.
    chunk_size: u32,
    chunk_count: u32,
    /// Byte offset of the chunk array from the segment base.
    chunk_array_offset: u64,
    /// Tagged Treiber head.
    free_head: AtomicU64,
    /// Used count (low 32 bits) and high watermark (high 32 bits).
    usage: AtomicU64,
}

const _: () = assert!(std::mem::size_of::<PoolDescriptor>() == 32);

impl PoolDescriptor {
    /// Full block size (header + payload room).
    #[inline]
    pub fn chunk_size(&self) -> u32 {
        self.chunk_size
    }

    /// Payload capacity of one chunk (shared with any user header).
    #[inline]
    pub fn payload_capacity(&self) -> u32 {
        self.chunk_size - CHUNK_HEADER_SIZE as u32
    }

    #[inline]
    pub fn chunk_count(&self) -> u32 {
        self.chunk_count
    }

    #[inline]
    pub fn chunk_array_offset(&self) -> u64 {
        self.chunk_array_offset
    }

    /// Chunks currently loaned or in flight.
    #[inline]
    pub fn used_chunks(&self) -> u32 {
        (self.usage.load(Ordering::Acquire) & 0xFFFF_FFFF) as u32
    }

    /// Chunks available on the free list.
    #[inline]
    pub fn free_chunks(&self) -> u32 {
        self.chunk_count - self.used_chunks()
    }

    /// Highest simultaneous usage observed since bring-up.
    #[inline]
    pub fn high_watermark(&self) -> u32 {
        (self.usage.load(Ordering::Acquire) >> 32) as u32
    }

    /// Point-in-time counters for this pool.
    pub fn stats(&self) -> MempoolStats {
        let used = self.used_chunks();
        MempoolStats {
            chunk_size: self.chunk_size,
            chunk_count: self.chunk_count,
            used_chunks: used,
            free_chunks: self.chunk_count - used,
            high_watermark: self.high_watermark(),
        }
    }

    fn usage_inc(&self) {
        let mut cur = self.usage.load(Ordering::Relaxed);
        loop {
            let used = (cur & 0xFFFF_FFFF) as u32 + 1;
            let wm = ((cur >> 32) as u32).max(used);
            let next = ((wm as u64) << 32) | used as u64;
            match self
                .usage
                .compare_exchange_weak(cur, next, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => return,
                Err(seen) => cur = seen,
            }
        }
    }

    fn usage_dec(&self) {
        // The watermark lives in the high bits, so a plain decrement of the
        // low half never borrows into it (used > 0 whenever a free happens).
        self.usage.fetch_sub(1, Ordering::AcqRel);
    }
}

/// One-time descriptor + free-list setup at segment bring-up.
///
/// Threads every chunk onto the free list (index i links to i+1) and stamps
/// each chunk header's origin pool.
///
/// # Safety
/// `desc` must point at writable memory for a `PoolDescriptor` located at
/// `base + desc_offset`; the chunk array `[chunk_array_offset,
/// chunk_array_offset + chunk_count * chunk_size)` must lie inside the same
/// mapping; the caller must have exclusive access to the whole segment (it
/// is not yet visible to other processes).
pub(crate) unsafe fn init_pool(
    desc: *mut PoolDescriptor,
    base: *mut u8,
    desc_offset: u64,
    chunk_size: u32,
    chunk_count: u32,
    chunk_array_offset: u64,
) {
    debug_assert_eq!(chunk_size % 8, 0);
    (*desc).chunk_size = chunk_size;
    (*desc).chunk_count = chunk_count;
    (*desc).chunk_array_offset = chunk_array_offset;
    (*desc).usage.store(0, Ordering::Relaxed);

    for i in 0..chunk_count {
        let header =
            &*(base.add((chunk_array_offset + i as u64 * chunk_size as u64) as usize)
                as *const ChunkHeader);
        header.init_origin(desc_offset);
        header.set_next_free(if i + 1 < chunk_count {
            i + 1
        } else {
            INVALID_CHUNK_INDEX
        });
    }
    (*desc).free_head.store(
        pack_head(0, if chunk_count > 0 { 0 } else { INVALID_CHUNK_INDEX }),
        Ordering::Release,
    );
}

/// A pool bound to its segment mapping: descriptor + local base address.
///
/// `PoolRef` is cheap to construct and borrows the segment, so data-path
/// callers build it per operation from the chunk's `origin_pool_offset`.
#[derive(Clone, Copy)]
pub struct PoolRef<'a> {
    desc: &'a PoolDescriptor,
    /// Local base address of the owning segment.
    base: *mut u8,
    segment_id: u32,
    /// Byte offset of `desc` from `base`.
    desc_offset: u64,
}

impl<'a> PoolRef<'a> {
    /// Bind a descriptor to its segment mapping.
    ///
    /// # Safety
    /// `desc` must live at `base + desc_offset` inside a mapped segment of
    /// id `segment_id`, with its chunk array inside the same mapping.
    pub(crate) unsafe fn new(
        desc: &'a PoolDescriptor,
        base: *mut u8,
        segment_id: u32,
        desc_offset: u64,
    ) -> Self {
        Self {
            desc,
            base,
            segment_id,
            desc_offset,
        }
    }

    #[inline]
    pub fn descriptor(&self) -> &'a PoolDescriptor {
        self.desc
    }

    /// Pop a chunk off the free list and activate it with one reference.
    ///
    /// `payload_size + user_header_size` must fit the pool's payload
    /// capacity — callers pick the pool before calling (smallest fit).
    pub fn get_chunk(&self, payload_size: u32, user_header_size: u32) -> Result<Chunk, LoanError> {
        debug_assert!(payload_size + user_header_size <= self.desc.payload_capacity());
        let mut head = self.desc.free_head.load(Ordering::Acquire);
        loop {
            let (tag, index) = unpack_head(head);
            if index == INVALID_CHUNK_INDEX {
                return Err(LoanError::PoolEmpty);
            }
            let header = self.header_at(index);
            let next = header.next_free();
            match self.desc.free_head.compare_exchange_weak(
                head,
                pack_head(tag.wrapping_add(1), next),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    self.desc.usage_inc();
                    header.activate(payload_size, user_header_size);
                    let location = OffsetPtr::new(self.segment_id, self.chunk_offset(index));
                    // SAFETY: header_at resolved a live mapped header at
                    // `location` in this segment.
                    return Ok(unsafe { Chunk::from_raw(NonNull::from(header), location) });
                }
                Err(seen) => head = seen,
            }
        }
    }

    /// Push a chunk whose refcount already dropped to zero back onto the
    /// free list. Aborts the process if the chunk does not belong here —
    /// a foreign free means the shared state is corrupt.
    pub fn free_chunk(&self, chunk: Chunk) {
        let header = chunk.header();
        if header.origin_pool_offset() != self.desc_offset
            || chunk.location().segment_id != self.segment_id
        {
            fatal_invariant("chunk freed into a pool it does not belong to");
        }
        let offset = chunk.location().offset;
        let array = self.desc.chunk_array_offset;
        let span = self.desc.chunk_count as u64 * self.desc.chunk_size as u64;
        if offset < array
            || offset >= array + span
            || (offset - array) % self.desc.chunk_size as u64 != 0
        {
            fatal_invariant("chunk address does not match its pool's chunk array");
        }
        let index = ((offset - array) / self.desc.chunk_size as u64) as u32;

        let mut head = self.desc.free_head.load(Ordering::Acquire);
        loop {
            let (tag, current) = unpack_head(head);
            header.set_next_free(current);
            match self.desc.free_head.compare_exchange_weak(
                head,
                pack_head(tag.wrapping_add(1), index),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    self.desc.usage_dec();
                    return;
                }
                Err(seen) => head = seen,
            }
        }
    }

    /// Resolve the chunk header at `index`.
    fn header_at(&self, index: u32) -> &'a ChunkHeader {
        debug_assert!(index < self.desc.chunk_count);
        // SAFETY: index is within the chunk array, which lies inside the
        // mapped segment (layout computed at bring-up); blocks are 8-aligned.
        unsafe { &*(self.base.add(self.chunk_offset(index) as usize) as *const ChunkHeader) }
    }

    #[inline]
    fn chunk_offset(&self, index: u32) -> u64 {
        self.desc.chunk_array_offset + index as u64 * self.desc.chunk_size as u64
    }
}

/// Point-in-time counters for one pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MempoolStats {
    pub chunk_size: u32,
    pub chunk_count: u32,
    pub used_chunks: u32,
    pub free_chunks: u32,
    pub high_watermark: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::alloc::{alloc_zeroed, dealloc, Layout};

    /// A standalone pool in heap memory laid out like a segment slice:
    /// descriptor at offset 64, chunk array right after it.
    struct TestPool {
        base: *mut u8,
        layout: Layout,
        desc_offset: u64,
    }

    // SAFETY: the raw allocation is only mutated through the pool's atomic
    // protocols once constructed.
    unsafe impl Send for TestPool {}
    unsafe impl Sync for TestPool {}

    impl TestPool {
        fn new(payload: u32, count: u32) -> Self {
            let chunk_size = (CHUNK_HEADER_SIZE as u32 + payload + 7) & !7;
            let desc_offset = 64u64;
            let array_offset = desc_offset + 32;
            let total = array_offset as usize + (chunk_size * count) as usize;
            let layout = Layout::from_size_align(total, 8).unwrap();
            // SAFETY: layout has nonzero size.
            let base = unsafe { alloc_zeroed(layout) };
            assert!(!base.is_null());
            // SAFETY: desc and chunk array lie inside the fresh allocation,
            // which this thread owns exclusively.
            unsafe {
                init_pool(
                    base.add(desc_offset as usize) as *mut PoolDescriptor,
                    base,
                    desc_offset,
                    chunk_size,
                    count,
                    array_offset,
                );
            }
            Self {
                base,
                layout,
                desc_offset,
            }
        }

        fn pool(&self) -> PoolRef<'_> {
            // SAFETY: desc lives at base + desc_offset inside the allocation.
            unsafe {
                let desc = &*(self.base.add(self.desc_offset as usize) as *const PoolDescriptor);
                PoolRef::new(desc, self.base, 1, self.desc_offset)
            }
        }
    }

    impl Drop for TestPool {
        fn drop(&mut self) {
            // SAFETY: base/layout are the live allocation from new().
            unsafe { dealloc(self.base, self.layout) };
        }
    }

    #[test]
    fn drain_and_refill() {
        let t = TestPool::new(64, 4);
        let p = t.pool();
        assert_eq!(p.descriptor().free_chunks(), 4);

        let mut held = Vec::new();
        for _ in 0..4 {
            held.push(p.get_chunk(32, 0).expect("pool should have chunks"));
        }
        assert_eq!(p.descriptor().used_chunks(), 4);
        assert_eq!(
            p.get_chunk(32, 0).unwrap_err(),
            LoanError::PoolEmpty,
            "fifth loan must drain"
        );

        for c in held.drain(..) {
            assert!(c.header().release());
            p.free_chunk(c);
        }
        assert_eq!(p.descriptor().free_chunks(), 4);
        assert_eq!(p.descriptor().high_watermark(), 4);
    }

    #[test]
    fn lifo_reuse() {
        let t = TestPool::new(64, 2);
        let p = t.pool();
        let a = p.get_chunk(8, 0).unwrap();
        let a_loc = a.location();
        assert!(a.header().release());
        p.free_chunk(a);

        let b = p.get_chunk(8, 0).unwrap();
        assert_eq!(b.location(), a_loc, "freed chunk is reused first (LIFO)");
    }

    #[test]
    fn payload_is_writable_and_isolated() {
        let t = TestPool::new(128, 2);
        let p = t.pool();
        let mut a = p.get_chunk(100, 0).unwrap();
        let mut b = p.get_chunk(100, 0).unwrap();
        a.payload_mut().fill(0xAA);
        b.payload_mut().fill(0x55);
        assert!(a.payload().iter().all(|&x| x == 0xAA));
        assert!(b.payload().iter().all(|&x| x == 0x55));
    }

    #[test]
    fn concurrent_loan_free_accounting() {
        use std::sync::Arc;

        let t = Arc::new(TestPool::new(32, 64));
        let threads: Vec<_> = (0..4)
            .map(|_| {
                let t = Arc::clone(&t);
                std::thread::spawn(move || {
                    for _ in 0..500 {
                        let p = t.pool();
                        if let Ok(c) = p.get_chunk(16, 0) {
                            assert!(c.header().release());
                            p.free_chunk(c);
                        }
                    }
                })
            })
            .collect();
        for th in threads {
            th.join().unwrap();
        }
        let p = t.pool();
        assert_eq!(p.descriptor().used_chunks(), 0);
        assert_eq!(p.descriptor().free_chunks(), 64);
    }
}
