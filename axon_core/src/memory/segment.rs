//! Self-describing shared-memory segments and the per-process mapping table.
//!
//! Segment layout (all offsets from the segment base):
//!
//! ```text
//! 0x00  SegmentHeader   {magic, version, segment_id, flags, pool_count}  64B
//! 0x40  PoolDescriptor table   pool_count × 32B
//!       chunk arrays, 8-byte aligned, one per pool in table order
//! ```
//!
//! The broker creates every segment at bring-up and writes the magic word
//! last; clients open by name and validate magic + version. Segments are
//! never resized.
//!
//! [`SegmentMap`] is the process-wide mapping table: it resolves
//! [`OffsetPtr`]s to local addresses (`ptr`), reverses local addresses to
//! offsets (`offset_of`, with a one-slot hint cache), performs smallest-fit
//! chunk loans across all payload segments, and routes releases back to the
//! origin pool.

use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::config::PoolConfig;
use crate::error::{fatal_invariant, AxonError, AxonResult, LoanError};
use crate::memory::chunk::{Chunk, ChunkHeader, CHUNK_HEADER_SIZE};
use crate::memory::mempool::{init_pool, MempoolStats, PoolDescriptor, PoolRef};
use crate::memory::offset_ptr::OffsetPtr;
use crate::memory::shm_region::ShmRegion;

/// "AXON" in ASCII hex. Written last during bring-up.
pub const SEGMENT_MAGIC: u32 = 0x4158_4F4E;

/// Bumped on any layout change; mismatched processes refuse to attach.
pub const SEGMENT_VERSION: u32 = 1;

/// Segment flag: this segment carries port control blocks, not chunk pools.
pub const SEGMENT_FLAG_MANAGEMENT: u32 = 1 << 0;

const HEADER_SIZE: usize = 64;
const DESCRIPTOR_SIZE: usize = std::mem::size_of::<PoolDescriptor>();

/// 64-byte segment header at the base of every segment.
#[repr(C)]
pub struct SegmentHeader {
    magic: AtomicU32,
    version: u32,
    segment_id: u32,
    flags: u32,
    pool_count: u32,
    _reserved: [u8; 44],
}

const _: () = assert!(std::mem::size_of::<SegmentHeader>() == HEADER_SIZE);

/// A mapped segment: the region plus its validated layout.
pub struct Segment {
    region: ShmRegion,
    segment_id: u32,
    flags: u32,
    pool_count: u32,
}

impl Segment {
    /// Bring up a payload segment: compute the layout from the pool
    /// configuration, create the region, seed every free list, then write
    /// the magic word.
    ///
    /// Pools keep their configuration order in the descriptor table — loan
    /// tie-breaking depends on it.
    pub fn create(name: &str, segment_id: u32, pools: &[PoolConfig]) -> AxonResult<Arc<Segment>> {
        if pools.is_empty() {
            return Err(AxonError::config(format!(
                "segment '{name}' has no pools"
            )));
        }
        // Layout: header, descriptor table, then one chunk array per pool.
        let mut offset = (HEADER_SIZE + pools.len() * DESCRIPTOR_SIZE) as u64;
        let mut arrays = Vec::with_capacity(pools.len());
        for p in pools {
            let chunk_size = chunk_block_size(p.payload_size);
            arrays.push((offset, chunk_size));
            offset += chunk_size as u64 * p.count as u64;
        }
        let total = offset as usize;

        let region = ShmRegion::create(name, total)?;
        let base = region.as_ptr();

        // SAFETY: the region is freshly created, sized for the computed
        // layout, and exclusively owned until the magic word is published.
        unsafe {
            let header = base as *mut SegmentHeader;
            (*header).version = SEGMENT_VERSION;
            (*header).segment_id = segment_id;
            (*header).flags = 0;
            (*header).pool_count = pools.len() as u32;

            for (i, (p, (array_offset, chunk_size))) in pools.iter().zip(&arrays).enumerate() {
                let desc_offset = (HEADER_SIZE + i * DESCRIPTOR_SIZE) as u64;
                init_pool(
                    base.add(desc_offset as usize) as *mut PoolDescriptor,
                    base,
                    desc_offset,
                    *chunk_size,
                    p.count,
                    *array_offset,
                );
            }

            // Publish: header contents become visible before the magic.
            (*header).magic.store(SEGMENT_MAGIC, Ordering::Release);
        }

        Ok(Arc::new(Segment {
            region,
            segment_id,
            flags: 0,
            pool_count: pools.len() as u32,
        }))
    }

    /// Bring up a management segment: `body_size` bytes after the header,
    /// owned and initialized by the caller before any client opens it.
    pub(crate) fn create_management(
        name: &str,
        segment_id: u32,
        body_size: usize,
    ) -> AxonResult<Arc<Segment>> {
        let region = ShmRegion::create(name, HEADER_SIZE + body_size)?;
        let base = region.as_ptr();
        // SAFETY: freshly created region, exclusively owned.
        unsafe {
            let header = base as *mut SegmentHeader;
            (*header).version = SEGMENT_VERSION;
            (*header).segment_id = segment_id;
            (*header).flags = SEGMENT_FLAG_MANAGEMENT;
            (*header).pool_count = 0;
            (*header).magic.store(SEGMENT_MAGIC, Ordering::Release);
        }
        Ok(Arc::new(Segment {
            region,
            segment_id,
            flags: SEGMENT_FLAG_MANAGEMENT,
            pool_count: 0,
        }))
    }

    /// Attach to an existing segment and validate its layout header.
    pub fn open(name: &str) -> AxonResult<Arc<Segment>> {
        let region = ShmRegion::open(name)?;
        if region.size() < HEADER_SIZE {
            return Err(AxonError::segment(name, "smaller than a segment header"));
        }
        // SAFETY: region spans at least HEADER_SIZE bytes.
        let header = unsafe { &*(region.as_ptr() as *const SegmentHeader) };
        if header.magic.load(Ordering::Acquire) != SEGMENT_MAGIC {
            return Err(AxonError::segment(name, "bad magic (not an AXON segment)"));
        }
        if header.version != SEGMENT_VERSION {
            return Err(AxonError::segment(
                name,
                format!(
                    "version mismatch: expected {SEGMENT_VERSION}, found {}",
                    header.version
                ),
            ));
        }
        let pool_count = header.pool_count;
        let table_end = HEADER_SIZE + pool_count as usize * DESCRIPTOR_SIZE;
        if region.size() < table_end {
            return Err(AxonError::segment(name, "truncated pool descriptor table"));
        }
        Ok(Arc::new(Segment {
            segment_id: header.segment_id,
            flags: header.flags,
            pool_count,
            region,
        }))
    }

    #[inline]
    pub fn id(&self) -> u32 {
        self.segment_id
    }

    #[inline]
    pub fn name(&self) -> &str {
        self.region.name()
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.region.size()
    }

    #[inline]
    pub fn base(&self) -> *mut u8 {
        self.region.as_ptr()
    }

    #[inline]
    pub fn is_management(&self) -> bool {
        self.flags & SEGMENT_FLAG_MANAGEMENT != 0
    }

    #[inline]
    pub fn pool_count(&self) -> u32 {
        self.pool_count
    }

    /// Pool at table index `i`.
    pub fn pool(&self, i: u32) -> Option<PoolRef<'_>> {
        if i >= self.pool_count {
            return None;
        }
        let desc_offset = (HEADER_SIZE + i as usize * DESCRIPTOR_SIZE) as u64;
        // SAFETY: the descriptor table was validated against the region size
        // at open/create; desc_offset is within it.
        Some(unsafe {
            PoolRef::new(
                &*(self.base().add(desc_offset as usize) as *const PoolDescriptor),
                self.base(),
                self.segment_id,
                desc_offset,
            )
        })
    }

    /// Pool whose descriptor sits at `desc_offset` — the release path's
    /// lookup from a chunk's `origin_pool_offset`. `None` if the offset does
    /// not name a table entry.
    pub fn pool_at_offset(&self, desc_offset: u64) -> Option<PoolRef<'_>> {
        let rel = desc_offset.checked_sub(HEADER_SIZE as u64)?;
        if rel % DESCRIPTOR_SIZE as u64 != 0 {
            return None;
        }
        self.pool((rel / DESCRIPTOR_SIZE as u64) as u32)
    }

    /// Counters for every pool in this segment.
    pub fn stats(&self) -> SegmentStats {
        SegmentStats {
            name: self.name().to_string(),
            segment_id: self.segment_id,
            pools: (0..self.pool_count)
                .filter_map(|i| self.pool(i))
                .map(|p| p.descriptor().stats())
                .collect(),
        }
    }
}

/// Full block size for a configured payload capacity: header + payload,
/// rounded up to 8 bytes.
pub fn chunk_block_size(payload_size: u32) -> u32 {
    (CHUNK_HEADER_SIZE as u32 + payload_size + 7) & !7
}

/// Point-in-time counters for one segment.
#[derive(Debug, Clone)]
pub struct SegmentStats {
    pub name: String,
    pub segment_id: u32,
    pub pools: Vec<MempoolStats>,
}

// ============================================================================
// SegmentMap - the per-process mapping table
// ============================================================================

/// Process-wide table of mapped segments, indexed by segment id.
///
/// Built once at startup (broker handshake lists every segment) and immutable
/// afterwards, so the data path resolves pointers without any lock.
pub struct SegmentMap {
    /// Indexed by segment id; ids are dense (assigned by the broker in
    /// configuration order).
    segments: Box<[Option<Arc<Segment>>]>,
    /// One-slot hint for `offset_of`: the segment id that matched last.
    hint: AtomicUsize,
}

impl SegmentMap {
    /// Build the table. Fails on duplicate segment ids.
    pub fn new(segments: Vec<Arc<Segment>>) -> AxonResult<Self> {
        let max_id = segments.iter().map(|s| s.id()).max().unwrap_or(0) as usize;
        let mut table: Vec<Option<Arc<Segment>>> = vec![None; max_id + 1];
        for seg in segments {
            let slot = &mut table[seg.id() as usize];
            if slot.is_some() {
                return Err(AxonError::config(format!(
                    "duplicate segment id {}",
                    seg.id()
                )));
            }
            *slot = Some(seg);
        }
        Ok(Self {
            segments: table.into_boxed_slice(),
            hint: AtomicUsize::new(0),
        })
    }

    /// Segment by id.
    pub fn segment(&self, id: u32) -> Option<&Arc<Segment>> {
        self.segments.get(id as usize).and_then(|s| s.as_ref())
    }

    /// The management segment, if one is mapped.
    pub fn management(&self) -> Option<&Arc<Segment>> {
        self.segments
            .iter()
            .flatten()
            .find(|s| s.is_management())
    }

    /// Resolve an offset pointer to a local address.
    ///
    /// Fails with `ADDRESS_OUT_OF_SEGMENT` when the segment is not mapped or
    /// the offset exceeds the segment size.
    pub fn ptr(&self, p: OffsetPtr) -> AxonResult<*mut u8> {
        let seg = self.segment(p.segment_id).ok_or(AxonError::AddressOutOfSegment {
            segment_id: p.segment_id,
            offset: p.offset,
        })?;
        if p.offset >= seg.size() as u64 {
            return Err(AxonError::AddressOutOfSegment {
                segment_id: p.segment_id,
                offset: p.offset,
            });
        }
        // SAFETY: offset is within the mapped region.
        Ok(unsafe { seg.base().add(p.offset as usize) })
    }

    /// Reverse-map a local address to its offset pointer.
    ///
    /// The mapping table is small; a linear scan with a one-slot hint is the
    /// whole lookup.
    pub fn offset_of(&self, raw: *const u8) -> AxonResult<OffsetPtr> {
        let addr = raw as usize;
        let hint = self.hint.load(Ordering::Relaxed);
        if let Some(Some(seg)) = self.segments.get(hint) {
            if let Some(p) = Self::locate(seg, addr) {
                return Ok(p);
            }
        }
        for (i, seg) in self.segments.iter().enumerate() {
            let Some(seg) = seg else { continue };
            if i == hint {
                continue;
            }
            if let Some(p) = Self::locate(seg, addr) {
                self.hint.store(i, Ordering::Relaxed);
                return Ok(p);
            }
        }
        Err(AxonError::AddressOutOfSegment {
            segment_id: u32::MAX,
            offset: addr as u64,
        })
    }

    fn locate(seg: &Arc<Segment>, addr: usize) -> Option<OffsetPtr> {
        let base = seg.base() as usize;
        if addr >= base && addr < base + seg.size() {
            Some(OffsetPtr::new(seg.id(), (addr - base) as u64))
        } else {
            None
        }
    }

    /// Rebind an encoded chunk reference popped from a queue.
    pub(crate) fn resolve_chunk(&self, location: OffsetPtr) -> AxonResult<Chunk> {
        let out_of_segment = AxonError::AddressOutOfSegment {
            segment_id: location.segment_id,
            offset: location.offset,
        };
        let Some(seg) = self.segment(location.segment_id) else {
            return Err(out_of_segment);
        };
        if location.offset + CHUNK_HEADER_SIZE as u64 > seg.size() as u64 {
            return Err(out_of_segment);
        }
        // SAFETY: bounds checked above; chunk headers are 8-aligned by layout.
        unsafe {
            let raw = seg.base().add(location.offset as usize);
            Ok(Chunk::from_raw(
                NonNull::new_unchecked(raw as *mut ChunkHeader),
                location,
            ))
        }
    }

    /// Loan a chunk: smallest-fitting pool across all payload segments, ties
    /// broken by configuration order (segment order, then pool table order).
    ///
    /// The chosen pool being empty is `PoolEmpty` — loans do not spill into
    /// larger pools.
    pub fn loan(&self, payload_size: u32, user_header_size: u32) -> Result<Chunk, LoanError> {
        let needed = payload_size + user_header_size;
        let mut best: Option<(PoolRef<'_>, u32)> = None;
        for seg in self.segments.iter().flatten() {
            if seg.is_management() {
                continue;
            }
            for i in 0..seg.pool_count() {
                let pool = seg.pool(i).expect("index within pool_count");
                let cap = pool.descriptor().payload_capacity();
                if cap >= needed && best.map_or(true, |(_, c)| cap < c) {
                    best = Some((pool, cap));
                }
            }
        }
        match best {
            Some((pool, _)) => pool.get_chunk(payload_size, user_header_size),
            None => Err(LoanError::NoPoolFitsSize),
        }
    }

    /// Drop one reference; on the last, return the chunk to its origin pool.
    pub fn release_chunk(&self, chunk: Chunk) {
        if chunk.header().release() {
            let Some(seg) = self.segment(chunk.location().segment_id) else {
                fatal_invariant("chunk release in a process that never mapped its segment");
            };
            let Some(pool) = seg.pool_at_offset(chunk.header().origin_pool_offset()) else {
                fatal_invariant("chunk's origin pool offset names no pool descriptor");
            };
            pool.free_chunk(chunk);
        }
    }

    /// Counters for every mapped payload segment.
    pub fn stats(&self) -> Vec<SegmentStats> {
        self.segments
            .iter()
            .flatten()
            .filter(|s| !s.is_management())
            .map(|s| s.stats())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unique_name(prefix: &str) -> String {
        format!(
            "{}_{}_{}",
            prefix,
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap()
                .as_nanos()
        )
    }

    fn two_pool_config() -> Vec<PoolConfig> {
        vec![
            PoolConfig {
                payload_size: 128,
                count: 4,
            },
            PoolConfig {
                payload_size: 1024,
                count: 2,
            },
        ]
    }

    #[test]
    fn create_open_validates_layout() {
        let name = unique_name("seg_layout");
        let created = Segment::create(&name, 1, &two_pool_config()).expect("create");
        assert_eq!(created.pool_count(), 2);
        assert!(!created.is_management());

        let opened = Segment::open(&name).expect("open");
        assert_eq!(opened.id(), 1);
        assert_eq!(opened.pool_count(), 2);
        assert_eq!(opened.pool(0).unwrap().descriptor().chunk_count(), 4);
        assert!(opened.pool(1).unwrap().descriptor().payload_capacity() >= 1024);
    }

    #[test]
    fn open_rejects_garbage() {
        let name = unique_name("seg_garbage");
        let _region = ShmRegion::create(&name, 4096).expect("raw region");
        assert!(Segment::open(&name).is_err(), "no magic, must refuse");
    }

    #[test]
    fn ptr_roundtrip_and_bounds() {
        let name = unique_name("seg_ptr");
        let seg = Segment::create(&name, 1, &two_pool_config()).expect("create");
        let size = seg.size() as u64;
        let map = SegmentMap::new(vec![seg]).unwrap();

        let p = OffsetPtr::new(1, 128);
        let raw = map.ptr(p).expect("in bounds");
        assert_eq!(map.offset_of(raw).expect("reverse"), p);

        assert!(matches!(
            map.ptr(OffsetPtr::new(1, size)),
            Err(AxonError::AddressOutOfSegment { .. })
        ));
        assert!(matches!(
            map.ptr(OffsetPtr::new(7, 0)),
            Err(AxonError::AddressOutOfSegment { .. })
        ));
    }

    #[test]
    fn smallest_fit_selection() {
        let name = unique_name("seg_fit");
        let seg = Segment::create(&name, 1, &two_pool_config()).expect("create");
        let map = SegmentMap::new(vec![seg]).unwrap();

        // 100 bytes fits the 128 pool; 500 bytes only the 1024 pool.
        let small = map.loan(100, 0).expect("loan small");
        let large = map.loan(500, 0).expect("loan large");
        let seg = map.segment(1).unwrap();
        assert_eq!(
            small.header().origin_pool_offset(),
            64,
            "first descriptor right after the header"
        );
        assert_eq!(large.header().origin_pool_offset(), 96);
        assert!(map.loan(4096, 0).is_err(), "nothing fits 4096");

        map.release_chunk(small);
        map.release_chunk(large);
        let stats = seg.stats();
        assert!(stats.pools.iter().all(|p| p.used_chunks == 0));
    }

    #[test]
    fn pool_empty_does_not_spill() {
        let name = unique_name("seg_nospill");
        let seg = Segment::create(&name, 1, &two_pool_config()).expect("create");
        let map = SegmentMap::new(vec![seg]).unwrap();

        let mut held = Vec::new();
        for _ in 0..4 {
            held.push(map.loan(64, 0).expect("small pool loan"));
        }
        assert_eq!(
            map.loan(64, 0).unwrap_err(),
            LoanError::PoolEmpty,
            "small pool drained; no spill into the 1024 pool"
        );
        for c in held {
            map.release_chunk(c);
        }
    }
}
