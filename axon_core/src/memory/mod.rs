//! Shared memory core: segments, relocatable pointers, chunk pools.
//!
//! Layered leaves-first:
//!
//! - [`shm_region`] — raw named mmap regions (create/open/unlink)
//! - [`offset_ptr`] — relocatable `(segment-id, offset)` pointers
//! - [`chunk`] — chunk headers and the atomic refcount discipline
//! - [`mempool`] — lock-free LIFO free-lists of fixed-size chunks
//! - [`segment`] — the self-describing segment layout and the per-process
//!   [`SegmentMap`](segment::SegmentMap)
//!
//! Everything stored *inside* a segment uses offsets, never pointers; raw
//! addresses exist only on this side of the API boundary.

pub(crate) mod platform;
pub mod shm_region;

pub mod chunk;
pub mod mempool;
pub mod offset_ptr;
pub mod segment;

pub use chunk::{Chunk, ChunkHeader, CHUNK_HEADER_SIZE};
pub use mempool::{MempoolStats, PoolDescriptor, PoolRef};
pub use offset_ptr::{OffsetPtr, ENCODED_NULL};
pub use platform::default_control_socket;
pub use segment::{chunk_block_size, Segment, SegmentMap, SegmentStats};
pub use shm_region::ShmRegion;
