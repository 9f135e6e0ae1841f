//! Relocatable shared-memory pointers.
//!
//! The same segment is mapped at different virtual addresses in different
//! processes, so nothing stored *inside* shared memory may hold a raw
//! pointer. Every in-segment reference is an [`OffsetPtr`]: a
//! `(segment_id, byte_offset)` pair resolved against the local mapping table
//! at the API boundary (see `SegmentMap` in `segment.rs`).
//!
//! Queue slots and connection lists store the packed [`encode`]d form in a
//! single `AtomicU64` (16-bit segment id, 48-bit offset) so a reference can
//! be published with one atomic store.
//!
//! [`encode`]: OffsetPtr::encode

/// Packed representation of "no reference" in atomic slots.
pub const ENCODED_NULL: u64 = u64::MAX;

const OFFSET_BITS: u32 = 48;
const OFFSET_MASK: u64 = (1 << OFFSET_BITS) - 1;

/// Maximum encodable segment id. `0xFFFF` is reserved so that
/// `encode(max, max)` can never collide with [`ENCODED_NULL`].
pub const MAX_SEGMENT_ID: u32 = 0xFFFE;

/// A process-agnostic pointer into a shared memory segment.
///
/// Equality and ordering are defined on the `(segment_id, offset)` pair,
/// never on virtual addresses.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OffsetPtr {
    pub segment_id: u32,
    pub offset: u64,
}

impl OffsetPtr {
    /// Build an offset pointer. Debug-asserts the encodable ranges; the
    /// broker's layout validation keeps real segments far below both limits.
    #[inline]
    pub fn new(segment_id: u32, offset: u64) -> Self {
        debug_assert!(segment_id <= MAX_SEGMENT_ID);
        debug_assert!(offset <= OFFSET_MASK);
        Self { segment_id, offset }
    }

    /// Pack into a single u64 for storage in atomic slots.
    #[inline]
    pub fn encode(self) -> u64 {
        ((self.segment_id as u64) << OFFSET_BITS) | (self.offset & OFFSET_MASK)
    }

    /// Unpack an encoded reference. Returns `None` for [`ENCODED_NULL`].
    #[inline]
    pub fn decode(raw: u64) -> Option<Self> {
        if raw == ENCODED_NULL {
            return None;
        }
        Some(Self {
            segment_id: (raw >> OFFSET_BITS) as u32,
            offset: raw & OFFSET_MASK,
        })
    }

    /// Pointer displaced by `bytes` within the same segment.
    #[inline]
    pub fn add(self, bytes: u64) -> Self {
        Self {
            segment_id: self.segment_id,
            offset: self.offset + bytes,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_roundtrip() {
        let p = OffsetPtr::new(3, 0x1234_5678);
        assert_eq!(OffsetPtr::decode(p.encode()), Some(p));

        let edge = OffsetPtr::new(MAX_SEGMENT_ID, OFFSET_MASK);
        assert_eq!(OffsetPtr::decode(edge.encode()), Some(edge));
    }

    #[test]
    fn null_is_not_a_pointer() {
        assert_eq!(OffsetPtr::decode(ENCODED_NULL), None);
        let edge = OffsetPtr::new(MAX_SEGMENT_ID, OFFSET_MASK);
        assert_ne!(edge.encode(), ENCODED_NULL);
    }

    #[test]
    fn ordering_is_on_the_pair() {
        let a = OffsetPtr::new(1, 0x9000);
        let b = OffsetPtr::new(2, 0x10);
        assert!(a < b, "segment id dominates the ordering");
        assert!(OffsetPtr::new(1, 1) < OffsetPtr::new(1, 2));
    }
}
