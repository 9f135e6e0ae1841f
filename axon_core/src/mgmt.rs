//! Management segment: port control blocks and notifier slots.
//!
//! Layout (offsets from the segment base):
//!
//! ```text
//! 0x00  SegmentHeader (flags: MANAGEMENT)                      64B
//! 0x40  MgmtHeader {max_publishers, max_subscribers, ...}      64B
//!       PublisherPortData  × max_publishers
//!       SubscriberPortData × max_subscribers
//!       Notifier           × max_notifiers
//! ```
//!
//! The broker provisions the segment (and initializes every notifier's
//! process-shared semaphore) at bring-up. Clients claim port and notifier
//! slots with a CAS on the slot's allocation word: FREE → CLAIMED, fields
//! initialized, then ACTIVE. Owners mark slots ZOMBIE on drop; the broker's
//! discovery loop reclaims ZOMBIE slots back to FREE after registry cleanup.
//!
//! Notifier slot 0 is reserved for the broker: ports arm it (index 0) after
//! pushing discovery messages so the discovery loop wakes promptly.

use std::ptr::NonNull;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::config::MgmtConfig;
use crate::discovery::service::ServiceDescriptor;
use crate::error::{AxonError, AxonResult};
use crate::memory::offset_ptr::OffsetPtr;
use crate::memory::segment::Segment;
use crate::port::publisher::PublisherPortData;
use crate::port::subscriber::SubscriberPortData;
use crate::port::{PORT_ACTIVE, PORT_CLAIMED, PORT_FREE};
use crate::waitset::notifier::{Notifier, NOTIFIER_ACTIVE, NOTIFIER_FREE};

const SEGMENT_HEADER_SIZE: u64 = 64;
const MGMT_HEADER_SIZE: u64 = 64;

#[repr(C)]
struct MgmtHeader {
    max_publishers: u32,
    max_subscribers: u32,
    max_notifiers: u32,
    _pad: u32,
    publishers_offset: u64,
    subscribers_offset: u64,
    notifiers_offset: u64,
    _reserved: [u8; 24],
}

const _: () = assert!(std::mem::size_of::<MgmtHeader>() as u64 == MGMT_HEADER_SIZE);

/// Handle to a mapped management segment. Cheap to clone.
#[derive(Clone)]
pub struct MgmtSegment {
    seg: Arc<Segment>,
}

impl MgmtSegment {
    /// Compute the layout, create the segment, and initialize every slot.
    /// Broker bring-up only.
    pub fn provision(name: &str, cfg: &MgmtConfig) -> AxonResult<Self> {
        let pub_size = std::mem::size_of::<PublisherPortData>() as u64;
        let sub_size = std::mem::size_of::<SubscriberPortData>() as u64;
        let not_size = std::mem::size_of::<Notifier>() as u64;

        let publishers_offset = SEGMENT_HEADER_SIZE + MGMT_HEADER_SIZE;
        let subscribers_offset = publishers_offset + cfg.max_publishers as u64 * pub_size;
        let notifiers_offset = subscribers_offset + cfg.max_subscribers as u64 * sub_size;
        let total = notifiers_offset + cfg.max_notifiers as u64 * not_size;

        let seg = Segment::create_management(
            name,
            0,
            (total - SEGMENT_HEADER_SIZE) as usize,
        )?;

        // SAFETY: freshly created zeroed segment, exclusively owned until
        // returned; offsets computed above lie within it.
        unsafe {
            let header = seg.base().add(SEGMENT_HEADER_SIZE as usize) as *mut MgmtHeader;
            (*header).max_publishers = cfg.max_publishers;
            (*header).max_subscribers = cfg.max_subscribers;
            (*header).max_notifiers = cfg.max_notifiers;
            (*header).publishers_offset = publishers_offset;
            (*header).subscribers_offset = subscribers_offset;
            (*header).notifiers_offset = notifiers_offset;
        }

        let mgmt = Self { seg };
        // Process-shared semaphores need one-time OS initialization.
        for i in 0..cfg.max_notifiers {
            let (notifier, _) = mgmt.notifier_at(i);
            // SAFETY: zeroed shared memory, before any client maps it.
            unsafe { notifier.init() };
        }
        // Slot 0 belongs to the broker's discovery loop.
        mgmt.notifier_at(0)
            .0
            .slot_state
            .store(NOTIFIER_ACTIVE, Ordering::Release);
        Ok(mgmt)
    }

    /// Wrap an already-opened management segment.
    pub fn open(seg: Arc<Segment>) -> AxonResult<Self> {
        if !seg.is_management() {
            return Err(AxonError::segment(
                seg.name(),
                "not a management segment",
            ));
        }
        Ok(Self { seg })
    }

    pub fn segment(&self) -> &Arc<Segment> {
        &self.seg
    }

    fn header(&self) -> &MgmtHeader {
        // SAFETY: provision/open validated the segment; the header follows
        // the segment header.
        unsafe { &*(self.seg.base().add(SEGMENT_HEADER_SIZE as usize) as *const MgmtHeader) }
    }

    pub fn max_publishers(&self) -> u32 {
        self.header().max_publishers
    }

    pub fn max_subscribers(&self) -> u32 {
        self.header().max_subscribers
    }

    pub fn max_notifiers(&self) -> u32 {
        self.header().max_notifiers
    }

    /// Publisher block at `index` with its location.
    pub fn publisher_at(&self, index: u32) -> (&PublisherPortData, OffsetPtr) {
        debug_assert!(index < self.max_publishers());
        let offset = self.header().publishers_offset
            + index as u64 * std::mem::size_of::<PublisherPortData>() as u64;
        let loc = OffsetPtr::new(self.seg.id(), offset);
        // SAFETY: within the provisioned array.
        (
            unsafe { &*(self.seg.base().add(offset as usize) as *const PublisherPortData) },
            loc,
        )
    }

    /// Subscriber block at `index` with its location.
    pub fn subscriber_at(&self, index: u32) -> (&SubscriberPortData, OffsetPtr) {
        debug_assert!(index < self.max_subscribers());
        let offset = self.header().subscribers_offset
            + index as u64 * std::mem::size_of::<SubscriberPortData>() as u64;
        let loc = OffsetPtr::new(self.seg.id(), offset);
        // SAFETY: within the provisioned array.
        (
            unsafe { &*(self.seg.base().add(offset as usize) as *const SubscriberPortData) },
            loc,
        )
    }

    /// Notifier block at `index` with its location.
    pub fn notifier_at(&self, index: u32) -> (&Notifier, OffsetPtr) {
        debug_assert!(index < self.max_notifiers());
        let offset = self.header().notifiers_offset
            + index as u64 * std::mem::size_of::<Notifier>() as u64;
        let loc = OffsetPtr::new(self.seg.id(), offset);
        // SAFETY: within the provisioned array.
        (
            unsafe { &*(self.seg.base().add(offset as usize) as *const Notifier) },
            loc,
        )
    }

    /// The broker's wakeup notifier (reserved slot 0).
    pub fn broker_notifier(&self) -> NonNull<Notifier> {
        NonNull::from(self.notifier_at(0).0)
    }

    /// Claim a publisher block: CAS FREE→CLAIMED, initialize, go ACTIVE.
    pub(crate) fn claim_publisher(
        &self,
        service: ServiceDescriptor,
        history_capacity: u32,
    ) -> AxonResult<(NonNull<PublisherPortData>, OffsetPtr)> {
        for i in 0..self.max_publishers() {
            let (block, loc) = self.publisher_at(i);
            if block
                .alloc_state
                .compare_exchange(PORT_FREE, PORT_CLAIMED, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                block.init(service, history_capacity);
                block.alloc_state.store(PORT_ACTIVE, Ordering::Release);
                return Ok((NonNull::from(block), loc));
            }
        }
        Err(AxonError::ResourceExhausted(
            "publisher port blocks".to_string(),
        ))
    }

    /// Claim a subscriber block.
    pub(crate) fn claim_subscriber(
        &self,
        service: ServiceDescriptor,
    ) -> AxonResult<(NonNull<SubscriberPortData>, OffsetPtr)> {
        for i in 0..self.max_subscribers() {
            let (block, loc) = self.subscriber_at(i);
            if block
                .alloc_state
                .compare_exchange(PORT_FREE, PORT_CLAIMED, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                block.init(service);
                block.alloc_state.store(PORT_ACTIVE, Ordering::Release);
                return Ok((NonNull::from(block), loc));
            }
        }
        Err(AxonError::ResourceExhausted(
            "subscriber port blocks".to_string(),
        ))
    }

    /// Claim a notifier slot (slot 0 is the broker's and never returned).
    pub(crate) fn claim_notifier(&self) -> AxonResult<(NonNull<Notifier>, OffsetPtr)> {
        for i in 1..self.max_notifiers() {
            let (block, loc) = self.notifier_at(i);
            if block
                .slot_state
                .compare_exchange(
                    NOTIFIER_FREE,
                    NOTIFIER_ACTIVE,
                    Ordering::AcqRel,
                    Ordering::Relaxed,
                )
                .is_ok()
            {
                // Drain any stale wake state from a previous owner.
                block.poll();
                return Ok((NonNull::from(block), loc));
            }
        }
        Err(AxonError::ResourceExhausted("notifier slots".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MgmtConfig;

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

    fn small_cfg() -> MgmtConfig {
        MgmtConfig {
            max_publishers: 2,
            max_subscribers: 2,
            max_notifiers: 2,
        }
    }

    #[test]
    fn provision_and_reopen() {
        let name = unique_name("mgmt_prov");
        let mgmt = MgmtSegment::provision(&name, &small_cfg()).expect("provision");
        assert_eq!(mgmt.max_publishers(), 2);
        assert!(mgmt.segment().is_management());

        let reopened = MgmtSegment::open(Segment::open(&name).expect("open")).expect("wrap");
        assert_eq!(reopened.max_subscribers(), 2);
        assert_eq!(
            reopened.header().publishers_offset,
            mgmt.header().publishers_offset
        );
    }

    #[test]
    fn claims_exhaust_and_release() {
        let name = unique_name("mgmt_claim");
        let mgmt = MgmtSegment::provision(&name, &small_cfg()).expect("provision");
        let svc = ServiceDescriptor::new("a", "b", "c");

        let (_p0, loc0) = mgmt.claim_publisher(svc, 0).expect("first claim");
        let (_p1, loc1) = mgmt.claim_publisher(svc, 0).expect("second claim");
        assert_ne!(loc0, loc1);
        assert!(mgmt.claim_publisher(svc, 0).is_err(), "exhausted");

        // Reclaim one block the way the broker does and claim again.
        mgmt.publisher_at(0)
            .0
            .alloc_state
            .store(PORT_FREE, Ordering::Release);
        mgmt.claim_publisher(svc, 0).expect("claim after release");
    }

    #[test]
    fn broker_notifier_is_reserved() {
        let name = unique_name("mgmt_notif");
        let mgmt = MgmtSegment::provision(&name, &small_cfg()).expect("provision");
        let (_n, loc) = mgmt.claim_notifier().expect("slot 1 claimable");
        assert_ne!(loc, mgmt.notifier_at(0).1, "slot 0 never handed out");
        assert!(mgmt.claim_notifier().is_err(), "only one free slot");
    }
}
