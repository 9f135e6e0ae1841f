//! CaPro discovery messages.
//!
//! Fixed-size POD records exchanged between ports and the broker over the
//! per-port rings in `channel.rs`. One message type covers both directions:
//!
//! - port → broker: OFFER, STOP_OFFER, SUB, UNSUB
//! - broker → subscriber: ACK_SUB, NACK_SUB, ACK_UNSUB, STOP_OFFER (synthetic
//!   disconnect)
//! - broker → publisher: SUB (wire this subscriber), UNSUB (unwire)
//!
//! `port` names the counterpart's control block: the subscriber port for
//! SUB/UNSUB toward a publisher, the publisher port for ACK_SUB/STOP_OFFER
//! toward a subscriber.

use crate::discovery::service::ServiceDescriptor;
use crate::memory::offset_ptr::OffsetPtr;

/// Message discriminant.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaproKind {
    Offer = 1,
    StopOffer = 2,
    Sub = 3,
    Unsub = 4,
    AckSub = 5,
    NackSub = 6,
    AckUnsub = 7,
}

impl CaproKind {
    pub fn from_u32(v: u32) -> Option<Self> {
        Some(match v {
            1 => CaproKind::Offer,
            2 => CaproKind::StopOffer,
            3 => CaproKind::Sub,
            4 => CaproKind::Unsub,
            5 => CaproKind::AckSub,
            6 => CaproKind::NackSub,
            7 => CaproKind::AckUnsub,
            _ => return None,
        })
    }
}

/// One discovery message (POD, fixed size, lives in ring slots).
#[repr(C)]
#[derive(Clone, Copy)]
pub struct CaproMessage {
    kind: u32,
    /// Replay depth requested with SUB; zero otherwise.
    pub history_request: u32,
    pub service: ServiceDescriptor,
    _pad: u32,
    /// The counterpart port's control block, or `OffsetPtr::new(0, 0)` when
    /// the message carries none (OFFER / STOP_OFFER from the owner).
    pub port: OffsetPtr,
    /// Stamped by the ring on push; diagnostic ordering only.
    pub seq: u64,
}

const _: () = assert!(std::mem::size_of::<CaproMessage>() == 88);

impl CaproMessage {
    fn new(kind: CaproKind, service: ServiceDescriptor) -> Self {
        Self {
            kind: kind as u32,
            history_request: 0,
            service,
            _pad: 0,
            port: OffsetPtr::new(0, 0),
            seq: 0,
        }
    }

    pub fn offer(service: ServiceDescriptor) -> Self {
        Self::new(CaproKind::Offer, service)
    }

    pub fn stop_offer(service: ServiceDescriptor) -> Self {
        Self::new(CaproKind::StopOffer, service)
    }

    pub fn sub(service: ServiceDescriptor, subscriber: OffsetPtr, history_request: u32) -> Self {
        let mut m = Self::new(CaproKind::Sub, service);
        m.port = subscriber;
        m.history_request = history_request;
        m
    }

    pub fn unsub(service: ServiceDescriptor, subscriber: OffsetPtr) -> Self {
        let mut m = Self::new(CaproKind::Unsub, service);
        m.port = subscriber;
        m
    }

    pub fn ack_sub(service: ServiceDescriptor, publisher: OffsetPtr) -> Self {
        let mut m = Self::new(CaproKind::AckSub, service);
        m.port = publisher;
        m
    }

    pub fn nack_sub(service: ServiceDescriptor) -> Self {
        Self::new(CaproKind::NackSub, service)
    }

    pub fn ack_unsub(service: ServiceDescriptor) -> Self {
        Self::new(CaproKind::AckUnsub, service)
    }

    /// Synthetic disconnect toward a bound subscriber.
    pub fn stop_offer_from(service: ServiceDescriptor, publisher: OffsetPtr) -> Self {
        let mut m = Self::new(CaproKind::StopOffer, service);
        m.port = publisher;
        m
    }

    /// Decoded kind; `None` for a corrupt discriminant (skipped by readers).
    pub fn kind(&self) -> Option<CaproKind> {
        CaproKind::from_u32(self.kind)
    }
}

impl std::fmt::Debug for CaproMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "CaPro[{:?} {:?} port={:?} hist={}]",
            self.kind(),
            self.service,
            self.port,
            self.history_request
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_roundtrip() {
        for kind in [
            CaproKind::Offer,
            CaproKind::StopOffer,
            CaproKind::Sub,
            CaproKind::Unsub,
            CaproKind::AckSub,
            CaproKind::NackSub,
            CaproKind::AckUnsub,
        ] {
            assert_eq!(CaproKind::from_u32(kind as u32), Some(kind));
        }
        assert_eq!(CaproKind::from_u32(0), None);
        assert_eq!(CaproKind::from_u32(99), None);
    }

    #[test]
    fn sub_carries_port_and_history() {
        let svc = ServiceDescriptor::new("radar", "front", "objects");
        let port = OffsetPtr::new(0, 0x4000);
        let m = CaproMessage::sub(svc, port, 3);
        assert_eq!(m.kind(), Some(CaproKind::Sub));
        assert_eq!(m.port, port);
        assert_eq!(m.history_request, 3);
        assert!(m.service.same_topic(&svc));
    }
}
