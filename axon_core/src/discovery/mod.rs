//! Discovery (CaPro): service identities, wire messages, per-port rings,
//! and the broker-side matching machinery.
//!
//! Ports never talk to each other directly about wiring — every OFFER /
//! STOP_OFFER / SUB / UNSUB goes through the broker, which matches and
//! answers with ACK_SUB / NACK_SUB / ACK_UNSUB and wiring requests. The
//! data path is unaffected: once wired, publishers push straight into
//! subscriber queues.

pub mod capro;
pub mod channel;
pub mod engine;
pub mod registry;
pub mod service;

pub use capro::{CaproKind, CaproMessage};
pub use channel::{CaproRing, CAPRO_RING_CAPACITY};
pub use engine::DiscoveryEngine;
pub use registry::{Action, ServiceRegistry};
pub use service::{
    ServiceClass, ServiceDescriptor, ServicePattern, ServiceString, SERVICE_STRING_CAPACITY,
};
