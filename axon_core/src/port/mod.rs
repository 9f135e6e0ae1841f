//! Ports: the per-endpoint control blocks and their process-local handles.
//!
//! Port control blocks live in the management segment. The owning process
//! holds a [`PublisherPort`] / [`SubscriberPort`] handle; the broker reads
//! the discovery-visible fields and writes the inbox rings; remote
//! publishers push into a subscriber's delivery queue. Every field is
//! reachable by role:
//!
//! - owner-only: history cache, connection list, sequence counter, pops
//! - broker-only: inbox rings (as writer), registry bookkeeping
//! - shared: delivery queue (publishers push, owner pops), refcounts

pub mod history;
pub mod publisher;
pub mod queue;
pub mod subscriber;

pub use history::{HistoryCache, MAX_HISTORY_DEPTH};
pub use publisher::{PublisherOptions, PublisherPort, MAX_SUBSCRIBERS_PER_PUBLISHER};
pub use queue::{ChunkQueue, OverflowPolicy, MAX_QUEUE_CAPACITY};
pub use subscriber::{SubscriberPort, SubscriptionOptions, SubscriptionState};

use std::sync::atomic::{AtomicU64, Ordering};

// Port block allocation states (management-segment bookkeeping).
pub(crate) const PORT_FREE: u32 = 0;
pub(crate) const PORT_CLAIMED: u32 = 1;
pub(crate) const PORT_ACTIVE: u32 = 2;
/// Owner is gone (dropped or died); the broker reclaims the block.
pub(crate) const PORT_ZOMBIE: u32 = 3;

/// Draw a process-unique port id: pid in the high 32 bits, a monotonic
/// counter below. Unique per host for the lifetime of the port.
pub(crate) fn unique_port_id() -> u64 {
    static COUNTER: AtomicU64 = AtomicU64::new(1);
    ((std::process::id() as u64) << 32) | COUNTER.fetch_add(1, Ordering::Relaxed)
}
