//! # AXON Core
//!
//! Zero-copy shared-memory publish/subscribe for single-host pipelines.
//!
//! Publishers loan fixed-size chunks straight out of shared-memory pools,
//! write payloads in place, and publish by fanning a *reference* out to each
//! subscriber's lock-free queue — no serialization, no copies, no kernel
//! round-trip per sample. A broker process (`axond`) provisions the memory
//! and runs discovery; it is never on the data path.
//!
//! Building blocks, leaves first:
//!
//! - **memory** — named segments with a self-describing layout, relocatable
//!   `(segment, offset)` pointers, and lock-free chunk pools with atomic
//!   reference counts
//! - **port** — publisher/subscriber control blocks in shared memory:
//!   loan/publish/pop/release, bounded delivery queues with overflow
//!   policies, and a history cache for late joiners
//! - **discovery** — the CaPro protocol between ports and the broker
//!   (OFFER/SUB/ACK...), plus the broker-side matching engine
//! - **waitset** — block one thread on many queues through a shared
//!   semaphore + bitset notifier
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use axon_core::{Runtime, ServiceDescriptor, PublisherOptions};
//!
//! let rt = Runtime::connect("sensor-fusion")?;
//! let mut publisher = rt.create_publisher(
//!     ServiceDescriptor::new("radar", "front", "objects"),
//!     PublisherOptions::default(),
//! )?;
//! publisher.offer()?;
//!
//! let mut chunk = publisher.loan(256)?;
//! chunk.payload_mut()[..4].copy_from_slice(&[1, 2, 3, 4]);
//! publisher.publish(chunk);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod config;
pub mod discovery;
pub mod error;
pub mod memory;
pub mod mgmt;
pub mod port;
pub mod runtime;
pub mod waitset;

// The surface most applications need.
pub use config::{BrokerConfig, MgmtConfig, PoolConfig, SegmentConfig};
pub use discovery::{DiscoveryEngine, ServiceClass, ServiceDescriptor, ServicePattern};
pub use error::{AxonError, AxonResult, LoanError};
pub use memory::{Chunk, OffsetPtr, SegmentMap, SegmentStats};
pub use port::{
    OverflowPolicy, PublisherOptions, PublisherPort, SubscriberPort, SubscriptionOptions,
    SubscriptionState,
};
pub use runtime::Runtime;
pub use waitset::{UserTrigger, WaitSet, Wake};
