//! # AXON
//!
//! Zero-copy shared-memory pub/sub for single-host pipelines.
//!
//! This crate is the application-facing surface: it re-exports the core
//! runtime and adds a typed [`Publisher`]/[`Subscriber`] pair for
//! plain-old-data payloads, with RAII samples that release their chunk
//! references automatically.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use axon::prelude::*;
//!
//! #[repr(C)]
//! #[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
//! struct Detection {
//!     range_m: f32,
//!     bearing_rad: f32,
//! }
//!
//! let rt = Runtime::connect("radar-driver")?;
//! let mut publisher: Publisher<Detection> =
//!     Publisher::create(&rt, ServiceDescriptor::new("radar", "front", "objects"))?;
//! publisher.offer()?;
//!
//! let mut sample = publisher.loan()?;
//! sample.range_m = 17.4;
//! sample.bearing_rad = -0.2;
//! sample.publish();
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub use axon_core::{self, *};

// Re-export bytemuck so payload types can derive Pod/Zeroable without an
// extra dependency line.
pub use bytemuck;

mod typed;
pub use typed::{Publisher, Sample, SampleMut, Subscriber};

/// Everything you need to get started.
pub mod prelude {
    pub use crate::typed::{Publisher, Sample, SampleMut, Subscriber};
    pub use axon_core::{
        AxonError, AxonResult, OverflowPolicy, PublisherOptions, Runtime, ServiceDescriptor,
        SubscriptionOptions, SubscriptionState, WaitSet, Wake,
    };
}
