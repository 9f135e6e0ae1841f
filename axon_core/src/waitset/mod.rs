//! Multi-source blocking: shared semaphore, notifier bitset, waitset.
//!
//! The notifier is the shared primitive (producers arm it); the waitset is
//! the subscriber-side object that owns trigger bindings and parks on it.

pub mod notifier;
pub mod semaphore;
#[allow(clippy::module_inception)]
pub mod waitset;

pub use notifier::{FiredTriggers, Notifier, Wake, MAX_TRIGGERS};
pub use semaphore::ShmSemaphore;
pub use waitset::{UserTrigger, WaitSet};
