//! Unified error handling for AXON.
//!
//! Control-path operations (attach, subscribe, port construction, discovery)
//! return [`AxonResult`]. Data-path operations (`loan`, `publish`,
//! `try_get_chunk`, `release`) never allocate and never panic; they use the
//! small `Copy` enums in this module ([`LoanError`]) or encode the outcome in
//! counters (queue overflow is visible through the subscriber's overflow
//! counter, never as an error).
//!
//! Invariant violations (refcount underflow, freeing a chunk into the wrong
//! pool) mean shared memory is corrupt and no further progress is safe; they
//! terminate the process through [`fatal_invariant`].

use thiserror::Error;

/// Main error type for AXON control-path operations.
#[derive(Debug, Error)]
pub enum AxonError {
    /// I/O errors from the OS (mapping files, control socket).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration parsing or validation errors.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A named shared-memory segment could not be created, opened, or
    /// validated. Environmental and fatal to the affected process.
    #[error("Segment '{name}' unavailable: {reason}")]
    SegmentUnavailable { name: String, reason: String },

    /// An offset pointer does not fall inside any mapped segment, or falls
    /// outside the bounds of the segment it names.
    #[error("Address out of segment: segment {segment_id}, offset {offset:#x}")]
    AddressOutOfSegment { segment_id: u32, offset: u64 },

    /// Control operation on a port that is not in the required state.
    #[error("Port not subscribed")]
    PortNotSubscribed,

    /// Control operation on a port whose control block was already released.
    #[error("Port already destroyed")]
    PortAlreadyDestroyed,

    /// Control operation that is not legal in the port's current state
    /// (e.g. subscribing a port that is already subscribed).
    #[error("Port in invalid state: {0}")]
    InvalidPortState(&'static str),

    /// A port control block or notifier slot could not be claimed because
    /// the management segment is exhausted.
    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    /// A discovery ring dropped messages; the broker resynchronizes from a
    /// state snapshot, but the requesting call surfaces the condition.
    #[error("Discovery channel overflow on {0}")]
    DiscoveryChannelOverflow(String),

    /// The broker rejected a subscription (NACK_SUB).
    #[error("Subscription rejected: {0}")]
    SubscriptionRejected(String),

    /// Broker handshake / control socket errors.
    #[error("Runtime error: {0}")]
    Runtime(String),
}

impl AxonError {
    /// Create a configuration error with a custom message.
    pub fn config<S: Into<String>>(msg: S) -> Self {
        AxonError::Config(msg.into())
    }

    /// Create a segment-unavailable error.
    pub fn segment<S: Into<String>, T: Into<String>>(name: S, reason: T) -> Self {
        AxonError::SegmentUnavailable {
            name: name.into(),
            reason: reason.into(),
        }
    }

    /// Create a runtime (broker connection) error.
    pub fn runtime<S: Into<String>>(msg: S) -> Self {
        AxonError::Runtime(msg.into())
    }

    /// Whether this error class is unrecoverable for the affected process.
    ///
    /// Segment mapping failures and out-of-segment addresses indicate the
    /// process no longer shares a coherent view of the memory layout.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            AxonError::SegmentUnavailable { .. } | AxonError::AddressOutOfSegment { .. }
        )
    }
}

/// Convenience type alias for Results using AxonError.
pub type AxonResult<T> = std::result::Result<T, AxonError>;

/// Loan-time resource exhaustion. Recoverable by the caller (retry, back
/// off, or drop the sample). `Copy` so the data path stays allocation-free.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoanError {
    /// Every pool that could fit the payload is drained.
    PoolEmpty,
    /// No configured pool is large enough for the requested payload.
    NoPoolFitsSize,
}

impl std::fmt::Display for LoanError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LoanError::PoolEmpty => write!(f, "chunk pool empty"),
            LoanError::NoPoolFitsSize => write!(f, "no chunk pool fits requested size"),
        }
    }
}

impl std::error::Error for LoanError {}

/// Terminate the process after an invariant violation in shared memory.
///
/// Refcount underflow and pool-mismatch frees mean the shared state is
/// corrupt; continuing would hand corrupted chunks to other processes.
/// This aborts rather than panics so no unwinding runs over poisoned state.
#[cold]
pub fn fatal_invariant(msg: &str) -> ! {
    log::error!("fatal invariant violation: {msg}");
    eprintln!("[AXON FATAL] {msg}");
    std::process::abort();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatal_classification() {
        assert!(AxonError::segment("payload_0", "mmap failed").is_fatal());
        assert!(AxonError::AddressOutOfSegment {
            segment_id: 1,
            offset: 0xfff
        }
        .is_fatal());
        assert!(!AxonError::PortNotSubscribed.is_fatal());
        assert!(!AxonError::config("bad pool size").is_fatal());
    }

    #[test]
    fn loan_error_display() {
        assert_eq!(LoanError::PoolEmpty.to_string(), "chunk pool empty");
    }
}
