//! Typed configuration for AXON bring-up.
//!
//! The broker loads a [`BrokerConfig`] from TOML at startup and provisions
//! segments from it; everything is validated before any shared memory is
//! created, so a bad file can never leave half-built segments behind.
//!
//! ```toml
//! # axond.toml
//! [management]
//! max_publishers = 64
//! max_subscribers = 64
//! max_notifiers = 32
//!
//! [[segments]]
//! name = "default"
//!
//! [[segments.pools]]
//! payload_size = 256
//! count = 64
//!
//! [[segments.pools]]
//! payload_size = 4096
//! count = 16
//! ```

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::{AxonError, AxonResult};
use crate::memory::offset_ptr::MAX_SEGMENT_ID;

/// Upper bound for a single chunk payload (1 GiB).
pub const MAX_CHUNK_PAYLOAD: u32 = 1 << 30;

/// One fixed-size chunk pool inside a segment.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct PoolConfig {
    /// Payload capacity per chunk in bytes (the block adds the 48-byte
    /// chunk header on top).
    pub payload_size: u32,
    /// Number of chunks in the pool.
    pub count: u32,
}

/// One payload segment: a name plus its pools in priority order.
///
/// Pool order is meaningful — when several pools fit a payload equally well,
/// the first configured wins.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmentConfig {
    pub name: String,
    pub pools: Vec<PoolConfig>,
}

/// Sizing of the management segment (port control blocks and notifiers).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct MgmtConfig {
    pub max_publishers: u32,
    pub max_subscribers: u32,
    pub max_notifiers: u32,
}

impl Default for MgmtConfig {
    fn default() -> Self {
        Self {
            max_publishers: 64,
            max_subscribers: 64,
            max_notifiers: 32,
        }
    }
}

/// Complete broker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Name of the management segment.
    pub management_segment: String,
    #[serde(rename = "management")]
    pub mgmt: MgmtConfig,
    pub segments: Vec<SegmentConfig>,
    /// Control socket path; `None` uses the platform default.
    pub control_socket: Option<PathBuf>,
    /// Clients silent for longer than this are reaped.
    pub keepalive_timeout_ms: u64,
    /// Upper bound on the discovery loop's sleep between scans.
    pub discovery_interval_ms: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            management_segment: "mgmt".to_string(),
            mgmt: MgmtConfig::default(),
            segments: vec![SegmentConfig {
                name: "default".to_string(),
                pools: vec![
                    PoolConfig {
                        payload_size: 256,
                        count: 128,
                    },
                    PoolConfig {
                        payload_size: 4096,
                        count: 32,
                    },
                    PoolConfig {
                        payload_size: 65536,
                        count: 8,
                    },
                ],
            }],
            control_socket: None,
            keepalive_timeout_ms: 2000,
            discovery_interval_ms: 50,
        }
    }
}

impl BrokerConfig {
    /// A small configuration for tests: one segment, two modest pools.
    pub fn small(tag: &str) -> Self {
        Self {
            management_segment: format!("mgmt_{tag}"),
            mgmt: MgmtConfig {
                max_publishers: 8,
                max_subscribers: 8,
                max_notifiers: 4,
            },
            segments: vec![SegmentConfig {
                name: format!("payload_{tag}"),
                pools: vec![
                    PoolConfig {
                        payload_size: 256,
                        count: 8,
                    },
                    PoolConfig {
                        payload_size: 2048,
                        count: 4,
                    },
                ],
            }],
            control_socket: None,
            keepalive_timeout_ms: 500,
            discovery_interval_ms: 10,
        }
    }

    /// Validate everything the provisioner relies on. Returns the first
    /// violation found.
    pub fn validate(&self) -> AxonResult<()> {
        if self.segments.is_empty() {
            return Err(AxonError::config("at least one payload segment required"));
        }
        // Management segment id is 0; payload ids follow in config order.
        if self.segments.len() as u32 > MAX_SEGMENT_ID {
            return Err(AxonError::config("too many segments"));
        }
        let mut names: Vec<&str> = self
            .segments
            .iter()
            .map(|s| s.name.as_str())
            .chain(std::iter::once(self.management_segment.as_str()))
            .collect();
        names.sort_unstable();
        if names.windows(2).any(|w| w[0] == w[1]) {
            return Err(AxonError::config("segment names must be unique"));
        }
        for seg in &self.segments {
            if seg.name.is_empty() || seg.name.contains('\0') {
                return Err(AxonError::config(
                    "segment names must be non-empty and NUL-free",
                ));
            }
            if seg.pools.is_empty() {
                return Err(AxonError::config(format!(
                    "segment '{}' has no pools",
                    seg.name
                )));
            }
            for pool in &seg.pools {
                if pool.payload_size == 0 || pool.count == 0 {
                    return Err(AxonError::config(format!(
                        "segment '{}': pool sizes and counts must be nonzero",
                        seg.name
                    )));
                }
                if pool.payload_size > MAX_CHUNK_PAYLOAD {
                    return Err(AxonError::config(format!(
                        "segment '{}': payload_size {} exceeds maximum {}",
                        seg.name, pool.payload_size, MAX_CHUNK_PAYLOAD
                    )));
                }
            }
        }
        let m = &self.mgmt;
        if m.max_publishers == 0 || m.max_subscribers == 0 {
            return Err(AxonError::config("management port counts must be nonzero"));
        }
        if m.max_publishers > 4096 || m.max_subscribers > 4096 || m.max_notifiers > 4096 {
            return Err(AxonError::config("management counts limited to 4096"));
        }
        if self.keepalive_timeout_ms == 0 {
            return Err(AxonError::config("keepalive_timeout_ms must be nonzero"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_valid() {
        BrokerConfig::default().validate().expect("default config");
        BrokerConfig::small("t").validate().expect("small config");
    }

    #[test]
    fn rejects_zero_sized_pool() {
        let mut cfg = BrokerConfig::default();
        cfg.segments[0].pools[0].count = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_duplicate_names() {
        let mut cfg = BrokerConfig::default();
        cfg.management_segment = "default".to_string();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn toml_roundtrip_shape() {
        let toml = r#"
            management_segment = "mgmt"

            [management]
            max_publishers = 16

            [[segments]]
            name = "sensors"

            [[segments.pools]]
            payload_size = 512
            count = 32
        "#;
        let cfg: BrokerConfig = toml::from_str(toml).expect("parse");
        assert_eq!(cfg.mgmt.max_publishers, 16);
        assert_eq!(cfg.mgmt.max_subscribers, 64, "defaults fill the gaps");
        assert_eq!(cfg.segments[0].pools[0].payload_size, 512);
        cfg.validate().expect("valid");
    }
}
