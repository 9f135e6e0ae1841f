//! Shared harness for integration tests: provisions a small broker-side
//! world (segments + management + discovery engine) and a client-side
//! runtime attached to the same segments through its own mappings, so
//! offset-pointer relocation is exercised even in-process.
#![allow(dead_code)] // each test binary uses a subset of the harness

use std::sync::Arc;

use axon_core::config::BrokerConfig;
use axon_core::discovery::engine::DiscoveryEngine;
use axon_core::memory::segment::{Segment, SegmentMap};
use axon_core::mgmt::MgmtSegment;
use axon_core::runtime::Runtime;

pub struct TestWorld {
    pub cfg: BrokerConfig,
    pub engine: DiscoveryEngine,
    pub rt: Runtime,
    /// Broker-side segment handles; dropping them unlinks the shm files.
    _segments: Vec<Arc<Segment>>,
}

/// Provision a fresh world under a unique name.
pub fn world() -> TestWorld {
    let tag = format!(
        "{}_{}",
        std::process::id(),
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos()
    );
    world_with_tag(&tag)
}

pub fn world_with_tag(tag: &str) -> TestWorld {
    let cfg = BrokerConfig::small(tag);
    cfg.validate().expect("small config is valid");

    let mgmt = MgmtSegment::provision(&cfg.management_segment, &cfg.mgmt).expect("mgmt segment");
    let mut segments = vec![Arc::clone(mgmt.segment())];
    for (i, seg_cfg) in cfg.segments.iter().enumerate() {
        segments.push(
            Segment::create(&seg_cfg.name, (i + 1) as u32, &seg_cfg.pools)
                .expect("payload segment"),
        );
    }
    let map = Arc::new(SegmentMap::new(segments.clone()).expect("segment map"));
    let engine = DiscoveryEngine::new(mgmt, map);

    let payload_names: Vec<&str> = cfg.segments.iter().map(|s| s.name.as_str()).collect();
    let rt = Runtime::attach_local(&cfg.management_segment, &payload_names).expect("attach");

    TestWorld {
        cfg,
        engine,
        rt,
        _segments: segments,
    }
}

impl TestWorld {
    /// Free-chunk count of pool `pool` in the first payload segment.
    pub fn free_chunks(&self, pool: u32) -> u32 {
        self.rt
            .segment_map()
            .segment(1)
            .expect("payload segment mapped")
            .pool(pool)
            .expect("pool exists")
            .descriptor()
            .free_chunks()
    }
}
