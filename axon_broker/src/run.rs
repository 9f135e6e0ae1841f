//! Broker bring-up and the main discovery loop.
//!
//! Bring-up order: validate configuration, clean stale segment files from a
//! crashed previous run, create payload segments, provision the management
//! segment, bind the control socket. Only then do clients get answers to
//! REGISTER — nobody ever observes a half-built layout.
//!
//! The main loop parks on the broker notifier (armed by every port that
//! pushes discovery traffic) with the configured interval as an upper
//! bound, runs a discovery pass, applies control-socket events, and sweeps
//! for silent clients.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{channel, Receiver};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axon_core::memory::segment::{Segment, SegmentMap};
use axon_core::memory::shm_region::ShmRegion;
use axon_core::mgmt::MgmtSegment;
use axon_core::{BrokerConfig, DiscoveryEngine};

use crate::control::{ClientEvent, ControlServer, WelcomeInfo};
use crate::process::ClientRegistry;

/// Broker failure classes, mapped to distinct exit codes in `main`.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("configuration invalid: {0}")]
    Config(String),
    #[error("segment allocation failed: {0}")]
    SegmentAllocation(String),
    #[error("control endpoint failed: {0}")]
    Control(String),
}

/// Everything the broker provisioned; dropping it unlinks the segments.
pub struct Provisioned {
    pub mgmt: MgmtSegment,
    pub map: Arc<SegmentMap>,
    pub payload_names: Vec<String>,
    /// Keeps payload segments (and their backing files) alive.
    _segments: Vec<Arc<Segment>>,
}

/// Validate the configuration and build every segment.
pub fn provision(cfg: &BrokerConfig) -> Result<Provisioned, BrokerError> {
    cfg.validate().map_err(|e| BrokerError::Config(e.to_string()))?;

    // A crashed run leaves segment files behind; create() is exclusive, so
    // clean first.
    ShmRegion::unlink(&cfg.management_segment);
    for seg in &cfg.segments {
        ShmRegion::unlink(&seg.name);
    }

    let mgmt = MgmtSegment::provision(&cfg.management_segment, &cfg.mgmt)
        .map_err(|e| BrokerError::SegmentAllocation(e.to_string()))?;

    let mut segments = vec![Arc::clone(mgmt.segment())];
    let mut payload_names = Vec::new();
    for (i, seg_cfg) in cfg.segments.iter().enumerate() {
        let seg = Segment::create(&seg_cfg.name, (i + 1) as u32, &seg_cfg.pools)
            .map_err(|e| BrokerError::SegmentAllocation(e.to_string()))?;
        log::info!(
            "segment '{}' up: {} pools, {} bytes",
            seg_cfg.name,
            seg_cfg.pools.len(),
            seg.size()
        );
        payload_names.push(seg_cfg.name.clone());
        segments.push(seg);
    }

    let map = Arc::new(
        SegmentMap::new(segments.clone())
            .map_err(|e| BrokerError::SegmentAllocation(e.to_string()))?,
    );

    Ok(Provisioned {
        mgmt,
        map,
        payload_names,
        _segments: segments,
    })
}

/// Run the broker until `shutdown` is set. Returns on clean shutdown.
pub fn run(cfg: BrokerConfig, shutdown: Arc<AtomicBool>) -> Result<(), BrokerError> {
    let provisioned = provision(&cfg)?;
    let mut engine = DiscoveryEngine::new(provisioned.mgmt.clone(), Arc::clone(&provisioned.map));

    let socket_path = cfg
        .control_socket
        .clone()
        .unwrap_or_else(axon_core::memory::default_control_socket);
    let (event_tx, event_rx) = channel();
    let _control = ControlServer::start(
        &socket_path,
        WelcomeInfo {
            management_segment: cfg.management_segment.clone(),
            payload_segments: provisioned.payload_names.clone(),
        },
        event_tx,
    )
    .map_err(|e| BrokerError::Control(e.to_string()))?;

    let mut clients = ClientRegistry::new();
    let keepalive_timeout = Duration::from_millis(cfg.keepalive_timeout_ms);
    let interval = Duration::from_millis(cfg.discovery_interval_ms.max(1));
    let broker_notifier = provisioned.mgmt.broker_notifier();
    let mut last_sweep = Instant::now();
    let mut last_stats = Instant::now();

    log::info!("axond ready ({} payload segments)", provisioned.payload_names.len());

    while !shutdown.load(Ordering::Acquire) {
        // Park until a port pokes us or the interval elapses.
        // SAFETY: the broker notifier lives in the management segment, which
        // `provisioned` keeps alive for the whole loop.
        unsafe { broker_notifier.as_ref() }.wait_until(Some(Instant::now() + interval));

        apply_events(&event_rx, &mut clients, &mut engine);
        engine.process();

        if last_sweep.elapsed() >= keepalive_timeout / 2 {
            last_sweep = Instant::now();
            for pid in clients.stale_clients(keepalive_timeout) {
                log::warn!("client pid {pid} went silent; reaping its ports");
                clients.remove(pid);
                engine.reap_process(pid as u64);
            }
        }

        if last_stats.elapsed() >= Duration::from_secs(30) {
            last_stats = Instant::now();
            log_stats(&engine, &clients, &provisioned);
        }
    }

    log::info!("shutting down: disconnecting ports, waking waitsets");
    engine.shutdown();
    Ok(())
}

fn apply_events(
    events: &Receiver<ClientEvent>,
    clients: &mut ClientRegistry,
    engine: &mut DiscoveryEngine,
) {
    while let Ok(event) = events.try_recv() {
        match event {
            ClientEvent::Registered { pid, name } => clients.register(pid, name),
            ClientEvent::Keepalive { pid } => clients.keepalive(pid),
            ClientEvent::Disconnected { pid } => {
                if clients.remove(pid) {
                    engine.reap_process(pid as u64);
                }
            }
        }
    }
}

fn log_stats(engine: &DiscoveryEngine, clients: &ClientRegistry, provisioned: &Provisioned) {
    let registry = engine.registry();
    log::info!(
        "{} clients, {} offers, {} subscriptions",
        clients.len(),
        registry.offer_count(),
        registry.subscription_count()
    );
    for seg in provisioned.map.stats() {
        for pool in &seg.pools {
            log::debug!(
                "  {}: {}B x{} used={} watermark={}",
                seg.name,
                pool.chunk_size,
                pool.chunk_count,
                pool.used_chunks,
                pool.high_watermark
            );
        }
    }
}
