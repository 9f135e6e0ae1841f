//! Criterion benchmarks for the hot data path.
//!
//! Measures the full loan → write → publish → pop → release cycle and its
//! pieces over a real shared-memory segment with one wired subscriber.
//! Discovery runs once during setup; the measured loop never touches it.

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use std::sync::Arc;

use axon_core::config::BrokerConfig;
use axon_core::discovery::engine::DiscoveryEngine;
use axon_core::memory::segment::{Segment, SegmentMap};
use axon_core::mgmt::MgmtSegment;
use axon_core::port::{PublisherOptions, PublisherPort, SubscriberPort, SubscriptionOptions};
use axon_core::runtime::Runtime;
use axon_core::ServiceDescriptor;

struct BenchWorld {
    publisher: PublisherPort,
    subscriber: SubscriberPort,
    _rt: Runtime,
    _engine: DiscoveryEngine,
    _segments: Vec<Arc<Segment>>,
}

fn setup(payload_pool: u32) -> BenchWorld {
    let tag = format!(
        "bench_{}_{}",
        std::process::id(),
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos()
    );
    let mut cfg = BrokerConfig::small(&tag);
    cfg.segments[0].pools[0].payload_size = payload_pool;
    cfg.segments[0].pools[0].count = 64;

    let mgmt = MgmtSegment::provision(&cfg.management_segment, &cfg.mgmt).unwrap();
    let mut segments = vec![Arc::clone(mgmt.segment())];
    for (i, seg_cfg) in cfg.segments.iter().enumerate() {
        segments.push(Segment::create(&seg_cfg.name, (i + 1) as u32, &seg_cfg.pools).unwrap());
    }
    let map = Arc::new(SegmentMap::new(segments.clone()).unwrap());
    let mut engine = DiscoveryEngine::new(mgmt, map);

    let payload_names: Vec<&str> = cfg.segments.iter().map(|s| s.name.as_str()).collect();
    let rt = Runtime::attach_local(&cfg.management_segment, &payload_names).unwrap();

    let service = ServiceDescriptor::new("bench", "main", "samples");
    let mut publisher = rt
        .create_publisher(service, PublisherOptions::default())
        .unwrap();
    let mut subscriber = rt.create_subscriber(service).unwrap();
    publisher.offer().unwrap();
    subscriber
        .subscribe(SubscriptionOptions {
            queue_capacity: 64,
            ..SubscriptionOptions::default()
        })
        .unwrap();
    engine.process();
    // Apply the wiring once so the measured loop is pure data path.
    publisher.update_connections();
    subscriber.process_discovery();

    BenchWorld {
        publisher,
        subscriber,
        _rt: rt,
        _engine: engine,
        _segments: segments,
    }
}

fn bench_roundtrip(c: &mut Criterion) {
    let mut group = c.benchmark_group("pubsub_roundtrip");
    for payload in [64u32, 1024] {
        let mut w = setup(payload.max(256));
        group.throughput(Throughput::Elements(1));
        group.bench_function(format!("{payload}B"), |b| {
            b.iter(|| {
                let mut chunk = w.publisher.loan(payload).unwrap();
                chunk.payload_mut()[0] = 1;
                w.publisher.publish(chunk);
                let received = w.subscriber.try_get_chunk().unwrap();
                black_box(received.payload()[0]);
                w.subscriber.release(received);
            })
        });
    }
    group.finish();
}

fn bench_loan_release(c: &mut Criterion) {
    let w = setup(256);
    c.bench_function("loan_release", |b| {
        b.iter(|| {
            let chunk = w.publisher.loan(black_box(64)).unwrap();
            w.publisher.release(chunk);
        })
    });
}

criterion_group!(benches, bench_roundtrip, bench_loan_release);
criterion_main!(benches);
