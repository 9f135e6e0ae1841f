//! Broker provisioning round-trips: bring segments up from a config,
//! attach a client, tear down, verify cleanup.

use axon_broker::{provision, BrokerError};
use axon_core::memory::segment::Segment;
use axon_core::runtime::Runtime;
use axon_core::BrokerConfig;

fn unique_tag() -> String {
    format!(
        "{}_{}",
        std::process::id(),
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos()
    )
}

#[test]
fn provision_creates_attachable_segments() {
    let tag = unique_tag();
    let cfg = BrokerConfig::small(&tag);

    let provisioned = provision(&cfg).expect("provision");
    assert_eq!(provisioned.payload_names.len(), 1);

    // A client can attach by name and see the configured pools.
    let payload_names: Vec<&str> = provisioned.payload_names.iter().map(|s| s.as_str()).collect();
    let rt = Runtime::attach_local(&cfg.management_segment, &payload_names).expect("attach");
    let stats = rt.stats();
    assert_eq!(stats.len(), 1);
    assert_eq!(stats[0].pools.len(), 2);
    assert_eq!(stats[0].pools[0].free_chunks, 8);

    // Teardown unlinks everything.
    drop(rt);
    drop(provisioned);
    assert!(Segment::open(&cfg.management_segment).is_err());
    assert!(Segment::open(&cfg.segments[0].name).is_err());
}

#[test]
fn provision_survives_stale_files_from_a_crashed_run() {
    let tag = unique_tag();
    let cfg = BrokerConfig::small(&tag);

    // Simulate a crash: segments exist, nobody owns them.
    {
        let first = provision(&cfg).expect("first provision");
        // Leak the handles so Drop never unlinks.
        std::mem::forget(first);
    }
    let second = provision(&cfg).expect("second provision cleans stale files");
    drop(second);
}

#[test]
fn invalid_config_is_rejected_before_any_allocation() {
    let tag = unique_tag();
    let mut cfg = BrokerConfig::small(&tag);
    cfg.segments[0].pools.clear();

    match provision(&cfg) {
        Err(BrokerError::Config(_)) => {}
        Err(other) => panic!("expected a config error, got {other}"),
        Ok(_) => panic!("expected a config error, got provisioned segments"),
    }
    // Nothing was created.
    assert!(Segment::open(&cfg.management_segment).is_err());
}
