//! Cross-process delivery and crash-recovery test.
//!
//! The test binary re-invokes itself as a child process (env-var flag, the
//! same trick as the scheduler-facing tests): the parent provisions the
//! segments and plays broker + subscriber, the child attaches by name and
//! plays publisher. The child terminates with `std::process::exit` — no
//! destructors, no STOP_OFFER — so the parent also exercises the broker's
//! dead-process reaping and the rule that in-flight chunks outlive their
//! publisher.

mod common;

use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use axon_core::port::{PublisherOptions, SubscriptionOptions};
use axon_core::runtime::Runtime;
use axon_core::{ServiceDescriptor, SubscriptionState};

const CHILD_ENV: &str = "AXON_XPROC_CHILD";
const TAG_ENV: &str = "AXON_XPROC_TAG";
const COUNT_ENV: &str = "AXON_XPROC_COUNT";

const MSG_COUNT: u64 = 32;

fn svc() -> ServiceDescriptor {
    ServiceDescriptor::new("xproc", "main", "counters")
}

fn is_child() -> bool {
    std::env::var(CHILD_ENV).is_ok()
}

/// Child: attach, offer, wait for wiring, publish, die abruptly.
fn child_publish() -> ! {
    let tag = std::env::var(TAG_ENV).expect("AXON_XPROC_TAG not set");
    let count: u64 = std::env::var(COUNT_ENV)
        .expect("AXON_XPROC_COUNT not set")
        .parse()
        .expect("invalid count");

    let mgmt_name = format!("mgmt_{tag}");
    let payload_name = format!("payload_{tag}");
    let rt = Runtime::attach_local(&mgmt_name, &[&payload_name]).expect("child attach");

    let mut publisher = rt
        .create_publisher(svc(), PublisherOptions::default())
        .expect("child publisher");
    publisher.offer().expect("offer");

    // Wait until the parent's engine wires us to the subscriber.
    let deadline = Instant::now() + Duration::from_secs(10);
    while !publisher.has_subscribers() {
        assert!(Instant::now() < deadline, "child never got wired");
        std::thread::sleep(Duration::from_millis(5));
    }

    for i in 1..=count {
        let mut chunk = loop {
            match publisher.loan(16) {
                Ok(c) => break c,
                // Parent may briefly hold the whole pool; retry.
                Err(_) => std::thread::yield_now(),
            }
        };
        chunk.payload_mut()[..8].copy_from_slice(&i.to_le_bytes());
        publisher.publish(chunk);
    }

    println!("PUBLISHED:{count}");
    // Abrupt termination: no Drop for the port, no STOP_OFFER.
    std::process::exit(0);
}

#[test]
fn cross_process_delivery_and_abrupt_exit() {
    if is_child() {
        child_publish();
    }

    let tag = format!(
        "{}_{}",
        std::process::id(),
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos()
    );
    let mut w = common::world_with_tag(&tag);
    let initial_free = w.free_chunks(0);

    let mut subscriber = w.rt.create_subscriber(svc()).expect("subscriber");
    subscriber
        .subscribe(SubscriptionOptions {
            queue_capacity: 64,
            ..SubscriptionOptions::default()
        })
        .expect("subscribe");
    w.engine.process();

    let exe = std::env::current_exe().expect("current_exe");
    let mut child = Command::new(exe)
        .args(["cross_process_delivery_and_abrupt_exit", "--exact", "--nocapture"])
        .env(CHILD_ENV, "1")
        .env(TAG_ENV, &tag)
        .env(COUNT_ENV, MSG_COUNT.to_string())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .expect("spawn child");
    let child_pid = child.id();

    // Play broker and consumer until everything arrived.
    let mut received = Vec::new();
    let deadline = Instant::now() + Duration::from_secs(20);
    while received.len() < MSG_COUNT as usize {
        assert!(
            Instant::now() < deadline,
            "timed out with {} of {MSG_COUNT} samples",
            received.len()
        );
        w.engine.process();
        while let Some(chunk) = subscriber.try_get_chunk() {
            let mut buf = [0u8; 8];
            buf.copy_from_slice(&chunk.payload()[..8]);
            received.push(u64::from_le_bytes(buf));
            subscriber.release(chunk);
        }
        std::thread::sleep(Duration::from_millis(1));
    }

    assert_eq!(
        received,
        (1..=MSG_COUNT).collect::<Vec<_>>(),
        "cross-process FIFO with no loss (queue sized for the burst)"
    );

    let status = child.wait().expect("child exit");
    assert!(status.success(), "child crashed for the wrong reason");

    // The child never sent STOP_OFFER; the broker notices the dead pid.
    w.engine.reap_process(child_pid as u64);
    w.engine.process();
    assert_eq!(
        subscriber.state(),
        SubscriptionState::NotSubscribed,
        "synthetic disconnect after publisher death"
    );
    assert_eq!(
        w.free_chunks(0),
        initial_free,
        "all chunks back in the pool after the dead publisher's cleanup"
    );
}
