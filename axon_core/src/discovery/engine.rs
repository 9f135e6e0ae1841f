//! The discovery engine: the broker's bridge between port rings and the
//! registry.
//!
//! One [`DiscoveryEngine::process`] pass drains every active port's outbox
//! into the [`ServiceRegistry`], applies the resulting actions to the
//! affected ports' inboxes, reclaims ZOMBIE port blocks, and resynchronizes
//! any port whose outbox overflowed (the ring's dropped counter moved) from
//! the port's discovery-visible state instead of the lost messages.
//!
//! The engine is plain synchronous code so tests can run a broker inline;
//! the `axond` daemon wraps it in a loop parked on the broker notifier.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::discovery::capro::{CaproKind, CaproMessage};
use crate::discovery::registry::{Action, ServiceRegistry};
use crate::memory::offset_ptr::OffsetPtr;
use crate::memory::segment::SegmentMap;
use crate::mgmt::MgmtSegment;
use crate::port::publisher::PublisherPortData;
use crate::port::subscriber::{SubscriberPortData, SubscriptionState};
use crate::port::{PORT_ACTIVE, PORT_FREE, PORT_ZOMBIE};

/// Broker-side discovery driver.
pub struct DiscoveryEngine {
    mgmt: MgmtSegment,
    map: Arc<SegmentMap>,
    registry: ServiceRegistry,
    actions: Vec<Action>,
}

impl DiscoveryEngine {
    pub fn new(mgmt: MgmtSegment, map: Arc<SegmentMap>) -> Self {
        Self {
            mgmt,
            map,
            registry: ServiceRegistry::new(),
            actions: Vec::new(),
        }
    }

    pub fn mgmt(&self) -> &MgmtSegment {
        &self.mgmt
    }

    pub fn registry(&self) -> &ServiceRegistry {
        &self.registry
    }

    /// One full pass. Returns the number of discovery messages handled.
    pub fn process(&mut self) -> usize {
        let mgmt = self.mgmt.clone();
        let mut handled = 0;

        for i in 0..mgmt.max_publishers() {
            let (block, loc) = mgmt.publisher_at(i);
            match block.alloc_state.load(Ordering::Acquire) {
                PORT_ACTIVE => handled += self.drain_publisher(block, loc),
                PORT_ZOMBIE => {
                    self.reclaim_publisher(block, loc);
                    handled += 1;
                }
                _ => {}
            }
        }

        for i in 0..mgmt.max_subscribers() {
            let (block, loc) = mgmt.subscriber_at(i);
            match block.alloc_state.load(Ordering::Acquire) {
                PORT_ACTIVE => handled += self.drain_subscriber(block, loc),
                PORT_ZOMBIE => {
                    self.reclaim_subscriber(block, loc);
                    handled += 1;
                }
                _ => {}
            }
        }

        self.apply_actions();
        handled
    }

    /// Crash cleanup: reclaim every port owned by `pid`, synthesizing the
    /// discovery traffic the dead process can no longer send and releasing
    /// the chunk references it left behind. Queued deliveries already made
    /// to other processes stay valid — pools outlive publishers.
    pub fn reap_process(&mut self, pid: u64) {
        let mgmt = self.mgmt.clone();
        for i in 0..mgmt.max_publishers() {
            let (block, loc) = mgmt.publisher_at(i);
            let state = block.alloc_state.load(Ordering::Acquire);
            if state != PORT_FREE && block.owner_pid.load(Ordering::Relaxed) == pid {
                log::info!("reaping publisher port of dead process {pid}");
                self.reclaim_publisher(block, loc);
            }
        }
        for i in 0..mgmt.max_subscribers() {
            let (block, loc) = mgmt.subscriber_at(i);
            let state = block.alloc_state.load(Ordering::Acquire);
            if state != PORT_FREE && block.owner_pid.load(Ordering::Relaxed) == pid {
                log::info!("reaping subscriber port of dead process {pid}");
                self.reclaim_subscriber(block, loc);
            }
        }
        self.apply_actions();
    }

    /// Broker shutdown: disconnect everything and wake every waitset with
    /// the terminal sentinel.
    pub fn shutdown(&mut self) {
        let mgmt = self.mgmt.clone();
        for i in 0..mgmt.max_publishers() {
            let (block, loc) = mgmt.publisher_at(i);
            if block.alloc_state.load(Ordering::Acquire) != PORT_FREE {
                self.registry.on_publisher_gone(loc, &mut self.actions);
            }
        }
        self.apply_actions();
        for i in 0..mgmt.max_notifiers() {
            mgmt.notifier_at(i).0.close();
        }
    }

    fn drain_publisher(&mut self, block: &PublisherPortData, loc: OffsetPtr) -> usize {
        let mut handled = 0;
        while let Some(msg) = block.outbox.pop() {
            handled += 1;
            match msg.kind() {
                Some(CaproKind::Offer) => {
                    self.registry.on_offer(msg.service, loc, &mut self.actions)
                }
                Some(CaproKind::StopOffer) => {
                    self.registry
                        .on_stop_offer(msg.service, loc, &mut self.actions)
                }
                other => log::warn!("publisher outbox carried {other:?}, ignoring"),
            }
        }
        if block.outbox.take_dropped() > 0 {
            log::warn!("publisher discovery overflow; resyncing from port state");
            self.resync_publisher(block, loc);
        }
        handled
    }

    fn drain_subscriber(&mut self, block: &SubscriberPortData, loc: OffsetPtr) -> usize {
        let mut handled = 0;
        while let Some(msg) = block.outbox.pop() {
            handled += 1;
            match msg.kind() {
                Some(CaproKind::Sub) => self.registry.on_sub(
                    msg.service,
                    msg.port,
                    msg.history_request,
                    &mut self.actions,
                ),
                Some(CaproKind::Unsub) => {
                    self.registry.on_unsub(msg.service, msg.port, &mut self.actions)
                }
                other => log::warn!("subscriber outbox carried {other:?}, ignoring"),
            }
        }
        if block.outbox.take_dropped() > 0 {
            log::warn!("subscriber discovery overflow; resyncing from port state");
            self.resync_subscriber(block, loc);
        }
        handled
    }

    /// Rebuild a publisher's registry state from its offering flag.
    fn resync_publisher(&mut self, block: &PublisherPortData, loc: OffsetPtr) {
        let service = block.service();
        match (block.is_offering(), self.registry.has_offer(&service, loc)) {
            (true, false) => self.registry.on_offer(service, loc, &mut self.actions),
            (false, true) => self.registry.on_stop_offer(service, loc, &mut self.actions),
            _ => {}
        }
    }

    /// Rebuild a subscriber's registry state from its state machine.
    fn resync_subscriber(&mut self, block: &SubscriberPortData, loc: OffsetPtr) {
        let service = block.service();
        let wants = matches!(
            block.state(),
            SubscriptionState::SubscribeRequested | SubscriptionState::Subscribed
        );
        match (wants, self.registry.has_subscription(&service, loc)) {
            (true, false) => self.registry.on_sub(
                service,
                loc,
                block.history_request(),
                &mut self.actions,
            ),
            (false, true) => self.registry.on_unsub(service, loc, &mut self.actions),
            _ => {}
        }
    }

    /// Registry cleanup + chunk-reference cleanup + slot reuse for a
    /// finished publisher block.
    fn reclaim_publisher(&mut self, block: &PublisherPortData, loc: OffsetPtr) {
        self.registry.on_publisher_gone(loc, &mut self.actions);
        // A graceful drop already drained the history; after a crash the
        // references are still here.
        block.history.drain(|entry| self.release_encoded(entry));
        while block.outbox.pop().is_some() {}
        while block.inbox.pop().is_some() {}
        block.alloc_state.store(PORT_FREE, Ordering::Release);
    }

    /// Registry cleanup + queued-reference cleanup for a finished
    /// subscriber block.
    fn reclaim_subscriber(&mut self, block: &SubscriberPortData, loc: OffsetPtr) {
        self.registry.on_subscriber_gone(loc, &mut self.actions);
        while let Some(encoded) = block.queue().pop() {
            self.release_encoded(encoded);
        }
        while block.outbox.pop().is_some() {}
        while block.inbox.pop().is_some() {}
        block.clear_notifier();
        block.alloc_state.store(PORT_FREE, Ordering::Release);
    }

    fn release_encoded(&self, encoded: u64) {
        let Some(location) = OffsetPtr::decode(encoded) else {
            return;
        };
        if let Ok(chunk) = self.map.resolve_chunk(location) {
            self.map.release_chunk(chunk);
        }
    }

    /// Write the accumulated registry actions into port inboxes.
    fn apply_actions(&mut self) {
        let actions = std::mem::take(&mut self.actions);
        for action in actions {
            match action {
                Action::Wire {
                    publisher,
                    subscriber,
                    history_request,
                    service,
                } => {
                    self.publisher_inbox(publisher, CaproMessage::sub(
                        service,
                        subscriber,
                        history_request,
                    ));
                }
                Action::Unwire {
                    publisher,
                    subscriber,
                    service,
                } => {
                    self.publisher_inbox(publisher, CaproMessage::unsub(service, subscriber));
                }
                Action::AckSub {
                    subscriber,
                    publisher,
                    service,
                } => {
                    self.subscriber_inbox(subscriber, CaproMessage::ack_sub(service, publisher));
                }
                Action::NackSub {
                    subscriber,
                    service,
                } => {
                    self.subscriber_inbox(subscriber, CaproMessage::nack_sub(service));
                }
                Action::AckUnsub {
                    subscriber,
                    service,
                } => {
                    self.subscriber_inbox(subscriber, CaproMessage::ack_unsub(service));
                }
                Action::Disconnect {
                    subscriber,
                    publisher,
                    service,
                } => {
                    self.subscriber_inbox(
                        subscriber,
                        CaproMessage::stop_offer_from(service, publisher),
                    );
                }
            }
        }
    }

    fn publisher_inbox(&self, loc: OffsetPtr, msg: CaproMessage) {
        let Ok(raw) = self.map.ptr(loc) else {
            log::warn!("wiring action for unmapped publisher {loc:?}");
            return;
        };
        // SAFETY: loc came from this management segment's port table.
        let block = unsafe { &*(raw as *const PublisherPortData) };
        if block.alloc_state.load(Ordering::Acquire) == PORT_ACTIVE && !block.inbox.push(msg) {
            log::warn!("publisher inbox overflow at {loc:?}");
        }
    }

    fn subscriber_inbox(&self, loc: OffsetPtr, msg: CaproMessage) {
        let Ok(raw) = self.map.ptr(loc) else {
            log::warn!("wiring action for unmapped subscriber {loc:?}");
            return;
        };
        // SAFETY: loc came from this management segment's port table.
        let block = unsafe { &*(raw as *const SubscriberPortData) };
        if block.alloc_state.load(Ordering::Acquire) == PORT_ACTIVE && !block.inbox.push(msg) {
            log::warn!("subscriber inbox overflow at {loc:?}");
        }
    }
}
