//! Broker-side service registry: offers, pending subscriptions, matching.
//!
//! Pure bookkeeping — the registry never touches shared memory. It consumes
//! discovery events and emits [`Action`]s; the engine (`engine.rs`)
//! translates those into inbox messages on the affected ports. Keeping the
//! matcher side-effect free makes every pairing rule unit-testable without
//! a single segment.
//!
//! Matching rules:
//! - OFFER matches pending SUBs of the same triple; SUB matches existing
//!   offers symmetrically. ACK_SUB is emitted per successful match, so a
//!   subscriber without any live publisher stays in SUBSCRIBE_REQUESTED.
//! - Multiple publishers on one service: every bound subscriber connects to
//!   all of them.
//! - A publisher's connection list is bounded; a SUB that matches offers but
//!   cannot wire anywhere is NACKed and dropped.
//! - STOP_OFFER disconnects every bound subscriber (synthetic disconnect)
//!   and retires their subscriptions entirely, including wiring to other
//!   publishers — port state and registry state stay in agreement.
//! - Wildcards are rejected as identities; they exist only in
//!   [`ServiceRegistry::query`].

use std::collections::HashMap;

use crate::discovery::service::{ServiceDescriptor, ServiceKey, ServicePattern};
use crate::memory::offset_ptr::OffsetPtr;
use crate::port::publisher::MAX_SUBSCRIBERS_PER_PUBLISHER;

/// Side effects the engine must apply to port inboxes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Tell a publisher to wire a subscriber (SUB into the publisher inbox).
    Wire {
        publisher: OffsetPtr,
        subscriber: OffsetPtr,
        history_request: u32,
        service: ServiceDescriptor,
    },
    /// Tell a publisher to unwire a subscriber.
    Unwire {
        publisher: OffsetPtr,
        subscriber: OffsetPtr,
        service: ServiceDescriptor,
    },
    /// Acknowledge a subscription (carries the matched publisher).
    AckSub {
        subscriber: OffsetPtr,
        publisher: OffsetPtr,
        service: ServiceDescriptor,
    },
    /// Reject a subscription.
    NackSub {
        subscriber: OffsetPtr,
        service: ServiceDescriptor,
    },
    /// Acknowledge an unsubscribe.
    AckUnsub {
        subscriber: OffsetPtr,
        service: ServiceDescriptor,
    },
    /// Synthetic disconnect toward a bound subscriber.
    Disconnect {
        subscriber: OffsetPtr,
        publisher: OffsetPtr,
        service: ServiceDescriptor,
    },
}

struct OfferEntry {
    publisher: OffsetPtr,
    service: ServiceDescriptor,
    /// Subscribers wired to this publisher.
    wired: Vec<OffsetPtr>,
}

struct SubEntry {
    subscriber: OffsetPtr,
    service: ServiceDescriptor,
    history_request: u32,
}

/// The broker's view of who offers and who wants what.
#[derive(Default)]
pub struct ServiceRegistry {
    offers: HashMap<ServiceKey, Vec<OfferEntry>>,
    subs: HashMap<ServiceKey, Vec<SubEntry>>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A publisher announces `service`. Idempotent (resync-safe).
    pub fn on_offer(
        &mut self,
        service: ServiceDescriptor,
        publisher: OffsetPtr,
        actions: &mut Vec<Action>,
    ) {
        if service.has_wildcard() || !service.is_complete() {
            log::warn!("rejecting OFFER with invalid identity {service:?}");
            return;
        }
        let offers = self.offers.entry(service.key()).or_default();
        if offers.iter().any(|o| o.publisher == publisher) {
            return;
        }
        offers.push(OfferEntry {
            publisher,
            service,
            wired: Vec::new(),
        });
        let entry = offers.last_mut().expect("just pushed");

        // Wire every pending subscription of this triple.
        if let Some(subs) = self.subs.get(&service.key()) {
            for sub in subs {
                if entry.wired.len() >= MAX_SUBSCRIBERS_PER_PUBLISHER {
                    break;
                }
                entry.wired.push(sub.subscriber);
                actions.push(Action::Wire {
                    publisher,
                    subscriber: sub.subscriber,
                    history_request: sub.history_request,
                    service,
                });
                actions.push(Action::AckSub {
                    subscriber: sub.subscriber,
                    publisher,
                    service,
                });
            }
        }
    }

    /// A publisher withdraws `service`: disconnect and retire every bound
    /// subscriber's subscription.
    pub fn on_stop_offer(
        &mut self,
        service: ServiceDescriptor,
        publisher: OffsetPtr,
        actions: &mut Vec<Action>,
    ) {
        let key = service.key();
        let Some(offers) = self.offers.get_mut(&key) else {
            return;
        };
        let Some(pos) = offers.iter().position(|o| o.publisher == publisher) else {
            return;
        };
        let removed = offers.remove(pos);
        if offers.is_empty() {
            self.offers.remove(&key);
        }
        for subscriber in removed.wired {
            actions.push(Action::Disconnect {
                subscriber,
                publisher,
                service,
            });
            // The subscriber drops to NOT_SUBSCRIBED; retire the whole
            // subscription so surviving publishers stop delivering too.
            self.retire_subscription(key, subscriber, actions);
        }
    }

    /// A subscriber requests `service`.
    pub fn on_sub(
        &mut self,
        service: ServiceDescriptor,
        subscriber: OffsetPtr,
        history_request: u32,
        actions: &mut Vec<Action>,
    ) {
        if service.has_wildcard() || !service.is_complete() {
            actions.push(Action::NackSub {
                subscriber,
                service,
            });
            return;
        }
        let key = service.key();
        let subs = self.subs.entry(key).or_default();
        if let Some(existing) = subs.iter_mut().find(|s| s.subscriber == subscriber) {
            existing.history_request = history_request; // resync duplicate
            return;
        }
        subs.push(SubEntry {
            subscriber,
            service,
            history_request,
        });

        let mut matched = false;
        let mut wired = false;
        if let Some(offers) = self.offers.get_mut(&key) {
            for offer in offers.iter_mut() {
                matched = true;
                if offer.wired.len() >= MAX_SUBSCRIBERS_PER_PUBLISHER {
                    continue;
                }
                offer.wired.push(subscriber);
                wired = true;
                actions.push(Action::Wire {
                    publisher: offer.publisher,
                    subscriber,
                    history_request,
                    service,
                });
                actions.push(Action::AckSub {
                    subscriber,
                    publisher: offer.publisher,
                    service,
                });
            }
        }
        if matched && !wired {
            // Offers exist but every connection list is full.
            actions.push(Action::NackSub {
                subscriber,
                service,
            });
            self.remove_sub(key, subscriber);
        }
        // No match at all: the subscription pends until an OFFER arrives.
    }

    /// A subscriber withdraws its subscription.
    pub fn on_unsub(
        &mut self,
        service: ServiceDescriptor,
        subscriber: OffsetPtr,
        actions: &mut Vec<Action>,
    ) {
        let key = service.key();
        self.unwire_everywhere(key, subscriber, actions);
        self.remove_sub(key, subscriber);
        actions.push(Action::AckUnsub {
            subscriber,
            service,
        });
    }

    /// Crash cleanup for a publisher port: synthesize STOP_OFFER.
    pub fn on_publisher_gone(&mut self, publisher: OffsetPtr, actions: &mut Vec<Action>) {
        let services: Vec<ServiceDescriptor> = self
            .offers
            .values()
            .flatten()
            .filter(|o| o.publisher == publisher)
            .map(|o| o.service)
            .collect();
        for service in services {
            self.on_stop_offer(service, publisher, actions);
        }
    }

    /// Crash cleanup for a subscriber port: silent unsubscribe.
    pub fn on_subscriber_gone(&mut self, subscriber: OffsetPtr, actions: &mut Vec<Action>) {
        let keys: Vec<ServiceKey> = self
            .subs
            .iter()
            .filter(|(_, subs)| subs.iter().any(|s| s.subscriber == subscriber))
            .map(|(k, _)| *k)
            .collect();
        for key in keys {
            self.unwire_everywhere(key, subscriber, actions);
            self.remove_sub(key, subscriber);
        }
    }

    /// Wildcard query over currently offered services.
    pub fn query(&self, pattern: &ServicePattern) -> Vec<ServiceDescriptor> {
        let mut out: Vec<ServiceDescriptor> = self
            .offers
            .values()
            .flatten()
            .map(|o| o.service)
            .filter(|s| pattern.matches(s))
            .collect();
        out.dedup_by(|a, b| a.same_topic(b));
        out
    }

    /// Number of live offers (diagnostics).
    pub fn offer_count(&self) -> usize {
        self.offers.values().map(Vec::len).sum()
    }

    /// Number of registered subscriptions (diagnostics).
    pub fn subscription_count(&self) -> usize {
        self.subs.values().map(Vec::len).sum()
    }

    /// Whether this publisher has anything offered (resync probe).
    pub fn has_offer(&self, service: &ServiceDescriptor, publisher: OffsetPtr) -> bool {
        self.offers
            .get(&service.key())
            .is_some_and(|o| o.iter().any(|e| e.publisher == publisher))
    }

    /// Whether this subscriber is registered (resync probe).
    pub fn has_subscription(&self, service: &ServiceDescriptor, subscriber: OffsetPtr) -> bool {
        self.subs
            .get(&service.key())
            .is_some_and(|s| s.iter().any(|e| e.subscriber == subscriber))
    }

    fn unwire_everywhere(
        &mut self,
        key: ServiceKey,
        subscriber: OffsetPtr,
        actions: &mut Vec<Action>,
    ) {
        if let Some(offers) = self.offers.get_mut(&key) {
            for offer in offers.iter_mut() {
                if let Some(pos) = offer.wired.iter().position(|w| *w == subscriber) {
                    offer.wired.remove(pos);
                    actions.push(Action::Unwire {
                        publisher: offer.publisher,
                        subscriber,
                        service: offer.service,
                    });
                }
            }
        }
    }

    fn retire_subscription(
        &mut self,
        key: ServiceKey,
        subscriber: OffsetPtr,
        actions: &mut Vec<Action>,
    ) {
        self.unwire_everywhere(key, subscriber, actions);
        self.remove_sub(key, subscriber);
    }

    fn remove_sub(&mut self, key: ServiceKey, subscriber: OffsetPtr) {
        if let Some(subs) = self.subs.get_mut(&key) {
            subs.retain(|s| s.subscriber != subscriber);
            if subs.is_empty() {
                self.subs.remove(&key);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn svc() -> ServiceDescriptor {
        ServiceDescriptor::new("radar", "front", "objects")
    }

    fn pub_loc(i: u64) -> OffsetPtr {
        OffsetPtr::new(0, 0x1000 + i * 0x100)
    }

    fn sub_loc(i: u64) -> OffsetPtr {
        OffsetPtr::new(0, 0x8000 + i * 0x100)
    }

    #[test]
    fn offer_then_sub_wires_and_acks() {
        let mut reg = ServiceRegistry::new();
        let mut actions = Vec::new();
        reg.on_offer(svc(), pub_loc(0), &mut actions);
        assert!(actions.is_empty(), "no subscribers yet");

        reg.on_sub(svc(), sub_loc(0), 2, &mut actions);
        assert_eq!(
            actions,
            vec![
                Action::Wire {
                    publisher: pub_loc(0),
                    subscriber: sub_loc(0),
                    history_request: 2,
                    service: svc(),
                },
                Action::AckSub {
                    subscriber: sub_loc(0),
                    publisher: pub_loc(0),
                    service: svc(),
                },
            ]
        );
    }

    #[test]
    fn sub_then_offer_matches_symmetrically() {
        let mut reg = ServiceRegistry::new();
        let mut actions = Vec::new();
        reg.on_sub(svc(), sub_loc(0), 0, &mut actions);
        assert!(actions.is_empty(), "subscription pends without an offer");
        assert_eq!(reg.subscription_count(), 1);

        reg.on_offer(svc(), pub_loc(0), &mut actions);
        assert!(actions.contains(&Action::AckSub {
            subscriber: sub_loc(0),
            publisher: pub_loc(0),
            service: svc(),
        }));
    }

    #[test]
    fn multi_publisher_fan_in() {
        let mut reg = ServiceRegistry::new();
        let mut actions = Vec::new();
        reg.on_offer(svc(), pub_loc(0), &mut actions);
        reg.on_offer(svc(), pub_loc(1), &mut actions);
        reg.on_sub(svc(), sub_loc(0), 0, &mut actions);

        let wires: Vec<_> = actions
            .iter()
            .filter(|a| matches!(a, Action::Wire { .. }))
            .collect();
        assert_eq!(wires.len(), 2, "subscriber connects to all publishers");
    }

    #[test]
    fn stop_offer_disconnects_and_retires() {
        let mut reg = ServiceRegistry::new();
        let mut actions = Vec::new();
        reg.on_offer(svc(), pub_loc(0), &mut actions);
        reg.on_offer(svc(), pub_loc(1), &mut actions);
        reg.on_sub(svc(), sub_loc(0), 0, &mut actions);
        actions.clear();

        reg.on_stop_offer(svc(), pub_loc(0), &mut actions);
        assert!(actions.contains(&Action::Disconnect {
            subscriber: sub_loc(0),
            publisher: pub_loc(0),
            service: svc(),
        }));
        // The surviving publisher must stop delivering too.
        assert!(actions.contains(&Action::Unwire {
            publisher: pub_loc(1),
            subscriber: sub_loc(0),
            service: svc(),
        }));
        assert_eq!(reg.subscription_count(), 0);
        assert_eq!(reg.offer_count(), 1);
    }

    #[test]
    fn wildcard_identities_are_nacked() {
        let mut reg = ServiceRegistry::new();
        let mut actions = Vec::new();
        let wild = ServiceDescriptor::new("*", "front", "objects");
        reg.on_sub(wild, sub_loc(0), 0, &mut actions);
        assert_eq!(
            actions,
            vec![Action::NackSub {
                subscriber: sub_loc(0),
                service: wild,
            }]
        );
        reg.on_offer(wild, pub_loc(0), &mut actions);
        assert_eq!(reg.offer_count(), 0, "wildcard offer rejected");
    }

    #[test]
    fn full_publisher_nacks_new_subscriber() {
        let mut reg = ServiceRegistry::new();
        let mut actions = Vec::new();
        reg.on_offer(svc(), pub_loc(0), &mut actions);
        for i in 0..MAX_SUBSCRIBERS_PER_PUBLISHER as u64 {
            reg.on_sub(svc(), sub_loc(i), 0, &mut actions);
        }
        actions.clear();
        reg.on_sub(svc(), sub_loc(99), 0, &mut actions);
        assert_eq!(
            actions,
            vec![Action::NackSub {
                subscriber: sub_loc(99),
                service: svc(),
            }]
        );
    }

    #[test]
    fn unsub_unwires_and_acks() {
        let mut reg = ServiceRegistry::new();
        let mut actions = Vec::new();
        reg.on_offer(svc(), pub_loc(0), &mut actions);
        reg.on_sub(svc(), sub_loc(0), 0, &mut actions);
        actions.clear();

        reg.on_unsub(svc(), sub_loc(0), &mut actions);
        assert_eq!(
            actions,
            vec![
                Action::Unwire {
                    publisher: pub_loc(0),
                    subscriber: sub_loc(0),
                    service: svc(),
                },
                Action::AckUnsub {
                    subscriber: sub_loc(0),
                    service: svc(),
                },
            ]
        );
    }

    #[test]
    fn query_with_wildcards() {
        let mut reg = ServiceRegistry::new();
        let mut actions = Vec::new();
        reg.on_offer(svc(), pub_loc(0), &mut actions);
        reg.on_offer(
            ServiceDescriptor::new("lidar", "roof", "points"),
            pub_loc(1),
            &mut actions,
        );

        assert_eq!(reg.query(&ServicePattern::new("*", "*", "*")).len(), 2);
        assert_eq!(reg.query(&ServicePattern::new("radar", "*", "*")).len(), 1);
        assert!(reg
            .query(&ServicePattern::new("camera", "*", "*"))
            .is_empty());
    }
}
