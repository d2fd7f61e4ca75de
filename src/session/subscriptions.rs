//! Subscription registry
//!
//! Authoritative set of desired and confirmed topic subscriptions. The
//! registry is keyed by topic filter, so it can never hold two entries for
//! the same filter, and the latest subscribe/unsubscribe intent always wins.
//! It does not send anything itself: the session asks it which requests to
//! put on the wire and feeds broker acknowledgements back in.

use super::topic::filter_matches;
use crate::transport::QoS;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::{debug, warn};

/// Confirmation status of one subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SubscriptionStatus {
    Pending,
    Confirmed,
    Failed,
}

/// Snapshot of one registry entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    pub topic: String,
    /// QoS requested by the latest subscribe intent
    pub qos: QoS,
    /// QoS granted by the broker once confirmed
    pub granted: Option<QoS>,
    pub status: SubscriptionStatus,
}

#[derive(Debug, Clone)]
struct Entry {
    qos: QoS,
    granted: Option<QoS>,
    status: SubscriptionStatus,
    /// SUBSCRIBE packet currently carrying this intent
    request: Option<u16>,
}

/// Result of a subscribe intent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscribeOutcome {
    /// Already confirmed at this QoS
    Unchanged,
    /// Already requested at this QoS, acknowledgement outstanding
    AwaitingAck,
    /// Entry is Pending and needs a SUBSCRIBE
    NeedsRequest,
}

/// Result of an unsubscribe intent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnsubscribeOutcome {
    /// No entry existed
    NotSubscribed,
    /// Link is up; the caller sends UNSUBSCRIBE
    NeedsRequest,
    /// Remembered until the broker session is resumed
    Deferred,
    /// Nothing to tell the broker; done
    Completed,
}

/// Per-topic outcome of a SUBACK
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscribeResult {
    pub topic: String,
    pub qos: QoS,
    pub success: bool,
}

#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    entries: BTreeMap<String, Entry>,
    subscribe_requests: HashMap<u16, Vec<String>>,
    unsubscribe_requests: HashMap<u16, String>,
    deferred_unsubscribes: BTreeSet<String>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a subscribe intent
    pub fn subscribe(&mut self, topic: &str, qos: QoS) -> SubscribeOutcome {
        self.deferred_unsubscribes.remove(topic);

        if let Some(entry) = self.entries.get_mut(topic) {
            if entry.qos == qos {
                match entry.status {
                    SubscriptionStatus::Confirmed => return SubscribeOutcome::Unchanged,
                    SubscriptionStatus::Pending if entry.request.is_some() => {
                        return SubscribeOutcome::AwaitingAck
                    }
                    _ => {}
                }
            }
            entry.qos = qos;
            entry.granted = None;
            entry.status = SubscriptionStatus::Pending;
            entry.request = None;
        } else {
            self.entries.insert(
                topic.to_string(),
                Entry {
                    qos,
                    granted: None,
                    status: SubscriptionStatus::Pending,
                    request: None,
                },
            );
        }
        SubscribeOutcome::NeedsRequest
    }

    /// Record an unsubscribe intent; the entry is removed whatever its state
    pub fn unsubscribe(
        &mut self,
        topic: &str,
        connected: bool,
        clean_session: bool,
    ) -> UnsubscribeOutcome {
        let existed = self.entries.remove(topic).is_some();
        if !existed && !self.deferred_unsubscribes.contains(topic) {
            return UnsubscribeOutcome::NotSubscribed;
        }

        if connected {
            self.deferred_unsubscribes.remove(topic);
            UnsubscribeOutcome::NeedsRequest
        } else if !clean_session {
            self.deferred_unsubscribes.insert(topic.to_string());
            UnsubscribeOutcome::Deferred
        } else {
            UnsubscribeOutcome::Completed
        }
    }

    /// Pending entries with no SUBSCRIBE in flight
    pub fn unrequested(&self) -> Vec<(String, QoS)> {
        self.entries
            .iter()
            .filter(|(_, entry)| {
                entry.status == SubscriptionStatus::Pending && entry.request.is_none()
            })
            .map(|(topic, entry)| (topic.clone(), entry.qos))
            .collect()
    }

    /// A SUBSCRIBE carrying `filters` went out as `packet_id`
    pub fn mark_requested(&mut self, packet_id: u16, filters: &[(String, QoS)]) {
        let mut topics = Vec::with_capacity(filters.len());
        for (topic, _) in filters {
            if let Some(entry) = self.entries.get_mut(topic) {
                entry.request = Some(packet_id);
                topics.push(topic.clone());
            }
        }
        self.subscribe_requests.insert(packet_id, topics);
    }

    /// An UNSUBSCRIBE for `topic` went out as `packet_id`
    pub fn mark_unsubscribe_requested(&mut self, packet_id: u16, topic: &str) {
        self.deferred_unsubscribes.remove(topic);
        self.unsubscribe_requests
            .insert(packet_id, topic.to_string());
    }

    /// Apply a SUBACK. Results for entries that changed since the request
    /// are discarded.
    pub fn handle_suback(&mut self, packet_id: u16, results: &[Option<QoS>]) -> Vec<SubscribeResult> {
        let Some(topics) = self.subscribe_requests.remove(&packet_id) else {
            warn!(packet_id, "SUBACK for unknown packet id discarded");
            return Vec::new();
        };
        if topics.len() != results.len() {
            warn!(
                packet_id,
                requested = topics.len(),
                returned = results.len(),
                "SUBACK result count mismatch"
            );
        }

        let mut applied = Vec::new();
        for (index, topic) in topics.into_iter().enumerate() {
            let Some(entry) = self.entries.get_mut(&topic) else {
                debug!(packet_id, %topic, "SUBACK result for removed topic discarded");
                continue;
            };
            if entry.request != Some(packet_id) {
                debug!(packet_id, %topic, "Stale SUBACK result discarded");
                continue;
            }
            entry.request = None;

            match results.get(index).copied().flatten() {
                Some(granted) => {
                    entry.status = SubscriptionStatus::Confirmed;
                    entry.granted = Some(granted);
                    applied.push(SubscribeResult {
                        topic,
                        qos: granted,
                        success: true,
                    });
                }
                None => {
                    entry.status = SubscriptionStatus::Failed;
                    entry.granted = None;
                    applied.push(SubscribeResult {
                        topic,
                        qos: entry.qos,
                        success: false,
                    });
                }
            }
        }
        applied
    }

    /// Apply an UNSUBACK; returns the topic it completes
    pub fn handle_unsuback(&mut self, packet_id: u16) -> Option<String> {
        let topic = self.unsubscribe_requests.remove(&packet_id);
        if topic.is_none() {
            warn!(packet_id, "UNSUBACK for unknown packet id discarded");
        }
        topic
    }

    /// The link dropped: requests in flight will never be acknowledged
    pub fn on_link_lost(&mut self) {
        for entry in self.entries.values_mut() {
            entry.request = None;
        }
        self.subscribe_requests.clear();
        self.deferred_unsubscribes
            .extend(self.unsubscribe_requests.drain().map(|(_, topic)| topic));
    }

    /// A new link is up. Without a resumed broker session every confirmed
    /// entry must be requested again and deferred unsubscribes are moot;
    /// returns the topics whose unsubscribe is thereby complete.
    pub fn on_session_start(&mut self, resumed: bool) -> Vec<String> {
        if resumed {
            return Vec::new();
        }
        for entry in self.entries.values_mut() {
            if entry.status == SubscriptionStatus::Confirmed {
                entry.status = SubscriptionStatus::Pending;
                entry.granted = None;
            }
        }
        std::mem::take(&mut self.deferred_unsubscribes)
            .into_iter()
            .collect()
    }

    /// Deferred unsubscribes to send now
    pub fn take_deferred_unsubscribes(&mut self) -> Vec<String> {
        std::mem::take(&mut self.deferred_unsubscribes)
            .into_iter()
            .collect()
    }

    pub fn is_subscribed(&self, topic: &str) -> bool {
        self.entries
            .get(topic)
            .is_some_and(|entry| entry.status == SubscriptionStatus::Confirmed)
    }

    /// Confirmed topic filters, ordered
    pub fn topics(&self) -> Vec<String> {
        self.entries
            .iter()
            .filter(|(_, entry)| entry.status == SubscriptionStatus::Confirmed)
            .map(|(topic, _)| topic.clone())
            .collect()
    }

    pub fn get(&self, topic: &str) -> Option<Subscription> {
        self.entries.get(topic).map(|entry| Subscription {
            topic: topic.to_string(),
            qos: entry.qos,
            granted: entry.granted,
            status: entry.status,
        })
    }

    /// Whether any confirmed filter matches an incoming topic name
    pub fn matches(&self, topic: &str) -> bool {
        self.entries.iter().any(|(filter, entry)| {
            entry.status == SubscriptionStatus::Confirmed && filter_matches(filter, topic)
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
