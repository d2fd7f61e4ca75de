//! QoS delivery engine
//!
//! Packet identifier bookkeeping plus the QoS 0/1/2 contracts for both
//! directions, retained-message tagging, the offline publish queue and
//! per-message acknowledgement timeouts. Pure state: every method returns
//! the packets to write and the outcomes to report.

use crate::events::InboundMessage;
use crate::transport::{InboundPublish, OutboundPacket, QoS};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, warn};

/// Inbound QoS 1 ids remembered for duplicate detection
pub const RECENT_QOS1_WINDOW: usize = 256;

/// Lifecycle of an outbound QoS 1/2 publish
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PublishState {
    /// Waiting for PUBACK (QoS 1) or PUBREC (QoS 2)
    AwaitingAck,
    /// PUBREL sent, waiting for PUBCOMP
    AwaitingComplete,
    Done,
}

/// Lifecycle of an inbound QoS 2 receipt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReceiveState {
    Received,
    /// PUBREC sent, waiting for PUBREL
    ReleaseSent,
    Done,
}

/// Outbound message tracked until the broker completes its QoS flow
#[derive(Debug, Clone, PartialEq)]
pub struct PendingPublish {
    pub message_id: u16,
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
    pub state: PublishState,
    seq: u64,
    ack_deadline: Option<Instant>,
    timeouts: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingReceive {
    pub message_id: u16,
    pub state: ReceiveState,
}

/// Publish accepted while no link was available
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedPublish {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
}

/// What to do with a publish issued while disconnected
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OfflinePolicy {
    /// Hold up to `max_queued` messages and send them on the next connect
    Queue { max_queued: usize },
    /// Reject immediately with NotConnected
    FailFast,
}

/// What an expired acknowledgement timer does
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckTimeoutAction {
    /// Count and log; redelivery is left to the next reconnect
    AwaitReconnect,
    /// Give up after `max_timeouts` expiries and report publish failure
    FailAfter { max_timeouts: u32 },
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeliveryConfig {
    pub offline_policy: OfflinePolicy,
    pub ack_timeout: Option<Duration>,
    pub ack_timeout_action: AckTimeoutAction,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            offline_policy: OfflinePolicy::Queue { max_queued: 1000 },
            ack_timeout: None,
            ack_timeout_action: AckTimeoutAction::AwaitReconnect,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeliveryError {
    #[error("all 65535 packet identifiers are in use")]
    IdsExhausted,
    #[error("offline queue is full ({limit} messages)")]
    QueueFull { limit: usize },
    #[error("publishing while disconnected is disabled")]
    OfflineRejected,
}

/// QoS 1/2 delivery completed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivered {
    pub message_id: u16,
    pub topic: String,
}

/// Publish given up on
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishFailure {
    pub message_id: Option<u16>,
    pub topic: String,
    pub reason: String,
}

/// Result of an inbound PUBLISH
#[derive(Debug, Clone, PartialEq)]
pub struct InboundOutcome {
    pub deliver: Option<InboundMessage>,
    pub reply: Option<OutboundPacket>,
}

/// Bounded set of recently acknowledged ids, oldest evicted first
#[derive(Debug, Default)]
struct RecentIds {
    order: VecDeque<u16>,
    members: HashSet<u16>,
}

impl RecentIds {
    fn contains(&self, id: u16) -> bool {
        self.members.contains(&id)
    }

    fn insert(&mut self, id: u16) {
        if !self.members.insert(id) {
            return;
        }
        self.order.push_back(id);
        if self.order.len() > RECENT_QOS1_WINDOW {
            if let Some(evicted) = self.order.pop_front() {
                self.members.remove(&evicted);
            }
        }
    }

    fn clear(&mut self) {
        self.order.clear();
        self.members.clear();
    }
}

#[derive(Debug)]
pub struct DeliveryEngine {
    config: DeliveryConfig,
    next_id: u16,
    next_seq: u64,
    outbound: HashMap<u16, PendingPublish>,
    reserved: HashSet<u16>,
    inbound: HashMap<u16, PendingReceive>,
    recent_qos1: RecentIds,
    offline: VecDeque<QueuedPublish>,
}

impl DeliveryEngine {
    pub fn new(config: DeliveryConfig) -> Self {
        Self {
            config,
            next_id: 1,
            next_seq: 0,
            outbound: HashMap::new(),
            reserved: HashSet::new(),
            inbound: HashMap::new(),
            recent_qos1: RecentIds::default(),
            offline: VecDeque::new(),
        }
    }

    pub fn config(&self) -> &DeliveryConfig {
        &self.config
    }

    /// Next free packet identifier, wrapping within 1..=65535
    pub fn allocate_id(&mut self) -> Result<u16, DeliveryError> {
        for _ in 0..u16::MAX {
            let candidate = self.next_id;
            self.next_id = if candidate == u16::MAX { 1 } else { candidate + 1 };
            if !self.outbound.contains_key(&candidate) && !self.reserved.contains(&candidate) {
                return Ok(candidate);
            }
        }
        Err(DeliveryError::IdsExhausted)
    }

    /// Identifier for a SUBSCRIBE/UNSUBSCRIBE, held until acknowledged
    pub fn reserve_id(&mut self) -> Result<u16, DeliveryError> {
        let id = self.allocate_id()?;
        self.reserved.insert(id);
        Ok(id)
    }

    pub fn release_id(&mut self, id: u16) {
        self.reserved.remove(&id);
    }

    /// Build the PUBLISH for a message going out now, tracking QoS 1/2
    pub fn publish(
        &mut self,
        now: Instant,
        topic: String,
        payload: Bytes,
        qos: QoS,
        retain: bool,
    ) -> Result<OutboundPacket, DeliveryError> {
        if qos == QoS::AtMostOnce {
            return Ok(OutboundPacket::Publish {
                packet_id: 0,
                topic,
                payload,
                qos,
                retain,
                dup: false,
            });
        }

        let message_id = self.allocate_id()?;
        let seq = self.next_seq;
        self.next_seq += 1;
        let packet = OutboundPacket::Publish {
            packet_id: message_id,
            topic: topic.clone(),
            payload: payload.clone(),
            qos,
            retain,
            dup: false,
        };
        self.outbound.insert(
            message_id,
            PendingPublish {
                message_id,
                topic,
                payload,
                qos,
                retain,
                state: PublishState::AwaitingAck,
                seq,
                ack_deadline: self.config.ack_timeout.map(|timeout| now + timeout),
                timeouts: 0,
            },
        );
        Ok(packet)
    }

    /// Hold a publish until the next connect, per the offline policy
    pub fn enqueue(&mut self, message: QueuedPublish) -> Result<usize, DeliveryError> {
        match self.config.offline_policy {
            OfflinePolicy::FailFast => Err(DeliveryError::OfflineRejected),
            OfflinePolicy::Queue { max_queued } => {
                if self.offline.len() >= max_queued {
                    return Err(DeliveryError::QueueFull { limit: max_queued });
                }
                self.offline.push_back(message);
                Ok(self.offline.len())
            }
        }
    }

    /// PUBACK for a QoS 1 publish
    pub fn handle_puback(&mut self, packet_id: u16) -> Option<Delivered> {
        match self.outbound.get(&packet_id).map(|entry| entry.qos) {
            Some(QoS::AtLeastOnce) => {
                let mut entry = self.outbound.remove(&packet_id)?;
                entry.state = PublishState::Done;
                debug!(packet_id, topic = %entry.topic, "QoS 1 publish acknowledged");
                Some(Delivered {
                    message_id: packet_id,
                    topic: entry.topic,
                })
            }
            Some(_) => {
                warn!(packet_id, "PUBACK for a QoS 2 publish discarded");
                None
            }
            None => {
                warn!(packet_id, "PUBACK for unknown packet id discarded");
                None
            }
        }
    }

    /// PUBREC for a QoS 2 publish; answers with PUBREL
    pub fn handle_pubrec(&mut self, now: Instant, packet_id: u16) -> Option<OutboundPacket> {
        let ack_timeout = self.config.ack_timeout;
        match self.outbound.get_mut(&packet_id) {
            Some(entry) if entry.qos == QoS::ExactlyOnce => {
                entry.state = PublishState::AwaitingComplete;
                entry.ack_deadline = ack_timeout.map(|timeout| now + timeout);
                entry.timeouts = 0;
                Some(OutboundPacket::PubRel { packet_id })
            }
            Some(_) => {
                warn!(packet_id, "PUBREC for a QoS 1 publish discarded");
                None
            }
            None => {
                warn!(packet_id, "PUBREC for unknown packet id discarded");
                None
            }
        }
    }

    /// PUBCOMP completing a QoS 2 publish
    pub fn handle_pubcomp(&mut self, packet_id: u16) -> Option<Delivered> {
        match self.outbound.get(&packet_id).map(|entry| entry.state) {
            Some(PublishState::AwaitingComplete) => {
                let mut entry = self.outbound.remove(&packet_id)?;
                entry.state = PublishState::Done;
                debug!(packet_id, topic = %entry.topic, "QoS 2 publish completed");
                Some(Delivered {
                    message_id: packet_id,
                    topic: entry.topic,
                })
            }
            Some(_) => {
                warn!(packet_id, "PUBCOMP before PUBREC discarded");
                None
            }
            None => {
                warn!(packet_id, "PUBCOMP for unknown packet id discarded");
                None
            }
        }
    }

    /// Inbound PUBLISH: what to deliver upward and how to answer
    pub fn handle_publish(&mut self, publish: InboundPublish) -> InboundOutcome {
        let packet_id = publish.packet_id;
        let qos = publish.qos;

        let (deliver, reply) = match qos {
            QoS::AtMostOnce => (true, None),
            QoS::AtLeastOnce => {
                // Best effort only: the dup flag is advisory
                let retransmission =
                    publish.dup && !publish.retain && self.recent_qos1.contains(packet_id);
                if retransmission {
                    debug!(packet_id, "Suppressed QoS 1 retransmission");
                } else if !publish.retain {
                    self.recent_qos1.insert(packet_id);
                }
                (!retransmission, Some(OutboundPacket::PubAck { packet_id }))
            }
            QoS::ExactlyOnce if publish.retain => {
                (true, Some(OutboundPacket::PubRec { packet_id }))
            }
            QoS::ExactlyOnce => {
                let first_receipt = match self.inbound.get(&packet_id) {
                    Some(receipt) if receipt.state != ReceiveState::Done => false,
                    _ => true,
                };
                if first_receipt {
                    let receipt = self.inbound.entry(packet_id).or_insert(PendingReceive {
                        message_id: packet_id,
                        state: ReceiveState::Received,
                    });
                    receipt.state = ReceiveState::ReleaseSent;
                } else {
                    debug!(packet_id, "Suppressed QoS 2 duplicate before release");
                }
                (first_receipt, Some(OutboundPacket::PubRec { packet_id }))
            }
        };

        let deliver = deliver.then(|| InboundMessage {
            topic: publish.topic,
            payload: publish.payload,
            qos,
            retained: publish.retain,
            duplicate: publish.dup,
        });
        InboundOutcome { deliver, reply }
    }

    /// Inbound PUBREL; always answered with PUBCOMP
    pub fn handle_pubrel(&mut self, packet_id: u16) -> OutboundPacket {
        match self.inbound.remove(&packet_id) {
            Some(_) => debug!(packet_id, "QoS 2 receipt released"),
            None => debug!(packet_id, "PUBREL for unknown packet id, completing anyway"),
        }
        OutboundPacket::PubComp { packet_id }
    }

    /// The link dropped: reserved ids and ack timers no longer apply
    pub fn on_link_lost(&mut self) {
        self.reserved.clear();
        for entry in self.outbound.values_mut() {
            entry.ack_deadline = None;
        }
    }

    /// A new link is up. Without a resumed broker session inbound receipt
    /// state is meaningless.
    pub fn on_session_start(&mut self, resumed: bool) {
        if !resumed {
            self.inbound.clear();
            self.recent_qos1.clear();
        }
    }

    /// In-flight publishes to write again, in original send order
    pub fn resend_in_flight(&mut self, now: Instant) -> Vec<OutboundPacket> {
        let ack_timeout = self.config.ack_timeout;
        let mut entries: Vec<&mut PendingPublish> = self.outbound.values_mut().collect();
        entries.sort_by_key(|entry| entry.seq);

        entries
            .into_iter()
            .map(|entry| {
                entry.ack_deadline = ack_timeout.map(|timeout| now + timeout);
                entry.timeouts = 0;
                match entry.state {
                    PublishState::AwaitingComplete => OutboundPacket::PubRel {
                        packet_id: entry.message_id,
                    },
                    _ => OutboundPacket::Publish {
                        packet_id: entry.message_id,
                        topic: entry.topic.clone(),
                        payload: entry.payload.clone(),
                        qos: entry.qos,
                        retain: entry.retain,
                        dup: true,
                    },
                }
            })
            .collect()
    }

    /// Send everything queued while offline, in order
    pub fn drain_offline(&mut self, now: Instant) -> (Vec<OutboundPacket>, Vec<PublishFailure>) {
        let mut packets = Vec::with_capacity(self.offline.len());
        let mut failures = Vec::new();

        while let Some(message) = self.offline.pop_front() {
            let topic = message.topic.clone();
            match self.publish(now, message.topic, message.payload, message.qos, message.retain) {
                Ok(packet) => packets.push(packet),
                Err(err) => {
                    warn!(%topic, error = %err, "Dropping queued publish");
                    failures.push(PublishFailure {
                        message_id: None,
                        topic,
                        reason: err.to_string(),
                    });
                }
            }
        }
        (packets, failures)
    }

    /// Earliest acknowledgement deadline
    pub fn next_deadline(&self) -> Option<Instant> {
        self.outbound
            .values()
            .filter_map(|entry| entry.ack_deadline)
            .min()
    }

    /// Expire acknowledgement timers; returns publishes given up on
    pub fn poll_ack_timeouts(&mut self, now: Instant) -> Vec<PublishFailure> {
        let Some(timeout) = self.config.ack_timeout else {
            return Vec::new();
        };
        let action = self.config.ack_timeout_action;

        let mut expired: Vec<(u64, u16)> = self
            .outbound
            .values()
            .filter(|entry| entry.ack_deadline.is_some_and(|deadline| now >= deadline))
            .map(|entry| (entry.seq, entry.message_id))
            .collect();
        expired.sort_unstable();

        let mut failures = Vec::new();
        for (_, message_id) in expired {
            let Some(entry) = self.outbound.get_mut(&message_id) else {
                continue;
            };
            entry.timeouts += 1;
            warn!(
                packet_id = message_id,
                topic = %entry.topic,
                timeouts = entry.timeouts,
                state = ?entry.state,
                "Acknowledgement timed out"
            );

            let give_up = matches!(
                action,
                AckTimeoutAction::FailAfter { max_timeouts } if entry.timeouts >= max_timeouts
            );
            if !give_up {
                entry.ack_deadline = Some(now + timeout);
                continue;
            }
            if let Some(entry) = self.outbound.remove(&message_id) {
                failures.push(PublishFailure {
                    message_id: Some(message_id),
                    topic: entry.topic,
                    reason: format!("no acknowledgement after {} timeouts", entry.timeouts),
                });
            }
        }
        failures
    }

    /// Snapshot of in-flight publishes in send order
    pub fn in_flight(&self) -> Vec<PendingPublish> {
        let mut entries: Vec<PendingPublish> = self.outbound.values().cloned().collect();
        entries.sort_by_key(|entry| entry.seq);
        entries
    }

    pub fn in_flight_count(&self) -> usize {
        self.outbound.len()
    }

    pub fn inbound_pending(&self) -> Vec<PendingReceive> {
        self.inbound.values().copied().collect()
    }

    pub fn queued_len(&self) -> usize {
        self.offline.len()
    }
}
