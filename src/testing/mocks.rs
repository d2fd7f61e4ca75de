//! Mock implementations for testing
//!
//! [`MockTransport`] stands in for a broker connection: handshake outcomes
//! are scripted, every outbound packet is recorded, and a [`MockBroker`]
//! handle injects inbound packets or drops the link. [`RecordingSink`]
//! captures session events for assertions.

use crate::events::{EventSink, InboundMessage, SessionEvent};
use crate::session::connection::{DisconnectReason, ErrorCause};
use crate::transport::{
    ConnAck, ConnectOptions, InboundEvent, InboundPublish, OutboundPacket, QoS, Transport,
    TransportError,
};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;

/// How the next `open` behaves
#[derive(Debug, Clone, PartialEq)]
pub enum OpenBehavior {
    Accept { session_present: bool },
    Reject(TransportError),
    /// Never completes; the caller has to abort it
    Hang,
}

#[derive(Debug)]
struct MockState {
    script: VecDeque<OpenBehavior>,
    default_open: OpenBehavior,
    sent: Vec<OutboundPacket>,
    opened_with: Vec<ConnectOptions>,
    closes: usize,
    inbound: Option<mpsc::UnboundedSender<InboundEvent>>,
    fail_next_send: Option<TransportError>,
    auto_ack: bool,
}

fn lock(state: &Mutex<MockState>) -> MutexGuard<'_, MockState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Scriptable in-memory transport
#[derive(Debug)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
    inbound: Option<mpsc::UnboundedReceiver<InboundEvent>>,
    managed_keep_alive: bool,
}

impl MockTransport {
    /// A transport whose every `open` succeeds without a stored session
    pub fn new() -> (Self, MockBroker) {
        let state = Arc::new(Mutex::new(MockState {
            script: VecDeque::new(),
            default_open: OpenBehavior::Accept {
                session_present: false,
            },
            sent: Vec::new(),
            opened_with: Vec::new(),
            closes: 0,
            inbound: None,
            fail_next_send: None,
            auto_ack: false,
        }));
        let transport = Self {
            state: Arc::clone(&state),
            inbound: None,
            managed_keep_alive: false,
        };
        (transport, MockBroker { state })
    }

    /// Report keep-alive as handled by the transport
    pub fn with_managed_keep_alive(mut self) -> Self {
        self.managed_keep_alive = true;
        self
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn open(&mut self, options: &ConnectOptions) -> Result<ConnAck, TransportError> {
        let behavior = {
            let mut state = lock(&self.state);
            state.opened_with.push(options.clone());
            let default_open = state.default_open.clone();
            state.script.pop_front().unwrap_or(default_open)
        };

        match behavior {
            OpenBehavior::Accept { session_present } => {
                let (tx, rx) = mpsc::unbounded_channel();
                lock(&self.state).inbound = Some(tx);
                self.inbound = Some(rx);
                Ok(ConnAck { session_present })
            }
            OpenBehavior::Reject(error) => Err(error),
            OpenBehavior::Hang => std::future::pending().await,
        }
    }

    async fn send(&mut self, packet: OutboundPacket) -> Result<(), TransportError> {
        let mut state = lock(&self.state);
        if let Some(error) = state.fail_next_send.take() {
            return Err(error);
        }
        if state.auto_ack {
            if let Some(reply) = broker_reply(&packet) {
                if let Some(inbound) = &state.inbound {
                    let _ = inbound.send(reply);
                }
            }
        }
        state.sent.push(packet);
        Ok(())
    }

    async fn recv(&mut self) -> InboundEvent {
        match self.inbound.as_mut() {
            Some(inbound) => match inbound.recv().await {
                Some(event) => event,
                None => InboundEvent::LinkClosed {
                    reason: DisconnectReason::TransportError,
                    detail: "mock link dropped".to_string(),
                },
            },
            None => std::future::pending().await,
        }
    }

    async fn close(&mut self) {
        let mut state = lock(&self.state);
        state.closes += 1;
        state.inbound = None;
        self.inbound = None;
    }

    fn manages_keep_alive(&self) -> bool {
        self.managed_keep_alive
    }
}

/// What a well-behaved broker answers to a client packet
fn broker_reply(packet: &OutboundPacket) -> Option<InboundEvent> {
    match packet {
        OutboundPacket::Publish { packet_id, qos, .. } => match qos {
            QoS::AtMostOnce => None,
            QoS::AtLeastOnce => Some(InboundEvent::PubAck {
                packet_id: *packet_id,
            }),
            QoS::ExactlyOnce => Some(InboundEvent::PubRec {
                packet_id: *packet_id,
            }),
        },
        OutboundPacket::PubRel { packet_id } => Some(InboundEvent::PubComp {
            packet_id: *packet_id,
        }),
        OutboundPacket::Subscribe { packet_id, filters } => Some(InboundEvent::SubAck {
            packet_id: *packet_id,
            results: filters.iter().map(|(_, qos)| Some(*qos)).collect(),
        }),
        OutboundPacket::Unsubscribe { packet_id, .. } => Some(InboundEvent::UnsubAck {
            packet_id: *packet_id,
        }),
        OutboundPacket::PingReq => Some(InboundEvent::PingResp),
        _ => None,
    }
}

/// Test-side handle onto a [`MockTransport`]
#[derive(Debug, Clone)]
pub struct MockBroker {
    state: Arc<Mutex<MockState>>,
}

impl MockBroker {
    /// Queue the outcome of the next `open`
    pub fn script_open(&self, behavior: OpenBehavior) {
        lock(&self.state).script.push_back(behavior);
    }

    /// Outcome of every `open` once the script is used up
    pub fn set_default_open(&self, behavior: OpenBehavior) {
        lock(&self.state).default_open = behavior;
    }

    /// Answer SUBSCRIBE, UNSUBSCRIBE, PUBLISH, PUBREL and PINGREQ like a broker
    pub fn set_auto_ack(&self, enabled: bool) {
        lock(&self.state).auto_ack = enabled;
    }

    pub fn fail_next_send(&self, error: TransportError) {
        lock(&self.state).fail_next_send = Some(error);
    }

    /// Deliver an event on the current link; false when no link is open
    pub fn inject(&self, event: InboundEvent) -> bool {
        match &lock(&self.state).inbound {
            Some(inbound) => inbound.send(event).is_ok(),
            None => false,
        }
    }

    /// Deliver a PUBLISH from the broker
    pub fn publish(&self, packet_id: u16, topic: &str, payload: &str, qos: QoS) -> bool {
        self.inject(InboundEvent::Publish(InboundPublish {
            packet_id,
            topic: topic.to_string(),
            payload: Bytes::from(payload.to_string()),
            qos,
            retain: false,
            dup: false,
        }))
    }

    /// Close the current link from the broker side
    pub fn drop_link(&self, reason: DisconnectReason) -> bool {
        self.inject(InboundEvent::LinkClosed {
            reason,
            detail: "closed by mock broker".to_string(),
        })
    }

    pub fn is_linked(&self) -> bool {
        lock(&self.state).inbound.is_some()
    }

    pub fn sent(&self) -> Vec<OutboundPacket> {
        lock(&self.state).sent.clone()
    }

    /// Return and forget everything sent so far
    pub fn take_sent(&self) -> Vec<OutboundPacket> {
        std::mem::take(&mut lock(&self.state).sent)
    }

    pub fn opens(&self) -> usize {
        lock(&self.state).opened_with.len()
    }

    pub fn opened_with(&self) -> Vec<ConnectOptions> {
        lock(&self.state).opened_with.clone()
    }

    pub fn closes(&self) -> usize {
        lock(&self.state).closes
    }
}

/// Sink that keeps every event in memory
#[derive(Debug, Default)]
pub struct RecordingSink {
    events: Mutex<Vec<SessionEvent>>,
}

impl RecordingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn record(&self, event: SessionEvent) {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(event);
    }

    pub fn events(&self) -> Vec<SessionEvent> {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Event kinds in emission order
    pub fn kinds(&self) -> Vec<&'static str> {
        self.events().iter().map(SessionEvent::kind).collect()
    }

    pub fn count(&self, kind: &str) -> usize {
        self.events().iter().filter(|e| e.kind() == kind).count()
    }

    pub fn clear(&self) {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clear();
    }
}

impl EventSink for RecordingSink {
    fn on_connect(&self, client_ref: &str, resumed_session: bool) {
        self.record(SessionEvent::Connect {
            client_ref: client_ref.to_string(),
            resumed_session,
        });
    }

    fn on_disconnect(&self, client_ref: &str, reason: DisconnectReason) {
        self.record(SessionEvent::Disconnect {
            client_ref: client_ref.to_string(),
            reason,
        });
    }

    fn on_error(&self, client_ref: &str, cause: ErrorCause, message: &str) {
        self.record(SessionEvent::Error {
            client_ref: client_ref.to_string(),
            cause,
            message: message.to_string(),
        });
    }

    fn on_message(&self, client_ref: &str, message: &InboundMessage) {
        self.record(SessionEvent::Message {
            client_ref: client_ref.to_string(),
            message: message.clone(),
        });
    }

    fn on_subscribed(&self, client_ref: &str, topic: &str, qos: QoS, success: bool) {
        self.record(SessionEvent::Subscribed {
            client_ref: client_ref.to_string(),
            topic: topic.to_string(),
            qos,
            success,
        });
    }

    fn on_unsubscribed(&self, client_ref: &str, topic: &str) {
        self.record(SessionEvent::Unsubscribed {
            client_ref: client_ref.to_string(),
            topic: topic.to_string(),
        });
    }

    fn on_delivered(&self, client_ref: &str, message_id: u16, topic: &str) {
        self.record(SessionEvent::Delivered {
            client_ref: client_ref.to_string(),
            message_id,
            topic: topic.to_string(),
        });
    }

    fn on_publish_failed(
        &self,
        client_ref: &str,
        message_id: Option<u16>,
        topic: &str,
        reason: &str,
    ) {
        self.record(SessionEvent::PublishFailed {
            client_ref: client_ref.to_string(),
            message_id,
            topic: topic.to_string(),
            reason: reason.to_string(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn options() -> ConnectOptions {
        ConnectOptions {
            client_id: "mock".into(),
            host: "localhost".into(),
            port: 1883,
            keep_alive: Duration::from_secs(60),
            clean_session: true,
            credentials: None,
            tls: None,
            last_will: None,
        }
    }

    #[tokio::test]
    async fn test_scripted_open_outcomes() {
        let (mut transport, broker) = MockTransport::new();
        broker.script_open(OpenBehavior::Reject(TransportError::AuthenticationRejected(
            "bad password".into(),
        )));

        assert!(transport.open(&options()).await.is_err());
        assert!(!broker.is_linked());

        let ack = transport.open(&options()).await.unwrap();
        assert!(!ack.session_present);
        assert!(broker.is_linked());
        assert_eq!(broker.opens(), 2);
    }

    #[tokio::test]
    async fn test_auto_ack_answers_subscribe() {
        let (mut transport, broker) = MockTransport::new();
        broker.set_auto_ack(true);
        transport.open(&options()).await.unwrap();

        transport
            .send(OutboundPacket::Subscribe {
                packet_id: 4,
                filters: vec![("a/+".into(), QoS::AtLeastOnce)],
            })
            .await
            .unwrap();

        assert_eq!(
            transport.recv().await,
            InboundEvent::SubAck {
                packet_id: 4,
                results: vec![Some(QoS::AtLeastOnce)]
            }
        );
        assert_eq!(broker.sent().len(), 1);
    }

    #[tokio::test]
    async fn test_close_unlinks_and_failed_send() {
        let (mut transport, broker) = MockTransport::new();
        transport.open(&options()).await.unwrap();
        broker.fail_next_send(TransportError::LinkClosed("reset".into()));

        assert!(transport.send(OutboundPacket::PingReq).await.is_err());
        transport.close().await;

        assert!(!broker.is_linked());
        assert!(!broker.inject(InboundEvent::PingResp));
        assert_eq!(broker.closes(), 1);
        assert!(broker.sent().is_empty());
    }

    #[test]
    fn test_recording_sink_counts_kinds() {
        let sink = RecordingSink::new();
        sink.on_connect("c1", false);
        sink.on_subscribed("c1", "a/b", QoS::AtMostOnce, true);
        sink.on_subscribed("c1", "a/c", QoS::AtMostOnce, false);

        assert_eq!(sink.kinds(), vec!["connect", "subscribed", "subscribed"]);
        assert_eq!(sink.count("subscribed"), 2);
        sink.clear();
        assert!(sink.events().is_empty());
    }
}
