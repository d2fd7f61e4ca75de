//! Sans-I/O session orchestration
//!
//! [`Session`] composes the connection state machine, the subscription
//! registry and the delivery engine behind the public session contract.
//! It never performs I/O or reads the clock: every operation receives `now`
//! and returns the [`Action`]s the driver must carry out, in order. Events
//! are emitted synchronously through the session's sink.

use super::connection::{
    ConnectionState, ConnectionStateMachine, DisconnectReason, ErrorCause, HandshakeOutcome,
    LinkLossOutcome, ReconnectPolicy, TimerEvent,
};
use super::delivery::{
    DeliveryConfig, DeliveryEngine, DeliveryError, PendingPublish, QueuedPublish,
};
use super::subscriptions::{
    SubscribeOutcome, Subscription, SubscriptionRegistry, UnsubscribeOutcome,
};
use super::topic::{validate_topic_filter, validate_topic_name};
use crate::error::{SessionError, SessionResult};
use crate::events::{EventEmitter, EventSink};
use crate::transport::{ConnAck, ConnectOptions, InboundEvent, OutboundPacket, QoS, TransportError};
use bytes::Bytes;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Work the driver performs on behalf of the session
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    /// Open the transport with [`Session::connect_options`]
    Open,
    /// Write a packet on the open link
    Send(OutboundPacket),
    /// Drop the link or abort the handshake in flight
    Close,
}

/// Everything a session needs besides its sink
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub connect: ConnectOptions,
    pub reconnect: ReconnectPolicy,
    pub connect_timeout: Duration,
    pub delivery: DeliveryConfig,
}

/// Outcome of an accepted publish
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublishReceipt {
    /// Packet identifier for QoS 1/2 publishes sent immediately
    pub message_id: Option<u16>,
    /// Held in the offline queue until the next connect
    pub queued: bool,
}

pub struct Session {
    options: SessionOptions,
    connection: ConnectionStateMachine,
    subscriptions: SubscriptionRegistry,
    delivery: DeliveryEngine,
    events: EventEmitter,
    link_up: bool,
    torn_down: bool,
}

impl Session {
    /// `client_keep_alive` is false when the transport pings on its own
    pub fn new(
        client_ref: impl Into<String>,
        options: SessionOptions,
        sink: Arc<dyn EventSink>,
        client_keep_alive: bool,
    ) -> Self {
        let keep_alive = client_keep_alive.then_some(options.connect.keep_alive);
        Self {
            connection: ConnectionStateMachine::new(
                options.reconnect.clone(),
                options.connect_timeout,
                keep_alive,
            ),
            subscriptions: SubscriptionRegistry::new(),
            delivery: DeliveryEngine::new(options.delivery.clone()),
            events: EventEmitter::new(client_ref.into(), sink),
            options,
            link_up: false,
            torn_down: false,
        }
    }

    pub fn client_ref(&self) -> &str {
        self.events.client_ref()
    }

    pub fn connect_options(&self) -> &ConnectOptions {
        &self.options.connect
    }

    pub fn state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_connected()
    }

    pub fn is_torn_down(&self) -> bool {
        self.torn_down
    }

    pub fn is_subscribed(&self, topic: &str) -> bool {
        self.subscriptions.is_subscribed(topic)
    }

    /// Confirmed topic filters, ordered
    pub fn topics(&self) -> Vec<String> {
        self.subscriptions.topics()
    }

    pub fn subscription(&self, topic: &str) -> Option<Subscription> {
        self.subscriptions.get(topic)
    }

    pub fn in_flight(&self) -> Vec<PendingPublish> {
        self.delivery.in_flight()
    }

    pub fn queued_len(&self) -> usize {
        self.delivery.queued_len()
    }

    /// Start the initial connect
    pub fn connect(&mut self, now: Instant) -> SessionResult<Vec<Action>> {
        self.ensure_alive()?;
        self.connection
            .begin_connect(now)
            .map_err(|invalid| SessionError::InvalidState {
                operation: invalid.operation,
                state: invalid.state,
            })?;
        info!(
            client_ref = %self.client_ref(),
            host = %self.options.connect.host,
            port = self.options.connect.port,
            "Connecting to MQTT broker"
        );
        Ok(vec![Action::Open])
    }

    /// User-requested disconnect; a no-op when already disconnected
    pub fn disconnect(&mut self, now: Instant) -> Vec<Action> {
        let previous = self.connection.disconnect();
        if previous == ConnectionState::Disconnected {
            return Vec::new();
        }

        let mut actions = Vec::new();
        if self.link_up {
            self.send(now, OutboundPacket::Disconnect, &mut actions);
            self.drop_link();
        }
        actions.push(Action::Close);
        info!(client_ref = %self.client_ref(), from = %previous, "Disconnected by request");
        self.events.disconnect(DisconnectReason::UserRequested);
        actions
    }

    /// Tear down whatever is in progress and connect again
    pub fn reconnect(&mut self, now: Instant) -> SessionResult<Vec<Action>> {
        self.ensure_alive()?;
        let mut actions = self.disconnect(now);
        actions.extend(self.connect(now)?);
        Ok(actions)
    }

    /// Silence the session for good and release the link
    pub fn teardown(&mut self, now: Instant) -> Vec<Action> {
        self.events.silence();
        let actions = self.disconnect(now);
        self.torn_down = true;
        actions
    }

    pub fn subscribe(&mut self, now: Instant, topic: &str, qos: QoS) -> SessionResult<Vec<Action>> {
        self.ensure_alive()?;
        validate_topic_filter(topic).map_err(|err| SessionError::invalid_topic(topic, err))?;

        let mut actions = Vec::new();
        match self.subscriptions.subscribe(topic, qos) {
            SubscribeOutcome::Unchanged | SubscribeOutcome::AwaitingAck => {
                debug!(client_ref = %self.client_ref(), %topic, "Subscription already requested");
            }
            SubscribeOutcome::NeedsRequest if self.link_up => {
                self.send_subscribe(now, vec![(topic.to_string(), qos)], &mut actions)?;
            }
            SubscribeOutcome::NeedsRequest => {
                debug!(client_ref = %self.client_ref(), %topic, "Subscription queued until connected");
            }
        }
        Ok(actions)
    }

    pub fn unsubscribe(&mut self, now: Instant, topic: &str) -> SessionResult<Vec<Action>> {
        self.ensure_alive()?;
        validate_topic_filter(topic).map_err(|err| SessionError::invalid_topic(topic, err))?;

        let mut actions = Vec::new();
        match self.subscriptions.unsubscribe(
            topic,
            self.link_up,
            self.options.connect.clean_session,
        ) {
            UnsubscribeOutcome::NotSubscribed => {
                debug!(client_ref = %self.client_ref(), %topic, "Unsubscribe for unknown topic ignored");
            }
            UnsubscribeOutcome::NeedsRequest => self.send_unsubscribe(now, topic, &mut actions)?,
            UnsubscribeOutcome::Deferred => {
                debug!(client_ref = %self.client_ref(), %topic, "Unsubscribe deferred until connected");
            }
            UnsubscribeOutcome::Completed => self.events.unsubscribed(topic),
        }
        Ok(actions)
    }

    pub fn publish(
        &mut self,
        now: Instant,
        topic: &str,
        payload: Bytes,
        qos: QoS,
        retain: bool,
    ) -> SessionResult<(PublishReceipt, Vec<Action>)> {
        self.ensure_alive()?;
        validate_topic_name(topic).map_err(|err| SessionError::invalid_topic(topic, err))?;

        if !self.link_up {
            let queued = self.delivery.enqueue(QueuedPublish {
                topic: topic.to_string(),
                payload,
                qos,
                retain,
            });
            return match queued {
                Ok(depth) => {
                    debug!(client_ref = %self.client_ref(), %topic, depth, "Publish queued while offline");
                    Ok((
                        PublishReceipt {
                            message_id: None,
                            queued: true,
                        },
                        Vec::new(),
                    ))
                }
                Err(DeliveryError::QueueFull { limit }) => Err(SessionError::QueueFull { limit }),
                Err(_) => Err(SessionError::NotConnected {
                    state: self.state(),
                }),
            };
        }

        let packet = self
            .delivery
            .publish(now, topic.to_string(), payload, qos, retain)
            .map_err(|err| SessionError::resource_exhaustion(err.to_string()))?;
        let message_id = match &packet {
            OutboundPacket::Publish { packet_id, .. } if *packet_id != 0 => Some(*packet_id),
            _ => None,
        };
        let mut actions = Vec::new();
        self.send(now, packet, &mut actions);
        Ok((
            PublishReceipt {
                message_id,
                queued: false,
            },
            actions,
        ))
    }

    /// CONNACK received for the handshake in flight
    pub fn handshake_succeeded(&mut self, now: Instant, ack: ConnAck) -> Vec<Action> {
        if !self.connection.handshake_succeeded(now) {
            return vec![Action::Close];
        }
        self.link_up = true;

        let resumed = ack.session_present && !self.options.connect.clean_session;
        info!(
            client_ref = %self.client_ref(),
            resumed,
            in_flight = self.delivery.in_flight_count(),
            queued = self.delivery.queued_len(),
            "MQTT connection established"
        );

        // Session state first, so everything sent below sees a consistent view
        for topic in self.subscriptions.on_session_start(resumed) {
            self.events.unsubscribed(&topic);
        }
        self.delivery.on_session_start(resumed);

        let mut actions = Vec::new();

        let filters = self.subscriptions.unrequested();
        if !filters.is_empty() {
            if let Err(err) = self.send_subscribe(now, filters, &mut actions) {
                warn!(client_ref = %self.client_ref(), error = %err, "Subscriptions left pending");
            }
        }

        for topic in self.subscriptions.take_deferred_unsubscribes() {
            if let Err(err) = self.send_unsubscribe(now, &topic, &mut actions) {
                warn!(client_ref = %self.client_ref(), %topic, error = %err, "Deferred unsubscribe dropped");
            }
        }

        for packet in self.delivery.resend_in_flight(now) {
            self.send(now, packet, &mut actions);
        }

        let (packets, failures) = self.delivery.drain_offline(now);
        for packet in packets {
            self.send(now, packet, &mut actions);
        }
        for failure in failures {
            self.events
                .publish_failed(failure.message_id, &failure.topic, &failure.reason);
        }

        self.events.connect(resumed);
        actions
    }

    /// Handshake failed with a transport error
    pub fn handshake_failed(&mut self, now: Instant, error: &TransportError) -> Vec<Action> {
        let cause = error.cause();
        match self.connection.handshake_failed(now, cause) {
            HandshakeOutcome::Failed { cause, attempts } => {
                let message = if attempts > 0 {
                    format!("reconnect abandoned after {attempts} attempt(s): {error}")
                } else {
                    error.to_string()
                };
                warn!(client_ref = %self.client_ref(), ?cause, %message, "Connection failed");
                self.events.error(cause, &message);
            }
            HandshakeOutcome::RetryScheduled { attempt, delay } => {
                debug!(
                    client_ref = %self.client_ref(),
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "Next reconnection attempt scheduled"
                );
            }
            HandshakeOutcome::Ignored => {
                debug!(client_ref = %self.client_ref(), error = %error, "Stale handshake failure ignored");
            }
        }
        vec![Action::Close]
    }

    /// Route one transport event
    pub fn handle_event(&mut self, now: Instant, event: InboundEvent) -> Vec<Action> {
        if !self.link_up {
            debug!(client_ref = %self.client_ref(), ?event, "Event without a live link ignored");
            return Vec::new();
        }

        let mut actions = Vec::new();
        match event {
            InboundEvent::Publish(publish) => {
                let outcome = self.delivery.handle_publish(publish);
                if let Some(reply) = outcome.reply {
                    self.send(now, reply, &mut actions);
                }
                if let Some(message) = outcome.deliver {
                    if !self.subscriptions.matches(&message.topic) {
                        debug!(
                            client_ref = %self.client_ref(),
                            topic = %message.topic,
                            "Message on a topic without a confirmed subscription"
                        );
                    }
                    self.events.message(&message);
                }
            }
            InboundEvent::PubAck { packet_id } => {
                if let Some(done) = self.delivery.handle_puback(packet_id) {
                    self.events.delivered(done.message_id, &done.topic);
                }
            }
            InboundEvent::PubRec { packet_id } => {
                if let Some(release) = self.delivery.handle_pubrec(now, packet_id) {
                    self.send(now, release, &mut actions);
                }
            }
            InboundEvent::PubRel { packet_id } => {
                let complete = self.delivery.handle_pubrel(packet_id);
                self.send(now, complete, &mut actions);
            }
            InboundEvent::PubComp { packet_id } => {
                if let Some(done) = self.delivery.handle_pubcomp(packet_id) {
                    self.events.delivered(done.message_id, &done.topic);
                }
            }
            InboundEvent::SubAck { packet_id, results } => {
                self.delivery.release_id(packet_id);
                for result in self.subscriptions.handle_suback(packet_id, &results) {
                    if !result.success {
                        warn!(client_ref = %self.client_ref(), topic = %result.topic, "Subscription rejected by broker");
                    }
                    self.events
                        .subscribed(&result.topic, result.qos, result.success);
                }
            }
            InboundEvent::UnsubAck { packet_id } => {
                self.delivery.release_id(packet_id);
                if let Some(topic) = self.subscriptions.handle_unsuback(packet_id) {
                    self.events.unsubscribed(&topic);
                }
            }
            InboundEvent::PingResp => self.connection.record_ping_response(),
            InboundEvent::ProtocolViolation(detail) => {
                warn!(client_ref = %self.client_ref(), %detail, "Protocol violation from transport");
                self.events.error(ErrorCause::ProtocolViolation, &detail);
                actions.extend(self.link_lost(now, DisconnectReason::TransportError, &detail));
            }
            InboundEvent::LinkClosed { reason, detail } => {
                actions.extend(self.link_lost(now, reason, &detail));
            }
        }
        actions
    }

    /// A failed write means the link is gone
    pub fn send_failed(&mut self, now: Instant, error: &TransportError) -> Vec<Action> {
        if !self.link_up {
            return Vec::new();
        }
        self.link_lost(now, DisconnectReason::TransportError, &error.to_string())
    }

    /// Earliest timer the driver must wake up for
    pub fn next_deadline(&self) -> Option<Instant> {
        let ack = if self.link_up {
            self.delivery.next_deadline()
        } else {
            None
        };
        [self.connection.next_deadline(), ack]
            .into_iter()
            .flatten()
            .min()
    }

    /// Fire every timer that expired by `now`
    pub fn handle_timeout(&mut self, now: Instant) -> Vec<Action> {
        let mut actions = Vec::new();

        for timer in self.connection.poll_timers(now) {
            match timer {
                TimerEvent::StartAttempt { .. } => actions.push(Action::Open),
                TimerEvent::HandshakeTimedOut => {
                    let error = TransportError::NetworkUnreachable(format!(
                        "no CONNACK within {}s",
                        self.options.connect_timeout.as_secs()
                    ));
                    actions.extend(self.handshake_failed(now, &error));
                }
                TimerEvent::SendPing => actions.push(Action::Send(OutboundPacket::PingReq)),
                TimerEvent::KeepAliveExpired => {
                    actions.extend(self.link_lost(
                        now,
                        DisconnectReason::KeepAliveTimeout,
                        "no PINGRESP within keep-alive interval",
                    ));
                }
            }
        }

        if self.link_up {
            for failure in self.delivery.poll_ack_timeouts(now) {
                self.events
                    .publish_failed(failure.message_id, &failure.topic, &failure.reason);
            }
        }
        actions
    }

    fn link_lost(&mut self, now: Instant, reason: DisconnectReason, detail: &str) -> Vec<Action> {
        self.drop_link();
        match self.connection.link_lost(now) {
            LinkLossOutcome::Ignored => Vec::new(),
            outcome => {
                warn!(client_ref = %self.client_ref(), ?reason, %detail, ?outcome, "MQTT connection lost");
                self.events.disconnect(reason);
                vec![Action::Close]
            }
        }
    }

    fn drop_link(&mut self) {
        if self.link_up {
            self.link_up = false;
            self.subscriptions.on_link_lost();
            self.delivery.on_link_lost();
        }
    }

    fn send_subscribe(
        &mut self,
        now: Instant,
        filters: Vec<(String, QoS)>,
        actions: &mut Vec<Action>,
    ) -> SessionResult<()> {
        let packet_id = self
            .delivery
            .reserve_id()
            .map_err(|err| SessionError::resource_exhaustion(err.to_string()))?;
        self.subscriptions.mark_requested(packet_id, &filters);
        self.send(now, OutboundPacket::Subscribe { packet_id, filters }, actions);
        Ok(())
    }

    fn send_unsubscribe(
        &mut self,
        now: Instant,
        topic: &str,
        actions: &mut Vec<Action>,
    ) -> SessionResult<()> {
        let packet_id = self
            .delivery
            .reserve_id()
            .map_err(|err| SessionError::resource_exhaustion(err.to_string()))?;
        self.subscriptions.mark_unsubscribe_requested(packet_id, topic);
        self.send(
            now,
            OutboundPacket::Unsubscribe {
                packet_id,
                topic: topic.to_string(),
            },
            actions,
        );
        Ok(())
    }

    fn send(&mut self, now: Instant, packet: OutboundPacket, actions: &mut Vec<Action>) {
        self.connection.record_outbound(now);
        actions.push(Action::Send(packet));
    }

    fn ensure_alive(&self) -> SessionResult<()> {
        if self.torn_down {
            Err(SessionError::SessionClosed)
        } else {
            Ok(())
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("client_ref", &self.client_ref())
            .field("state", &self.state())
            .field("link_up", &self.link_up)
            .field("subscriptions", &self.subscriptions.len())
            .field("in_flight", &self.delivery.in_flight_count())
            .field("queued", &self.delivery.queued_len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{ChannelEventSink, SessionEvent};
    use crate::session::delivery::OfflinePolicy;
    use tokio::sync::mpsc::UnboundedReceiver;

    fn options() -> SessionOptions {
        SessionOptions {
            connect: ConnectOptions {
                client_id: "unit".into(),
                host: "localhost".into(),
                port: 1883,
                keep_alive: Duration::from_secs(30),
                clean_session: false,
                credentials: None,
                tls: None,
                last_will: None,
            },
            reconnect: ReconnectPolicy {
                enabled: true,
                initial_delay: Duration::from_millis(100),
                max_delay: Duration::from_secs(1),
                max_attempts: Some(3),
                max_elapsed: None,
                jitter: false,
            },
            connect_timeout: Duration::from_secs(5),
            delivery: DeliveryConfig::default(),
        }
    }

    fn session(options: SessionOptions) -> (Session, UnboundedReceiver<SessionEvent>) {
        let (sink, rx) = ChannelEventSink::new();
        (Session::new("c1", options, Arc::new(sink), true), rx)
    }

    fn drain(rx: &mut UnboundedReceiver<SessionEvent>) -> Vec<SessionEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    fn connected(now: Instant) -> (Session, UnboundedReceiver<SessionEvent>) {
        let (mut session, mut rx) = session(options());
        session.connect(now).unwrap();
        session.handshake_succeeded(
            now,
            ConnAck {
                session_present: false,
            },
        );
        drain(&mut rx);
        (session, rx)
    }

    #[test]
    fn test_connect_emits_open_then_connect_event() {
        let now = Instant::now();
        let (mut session, mut rx) = session(options());

        assert_eq!(session.connect(now).unwrap(), vec![Action::Open]);
        assert_eq!(session.state(), ConnectionState::Connecting);
        assert!(drain(&mut rx).is_empty());

        let actions = session.handshake_succeeded(
            now,
            ConnAck {
                session_present: true,
            },
        );
        assert!(actions.is_empty());
        assert_eq!(
            drain(&mut rx),
            vec![SessionEvent::Connect {
                client_ref: "c1".into(),
                resumed_session: true
            }]
        );
    }

    #[test]
    fn test_connect_while_connected_is_invalid_state() {
        let now = Instant::now();
        let (mut session, _rx) = connected(now);
        assert!(matches!(
            session.connect(now),
            Err(SessionError::InvalidState {
                state: ConnectionState::Connected,
                ..
            })
        ));
    }

    #[test]
    fn test_initial_handshake_failure_is_terminal() {
        let now = Instant::now();
        let (mut session, mut rx) = session(options());
        session.connect(now).unwrap();

        let actions = session.handshake_failed(
            now,
            &TransportError::AuthenticationRejected("bad credentials".into()),
        );

        assert_eq!(actions, vec![Action::Close]);
        assert_eq!(session.state(), ConnectionState::Failed);
        assert!(matches!(
            drain(&mut rx).as_slice(),
            [SessionEvent::Error {
                cause: ErrorCause::AuthenticationRejected,
                ..
            }]
        ));
        assert_eq!(session.next_deadline(), None);
    }

    #[test]
    fn test_disconnect_when_connected_sends_disconnect() {
        let now = Instant::now();
        let (mut session, mut rx) = connected(now);

        assert_eq!(
            session.disconnect(now),
            vec![Action::Send(OutboundPacket::Disconnect), Action::Close]
        );
        assert_eq!(
            drain(&mut rx),
            vec![SessionEvent::Disconnect {
                client_ref: "c1".into(),
                reason: DisconnectReason::UserRequested
            }]
        );
        assert!(session.disconnect(now).is_empty());
    }

    #[test]
    fn test_subscribe_offline_is_flushed_on_connect() {
        let now = Instant::now();
        let (mut session, _rx) = session(options());

        assert!(session
            .subscribe(now, "sensors/+", QoS::AtLeastOnce)
            .unwrap()
            .is_empty());
        session.connect(now).unwrap();
        let actions = session.handshake_succeeded(
            now,
            ConnAck {
                session_present: false,
            },
        );

        assert_eq!(
            actions,
            vec![Action::Send(OutboundPacket::Subscribe {
                packet_id: 1,
                filters: vec![("sensors/+".into(), QoS::AtLeastOnce)]
            })]
        );
    }

    #[test]
    fn test_invalid_topics_rejected() {
        let now = Instant::now();
        let (mut session, _rx) = connected(now);

        assert!(matches!(
            session.subscribe(now, "a/#/b", QoS::AtMostOnce),
            Err(SessionError::InvalidTopic { .. })
        ));
        assert!(matches!(
            session.publish(now, "a/+", Bytes::new(), QoS::AtMostOnce, false),
            Err(SessionError::InvalidTopic { .. })
        ));
    }

    #[test]
    fn test_fail_fast_publish_offline() {
        let now = Instant::now();
        let mut opts = options();
        opts.delivery.offline_policy = OfflinePolicy::FailFast;
        let (mut session, _rx) = session(opts);

        assert!(matches!(
            session.publish(now, "t", Bytes::new(), QoS::AtLeastOnce, false),
            Err(SessionError::NotConnected {
                state: ConnectionState::Disconnected
            })
        ));
    }

    #[test]
    fn test_queued_publish_sent_after_subscriptions() {
        let now = Instant::now();
        let (mut session, _rx) = session(options());
        let (receipt, actions) = session
            .publish(now, "t", Bytes::from_static(b"x"), QoS::AtLeastOnce, false)
            .unwrap();
        assert!(receipt.queued);
        assert!(actions.is_empty());
        session.subscribe(now, "s", QoS::AtMostOnce).unwrap();

        session.connect(now).unwrap();
        let actions = session.handshake_succeeded(
            now,
            ConnAck {
                session_present: false,
            },
        );

        assert_eq!(actions.len(), 2);
        assert!(matches!(
            actions[0],
            Action::Send(OutboundPacket::Subscribe { .. })
        ));
        assert!(matches!(
            actions[1],
            Action::Send(OutboundPacket::Publish { packet_id: 2, dup: false, .. })
        ));
        assert_eq!(session.queued_len(), 0);
    }

    #[test]
    fn test_protocol_violation_emits_error_and_reconnects() {
        let now = Instant::now();
        let (mut session, mut rx) = connected(now);

        let actions = session.handle_event(
            now,
            InboundEvent::ProtocolViolation("unexpected CONNACK".into()),
        );

        assert_eq!(actions, vec![Action::Close]);
        assert_eq!(session.state(), ConnectionState::Reconnecting);
        let kinds: Vec<_> = drain(&mut rx).iter().map(|e| e.kind()).collect();
        assert_eq!(kinds, vec!["error", "disconnect"]);
    }

    #[test]
    fn test_keep_alive_expiry_drops_link() {
        let now = Instant::now();
        let (mut session, mut rx) = connected(now);

        let ping_at = session.next_deadline().unwrap();
        assert_eq!(
            session.handle_timeout(ping_at),
            vec![Action::Send(OutboundPacket::PingReq)]
        );
        let expiry = session.next_deadline().unwrap();
        assert_eq!(session.handle_timeout(expiry), vec![Action::Close]);

        assert_eq!(
            drain(&mut rx),
            vec![SessionEvent::Disconnect {
                client_ref: "c1".into(),
                reason: DisconnectReason::KeepAliveTimeout
            }]
        );
    }

    #[test]
    fn test_teardown_silences_session() {
        let now = Instant::now();
        let (mut session, mut rx) = connected(now);

        let actions = session.teardown(now);

        assert_eq!(
            actions,
            vec![Action::Send(OutboundPacket::Disconnect), Action::Close]
        );
        assert!(drain(&mut rx).is_empty());
        assert!(matches!(
            session.subscribe(now, "a", QoS::AtMostOnce),
            Err(SessionError::SessionClosed)
        ));
    }

    #[test]
    fn test_events_ignored_without_link() {
        let now = Instant::now();
        let (mut session, mut rx) = session(options());
        assert!(session
            .handle_event(now, InboundEvent::PubAck { packet_id: 1 })
            .is_empty());
        assert!(drain(&mut rx).is_empty());
    }
}
