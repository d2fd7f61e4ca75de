//! Transport binding over rumqttc (MQTT 3.1.1)
//!
//! Every `open` builds a fresh `AsyncClient`/`EventLoop` pair and polls it
//! until CONNACK; afterwards a pump task owns the event loop and forwards
//! its events. rumqttc allocates its own wire packet identifiers, so the
//! adapter keeps FIFO maps between the identifiers the session chose and the
//! ones rumqttc put on the wire. PUBREL/PUBCOMP follow-ups and PINGREQ are
//! handled by rumqttc itself.
//!
//! rumqttc forgets inbound QoS 2 identifiers whenever a link fails, and a
//! broker resuming the session re-sends PUBREL for them. The adapter keeps
//! the identifiers it answered with PUBREC but has not seen released, and
//! seeds them into the next event loop before any packet is read.
//!
//! A re-sent publish goes out through `publish_bytes`, so it carries a new
//! wire identifier and no DUP flag.

use super::{
    ConnAck, ConnectOptions, InboundEvent, InboundPublish, OutboundPacket, QoS, Transport,
    TransportError,
};
use crate::session::connection::DisconnectReason;
use async_trait::async_trait;
use rumqttc::{
    AsyncClient, ConnectReturnCode, ConnectionError, Event, EventLoop, Incoming, LastWill,
    MqttOptions, MqttState, Outgoing, Packet, Publish, StateError, SubscribeFilter,
    SubscribeReasonCode, TlsConfiguration, Transport as WireTransport,
};
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::io::ErrorKind;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

/// Capacity of rumqttc's request channel
const REQUEST_CAPACITY: usize = 64;
const EVENT_BUFFER: usize = 256;
/// How long `close` waits for a requested DISCONNECT to be flushed
const DISCONNECT_FLUSH: Duration = Duration::from_secs(1);

type PumpItem = Result<Event, ConnectionError>;

/// Wire-id to session-id bookkeeping for one link
#[derive(Debug, Default)]
struct IdMap {
    /// Session ids of publishes handed to rumqttc, awaiting their wire id
    pending_publishes: VecDeque<u16>,
    pending_subscribes: VecDeque<u16>,
    pending_unsubscribes: VecDeque<u16>,
    publishes: HashMap<u16, u16>,
    subscribes: HashMap<u16, u16>,
    unsubscribes: HashMap<u16, u16>,
}

impl IdMap {
    fn assign(pending: &mut VecDeque<u16>, assigned: &mut HashMap<u16, u16>, wire: u16) {
        match pending.pop_front() {
            Some(session_id) if session_id != 0 => {
                assigned.insert(wire, session_id);
            }
            Some(_) => {}
            None => debug!(wire_id = wire, "Outgoing packet without a pending session id"),
        }
    }

    fn resolve(assigned: &mut HashMap<u16, u16>, wire: u16) -> u16 {
        assigned.remove(&wire).unwrap_or(wire)
    }
}

/// [`Transport`] backed by rumqttc
pub struct RumqttcTransport {
    client: Option<AsyncClient>,
    events: Option<mpsc::Receiver<PumpItem>>,
    pump: Option<JoinHandle<()>>,
    ids: IdMap,
    /// Inbound QoS 1/2 publishes awaiting the session's PUBACK/PUBREC
    unacked: HashMap<u16, Publish>,
    /// Inbound QoS 2 ids answered with PUBREC and not yet released.
    /// Survives `close` so a resumed session can complete them.
    awaiting_release: BTreeSet<u16>,
    /// Events produced locally rather than by the broker
    synthetic: VecDeque<InboundEvent>,
    disconnect_requested: bool,
}

impl Default for RumqttcTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl RumqttcTransport {
    pub fn new() -> Self {
        Self {
            client: None,
            events: None,
            pump: None,
            ids: IdMap::default(),
            unacked: HashMap::new(),
            awaiting_release: BTreeSet::new(),
            synthetic: VecDeque::new(),
            disconnect_requested: false,
        }
    }

    fn client(&self) -> Result<&AsyncClient, TransportError> {
        self.client
            .as_ref()
            .ok_or_else(|| TransportError::LinkClosed("transport is not open".to_string()))
    }

    fn reset(&mut self) {
        self.client = None;
        self.events = None;
        self.ids = IdMap::default();
        self.unacked.clear();
        self.synthetic.clear();
        self.disconnect_requested = false;
    }

    /// Translate one rumqttc event; `None` for bookkeeping-only events
    fn translate(&mut self, event: Event) -> Option<InboundEvent> {
        match event {
            Event::Outgoing(outgoing) => {
                match outgoing {
                    Outgoing::Publish(wire) => IdMap::assign(
                        &mut self.ids.pending_publishes,
                        &mut self.ids.publishes,
                        wire,
                    ),
                    Outgoing::Subscribe(wire) => IdMap::assign(
                        &mut self.ids.pending_subscribes,
                        &mut self.ids.subscribes,
                        wire,
                    ),
                    Outgoing::Unsubscribe(wire) => IdMap::assign(
                        &mut self.ids.pending_unsubscribes,
                        &mut self.ids.unsubscribes,
                        wire,
                    ),
                    other => trace!(?other, "Outgoing packet"),
                }
                None
            }
            Event::Incoming(packet) => match packet {
                Packet::Publish(publish) => {
                    let inbound = InboundPublish {
                        packet_id: publish.pkid,
                        topic: publish.topic.clone(),
                        payload: publish.payload.clone(),
                        qos: from_wire_qos(publish.qos),
                        retain: publish.retain,
                        dup: publish.dup,
                    };
                    if publish.qos != rumqttc::QoS::AtMostOnce {
                        self.unacked.insert(publish.pkid, publish);
                    }
                    Some(InboundEvent::Publish(inbound))
                }
                Packet::PubAck(ack) => Some(InboundEvent::PubAck {
                    packet_id: IdMap::resolve(&mut self.ids.publishes, ack.pkid),
                }),
                Packet::PubRec(rec) => {
                    // Keep the mapping alive for the PUBCOMP that follows
                    let packet_id = self.ids.publishes.get(&rec.pkid).copied().unwrap_or(rec.pkid);
                    Some(InboundEvent::PubRec { packet_id })
                }
                Packet::PubRel(rel) => {
                    self.awaiting_release.remove(&rel.pkid);
                    Some(InboundEvent::PubRel {
                        packet_id: rel.pkid,
                    })
                }
                Packet::PubComp(comp) => Some(InboundEvent::PubComp {
                    packet_id: IdMap::resolve(&mut self.ids.publishes, comp.pkid),
                }),
                Packet::SubAck(ack) => Some(InboundEvent::SubAck {
                    packet_id: IdMap::resolve(&mut self.ids.subscribes, ack.pkid),
                    results: suback_results(&ack.return_codes),
                }),
                Packet::UnsubAck(ack) => Some(InboundEvent::UnsubAck {
                    packet_id: IdMap::resolve(&mut self.ids.unsubscribes, ack.pkid),
                }),
                Packet::PingResp => Some(InboundEvent::PingResp),
                Packet::Disconnect => Some(InboundEvent::LinkClosed {
                    reason: DisconnectReason::BrokerClosed,
                    detail: "broker sent DISCONNECT".to_string(),
                }),
                Packet::ConnAck(_) => Some(InboundEvent::ProtocolViolation(
                    "unexpected CONNACK on an established link".to_string(),
                )),
                other => {
                    trace!(?other, "Ignoring inbound packet");
                    None
                }
            },
        }
    }

    async fn ack_inbound(&mut self, packet_id: u16) -> Result<(), TransportError> {
        match self.unacked.remove(&packet_id) {
            Some(publish) => {
                self.client()?
                    .ack(&publish)
                    .await
                    .map_err(|e| TransportError::LinkClosed(e.to_string()))?;
                if publish.qos == rumqttc::QoS::ExactlyOnce {
                    self.awaiting_release.insert(packet_id);
                }
                Ok(())
            }
            None => {
                debug!(packet_id, "No inbound publish to acknowledge");
                Ok(())
            }
        }
    }

    /// Make a fresh event loop state expect PUBREL for every unreleased
    /// receipt. The broker only re-sends PUBREL when it kept the session.
    fn restore_receipts(&mut self, state: &mut MqttState, session_present: bool) {
        if !session_present {
            if !self.awaiting_release.is_empty() {
                debug!(
                    count = self.awaiting_release.len(),
                    "Broker dropped the session; forgetting unreleased receipts"
                );
            }
            self.awaiting_release.clear();
            return;
        }

        for &packet_id in &self.awaiting_release {
            let mut placeholder = Publish::new("", rumqttc::QoS::ExactlyOnce, Vec::<u8>::new());
            placeholder.pkid = packet_id;
            if let Err(e) = state.handle_incoming_packet(Incoming::Publish(placeholder)) {
                warn!(packet_id, error = %e, "Could not restore QoS 2 receipt");
            }
        }
        // Seeding queues Publish events the session already saw
        state.events.clear();
        if !self.awaiting_release.is_empty() {
            debug!(
                count = self.awaiting_release.len(),
                "Restored QoS 2 receipts awaiting PUBREL"
            );
        }
    }
}

#[async_trait]
impl Transport for RumqttcTransport {
    async fn open(&mut self, options: &ConnectOptions) -> Result<ConnAck, TransportError> {
        self.close().await;

        let (client, mut event_loop) = AsyncClient::new(mqtt_options(options), REQUEST_CAPACITY);
        let session_present = loop {
            match event_loop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(ack))) => break ack.session_present,
                Ok(event) => trace!(?event, "Event before CONNACK"),
                Err(e) => return Err(classify_connect_error(&e)),
            }
        };
        self.restore_receipts(&mut event_loop.state, session_present);

        let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER);
        self.pump = Some(tokio::spawn(pump(event_loop, events_tx)));
        self.client = Some(client);
        self.events = Some(events_rx);
        debug!(host = %options.host, port = options.port, session_present, "rumqttc link open");

        Ok(ConnAck { session_present })
    }

    async fn send(&mut self, packet: OutboundPacket) -> Result<(), TransportError> {
        let request_failed = |e: rumqttc::ClientError| TransportError::LinkClosed(e.to_string());

        match packet {
            OutboundPacket::Publish {
                packet_id,
                topic,
                payload,
                qos,
                retain,
                dup,
            } => {
                if dup {
                    trace!(packet_id, "Re-publishing on a fresh link");
                }
                let client = self.client()?.clone();
                self.ids.pending_publishes.push_back(packet_id);
                let result = client
                    .publish_bytes(topic, to_wire_qos(qos), retain, payload)
                    .await;
                if result.is_err() {
                    self.ids.pending_publishes.pop_back();
                }
                result.map_err(request_failed)
            }
            OutboundPacket::PubAck { packet_id } | OutboundPacket::PubRec { packet_id } => {
                self.ack_inbound(packet_id).await
            }
            OutboundPacket::PubRel { packet_id } => {
                if self.ids.publishes.values().any(|id| *id == packet_id) {
                    // rumqttc already answered the PUBREC on this link
                    return Ok(());
                }
                // A fresh event loop cannot release a publish it never sent;
                // complete it locally so the session does not wait forever.
                warn!(packet_id, "PUBREL for a publish from a previous link completed locally");
                self.synthetic.push_back(InboundEvent::PubComp { packet_id });
                Ok(())
            }
            OutboundPacket::PubComp { .. } | OutboundPacket::PingReq => Ok(()),
            OutboundPacket::Subscribe { packet_id, filters } => {
                let client = self.client()?.clone();
                self.ids.pending_subscribes.push_back(packet_id);
                let filters = filters
                    .into_iter()
                    .map(|(path, qos)| SubscribeFilter::new(path, to_wire_qos(qos)));
                let result = client.subscribe_many(filters).await;
                if result.is_err() {
                    self.ids.pending_subscribes.pop_back();
                }
                result.map_err(request_failed)
            }
            OutboundPacket::Unsubscribe { packet_id, topic } => {
                let client = self.client()?.clone();
                self.ids.pending_unsubscribes.push_back(packet_id);
                let result = client.unsubscribe(topic).await;
                if result.is_err() {
                    self.ids.pending_unsubscribes.pop_back();
                }
                result.map_err(request_failed)
            }
            OutboundPacket::Disconnect => {
                self.disconnect_requested = true;
                self.client()?.disconnect().await.map_err(request_failed)
            }
        }
    }

    async fn recv(&mut self) -> InboundEvent {
        loop {
            if let Some(event) = self.synthetic.pop_front() {
                return event;
            }
            let Some(events) = self.events.as_mut() else {
                return std::future::pending().await;
            };
            match events.recv().await {
                Some(Ok(event)) => {
                    if let Some(inbound) = self.translate(event) {
                        return inbound;
                    }
                }
                Some(Err(error)) => {
                    self.events = None;
                    return link_closed(&error);
                }
                None => {
                    self.events = None;
                    return InboundEvent::LinkClosed {
                        reason: DisconnectReason::TransportError,
                        detail: "event loop stopped".to_string(),
                    };
                }
            }
        }
    }

    async fn close(&mut self) {
        if let Some(mut pump) = self.pump.take() {
            if self.disconnect_requested {
                if tokio::time::timeout(DISCONNECT_FLUSH, &mut pump).await.is_err() {
                    debug!("DISCONNECT not flushed in time");
                    pump.abort();
                }
            } else {
                pump.abort();
            }
        }
        self.reset();
    }

    fn manages_keep_alive(&self) -> bool {
        true
    }
}

impl Drop for RumqttcTransport {
    fn drop(&mut self) {
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
    }
}

/// Own the event loop and forward everything it yields
async fn pump(mut event_loop: EventLoop, events: mpsc::Sender<PumpItem>) {
    loop {
        match event_loop.poll().await {
            Ok(event) => {
                let disconnecting = matches!(event, Event::Outgoing(Outgoing::Disconnect));
                if events.send(Ok(event)).await.is_err() || disconnecting {
                    break;
                }
            }
            Err(error) => {
                let _ = events.send(Err(error)).await;
                break;
            }
        }
    }
}

fn mqtt_options(options: &ConnectOptions) -> MqttOptions {
    let mut mqtt_options =
        MqttOptions::new(options.client_id.clone(), options.host.clone(), options.port);
    mqtt_options.set_keep_alive(options.keep_alive);
    mqtt_options.set_clean_session(options.clean_session);
    mqtt_options.set_manual_acks(true);

    if let Some(credentials) = &options.credentials {
        mqtt_options.set_credentials(credentials.username.clone(), credentials.password.clone());
    }

    if let Some(will) = &options.last_will {
        mqtt_options.set_last_will(LastWill::new(
            will.topic.clone(),
            will.payload.to_vec(),
            to_wire_qos(will.qos),
            will.retain,
        ));
    }

    if let Some(tls) = &options.tls {
        let transport = if tls.pinned_certificates.is_empty() {
            WireTransport::tls_with_default_config()
        } else {
            // Concatenated PEM: only these certificates are trusted
            WireTransport::tls_with_config(TlsConfiguration::Simple {
                ca: tls.pinned_certificates.concat(),
                alpn: None,
                client_auth: None,
            })
        };
        mqtt_options.set_transport(transport);
    }

    mqtt_options
}

fn to_wire_qos(qos: QoS) -> rumqttc::QoS {
    match qos {
        QoS::AtMostOnce => rumqttc::QoS::AtMostOnce,
        QoS::AtLeastOnce => rumqttc::QoS::AtLeastOnce,
        QoS::ExactlyOnce => rumqttc::QoS::ExactlyOnce,
    }
}

fn from_wire_qos(qos: rumqttc::QoS) -> QoS {
    match qos {
        rumqttc::QoS::AtMostOnce => QoS::AtMostOnce,
        rumqttc::QoS::AtLeastOnce => QoS::AtLeastOnce,
        rumqttc::QoS::ExactlyOnce => QoS::ExactlyOnce,
    }
}

fn suback_results(codes: &[SubscribeReasonCode]) -> Vec<Option<QoS>> {
    codes
        .iter()
        .map(|code| match code {
            SubscribeReasonCode::Success(qos) => Some(from_wire_qos(*qos)),
            SubscribeReasonCode::Failure => None,
        })
        .collect()
}

/// Classify a failure seen before CONNACK
fn classify_connect_error(error: &ConnectionError) -> TransportError {
    let detail = error.to_string();
    match error {
        ConnectionError::ConnectionRefused(code) => match code {
            ConnectReturnCode::BadUserNamePassword | ConnectReturnCode::NotAuthorized => {
                TransportError::AuthenticationRejected(format!("{code:?}"))
            }
            ConnectReturnCode::ServiceUnavailable => {
                TransportError::NetworkUnreachable(format!("{code:?}"))
            }
            _ => TransportError::ProtocolViolation(format!("{code:?}")),
        },
        ConnectionError::Io(_) | ConnectionError::NetworkTimeout => {
            TransportError::NetworkUnreachable(detail)
        }
        ConnectionError::Tls(_) => TransportError::TlsHandshake(detail),
        ConnectionError::MqttState(StateError::Io(_)) => TransportError::NetworkUnreachable(detail),
        _ => TransportError::ProtocolViolation(detail),
    }
}

/// Map a failure on an established link to a link-loss event
fn link_closed(error: &ConnectionError) -> InboundEvent {
    let detail = error.to_string();
    let reason = match error {
        ConnectionError::MqttState(StateError::AwaitPingResp) => {
            DisconnectReason::KeepAliveTimeout
        }
        ConnectionError::Io(e) | ConnectionError::MqttState(StateError::Io(e))
            if matches!(
                e.kind(),
                ErrorKind::UnexpectedEof | ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted
            ) =>
        {
            DisconnectReason::BrokerClosed
        }
        ConnectionError::MqttState(
            StateError::Deserialization(_) | StateError::WrongPacket | StateError::Unsolicited(_),
        ) => return InboundEvent::ProtocolViolation(detail),
        _ => DisconnectReason::TransportError,
    };
    InboundEvent::LinkClosed { reason, detail }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{Credentials, LastWill as SessionWill};
    use bytes::Bytes;
    use std::io;

    fn connect_options() -> ConnectOptions {
        ConnectOptions {
            client_id: "unit".into(),
            host: "localhost".into(),
            port: 1883,
            keep_alive: Duration::from_secs(30),
            clean_session: false,
            credentials: Some(Credentials {
                username: "user".into(),
                password: "pw".into(),
            }),
            tls: None,
            last_will: Some(SessionWill {
                topic: "status".into(),
                payload: Bytes::from_static(b"offline"),
                qos: QoS::AtLeastOnce,
                retain: true,
            }),
        }
    }

    #[test]
    fn test_mqtt_options_mapping() {
        let options = mqtt_options(&connect_options());

        assert_eq!(options.client_id(), "unit");
        assert_eq!(options.broker_address(), ("localhost".to_string(), 1883));
        assert_eq!(options.keep_alive(), Duration::from_secs(30));
        assert!(!options.clean_session());
        assert!(options.manual_acks());
        assert_eq!(
            options.credentials(),
            Some(("user".to_string(), "pw".to_string()))
        );
        let will = options.last_will().unwrap();
        assert_eq!(will.topic, "status");
        assert!(will.retain);
    }

    #[test]
    fn test_qos_mapping_round_trips() {
        for qos in [QoS::AtMostOnce, QoS::AtLeastOnce, QoS::ExactlyOnce] {
            assert_eq!(from_wire_qos(to_wire_qos(qos)), qos);
        }
    }

    #[test]
    fn test_suback_results() {
        let codes = [
            SubscribeReasonCode::Success(rumqttc::QoS::AtLeastOnce),
            SubscribeReasonCode::Failure,
        ];
        assert_eq!(suback_results(&codes), vec![Some(QoS::AtLeastOnce), None]);
    }

    #[test]
    fn test_connect_error_classification() {
        let refused = ConnectionError::ConnectionRefused(ConnectReturnCode::NotAuthorized);
        assert!(matches!(
            classify_connect_error(&refused),
            TransportError::AuthenticationRejected(_)
        ));

        let refused = ConnectionError::ConnectionRefused(ConnectReturnCode::BadUserNamePassword);
        assert!(matches!(
            classify_connect_error(&refused),
            TransportError::AuthenticationRejected(_)
        ));

        let refused = ConnectionError::ConnectionRefused(ConnectReturnCode::RefusedProtocolVersion);
        assert!(matches!(
            classify_connect_error(&refused),
            TransportError::ProtocolViolation(_)
        ));

        let io = ConnectionError::Io(io::Error::new(io::ErrorKind::ConnectionRefused, "refused"));
        assert!(matches!(
            classify_connect_error(&io),
            TransportError::NetworkUnreachable(_)
        ));

        assert!(matches!(
            classify_connect_error(&ConnectionError::NetworkTimeout),
            TransportError::NetworkUnreachable(_)
        ));
    }

    #[test]
    fn test_link_closed_reasons() {
        let ping = ConnectionError::MqttState(StateError::AwaitPingResp);
        assert!(matches!(
            link_closed(&ping),
            InboundEvent::LinkClosed {
                reason: DisconnectReason::KeepAliveTimeout,
                ..
            }
        ));

        let eof = ConnectionError::Io(io::Error::new(io::ErrorKind::UnexpectedEof, "eof"));
        assert!(matches!(
            link_closed(&eof),
            InboundEvent::LinkClosed {
                reason: DisconnectReason::BrokerClosed,
                ..
            }
        ));

        let timeout = ConnectionError::NetworkTimeout;
        assert!(matches!(
            link_closed(&timeout),
            InboundEvent::LinkClosed {
                reason: DisconnectReason::TransportError,
                ..
            }
        ));

        let unsolicited = ConnectionError::MqttState(StateError::Unsolicited(7));
        assert!(matches!(
            link_closed(&unsolicited),
            InboundEvent::ProtocolViolation(_)
        ));
    }

    #[test]
    fn test_translate_maps_wire_ids_back() {
        let mut transport = RumqttcTransport::new();
        transport.ids.pending_publishes.push_back(42);
        transport.ids.pending_subscribes.push_back(43);

        assert!(transport
            .translate(Event::Outgoing(Outgoing::Publish(1)))
            .is_none());
        assert!(transport
            .translate(Event::Outgoing(Outgoing::Subscribe(2)))
            .is_none());

        let ack = transport.translate(Event::Incoming(Packet::PubAck(rumqttc::PubAck::new(1))));
        assert_eq!(ack, Some(InboundEvent::PubAck { packet_id: 42 }));

        let suback = transport.translate(Event::Incoming(Packet::SubAck(rumqttc::SubAck::new(
            2,
            vec![SubscribeReasonCode::Success(rumqttc::QoS::ExactlyOnce)],
        ))));
        assert_eq!(
            suback,
            Some(InboundEvent::SubAck {
                packet_id: 43,
                results: vec![Some(QoS::ExactlyOnce)]
            })
        );
    }

    #[test]
    fn test_translate_stashes_inbound_publish_for_ack() {
        let mut transport = RumqttcTransport::new();
        let mut publish = Publish::new("sensors/a", rumqttc::QoS::AtLeastOnce, "23.5");
        publish.pkid = 9;

        let event = transport.translate(Event::Incoming(Packet::Publish(publish)));

        match event {
            Some(InboundEvent::Publish(inbound)) => {
                assert_eq!(inbound.packet_id, 9);
                assert_eq!(inbound.qos, QoS::AtLeastOnce);
                assert_eq!(&inbound.payload[..], b"23.5");
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert!(transport.unacked.contains_key(&9));
    }

    #[tokio::test]
    async fn test_pubrel_for_previous_link_completes_locally() {
        let mut transport = RumqttcTransport::new();

        transport
            .send(OutboundPacket::PubRel { packet_id: 5 })
            .await
            .unwrap();

        assert_eq!(transport.recv().await, InboundEvent::PubComp { packet_id: 5 });
    }

    fn fresh_state() -> MqttState {
        MqttState::new(100, true, 10 * 1024)
    }

    #[test]
    fn test_fresh_state_rejects_pubrel_from_previous_link() {
        let mut state = fresh_state();

        let result = state.handle_incoming_packet(Incoming::PubRel(rumqttc::PubRel::new(42)));

        assert!(matches!(result, Err(StateError::Unsolicited(42))));
    }

    #[test]
    fn test_resumed_link_completes_pubrel_from_previous_link() {
        let mut transport = RumqttcTransport::new();
        transport.awaiting_release.insert(42);
        let mut state = fresh_state();

        transport.restore_receipts(&mut state, true);

        assert!(state.events.is_empty(), "seeding must not replay publishes");
        state
            .handle_incoming_packet(Incoming::PubRel(rumqttc::PubRel::new(42)))
            .unwrap();
        assert!(state
            .events
            .iter()
            .any(|event| matches!(event, Event::Outgoing(Outgoing::PubComp(42)))));

        // The broker's PUBREL reaches the session and clears the receipt
        let event = transport.translate(Event::Incoming(Packet::PubRel(rumqttc::PubRel::new(42))));
        assert_eq!(event, Some(InboundEvent::PubRel { packet_id: 42 }));
        assert!(transport.awaiting_release.is_empty());
    }

    #[test]
    fn test_lost_broker_session_forgets_unreleased_receipts() {
        let mut transport = RumqttcTransport::new();
        transport.awaiting_release.insert(7);
        let mut state = fresh_state();

        transport.restore_receipts(&mut state, false);

        assert!(transport.awaiting_release.is_empty());
        assert!(state
            .handle_incoming_packet(Incoming::PubRel(rumqttc::PubRel::new(7)))
            .is_err());
    }

    #[tokio::test]
    async fn test_unreleased_receipts_survive_close() {
        let mut transport = RumqttcTransport::new();
        transport.awaiting_release.insert(3);

        transport.close().await;

        assert!(transport.awaiting_release.contains(&3));
    }

    #[tokio::test]
    async fn test_failed_resend_leaves_no_pending_id() {
        let mut transport = RumqttcTransport::new();
        let result = transport
            .send(OutboundPacket::Publish {
                packet_id: 11,
                topic: "sensors/a".into(),
                payload: Bytes::from_static(b"1"),
                qos: QoS::AtLeastOnce,
                retain: false,
                dup: true,
            })
            .await;
        assert!(matches!(result, Err(TransportError::LinkClosed(_))));
        assert!(transport.ids.pending_publishes.is_empty());
    }

    #[tokio::test]
    async fn test_send_without_link_fails() {
        let mut transport = RumqttcTransport::new();
        let result = transport
            .send(OutboundPacket::Subscribe {
                packet_id: 1,
                filters: vec![("a/b".into(), QoS::AtMostOnce)],
            })
            .await;
        assert!(matches!(result, Err(TransportError::LinkClosed(_))));
        assert!(transport.ids.pending_subscribes.is_empty());
    }
}
