//! Transport adapter seam
//!
//! The session core never touches sockets, TLS or the wire codec. It hands
//! already-decoded packets to a [`Transport`] and receives decoded
//! [`InboundEvent`]s back. The concrete binding over rumqttc lives in
//! [`rumqtt`]; tests use [`crate::testing::MockTransport`].

use crate::session::connection::{DisconnectReason, ErrorCause};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

pub mod rumqtt;

pub use rumqtt::RumqttcTransport;

/// MQTT Quality of Service level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
#[repr(u8)]
pub enum QoS {
    /// At most once delivery (fire and forget).
    AtMostOnce = 0,
    /// At least once delivery (acknowledged delivery).
    AtLeastOnce = 1,
    /// Exactly once delivery (assured delivery).
    ExactlyOnce = 2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("invalid QoS level {0}, expected 0, 1 or 2")]
pub struct InvalidQoS(pub u8);

impl TryFrom<u8> for QoS {
    type Error = InvalidQoS;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(QoS::AtMostOnce),
            1 => Ok(QoS::AtLeastOnce),
            2 => Ok(QoS::ExactlyOnce),
            other => Err(InvalidQoS(other)),
        }
    }
}

impl From<QoS> for u8 {
    fn from(qos: QoS) -> Self {
        qos as u8
    }
}

impl fmt::Display for QoS {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", *self as u8)
    }
}

/// Username/password pair sent in CONNECT
#[derive(Clone, PartialEq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

/// TLS policy handed to the transport
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TlsOptions {
    /// PEM-encoded certificates to trust exclusively. Empty means the
    /// platform trust store.
    pub pinned_certificates: Vec<Vec<u8>>,
}

/// Last-will message registered with the broker at connect time
#[derive(Debug, Clone, PartialEq)]
pub struct LastWill {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
}

/// Everything the transport needs to open a link and send CONNECT
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectOptions {
    pub client_id: String,
    pub host: String,
    pub port: u16,
    pub keep_alive: Duration,
    pub clean_session: bool,
    pub credentials: Option<Credentials>,
    pub tls: Option<TlsOptions>,
    pub last_will: Option<LastWill>,
}

/// Successful CONNACK
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnAck {
    /// Broker still holds state for this client identifier
    pub session_present: bool,
}

/// Decoded packet the session asks the transport to write
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundPacket {
    Publish {
        /// 0 for QoS 0
        packet_id: u16,
        topic: String,
        payload: Bytes,
        qos: QoS,
        retain: bool,
        dup: bool,
    },
    PubAck {
        packet_id: u16,
    },
    PubRec {
        packet_id: u16,
    },
    PubRel {
        packet_id: u16,
    },
    PubComp {
        packet_id: u16,
    },
    Subscribe {
        packet_id: u16,
        filters: Vec<(String, QoS)>,
    },
    Unsubscribe {
        packet_id: u16,
        topic: String,
    },
    PingReq,
    Disconnect,
}

impl OutboundPacket {
    /// Short packet name for logs
    pub fn kind(&self) -> &'static str {
        match self {
            OutboundPacket::Publish { .. } => "PUBLISH",
            OutboundPacket::PubAck { .. } => "PUBACK",
            OutboundPacket::PubRec { .. } => "PUBREC",
            OutboundPacket::PubRel { .. } => "PUBREL",
            OutboundPacket::PubComp { .. } => "PUBCOMP",
            OutboundPacket::Subscribe { .. } => "SUBSCRIBE",
            OutboundPacket::Unsubscribe { .. } => "UNSUBSCRIBE",
            OutboundPacket::PingReq => "PINGREQ",
            OutboundPacket::Disconnect => "DISCONNECT",
        }
    }
}

/// PUBLISH received from the broker
#[derive(Debug, Clone, PartialEq)]
pub struct InboundPublish {
    pub packet_id: u16,
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
    pub dup: bool,
}

/// Event raised by the transport while a link is up
#[derive(Debug, Clone, PartialEq)]
pub enum InboundEvent {
    Publish(InboundPublish),
    PubAck {
        packet_id: u16,
    },
    PubRec {
        packet_id: u16,
    },
    PubRel {
        packet_id: u16,
    },
    PubComp {
        packet_id: u16,
    },
    /// One result per requested filter, in request order; `None` is a
    /// broker-side rejection
    SubAck {
        packet_id: u16,
        results: Vec<Option<QoS>>,
    },
    UnsubAck {
        packet_id: u16,
    },
    PingResp,
    /// Malformed or out-of-order packet detected by the codec
    ProtocolViolation(String),
    /// The link is gone; the transport must be reopened before further use
    LinkClosed {
        reason: DisconnectReason,
        detail: String,
    },
}

/// Failures reported by a transport
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("network unreachable: {0}")]
    NetworkUnreachable(String),
    #[error("TLS handshake failed: {0}")]
    TlsHandshake(String),
    #[error("authentication rejected: {0}")]
    AuthenticationRejected(String),
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
    #[error("link closed: {0}")]
    LinkClosed(String),
}

impl TransportError {
    /// Map onto the cause carried by `error` events
    pub fn cause(&self) -> ErrorCause {
        match self {
            TransportError::NetworkUnreachable(_) | TransportError::LinkClosed(_) => {
                ErrorCause::NetworkUnreachable
            }
            TransportError::TlsHandshake(_) => ErrorCause::TlsHandshakeFailed,
            TransportError::AuthenticationRejected(_) => ErrorCause::AuthenticationRejected,
            TransportError::ProtocolViolation(_) => ErrorCause::ProtocolViolation,
        }
    }
}

/// Transport trait for the session driver
///
/// One transport instance serves one session. `open` is called for every
/// connect or reconnect attempt and may be dropped mid-flight when the caller
/// aborts the handshake; `close` must then release whatever was allocated.
#[async_trait::async_trait]
pub trait Transport: Send {
    /// Open the link (TCP, TLS if configured) and complete CONNECT/CONNACK
    async fn open(&mut self, options: &ConnectOptions) -> Result<ConnAck, TransportError>;

    /// Write one packet on the open link
    async fn send(&mut self, packet: OutboundPacket) -> Result<(), TransportError>;

    /// Next event from the open link. Only polled while a link is up.
    async fn recv(&mut self) -> InboundEvent;

    /// Tear the link down without sending anything
    async fn close(&mut self);

    /// Whether the transport sends PINGREQ itself
    fn manages_keep_alive(&self) -> bool {
        false
    }
}
