//! Outward event surface
//!
//! Sessions report everything asynchronous through an [`EventSink`], one
//! method per event kind. Every call carries the client reference so a
//! single sink can serve many sessions.

use crate::error::sanitize_error_message;
use crate::session::connection::{DisconnectReason, ErrorCause};
use crate::transport::QoS;
use bytes::Bytes;
use serde::{Serialize, Serializer};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::trace;

/// Application message received from the broker
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InboundMessage {
    pub topic: String,
    #[serde(serialize_with = "payload_as_text")]
    pub payload: Bytes,
    pub qos: QoS,
    /// Replay of the broker's last known value rather than a live publish
    pub retained: bool,
    /// Broker marked this delivery as a retransmission
    pub duplicate: bool,
}

impl InboundMessage {
    /// Payload decoded as UTF-8, lossily
    pub fn payload_str(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }
}

fn payload_as_text<S: Serializer>(payload: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&String::from_utf8_lossy(payload))
}

/// Receiver of session events
///
/// Implementations are called from the session's driver task and must not
/// block.
pub trait EventSink: Send + Sync {
    fn on_connect(&self, client_ref: &str, resumed_session: bool);

    fn on_disconnect(&self, client_ref: &str, reason: DisconnectReason);

    fn on_error(&self, client_ref: &str, cause: ErrorCause, message: &str);

    fn on_message(&self, client_ref: &str, message: &InboundMessage);

    fn on_subscribed(&self, client_ref: &str, topic: &str, qos: QoS, success: bool);

    fn on_unsubscribed(&self, client_ref: &str, topic: &str);

    /// A QoS 1/2 publish completed its acknowledgement flow
    fn on_delivered(&self, _client_ref: &str, _message_id: u16, _topic: &str) {}

    /// A publish was given up on
    fn on_publish_failed(
        &self,
        _client_ref: &str,
        _message_id: Option<u16>,
        _topic: &str,
        _reason: &str,
    ) {
    }
}

/// Owned form of every event, for channels and JSON output
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SessionEvent {
    Connect {
        client_ref: String,
        resumed_session: bool,
    },
    Disconnect {
        client_ref: String,
        reason: DisconnectReason,
    },
    Error {
        client_ref: String,
        cause: ErrorCause,
        message: String,
    },
    Message {
        client_ref: String,
        #[serde(flatten)]
        message: InboundMessage,
    },
    Subscribed {
        client_ref: String,
        topic: String,
        qos: QoS,
        success: bool,
    },
    Unsubscribed {
        client_ref: String,
        topic: String,
    },
    Delivered {
        client_ref: String,
        message_id: u16,
        topic: String,
    },
    PublishFailed {
        client_ref: String,
        message_id: Option<u16>,
        topic: String,
        reason: String,
    },
}

impl SessionEvent {
    pub fn client_ref(&self) -> &str {
        match self {
            SessionEvent::Connect { client_ref, .. }
            | SessionEvent::Disconnect { client_ref, .. }
            | SessionEvent::Error { client_ref, .. }
            | SessionEvent::Message { client_ref, .. }
            | SessionEvent::Subscribed { client_ref, .. }
            | SessionEvent::Unsubscribed { client_ref, .. }
            | SessionEvent::Delivered { client_ref, .. }
            | SessionEvent::PublishFailed { client_ref, .. } => client_ref,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            SessionEvent::Connect { .. } => "connect",
            SessionEvent::Disconnect { .. } => "disconnect",
            SessionEvent::Error { .. } => "error",
            SessionEvent::Message { .. } => "message",
            SessionEvent::Subscribed { .. } => "subscribed",
            SessionEvent::Unsubscribed { .. } => "unsubscribed",
            SessionEvent::Delivered { .. } => "delivered",
            SessionEvent::PublishFailed { .. } => "publish_failed",
        }
    }
}

/// Sink forwarding every event into an unbounded channel
#[derive(Debug, Clone)]
pub struct ChannelEventSink {
    tx: mpsc::UnboundedSender<SessionEvent>,
}

impl ChannelEventSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn forward(&self, event: SessionEvent) {
        if self.tx.send(event).is_err() {
            trace!("Event receiver dropped");
        }
    }
}

impl EventSink for ChannelEventSink {
    fn on_connect(&self, client_ref: &str, resumed_session: bool) {
        self.forward(SessionEvent::Connect {
            client_ref: client_ref.to_string(),
            resumed_session,
        });
    }

    fn on_disconnect(&self, client_ref: &str, reason: DisconnectReason) {
        self.forward(SessionEvent::Disconnect {
            client_ref: client_ref.to_string(),
            reason,
        });
    }

    fn on_error(&self, client_ref: &str, cause: ErrorCause, message: &str) {
        self.forward(SessionEvent::Error {
            client_ref: client_ref.to_string(),
            cause,
            message: message.to_string(),
        });
    }

    fn on_message(&self, client_ref: &str, message: &InboundMessage) {
        self.forward(SessionEvent::Message {
            client_ref: client_ref.to_string(),
            message: message.clone(),
        });
    }

    fn on_subscribed(&self, client_ref: &str, topic: &str, qos: QoS, success: bool) {
        self.forward(SessionEvent::Subscribed {
            client_ref: client_ref.to_string(),
            topic: topic.to_string(),
            qos,
            success,
        });
    }

    fn on_unsubscribed(&self, client_ref: &str, topic: &str) {
        self.forward(SessionEvent::Unsubscribed {
            client_ref: client_ref.to_string(),
            topic: topic.to_string(),
        });
    }

    fn on_delivered(&self, client_ref: &str, message_id: u16, topic: &str) {
        self.forward(SessionEvent::Delivered {
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
        self.forward(SessionEvent::PublishFailed {
            client_ref: client_ref.to_string(),
            message_id,
            topic: topic.to_string(),
            reason: reason.to_string(),
        });
    }
}

/// Per-session emitter; silenced for good once the session is torn down
pub(crate) struct EventEmitter {
    client_ref: String,
    sink: Arc<dyn EventSink>,
    live: bool,
}

impl EventEmitter {
    pub(crate) fn new(client_ref: String, sink: Arc<dyn EventSink>) -> Self {
        Self {
            client_ref,
            sink,
            live: true,
        }
    }

    pub(crate) fn client_ref(&self) -> &str {
        &self.client_ref
    }

    pub(crate) fn silence(&mut self) {
        self.live = false;
    }

    pub(crate) fn is_live(&self) -> bool {
        self.live
    }

    pub(crate) fn connect(&self, resumed_session: bool) {
        if self.live {
            self.sink.on_connect(&self.client_ref, resumed_session);
        }
    }

    pub(crate) fn disconnect(&self, reason: DisconnectReason) {
        if self.live {
            self.sink.on_disconnect(&self.client_ref, reason);
        }
    }

    pub(crate) fn error(&self, cause: ErrorCause, message: &str) {
        if self.live {
            self.sink
                .on_error(&self.client_ref, cause, &sanitize_error_message(message));
        }
    }

    pub(crate) fn message(&self, message: &InboundMessage) {
        if self.live {
            self.sink.on_message(&self.client_ref, message);
        }
    }

    pub(crate) fn subscribed(&self, topic: &str, qos: QoS, success: bool) {
        if self.live {
            self.sink.on_subscribed(&self.client_ref, topic, qos, success);
        }
    }

    pub(crate) fn unsubscribed(&self, topic: &str) {
        if self.live {
            self.sink.on_unsubscribed(&self.client_ref, topic);
        }
    }

    pub(crate) fn delivered(&self, message_id: u16, topic: &str) {
        if self.live {
            self.sink.on_delivered(&self.client_ref, message_id, topic);
        }
    }

    pub(crate) fn publish_failed(&self, message_id: Option<u16>, topic: &str, reason: &str) {
        if self.live {
            self.sink
                .on_publish_failed(&self.client_ref, message_id, topic, reason);
        }
    }
}
