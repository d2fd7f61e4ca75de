//! MQTT Session - client-side MQTT session management
//!
//! Turns an MQTT transport into a dependable session for an application:
//! - Connection lifecycle with bounded, jittered exponential reconnection
//! - Subscription registry restored across reconnects
//! - QoS 0/1/2 delivery state with in-flight resend and an offline queue
//! - A narrow event surface ([`events::EventSink`]) for everything asynchronous
//!
//! # Quick Start
//!
//! ```rust
//! use mqtt_session::config::SessionConfig;
//!
//! let config = SessionConfig::from_uri("ssl://broker.example.com", Some("gateway-1")).unwrap();
//! assert_eq!(config.broker.port, 8883);
//! assert!(config.tls.enabled);
//!
//! let options = config.session_options().unwrap();
//! assert_eq!(options.connect.client_id, "gateway-1");
//! ```

pub mod config;
pub mod error;
pub mod events;
pub mod observability;
pub mod session;
pub mod testing;
pub mod transport;

pub use config::{ConfigError, SessionConfig};
pub use error::{ErrorKind, SessionError, SessionResult};
pub use events::{ChannelEventSink, EventSink, InboundMessage, SessionEvent};
pub use session::{
    ConnectionState, DisconnectReason, ErrorCause, MqttSession, PublishReceipt, SessionPool,
};
pub use transport::{QoS, RumqttcTransport, Transport};
