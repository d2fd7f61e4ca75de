//! Client-side MQTT session management
//!
//! The session is split the same way throughout: pure state modules that
//! never touch I/O or the clock, and one impure driver that owns them.
//!
//! - [`connection`] - connection state machine, reconnect policy, keep-alive
//! - [`subscriptions`] - registry of desired and confirmed subscriptions
//! - [`delivery`] - packet identifiers and QoS 0/1/2 delivery state
//! - [`topic`] - topic name and filter validation
//! - [`core`] - sans-I/O orchestration of the three components above
//! - [`client`] - [`MqttSession`], the async handle and its driver task
//! - [`pool`] - [`SessionPool`], several sessions behind client references
//!
//! # Usage
//!
//! ```rust,no_run
//! use mqtt_session::config::SessionConfig;
//! use mqtt_session::events::ChannelEventSink;
//! use mqtt_session::session::MqttSession;
//! use mqtt_session::transport::{QoS, RumqttcTransport};
//! use std::sync::Arc;
//!
//! # tokio_test::block_on(async {
//! let config = SessionConfig::from_uri("tcp://localhost:1883", Some("sensor-reader"))?;
//! let (sink, mut events) = ChannelEventSink::new();
//!
//! let session = MqttSession::spawn(
//!     "reader",
//!     config.session_options()?,
//!     Box::new(RumqttcTransport::new()),
//!     Arc::new(sink),
//! );
//! session.subscribe("sensors/#", QoS::AtLeastOnce).await?;
//! session.connect().await?;
//!
//! while let Some(event) = events.recv().await {
//!     println!("{}", serde_json::to_string(&event)?);
//! }
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! # });
//! ```

pub mod client;
pub mod connection;
pub mod core;
pub mod delivery;
pub mod pool;
pub mod subscriptions;
pub mod topic;

pub use client::MqttSession;
pub use connection::{ConnectionState, DisconnectReason, ErrorCause, ReconnectPolicy};
pub use self::core::{Action, PublishReceipt, Session, SessionOptions};
pub use delivery::{
    AckTimeoutAction, DeliveryConfig, OfflinePolicy, PendingPublish, PublishState,
};
pub use pool::{SessionPool, TransportFactory};
pub use subscriptions::{Subscription, SubscriptionStatus};
