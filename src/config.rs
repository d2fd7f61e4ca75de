//! Session configuration
//!
//! A [`SessionConfig`] is loaded from TOML (or built from a broker URI) and
//! turned into the [`SessionOptions`] a session runs with. Secrets named by
//! environment variable and pinned certificate files are resolved at that
//! point, not at load time.

use crate::session::connection::ReconnectPolicy;
use crate::session::core::SessionOptions;
use crate::session::delivery::{AckTimeoutAction, DeliveryConfig, OfflinePolicy};
use crate::session::topic::validate_topic_name;
use crate::transport::{ConnectOptions, Credentials, LastWill, QoS, TlsOptions};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use url::Url;

const DEFAULT_PORT: u16 = 1883;
const DEFAULT_TLS_PORT: u16 = 8883;

/// Complete configuration of one session
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionConfig {
    pub broker: BrokerSection,
    #[serde(default)]
    pub credentials: CredentialsSection,
    #[serde(default)]
    pub tls: TlsSection,
    pub last_will: Option<LastWillSection>,
    #[serde(default)]
    pub reconnect: ReconnectSection,
    #[serde(default)]
    pub delivery: DeliverySection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BrokerSection {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Generated as `mqtt-session-<uuid>` when absent
    #[serde(default = "default_client_id")]
    pub client_id: String,
    /// 0 disables keep-alive
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,
    #[serde(default = "default_clean_session")]
    pub clean_session: bool,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_client_id() -> String {
    format!("mqtt-session-{}", uuid::Uuid::new_v4().simple())
}

fn default_keep_alive() -> u64 {
    60
}

fn default_clean_session() -> bool {
    true
}

fn default_connect_timeout() -> u64 {
    10
}

/// Inline credentials or the names of environment variables holding them
#[derive(Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CredentialsSection {
    pub username: Option<String>,
    pub password: Option<String>,
    pub username_env: Option<String>,
    pub password_env: Option<String>,
}

impl std::fmt::Debug for CredentialsSection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialsSection")
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("username_env", &self.username_env)
            .field("password_env", &self.password_env)
            .finish()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TlsSection {
    #[serde(default)]
    pub enabled: bool,
    /// PEM files trusted exclusively when non-empty
    #[serde(default)]
    pub pinned_certificates: Vec<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LastWillSection {
    pub topic: String,
    #[serde(default)]
    pub payload: String,
    #[serde(default = "default_will_qos")]
    pub qos: QoS,
    #[serde(default)]
    pub retain: bool,
}

fn default_will_qos() -> QoS {
    QoS::AtMostOnce
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReconnectSection {
    #[serde(default = "default_reconnect_enabled")]
    pub enabled: bool,
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: Option<u32>,
    pub max_elapsed_secs: Option<u64>,
    #[serde(default = "default_jitter")]
    pub jitter: bool,
}

impl Default for ReconnectSection {
    fn default() -> Self {
        Self {
            enabled: default_reconnect_enabled(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            max_attempts: default_max_attempts(),
            max_elapsed_secs: None,
            jitter: default_jitter(),
        }
    }
}

fn default_reconnect_enabled() -> bool {
    true
}

fn default_initial_delay_ms() -> u64 {
    1000
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_max_attempts() -> Option<u32> {
    Some(10)
}

fn default_jitter() -> bool {
    true
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OfflinePolicyKind {
    Queue,
    FailFast,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AckTimeoutKind {
    AwaitReconnect,
    Fail,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeliverySection {
    #[serde(default = "default_offline_policy")]
    pub offline_policy: OfflinePolicyKind,
    #[serde(default = "default_max_queued")]
    pub max_queued: usize,
    pub ack_timeout_secs: Option<u64>,
    #[serde(default = "default_ack_timeout_action")]
    pub ack_timeout_action: AckTimeoutKind,
    #[serde(default = "default_max_ack_timeouts")]
    pub max_ack_timeouts: u32,
}

impl Default for DeliverySection {
    fn default() -> Self {
        Self {
            offline_policy: default_offline_policy(),
            max_queued: default_max_queued(),
            ack_timeout_secs: None,
            ack_timeout_action: default_ack_timeout_action(),
            max_ack_timeouts: default_max_ack_timeouts(),
        }
    }
}

fn default_offline_policy() -> OfflinePolicyKind {
    OfflinePolicyKind::Queue
}

fn default_max_queued() -> usize {
    1000
}

fn default_ack_timeout_action() -> AckTimeoutKind {
    AckTimeoutKind::AwaitReconnect
}

fn default_max_ack_timeouts() -> u32 {
    3
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Failed to render TOML: {0}")]
    TomlRender(#[from] toml::ser::Error),
    #[error("Environment variable not found: {0}")]
    EnvVarNotFound(String),
    #[error("Invalid broker URI '{uri}': {reason}")]
    InvalidUri { uri: String, reason: String },
    #[error("Failed to read certificate {}: {source}", .path.display())]
    Certificate {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Invalid configuration: {0}")]
    Validation(String),
}

impl SessionConfig {
    /// Minimal configuration for a broker; every other field defaulted
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            broker: BrokerSection {
                host: host.into(),
                port,
                client_id: default_client_id(),
                keep_alive_secs: default_keep_alive(),
                clean_session: default_clean_session(),
                connect_timeout_secs: default_connect_timeout(),
            },
            credentials: CredentialsSection::default(),
            tls: TlsSection::default(),
            last_will: None,
            reconnect: ReconnectSection::default(),
            delivery: DeliverySection::default(),
        }
    }

    /// Load and validate configuration from a TOML file
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: SessionConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Build a configuration from `scheme://[user[:password]@]host[:port]`.
    /// `tcp`/`mqtt` select plain TCP, `ssl`/`tls`/`mqtts` select TLS.
    pub fn from_uri(uri: &str, client_id: Option<&str>) -> Result<Self, ConfigError> {
        let invalid = |reason: &str| ConfigError::InvalidUri {
            uri: uri.to_string(),
            reason: reason.to_string(),
        };
        let url = Url::parse(uri).map_err(|e| invalid(&e.to_string()))?;

        let tls = match url.scheme() {
            "tcp" | "mqtt" => false,
            "ssl" | "tls" | "mqtts" => true,
            _ => return Err(invalid("scheme must be one of tcp, mqtt, ssl, tls, mqtts")),
        };
        let host = url
            .host_str()
            .filter(|host| !host.is_empty())
            .ok_or_else(|| invalid("missing host"))?;
        let port = url
            .port()
            .unwrap_or(if tls { DEFAULT_TLS_PORT } else { DEFAULT_PORT });

        let mut config = Self::new(host, port);
        config.tls.enabled = tls;
        if let Some(client_id) = client_id {
            config.broker.client_id = client_id.to_string();
        }
        if !url.username().is_empty() {
            config.credentials.username = Some(url.username().to_string());
        }
        if let Some(password) = url.password() {
            config.credentials.password = Some(password.to_string());
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject configurations a session could not honour
    pub fn validate(&self) -> Result<(), ConfigError> {
        let broker = &self.broker;
        if broker.host.trim().is_empty() {
            return Err(ConfigError::Validation("broker.host must not be empty".into()));
        }
        if broker.port == 0 {
            return Err(ConfigError::Validation("broker.port must not be 0".into()));
        }
        if broker.client_id.is_empty() {
            return Err(ConfigError::Validation(
                "broker.client_id must not be empty".into(),
            ));
        }
        if broker.client_id.trim() != broker.client_id {
            return Err(ConfigError::Validation(
                "broker.client_id must not start or end with whitespace".into(),
            ));
        }
        if broker.keep_alive_secs > u64::from(u16::MAX) {
            return Err(ConfigError::Validation(format!(
                "broker.keep_alive_secs must be at most {}",
                u16::MAX
            )));
        }
        if broker.connect_timeout_secs == 0 {
            return Err(ConfigError::Validation(
                "broker.connect_timeout_secs must be positive".into(),
            ));
        }

        let reconnect = &self.reconnect;
        if reconnect.enabled {
            if reconnect.max_attempts.is_none() && reconnect.max_elapsed_secs.is_none() {
                return Err(ConfigError::Validation(
                    "reconnect needs max_attempts or max_elapsed_secs".into(),
                ));
            }
            if reconnect.max_attempts == Some(0) || reconnect.max_elapsed_secs == Some(0) {
                return Err(ConfigError::Validation(
                    "reconnect bounds must be positive".into(),
                ));
            }
            if reconnect.initial_delay_ms == 0 {
                return Err(ConfigError::Validation(
                    "reconnect.initial_delay_ms must be positive".into(),
                ));
            }
            if reconnect.max_delay_ms < reconnect.initial_delay_ms {
                return Err(ConfigError::Validation(
                    "reconnect.max_delay_ms must not be below initial_delay_ms".into(),
                ));
            }
        }

        let delivery = &self.delivery;
        if delivery.offline_policy == OfflinePolicyKind::Queue && delivery.max_queued == 0 {
            return Err(ConfigError::Validation(
                "delivery.max_queued must be positive for the queue policy".into(),
            ));
        }
        if delivery.ack_timeout_secs == Some(0) {
            return Err(ConfigError::Validation(
                "delivery.ack_timeout_secs must be positive".into(),
            ));
        }
        if delivery.ack_timeout_action == AckTimeoutKind::Fail && delivery.max_ack_timeouts == 0 {
            return Err(ConfigError::Validation(
                "delivery.max_ack_timeouts must be positive".into(),
            ));
        }

        if let Some(will) = &self.last_will {
            validate_topic_name(&will.topic).map_err(|e| {
                ConfigError::Validation(format!("last_will.topic '{}': {}", will.topic, e))
            })?;
        }

        Ok(())
    }

    /// Resolve secrets and certificates into runnable session options
    pub fn session_options(&self) -> Result<SessionOptions, ConfigError> {
        self.validate()?;

        let connect = ConnectOptions {
            client_id: self.broker.client_id.clone(),
            host: self.broker.host.clone(),
            port: self.broker.port,
            keep_alive: Duration::from_secs(self.broker.keep_alive_secs),
            clean_session: self.broker.clean_session,
            credentials: self.resolve_credentials()?,
            tls: self.load_tls()?,
            last_will: self.last_will.as_ref().map(|will| LastWill {
                topic: will.topic.clone(),
                payload: Bytes::from(will.payload.clone().into_bytes()),
                qos: will.qos,
                retain: will.retain,
            }),
        };

        let reconnect = if self.reconnect.enabled {
            ReconnectPolicy {
                enabled: true,
                initial_delay: Duration::from_millis(self.reconnect.initial_delay_ms),
                max_delay: Duration::from_millis(self.reconnect.max_delay_ms),
                max_attempts: self.reconnect.max_attempts,
                max_elapsed: self.reconnect.max_elapsed_secs.map(Duration::from_secs),
                jitter: self.reconnect.jitter,
            }
        } else {
            ReconnectPolicy::disabled()
        };

        let delivery = DeliveryConfig {
            offline_policy: match self.delivery.offline_policy {
                OfflinePolicyKind::Queue => OfflinePolicy::Queue {
                    max_queued: self.delivery.max_queued,
                },
                OfflinePolicyKind::FailFast => OfflinePolicy::FailFast,
            },
            ack_timeout: self.delivery.ack_timeout_secs.map(Duration::from_secs),
            ack_timeout_action: match self.delivery.ack_timeout_action {
                AckTimeoutKind::AwaitReconnect => AckTimeoutAction::AwaitReconnect,
                AckTimeoutKind::Fail => AckTimeoutAction::FailAfter {
                    max_timeouts: self.delivery.max_ack_timeouts,
                },
            },
        };

        Ok(SessionOptions {
            connect,
            reconnect,
            connect_timeout: Duration::from_secs(self.broker.connect_timeout_secs),
            delivery,
        })
    }

    /// Render as TOML with inline secrets masked
    pub fn to_redacted_toml(&self) -> Result<String, ConfigError> {
        let mut shown = self.clone();
        if shown.credentials.password.is_some() {
            shown.credentials.password = Some("***".to_string());
        }
        Ok(toml::to_string_pretty(&shown)?)
    }

    fn resolve_credentials(&self) -> Result<Option<Credentials>, ConfigError> {
        let section = &self.credentials;
        let username = match (&section.username, &section.username_env) {
            (Some(username), _) => Some(username.clone()),
            (None, Some(var)) => Some(get_env_var_required(var)?),
            (None, None) => None,
        };
        let password = match (&section.password, &section.password_env) {
            (Some(password), _) => Some(password.clone()),
            (None, Some(var)) => Some(get_env_var_required(var)?),
            (None, None) => None,
        };

        if username.is_none() && password.is_none() {
            return Ok(None);
        }
        Ok(Some(Credentials {
            username: username.unwrap_or_default(),
            password: password.unwrap_or_default(),
        }))
    }

    fn load_tls(&self) -> Result<Option<TlsOptions>, ConfigError> {
        if !self.tls.enabled {
            return Ok(None);
        }
        let pinned_certificates = self
            .tls
            .pinned_certificates
            .iter()
            .map(|path| {
                std::fs::read(path).map_err(|source| ConfigError::Certificate {
                    path: path.clone(),
                    source,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Some(TlsOptions {
            pinned_certificates,
        }))
    }

    /// Create a test configuration for unit testing
    #[cfg(test)]
    pub fn test_config() -> Self {
        let toml_content = r#"
[broker]
host = "localhost"
port = 1883
client_id = "test-client"
keep_alive_secs = 30
clean_session = false

[reconnect]
initial_delay_ms = 100
max_delay_ms = 1000
max_attempts = 3
jitter = false
"#;
        toml::from_str(toml_content).expect("Test config should parse")
    }
}

fn get_env_var_required(name: &str) -> Result<String, ConfigError> {
    std::env::var(name).map_err(|_| ConfigError::EnvVarNotFound(name.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_full_config() {
        let toml_content = r#"
[broker]
host = "broker.example.com"
port = 8883
client_id = "sensor-gateway"
keep_alive_secs = 45
clean_session = false
connect_timeout_secs = 5

[credentials]
username = "gateway"
password_env = "GATEWAY_PASSWORD"

[tls]
enabled = true

[last_will]
topic = "gateways/sensor-gateway/status"
payload = "offline"
qos = 1
retain = true

[reconnect]
initial_delay_ms = 500
max_delay_ms = 10000
max_attempts = 5
max_elapsed_secs = 120
jitter = false

[delivery]
offline_policy = "fail_fast"
ack_timeout_secs = 20
ack_timeout_action = "fail"
max_ack_timeouts = 2
"#;

        let config: SessionConfig = toml::from_str(toml_content).unwrap();
        assert_eq!(config.broker.host, "broker.example.com");
        assert_eq!(config.broker.client_id, "sensor-gateway");
        assert!(!config.broker.clean_session);
        assert_eq!(config.credentials.password_env.as_deref(), Some("GATEWAY_PASSWORD"));
        assert!(config.tls.enabled);
        let will = config.last_will.as_ref().unwrap();
        assert_eq!(will.qos, QoS::AtLeastOnce);
        assert!(will.retain);
        assert_eq!(config.reconnect.max_elapsed_secs, Some(120));
        assert_eq!(config.delivery.offline_policy, OfflinePolicyKind::FailFast);
        assert_eq!(config.delivery.ack_timeout_action, AckTimeoutKind::Fail);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_minimal_config_defaults() {
        let config: SessionConfig = toml::from_str("[broker]\nhost = \"localhost\"\n").unwrap();

        assert_eq!(config.broker.port, 1883);
        assert_eq!(config.broker.keep_alive_secs, 60);
        assert!(config.broker.clean_session);
        assert_eq!(config.broker.connect_timeout_secs, 10);
        assert!(config.broker.client_id.starts_with("mqtt-session-"));
        assert!(!config.tls.enabled);
        assert!(config.last_will.is_none());
        assert_eq!(config.reconnect, ReconnectSection::default());
        assert_eq!(config.delivery, DeliverySection::default());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_generated_client_ids_differ() {
        let a = SessionConfig::new("localhost", 1883);
        let b = SessionConfig::new("localhost", 1883);
        assert_ne!(a.broker.client_id, b.broker.client_id);
    }

    #[test]
    fn test_missing_host_fails_to_parse() {
        let result: Result<SessionConfig, _> = toml::from_str("[broker]\nport = 1883\n");
        assert!(result.is_err());
    }

    #[test]
    fn test_invalid_qos_fails_to_parse() {
        let toml_content = r#"
[broker]
host = "localhost"

[last_will]
topic = "status"
qos = 3
"#;
        let result: Result<SessionConfig, _> = toml::from_str(toml_content);
        assert!(result.is_err());
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let cases: Vec<(&str, Box<dyn Fn(&mut SessionConfig)>)> = vec![
            ("empty host", Box::new(|c: &mut SessionConfig| c.broker.host = " ".into())),
            ("port zero", Box::new(|c: &mut SessionConfig| c.broker.port = 0)),
            (
                "padded client id",
                Box::new(|c: &mut SessionConfig| c.broker.client_id = " plant-7".into()),
            ),
            ("keep-alive", Box::new(|c: &mut SessionConfig| c.broker.keep_alive_secs = 70_000)),
            (
                "unbounded",
                Box::new(|c: &mut SessionConfig| {
                    c.reconnect.max_attempts = None;
                    c.reconnect.max_elapsed_secs = None;
                }),
            ),
            ("zero attempts", Box::new(|c: &mut SessionConfig| c.reconnect.max_attempts = Some(0))),
            ("delay order", Box::new(|c: &mut SessionConfig| c.reconnect.max_delay_ms = 10)),
            ("queue size", Box::new(|c: &mut SessionConfig| c.delivery.max_queued = 0)),
            (
                "will topic",
                Box::new(|c: &mut SessionConfig| {
                    c.last_will = Some(LastWillSection {
                        topic: "status/#".into(),
                        payload: String::new(),
                        qos: QoS::AtMostOnce,
                        retain: false,
                    })
                }),
            ),
        ];

        for (name, mutate) in cases {
            let mut config = SessionConfig::test_config();
            mutate(&mut config);
            assert!(
                matches!(config.validate(), Err(ConfigError::Validation(_))),
                "{name} should be rejected"
            );
        }
    }

    #[test]
    fn test_disabled_reconnect_needs_no_bounds() {
        let mut config = SessionConfig::test_config();
        config.reconnect.enabled = false;
        config.reconnect.max_attempts = None;

        let options = config.session_options().unwrap();
        assert!(!options.reconnect.enabled);
    }

    #[test]
    fn test_session_options_conversion() {
        let config = SessionConfig::test_config();
        let options = config.session_options().unwrap();

        assert_eq!(options.connect.client_id, "test-client");
        assert_eq!(options.connect.keep_alive, Duration::from_secs(30));
        assert!(!options.connect.clean_session);
        assert!(options.connect.credentials.is_none());
        assert!(options.connect.tls.is_none());
        assert_eq!(options.reconnect.initial_delay, Duration::from_millis(100));
        assert_eq!(options.reconnect.max_attempts, Some(3));
        assert_eq!(
            options.delivery.offline_policy,
            OfflinePolicy::Queue { max_queued: 1000 }
        );
        assert_eq!(options.connect_timeout, Duration::from_secs(10));
    }

    #[test]
    fn test_credentials_from_environment() {
        std::env::set_var("MQTT_SESSION_TEST_USER_A", "alice");
        let mut config = SessionConfig::test_config();
        config.credentials.username_env = Some("MQTT_SESSION_TEST_USER_A".into());

        let credentials = config.session_options().unwrap().connect.credentials.unwrap();
        assert_eq!(credentials.username, "alice");
        assert_eq!(credentials.password, "");
        std::env::remove_var("MQTT_SESSION_TEST_USER_A");
    }

    #[test]
    fn test_missing_credential_variable() {
        let mut config = SessionConfig::test_config();
        config.credentials.password_env = Some("MQTT_SESSION_TEST_UNSET_VARIABLE".into());

        let result = config.session_options();
        assert!(matches!(result, Err(ConfigError::EnvVarNotFound(name)) if name == "MQTT_SESSION_TEST_UNSET_VARIABLE"));
    }

    #[test]
    fn test_pinned_certificates_are_read() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"-----BEGIN CERTIFICATE-----\n").unwrap();

        let mut config = SessionConfig::test_config();
        config.tls.enabled = true;
        config.tls.pinned_certificates = vec![file.path().to_path_buf()];

        let tls = config.session_options().unwrap().connect.tls.unwrap();
        assert_eq!(tls.pinned_certificates.len(), 1);
        assert!(tls.pinned_certificates[0].starts_with(b"-----BEGIN"));
    }

    #[test]
    fn test_unreadable_certificate() {
        let mut config = SessionConfig::test_config();
        config.tls.enabled = true;
        config.tls.pinned_certificates = vec![PathBuf::from("/nonexistent/ca.pem")];

        assert!(matches!(
            config.session_options(),
            Err(ConfigError::Certificate { .. })
        ));
    }

    #[test]
    fn test_from_uri_schemes() {
        let plain = SessionConfig::from_uri("tcp://broker.local", None).unwrap();
        assert_eq!(plain.broker.host, "broker.local");
        assert_eq!(plain.broker.port, 1883);
        assert!(!plain.tls.enabled);

        let secure = SessionConfig::from_uri("ssl://broker.local", Some("dev-1")).unwrap();
        assert_eq!(secure.broker.port, 8883);
        assert!(secure.tls.enabled);
        assert_eq!(secure.broker.client_id, "dev-1");

        let explicit = SessionConfig::from_uri("mqtt://user:pw@10.0.0.5:1999", None).unwrap();
        assert_eq!(explicit.broker.port, 1999);
        assert_eq!(explicit.credentials.username.as_deref(), Some("user"));
        assert_eq!(explicit.credentials.password.as_deref(), Some("pw"));
    }

    #[test]
    fn test_from_uri_rejects_bad_input() {
        assert!(matches!(
            SessionConfig::from_uri("http://broker.local", None),
            Err(ConfigError::InvalidUri { .. })
        ));
        assert!(matches!(
            SessionConfig::from_uri("not a uri", None),
            Err(ConfigError::InvalidUri { .. })
        ));
    }

    #[test]
    fn test_redacted_toml_hides_password() {
        let mut config = SessionConfig::test_config();
        config.credentials.password = Some("hunter2".into());

        let rendered = config.to_redacted_toml().unwrap();
        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains("localhost"));
        assert!(!format!("{config:?}").contains("hunter2"));
    }
}
