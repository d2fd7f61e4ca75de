//! Configuration loading and validation tests
//!
//! Tests focus on BEHAVIOR of configuration loading, validation, and error handling.
//! We test observable outcomes, not implementation details of TOML parsing.

use mqtt_session::config::{ConfigError, SessionConfig};
use mqtt_session::session::{AckTimeoutAction, OfflinePolicy};
use mqtt_session::transport::QoS;
use std::io::Write;
use std::path::Path;
use std::time::Duration;
use tempfile::NamedTempFile;

fn write_config(content: &str) -> NamedTempFile {
    let mut temp_file = NamedTempFile::new().unwrap();
    write!(temp_file, "{content}").unwrap();
    temp_file
}

#[test]
fn test_config_loads_successfully_from_valid_toml() {
    let temp_file = write_config(
        r#"
[broker]
host = "broker.example.com"
port = 1884
client_id = "plant-7"
keep_alive_secs = 20
clean_session = false

[last_will]
topic = "plants/7/status"
payload = "offline"
qos = 1
retain = true

[reconnect]
initial_delay_ms = 250
max_delay_ms = 8000
max_attempts = 6
"#,
    );

    let config = SessionConfig::load_from_file(temp_file.path()).unwrap();

    assert_eq!(config.broker.host, "broker.example.com");
    assert_eq!(config.broker.port, 1884);
    assert_eq!(config.broker.client_id, "plant-7");
    assert_eq!(config.broker.keep_alive_secs, 20);
    assert!(!config.broker.clean_session);
    let will = config.last_will.as_ref().unwrap();
    assert_eq!(will.topic, "plants/7/status");
    assert_eq!(will.qos, QoS::AtLeastOnce);
    assert_eq!(config.reconnect.max_attempts, Some(6));
}

#[test]
fn test_config_applies_defaults_when_sections_missing() {
    let temp_file = write_config("[broker]\nhost = \"localhost\"\n");

    let config = SessionConfig::load_from_file(temp_file.path()).unwrap();
    let options = config.session_options().unwrap();

    assert_eq!(options.connect.port, 1883);
    assert_eq!(options.connect.keep_alive, Duration::from_secs(60));
    assert!(options.connect.clean_session);
    assert!(options.connect.client_id.starts_with("mqtt-session-"));
    assert!(options.reconnect.enabled);
    assert!(options.reconnect.jitter);
    assert_eq!(options.reconnect.initial_delay, Duration::from_secs(1));
    assert_eq!(options.reconnect.max_delay, Duration::from_secs(30));
    assert_eq!(options.reconnect.max_attempts, Some(10));
    assert_eq!(
        options.delivery.offline_policy,
        OfflinePolicy::Queue { max_queued: 1000 }
    );
    assert_eq!(options.delivery.ack_timeout, None);
    assert_eq!(options.connect_timeout, Duration::from_secs(10));
}

#[test]
fn test_config_maps_delivery_section() {
    let temp_file = write_config(
        r#"
[broker]
host = "localhost"

[delivery]
offline_policy = "fail_fast"
ack_timeout_secs = 15
ack_timeout_action = "fail"
max_ack_timeouts = 4
"#,
    );

    let options = SessionConfig::load_from_file(temp_file.path())
        .unwrap()
        .session_options()
        .unwrap();

    assert_eq!(options.delivery.offline_policy, OfflinePolicy::FailFast);
    assert_eq!(options.delivery.ack_timeout, Some(Duration::from_secs(15)));
    assert_eq!(
        options.delivery.ack_timeout_action,
        AckTimeoutAction::FailAfter { max_timeouts: 4 }
    );
}

#[test]
fn test_config_returns_error_when_broker_section_missing() {
    let temp_file = write_config(
        r#"
[reconnect]
max_attempts = 3
"#,
    );

    let result = SessionConfig::load_from_file(temp_file.path());

    match result {
        Err(ConfigError::TomlParse(_)) => {}
        other => panic!("Expected TomlParse error, got {other:?}"),
    }
}

#[test]
fn test_config_returns_error_for_invalid_toml_syntax() {
    let temp_file = write_config("[broker\nhost = ");

    let result = SessionConfig::load_from_file(temp_file.path());

    assert!(matches!(result, Err(ConfigError::TomlParse(_))));
}

#[test]
fn test_config_returns_error_for_unknown_policy_value() {
    let temp_file = write_config(
        r#"
[broker]
host = "localhost"

[delivery]
offline_policy = "drop_everything"
"#,
    );

    let result = SessionConfig::load_from_file(temp_file.path());

    assert!(matches!(result, Err(ConfigError::TomlParse(_))));
}

#[test]
fn test_config_returns_error_when_file_missing() {
    let result = SessionConfig::load_from_file(Path::new("/nonexistent/mqtt-session.toml"));

    assert!(matches!(result, Err(ConfigError::FileRead(_))));
}

#[test]
fn test_config_load_runs_validation() {
    let temp_file = write_config(
        r#"
[broker]
host = "localhost"

[reconnect]
initial_delay_ms = 5000
max_delay_ms = 1000
"#,
    );

    let result = SessionConfig::load_from_file(temp_file.path());

    match result {
        Err(ConfigError::Validation(message)) => assert!(message.contains("max_delay_ms")),
        other => panic!("Expected Validation error, got {other:?}"),
    }
}

#[test]
fn test_config_rejects_unbounded_reconnect() {
    let temp_file = write_config(
        r#"
[broker]
host = "localhost"

[reconnect]
enabled = true
max_attempts = 0
"#,
    );

    assert!(matches!(
        SessionConfig::load_from_file(temp_file.path()),
        Err(ConfigError::Validation(_))
    ));
}

#[test]
fn test_config_rejects_wildcard_last_will_topic() {
    let temp_file = write_config(
        r#"
[broker]
host = "localhost"

[last_will]
topic = "devices/+/status"
"#,
    );

    assert!(matches!(
        SessionConfig::load_from_file(temp_file.path()),
        Err(ConfigError::Validation(_))
    ));
}

#[test]
fn test_config_reads_pinned_certificate_files() {
    let dir = tempfile::tempdir().unwrap();
    let cert_path = dir.path().join("ca.pem");
    std::fs::write(&cert_path, "-----BEGIN CERTIFICATE-----\nMIIB\n").unwrap();
    let temp_file = write_config(&format!(
        r#"
[broker]
host = "secure.example.com"
port = 8883

[tls]
enabled = true
pinned_certificates = ["{}"]
"#,
        cert_path.display()
    ));

    let options = SessionConfig::load_from_file(temp_file.path())
        .unwrap()
        .session_options()
        .unwrap();

    let tls = options.connect.tls.unwrap();
    assert_eq!(tls.pinned_certificates.len(), 1);
    assert!(tls.pinned_certificates[0].starts_with(b"-----BEGIN CERTIFICATE-----"));
}

#[test]
fn test_config_resolves_credentials_from_environment() {
    std::env::set_var("MQTT_SESSION_IT_USER", "operator");
    std::env::set_var("MQTT_SESSION_IT_PASS", "s3cret");
    let temp_file = write_config(
        r#"
[broker]
host = "localhost"

[credentials]
username_env = "MQTT_SESSION_IT_USER"
password_env = "MQTT_SESSION_IT_PASS"
"#,
    );

    let options = SessionConfig::load_from_file(temp_file.path())
        .unwrap()
        .session_options()
        .unwrap();

    let credentials = options.connect.credentials.unwrap();
    assert_eq!(credentials.username, "operator");
    assert_eq!(credentials.password, "s3cret");
    std::env::remove_var("MQTT_SESSION_IT_USER");
    std::env::remove_var("MQTT_SESSION_IT_PASS");
}

#[test]
fn test_config_redacted_rendering_round_trips() {
    let temp_file = write_config(
        r#"
[broker]
host = "localhost"
client_id = "render-me"

[credentials]
username = "svc"
password = "do-not-print"
"#,
    );
    let config = SessionConfig::load_from_file(temp_file.path()).unwrap();

    let rendered = config.to_redacted_toml().unwrap();
    let reparsed = write_config(&rendered);
    let reloaded = SessionConfig::load_from_file(reparsed.path()).unwrap();

    assert!(!rendered.contains("do-not-print"));
    assert_eq!(reloaded.broker, config.broker);
    assert_eq!(reloaded.credentials.username.as_deref(), Some("svc"));
    assert_eq!(reloaded.credentials.password.as_deref(), Some("***"));
}
