//! MQTT Session - command line entry point
//!
//! Runs one session against a broker and prints every session event as a
//! JSON line on stdout.

use chrono::Utc;
use clap::{Parser, Subcommand};
use mqtt_session::config::SessionConfig;
use mqtt_session::events::{ChannelEventSink, SessionEvent};
use mqtt_session::observability::init_default_logging;
use mqtt_session::session::{ConnectionState, MqttSession};
use mqtt_session::transport::{QoS, RumqttcTransport};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{error, info, warn};

/// How long `publish` waits for the broker to acknowledge delivery
const DELIVERY_WAIT: Duration = Duration::from_secs(30);

/// Client-side MQTT session manager
#[derive(Parser)]
#[command(name = "mqtt-session")]
#[command(about = "Connect, subscribe and publish through a managed MQTT session")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE", env = "MQTT_SESSION_CONFIG")]
    config: Option<PathBuf>,

    /// Broker URI instead of a config file, e.g. tcp://localhost:1883
    #[arg(long, conflicts_with = "config")]
    uri: Option<String>,

    /// Client identifier (overrides the config file)
    #[arg(long)]
    client_id: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect, subscribe and print events until Ctrl-C
    Run {
        /// Topic filter to subscribe to (repeatable)
        #[arg(short, long = "subscribe", value_name = "FILTER")]
        subscribe: Vec<String>,

        /// Requested QoS for every filter
        #[arg(long, default_value_t = 2, value_parser = clap::value_parser!(u8).range(0..=2))]
        qos: u8,
    },
    /// Publish one message and wait for it to be delivered
    Publish {
        topic: String,
        message: String,

        #[arg(long, default_value_t = 2, value_parser = clap::value_parser!(u8).range(0..=2))]
        qos: u8,

        #[arg(long)]
        retain: bool,
    },
    /// Validate configuration
    Config {
        /// Show the effective configuration
        #[arg(long)]
        show: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    init_default_logging();

    let config = match load_configuration(&cli) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Run { subscribe, qos } => run_session(config, subscribe, qos).await,
        Commands::Publish {
            topic,
            message,
            qos,
            retain,
        } => publish_once(config, &topic, message, qos, retain).await,
        Commands::Config { show } => handle_config_command(&config, show),
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        process::exit(1);
    }
}

fn load_configuration(cli: &Cli) -> Result<SessionConfig, Box<dyn std::error::Error>> {
    let mut config = if let Some(uri) = &cli.uri {
        SessionConfig::from_uri(uri, cli.client_id.as_deref())?
    } else if let Some(path) = &cli.config {
        info!("Loading configuration from: {}", path.display());
        SessionConfig::load_from_file(path)?
    } else {
        // Try default locations
        let found = ["mqtt-session.toml", "config/mqtt-session.toml"]
            .iter()
            .map(PathBuf::from)
            .find(|path| path.exists())
            .ok_or("No configuration found. Pass --config FILE or --uri URI")?;
        info!("Loading configuration from: {}", found.display());
        SessionConfig::load_from_file(&found)?
    };

    if let Some(client_id) = &cli.client_id {
        config.broker.client_id = client_id.clone();
    }
    config.validate()?;
    Ok(config)
}

fn spawn_session(
    config: &SessionConfig,
) -> Result<(MqttSession, UnboundedReceiver<SessionEvent>), Box<dyn std::error::Error>> {
    let (sink, events) = ChannelEventSink::new();
    let session = MqttSession::spawn(
        config.broker.client_id.clone(),
        config.session_options()?,
        Box::new(RumqttcTransport::new()),
        Arc::new(sink),
    );
    Ok((session, events))
}

fn print_event(event: &SessionEvent) {
    match serde_json::to_value(event) {
        Ok(mut value) => {
            if let Some(object) = value.as_object_mut() {
                object.insert("timestamp".into(), Utc::now().to_rfc3339().into());
            }
            println!("{value}");
        }
        Err(e) => warn!("Failed to render event: {}", e),
    }
}

async fn run_session(
    config: SessionConfig,
    filters: Vec<String>,
    qos: u8,
) -> Result<(), Box<dyn std::error::Error>> {
    let qos = QoS::try_from(qos)?;
    let (mut session, mut events) = spawn_session(&config)?;

    for filter in &filters {
        session.subscribe(filter, qos).await?;
    }
    info!(
        host = %config.broker.host,
        port = config.broker.port,
        filters = filters.len(),
        "Starting session"
    );
    session.connect().await?;

    let mut failed = false;
    loop {
        tokio::select! {
            _ = signal::ctrl_c() => {
                info!("Received Ctrl-C, shutting down gracefully...");
                break;
            }
            event = events.recv() => match event {
                Some(event) => {
                    print_event(&event);
                    if matches!(event, SessionEvent::Error { .. })
                        && session.connection_state() == ConnectionState::Failed
                    {
                        error!("Session failed permanently");
                        failed = true;
                        break;
                    }
                }
                None => break,
            }
        }
    }

    session.disconnect().await?;
    while let Ok(event) = events.try_recv() {
        print_event(&event);
    }
    session.shutdown().await?;

    if failed {
        Err("connection failed".into())
    } else {
        Ok(())
    }
}

async fn publish_once(
    config: SessionConfig,
    topic: &str,
    message: String,
    qos: u8,
    retain: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let qos = QoS::try_from(qos)?;
    let (mut session, mut events) = spawn_session(&config)?;

    session.connect().await?;
    let connect_wait = Duration::from_secs(config.broker.connect_timeout_secs.saturating_add(1));
    session.wait_connected(connect_wait).await?;

    let receipt = session
        .publish(topic, message.into_bytes(), qos, retain)
        .await?;

    let outcome: Result<(), Box<dyn std::error::Error>> = match receipt.message_id {
        None => Ok(()),
        Some(message_id) => {
            let waited = tokio::time::timeout(DELIVERY_WAIT, async {
                while let Some(event) = events.recv().await {
                    print_event(&event);
                    match event {
                        SessionEvent::Delivered { message_id: id, .. } if id == message_id => {
                            return Ok(());
                        }
                        SessionEvent::PublishFailed { reason, .. } => return Err(reason),
                        _ => {}
                    }
                }
                Err("session closed".to_string())
            })
            .await;
            match waited {
                Ok(result) => result.map_err(Into::into),
                Err(_) => Err(format!("no acknowledgement within {DELIVERY_WAIT:?}").into()),
            }
        }
    };

    session.disconnect().await?;
    session.shutdown().await?;
    outcome
}

fn handle_config_command(
    config: &SessionConfig,
    show: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    if show {
        println!("{}", config.to_redacted_toml()?);
    }
    info!("Configuration validation complete");
    Ok(())
}
