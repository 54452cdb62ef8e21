//! device-bridge command line
//!
//! Exercises the pooled broker connection from a terminal: connection tests,
//! one-off publishes, and relaying newline-delimited envelopes from stdin.

use clap::{Parser, Subcommand};
use device_bridge::observability::{init_default_logging, init_logging, parse_level, LogFormat};
use device_bridge::{BridgeConfig, BridgeService, BrokerTarget, OutboundEnvelope, TenantScope};
use std::path::{Path, PathBuf};
use std::process;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal;
use tracing::{error, info, warn};

type CliResult<T> = Result<T, Box<dyn std::error::Error>>;

/// Relay assistant output to MQTT devices over pooled connections
#[derive(Parser)]
#[command(name = "device-bridge")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Verbose logging (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Args, Clone)]
struct BrokerArgs {
    /// Broker URL, e.g. mqtt://localhost:1883 (defaults to [broker].url)
    #[arg(long)]
    url: Option<String>,

    #[arg(long, env = "MQTT_USERNAME")]
    username: Option<String>,

    #[arg(long, env = "MQTT_PASSWORD", hide_env_values = true)]
    password: Option<String>,
}

#[derive(clap::Args, Clone)]
struct TenantArgs {
    /// Scope the connection to a user
    #[arg(long)]
    user_email: Option<String>,

    /// Scope the connection to a session
    #[arg(long)]
    session_id: Option<String>,
}

impl TenantArgs {
    fn scope(&self) -> Option<TenantScope> {
        let scope = TenantScope::new(self.user_email.as_deref(), self.session_id.as_deref());
        (!scope.is_anonymous()).then_some(scope)
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Check that a broker connection can be established
    Test {
        #[command(flatten)]
        broker: BrokerArgs,
        #[command(flatten)]
        tenant: TenantArgs,
    },
    /// Publish one JSON envelope
    Publish {
        #[command(flatten)]
        broker: BrokerArgs,
        #[command(flatten)]
        tenant: TenantArgs,
        /// Topic (defaults to [broker].topic)
        #[arg(long)]
        topic: Option<String>,
        /// JSON object; its MQTT_value field alone is sent when present
        #[arg(long)]
        payload: String,
    },
    /// Publish newline-delimited JSON envelopes read from stdin
    Relay {
        #[command(flatten)]
        broker: BrokerArgs,
        #[command(flatten)]
        tenant: TenantArgs,
        #[arg(long)]
        topic: Option<String>,
    },
    /// Validate configuration
    Config {
        /// Show effective configuration
        #[arg(long)]
        show: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    match cli.verbose {
        0 => init_default_logging(),
        1 => init_logging(parse_level("DEBUG"), log_format_from_env(), false),
        _ => init_logging(parse_level("TRACE"), log_format_from_env(), true),
    }

    let config = match load_configuration(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Test { broker, tenant } => run_test(config, broker, tenant).await,
        Commands::Publish {
            broker,
            tenant,
            topic,
            payload,
        } => run_publish(config, broker, tenant, topic, payload).await,
        Commands::Relay {
            broker,
            tenant,
            topic,
        } => run_relay(config, broker, tenant, topic).await,
        Commands::Config { show } => handle_config_command(&config, show),
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        process::exit(1);
    }
}

fn log_format_from_env() -> LogFormat {
    LogFormat::parse(&std::env::var("LOG_FORMAT").unwrap_or_else(|_| "compact".to_string()))
}

fn load_configuration(config_path: Option<&Path>) -> CliResult<BridgeConfig> {
    if let Some(path) = config_path {
        info!("Loading configuration from: {}", path.display());
        return Ok(BridgeConfig::load_from_file(path)?);
    }

    for candidate in ["device-bridge.toml", "config/device-bridge.toml"] {
        let path = Path::new(candidate);
        if path.exists() {
            info!("Loading configuration from: {}", path.display());
            return Ok(BridgeConfig::load_from_file(path)?);
        }
    }

    Ok(BridgeConfig::default())
}

/// Command-line values win over the `[broker]` section
fn resolve_target(
    config: &BridgeConfig,
    broker: &BrokerArgs,
    topic: Option<String>,
) -> CliResult<BrokerTarget> {
    let section = config.broker.as_ref();
    let url = broker
        .url
        .clone()
        .or_else(|| section.map(|s| s.url.clone()))
        .ok_or("no broker URL given (--url or [broker].url)")?;
    let topic = topic
        .or_else(|| section.and_then(|s| s.topic.clone()))
        .unwrap_or_else(|| "device-bridge/test".to_string());
    let username = broker
        .username
        .clone()
        .or_else(|| section.and_then(|s| s.username()));
    let password = broker
        .password
        .clone()
        .or_else(|| section.and_then(|s| s.password()));

    Ok(BrokerTarget::from_url(&url, &topic)?
        .with_credentials(username.as_deref(), password.as_deref()))
}

async fn run_test(config: BridgeConfig, broker: BrokerArgs, tenant: TenantArgs) -> CliResult<()> {
    let target = resolve_target(&config, &broker, None)?;
    let service = BridgeService::with_rumqttc(config);

    let connected = service
        .test_connection(
            target.host(),
            target.port(),
            target.username(),
            target.password(),
            tenant.scope(),
        )
        .await;
    service.shutdown().await;

    if connected {
        println!("Connected to {}:{}", target.host(), target.port());
        Ok(())
    } else {
        Err(format!("could not connect to {}:{}", target.host(), target.port()).into())
    }
}

async fn run_publish(
    config: BridgeConfig,
    broker: BrokerArgs,
    tenant: TenantArgs,
    topic: Option<String>,
    payload: String,
) -> CliResult<()> {
    let target = resolve_target(&config, &broker, topic)?;
    let envelope: OutboundEnvelope = serde_json::from_str(&payload)?;
    let service = BridgeService::with_rumqttc(config);

    let outcome = service.publish(&target, &envelope, tenant.scope()).await;
    service.shutdown().await;

    println!("{}", serde_json::to_string(&outcome)?);
    if outcome.success {
        Ok(())
    } else {
        Err(outcome
            .message
            .unwrap_or_else(|| "publish failed".to_string())
            .into())
    }
}

async fn run_relay(
    config: BridgeConfig,
    broker: BrokerArgs,
    tenant: TenantArgs,
    topic: Option<String>,
) -> CliResult<()> {
    let target = resolve_target(&config, &broker, topic)?;
    let scope = tenant.scope();
    let service = BridgeService::with_rumqttc(config);

    let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())?;
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    info!(topic = %target.topic(), "Relaying envelopes from stdin");
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = sigint.recv() => {
                info!("Received SIGINT, shutting down");
                break;
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down");
                break;
            }
        };
        let Some(line) = line else {
            break;
        };
        if line.trim().is_empty() {
            continue;
        }

        match serde_json::from_str::<OutboundEnvelope>(&line) {
            Ok(envelope) => {
                let outcome = service.publish(&target, &envelope, scope.clone()).await;
                println!("{}", serde_json::to_string(&outcome)?);
            }
            Err(e) => warn!(error = %e, "Skipping line that is not a JSON object"),
        }
    }

    service.shutdown().await;
    println!("{}", serde_json::to_string_pretty(&service.stats())?);
    Ok(())
}

fn handle_config_command(config: &BridgeConfig, show: bool) -> CliResult<()> {
    config.validate()?;
    println!("Configuration is valid");

    if show {
        println!("{}", toml::to_string_pretty(config)?);
    }
    Ok(())
}
