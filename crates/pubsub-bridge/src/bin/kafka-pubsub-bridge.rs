//! Kafka → Pub/Sub Bridge Binary
//!
//! Runs the bridge until SIGINT/SIGTERM, the await-termination timeout or a
//! fatal error, then exits with the coordinator's exit code (`0` clean, `1`
//! fatal, `2` configuration invalid).
//!
//! # Configuration
//!
//! Options come from a TOML file (`--config`) with `--set key=value`
//! overrides applied on top. Nested tables flatten to dotted keys, so a
//! `[kafka]` table passes client properties through to rdkafka.
//!
//! # Environment Variables
//!
//! - `BRIDGE_CONFIG`: path of the TOML config file
//! - `RUST_LOG`: log filter (default: info)
//! - `PUBSUB_EMULATOR_HOST`: send to a local emulator without credentials
//! - `GOOGLE_OAUTH_ACCESS_TOKEN`: static bearer token; otherwise tokens come
//!   from the GCE metadata server
//!
//! # Example
//!
//! ```bash
//! kafka-pubsub-bridge --config bridge.toml \
//!     --set await_termination_timeout=10m \
//!     --set kafka.security.protocol=SASL_SSL
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{anyhow, Context};
use clap::Parser;
use pubsub_bridge::config::toml_to_config_map;
use pubsub_bridge::sink::MetadataTokenProvider;
use pubsub_bridge::{
    BridgeConfig, BridgeError, Coordinator, KafkaSourceConsumer, MetricsObserver, MultiObserver,
    ObjectStoreCheckpointStore, RestTransport, ShutdownHandle, StaticTokenProvider,
    TokenProvider, TracingObserver,
};
use tracing::{error, info, warn};

const EXIT_FATAL: i32 = 1;
const EXIT_CONFIG: i32 = 2;

#[derive(Parser)]
#[command(name = "kafka-pubsub-bridge")]
#[command(about = "Stream a Kafka topic into a Google Cloud Pub/Sub topic", long_about = None)]
struct Cli {
    /// TOML configuration file
    #[arg(short, long, env = "BRIDGE_CONFIG")]
    config: Option<String>,

    /// Override one option, e.g. `--set source_topic=orders`
    #[arg(short = 's', long = "set", value_name = "KEY=VALUE")]
    overrides: Vec<String>,
}

fn load_config(cli: &Cli) -> anyhow::Result<BridgeConfig> {
    let mut map: HashMap<String, String> = match &cli.config {
        Some(path) => {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file {}", path))?;
            toml_to_config_map(&contents)?
        }
        None => HashMap::new(),
    };

    for entry in &cli.overrides {
        let (key, value) = entry
            .split_once('=')
            .ok_or_else(|| anyhow!("--set expects KEY=VALUE, got '{}'", entry))?;
        map.insert(key.trim().to_string(), value.trim().to_string());
    }

    Ok(BridgeConfig::from_config_map(&map)?)
}

fn token_provider() -> (Option<String>, Arc<dyn TokenProvider>) {
    if let Ok(host) = std::env::var("PUBSUB_EMULATOR_HOST") {
        info!(%host, "Using Pub/Sub emulator");
        return (
            Some(format!("http://{}", host)),
            Arc::new(StaticTokenProvider::anonymous()),
        );
    }
    let from_env = StaticTokenProvider::from_env();
    if !from_env.is_anonymous() {
        return (None, Arc::new(from_env));
    }
    (None, Arc::new(MetadataTokenProvider::new()))
}

async fn serve_metrics(addr: std::net::SocketAddr) {
    let router = pubsub_bridge_observability::create_metrics_router();
    match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => {
            info!(%addr, "Metrics server listening");
            if let Err(e) = axum::serve(listener, router).await {
                warn!(error = %e, "Metrics server stopped");
            }
        }
        Err(e) => warn!(%addr, error = %e, "Failed to bind metrics server"),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "Invalid configuration");
            std::process::exit(EXIT_CONFIG);
        }
    };

    let checkpoints = match ObjectStoreCheckpointStore::from_location(&config.checkpoint_location) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            error!(error = %e, "Invalid checkpoint location");
            std::process::exit(EXIT_CONFIG);
        }
    };

    let consumer = match KafkaSourceConsumer::new(&config) {
        Ok(consumer) => Arc::new(consumer),
        Err(e @ BridgeError::ConfigInvalid(_)) => {
            error!(error = %e, "Invalid Kafka configuration");
            std::process::exit(EXIT_CONFIG);
        }
        Err(e) => {
            error!(error = %e, "Failed to create Kafka consumer");
            std::process::exit(EXIT_FATAL);
        }
    };

    let (emulator_endpoint, tokens) = token_provider();
    let endpoint = emulator_endpoint.unwrap_or_else(|| config.pubsub_endpoint.clone());
    let transport = Arc::new(RestTransport::new(endpoint, tokens));

    let observer = Arc::new(
        MultiObserver::new()
            .with(Arc::new(TracingObserver))
            .with(Arc::new(MetricsObserver::new())),
    );

    if let Some(addr) = config.metrics_addr {
        tokio::spawn(serve_metrics(addr));
    }

    let shutdown = ShutdownHandle::new();
    shutdown.listen_for_signals();

    info!(
        source = %config.source_topic,
        destination = %config.destination_topic,
        "Kafka → Pub/Sub bridge starting"
    );
    let outcome = Coordinator::new(config, consumer, transport, checkpoints)
        .with_observer(observer)
        .with_shutdown(shutdown)
        .run()
        .await;

    match &outcome.fatal {
        Some(e) => error!(error = %e, reason = %outcome.reason, "Bridge stopped with a fatal error"),
        None => info!(reason = %outcome.reason, "Bridge stopped"),
    }
    std::process::exit(outcome.exit_code());
}
