//! blueplug - BLE to MQTT bridge daemon.
//!
//! Run with: `cargo run -p blueplug-service -- --mqtt-addr localhost`

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::{info, warn};

use blueplug_core::BtleplugAdapter;
use blueplug_service::{Config, Coordinator, MqttLink, parse_broker_url, spawn_bridge};

/// Bridge BLE sensors to an MQTT broker.
#[derive(Parser, Debug)]
#[command(name = "blueplug")]
#[command(version, about, long_about = None)]
struct Args {
    /// MQTT client identifier (overrides config).
    #[arg(long)]
    client_id: Option<String>,

    /// MQTT broker host, or an `mqtt://` / `mqtts://` URL (overrides config).
    #[arg(long)]
    mqtt_addr: Option<String>,

    /// MQTT broker port [default: 1883].
    #[arg(long)]
    mqtt_port: Option<u16>,

    /// Path to configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Topic prefix (overrides config).
    #[arg(long)]
    topic_prefix: Option<String>,

    /// Connect to the broker over TLS.
    #[arg(long)]
    tls: bool,

    /// MQTT username.
    #[arg(long)]
    username: Option<String>,

    /// MQTT password.
    #[arg(long, env = "BLUEPLUG_MQTT_PASSWORD", hide_env_values = true)]
    password: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("blueplug=info".parse()?)
                .add_directive("blueplug_service=info".parse()?)
                .add_directive("blueplug_core=info".parse()?),
        )
        .init();

    let mut config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::load_default().unwrap_or_else(|e| {
            warn!("Ignoring unreadable default config: {}", e);
            Config::default()
        }),
    };
    apply_args(&mut config, args)?;
    config.validate()?;

    run(config).await
}

/// Override config values with command-line flags.
fn apply_args(config: &mut Config, args: Args) -> anyhow::Result<()> {
    if let Some(client_id) = args.client_id {
        config.mqtt.client_id = client_id;
    }
    if let Some(addr) = args.mqtt_addr {
        if addr.contains("://") {
            let (host, port, tls) = parse_broker_url(&addr)
                .map_err(|e| anyhow::anyhow!(e))
                .with_context(|| format!("invalid --mqtt-addr '{}'", addr))?;
            config.mqtt.host = host;
            config.mqtt.port = port;
            config.mqtt.tls |= tls;
        } else {
            config.mqtt.host = addr;
        }
    }
    if let Some(port) = args.mqtt_port {
        config.mqtt.port = port;
    }
    if let Some(prefix) = args.topic_prefix {
        config.mqtt.topic_prefix = prefix;
    }
    if args.tls {
        config.mqtt.tls = true;
    }
    if let Some(username) = args.username {
        config.mqtt.username = Some(username);
    }
    if let Some(password) = args.password {
        config.mqtt.password = Some(password);
    }
    Ok(())
}

async fn run(config: Config) -> anyhow::Result<()> {
    info!(
        "Publishing to {}:{} as '{}' under '{}'",
        config.mqtt.host, config.mqtt.port, config.mqtt.client_id, config.mqtt.topic_prefix
    );

    let registry = config.registry();
    let bridge = spawn_bridge(
        MqttLink::from_config(&config.mqtt),
        config.topic_mapper(),
        config.bridge_options(),
    );

    let adapter = match BtleplugAdapter::first().await {
        Ok(adapter) => adapter,
        Err(e) => {
            bridge.shutdown().await;
            return Err(e).context("no usable Bluetooth adapter");
        }
    };

    let coordinator = Coordinator::new(
        Arc::new(adapter),
        registry,
        bridge,
        config.coordinator_options(),
    );
    let report = coordinator
        .run(shutdown_signal())
        .await
        .context("failed to start scanning")?;

    info!(
        "Stopped: {} sessions closed ({} aborted), {} messages delivered, {} undelivered, {} dropped",
        report.sessions,
        report.sessions_aborted,
        report.bridge.delivered,
        report.bridge.undelivered,
        report.bridge.dropped
    );
    Ok(())
}

/// Resolves on Ctrl-C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
