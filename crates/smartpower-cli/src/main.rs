//! `smartpowerd` – SmartPower device gateway daemon.
//!
//! 1. Initialises logging (and OTLP export when configured).
//! 2. Loads `smartpower.toml` (see [`config`]) and applies `SMARTPOWER_*`
//!    overrides.
//! 3. Connects the message bus: an MQTT broker, or the in-process bus when
//!    `bus.kind = "local"`.
//! 4. Subscribes the command relay and serves devices until Ctrl-C.

mod config;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use smartpower_gateway::telemetry;
use smartpower_gateway::{Gateway, GatewayServer};
use smartpower_middleware::{EventBus, MessageBus, MqttBus};
use smartpower_types::GatewayError;
use tracing::{error, info, warn};

use crate::config::{BusKind, Config};

const SERVICE_NAME: &str = "smartpowerd";

/// How long startup waits for the first broker `ConnAck` before serving
/// devices anyway.
const BROKER_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// SmartPower device gateway.
#[derive(Parser, Debug)]
#[command(name = "smartpowerd", version, about = "SmartPower TCP ↔ MQTT device gateway")]
struct Cli {
    /// Path to the TOML config file (default: $SMARTPOWER_CONFIG or ./smartpower.toml).
    #[arg(long, short)]
    config: Option<PathBuf>,

    /// Listen address override, e.g. `0.0.0.0:8860`.
    #[arg(long)]
    listen: Option<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let _guard = telemetry::init_tracing(SERVICE_NAME);

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "gateway stopped");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<(), GatewayError> {
    let (mut cfg, path) = config::load(cli.config)?;
    if let Some(listen) = cli.listen {
        cfg.gateway.listen_addr = listen;
    }
    info!(
        path = %path.display(),
        listen_addr = %cfg.gateway.listen_addr,
        bus = ?cfg.bus.kind,
        "configuration loaded"
    );

    let bus = connect_bus(&cfg).await;
    let gateway = Arc::new(Gateway::new(bus, cfg.effective_gateway(), cfg.topics.clone()));

    // Devices are still served without a command path.
    let relay = match gateway.spawn_relay().await {
        Ok(handle) => Some(handle),
        Err(e) => {
            warn!(error = %e, "command relay unavailable");
            None
        }
    };

    let result = GatewayServer::new(Arc::clone(&gateway))
        .run_until(shutdown_signal())
        .await;

    if let Some(relay) = relay {
        relay.abort();
    }
    info!(devices = gateway.registry().len(), "gateway shut down");
    result
}

// ─────────────────────────────────────────────────────────────────────────────
// Bus selection
// ─────────────────────────────────────────────────────────────────────────────

async fn connect_bus(cfg: &Config) -> Arc<dyn MessageBus> {
    match cfg.bus.kind {
        BusKind::Local => {
            info!("using in-process bus; nothing is forwarded to a broker");
            Arc::new(EventBus::new(cfg.bus.mqtt.channel_capacity.max(1)))
        }
        BusKind::Mqtt => {
            let (bus, driver) = MqttBus::connect(&cfg.effective_mqtt());
            tokio::spawn(driver.run());
            match bus.wait_connected(BROKER_CONNECT_TIMEOUT).await {
                Ok(()) => info!(
                    host = %cfg.bus.mqtt.host,
                    port = cfg.bus.mqtt.port,
                    "connected to broker"
                ),
                // Publishes report Result "0" until the driver reconnects.
                Err(e) => warn!(error = %e, "starting without broker connection"),
            }
            Arc::new(bus)
        }
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to listen for Ctrl-C; running until killed");
        std::future::pending::<()>().await;
    }
    info!("Ctrl-C received, shutting down");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_defaults_to_no_overrides() {
        let cli = Cli::parse_from(["smartpowerd"]);
        assert_eq!(cli.config, None);
        assert_eq!(cli.listen, None);
    }

    #[test]
    fn cli_accepts_config_and_listen() {
        let cli = Cli::parse_from([
            "smartpowerd",
            "--config",
            "/etc/smartpower.toml",
            "--listen",
            "127.0.0.1:9000",
        ]);
        assert_eq!(cli.config, Some(PathBuf::from("/etc/smartpower.toml")));
        assert_eq!(cli.listen.as_deref(), Some("127.0.0.1:9000"));
    }

    #[test]
    fn cli_short_config_flag() {
        let cli = Cli::parse_from(["smartpowerd", "-c", "sp.toml"]);
        assert_eq!(cli.config, Some(PathBuf::from("sp.toml")));
    }

    #[tokio::test]
    async fn local_bus_kind_needs_no_broker() -> Result<(), Box<dyn std::error::Error>> {
        let mut cfg = Config::default();
        cfg.bus.kind = BusKind::Local;
        let bus = connect_bus(&cfg).await;

        let mut sub = bus.subscribe("/smartpower/command", Default::default()).await?;
        bus.publish("/smartpower/command", b"ping".to_vec(), Default::default(), false)
            .await?;
        let msg = sub.recv().await.ok_or("subscription closed")?;
        assert_eq!(msg.payload, b"ping");
        Ok(())
    }
}
