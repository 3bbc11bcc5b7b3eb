//! PDU bridge: polls CyberPower PDUs over SNMP (with serial console
//! fallback) and presents them over MQTT and HTTP/JSON.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use tokio::signal;
use tokio::sync::watch;

use pdubridge_common::config::LoggingConfig;
use pdubridge_common::init_tracing;
use pdubridge_core::history::HistoryStore;
use pdubridge_core::manager::BridgeManager;
use pdubridge_core::mqtt::MqttLink;
use pdubridge_core::persist::DataDir;

use pdubridge::args::BridgeArgs;
use pdubridge::auth::SessionStore;
use pdubridge::config::BridgeConfig;
use pdubridge::http::{AppState, HttpServer};

#[tokio::main]
async fn main() -> Result<()> {
    let args = BridgeArgs::parse_with_default("pdubridge.json5");

    let config = BridgeConfig::load(&args.config).map_err(|e| anyhow::anyhow!("{}", e))?;

    let log_config = match &args.log_level {
        Some(level) => LoggingConfig {
            level: level.clone(),
            format: config.logging.format,
        },
        None => config.logging.clone(),
    };
    init_tracing(&log_config).map_err(|e| anyhow::anyhow!("{}", e))?;

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "Starting PDU bridge");

    config.validate().map_err(|e| anyhow::anyhow!("{}", e))?;

    let data = DataDir::new(&config.data_dir).map_err(|e| anyhow::anyhow!("{}", e))?;

    // Persisted runtime settings win over the config file's initial values.
    let settings = data
        .read(&data.settings_path())
        .map_err(|e| anyhow::anyhow!("{}", e))?
        .unwrap_or_else(|| config.settings.clone());

    let history = Arc::new(
        HistoryStore::open(data.history_path()).map_err(|e| anyhow::anyhow!("{}", e))?,
    );

    let mqtt = MqttLink::new(&config.mqtt);
    let mqtt_task = mqtt.start();

    let manager = BridgeManager::start(
        config.devices.clone(),
        settings,
        mqtt,
        history,
        data,
        None,
    )
    .await
    .map_err(|e| anyhow::anyhow!("{}", e))?;

    let listen_addr: SocketAddr = config
        .http
        .listen
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid http.listen '{}': {}", config.http.listen, e))?;

    let state = AppState {
        manager: manager.clone(),
        sessions: Arc::new(SessionStore::new()),
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let http_task = tokio::spawn(HttpServer::new(state, listen_addr).run(shutdown_rx));

    tracing::info!(
        devices = manager.device_ids().len(),
        http = %listen_addr,
        "Bridge running. Press Ctrl+C to stop."
    );

    if let Err(e) = signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for Ctrl+C");
    }

    tracing::info!("Received shutdown signal");

    let _ = shutdown_tx.send(true);
    manager.shutdown().await;
    mqtt_task.abort();

    if let Err(e) = http_task.await {
        tracing::warn!(error = %e, "HTTP task ended abnormally");
    }

    tracing::info!("Goodbye!");
    Ok(())
}
