mod config;
mod db;
mod level_recorder;
mod models;
mod mqtt_transport;
mod rest_server;
mod service_utils;
mod signals;
mod telemetry_hub;
mod topics;

use crate::config::Config;
use crate::db::HistoryStore;
use crate::level_recorder::start_level_recorder;
use crate::mqtt_transport::{BrokerOptions, RumqttTransport};
use crate::rest_server::run_rest_server;
use crate::service_utils::{handle_shutdown, publish_status, start_ingestion, start_signal_logger};
use crate::telemetry_hub::{HubSettings, TelemetryHub};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

#[tokio::main]
async fn main() {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    // Load configuration
    let config = match Config::from_env() {
        Ok(cfg) => Arc::new(cfg),
        Err(e) => {
            error!("Error loading configuration: {:?}", e);
            return;
        }
    };

    let store = match HistoryStore::new(&config.history_db_path, config.history_max_records) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            error!("Failed to open history database: {:?}", e);
            return;
        }
    };

    if let Err(e) = store.initialize_db() {
        error!("History database initialization failed: {:?}", e);
        return;
    }
    info!("History database initialized successfully.");

    let transport = Arc::new(RumqttTransport::new(BrokerOptions::from(config.as_ref())));
    let hub = match TelemetryHub::new(HubSettings::from(config.as_ref()), transport) {
        Ok(hub) => hub,
        Err(e) => {
            error!("Failed to create telemetry hub: {}", e);
            return;
        }
    };

    hub.connect();

    if let Err(e) = start_ingestion(&hub) {
        error!("Failed to start ingestion: {}", e);
        return;
    }

    if let Err(e) = publish_status(&hub, "running", Some("Telemetry hub started.")) {
        error!("Failed to publish startup status: {}", e);
    }

    let signal_loggers = start_signal_logger(&hub);

    let recorder = start_level_recorder(
        hub.clone(),
        store.clone(),
        Duration::from_secs(config.record_interval_secs),
    );

    // Start REST API server
    let rest_hub = hub.clone();
    let rest_config = config.clone();
    let rest_api_task = tokio::spawn(async move {
        if let Err(e) = run_rest_server(
            rest_hub,
            store,
            &rest_config.rest_address,
            rest_config.rest_port,
        )
        .await
        {
            error!("REST server failed: {}", e);
        }
    });

    handle_shutdown(&hub).await;

    recorder.abort();
    for logger in signal_loggers {
        logger.abort();
    }
    let _ = tokio::join!(rest_api_task);
    info!("All services shut down successfully.");
}
