use anyhow::Context;
use axum::{routing::get, Router};
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use tracker::config::{Config, StorageBackend};
use tracker::db::{make_pool, PgStore};
use tracker::memory::MemoryStore;
use tracker::store::{DeviceStore, TelemetryStore};
use tracker::{metrics, mqtt, rest, Hub};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::from_env();

    info!("Starting telemetry tracker");
    info!("HTTP server: {}", config.http_addr);
    info!(
        "Delivery timeout: {:?}, subscriber queue: {}",
        config.delivery_timeout, config.subscriber_queue
    );

    // Initialize metrics
    metrics::init_metrics();

    let mut pg_store: Option<PgStore> = None;
    let (telemetry, devices): (Arc<dyn TelemetryStore>, Arc<dyn DeviceStore>) =
        match config.storage_backend {
            StorageBackend::Postgres => {
                info!("Database: {}", config.redacted_database_url());
                let pool = make_pool(&config.database_url, config.db_max_connections)
                    .await
                    .context("Failed to connect to database")?;
                let store = Arc::new(PgStore::new(pool));
                pg_store = Some(store.as_ref().clone());
                let telemetry: Arc<dyn TelemetryStore> = store.clone();
                let devices: Arc<dyn DeviceStore> = store;
                (telemetry, devices)
            }
            StorageBackend::Memory => {
                warn!("Using in-memory storage; telemetry is lost on restart");
                let store = Arc::new(MemoryStore::new());
                let telemetry: Arc<dyn TelemetryStore> = store.clone();
                let devices: Arc<dyn DeviceStore> = store;
                (telemetry, devices)
            }
        };

    let hub = Hub::new(&config, telemetry, devices);

    let mqtt_handle = match config.mqtt_broker.clone() {
        Some(broker) if hub.allows_unauthenticated_ingest() => {
            let client_id = format!("tracker-{}", uuid::Uuid::new_v4());
            let pipeline = hub.pipeline().clone();
            let (port, topic) = (config.mqtt_port, config.mqtt_topic.clone());
            Some(tokio::spawn(async move {
                if let Err(e) = mqtt::run_mqtt(broker, port, client_id, topic, pipeline).await {
                    error!("MQTT task failed: {}", e);
                }
            }))
        }
        Some(_) => {
            warn!("MQTT bridge disabled: unauthenticated ingestion is turned off");
            None
        }
        None => None,
    };

    // Build HTTP app with REST API, live stream and metrics endpoint
    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .merge(rest::create_router(hub, &config.cors_allowed_origins));

    let listener = tokio::net::TcpListener::bind(&config.http_addr)
        .await
        .with_context(|| format!("Failed to bind to {}", config.http_addr))?;

    info!("HTTP server listening on {}", config.http_addr);

    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap_or_else(|e| {
            error!("HTTP server error: {}", e);
        });
    });

    let mqtt_done = async {
        match mqtt_handle {
            Some(handle) => {
                let _ = handle.await;
            }
            None => std::future::pending::<()>().await,
        }
    };

    tokio::select! {
        _ = mqtt_done => {
            error!("MQTT task terminated");
        }
        _ = server_handle => {
            error!("HTTP server terminated");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
    }

    info!("Shutting down");
    if let Some(store) = pg_store {
        store.close().await;
    }
    Ok(())
}

async fn metrics_handler() -> String {
    metrics::gather_metrics()
}
