//! TSDB Writer Microservice
//!
//! Forwards measurement records to InfluxDB without losing data when the
//! database is briefly unavailable:
//! - Typed point encoding from JSON payloads
//! - Failed batches buffered on disk, keyed by content hash
//! - Single-flight replay of the buffer once writes succeed again

mod buffer;
mod config;
mod coordinator;
mod encoder;
mod error;
mod handlers;
mod record;
mod routes;
mod session;
mod store;

#[cfg(test)]
mod tests;

use std::sync::Arc;
use std::time::Instant;

use brivas_influx_sdk::{BufferedWriteApi, InfluxClient, LineTransport, WriteApi};
use brivas_telemetry::TelemetryConfig;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{info, warn};

pub use config::{BufferBackend, Config};
pub use error::{Error, Result};

use encoder::PointEncoder;
use session::WriteSession;
use store::{FileStore, KvStore, MemoryStore};

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub session: Arc<WriteSession>,
    pub influx: Arc<InfluxClient>,
    pub config: Arc<Config>,
    pub start_time: Instant,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration
    let config = Config::from_env()?;
    let bind_addr = config.bind_address()?;

    // Initialize logging and tracing
    let telemetry = TelemetryConfig {
        service_name: config.service_name.clone(),
        ..TelemetryConfig::from_env()
    };
    let _telemetry = brivas_telemetry::init_with(&config.service_name, &telemetry)?;

    info!(
        influx = %config.influx_url,
        precision = %config.precision,
        buffer = ?config.buffer_backend,
        "Starting TSDB Writer microservice"
    );

    // Failed-write buffer store
    let store = open_store(&config).await?;

    // Sink client
    let influx = Arc::new(InfluxClient::new(&config.influx_config(), config.precision)?);
    let transport: Arc<dyn LineTransport> = influx.clone();
    let options = config.write_options();

    let session = Arc::new(WriteSession::new(
        move |hooks| {
            let api = BufferedWriteApi::new(transport, hooks, options);
            let _ = api.start_periodic_flush();
            api as Arc<dyn WriteApi>
        },
        store,
        PointEncoder::new(config.default_measurement.clone(), config.precision),
    ));

    // Replay whatever an earlier run left behind
    match session.buffer().len().await {
        Ok(0) => {}
        Ok(n) if influx.is_healthy().await => {
            info!(entries = n, "Found buffered batches from a previous run");
            session.signal_healthy();
        }
        Ok(n) => info!(entries = n, "Buffered batches waiting for InfluxDB"),
        Err(e) => warn!(error = %e, "Could not inspect failure buffer"),
    }

    // Build application state
    let state = AppState {
        session: Arc::clone(&session),
        influx,
        config: Arc::new(config),
        start_time: Instant::now(),
    };

    let app = routes::create_router(state);

    // Start server
    let listener = TcpListener::bind(&bind_addr).await?;
    info!("TSDB Writer listening on {}", bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(wait_for_shutdown())
        .await?;

    if let Err(e) = session.close().await {
        warn!(error = %e, "Final flush on shutdown failed");
    }
    info!("TSDB Writer stopped");

    Ok(())
}

async fn open_store(config: &Config) -> anyhow::Result<Arc<dyn KvStore>> {
    let store: Arc<dyn KvStore> = match config.buffer_backend {
        BufferBackend::File => Arc::new(FileStore::open(config.buffer_dir.clone()).await?),
        BufferBackend::Memory => {
            warn!("Memory buffer selected; failed writes will not survive a restart");
            Arc::new(MemoryStore::new())
        }
    };
    Ok(store)
}

async fn wait_for_shutdown() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}
