//! Livewire Server - Main entry point.
//!
//! This binary starts the Livewire telemetry hub with:
//! - Structured JSON logging for production
//! - MQTT ingestion feeding the broadcast hub
//! - Graceful shutdown handling (SIGTERM/SIGINT)
//!
//! # Configuration
//!
//! See [`livewire_server::config`] for environment variable configuration.
//!
//! # Example
//!
//! ```bash
//! JWT_SECRET="change-me" \
//! MQTT_BROKER="broker.local" \
//! MQTT_TOPIC_SENSORS_DATA="sensors/data/" \
//! PORT=8080 \
//! cargo run --release --bin livewire-server
//! ```

use std::process::ExitCode;

use axum::Router;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use livewire_server::broadcast::BroadcastHub;
use livewire_server::config::{Config, ConfigError};
use livewire_server::error::{Result, ServerError};
use livewire_server::ingest::MqttIngestor;
use livewire_server::registry::SubscriberRegistry;
use livewire_server::routes::{create_router, AppState, LIVE_DATA_PATH};

#[tokio::main]
async fn main() -> ExitCode {
    init_logging();

    match run().await {
        Ok(()) => {
            info!("Server shutdown complete");
            ExitCode::SUCCESS
        }
        Err(ServerError::Config(err)) => {
            error!(error = %err, "Failed to load configuration");
            print_usage(&err);
            ExitCode::from(1)
        }
        Err(err) => {
            error!(error = %err, "Server failed");
            ExitCode::from(1)
        }
    }
}

/// Runs the hub until a shutdown signal arrives.
///
/// The hub and ingestion task are torn down on every exit path after they
/// have been started.
async fn run() -> Result<()> {
    let config = Config::from_env()?;

    info!(
        port = config.port,
        broker = %config.ingest.host,
        broker_port = config.ingest.port,
        "Livewire server starting"
    );

    // Registry and hub must exist before either side can use them.
    let registry = SubscriberRegistry::new();
    let hub = BroadcastHub::with_send_timeout(registry.clone(), config.send_timeout).start();

    let ingest_handle = MqttIngestor::new(&config.ingest).spawn(hub.publisher());

    let app = create_router(AppState::new(config.clone(), registry));

    let result = serve(app, config.port).await;

    info!("Server shutting down gracefully");

    ingest_handle.abort();
    info!("MQTT ingestion stopped");

    hub.shutdown().await;

    result
}

/// Binds the listener and serves `app` until a shutdown signal arrives.
async fn serve(app: Router, port: u16) -> Result<()> {
    let bind_addr = format!("0.0.0.0:{port}");
    let listener = TcpListener::bind(&bind_addr)
        .await
        .map_err(|err| ServerError::internal(format!("failed to bind {bind_addr}: {err}")))?;

    info!(
        port,
        address = %bind_addr,
        path = LIVE_DATA_PATH,
        "Server listening"
    );
    info!("Server ready to accept connections");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|err| ServerError::internal(format!("server error: {err}")))
}

/// Prints the configuration reference after a configuration error.
fn print_usage(err: &ConfigError) {
    eprintln!("Error: {err}");
    eprintln!();
    eprintln!("Required environment variables:");
    eprintln!("  JWT_SECRET              - HMAC secret for subscriber tokens");
    eprintln!("  MQTT_BROKER             - MQTT broker host");
    eprintln!();
    eprintln!("Optional environment variables:");
    eprintln!("  PORT                    - HTTP server port (default: 8080)");
    eprintln!("  MQTT_PORT               - MQTT broker port (default: 1883)");
    eprintln!("  MQTT_USERNAME           - MQTT username");
    eprintln!("  MQTT_PASSWORD           - MQTT password");
    eprintln!("  MQTT_TOPIC_SENSORS_DATA - Topic prefix to subscribe under");
    eprintln!("  MQTT_CLIENT_ID          - MQTT client id (default: random)");
    eprintln!("  HUB_SEND_TIMEOUT_SECS   - Per-subscriber write timeout (default: 10)");
    eprintln!("  RUST_LOG                - Log level filter (default: info)");
}

/// Initialize structured logging with tracing.
///
/// JSON output, filtered by `RUST_LOG` with a default of `info`.
fn init_logging() {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tower_http=debug,axum::rejection=trace"));

    let json_layer = fmt::layer()
        .json()
        .with_target(true)
        .with_level(true)
        .with_file(false)
        .with_line_number(false);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(json_layer)
        .init();
}

/// Creates a future that resolves when a shutdown signal is received.
///
/// Listens for:
/// - SIGTERM (container orchestrator shutdown)
/// - SIGINT (Ctrl+C)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            error!(error = %err, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                error!(error = %err, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT (Ctrl+C), initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
