//! Feed Broker Binary
//!
//! Starts the shared upstream connection broker.
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin feed-broker
//! ```
//!
//! # Environment Variables
//!
//! ## Required
//! - `FEED_BROKER_UPSTREAM_URL`: Upstream WebSocket URL (`ws://` or `wss://`)
//!
//! ## Optional
//! - `FEED_BROKER_RECONNECT_DELAY_MS`: Reconnect backoff (default: 2000)
//! - `FEED_BROKER_COALESCE_WINDOW_US`: Coalescing window (default: 16667)
//! - `FEED_BROKER_LIVENESS_INTERVAL_SECS`: Liveness probe interval (default: 10)
//! - `FEED_BROKER_LIVENESS_TIMEOUT_SECS`: Liveness eviction timeout (default: 30)
//! - `FEED_BROKER_SUBSCRIBER_BUFFER`: Per-subscriber queue depth (default: 1024)
//! - `FEED_BROKER_GATEWAY_PORT`: Subscriber WebSocket port (default: 8080)
//! - `FEED_BROKER_HEALTH_PORT`: Health check HTTP port (default: 8082)
//! - `OTEL_ENABLED`: Enable OpenTelemetry (default: true)
//! - `OTEL_EXPORTER_OTLP_ENDPOINT`: OTLP endpoint (default: <http://localhost:4318>)
//! - `OTEL_SERVICE_NAME`: Service name (default: feed-broker)
//! - `RUST_LOG`: Log level (default: info)

use std::sync::Arc;
use std::time::Duration;

use feed_broker::infrastructure::telemetry;
use feed_broker::{
    Broker, BrokerConfig, GatewayServer, GatewayState, HealthServer, HealthServerState,
    SystemClock, WebSocketConnector, init_metrics,
};
use tokio::signal;
use tokio_util::sync::CancellationToken;

/// Graceful shutdown timeout.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
#[allow(clippy::expect_used)]
async fn main() -> anyhow::Result<()> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    load_dotenv();

    // Initialize telemetry (OpenTelemetry + tracing)
    let _telemetry_guard = telemetry::init();

    tracing::info!("Starting Feed Broker");

    // Initialize Prometheus metrics
    let _metrics_handle = init_metrics();

    let config = BrokerConfig::from_env()?;
    log_config(&config);

    let shutdown_token = CancellationToken::new();

    // The broker stays idle until the first subscriber attaches
    let broker = Broker::new(
        config.broker_options(),
        Arc::new(WebSocketConnector::new(config.upstream_url.clone())),
        Arc::new(SystemClock),
    );
    broker.start();

    // Spawn health server
    let health_state = Arc::new(HealthServerState::new(
        env!("CARGO_PKG_VERSION").to_string(),
        broker.clone(),
    ));
    let health_server = HealthServer::new(
        config.server.health_port,
        health_state,
        shutdown_token.clone(),
    );
    let health_handle = tokio::spawn(async move {
        if let Err(e) = health_server.run().await {
            tracing::error!(error = %e, "Health server error");
        }
    });

    // Spawn subscriber gateway
    let gateway_server = GatewayServer::new(
        config.server.gateway_port,
        GatewayState::new(broker.clone(), config.subscriber_buffer),
        shutdown_token.clone(),
    );
    let gateway_handle = tokio::spawn(async move {
        if let Err(e) = gateway_server.run().await {
            tracing::error!(error = %e, "Subscriber gateway error");
        }
    });

    tracing::info!("Feed broker ready");

    await_shutdown(shutdown_token).await;

    // Detaching every subscriber ends their sockets, letting the gateway drain
    broker.stop();

    let servers = async {
        let _ = tokio::join!(health_handle, gateway_handle);
    };
    if tokio::time::timeout(SHUTDOWN_TIMEOUT, servers).await.is_err() {
        tracing::warn!(
            timeout_secs = SHUTDOWN_TIMEOUT.as_secs(),
            "Servers did not stop within the shutdown timeout"
        );
    }

    tracing::info!("Feed broker stopped");
    Ok(())
}

/// Load .env file from current or ancestor directories.
fn load_dotenv() {
    if dotenvy::dotenv().is_err() {
        load_dotenv_from_ancestors();
    }
}

/// Log the parsed configuration.
fn log_config(config: &BrokerConfig) {
    tracing::info!(
        reconnect_delay_ms = u64::try_from(config.reconnect_delay.as_millis()).unwrap_or(u64::MAX),
        coalesce_window_us = u64::try_from(config.coalesce_window.as_micros()).unwrap_or(u64::MAX),
        liveness_interval_secs = config.liveness.interval.as_secs(),
        liveness_timeout_secs = config.liveness.timeout.as_secs(),
        subscriber_buffer = config.subscriber_buffer,
        gateway_port = config.server.gateway_port,
        health_port = config.server.health_port,
        "Configuration loaded"
    );
    tracing::debug!(upstream_url = %config.upstream_url, "Upstream endpoint");
}

/// Load .env file from any ancestor directory.
fn load_dotenv_from_ancestors() {
    if let Ok(cwd) = std::env::current_dir() {
        let mut dir = cwd.as_path();
        while let Some(parent) = dir.parent() {
            let env_path = parent.join(".env");
            if env_path.exists() {
                let _ = dotenvy::from_path(&env_path);
                return;
            }
            dir = parent;
        }
    }
}

/// Wait for shutdown signal (SIGTERM or SIGINT).
#[allow(clippy::expect_used)]
async fn await_shutdown(shutdown_token: CancellationToken) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("signal handler installation is critical for graceful shutdown");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("SIGTERM handler installation is critical for graceful shutdown")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown");
        }
    }

    shutdown_token.cancel();

    tracing::info!(
        timeout_secs = SHUTDOWN_TIMEOUT.as_secs(),
        "Graceful shutdown started"
    );
}
