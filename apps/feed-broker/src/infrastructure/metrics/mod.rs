//! Prometheus Metrics Module
//!
//! Exposes broker metrics via Prometheus format for monitoring.
//!
//! # Metrics Categories
//!
//! - **Upstream**: Messages received by kind, malformed frames, connection
//!   state, connect attempts and scheduled reconnects
//! - **Coalescing**: Batches flushed and items per batch
//! - **Subscribers**: Attached count, detaches by reason, forwarded commands
//!
//! # Integration
//!
//! Metrics are exposed at `/metrics` on the health server port.

use std::sync::OnceLock;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

use crate::domain::subscription::DetachReason;

// =============================================================================
// Global Metrics Handle
// =============================================================================

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Initialize the Prometheus metrics recorder.
///
/// # Panics
///
/// Panics if the recorder cannot be installed.
#[allow(clippy::expect_used)]
pub fn init_metrics() -> PrometheusHandle {
    PROMETHEUS_HANDLE
        .get_or_init(|| {
            let handle = PrometheusBuilder::new()
                .install_recorder()
                .expect("failed to install Prometheus recorder");

            register_metrics();
            handle
        })
        .clone()
}

/// Get the Prometheus handle for rendering metrics.
///
/// Returns `None` if metrics have not been initialized.
#[must_use]
pub fn get_metrics_handle() -> Option<PrometheusHandle> {
    PROMETHEUS_HANDLE.get().cloned()
}

// =============================================================================
// Metric Registration
// =============================================================================

fn register_metrics() {
    // Upstream
    describe_counter!(
        "feed_broker_upstream_messages_total",
        "Upstream messages received by kind"
    );
    describe_counter!(
        "feed_broker_upstream_malformed_total",
        "Upstream frames dropped because they could not be decoded"
    );
    describe_gauge!(
        "feed_broker_upstream_connected",
        "1 when the upstream stream is established, 0 otherwise"
    );
    describe_counter!(
        "feed_broker_connect_attempts_total",
        "Upstream connect attempts"
    );
    describe_counter!(
        "feed_broker_reconnects_scheduled_total",
        "Reconnect timers armed after a failure or drop"
    );

    // Coalescing
    describe_counter!(
        "feed_broker_batches_flushed_total",
        "Batched updates emitted by the coalescer"
    );
    describe_histogram!(
        "feed_broker_batch_items",
        "Symbols per batched update"
    );

    // Subscribers
    describe_gauge!(
        "feed_broker_subscribers",
        "Number of attached subscribers"
    );
    describe_counter!(
        "feed_broker_detaches_total",
        "Subscriber detaches by reason"
    );
    describe_counter!(
        "feed_broker_commands_total",
        "Subscriber commands by outcome"
    );
}

// =============================================================================
// Metric Recording Functions
// =============================================================================

/// Label for what happened to a subscriber command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandOutcome {
    /// Relayed to the upstream stream.
    Forwarded,
    /// Dropped because the upstream stream is not established.
    Dropped,
}

impl CommandOutcome {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Forwarded => "forwarded",
            Self::Dropped => "dropped",
        }
    }
}

/// Record an upstream message by kind.
pub fn record_upstream_message(kind: &'static str) {
    counter!("feed_broker_upstream_messages_total", "kind" => kind).increment(1);
}

/// Record a malformed upstream frame.
pub fn record_malformed() {
    counter!("feed_broker_upstream_malformed_total").increment(1);
}

/// Update the upstream connection gauge.
pub fn set_upstream_connected(connected: bool) {
    gauge!("feed_broker_upstream_connected").set(if connected { 1.0 } else { 0.0 });
}

/// Record an upstream connect attempt.
pub fn record_connect_attempt() {
    counter!("feed_broker_connect_attempts_total").increment(1);
}

/// Record an armed reconnect timer.
pub fn record_reconnect_scheduled() {
    counter!("feed_broker_reconnects_scheduled_total").increment(1);
}

/// Record one flushed batch.
#[allow(clippy::cast_precision_loss)]
pub fn record_batch_flushed(items: usize) {
    counter!("feed_broker_batches_flushed_total").increment(1);
    histogram!("feed_broker_batch_items").record(items as f64);
}

/// Update the attached subscriber gauge.
#[allow(clippy::cast_precision_loss)]
pub fn set_subscribers(count: usize) {
    gauge!("feed_broker_subscribers").set(count as f64);
}

/// Record a subscriber detach.
pub fn record_detach(reason: DetachReason) {
    counter!("feed_broker_detaches_total", "reason" => reason.as_str()).increment(1);
}

/// Record a subscriber command.
pub fn record_command(outcome: CommandOutcome) {
    counter!("feed_broker_commands_total", "outcome" => outcome.as_str()).increment(1);
}

// =============================================================================
// Tests
// =============================================================================
