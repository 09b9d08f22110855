//! Port Interfaces
//!
//! Defines the interfaces (ports) for external systems following
//! the Hexagonal Architecture pattern. These are the contracts that
//! infrastructure adapters must implement.
//!
//! ## Driven Ports (Outbound)
//!
//! - `UpstreamConnector` / `UpstreamStream`: the single data source connection
//! - `SubscriberChannel`: one subscriber's outbound channel
//! - `DisplaySink`: the client-side display layer
//!
//! ## Injected Services
//!
//! - `Clock`: monotonic and wall-clock time
//! - `RefreshSignal`: the host's display-refresh cadence

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::time::Instant;

use crate::domain::streaming::{BrokerEvent, DeltaMessage, Snapshot};

// =============================================================================
// Errors
// =============================================================================

/// Upstream transport failure. Recovered locally by reconnect-with-backoff.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// Opening the stream failed.
    #[error("upstream connect failed: {0}")]
    ConnectFailed(String),
    /// Writing to the stream failed.
    #[error("upstream send failed: {0}")]
    SendFailed(String),
    /// Reading from the stream failed.
    #[error("upstream receive failed: {0}")]
    ReceiveFailed(String),
}

/// Delivery to one subscriber failed. Recovered by detaching that subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SendFailure {
    /// The subscriber's outbound queue is full.
    #[error("subscriber channel full")]
    Full,
    /// The subscriber's channel is closed.
    #[error("subscriber channel closed")]
    Closed,
}

// =============================================================================
// Upstream
// =============================================================================

/// Factory for the upstream stream.
#[async_trait]
pub trait UpstreamConnector: Send + Sync {
    /// Open a new stream to the data source.
    ///
    /// # Errors
    ///
    /// Returns `TransportError::ConnectFailed` when the source is unreachable.
    async fn connect(&self) -> Result<Box<dyn UpstreamStream>, TransportError>;
}

/// A duplex text stream to the data source.
#[async_trait]
pub trait UpstreamStream: Send {
    /// Send one text frame.
    ///
    /// # Errors
    ///
    /// Returns a `TransportError` if the frame cannot be written.
    async fn send(&mut self, frame: String) -> Result<(), TransportError>;

    /// Receive the next text frame. `None` means the stream ended.
    async fn recv(&mut self) -> Option<Result<String, TransportError>>;

    /// Close the stream.
    async fn close(&mut self);
}

// =============================================================================
// Subscribers
// =============================================================================

/// One subscriber's outbound channel. Shared with the transport that owns it.
///
/// `send` must never block: liveness probes and broadcasts are
/// fire-and-forget.
#[cfg_attr(test, mockall::automock)]
pub trait SubscriberChannel: Send + Sync {
    /// Queue an event for delivery.
    ///
    /// # Errors
    ///
    /// Returns a `SendFailure` when the channel is full or closed.
    fn send(&self, event: &BrokerEvent) -> Result<(), SendFailure>;

    /// Close the channel. Idempotent.
    fn close(&self);
}

// =============================================================================
// Time
// =============================================================================

/// Time source for liveness stamps and flush tags.
pub trait Clock: Send + Sync {
    /// Monotonic now.
    fn now(&self) -> Instant;

    /// Wall-clock now.
    fn wall_clock(&self) -> DateTime<Utc>;
}

/// Clock backed by the tokio timer (pausable in tests) and the system clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn wall_clock(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

// =============================================================================
// Client Side
// =============================================================================

/// The display layer a subscriber renders into.
pub trait DisplaySink: Send + Sync {
    /// Replace all displayed state.
    fn apply_snapshot(&self, snapshot: &Snapshot);

    /// Apply one refresh frame's worth of rows.
    fn apply_rows(&self, rows: Vec<DeltaMessage>);

    /// Upstream connection status changed.
    fn connection_changed(&self, _connected: bool) {}
}

/// The host's display-refresh cadence.
#[async_trait]
pub trait RefreshSignal: Send {
    /// Resolve at the next refresh tick.
    async fn next_frame(&mut self);
}
