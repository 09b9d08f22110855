#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::float_cmp,
        clippy::significant_drop_tightening,
        clippy::too_many_lines,
        clippy::match_same_arms,
        clippy::needless_pass_by_value,
        clippy::needless_collect,
        clippy::option_if_let_else,
        clippy::default_trait_access,
        clippy::items_after_statements,
        clippy::or_fun_call
    )
)]

//! Feed Broker - Shared Upstream Connection Broker
//!
//! Holds exactly one connection to a real-time market data source on behalf
//! of any number of local subscribers. The connection exists only while at
//! least one subscriber is attached. High-frequency deltas are coalesced
//! twice: once in the broker per coalescing window, and once per subscriber
//! per display-refresh frame.
//!
//! # Layers (inside → outside)
//!
//! - **Domain**: Message model and pure policies
//!   - `streaming`: records, deltas, snapshots, subscriber events
//!   - `coalescing`: last-write-wins pending-update set
//!   - `connection`: upstream connection state machine
//!   - `subscription`: subscriber identity and detach reasons
//!
//! - **Application**: Use cases and port definitions
//!   - `ports`: upstream, subscriber channel, clock, display interfaces
//!   - `services`: broker, coalescer, registry, liveness, connection,
//!     render batcher, feed client
//!
//! - **Infrastructure**: Adapters and external integrations
//!   - `upstream`: WebSocket connector and JSON codec
//!   - `broadcast`: bounded-queue subscriber channels
//!   - `gateway`: subscriber WebSocket endpoint
//!   - `config`: configuration from the environment
//!   - `health`: health check HTTP endpoint
//!   - `metrics` / `telemetry`: Prometheus and OpenTelemetry
//!
//! # Data Flow
//!
//! ```text
//!                    ┌──────────────┐   ┌───────────┐   ┌────────────┐
//! Upstream WS ──────►│  Connection  │──►│ Coalescer │──►│  Registry  │──► Subscriber 1
//!      ▲             │   Manager    │   │ (window)  │   │ (fan-out)  │──► Subscriber 2
//!      │             └──────────────┘   └───────────┘   └────────────┘──► Subscriber N
//!      └── commands ◄──────────────────────────────────────────┘              │
//!                                                                             ▼
//!                                                      FeedClient ──► RenderBatcher ──► display
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]

// =============================================================================
// Module Declarations
// =============================================================================

/// Domain layer - Core broker types with no I/O.
pub mod domain;

/// Application layer - Use cases and port definitions.
pub mod application;

/// Infrastructure layer - Adapters and external integrations.
pub mod infrastructure;

// =============================================================================
// Re-exports
// =============================================================================

// Domain types
pub use domain::connection::ConnectionState;
pub use domain::streaming::{
    BatchedUpdate, BrokerEvent, DeltaMessage, FieldMap, InstrumentRecord, Snapshot,
    SubscriberMessage, Symbol, UpstreamMessage,
};
pub use domain::subscription::{DetachReason, SubscriberId};

// Ports
pub use application::ports::{
    Clock, DisplaySink, RefreshSignal, SendFailure, SubscriberChannel, SystemClock,
    TransportError, UpstreamConnector, UpstreamStream,
};

// Services
pub use application::services::{
    Broker, BrokerError, BrokerOptions, BrokerStats, FeedClient, IntervalRefresh, LivenessConfig,
    RenderBatcher,
};

// Infrastructure config
pub use infrastructure::config::{BrokerConfig, ConfigError, ServerSettings};

// Subscriber channels (for integration tests and in-process clients)
pub use infrastructure::broadcast::{ChannelSubscriber, channel_subscriber};

// Upstream adapters
pub use infrastructure::upstream::{JsonCodec, WebSocketConnector};

// Servers
pub use infrastructure::gateway::{GatewayError, GatewayServer, GatewayState};
pub use infrastructure::health::{HealthServer, HealthServerError, HealthServerState};

// Metrics
pub use infrastructure::metrics::init_metrics;

// Telemetry
pub use infrastructure::telemetry::{TelemetryConfig, TelemetryGuard, init as init_telemetry};
