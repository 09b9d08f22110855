//! Application Services
//!
//! Services that orchestrate domain logic and coordinate between ports.
//!
//! - `Broker`: composition root wiring the components below
//! - `UpstreamConnectionManager`: the single shared upstream stream
//! - `Coalescer`: window-driven last-write-wins delta merging
//! - `SubscriberRegistry`: attached subscribers and fan-out
//! - `LivenessMonitor`: probe and evict silent subscribers
//! - `RenderBatcher` / `FeedClient`: the subscriber side

/// Broker composition root.
pub mod broker;

/// Subscriber-side event loop.
pub mod client;

/// Timer-driven delta coalescer.
pub mod coalescer;

/// Upstream connection manager.
pub mod connection;

/// Liveness probing and eviction.
pub mod liveness;

/// Subscriber registry.
pub mod registry;

/// Refresh-aligned render batcher.
pub mod render_batcher;

/// Cancellable timer handles.
pub mod timer;

pub use broker::{Broker, BrokerError, BrokerOptions, BrokerStats};
pub use client::FeedClient;
pub use coalescer::{BatchSink, Coalescer, DEFAULT_COALESCE_WINDOW};
pub use connection::{DEFAULT_RECONNECT_DELAY, UpstreamConnectionManager, UpstreamObserver};
pub use liveness::{LivenessConfig, LivenessMonitor, LivenessTarget};
pub use registry::SubscriberRegistry;
pub use render_batcher::{DEFAULT_REFRESH_PERIOD, IntervalRefresh, RenderBatcher};
pub use timer::ScheduledTask;
