//! Infrastructure Layer - Adapters and external integrations.
//!
//! This layer contains the concrete implementations of the port interfaces
//! defined in the application layer.

/// Upstream WebSocket connector and JSON wire codec.
pub mod upstream;

/// Bounded-queue subscriber channel adapter.
pub mod broadcast;

/// Configuration loading from the environment.
pub mod config;

/// Subscriber WebSocket gateway.
pub mod gateway;

/// Health check HTTP endpoint.
pub mod health;

/// Prometheus metrics instrumentation.
pub mod metrics;

/// OpenTelemetry tracing integration.
pub mod telemetry;
