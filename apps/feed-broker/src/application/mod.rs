//! Application Layer - Use cases and port definitions.
//!
//! This layer contains the broker's services and the port interfaces
//! that define how they interact with the upstream source, subscribers
//! and the client display layer.

/// Port interfaces for external systems (upstream, subscribers, time).
pub mod ports;

/// Broker services: coalescer, registry, liveness, connection, broker.
pub mod services;
