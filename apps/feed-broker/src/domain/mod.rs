//! Domain Layer - Core broker types and pure policies.
//!
//! This layer contains the message model, the pending-update set shared by
//! both coalescing tiers, and the upstream connection transition table.
//! Nothing here performs I/O or owns a timer.

/// Message model (records, deltas, snapshots, subscriber events).
pub mod streaming;

/// Last-write-wins pending-update set.
pub mod coalescing;

/// Upstream connection state machine.
pub mod connection;

/// Subscriber identity and detach reasons.
pub mod subscription;
