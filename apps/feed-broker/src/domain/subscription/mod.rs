//! Subscriber Identity Types
//!
//! Identity and detach bookkeeping for locally attached subscribers.

use std::fmt;

use serde::Serialize;
use uuid::Uuid;

/// Unique identifier for an attached subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriberId(Uuid);

impl SubscriberId {
    /// Generate a fresh random identity.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Underlying UUID.
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for SubscriberId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Why a subscriber left the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DetachReason {
    /// The subscriber sent `unsubscribe`.
    Unsubscribed,
    /// The subscriber's transport closed.
    ChannelClosed,
    /// Delivery to the subscriber's channel failed.
    SendFailure,
    /// No liveness ack within the timeout.
    LivenessTimeout,
    /// The broker is stopping.
    Shutdown,
}

impl DetachReason {
    /// Reason label for logs and metrics.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Unsubscribed => "unsubscribed",
            Self::ChannelClosed => "channel_closed",
            Self::SendFailure => "send_failure",
            Self::LivenessTimeout => "liveness_timeout",
            Self::Shutdown => "shutdown",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identities_are_unique() {
        assert_ne!(SubscriberId::new(), SubscriberId::new());
    }

    #[test]
    fn display_matches_uuid() {
        let id = SubscriberId::new();
        assert_eq!(id.to_string(), id.as_uuid().to_string());
    }
}
