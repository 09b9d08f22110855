//! Subscriber Registry
//!
//! Exclusive owner of every Subscriber Entry. Fans events out to all
//! attached subscribers.
//!
//! # Ordering
//!
//! Fan-out runs under the registry lock, so every subscriber observes the
//! same event order, and a subscriber attached with a greeting sees the
//! greeting before any later broadcast. Channel sends are non-blocking, and
//! nothing else is called while the lock is held.
//!
//! # Partial failure
//!
//! A failed send never aborts a broadcast. The registry only reports which
//! subscribers failed; the caller decides how to detach them (detaching can
//! cascade into upstream teardown, which the registry knows nothing about).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

use crate::application::ports::{SendFailure, SubscriberChannel};
use crate::domain::streaming::BrokerEvent;
use crate::domain::subscription::SubscriberId;

/// One attached subscriber.
pub struct SubscriberEntry {
    id: SubscriberId,
    channel: Arc<dyn SubscriberChannel>,
    last_liveness: Instant,
}

impl SubscriberEntry {
    /// Subscriber identity.
    #[must_use]
    pub const fn id(&self) -> SubscriberId {
        self.id
    }

    /// Outbound channel.
    #[must_use]
    pub fn channel(&self) -> &Arc<dyn SubscriberChannel> {
        &self.channel
    }

    /// Last liveness acknowledgment (or attach time).
    #[must_use]
    pub const fn last_liveness(&self) -> Instant {
        self.last_liveness
    }
}

impl std::fmt::Debug for SubscriberEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriberEntry")
            .field("id", &self.id)
            .field("last_liveness", &self.last_liveness)
            .finish_non_exhaustive()
    }
}

/// Result of an attach.
#[derive(Debug)]
pub struct AttachOutcome {
    /// The registry was empty before this attach.
    pub first: bool,
    /// Greeting delivery failed; the entry was not kept.
    pub greeting_failed: Option<SendFailure>,
}

/// Result of a detach.
pub struct Detached {
    /// The removed entry.
    pub entry: SubscriberEntry,
    /// Subscribers left after removal.
    pub remaining: usize,
}

/// Thread-safe registry of attached subscribers.
#[derive(Default)]
pub struct SubscriberRegistry {
    entries: Mutex<HashMap<SubscriberId, SubscriberEntry>>,
}

impl SubscriberRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a subscriber with liveness stamped at `now`.
    ///
    /// `greeting` is called with `true` when this is the first subscriber;
    /// the events it returns are delivered to the new subscriber before the
    /// registry lock is released. If that delivery fails the entry is not
    /// kept.
    pub fn attach<G>(
        &self,
        id: SubscriberId,
        channel: Arc<dyn SubscriberChannel>,
        now: Instant,
        greeting: G,
    ) -> AttachOutcome
    where
        G: FnOnce(bool) -> Vec<BrokerEvent>,
    {
        let mut entries = self.entries.lock();
        let first = entries.is_empty();

        for event in greeting(first) {
            if let Err(failure) = channel.send(&event) {
                return AttachOutcome {
                    first,
                    greeting_failed: Some(failure),
                };
            }
        }

        entries.insert(
            id,
            SubscriberEntry {
                id,
                channel,
                last_liveness: now,
            },
        );

        AttachOutcome {
            first,
            greeting_failed: None,
        }
    }

    /// Remove a subscriber. `None` if it was not attached.
    pub fn detach(&self, id: SubscriberId) -> Option<Detached> {
        let mut entries = self.entries.lock();
        let entry = entries.remove(&id)?;
        Some(Detached {
            entry,
            remaining: entries.len(),
        })
    }

    /// Remove every subscriber.
    pub fn drain(&self) -> Vec<SubscriberEntry> {
        self.entries.lock().drain().map(|(_, entry)| entry).collect()
    }

    /// Deliver `event` to every attached subscriber.
    ///
    /// Returns the subscribers whose delivery failed. They are still
    /// attached; the caller detaches them.
    #[must_use]
    pub fn broadcast(&self, event: &BrokerEvent) -> Vec<(SubscriberId, SendFailure)> {
        let entries = self.entries.lock();
        entries
            .values()
            .filter_map(|entry| entry.channel.send(event).err().map(|err| (entry.id, err)))
            .collect()
    }

    /// Stamp a liveness acknowledgment. `false` if not attached.
    pub fn record_liveness(&self, id: SubscriberId, now: Instant) -> bool {
        self.entries.lock().get_mut(&id).is_some_and(|entry| {
            entry.last_liveness = now;
            true
        })
    }

    /// Subscribers whose last liveness is more than `timeout` before `now`.
    #[must_use]
    pub fn stale(&self, now: Instant, timeout: Duration) -> Vec<SubscriberId> {
        self.entries
            .lock()
            .values()
            .filter(|entry| now.saturating_duration_since(entry.last_liveness) > timeout)
            .map(|entry| entry.id)
            .collect()
    }

    /// Whether `id` is attached.
    #[must_use]
    pub fn contains(&self, id: SubscriberId) -> bool {
        self.entries.lock().contains_key(&id)
    }

    /// Number of attached subscribers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether no subscriber is attached.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl std::fmt::Debug for SubscriberRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriberRegistry")
            .field("subscribers", &self.len())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
