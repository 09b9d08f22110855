//! Broker
//!
//! Composition root for one upstream feed shared by many subscribers.
//!
//! Wires the upstream connection manager, the coalescer, the subscriber
//! registry and the liveness monitor together:
//!
//! ```text
//!                 snapshot / control ─────────────────────┐
//! Upstream ──► ConnectionManager                          ▼
//!                 delta-batch ──► Coalescer ──flush──► Registry ──► S1..SN
//!                                                          ▲
//!                 LivenessMonitor ──probe / evict──────────┘
//! ```
//!
//! Registry size drives the connection: the first attach raises demand and
//! starts the liveness monitor, the last detach enters idle (monitor stopped,
//! pending deltas discarded, upstream released).
//!
//! Attach and detach are serialized by a membership lock so that the
//! empty/non-empty edge is observed exactly once per transition.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;

use super::coalescer::{BatchSink, Coalescer, DEFAULT_COALESCE_WINDOW};
use super::connection::{DEFAULT_RECONNECT_DELAY, UpstreamConnectionManager, UpstreamObserver};
use super::liveness::{LivenessConfig, LivenessMonitor, LivenessTarget};
use super::registry::SubscriberRegistry;
use crate::application::ports::{Clock, SendFailure, SubscriberChannel, UpstreamConnector};
use crate::domain::connection::ConnectionState;
use crate::domain::streaming::{
    BatchedUpdate, BrokerEvent, ControlPayload, DeltaMessage, Snapshot, SubscriberMessage,
};
use crate::domain::subscription::{DetachReason, SubscriberId};
use crate::infrastructure::metrics;

// =============================================================================
// Options, Errors, Stats
// =============================================================================

/// Broker timing options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BrokerOptions {
    /// Coalescing window.
    pub coalesce_window: Duration,
    /// Constant reconnect backoff.
    pub reconnect_delay: Duration,
    /// Liveness probing.
    pub liveness: LivenessConfig,
}

impl Default for BrokerOptions {
    fn default() -> Self {
        Self {
            coalesce_window: DEFAULT_COALESCE_WINDOW,
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
            liveness: LivenessConfig::default(),
        }
    }
}

/// Broker operation errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum BrokerError {
    /// The broker is not started, or already stopped.
    #[error("broker is not running")]
    NotRunning,

    /// The late-joiner greeting could not be delivered; the subscriber was
    /// not attached.
    #[error("failed to greet subscriber: {0}")]
    Greeting(#[from] SendFailure),
}

/// Point-in-time broker statistics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BrokerStats {
    /// Whether the broker is started.
    pub running: bool,
    /// Upstream connection state.
    pub upstream_state: ConnectionState,
    /// Attached subscribers.
    pub subscribers: usize,
    /// Whether a reconnect timer is armed.
    pub reconnect_pending: bool,
    /// Records in the cached snapshot, if one is cached.
    pub snapshot_records: Option<usize>,
    /// Upstream connect attempts since creation.
    pub connect_attempts: u64,
    /// Batched updates broadcast since creation.
    pub batches_flushed: u64,
    /// Symbols waiting in the open coalescing window.
    pub pending_deltas: usize,
}

// =============================================================================
// Broker
// =============================================================================

/// Shared upstream broker. Cheap to clone.
#[derive(Clone)]
pub struct Broker {
    core: Arc<BrokerCore>,
}

struct BrokerCore {
    registry: SubscriberRegistry,
    connection: Arc<UpstreamConnectionManager>,
    coalescer: Arc<Coalescer>,
    liveness: LivenessMonitor,
    clock: Arc<dyn Clock>,
    membership: Mutex<()>,
    running: AtomicBool,
    batches_flushed: AtomicU64,
}

impl Broker {
    /// Create a stopped broker.
    #[must_use]
    pub fn new(
        options: BrokerOptions,
        connector: Arc<dyn UpstreamConnector>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let core = Arc::new_cyclic(|weak: &Weak<BrokerCore>| {
            let observer: Weak<dyn UpstreamObserver> = weak.clone();
            let sink: Weak<dyn BatchSink> = weak.clone();
            let target: Weak<dyn LivenessTarget> = weak.clone();

            BrokerCore {
                registry: SubscriberRegistry::new(),
                connection: UpstreamConnectionManager::new(
                    connector,
                    options.reconnect_delay,
                    observer,
                ),
                coalescer: Coalescer::new(options.coalesce_window, Arc::clone(&clock), sink),
                liveness: LivenessMonitor::new(options.liveness, target),
                clock,
                membership: Mutex::new(()),
                running: AtomicBool::new(false),
                batches_flushed: AtomicU64::new(0),
            }
        });

        Self { core }
    }

    /// Accept attaches. Idempotent.
    pub fn start(&self) {
        if !self.core.running.swap(true, Ordering::SeqCst) {
            tracing::info!("Broker started");
        }
    }

    /// Forced shutdown.
    ///
    /// Stops liveness probing, releases the upstream, runs any scheduled
    /// flush synchronously to the subscribers still attached, then closes
    /// every subscriber channel.
    pub fn stop(&self) {
        if !self.core.running.swap(false, Ordering::SeqCst) {
            return;
        }
        tracing::info!(subscribers = self.core.registry.len(), "Broker stopping");

        self.core.liveness.stop();
        self.core.connection.set_demand(false);
        self.core.coalescer.shutdown();

        let _membership = self.core.membership.lock();
        for entry in self.core.registry.drain() {
            entry.channel().close();
            metrics::record_detach(DetachReason::Shutdown);
        }
        metrics::set_subscribers(0);

        tracing::info!("Broker stopped");
    }

    /// Whether the broker accepts attaches.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.core.running.load(Ordering::SeqCst)
    }

    /// Attach a subscriber.
    ///
    /// The first subscriber raises upstream demand and starts liveness
    /// probing. A later subscriber is immediately sent the cached snapshot
    /// (if any) and the current connection status.
    ///
    /// # Errors
    ///
    /// Returns `BrokerError::NotRunning` if the broker is stopped, or
    /// `BrokerError::Greeting` if the late-joiner greeting could not be
    /// delivered.
    pub fn attach(&self, channel: Arc<dyn SubscriberChannel>) -> Result<SubscriberId, BrokerError> {
        self.core.attach(channel)
    }

    /// Detach a subscriber and close its channel. `false` if not attached.
    pub fn detach(&self, id: SubscriberId, reason: DetachReason) -> bool {
        self.core.detach(id, reason)
    }

    /// Route a message received from a subscriber.
    pub fn handle_subscriber_message(&self, id: SubscriberId, message: SubscriberMessage) {
        match message {
            SubscriberMessage::LivenessAck => {
                if !self.core.registry.record_liveness(id, self.core.clock.now()) {
                    tracing::debug!(subscriber_id = %id, "Liveness ack from unknown subscriber");
                }
            }
            SubscriberMessage::Unsubscribe => {
                self.core.detach(id, DetachReason::Unsubscribed);
            }
            SubscriberMessage::Command { payload } => {
                if self.core.registry.contains(id) {
                    self.core.connection.forward_command(&payload);
                }
            }
        }
    }

    /// Current upstream connection state.
    #[must_use]
    pub fn connection_state(&self) -> ConnectionState {
        self.core.connection.state()
    }

    /// Number of attached subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.core.registry.len()
    }

    /// Whether `id` is attached.
    #[must_use]
    pub fn is_attached(&self, id: SubscriberId) -> bool {
        self.core.registry.contains(id)
    }

    /// Whether a reconnect timer is armed.
    #[must_use]
    pub fn reconnect_pending(&self) -> bool {
        self.core.connection.reconnect_pending()
    }

    /// Whether the liveness monitor is ticking.
    #[must_use]
    pub fn liveness_running(&self) -> bool {
        self.core.liveness.is_running()
    }

    /// Snapshot of broker statistics.
    #[must_use]
    pub fn stats(&self) -> BrokerStats {
        let core = &self.core;
        BrokerStats {
            running: self.is_running(),
            upstream_state: core.connection.state(),
            subscribers: core.registry.len(),
            reconnect_pending: core.connection.reconnect_pending(),
            snapshot_records: core.connection.cached_snapshot().map(|s| s.len()),
            connect_attempts: core.connection.connect_attempts(),
            batches_flushed: core.batches_flushed.load(Ordering::Relaxed),
            pending_deltas: core.coalescer.pending_len(),
        }
    }
}

impl std::fmt::Debug for Broker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broker")
            .field("running", &self.is_running())
            .field("state", &self.connection_state())
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

// =============================================================================
// Core
// =============================================================================

impl BrokerCore {
    fn attach(&self, channel: Arc<dyn SubscriberChannel>) -> Result<SubscriberId, BrokerError> {
        if !self.running.load(Ordering::SeqCst) {
            return Err(BrokerError::NotRunning);
        }

        let _membership = self.membership.lock();
        let id = SubscriberId::new();
        let outcome = self
            .registry
            .attach(id, Arc::clone(&channel), self.clock.now(), |first| {
                if first {
                    Vec::new()
                } else {
                    self.connection.greeting()
                }
            });

        if let Some(failure) = outcome.greeting_failed {
            tracing::warn!(subscriber_id = %id, error = %failure, "Greeting failed, not attaching");
            channel.close();
            return Err(failure.into());
        }

        let subscribers = self.registry.len();
        metrics::set_subscribers(subscribers);
        tracing::info!(subscriber_id = %id, subscribers, "Subscriber attached");

        if outcome.first {
            self.liveness.start();
            self.connection.set_demand(true);
        }

        Ok(id)
    }

    fn detach(&self, id: SubscriberId, reason: DetachReason) -> bool {
        let _membership = self.membership.lock();
        let Some(detached) = self.registry.detach(id) else {
            return false;
        };

        detached.entry.channel().close();
        metrics::record_detach(reason);
        metrics::set_subscribers(detached.remaining);
        tracing::info!(
            subscriber_id = %id,
            reason = reason.as_str(),
            remaining = detached.remaining,
            "Subscriber detached"
        );

        if detached.remaining == 0 {
            self.enter_idle();
        }
        true
    }

    fn enter_idle(&self) {
        tracing::info!("Last subscriber left, releasing upstream");
        self.liveness.stop();
        // Release first: no delta from the old session can be offered after this.
        self.connection.set_demand(false);
        self.coalescer.cancel();
    }

    fn broadcast(&self, event: &BrokerEvent) {
        for (id, failure) in self.registry.broadcast(event) {
            tracing::warn!(
                subscriber_id = %id,
                event = event.kind(),
                error = %failure,
                "Delivery failed, detaching subscriber"
            );
            self.detach(id, DetachReason::SendFailure);
        }
    }
}

impl BatchSink for BrokerCore {
    fn deliver(&self, batch: BatchedUpdate) {
        self.batches_flushed.fetch_add(1, Ordering::Relaxed);
        self.broadcast(&BrokerEvent::BatchedUpdate(Arc::new(batch)));
    }
}

impl UpstreamObserver for BrokerCore {
    fn on_state(&self, state: ConnectionState) {
        match state {
            ConnectionState::Connected => {
                tracing::info!("Upstream connected");
                self.broadcast(&BrokerEvent::Connected);
            }
            ConnectionState::Disconnected => {
                tracing::warn!("Upstream disconnected");
                self.broadcast(&BrokerEvent::Disconnected);
            }
            ConnectionState::Connecting => {}
        }
    }

    fn on_snapshot(&self, snapshot: Arc<Snapshot>) {
        self.broadcast(&BrokerEvent::Snapshot(snapshot));
    }

    fn on_deltas(&self, deltas: Vec<DeltaMessage>) {
        for delta in deltas {
            self.coalescer.offer(delta);
        }
    }

    fn on_control(&self, payload: ControlPayload) {
        self.broadcast(&BrokerEvent::Control(payload));
    }
}

impl LivenessTarget for BrokerCore {
    fn probe_all(&self) {
        self.broadcast(&BrokerEvent::LivenessProbe);
    }

    fn stale_subscribers(&self, timeout: Duration) -> Vec<SubscriberId> {
        self.registry.stale(self.clock.now(), timeout)
    }

    fn evict(&self, id: SubscriberId) {
        self.detach(id, DetachReason::LivenessTimeout);
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;
    use crate::application::ports::{
        MockSubscriberChannel, SystemClock, TransportError, UpstreamStream,
    };

    struct Unreachable;

    #[async_trait]
    impl UpstreamConnector for Unreachable {
        async fn connect(&self) -> Result<Box<dyn UpstreamStream>, TransportError> {
            Err(TransportError::ConnectFailed("unreachable".to_string()))
        }
    }

    fn broker() -> Broker {
        Broker::new(
            BrokerOptions::default(),
            Arc::new(Unreachable),
            Arc::new(SystemClock),
        )
    }

    fn quiet_channel() -> Arc<dyn SubscriberChannel> {
        let mut channel = MockSubscriberChannel::new();
        channel.expect_send().returning(|_| Ok(()));
        channel.expect_close().returning(|| ());
        Arc::new(channel)
    }

    #[test]
    fn default_options() {
        let options = BrokerOptions::default();
        assert_eq!(options.coalesce_window, Duration::from_micros(16_667));
        assert_eq!(options.reconnect_delay, Duration::from_millis(2000));
        assert_eq!(options.liveness, LivenessConfig::default());
    }

    #[tokio::test]
    async fn attach_requires_start() {
        let broker = broker();

        assert_eq!(
            broker.attach(quiet_channel()).err(),
            Some(BrokerError::NotRunning)
        );

        broker.start();
        assert!(broker.attach(quiet_channel()).is_ok());
        broker.stop();

        assert_eq!(
            broker.attach(quiet_channel()).err(),
            Some(BrokerError::NotRunning)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn idle_stops_liveness_and_reconnect() {
        let broker = broker();
        broker.start();

        let id = broker.attach(quiet_channel()).unwrap();
        assert!(broker.liveness_running());
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }
        assert!(broker.reconnect_pending());

        assert!(broker.detach(id, DetachReason::Unsubscribed));
        assert!(!broker.liveness_running());
        assert!(!broker.reconnect_pending());
        assert!(!broker.detach(id, DetachReason::Unsubscribed));
    }

    #[tokio::test]
    async fn detach_closes_channel() {
        let broker = broker();
        broker.start();

        let mut channel = MockSubscriberChannel::new();
        channel.expect_send().returning(|_| Ok(()));
        channel.expect_close().times(1).returning(|| ());
        let id = broker.attach(Arc::new(channel)).unwrap();

        broker.handle_subscriber_message(id, SubscriberMessage::Unsubscribe);
        assert_eq!(broker.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn failed_greeting_rejects_late_joiner() {
        let broker = broker();
        broker.start();
        broker.attach(quiet_channel()).unwrap();

        let mut channel = MockSubscriberChannel::new();
        channel.expect_send().returning(|_| Err(SendFailure::Full));
        channel.expect_close().times(1).returning(|| ());

        assert_eq!(
            broker.attach(Arc::new(channel)).err(),
            Some(BrokerError::Greeting(SendFailure::Full))
        );
        assert_eq!(broker.subscriber_count(), 1);
    }

    #[tokio::test]
    async fn stats_reflect_state() {
        let broker = broker();
        broker.start();
        broker.attach(quiet_channel()).unwrap();

        let stats = broker.stats();
        assert!(stats.running);
        assert_eq!(stats.subscribers, 1);
        assert_eq!(stats.snapshot_records, None);
        assert_eq!(stats.batches_flushed, 0);
    }
}
