//! Upstream Connection Manager
//!
//! Owns the single upstream stream shared by every subscriber.
//!
//! The transition decisions live in `ConnectionMachine`; this manager carries
//! out its effects: spawning a session task per connect attempt, arming and
//! cancelling the constant-delay reconnect timer, caching the last snapshot
//! and relaying subscriber commands.
//!
//! # Sessions
//!
//! Each `Open` effect starts a new session with a fresh epoch. Reports and
//! frames from a session whose epoch is no longer current are ignored, so a
//! released stream can never flip the state of a newer one or feed it data.
//! The epoch is compared in the same critical section that acts on it.
//!
//! # Callbacks
//!
//! `on_state`, `on_snapshot` and `on_control` are made with the manager's
//! lock released. `on_deltas` is made with the lock held, so once a session
//! is released none of its deltas can still be in flight; implementations
//! must not call back into the manager.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::timer::ScheduledTask;
use crate::application::ports::UpstreamConnector;
use crate::domain::connection::{
    ConnectionEffect, ConnectionInput, ConnectionMachine, ConnectionState,
};
use crate::domain::streaming::{
    BrokerEvent, ControlPayload, DeltaMessage, Snapshot, UpstreamMessage,
};
use crate::infrastructure::metrics::{self, CommandOutcome};
use crate::infrastructure::upstream::JsonCodec;

/// Default constant reconnect backoff.
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_millis(2000);

/// Outbound command queue depth per session.
const COMMAND_BUFFER: usize = 64;

/// Receiver of upstream connection events.
pub trait UpstreamObserver: Send + Sync {
    /// The connection was established or lost.
    fn on_state(&self, state: ConnectionState);

    /// A snapshot arrived. Already cached.
    fn on_snapshot(&self, snapshot: Arc<Snapshot>);

    /// A delta batch arrived, in arrival order. Called under the manager's
    /// lock.
    fn on_deltas(&self, deltas: Vec<DeltaMessage>);

    /// A control message arrived.
    fn on_control(&self, payload: ControlPayload);
}

struct Session {
    epoch: u64,
    cancel: CancellationToken,
    commands: mpsc::Sender<String>,
}

#[derive(Default)]
struct ConnectionInner {
    machine: ConnectionMachine,
    session: Option<Session>,
    reconnect: Option<ScheduledTask>,
    snapshot: Option<Arc<Snapshot>>,
    epoch: u64,
}

impl ConnectionInner {
    fn is_current(&self, epoch: u64) -> bool {
        self.session.as_ref().map(|s| s.epoch) == Some(epoch)
    }
}

/// Manager for the shared upstream connection.
pub struct UpstreamConnectionManager {
    connector: Arc<dyn UpstreamConnector>,
    reconnect_delay: Duration,
    observer: Weak<dyn UpstreamObserver>,
    codec: JsonCodec,
    connect_attempts: AtomicU64,
    inner: Mutex<ConnectionInner>,
}

impl UpstreamConnectionManager {
    /// Create an idle manager.
    #[must_use]
    pub fn new(
        connector: Arc<dyn UpstreamConnector>,
        reconnect_delay: Duration,
        observer: Weak<dyn UpstreamObserver>,
    ) -> Arc<Self> {
        Arc::new(Self {
            connector,
            reconnect_delay,
            observer,
            codec: JsonCodec::new(),
            connect_attempts: AtomicU64::new(0),
            inner: Mutex::new(ConnectionInner::default()),
        })
    }

    // =========================================================================
    // Demand
    // =========================================================================

    /// Report whether any subscriber is attached.
    ///
    /// `true` connects if disconnected and no reconnect is pending. `false` is
    /// the idle shutdown: the reconnect timer is cancelled, the stream is
    /// released and the cached snapshot is dropped.
    pub fn set_demand(self: &Arc<Self>, demand: bool) {
        self.drive(ConnectionInput::Demand(demand), |inner| {
            if !demand {
                inner.snapshot = None;
            }
            true
        });
    }

    /// Relay a subscriber command upstream.
    ///
    /// Dropped (returns `false`) unless the stream is established. Commands
    /// are advisory and never queued across reconnects.
    pub fn forward_command(&self, payload: &serde_json::Value) -> bool {
        let frame = match serde_json::to_string(payload) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to encode subscriber command");
                return false;
            }
        };

        let inner = self.inner.lock();
        let sent = inner.machine.state().is_connected()
            && inner
                .session
                .as_ref()
                .is_some_and(|session| session.commands.try_send(frame).is_ok());
        drop(inner);

        if sent {
            metrics::record_command(CommandOutcome::Forwarded);
        } else {
            tracing::debug!("Upstream not connected, dropping command");
            metrics::record_command(CommandOutcome::Dropped);
        }
        sent
    }

    /// Events a late joiner needs to render current state: the cached
    /// snapshot (if any) followed by the current connection status.
    #[must_use]
    pub fn greeting(&self) -> Vec<BrokerEvent> {
        let inner = self.inner.lock();
        let mut events = Vec::with_capacity(2);
        if let Some(snapshot) = &inner.snapshot {
            events.push(BrokerEvent::Snapshot(Arc::clone(snapshot)));
        }
        events.push(if inner.machine.state().is_connected() {
            BrokerEvent::Connected
        } else {
            BrokerEvent::Disconnected
        });
        events
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    /// Current connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.inner.lock().machine.state()
    }

    /// Whether a reconnect timer is armed.
    #[must_use]
    pub fn reconnect_pending(&self) -> bool {
        self.inner.lock().reconnect.is_some()
    }

    /// Last snapshot received on the current demand cycle.
    #[must_use]
    pub fn cached_snapshot(&self) -> Option<Arc<Snapshot>> {
        self.inner.lock().snapshot.clone()
    }

    /// Total connect attempts since creation.
    #[must_use]
    pub fn connect_attempts(&self) -> u64 {
        self.connect_attempts.load(Ordering::Relaxed)
    }

    // =========================================================================
    // Transitions
    // =========================================================================

    /// Apply `input`, run its effects under the lock, then announce.
    ///
    /// `prepare` runs first in the same critical section; returning `false`
    /// abandons the transition.
    fn drive<F>(self: &Arc<Self>, input: ConnectionInput, prepare: F)
    where
        F: FnOnce(&mut ConnectionInner) -> bool,
    {
        let announcements = {
            let mut inner = self.inner.lock();
            if !prepare(&mut *inner) {
                return;
            }
            let effects = inner.machine.apply(input);
            let announcements = self.execute(&mut *inner, &effects);
            metrics::set_upstream_connected(inner.machine.state().is_connected());
            announcements
        };

        if announcements.is_empty() {
            return;
        }
        if let Some(observer) = self.observer.upgrade() {
            for state in announcements {
                observer.on_state(state);
            }
        }
    }

    /// Report from a session task. Ignored if `epoch` is stale.
    fn report(self: &Arc<Self>, epoch: u64, input: ConnectionInput) {
        self.drive(input, |inner| {
            if !inner.is_current(epoch) {
                tracing::debug!(epoch, ?input, "Ignoring report from released session");
                return false;
            }
            if matches!(input, ConnectionInput::Failed | ConnectionInput::Dropped) {
                inner.session = None;
            }
            true
        });
    }

    fn retry_due(self: &Arc<Self>) {
        self.drive(ConnectionInput::RetryDue, |inner| {
            inner.reconnect = None;
            true
        });
    }

    fn execute(
        self: &Arc<Self>,
        inner: &mut ConnectionInner,
        effects: &[ConnectionEffect],
    ) -> Vec<ConnectionState> {
        let mut announcements = Vec::new();

        for effect in effects {
            match effect {
                ConnectionEffect::Open => self.open(inner),
                ConnectionEffect::Close => {
                    if let Some(session) = inner.session.take() {
                        tracing::info!(epoch = session.epoch, "Releasing upstream stream");
                        session.cancel.cancel();
                    }
                }
                ConnectionEffect::ScheduleReconnect => {
                    let weak = Arc::downgrade(self);
                    inner.reconnect = Some(ScheduledTask::after(self.reconnect_delay, move || {
                        if let Some(manager) = weak.upgrade() {
                            manager.retry_due();
                        }
                    }));
                    metrics::record_reconnect_scheduled();
                    tracing::warn!(
                        delay_ms = self.reconnect_delay.as_millis(),
                        "Upstream reconnect scheduled"
                    );
                }
                ConnectionEffect::CancelReconnect => {
                    if let Some(task) = inner.reconnect.take() {
                        task.cancel();
                        tracing::debug!("Upstream reconnect cancelled");
                    }
                }
                ConnectionEffect::AnnounceConnected => {
                    announcements.push(ConnectionState::Connected);
                }
                ConnectionEffect::AnnounceDisconnected => {
                    announcements.push(ConnectionState::Disconnected);
                }
            }
        }

        announcements
    }

    fn open(self: &Arc<Self>, inner: &mut ConnectionInner) {
        inner.epoch += 1;
        let epoch = inner.epoch;
        let cancel = CancellationToken::new();
        let (commands, rx) = mpsc::channel(COMMAND_BUFFER);

        inner.session = Some(Session {
            epoch,
            cancel: cancel.clone(),
            commands,
        });

        let attempt = self.connect_attempts.fetch_add(1, Ordering::Relaxed) + 1;
        metrics::record_connect_attempt();
        tracing::info!(epoch, attempt, "Connecting to upstream");

        tokio::spawn(run_session(
            Arc::downgrade(self),
            Arc::clone(&self.connector),
            epoch,
            cancel,
            rx,
        ));
    }

    // =========================================================================
    // Inbound
    // =========================================================================

    fn handle_frame(&self, epoch: u64, text: &str) {
        let message = match self.codec.decode(text) {
            Ok(message) => message,
            Err(e) => {
                metrics::record_malformed();
                tracing::warn!(error = %e, "Dropping malformed upstream message");
                return;
            }
        };

        let mut inner = self.inner.lock();
        if !inner.is_current(epoch) {
            tracing::debug!(epoch, kind = message.kind(), "Ignoring frame from released session");
            return;
        }
        metrics::record_upstream_message(message.kind());
        let Some(observer) = self.observer.upgrade() else {
            return;
        };

        match message {
            UpstreamMessage::Snapshot(snapshot) => {
                let snapshot = Arc::new(snapshot);
                inner.snapshot = Some(Arc::clone(&snapshot));
                drop(inner);
                tracing::debug!(records = snapshot.len(), "Cached upstream snapshot");
                observer.on_snapshot(snapshot);
            }
            UpstreamMessage::DeltaBatch(batch) => {
                tracing::trace!(items = batch.items.len(), "Upstream delta batch");
                observer.on_deltas(batch.items);
                drop(inner);
            }
            UpstreamMessage::Control(payload) => {
                drop(inner);
                observer.on_control(payload);
            }
        }
    }
}

impl std::fmt::Debug for UpstreamConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamConnectionManager")
            .field("state", &self.state())
            .field("reconnect_delay", &self.reconnect_delay)
            .field("connect_attempts", &self.connect_attempts())
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Session Task
// =============================================================================

async fn run_session(
    manager: Weak<UpstreamConnectionManager>,
    connector: Arc<dyn UpstreamConnector>,
    epoch: u64,
    cancel: CancellationToken,
    mut commands: mpsc::Receiver<String>,
) {
    let connected = tokio::select! {
        biased;
        () = cancel.cancelled() => return,
        result = connector.connect() => result,
    };

    let mut stream = match connected {
        Ok(stream) => stream,
        Err(e) => {
            tracing::warn!(epoch, error = %e, "Upstream connect failed");
            if let Some(manager) = manager.upgrade() {
                manager.report(epoch, ConnectionInput::Failed);
            }
            return;
        }
    };

    let Some(current) = manager.upgrade() else {
        stream.close().await;
        return;
    };
    current.report(epoch, ConnectionInput::Opened);
    drop(current);

    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => {
                stream.close().await;
                return;
            }
            Some(frame) = commands.recv() => {
                if let Err(e) = stream.send(frame).await {
                    tracing::warn!(epoch, error = %e, "Upstream send failed");
                    break;
                }
            }
            received = stream.recv() => match received {
                Some(Ok(text)) => {
                    let Some(manager) = manager.upgrade() else { break };
                    manager.handle_frame(epoch, &text);
                }
                Some(Err(e)) => {
                    tracing::warn!(epoch, error = %e, "Upstream stream error");
                    break;
                }
                None => {
                    tracing::warn!(epoch, "Upstream stream ended");
                    break;
                }
            },
        }
    }

    stream.close().await;
    if let Some(manager) = manager.upgrade() {
        manager.report(epoch, ConnectionInput::Dropped);
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use async_trait::async_trait;
    use serde_json::json;

    use super::*;
    use crate::application::ports::{TransportError, UpstreamStream};

    /// Connector whose streams are fed by the test through channels.
    #[derive(Default)]
    struct ScriptedConnector {
        attempts: AtomicUsize,
        fail: std::sync::atomic::AtomicBool,
        feeds: Mutex<Vec<mpsc::UnboundedSender<String>>>,
        sent: Arc<Mutex<Vec<String>>>,
    }

    struct ScriptedStream {
        frames: mpsc::UnboundedReceiver<String>,
        sent: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl UpstreamConnector for ScriptedConnector {
        async fn connect(&self) -> Result<Box<dyn UpstreamStream>, TransportError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            if self.fail.load(Ordering::SeqCst) {
                return Err(TransportError::ConnectFailed("refused".to_string()));
            }
            let (tx, rx) = mpsc::unbounded_channel();
            self.feeds.lock().push(tx);
            Ok(Box::new(ScriptedStream {
                frames: rx,
                sent: Arc::clone(&self.sent),
            }))
        }
    }

    #[async_trait]
    impl UpstreamStream for ScriptedStream {
        async fn send(&mut self, frame: String) -> Result<(), TransportError> {
            self.sent.lock().push(frame);
            Ok(())
        }

        async fn recv(&mut self) -> Option<Result<String, TransportError>> {
            self.frames.recv().await.map(Ok)
        }

        async fn close(&mut self) {
            self.frames.close();
        }
    }

    #[derive(Default)]
    struct RecordingObserver {
        states: Mutex<Vec<ConnectionState>>,
        snapshots: AtomicUsize,
        deltas: Mutex<Vec<DeltaMessage>>,
    }

    impl UpstreamObserver for RecordingObserver {
        fn on_state(&self, state: ConnectionState) {
            self.states.lock().push(state);
        }

        fn on_snapshot(&self, _snapshot: Arc<Snapshot>) {
            self.snapshots.fetch_add(1, Ordering::SeqCst);
        }

        fn on_deltas(&self, deltas: Vec<DeltaMessage>) {
            self.deltas.lock().extend(deltas);
        }

        fn on_control(&self, _payload: ControlPayload) {}
    }

    fn setup() -> (
        Arc<UpstreamConnectionManager>,
        Arc<ScriptedConnector>,
        Arc<RecordingObserver>,
    ) {
        let connector = Arc::new(ScriptedConnector::default());
        let observer = Arc::new(RecordingObserver::default());
        let weak: Weak<dyn UpstreamObserver> = Arc::downgrade(&observer) as Weak<dyn UpstreamObserver>;
        let manager = UpstreamConnectionManager::new(
            Arc::clone(&connector) as Arc<dyn UpstreamConnector>,
            DEFAULT_RECONNECT_DELAY,
            weak,
        );
        (manager, connector, observer)
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    fn push(connector: &ScriptedConnector, frame: serde_json::Value) {
        let feeds = connector.feeds.lock();
        let feed = feeds.last().unwrap();
        feed.send(frame.to_string()).unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn demand_connects_and_announces() {
        let (manager, connector, observer) = setup();

        manager.set_demand(true);
        manager.set_demand(true);
        settle().await;

        assert_eq!(connector.attempts.load(Ordering::SeqCst), 1);
        assert_eq!(manager.state(), ConnectionState::Connected);
        assert_eq!(*observer.states.lock(), vec![ConnectionState::Connected]);
    }

    #[tokio::test(start_paused = true)]
    async fn snapshot_is_cached_and_greeted() {
        let (manager, connector, observer) = setup();
        manager.set_demand(true);
        settle().await;

        push(
            &connector,
            json!({"type": "snapshot", "records": [{"symbol": "AAPL", "price": 100.0}]}),
        );
        settle().await;

        assert_eq!(observer.snapshots.load(Ordering::SeqCst), 1);
        let greeting = manager.greeting();
        assert_eq!(greeting.len(), 2);
        assert!(matches!(&greeting[0], BrokerEvent::Snapshot(s) if s.len() == 1));
        assert_eq!(greeting[1], BrokerEvent::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn malformed_frames_are_dropped() {
        let (manager, connector, observer) = setup();
        manager.set_demand(true);
        settle().await;

        connector.feeds.lock()[0].send("{not json".to_string()).unwrap();
        push(
            &connector,
            json!({"type": "delta-batch", "items": [{"symbol": "AAPL", "price": 1.0}], "timestamp": 1}),
        );
        settle().await;

        assert_eq!(observer.deltas.lock().len(), 1);
        assert_eq!(manager.state(), ConnectionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn failure_schedules_constant_backoff() {
        let (manager, connector, observer) = setup();
        connector.fail.store(true, Ordering::SeqCst);

        manager.set_demand(true);
        settle().await;
        assert!(manager.reconnect_pending());
        assert_eq!(*observer.states.lock(), vec![ConnectionState::Disconnected]);

        connector.fail.store(false, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(1999)).await;
        assert_eq!(connector.attempts.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_millis(2)).await;
        settle().await;
        assert_eq!(connector.attempts.load(Ordering::SeqCst), 2);
        assert_eq!(manager.state(), ConnectionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_cancels_reconnect_and_clears_snapshot() {
        let (manager, connector, _observer) = setup();
        manager.set_demand(true);
        settle().await;
        push(&connector, json!({"type": "snapshot", "records": []}));
        settle().await;
        assert!(manager.cached_snapshot().is_some());

        manager.set_demand(false);
        settle().await;

        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert!(manager.cached_snapshot().is_none());
        assert!(connector.feeds.lock()[0].is_closed());

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(connector.attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn commands_only_forwarded_when_connected() {
        let (manager, connector, _observer) = setup();
        let payload = json!({"frequency": 20});

        assert!(!manager.forward_command(&payload));

        manager.set_demand(true);
        settle().await;
        assert!(manager.forward_command(&payload));
        settle().await;

        assert_eq!(*connector.sent.lock(), vec![payload.to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn drop_reconnects_while_demand_remains() {
        let (manager, connector, observer) = setup();
        manager.set_demand(true);
        settle().await;

        connector.feeds.lock().clear();
        settle().await;
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert!(manager.reconnect_pending());

        tokio::time::sleep(DEFAULT_RECONNECT_DELAY).await;
        settle().await;

        assert_eq!(connector.attempts.load(Ordering::SeqCst), 2);
        assert_eq!(
            *observer.states.lock(),
            vec![
                ConnectionState::Connected,
                ConnectionState::Disconnected,
                ConnectionState::Connected
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn frames_queued_on_a_released_session_are_ignored() {
        let (manager, connector, observer) = setup();
        manager.set_demand(true);
        settle().await;

        push(
            &connector,
            json!({"type": "delta-batch", "items": [{"symbol": "AAPL", "price": 1.0}]}),
        );
        push(&connector, json!({"type": "snapshot", "records": []}));
        manager.set_demand(false);
        settle().await;

        assert!(observer.deltas.lock().is_empty());
        assert_eq!(observer.snapshots.load(Ordering::SeqCst), 0);
        assert!(manager.cached_snapshot().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn stale_report_leaves_the_newer_session_alone() {
        let (manager, connector, observer) = setup();

        // Release epoch 1 before it runs and open epoch 2.
        manager.set_demand(true);
        manager.set_demand(false);
        manager.set_demand(true);

        manager.report(1, ConnectionInput::Failed);
        assert_eq!(manager.state(), ConnectionState::Connecting);
        assert!(!manager.reconnect_pending());

        settle().await;
        assert_eq!(manager.state(), ConnectionState::Connected);

        manager.report(1, ConnectionInput::Dropped);
        settle().await;

        assert_eq!(manager.state(), ConnectionState::Connected);
        assert!(!manager.reconnect_pending());
        assert_eq!(connector.attempts.load(Ordering::SeqCst), 1);
        assert_eq!(manager.connect_attempts(), 2);
        assert!(!connector.feeds.lock()[0].is_closed());
        assert_eq!(*observer.states.lock(), vec![ConnectionState::Connected]);
    }
}
