//! Liveness Monitor
//!
//! Periodically probes every subscriber and evicts the ones whose last
//! acknowledgment is older than the timeout.
//!
//! Probing and the staleness scan are independent passes on each tick: a
//! subscriber can be evicted on the tick it was just probed if its previous
//! probe went unanswered for a full timeout window. A silent subscriber is
//! therefore evicted no earlier than `timeout` and no later than
//! `timeout + interval` after its last ack.
//!
//! The default timeout (30 s) is three probe intervals. The slack is
//! deliberate: subscribers running in visibility-throttled or backgrounded
//! contexts answer late but are still alive.

use std::sync::Weak;
use std::time::Duration;

use parking_lot::Mutex;

use super::timer::ScheduledTask;
use crate::domain::subscription::SubscriberId;

/// Configuration for liveness monitoring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LivenessConfig {
    /// Interval between probe ticks.
    pub interval: Duration,
    /// Silence after which a subscriber is evicted.
    pub timeout: Duration,
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            timeout: Duration::from_secs(30),
        }
    }
}

/// What the monitor probes and evicts.
pub trait LivenessTarget: Send + Sync {
    /// Send a probe to every subscriber. Fire-and-forget.
    fn probe_all(&self);

    /// Subscribers silent for longer than `timeout`.
    fn stale_subscribers(&self, timeout: Duration) -> Vec<SubscriberId>;

    /// Evict one subscriber.
    fn evict(&self, id: SubscriberId);
}

/// Interval-driven liveness monitor.
pub struct LivenessMonitor {
    config: LivenessConfig,
    target: Weak<dyn LivenessTarget>,
    task: Mutex<Option<ScheduledTask>>,
}

impl LivenessMonitor {
    /// Create a stopped monitor.
    #[must_use]
    pub const fn new(config: LivenessConfig, target: Weak<dyn LivenessTarget>) -> Self {
        Self {
            config,
            target,
            task: Mutex::new(None),
        }
    }

    /// Start ticking. No-op if already running.
    pub fn start(&self) {
        let mut task = self.task.lock();
        if task.is_some() {
            return;
        }

        let target = self.target.clone();
        let timeout = self.config.timeout;
        *task = Some(ScheduledTask::every(self.config.interval, move || {
            if let Some(target) = target.upgrade() {
                tick(target.as_ref(), timeout);
            }
        }));

        tracing::debug!(
            interval_secs = self.config.interval.as_secs(),
            timeout_secs = timeout.as_secs(),
            "Liveness monitor started"
        );
    }

    /// Stop ticking. No-op if stopped.
    pub fn stop(&self) {
        if let Some(task) = self.task.lock().take() {
            task.cancel();
            tracing::debug!("Liveness monitor stopped");
        }
    }

    /// Whether the monitor is ticking.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.task.lock().is_some()
    }
}

impl std::fmt::Debug for LivenessMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LivenessMonitor")
            .field("config", &self.config)
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

fn tick(target: &dyn LivenessTarget, timeout: Duration) {
    target.probe_all();

    for id in target.stale_subscribers(timeout) {
        tracing::warn!(subscriber_id = %id, timeout_secs = timeout.as_secs(), "Liveness timeout");
        target.evict(id);
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[derive(Default)]
    struct CountingTarget {
        probes: AtomicUsize,
        stale: Mutex<Vec<SubscriberId>>,
        evicted: Mutex<Vec<SubscriberId>>,
    }

    impl LivenessTarget for CountingTarget {
        fn probe_all(&self) {
            self.probes.fetch_add(1, Ordering::SeqCst);
        }

        fn stale_subscribers(&self, _timeout: Duration) -> Vec<SubscriberId> {
            std::mem::take(&mut *self.stale.lock())
        }

        fn evict(&self, id: SubscriberId) {
            self.evicted.lock().push(id);
        }
    }

    fn monitor_for(target: &Arc<CountingTarget>) -> LivenessMonitor {
        let weak: Weak<dyn LivenessTarget> = Arc::downgrade(target) as Weak<dyn LivenessTarget>;
        LivenessMonitor::new(LivenessConfig::default(), weak)
    }

    #[test]
    fn default_config_values() {
        let config = LivenessConfig::default();
        assert_eq!(config.interval, Duration::from_secs(10));
        assert_eq!(config.timeout, Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn ticks_probe_then_evict() {
        let target = Arc::new(CountingTarget::default());
        let monitor = monitor_for(&target);
        let stale = SubscriberId::new();
        target.stale.lock().push(stale);

        monitor.start();
        tokio::time::sleep(Duration::from_secs(11)).await;

        assert_eq!(target.probes.load(Ordering::SeqCst), 1);
        assert_eq!(*target.evicted.lock(), vec![stale]);

        monitor.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn start_is_idempotent_and_stop_halts_ticks() {
        let target = Arc::new(CountingTarget::default());
        let monitor = monitor_for(&target);

        monitor.start();
        monitor.start();
        assert!(monitor.is_running());

        tokio::time::sleep(Duration::from_secs(21)).await;
        assert_eq!(target.probes.load(Ordering::SeqCst), 2);

        monitor.stop();
        assert!(!monitor.is_running());
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(target.probes.load(Ordering::SeqCst), 2);
    }
}
