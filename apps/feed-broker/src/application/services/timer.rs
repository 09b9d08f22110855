//! Scheduled Tasks
//!
//! Cancellable timer handles. Every timer in the broker (coalescer flush,
//! reconnect backoff, liveness interval) is one of these, owned by the
//! component that armed it.
//!
//! Dropping a handle does not cancel the task; call `cancel`. This lets a
//! task clear its own handle from inside its callback.

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Handle to a spawned timer.
#[derive(Debug)]
pub struct ScheduledTask {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl ScheduledTask {
    /// Run `callback` once after `delay` unless cancelled first.
    ///
    /// Must be called from within a tokio runtime.
    pub fn after<F>(delay: Duration, callback: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        let cancel = CancellationToken::new();
        let token = cancel.clone();

        let handle = tokio::spawn(async move {
            tokio::select! {
                biased;
                () = token.cancelled() => {}
                () = tokio::time::sleep(delay) => {
                    callback();
                }
            }
        });

        Self { cancel, handle }
    }

    /// Run `callback` every `period`, first after one full period.
    ///
    /// Missed ticks are skipped rather than bursted.
    pub fn every<F>(period: Duration, mut callback: F) -> Self
    where
        F: FnMut() + Send + 'static,
    {
        let cancel = CancellationToken::new();
        let token = cancel.clone();

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    biased;
                    () = token.cancelled() => break,
                    _ = interval.tick() => callback(),
                }
            }
        });

        Self { cancel, handle }
    }

    /// Cancel the timer. A callback already running is not interrupted.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Whether the timer was cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Whether the task has exited.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn after_fires_once() {
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);

        let task = ScheduledTask::after(Duration::from_millis(100), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(task.is_finished());
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_after_never_fires() {
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);

        let task = ScheduledTask::after(Duration::from_millis(100), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        task.cancel();

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert!(task.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_wins_over_an_elapsed_deadline() {
        let fired = Arc::new(AtomicUsize::new(0));

        // Both branches are ready on the first poll.
        let tasks: Vec<_> = (0..50)
            .map(|_| {
                let counter = Arc::clone(&fired);
                let task = ScheduledTask::after(Duration::ZERO, move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                });
                task.cancel();
                task
            })
            .collect();

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert!(tasks.iter().all(ScheduledTask::is_finished));
    }

    #[tokio::test(start_paused = true)]
    async fn every_waits_one_period_then_repeats() {
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);

        let task = ScheduledTask::every(Duration::from_secs(10), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 2);

        task.cancel();
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 2);
    }
}
