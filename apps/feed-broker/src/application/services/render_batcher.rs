//! Client-Side Render Batcher
//!
//! Second coalescing tier, on the subscriber side. Rows from batched updates
//! are merged per symbol (last write wins) and applied to the display once
//! per refresh tick instead of once per message.
//!
//! Unlike the broker's coalescer the flush is driven by the host's refresh
//! signal, and rescheduling is conditional: if rows arrived while a flush was
//! being applied, another flush is requested immediately instead of waiting
//! for new input, so the pending set always drains under sustained backlog.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::{Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::application::ports::{DisplaySink, RefreshSignal};
use crate::domain::coalescing::PendingUpdates;
use crate::domain::streaming::{DeltaMessage, Symbol};

/// Default refresh period: one 60 Hz frame.
pub const DEFAULT_REFRESH_PERIOD: Duration = Duration::from_micros(16_667);

#[derive(Default)]
struct BatcherState {
    pending: PendingUpdates<Symbol, DeltaMessage>,
    frame_requested: bool,
}

/// Refresh-aligned last-write-wins row batcher.
pub struct RenderBatcher {
    display: Arc<dyn DisplaySink>,
    state: Mutex<BatcherState>,
    wake: Notify,
}

impl RenderBatcher {
    /// Create a batcher rendering into `display`.
    #[must_use]
    pub fn new(display: Arc<dyn DisplaySink>) -> Arc<Self> {
        Arc::new(Self {
            display,
            state: Mutex::new(BatcherState::default()),
            wake: Notify::new(),
        })
    }

    /// Queue rows for the next frame, replacing any pending row per symbol.
    pub fn offer(&self, rows: Vec<DeltaMessage>) {
        if rows.is_empty() {
            return;
        }

        let request = {
            let mut state = self.state.lock();
            for row in rows {
                state.pending.offer(row.symbol.clone(), row);
            }
            !std::mem::replace(&mut state.frame_requested, true)
        };

        if request {
            self.wake.notify_one();
        }
    }

    /// Discard pending rows. Used when a snapshot replaces all state.
    pub fn reset(&self) {
        self.state.lock().pending.clear();
    }

    /// Number of rows waiting for the next frame.
    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.state.lock().pending.len()
    }

    /// Apply pending rows to the display.
    ///
    /// Returns `true` if more rows arrived while applying, meaning another
    /// frame is needed right away.
    pub fn flush(&self) -> bool {
        let rows = {
            let mut state = self.state.lock();
            state.pending.drain()
        };

        if !rows.is_empty() {
            self.display.apply_rows(rows);
        }

        let mut state = self.state.lock();
        if state.pending.is_empty() {
            state.frame_requested = false;
            false
        } else {
            true
        }
    }

    /// Drive flushes from `refresh` until `cancel` fires.
    ///
    /// Sleeps until rows are offered, then flushes on the next refresh tick,
    /// repeating while the flush reports more rows.
    pub async fn run<R>(self: Arc<Self>, mut refresh: R, cancel: CancellationToken)
    where
        R: RefreshSignal,
    {
        loop {
            tokio::select! {
                () = cancel.cancelled() => return,
                () = self.wake.notified() => {}
            }

            loop {
                tokio::select! {
                    () = cancel.cancelled() => return,
                    () = refresh.next_frame() => {}
                }
                if !self.flush() {
                    break;
                }
                tracing::trace!("Rows arrived during flush, rescheduling");
            }
        }
    }
}

impl std::fmt::Debug for RenderBatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RenderBatcher")
            .field("pending", &self.pending_len())
            .finish_non_exhaustive()
    }
}

/// Refresh signal from a fixed-period timer.
#[derive(Debug)]
pub struct IntervalRefresh {
    interval: Interval,
}

impl IntervalRefresh {
    /// Tick every `period`, first after one full period.
    #[must_use]
    pub fn new(period: Duration) -> Self {
        let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Self { interval }
    }
}

impl Default for IntervalRefresh {
    fn default() -> Self {
        Self::new(DEFAULT_REFRESH_PERIOD)
    }
}

#[async_trait]
impl RefreshSignal for IntervalRefresh {
    async fn next_frame(&mut self) {
        self.interval.tick().await;
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::streaming::Snapshot;

    #[derive(Default)]
    struct FrameLog {
        frames: Mutex<Vec<Vec<DeltaMessage>>>,
    }

    impl DisplaySink for FrameLog {
        fn apply_snapshot(&self, _snapshot: &Snapshot) {}

        fn apply_rows(&self, rows: Vec<DeltaMessage>) {
            self.frames.lock().push(rows);
        }
    }

    fn row(symbol: &str, price: f64) -> DeltaMessage {
        DeltaMessage::new(symbol).with_field("price", price)
    }

    #[test]
    fn flush_merges_rows_per_symbol() {
        let log = Arc::new(FrameLog::default());
        let batcher = RenderBatcher::new(Arc::clone(&log) as Arc<dyn DisplaySink>);

        batcher.offer(vec![row("AAPL", 1.0), row("MSFT", 2.0)]);
        batcher.offer(vec![row("AAPL", 3.0)]);
        assert!(!batcher.flush());

        let frames = log.frames.lock();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].len(), 2);
        assert_eq!(frames[0][0].field("price"), Some(3.0));
    }

    #[test]
    fn empty_flush_does_not_touch_display() {
        let log = Arc::new(FrameLog::default());
        let batcher = RenderBatcher::new(Arc::clone(&log) as Arc<dyn DisplaySink>);

        assert!(!batcher.flush());
        assert!(log.frames.lock().is_empty());
    }

    #[test]
    fn reset_discards_pending() {
        let log = Arc::new(FrameLog::default());
        let batcher = RenderBatcher::new(Arc::clone(&log) as Arc<dyn DisplaySink>);

        batcher.offer(vec![row("AAPL", 1.0)]);
        batcher.reset();

        assert_eq!(batcher.pending_len(), 0);
        batcher.flush();
        assert!(log.frames.lock().is_empty());
    }

    /// Display that offers more rows back into the batcher while applying.
    struct Reentrant {
        batcher: Mutex<Option<Arc<RenderBatcher>>>,
        frames: Mutex<usize>,
    }

    impl DisplaySink for Reentrant {
        fn apply_snapshot(&self, _snapshot: &Snapshot) {}

        fn apply_rows(&self, _rows: Vec<DeltaMessage>) {
            let frame = {
                let mut frames = self.frames.lock();
                *frames += 1;
                *frames
            };
            if frame != 1 {
                return;
            }
            if let Some(batcher) = self.batcher.lock().as_ref() {
                batcher.offer(vec![row("MSFT", 9.0)]);
            }
        }
    }

    #[test]
    fn rows_arriving_during_flush_request_another_frame() {
        let display = Arc::new(Reentrant {
            batcher: Mutex::new(None),
            frames: Mutex::new(0),
        });
        let batcher = RenderBatcher::new(Arc::clone(&display) as Arc<dyn DisplaySink>);
        *display.batcher.lock() = Some(Arc::clone(&batcher));

        batcher.offer(vec![row("AAPL", 1.0)]);
        assert!(batcher.flush());
        assert!(!batcher.flush());
        assert_eq!(*display.frames.lock(), 2);

        display.batcher.lock().take();
    }

    #[tokio::test(start_paused = true)]
    async fn run_flushes_on_refresh_ticks() {
        let log = Arc::new(FrameLog::default());
        let batcher = RenderBatcher::new(Arc::clone(&log) as Arc<dyn DisplaySink>);
        let cancel = CancellationToken::new();

        let task = tokio::spawn(Arc::clone(&batcher).run(
            IntervalRefresh::new(Duration::from_millis(16)),
            cancel.clone(),
        ));
        tokio::task::yield_now().await;

        batcher.offer(vec![row("AAPL", 1.0)]);
        batcher.offer(vec![row("AAPL", 2.0)]);
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(log.frames.lock().len(), 1);
        assert_eq!(log.frames.lock()[0][0].field("price"), Some(2.0));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(log.frames.lock().len(), 1);

        cancel.cancel();
        task.await.unwrap();
    }
}
