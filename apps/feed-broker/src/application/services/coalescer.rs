//! Delta Coalescer
//!
//! Merges same-symbol deltas arriving within a fixed window `W` into one
//! record per symbol and emits at most one batched update per window.
//!
//! # Scheduling
//!
//! - The first `offer` into an empty window arms a flush timer for `W`.
//! - The flush drains the pending set and clears the timer under the same
//!   lock, so an `offer` racing with a flush lands either in the batch being
//!   drained or in the next window, never in between.
//! - Delivery happens after the lock is released; offers made during
//!   delivery open the next window.
//! - An empty flush is a no-op and emits nothing.

use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;

use super::timer::ScheduledTask;
use crate::application::ports::Clock;
use crate::domain::coalescing::PendingUpdates;
use crate::domain::streaming::{BatchedUpdate, DeltaMessage, Symbol};
use crate::infrastructure::metrics;

/// Default coalescing window: one 60 Hz frame.
pub const DEFAULT_COALESCE_WINDOW: Duration = Duration::from_micros(16_667);

/// Receiver of flushed batches.
pub trait BatchSink: Send + Sync {
    /// Deliver one window's batch.
    fn deliver(&self, batch: BatchedUpdate);
}

#[derive(Default)]
struct CoalescerState {
    pending: PendingUpdates<Symbol, DeltaMessage>,
    scheduled: Option<ScheduledTask>,
}

/// Timer-driven, last-write-wins delta coalescer.
pub struct Coalescer {
    window: Duration,
    clock: Arc<dyn Clock>,
    sink: Weak<dyn BatchSink>,
    state: Mutex<CoalescerState>,
}

impl Coalescer {
    /// Create a coalescer that flushes into `sink`.
    #[must_use]
    pub fn new(window: Duration, clock: Arc<dyn Clock>, sink: Weak<dyn BatchSink>) -> Arc<Self> {
        Arc::new(Self {
            window,
            clock,
            sink,
            state: Mutex::new(CoalescerState::default()),
        })
    }

    /// Record or replace the pending delta for its symbol.
    ///
    /// Arms the flush timer if none is armed.
    pub fn offer(self: &Arc<Self>, delta: DeltaMessage) {
        let mut state = self.state.lock();
        state.pending.offer(delta.symbol.clone(), delta);

        if state.scheduled.is_none() {
            let weak = Arc::downgrade(self);
            state.scheduled = Some(ScheduledTask::after(self.window, move || {
                if let Some(coalescer) = weak.upgrade() {
                    coalescer.flush();
                }
            }));
        }
    }

    /// Number of symbols pending in the open window.
    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.state.lock().pending.len()
    }

    /// Whether a flush is armed.
    #[must_use]
    pub fn is_scheduled(&self) -> bool {
        self.state.lock().scheduled.is_some()
    }

    /// Cancel the armed flush and discard pending deltas.
    ///
    /// Used on idle shutdown, when there is nobody left to deliver to.
    pub fn cancel(&self) {
        let mut state = self.state.lock();
        if let Some(task) = state.scheduled.take() {
            task.cancel();
        }
        let discarded = state.pending.len();
        state.pending.clear();
        drop(state);

        if discarded > 0 {
            tracing::debug!(discarded, "Discarded pending deltas on idle");
        }
    }

    /// Forced shutdown: run any armed flush synchronously now.
    pub fn shutdown(&self) {
        if let Some(task) = self.state.lock().scheduled.as_ref() {
            task.cancel();
        }
        self.flush();
    }

    /// Drain and deliver the open window. Invoked by the armed timer.
    fn flush(&self) {
        let items = {
            let mut state = self.state.lock();
            state.scheduled = None;
            state.pending.drain()
        };

        if items.is_empty() {
            return;
        }

        let Some(sink) = self.sink.upgrade() else {
            tracing::debug!(dropped = items.len(), "Batch sink gone, dropping flush");
            return;
        };

        metrics::record_batch_flushed(items.len());
        sink.deliver(BatchedUpdate {
            items,
            timestamp: self.clock.wall_clock(),
        });
    }
}

impl std::fmt::Debug for Coalescer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coalescer")
            .field("window", &self.window)
            .field("pending", &self.pending_len())
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Tests
// =============================================================================
