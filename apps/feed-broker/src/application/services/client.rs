//! Feed Client
//!
//! Drives one subscriber's side of the broker channel:
//!
//! - `liveness-probe` is answered with `liveness-ack` immediately
//! - `snapshot` replaces all displayed state and discards pending rows
//! - `batched-update` items go to the render batcher
//! - `connected` / `disconnected` are reported to the display
//!
//! `control` events carry nothing for the display and are ignored.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::render_batcher::RenderBatcher;
use crate::application::ports::DisplaySink;
use crate::domain::streaming::{BrokerEvent, SubscriberMessage};

/// Subscriber-side event loop.
pub struct FeedClient {
    display: Arc<dyn DisplaySink>,
    batcher: Arc<RenderBatcher>,
    outbound: mpsc::Sender<SubscriberMessage>,
}

impl FeedClient {
    /// Create a client rendering into `display` and replying on `outbound`.
    #[must_use]
    pub fn new(
        display: Arc<dyn DisplaySink>,
        batcher: Arc<RenderBatcher>,
        outbound: mpsc::Sender<SubscriberMessage>,
    ) -> Self {
        Self {
            display,
            batcher,
            outbound,
        }
    }

    /// The render batcher fed by this client.
    #[must_use]
    pub const fn batcher(&self) -> &Arc<RenderBatcher> {
        &self.batcher
    }

    /// Handle one broker event.
    pub fn handle(&self, event: BrokerEvent) {
        match event {
            BrokerEvent::LivenessProbe => {
                if let Err(e) = self.outbound.try_send(SubscriberMessage::LivenessAck) {
                    tracing::debug!(error = %e, "Failed to queue liveness ack");
                }
            }
            BrokerEvent::Snapshot(snapshot) => {
                self.batcher.reset();
                self.display.apply_snapshot(&snapshot);
            }
            BrokerEvent::BatchedUpdate(batch) => {
                self.batcher.offer(batch.items.clone());
            }
            BrokerEvent::Connected => self.display.connection_changed(true),
            BrokerEvent::Disconnected => self.display.connection_changed(false),
            BrokerEvent::Control(_) => {}
        }
    }

    /// Consume `events` until the channel closes or `cancel` fires.
    pub async fn run(self, mut events: mpsc::Receiver<BrokerEvent>, cancel: CancellationToken) {
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => self.handle(event),
                    None => {
                        tracing::debug!("Broker channel closed");
                        break;
                    }
                },
            }
        }
    }
}

impl std::fmt::Debug for FeedClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeedClient")
            .field("batcher", &self.batcher)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Tests
// =============================================================================
