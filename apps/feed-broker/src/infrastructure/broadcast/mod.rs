//! Channel Subscriber Adapter
//!
//! Implements `SubscriberChannel` over a bounded tokio `mpsc` queue. The
//! broker side pushes with a non-blocking `try_send`; whatever owns the
//! receiver (a WebSocket writer task, an in-process `FeedClient`) drains it.
//!
//! A full queue is a delivery failure: a consumer that cannot keep up is
//! detached rather than allowed to stall the fan-out.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::application::ports::{SendFailure, SubscriberChannel};
use crate::domain::streaming::BrokerEvent;

/// Default per-subscriber queue depth.
pub const DEFAULT_SUBSCRIBER_BUFFER: usize = 1024;

/// Bounded-queue subscriber channel.
#[derive(Debug)]
pub struct ChannelSubscriber {
    sender: Mutex<Option<mpsc::Sender<BrokerEvent>>>,
}

impl ChannelSubscriber {
    /// Wrap an existing sender.
    #[must_use]
    pub fn new(sender: mpsc::Sender<BrokerEvent>) -> Self {
        Self {
            sender: Mutex::new(Some(sender)),
        }
    }

    /// Whether `close` has been called or the receiver is gone.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.sender
            .lock()
            .as_ref()
            .is_none_or(mpsc::Sender::is_closed)
    }
}

impl SubscriberChannel for ChannelSubscriber {
    fn send(&self, event: &BrokerEvent) -> Result<(), SendFailure> {
        let guard = self.sender.lock();
        let sender = guard.as_ref().ok_or(SendFailure::Closed)?;
        sender.try_send(event.clone()).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SendFailure::Full,
            mpsc::error::TrySendError::Closed(_) => SendFailure::Closed,
        })
    }

    fn close(&self) {
        // Dropping the last sender ends the receiver's stream.
        self.sender.lock().take();
    }
}

/// Create a subscriber channel with a queue of `capacity` events.
#[must_use]
pub fn channel_subscriber(
    capacity: usize,
) -> (Arc<ChannelSubscriber>, mpsc::Receiver<BrokerEvent>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (Arc::new(ChannelSubscriber::new(tx)), rx)
}

// =============================================================================
// Tests
// =============================================================================
