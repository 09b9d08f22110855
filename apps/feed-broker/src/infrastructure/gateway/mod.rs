//! Subscriber Gateway
//!
//! WebSocket endpoint (`GET /ws`) through which remote subscribers attach.
//! Each socket is one subscriber:
//!
//! - broker events are queued on a bounded channel and written by a
//!   per-socket writer task
//! - inbound text frames are decoded as subscriber messages and routed to
//!   the broker; undecodable frames are logged and dropped
//! - a socket close detaches the subscriber, and a broker-side detach
//!   (unsubscribe, liveness timeout, send failure, shutdown) closes the socket

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::get;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::application::ports::SubscriberChannel;
use crate::application::services::Broker;
use crate::domain::streaming::BrokerEvent;
use crate::domain::subscription::{DetachReason, SubscriberId};
use crate::infrastructure::broadcast::channel_subscriber;
use crate::infrastructure::upstream::JsonCodec;

/// Shared state for the gateway.
#[derive(Debug, Clone)]
pub struct GatewayState {
    broker: Broker,
    subscriber_buffer: usize,
    codec: JsonCodec,
}

impl GatewayState {
    /// Create gateway state.
    #[must_use]
    pub const fn new(broker: Broker, subscriber_buffer: usize) -> Self {
        Self {
            broker,
            subscriber_buffer,
            codec: JsonCodec::new(),
        }
    }
}

/// Subscriber WebSocket server.
pub struct GatewayServer {
    port: u16,
    state: GatewayState,
    cancel: CancellationToken,
}

impl GatewayServer {
    /// Create a new gateway server.
    #[must_use]
    pub const fn new(port: u16, state: GatewayState, cancel: CancellationToken) -> Self {
        Self {
            port,
            state,
            cancel,
        }
    }

    /// Run the gateway until cancelled.
    ///
    /// # Errors
    ///
    /// Returns `GatewayError` if binding fails or the HTTP server encounters
    /// a fatal error while running.
    pub async fn run(self) -> Result<(), GatewayError> {
        let app = router(self.state);

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| GatewayError::BindFailed(self.port, e.to_string()))?;

        tracing::info!(port = self.port, "Subscriber gateway listening");

        axum::serve(listener, app)
            .with_graceful_shutdown(self.cancel.cancelled_owned())
            .await
            .map_err(|e| GatewayError::ServerFailed(e.to_string()))?;

        tracing::info!("Subscriber gateway stopped");
        Ok(())
    }
}

/// Build the gateway router.
#[must_use]
pub fn router(state: GatewayState) -> Router {
    Router::new()
        .route("/ws", get(upgrade_handler))
        .with_state(state)
}

async fn upgrade_handler(
    State(state): State<GatewayState>,
    upgrade: WebSocketUpgrade,
) -> impl IntoResponse {
    upgrade.on_upgrade(move |socket| serve_socket(socket, state))
}

async fn serve_socket(socket: WebSocket, state: GatewayState) {
    let (channel, events) = channel_subscriber(state.subscriber_buffer);

    let id = match state
        .broker
        .attach(Arc::clone(&channel) as Arc<dyn SubscriberChannel>)
    {
        Ok(id) => id,
        Err(e) => {
            tracing::warn!(error = %e, "Rejecting subscriber socket");
            return;
        }
    };

    let (sink, mut stream) = socket.split();
    let mut writer = tokio::spawn(write_events(sink, events, state.codec.clone(), id));

    loop {
        tokio::select! {
            _ = &mut writer => {
                // Channel closed by the broker, or the socket stopped accepting writes.
                break;
            }
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => match state.codec.decode_subscriber(text.as_str()) {
                    Ok(message) => state.broker.handle_subscriber_message(id, message),
                    Err(e) => {
                        tracing::warn!(subscriber_id = %id, error = %e, "Dropping malformed subscriber message");
                    }
                },
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    tracing::debug!(subscriber_id = %id, error = %e, "Subscriber socket error");
                    break;
                }
            },
        }
    }

    state.broker.detach(id, DetachReason::ChannelClosed);
    channel.close();
    if !writer.is_finished() {
        writer.abort();
    }
}

async fn write_events<S>(
    mut sink: S,
    mut events: mpsc::Receiver<BrokerEvent>,
    codec: JsonCodec,
    id: SubscriberId,
) where
    S: futures_util::Sink<Message> + Unpin,
    S::Error: std::fmt::Display,
{
    while let Some(event) = events.recv().await {
        let text = match codec.encode_event(&event) {
            Ok(text) => text,
            Err(e) => {
                tracing::warn!(subscriber_id = %id, error = %e, "Failed to encode event");
                continue;
            }
        };
        if let Err(e) = sink.send(Message::Text(text.into())).await {
            tracing::debug!(subscriber_id = %id, error = %e, "Subscriber write failed");
            return;
        }
    }

    // Detached by the broker.
    let _ = sink.send(Message::Close(None)).await;
}

/// Gateway server errors.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// Failed to bind to port.
    #[error("failed to bind to port {0}: {1}")]
    BindFailed(u16, String),

    /// Server error.
    #[error("server error: {0}")]
    ServerFailed(String),
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use tokio_tungstenite::tungstenite::Message as ClientMessage;
    use tower::ServiceExt;

    use super::*;
    use crate::application::ports::{SystemClock, TransportError, UpstreamConnector, UpstreamStream};
    use crate::application::services::BrokerOptions;

    /// Upstream that never finishes connecting.
    struct Unanswered;

    #[async_trait]
    impl UpstreamConnector for Unanswered {
        async fn connect(&self) -> Result<Box<dyn UpstreamStream>, TransportError> {
            std::future::pending().await
        }
    }

    fn broker() -> Broker {
        let broker = Broker::new(
            BrokerOptions::default(),
            Arc::new(Unanswered),
            Arc::new(SystemClock),
        );
        broker.start();
        broker
    }

    async fn serve(broker: Broker) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = router(GatewayState::new(broker, 16));
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        addr
    }

    async fn wait_for(mut condition: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn plain_get_is_rejected() {
        let response = router(GatewayState::new(broker(), 16))
            .oneshot(Request::get("/ws").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert!(response.status().is_client_error());
    }

    #[tokio::test]
    async fn socket_attaches_and_close_detaches() {
        let broker = broker();
        let addr = serve(broker.clone()).await;

        let (mut socket, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/ws"))
            .await
            .unwrap();
        wait_for(|| broker.subscriber_count() == 1).await;

        socket.close(None).await.unwrap();
        wait_for(|| broker.subscriber_count() == 0).await;
    }

    #[tokio::test]
    async fn unsubscribe_closes_socket() {
        let broker = broker();
        let addr = serve(broker.clone()).await;

        let (mut socket, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/ws"))
            .await
            .unwrap();
        wait_for(|| broker.subscriber_count() == 1).await;

        // Malformed messages are dropped without detaching.
        socket
            .send(ClientMessage::Text("not json".into()))
            .await
            .unwrap();
        socket
            .send(ClientMessage::Text(r#"{"type":"unsubscribe"}"#.into()))
            .await
            .unwrap();

        let closed = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match socket.next().await {
                    Some(Ok(ClientMessage::Close(_))) | None | Some(Err(_)) => return true,
                    Some(Ok(_)) => {}
                }
            }
        })
        .await
        .unwrap();

        assert!(closed);
        assert_eq!(broker.subscriber_count(), 0);
    }
}
