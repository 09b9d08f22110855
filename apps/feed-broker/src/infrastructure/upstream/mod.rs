//! Upstream Adapters
//!
//! JSON codec for the upstream and subscriber wire formats, and the
//! WebSocket implementation of the upstream ports.

/// JSON wire codec.
pub mod codec;

/// WebSocket upstream connector.
pub mod websocket;

pub use codec::{CodecError, JsonCodec};
pub use websocket::{WebSocketConnector, WebSocketStream};
