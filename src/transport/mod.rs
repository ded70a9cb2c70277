//! Framed byte transports.
//!
//! A transport moves whole serialized messages; framing is its concern
//! alone.  Two implementations exist: a length prefixed raw socket (TCP,
//! AF_UNIX, optionally TLS) with its own PING/PONG control frames, and a
//! WebSocket bridge where the WebSocket layer provides framing and liveness.

use std::time::Duration;

use crate::WampResult;

pub mod rawsocket;
pub mod websocket;

pub use rawsocket::RawSocketTransport;
pub use websocket::WebSocketTransport;

/// A connected, framed, bidirectional byte pipe.
///
/// `read` is driven from a single reader thread; `write` may be called from
/// many threads and is internally serialized so that frames never
/// interleave.  Once any operation fails the transport is dead for good:
/// `is_connected` turns false and every later call fails with a
/// connection-lost error.
pub trait Transport: Send + Sync {
    /// Blocks until a whole message payload arrives.
    fn read(&self) -> WampResult<Vec<u8>>;

    /// Writes one message payload as a single frame.
    fn write(&self, data: &[u8]) -> WampResult<()>;

    /// Closes the underlying connection; idempotent.
    fn close(&self);

    fn is_connected(&self) -> bool;

    /// Measures a round trip to the peer, in milliseconds.
    fn ping(&self, timeout: Duration) -> WampResult<f64>;
}
