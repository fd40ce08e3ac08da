//! Session error taxonomy.
//!
//! Every pump converts its raw failures into one of these categories; the
//! first one recorded becomes the session's exit cause.

use thiserror::Error;

/// Why a port-forward session (or its transport) failed.
#[derive(Debug, Error)]
pub enum SessionError {
    /// Malformed frame, unsupported message type, or bad payload shape.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The WebSocket handshake with the broker was rejected or never
    /// completed. `status` carries the server HTTP status when one was
    /// received.
    #[error("failed to connect to broker: {message}")]
    Connect {
        status: Option<u16>,
        message: String,
    },

    /// I/O failure on an established WebSocket.
    #[error("websocket error: {0}")]
    Transport(#[from] tokio_tungstenite::tungstenite::Error),

    /// The broker reported a failure for this session.
    #[error("remote error: {0}")]
    Remote(String),

    /// A message requiring acknowledgement was not acked within the
    /// configured deadline.
    #[error("no ack received for message {message_id}")]
    AckTimeout { message_id: String },

    /// The external cancellation handle fired.
    #[error("operation cancelled")]
    Cancelled,

    /// Local TCP read/write failed outside of a normal close.
    #[error("tcp error: {0}")]
    Tcp(#[from] std::io::Error),
}
