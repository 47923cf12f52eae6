use mark46_common::{FrameError, SignalError};
use thiserror::Error;

/// Errors that can occur during signaling server operation.
#[derive(Error, Debug)]
pub enum ServerError {
    /// The HTTP upgrade request was malformed or incomplete.
    #[error("handshake rejected: {0}")]
    Handshake(&'static str),
    /// Frame-level protocol violation from the peer.
    #[error("{0}")]
    Frame(#[from] FrameError),
    /// Signal envelope encoding or decoding error.
    #[error("signal error: {0}")]
    Signal(#[from] SignalError),
    /// The connection is gone; nothing can be written to it.
    #[error("connection closed")]
    ConnectionClosed,
    /// An outgoing message exceeds the configured payload limit.
    #[error("message of {size} bytes exceeds max payload {limit}")]
    MaxPayloadExceeded {
        /// Encoded message size in bytes.
        size: usize,
        /// Configured `max_payload` limit.
        limit: u64,
    },
    /// Underlying I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
