//! Error types for the decoder module.

use thiserror::Error;

/// Errors that can occur during decode operations.
#[derive(Debug, Error)]
pub enum DecoderError {
    /// Parameter sets could not be turned into a format description.
    #[error("format description failed: {0}")]
    FormatDescription(String),

    /// The underlying decode session could not be created.
    #[error("decode session creation failed: {0}")]
    SessionCreation(String),

    /// A single unit failed to decode (non-fatal).
    #[error("decode error: {0}")]
    Decode(String),

    /// The session has no live decode session.
    #[error("decoder not initialized")]
    NotInitialized,

    /// The session already has a live decode session.
    #[error("decoder already initialized")]
    AlreadyInitialized,

    /// The processing queue is gone.
    #[error("decode queue disconnected")]
    ChannelDisconnected,
}
