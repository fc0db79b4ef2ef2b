//! Error types for the stream module.

use std::time::Duration;

use thiserror::Error;

/// Errors that can occur on the video data channel.
#[derive(Debug, Error)]
pub enum StreamError {
    /// No data connection was established in time.
    #[error("no video connection within {0:?}")]
    ConnectionTimeout(Duration),

    /// Socket already started.
    #[error("video socket already started")]
    AlreadyStarted,

    /// Stream preamble or frame header violated the companion protocol.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
