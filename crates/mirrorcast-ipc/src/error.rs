//! Structured session errors exposed to host collaborators.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Classification of a session failure.
///
/// The host maps these to user-facing guidance; the engine only
/// classifies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionErrorKind {
    /// Neither a reverse nor a forward tunnel could be established.
    Transport,

    /// The local companion binary asset is missing.
    AssetMissing,

    /// Pushing the companion binary to the device failed.
    UploadFailed,

    /// The companion process exited during startup.
    ServerStart,

    /// No data connection arrived within the timeout.
    ConnectionTimeout,

    /// Parameter sets could not be turned into a format description.
    FormatDescription,

    /// The hardware decode session could not be created.
    SessionCreation,

    /// The companion process exited while a stream was expected to run.
    ProcessTerminated,

    /// Internal failure that fits no other category.
    Internal,
}

/// A classified session error with its underlying message.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{kind:?}: {message}")]
pub struct SessionError {
    /// Failure classification.
    pub kind: SessionErrorKind,

    /// Human-oriented detail from the failing component.
    pub message: String,
}

impl SessionError {
    /// Create a new session error.
    pub fn new(kind: SessionErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}
