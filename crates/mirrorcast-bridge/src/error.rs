//! Error types for the bridge module.

use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur while driving the debug bridge.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// A bridge command exited with a failure status.
    #[error("bridge command failed: {command}: {detail}")]
    CommandFailed {
        /// The command line that failed.
        command: String,
        /// Stderr from the tool, trimmed.
        detail: String,
    },

    /// A bridge command exceeded its timeout.
    #[error("bridge command timed out: {0}")]
    CommandTimeout(String),

    /// Neither tunnel direction could be established.
    #[error("transport negotiation failed: {0}")]
    Transport(String),

    /// The local companion binary is not where configured.
    #[error("companion asset missing: {}", .0.display())]
    AssetMissing(PathBuf),

    /// Pushing the companion binary failed.
    #[error("companion upload failed: {0}")]
    UploadFailed(String),

    /// The companion exited during its startup grace period.
    #[error("companion exited during startup (exit code {code:?})")]
    ServerStartFailed {
        /// Exit code, if the process reported one.
        code: Option<i32>,
    },

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
