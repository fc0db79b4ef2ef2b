//! Events sent from the engine to the host.

use serde::{Deserialize, Serialize};

use crate::error::SessionError;
use crate::state::ConnectionState;
use crate::types::StreamStats;

/// Events that the streaming session can send to the host.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SessionEvent {
    /// Session state has changed.
    StateChanged {
        /// Previous state.
        previous: Box<ConnectionState>,

        /// Current state.
        current: Box<ConnectionState>,
    },

    /// Updated stream statistics.
    Stats(StreamStats),

    /// The companion process exited.
    CompanionExited {
        /// Exit code, if the process reported one.
        exit_code: Option<i32>,

        /// Whether the exit happened after a stop was requested.
        expected: bool,
    },

    /// Error occurred.
    Error(SessionError),
}
