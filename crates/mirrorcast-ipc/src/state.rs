//! Session state machine types.

use serde::{Deserialize, Serialize};

use crate::error::SessionError;

/// The externally observable state of a device streaming session.
///
/// Transitions follow `idle → connecting → connected → capturing ⇄ paused`;
/// `error` is reachable from any state and `disconnected` is the terminal
/// state of a normal teardown.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub enum ConnectionState {
    /// No device association.
    #[default]
    Idle,

    /// Connection attempt in progress.
    Connecting,

    /// Device association established, no stream running.
    Connected,

    /// Live stream running, frames being emitted.
    Capturing,

    /// Stream running but frame emission muted.
    Paused,

    /// Session failed.
    Error {
        /// What went wrong.
        error: SessionError,
    },

    /// Session torn down; a new `connect()` is required.
    Disconnected,
}

impl ConnectionState {
    /// Returns true if the session is idle.
    pub fn is_idle(&self) -> bool {
        matches!(self, Self::Idle)
    }

    /// Returns true if the session is connected (stream stopped).
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }

    /// Returns true if a stream is running (capturing or paused).
    pub fn is_streaming(&self) -> bool {
        matches!(self, Self::Capturing | Self::Paused)
    }

    /// Returns true if the session is capturing.
    pub fn is_capturing(&self) -> bool {
        matches!(self, Self::Capturing)
    }

    /// Returns true if the session is paused.
    pub fn is_paused(&self) -> bool {
        matches!(self, Self::Paused)
    }

    /// Returns true if the session is in an error state.
    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error { .. })
    }

    /// Returns true if the session has been torn down.
    pub fn is_disconnected(&self) -> bool {
        matches!(self, Self::Disconnected)
    }

    /// Returns a simple string representation of the state.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Idle => "Idle",
            Self::Connecting => "Connecting",
            Self::Connected => "Connected",
            Self::Capturing => "Capturing",
            Self::Paused => "Paused",
            Self::Error { .. } => "Error",
            Self::Disconnected => "Disconnected",
        }
    }
}

/// Capture startup phases, in order.
///
/// `start_capture()` walks these forward; a failure rolls the completed
/// phases back in reverse order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CapturePhase {
    /// Negotiating the reverse/forward tunnel.
    NegotiateTunnel,

    /// Pushing the companion binary to the device.
    PushCompanion,

    /// Starting the companion process.
    StartCompanion,

    /// Opening the video data socket.
    OpenSocket,

    /// Starting the parse/decode pipeline.
    StartPipeline,
}

impl CapturePhase {
    /// Returns the next phase, if any.
    pub fn next(self) -> Option<Self> {
        match self {
            Self::NegotiateTunnel => Some(Self::PushCompanion),
            Self::PushCompanion => Some(Self::StartCompanion),
            Self::StartCompanion => Some(Self::OpenSocket),
            Self::OpenSocket => Some(Self::StartPipeline),
            Self::StartPipeline => None,
        }
    }

    /// Returns the previous phase, if any (for rollback).
    pub fn previous(self) -> Option<Self> {
        match self {
            Self::NegotiateTunnel => None,
            Self::PushCompanion => Some(Self::NegotiateTunnel),
            Self::StartCompanion => Some(Self::PushCompanion),
            Self::OpenSocket => Some(Self::StartCompanion),
            Self::StartPipeline => Some(Self::OpenSocket),
        }
    }

    /// Returns the display name for this phase.
    pub fn name(self) -> &'static str {
        match self {
            Self::NegotiateTunnel => "Negotiating tunnel",
            Self::PushCompanion => "Pushing companion",
            Self::StartCompanion => "Starting companion",
            Self::OpenSocket => "Opening video socket",
            Self::StartPipeline => "Starting pipeline",
        }
    }
}
