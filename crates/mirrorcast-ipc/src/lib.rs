//! Typed host<->engine messages for mirrorcast.
//!
//! This crate defines the state, event, and configuration types shared
//! between the streaming engine and its host collaborators (session list,
//! compositor, reconnection policy).

mod error;
mod events;
mod state;
mod types;

pub use error::{SessionError, SessionErrorKind};
pub use events::SessionEvent;
pub use state::{CapturePhase, ConnectionState};
pub use types::{CompanionLogLevel, StreamSettings, StreamStats, TunnelMode, VideoCodec};

use crossbeam_channel::{Receiver, Sender};

/// Channel capacity for events (engine → host).
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Creates a bounded event channel.
pub fn event_channel() -> (Sender<SessionEvent>, Receiver<SessionEvent>) {
    crossbeam_channel::bounded(EVENT_CHANNEL_CAPACITY)
}
