//! Device streaming session orchestration for mirrorcast.
//!
//! This crate coordinates the bridge, stream, and decoder subsystems into
//! a single connect / start_capture / stop_capture / disconnect lifecycle
//! with externally observable state.

mod pipeline;
mod session;
mod stats;

pub use session::{DecodeBackendFactory, DeviceSession, SessionConfig};
pub use stats::StatsCollector;

use std::sync::Arc;

use crossbeam_channel::Sender;

use mirrorcast_bridge::DebugBridge;
use mirrorcast_decoder::DecodedFrame;
use mirrorcast_ipc::SessionEvent;

/// Create a device session over an already-constructed bridge.
pub fn create_session(
    bridge: Arc<dyn DebugBridge>,
    config: SessionConfig,
    event_tx: Sender<SessionEvent>,
    frame_tx: Sender<DecodedFrame>,
) -> DeviceSession {
    DeviceSession::new(bridge, config, event_tx, frame_tx)
}
