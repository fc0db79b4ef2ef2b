//! Debug-bridge tooling: tunnels and companion process control.
//!
//! Wraps the device debug-bridge executable (adb) behind the
//! [`DebugBridge`] trait, negotiates the data tunnel, and manages the
//! companion capture process on the device.

mod adb;
mod error;
mod launcher;
mod tunnel;

#[cfg(test)]
pub(crate) mod testutil;

pub use adb::{AdbBridge, AdbConfig, CompanionProcess, DebugBridge, ProcessExit};
pub use error::BridgeError;
pub use launcher::{CompanionExit, CompanionLauncher, LauncherConfig};
pub use tunnel::Tunnel;

/// Protocol version passed to the companion as its first argument.
pub const PROTOCOL_VERSION: &str = "1.4.0";

/// Prefix of the tunnel socket name; the session id is appended so
/// concurrent sessions cannot collide.
pub const SOCKET_NAME_PREFIX: &str = "mirrorcast";

/// Well-known device path the companion binary is pushed to.
pub const COMPANION_REMOTE_PATH: &str = "/data/local/tmp/mirrorcast-companion.jar";

/// Result type for bridge operations.
pub type BridgeResult<T> = Result<T, BridgeError>;

/// Tunnel socket name for a session id.
pub fn socket_name(scid: u32) -> String {
    format!("{SOCKET_NAME_PREFIX}_{scid:08x}")
}
