//! Tunnel negotiation.
//!
//! A reverse tunnel is preferred: the device connects out to the host, so
//! it works regardless of how the device routes inbound connections. When
//! reverse setup fails (some bridge daemons and network transports do not
//! support it), any partial reverse state is removed and a forward tunnel
//! is attempted once.

use tracing::{debug, info, instrument, warn};

use mirrorcast_ipc::TunnelMode;

use crate::adb::DebugBridge;
use crate::error::BridgeError;
use crate::{socket_name, BridgeResult};

/// A negotiated (or not yet negotiated) data tunnel.
pub struct Tunnel {
    socket_name: String,
    local_port: u16,
    mode: Option<TunnelMode>,
}

impl Tunnel {
    /// Create an unestablished tunnel for a session id.
    pub fn new(scid: u32, local_port: u16) -> Self {
        Self {
            socket_name: socket_name(scid),
            local_port,
            mode: None,
        }
    }

    /// The device-side socket name, namespaced by session id.
    pub fn socket_name(&self) -> &str {
        &self.socket_name
    }

    /// The host-side TCP port of the tunnel.
    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    /// The negotiated mode, if established.
    pub fn mode(&self) -> Option<TunnelMode> {
        self.mode
    }

    /// Negotiate the tunnel: reverse first, forward as fallback.
    #[instrument(name = "tunnel_establish", skip(self, bridge), fields(socket = %self.socket_name))]
    pub fn establish(&mut self, bridge: &dyn DebugBridge) -> BridgeResult<TunnelMode> {
        match bridge.reverse(&self.socket_name, self.local_port) {
            Ok(()) => {
                info!(port = self.local_port, "Reverse tunnel established");
                self.mode = Some(TunnelMode::Reverse);
                Ok(TunnelMode::Reverse)
            }
            Err(reverse_err) => {
                warn!(error = %reverse_err, "Reverse tunnel failed, trying forward");

                // Remove any partial reverse state; not-found is fine.
                if let Err(e) = bridge.reverse_remove(&self.socket_name) {
                    debug!(error = %e, "Reverse cleanup reported an error");
                }

                match bridge.forward(self.local_port, &self.socket_name) {
                    Ok(()) => {
                        info!(port = self.local_port, "Forward tunnel established");
                        self.mode = Some(TunnelMode::Forward);
                        Ok(TunnelMode::Forward)
                    }
                    Err(forward_err) => Err(BridgeError::Transport(format!(
                        "reverse failed ({reverse_err}); forward failed ({forward_err})"
                    ))),
                }
            }
        }
    }

    /// Remove the tunnel. Idempotent; removal errors are logged only.
    #[instrument(name = "tunnel_teardown", skip(self, bridge), fields(socket = %self.socket_name))]
    pub fn teardown(&mut self, bridge: &dyn DebugBridge) {
        match self.mode.take() {
            Some(TunnelMode::Reverse) => {
                if let Err(e) = bridge.reverse_remove(&self.socket_name) {
                    debug!(error = %e, "Reverse tunnel removal reported an error");
                }
            }
            Some(TunnelMode::Forward) => {
                if let Err(e) = bridge.forward_remove(self.local_port) {
                    debug!(error = %e, "Forward tunnel removal reported an error");
                }
            }
            None => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{BridgeCall, MockBridge};

    #[test]
    fn reverse_preferred_when_available() {
        let bridge = MockBridge::new();
        let mut tunnel = Tunnel::new(0x2A, 27183);

        let mode = tunnel.establish(&bridge).unwrap();
        assert_eq!(mode, TunnelMode::Reverse);
        assert_eq!(tunnel.mode(), Some(TunnelMode::Reverse));

        let calls = bridge.calls();
        assert_eq!(
            calls,
            vec![BridgeCall::Reverse {
                socket_name: "mirrorcast_0000002a".into(),
                port: 27183,
            }]
        );
    }

    #[test]
    fn forward_attempted_exactly_once_on_reverse_failure() {
        let bridge = MockBridge::new().fail_reverse();
        let mut tunnel = Tunnel::new(1, 27183);

        let mode = tunnel.establish(&bridge).unwrap();
        assert_eq!(mode, TunnelMode::Forward);

        let calls = bridge.calls();
        let forwards = calls
            .iter()
            .filter(|c| matches!(c, BridgeCall::Forward { .. }))
            .count();
        assert_eq!(forwards, 1);
        // Partial reverse state is cleaned up before the fallback.
        assert!(matches!(calls[1], BridgeCall::ReverseRemove { .. }));
    }

    #[test]
    fn both_directions_failing_is_a_transport_error() {
        let bridge = MockBridge::new().fail_reverse().fail_forward();
        let mut tunnel = Tunnel::new(1, 27183);

        let err = tunnel.establish(&bridge).unwrap_err();
        assert!(matches!(err, BridgeError::Transport(_)));
        assert_eq!(tunnel.mode(), None);
    }

    #[test]
    fn teardown_is_idempotent() {
        let bridge = MockBridge::new();
        let mut tunnel = Tunnel::new(1, 27183);
        tunnel.establish(&bridge).unwrap();

        tunnel.teardown(&bridge);
        tunnel.teardown(&bridge);

        let removals = bridge
            .calls()
            .iter()
            .filter(|c| matches!(c, BridgeCall::ReverseRemove { .. }))
            .count();
        assert_eq!(removals, 1);
    }

    #[test]
    fn teardown_without_establish_is_a_noop() {
        let bridge = MockBridge::new();
        let mut tunnel = Tunnel::new(1, 27183);
        tunnel.teardown(&bridge);
        assert!(bridge.calls().is_empty());
    }
}
