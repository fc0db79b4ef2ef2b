//! Companion process launch and lifecycle.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;
use tracing::{debug, info, instrument, warn};

use mirrorcast_ipc::{StreamSettings, TunnelMode};

use crate::adb::{CompanionProcess, DebugBridge};
use crate::error::BridgeError;
use crate::tunnel::Tunnel;
use crate::{BridgeResult, COMPANION_REMOTE_PATH, PROTOCOL_VERSION};

/// How often the monitor polls the companion for exit.
const MONITOR_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Notification that the companion process exited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompanionExit {
    /// Exit code, if the process reported one.
    pub code: Option<i32>,

    /// Whether a stop had been requested before the exit was observed.
    pub expected: bool,
}

/// Launcher configuration.
#[derive(Debug, Clone)]
pub struct LauncherConfig {
    /// Local path of the companion binary asset.
    pub companion_path: PathBuf,

    /// Device path the asset is pushed to.
    pub companion_remote_path: String,

    /// Version of the local companion asset, for the protocol check.
    pub companion_version: String,

    /// Host-side TCP port of the tunnel.
    pub local_port: u16,

    /// Grace period before the post-spawn liveness check.
    pub start_grace_period: Duration,
}

impl Default for LauncherConfig {
    fn default() -> Self {
        Self {
            companion_path: PathBuf::from("mirrorcast-companion.jar"),
            companion_remote_path: COMPANION_REMOTE_PATH.into(),
            companion_version: PROTOCOL_VERSION.into(),
            local_port: 27183,
            start_grace_period: Duration::from_millis(150),
        }
    }
}

/// Uploads, starts, monitors, and stops the companion capture process.
pub struct CompanionLauncher {
    bridge: Arc<dyn DebugBridge>,
    config: LauncherConfig,
    tunnel: Option<Tunnel>,
    process: Option<Arc<Mutex<Box<dyn CompanionProcess>>>>,
    stop_requested: Arc<AtomicBool>,
    monitor: Option<JoinHandle<()>>,
}

impl CompanionLauncher {
    /// Create a launcher over the given bridge.
    pub fn new(bridge: Arc<dyn DebugBridge>, config: LauncherConfig) -> Self {
        Self {
            bridge,
            config,
            tunnel: None,
            process: None,
            stop_requested: Arc::new(AtomicBool::new(false)),
            monitor: None,
        }
    }

    /// Check that the companion asset exists locally.
    pub fn verify_asset(&self) -> BridgeResult<()> {
        if !self.config.companion_path.exists() {
            return Err(BridgeError::AssetMissing(self.config.companion_path.clone()));
        }
        Ok(())
    }

    /// Negotiate the data tunnel for this session.
    pub fn negotiate_tunnel(&mut self, scid: u32) -> BridgeResult<TunnelMode> {
        let mut tunnel = Tunnel::new(scid, self.config.local_port);
        let mode = tunnel.establish(self.bridge.as_ref())?;
        self.tunnel = Some(tunnel);
        Ok(mode)
    }

    /// Remove the tunnel without touching the process. Idempotent.
    pub fn release_tunnel(&mut self) {
        if let Some(mut tunnel) = self.tunnel.take() {
            tunnel.teardown(self.bridge.as_ref());
        }
    }

    /// Push the companion binary to its well-known device path.
    #[instrument(name = "upload_companion", skip(self))]
    pub fn upload_companion(&self) -> BridgeResult<()> {
        self.verify_asset()?;
        self.bridge
            .push(&self.config.companion_path, &self.config.companion_remote_path)
            .map_err(|e| BridgeError::UploadFailed(e.to_string()))?;
        info!(remote = %self.config.companion_remote_path, "Companion uploaded");
        Ok(())
    }

    /// Start the companion with the versioned argument list.
    ///
    /// Waits a short grace period, verifies the process survived it, and
    /// returns a receiver carrying the single exit notification produced
    /// by a background monitor.
    #[instrument(name = "companion_start", skip(self, settings))]
    pub fn start(
        &mut self,
        settings: &StreamSettings,
        scid: u32,
    ) -> BridgeResult<Receiver<CompanionExit>> {
        let mode = self
            .tunnel
            .as_ref()
            .and_then(Tunnel::mode)
            .ok_or_else(|| BridgeError::Transport("tunnel not negotiated".into()))?;

        self.check_protocol_version();

        let args = companion_args(settings, scid, mode, &self.config.companion_remote_path);
        debug!(?args, "Starting companion");

        let process = self.bridge.spawn_shell(&args)?;
        let process = Arc::new(Mutex::new(process));

        // An argument-list or environment problem makes the companion
        // exit immediately; catch that here instead of timing out on the
        // data socket later.
        thread::sleep(self.config.start_grace_period);
        if let Some(exit) = process.lock().try_wait()? {
            return Err(BridgeError::ServerStartFailed { code: exit.code });
        }
        info!("Companion running (scid {scid:08x}, {mode} tunnel)");

        self.stop_requested.store(false, Ordering::SeqCst);
        let (exit_tx, exit_rx) = crossbeam_channel::bounded(1);
        let monitor = thread::Builder::new()
            .name("companion-monitor".into())
            .spawn({
                let process = Arc::clone(&process);
                let stop_requested = Arc::clone(&self.stop_requested);
                move || monitor_loop(process, stop_requested, exit_tx)
            })
            .map_err(BridgeError::Io)?;

        self.process = Some(process);
        self.monitor = Some(monitor);

        Ok(exit_rx)
    }

    /// Terminate the companion and tear down the tunnel. Idempotent.
    #[instrument(name = "companion_stop", skip(self))]
    pub fn stop(&mut self) {
        self.stop_requested.store(true, Ordering::SeqCst);

        if let Some(process) = self.process.take() {
            if let Err(e) = process.lock().kill() {
                debug!(error = %e, "Companion kill reported an error (may have exited)");
            }
        }

        if let Some(monitor) = self.monitor.take() {
            let _ = monitor.join();
        }

        self.release_tunnel();
    }

    fn check_protocol_version(&self) {
        let asset_major = major_version(&self.config.companion_version);
        let protocol_major = major_version(PROTOCOL_VERSION);
        if asset_major != protocol_major {
            warn!(
                asset = %self.config.companion_version,
                protocol = PROTOCOL_VERSION,
                "Companion asset major version differs from protocol version"
            );
        }
    }
}

impl Drop for CompanionLauncher {
    fn drop(&mut self) {
        self.stop();
    }
}

fn major_version(version: &str) -> Option<u32> {
    version.split('.').next()?.parse().ok()
}

/// Build the companion's versioned argument list.
fn companion_args(
    settings: &StreamSettings,
    scid: u32,
    mode: TunnelMode,
    remote_path: &str,
) -> Vec<String> {
    let mut args = vec![
        format!("CLASSPATH={remote_path}"),
        "app_process".into(),
        "/".into(),
        "com.mirrorcast.companion.Server".into(),
        PROTOCOL_VERSION.into(),
        format!("scid={scid:08x}"),
        format!("log_level={}", settings.log_level),
        "audio=false".into(),
        "control=false".into(),
        "send_device_meta=true".into(),
        "send_frame_meta=true".into(),
        "send_dummy_byte=true".into(),
        "send_codec_meta=true".into(),
        format!("tunnel_forward={}", mode.is_forward()),
    ];

    if let Some(max_size) = settings.max_size {
        args.push(format!("max_size={max_size}"));
    }
    if let Some(max_fps) = settings.max_fps {
        args.push(format!("max_fps={max_fps}"));
    }
    if let Some(bit_rate) = settings.video_bit_rate {
        args.push(format!("video_bit_rate={bit_rate}"));
    }

    args.push(format!("video_codec={}", settings.codec));
    args
}

fn monitor_loop(
    process: Arc<Mutex<Box<dyn CompanionProcess>>>,
    stop_requested: Arc<AtomicBool>,
    exit_tx: Sender<CompanionExit>,
) {
    loop {
        match process.lock().try_wait() {
            Ok(Some(exit)) => {
                let expected = stop_requested.load(Ordering::SeqCst);
                if expected {
                    debug!(code = ?exit.code, "Companion exited after stop");
                } else {
                    warn!(code = ?exit.code, "Companion exited unexpectedly");
                }
                let _ = exit_tx.send(CompanionExit {
                    code: exit.code,
                    expected,
                });
                break;
            }
            Ok(None) => {}
            Err(e) => {
                warn!(error = %e, "Companion liveness poll failed");
                break;
            }
        }
        thread::sleep(MONITOR_POLL_INTERVAL);
    }
}
