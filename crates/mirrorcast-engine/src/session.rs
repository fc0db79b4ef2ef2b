//! Device streaming session.
//!
//! Orchestrates tunnel negotiation, companion launch, the data socket,
//! and the parse/decode pipeline behind the connect / start_capture /
//! stop_capture / disconnect lifecycle, and owns error classification.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};
use parking_lot::RwLock;
use tracing::{debug, error, info, instrument, warn};

use mirrorcast_bridge::{
    AdbBridge, AdbConfig, BridgeError, CompanionExit, CompanionLauncher, DebugBridge,
    LauncherConfig,
};
use mirrorcast_decoder::{DecodedFrame, DecoderSession, DecoderSessionConfig};
use mirrorcast_ipc::{
    CapturePhase, ConnectionState, SessionError, SessionErrorKind, SessionEvent, StreamSettings,
    TunnelMode,
};
use mirrorcast_stream::{SocketEvent, StreamError, VideoSocket};

use crate::pipeline::{feed_loop, forward_loop, FeedContext};
use crate::stats::StatsCollector;

/// Overridable decode backend factory (platform ports, tests).
pub type DecodeBackendFactory = mirrorcast_decoder::BackendFactory;

/// Session configuration, injected at construction.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Companion launcher configuration.
    pub launcher: LauncherConfig,

    /// Stream settings forwarded to the companion.
    pub settings: StreamSettings,

    /// Decoder session configuration.
    pub decoder: DecoderSessionConfig,

    /// How long to wait for the first data connection.
    pub connect_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            launcher: LauncherConfig::default(),
            settings: StreamSettings::default(),
            decoder: DecoderSessionConfig::default(),
            connect_timeout: Duration::from_secs(5),
        }
    }
}

/// A streaming session against one device.
pub struct DeviceSession {
    config: SessionConfig,
    bridge: Arc<dyn DebugBridge>,
    state: Arc<RwLock<ConnectionState>>,
    event_tx: Sender<SessionEvent>,
    frame_tx: Sender<DecodedFrame>,
    decode_backend_factory: Option<Arc<DecodeBackendFactory>>,

    scid: u32,
    tunnel_mode: Option<TunnelMode>,
    launcher: Option<CompanionLauncher>,
    socket: Option<VideoSocket>,
    socket_rx: Option<Receiver<SocketEvent>>,
    decoder: Option<Arc<DecoderSession>>,
    stats: Arc<StatsCollector>,

    paused: Arc<AtomicBool>,
    stop_requested: Arc<AtomicBool>,
    feed_thread: Option<JoinHandle<()>>,
    forward_thread: Option<JoinHandle<()>>,
    monitor_thread: Option<JoinHandle<()>>,
}

impl DeviceSession {
    /// Create a session over the given bridge.
    pub fn new(
        bridge: Arc<dyn DebugBridge>,
        config: SessionConfig,
        event_tx: Sender<SessionEvent>,
        frame_tx: Sender<DecodedFrame>,
    ) -> Self {
        Self {
            config,
            bridge,
            state: Arc::new(RwLock::new(ConnectionState::Idle)),
            event_tx,
            frame_tx,
            decode_backend_factory: None,
            scid: 0,
            tunnel_mode: None,
            launcher: None,
            socket: None,
            socket_rx: None,
            decoder: None,
            stats: Arc::new(StatsCollector::new()),
            paused: Arc::new(AtomicBool::new(false)),
            stop_requested: Arc::new(AtomicBool::new(false)),
            feed_thread: None,
            forward_thread: None,
            monitor_thread: None,
        }
    }

    /// Create a session driving adb at the given configuration.
    pub fn with_adb(
        adb: AdbConfig,
        config: SessionConfig,
        event_tx: Sender<SessionEvent>,
        frame_tx: Sender<DecodedFrame>,
    ) -> Result<Self, SessionError> {
        let bridge = AdbBridge::new(adb)
            .map_err(|e| SessionError::new(SessionErrorKind::Internal, e.to_string()))?;
        Ok(Self::new(Arc::new(bridge), config, event_tx, frame_tx))
    }

    /// Override the decode backend factory (platform ports, tests).
    pub fn set_decode_backend_factory(&mut self, factory: Arc<DecodeBackendFactory>) {
        self.decode_backend_factory = Some(factory);
    }

    /// Current session state.
    pub fn state(&self) -> ConnectionState {
        self.state.read().clone()
    }

    /// Session id of the current connection; 0 before the first connect.
    pub fn scid(&self) -> u32 {
        self.scid
    }

    /// Tunnel mode of the running capture, if any.
    pub fn tunnel_mode(&self) -> Option<TunnelMode> {
        self.tunnel_mode
    }

    /// Associate with the device and prepare the launcher.
    ///
    /// Valid from idle or disconnected. The companion process is not
    /// started yet; that happens in `start_capture()`.
    #[instrument(name = "session_connect", skip(self))]
    pub fn connect(&mut self) -> Result<(), SessionError> {
        let current = self.state.read().clone();
        if !(current.is_idle() || current.is_disconnected()) {
            return Err(SessionError::new(
                SessionErrorKind::Internal,
                format!("connect() is not valid in state {}", current.name()),
            ));
        }

        transition_to(&self.state, &self.event_tx, ConnectionState::Connecting);

        let launcher = CompanionLauncher::new(Arc::clone(&self.bridge), self.config.launcher.clone());
        if let Err(e) = launcher.verify_asset() {
            let error = classify_bridge(e);
            self.fail(error.clone());
            return Err(error);
        }

        // Unique per session process lifetime; namespaces the tunnel
        // socket so concurrent sessions cannot collide.
        self.scid = rand::random::<u32>() & 0x7FFF_FFFF;
        self.launcher = Some(launcher);

        info!("Session connected (scid {:08x})", self.scid);
        transition_to(&self.state, &self.event_tx, ConnectionState::Connected);
        Ok(())
    }

    /// Start the capture stream.
    ///
    /// Valid from connected (full startup) or paused (resume). Blocks
    /// until the first data connection is live.
    #[instrument(name = "session_start_capture", skip(self))]
    pub fn start_capture(&mut self) -> Result<(), SessionError> {
        let current = self.state.read().clone();
        if current.is_paused() {
            return self.resume();
        }
        if !current.is_connected() {
            return Err(SessionError::new(
                SessionErrorKind::Internal,
                format!("start_capture() is not valid in state {}", current.name()),
            ));
        }

        info!("Starting capture");
        self.stop_requested.store(false, Ordering::SeqCst);
        self.paused.store(false, Ordering::SeqCst);

        let mut phase = CapturePhase::NegotiateTunnel;
        loop {
            if let Err(e) = self.init_phase(phase) {
                error!(phase = phase.name(), error = %e, "Capture start failed");
                self.rollback_from(phase);
                self.fail(e.clone());
                return Err(e);
            }
            match phase.next() {
                Some(next) => phase = next,
                None => break,
            }
        }

        self.stats.start();
        transition_to(&self.state, &self.event_tx, ConnectionState::Capturing);
        info!("Capture started");
        Ok(())
    }

    /// Stop the capture stream, retaining the device association.
    ///
    /// A second call with no stream running is a no-op.
    #[instrument(name = "session_stop_capture", skip(self))]
    pub fn stop_capture(&mut self) -> Result<(), SessionError> {
        if !self.state.read().is_streaming() {
            debug!("No active stream, ignoring stop_capture()");
            return Ok(());
        }

        info!("Stopping capture");
        self.teardown_stream();
        transition_to(&self.state, &self.event_tx, ConnectionState::Connected);
        Ok(())
    }

    /// Fully release the session. Terminal; a no-op when already
    /// disconnected.
    #[instrument(name = "session_disconnect", skip(self))]
    pub fn disconnect(&mut self) -> Result<(), SessionError> {
        if self.state.read().is_disconnected() {
            debug!("Already disconnected, ignoring disconnect()");
            return Ok(());
        }

        info!("Disconnecting");
        self.teardown_stream();
        self.launcher = None;

        transition_to(&self.state, &self.event_tx, ConnectionState::Disconnected);
        Ok(())
    }

    /// Mute frame emission without stopping the stream.
    pub fn pause(&mut self) -> Result<(), SessionError> {
        if !self.state.read().is_capturing() {
            return Err(SessionError::new(
                SessionErrorKind::Internal,
                "pause() requires an active capture",
            ));
        }
        self.paused.store(true, Ordering::SeqCst);
        transition_to(&self.state, &self.event_tx, ConnectionState::Paused);
        Ok(())
    }

    /// Resume frame emission.
    pub fn resume(&mut self) -> Result<(), SessionError> {
        if !self.state.read().is_paused() {
            return Err(SessionError::new(
                SessionErrorKind::Internal,
                "resume() requires a paused capture",
            ));
        }
        self.paused.store(false, Ordering::SeqCst);
        transition_to(&self.state, &self.event_tx, ConnectionState::Capturing);
        Ok(())
    }

    fn init_phase(&mut self, phase: CapturePhase) -> Result<(), SessionError> {
        info!(phase = phase.name(), "Capture phase");

        match phase {
            CapturePhase::NegotiateTunnel => {
                let scid = self.scid;
                let mode = self
                    .launcher_mut()?
                    .negotiate_tunnel(scid)
                    .map_err(classify_bridge)?;
                self.tunnel_mode = Some(mode);
            }
            CapturePhase::PushCompanion => {
                self.launcher_mut()?
                    .upload_companion()
                    .map_err(classify_bridge)?;
            }
            CapturePhase::StartCompanion => {
                let settings = self.config.settings.clone();
                let scid = self.scid;
                let exit_rx = self
                    .launcher_mut()?
                    .start(&settings, scid)
                    .map_err(classify_bridge)?;

                let state = Arc::clone(&self.state);
                let event_tx = self.event_tx.clone();
                let handle = thread::Builder::new()
                    .name("companion-exit-monitor".into())
                    .spawn(move || monitor_loop(exit_rx, state, event_tx))
                    .map_err(|e| SessionError::new(SessionErrorKind::Internal, e.to_string()))?;
                self.monitor_thread = Some(handle);
            }
            CapturePhase::OpenSocket => {
                let mode = self.tunnel_mode.ok_or_else(|| {
                    SessionError::new(SessionErrorKind::Internal, "tunnel mode missing")
                })?;
                let mut socket = VideoSocket::new();
                let rx = socket
                    .start(mode, self.config.launcher.local_port, self.config.connect_timeout)
                    .map_err(classify_stream)?;
                self.socket = Some(socket);
                self.socket_rx = Some(rx);
            }
            CapturePhase::StartPipeline => {
                let mode = self.tunnel_mode.ok_or_else(|| {
                    SessionError::new(SessionErrorKind::Internal, "tunnel mode missing")
                })?;
                let socket_rx = self.socket_rx.take().ok_or_else(|| {
                    SessionError::new(SessionErrorKind::Internal, "data channel missing")
                })?;
                let bytes_received = self
                    .socket
                    .as_ref()
                    .map(VideoSocket::bytes_received_counter)
                    .ok_or_else(|| {
                        SessionError::new(SessionErrorKind::Internal, "socket missing")
                    })?;

                let (decoded_tx, decoded_rx) = mirrorcast_decoder::frame_channel();
                let decoder = match &self.decode_backend_factory {
                    Some(factory) => {
                        let factory = Arc::clone(factory);
                        Arc::new(DecoderSession::with_backend_factory(
                            self.config.decoder.clone(),
                            decoded_tx,
                            Box::new(move |bundle| factory(bundle)),
                        ))
                    }
                    None => Arc::new(DecoderSession::new(self.config.decoder.clone(), decoded_tx)),
                };

                let feed = thread::Builder::new()
                    .name("stream-feed".into())
                    .spawn({
                        let ctx = FeedContext {
                            socket_rx,
                            decoder: Arc::clone(&decoder),
                            mode,
                            codec: self.config.settings.codec,
                            stop_requested: Arc::clone(&self.stop_requested),
                            state: Arc::clone(&self.state),
                            event_tx: self.event_tx.clone(),
                            stats: Arc::clone(&self.stats),
                            bytes_received,
                        };
                        move || feed_loop(ctx)
                    })
                    .map_err(|e| SessionError::new(SessionErrorKind::Internal, e.to_string()))?;

                let forward = thread::Builder::new()
                    .name("frame-forward".into())
                    .spawn({
                        let frame_tx = self.frame_tx.clone();
                        let paused = Arc::clone(&self.paused);
                        let stop_requested = Arc::clone(&self.stop_requested);
                        move || forward_loop(decoded_rx, frame_tx, paused, stop_requested)
                    })
                    .map_err(|e| SessionError::new(SessionErrorKind::Internal, e.to_string()))?;

                self.decoder = Some(decoder);
                self.feed_thread = Some(feed);
                self.forward_thread = Some(forward);
            }
        }

        Ok(())
    }

    fn rollback_from(&mut self, failed: CapturePhase) {
        let mut phase = Some(failed);
        while let Some(p) = phase {
            info!(phase = p.name(), "Rolling back capture phase");
            self.rollback_phase(p);
            phase = p.previous();
        }
        self.tunnel_mode = None;
    }

    fn rollback_phase(&mut self, phase: CapturePhase) {
        match phase {
            CapturePhase::StartPipeline => self.stop_pipeline(),
            CapturePhase::OpenSocket => {
                self.socket_rx = None;
                if let Some(mut socket) = self.socket.take() {
                    socket.stop();
                }
            }
            CapturePhase::StartCompanion => {
                if let Some(launcher) = self.launcher.as_mut() {
                    launcher.stop();
                }
                if let Some(handle) = self.monitor_thread.take() {
                    let _ = handle.join();
                }
            }
            CapturePhase::PushCompanion => {
                // The pushed asset is left on the device; re-push is cheap
                // and overwrites it.
            }
            CapturePhase::NegotiateTunnel => {
                if let Some(launcher) = self.launcher.as_mut() {
                    launcher.release_tunnel();
                }
            }
        }
    }

    /// Undo the pipeline phase: stop and join the feed/forward threads and
    /// drop the decoder. Mirrors the pipeline portion of [`teardown_stream`].
    fn stop_pipeline(&mut self) {
        self.stop_requested.store(true, Ordering::SeqCst);

        if let Some(handle) = self.feed_thread.take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.forward_thread.take() {
            let _ = handle.join();
        }
        if let Some(decoder) = self.decoder.take() {
            decoder.reset();
        }
    }

    /// Stop everything a running stream owns, in teardown order: socket,
    /// feed, companion (and tunnel), decoder.
    fn teardown_stream(&mut self) {
        self.stop_requested.store(true, Ordering::SeqCst);

        if let Some(mut socket) = self.socket.take() {
            socket.stop();
        }
        self.socket_rx = None;

        if let Some(handle) = self.feed_thread.take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.forward_thread.take() {
            let _ = handle.join();
        }

        if let Some(launcher) = self.launcher.as_mut() {
            launcher.stop();
        }
        if let Some(handle) = self.monitor_thread.take() {
            let _ = handle.join();
        }

        if let Some(decoder) = self.decoder.take() {
            decoder.reset();
        }

        self.tunnel_mode = None;
        self.paused.store(false, Ordering::SeqCst);
        self.stats.stop();
    }

    fn launcher_mut(&mut self) -> Result<&mut CompanionLauncher, SessionError> {
        self.launcher.as_mut().ok_or_else(|| {
            SessionError::new(SessionErrorKind::Internal, "session is not connected")
        })
    }

    fn fail(&self, error: SessionError) {
        let _ = self.event_tx.try_send(SessionEvent::Error(error.clone()));
        transition_to(&self.state, &self.event_tx, ConnectionState::Error { error });
    }
}

impl Drop for DeviceSession {
    fn drop(&mut self) {
        let _ = self.disconnect();
    }
}

/// Swap in a new state and emit the transition event.
pub(crate) fn transition_to(
    state: &Arc<RwLock<ConnectionState>>,
    event_tx: &Sender<SessionEvent>,
    new_state: ConnectionState,
) {
    let previous = {
        let mut state = state.write();
        std::mem::replace(&mut *state, new_state.clone())
    };

    debug!(
        previous = previous.name(),
        current = new_state.name(),
        "State transition"
    );

    if event_tx
        .try_send(SessionEvent::StateChanged {
            previous: Box::new(previous),
            current: Box::new(new_state),
        })
        .is_err()
    {
        warn!("Event channel full, state change not delivered");
    }
}

/// Watches the companion exit notification for one capture.
fn monitor_loop(
    exit_rx: Receiver<CompanionExit>,
    state: Arc<RwLock<ConnectionState>>,
    event_tx: Sender<SessionEvent>,
) {
    if let Ok(exit) = exit_rx.recv() {
        let _ = event_tx.try_send(SessionEvent::CompanionExited {
            exit_code: exit.code,
            expected: exit.expected,
        });

        if !exit.expected {
            let error = SessionError::new(
                SessionErrorKind::ProcessTerminated,
                format!("companion exited unexpectedly (code {:?})", exit.code),
            );
            let _ = event_tx.try_send(SessionEvent::Error(error.clone()));
            transition_to(&state, &event_tx, ConnectionState::Error { error });
        }
    }
}

fn classify_bridge(e: BridgeError) -> SessionError {
    let kind = match &e {
        BridgeError::AssetMissing(_) => SessionErrorKind::AssetMissing,
        BridgeError::UploadFailed(_) => SessionErrorKind::UploadFailed,
        BridgeError::ServerStartFailed { .. } => SessionErrorKind::ServerStart,
        BridgeError::Transport(_)
        | BridgeError::CommandFailed { .. }
        | BridgeError::CommandTimeout(_) => SessionErrorKind::Transport,
        BridgeError::Io(_) => SessionErrorKind::Internal,
    };
    SessionError::new(kind, e.to_string())
}

fn classify_stream(e: StreamError) -> SessionError {
    let kind = match &e {
        StreamError::ConnectionTimeout(_) => SessionErrorKind::ConnectionTimeout,
        _ => SessionErrorKind::Internal,
    };
    SessionError::new(kind, e.to_string())
}
