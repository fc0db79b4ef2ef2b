//! Hardware decoder session.
//!
//! Owns the dedicated decode-processing queue (a worker thread draining a
//! bounded job channel), the pending-frame budget, and the generation
//! token. All methods take `&self` so the session can be shared between
//! the stream feed path and the orchestrator.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use bytes::{BufMut, Bytes, BytesMut};
use crossbeam_channel::{Receiver, Sender};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, instrument, trace, warn};

use mirrorcast_stream::{CodedUnit, ParameterSetBundle};

use crate::error::DecoderError;
use crate::{BackendFactory, DecodeBackend, DecodedFrame, DecoderResult};

/// Capacity of the decode job queue. Deep enough that the pending-frame
/// budget, not the channel, is what sheds load.
const JOB_QUEUE_CAPACITY: usize = 32;

/// State of the decoder session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecoderState {
    /// No decode session exists.
    Idle,

    /// A decode session was built from a parameter-set bundle.
    Ready,

    /// At least one unit has been submitted.
    Decoding,

    /// Unrecoverable failure; `reset()` returns to idle.
    Error {
        /// What went wrong.
        reason: String,
    },
}

impl DecoderState {
    /// Returns a simple string representation of the state.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Idle => "Idle",
            Self::Ready => "Ready",
            Self::Decoding => "Decoding",
            Self::Error { .. } => "Error",
        }
    }

    fn accepts_units(&self) -> bool {
        matches!(self, Self::Ready | Self::Decoding)
    }
}

/// Decoder session configuration.
#[derive(Debug, Clone)]
pub struct DecoderSessionConfig {
    /// Maximum units in flight before non-key frames are shed.
    pub max_pending_frames: usize,
}

impl Default for DecoderSessionConfig {
    fn default() -> Self {
        Self {
            max_pending_frames: 3,
        }
    }
}

enum DecodeJob {
    Unit {
        sample: Bytes,
        pts_us: Option<u64>,
        generation: u64,
    },
    Drain {
        done: Sender<()>,
    },
}

/// The hardware decoder session.
pub struct DecoderSession {
    config: DecoderSessionConfig,
    factory: Box<BackendFactory>,
    frame_tx: Sender<DecodedFrame>,

    state: RwLock<DecoderState>,
    job_tx: Mutex<Option<Sender<DecodeJob>>>,
    worker: Mutex<Option<JoinHandle<()>>>,

    // The only state shared with the processing queue: the in-flight
    // budget and the token that invalidates pre-stop completions.
    pending: Arc<Mutex<usize>>,
    generation: Arc<AtomicU64>,

    frames_decoded: Arc<AtomicU64>,
    frames_dropped: Arc<AtomicU64>,
    decode_errors: Arc<AtomicU64>,
}

impl DecoderSession {
    /// Create a session using the platform backend factory.
    pub fn new(config: DecoderSessionConfig, frame_tx: Sender<DecodedFrame>) -> Self {
        Self::with_backend_factory(config, frame_tx, Box::new(crate::create_decode_backend))
    }

    /// Create a session with a custom backend factory.
    pub fn with_backend_factory(
        config: DecoderSessionConfig,
        frame_tx: Sender<DecodedFrame>,
        factory: Box<BackendFactory>,
    ) -> Self {
        Self {
            config,
            factory,
            frame_tx,
            state: RwLock::new(DecoderState::Idle),
            job_tx: Mutex::new(None),
            worker: Mutex::new(None),
            pending: Arc::new(Mutex::new(0)),
            generation: Arc::new(AtomicU64::new(0)),
            frames_decoded: Arc::new(AtomicU64::new(0)),
            frames_dropped: Arc::new(AtomicU64::new(0)),
            decode_errors: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Build the decode session from a parameter-set bundle.
    ///
    /// Failures leave the session idle; the caller may retry once a fresh
    /// bundle arrives.
    #[instrument(name = "decoder_initialize", skip_all)]
    pub fn initialize(&self, bundle: &ParameterSetBundle) -> DecoderResult<()> {
        if !matches!(*self.state.read(), DecoderState::Idle) {
            return Err(DecoderError::AlreadyInitialized);
        }

        let backend = (self.factory)(bundle).map_err(|e| {
            warn!(error = %e, "Decode session construction failed");
            e
        })?;

        info!(backend = backend.name(), codec = %bundle.codec, "Decode session ready");

        let (job_tx, job_rx) = crossbeam_channel::bounded(JOB_QUEUE_CAPACITY);
        let pending = Arc::clone(&self.pending);
        let generation = Arc::clone(&self.generation);
        let frame_tx = self.frame_tx.clone();
        let frames_decoded = Arc::clone(&self.frames_decoded);
        let frames_dropped = Arc::clone(&self.frames_dropped);
        let decode_errors = Arc::clone(&self.decode_errors);

        let handle = thread::Builder::new()
            .name("decode-worker".into())
            .spawn(move || {
                worker_loop(
                    backend,
                    job_rx,
                    pending,
                    generation,
                    frame_tx,
                    frames_decoded,
                    frames_dropped,
                    decode_errors,
                )
            })
            .map_err(|e| DecoderError::SessionCreation(e.to_string()))?;

        *self.job_tx.lock() = Some(job_tx);
        *self.worker.lock() = Some(handle);
        *self.state.write() = DecoderState::Ready;

        Ok(())
    }

    /// Queue a coded unit for decoding.
    ///
    /// If the pending-frame budget is exhausted and the unit is not a key
    /// frame, the unit is shed and counted; key frames are always queued.
    pub fn decode(&self, unit: &CodedUnit, pts_us: Option<u64>) -> DecoderResult<()> {
        if !self.state.read().accepts_units() {
            return Err(DecoderError::NotInitialized);
        }

        if unit.kind.is_parameter_set() {
            debug!("Ignoring parameter-set unit on the decode path");
            return Ok(());
        }

        {
            let mut pending = self.pending.lock();
            if *pending >= self.config.max_pending_frames && !unit.kind.is_key_frame() {
                drop(pending);
                self.frames_dropped.fetch_add(1, Ordering::Relaxed);
                trace!("Pending budget exhausted, dropping delta frame");
                return Ok(());
            }
            *pending += 1;
        }

        let job = DecodeJob::Unit {
            sample: length_prefixed(&unit.payload),
            pts_us,
            generation: self.generation.load(Ordering::SeqCst),
        };

        let sent = {
            let job_tx = self.job_tx.lock();
            match job_tx.as_ref() {
                Some(tx) => tx.send(job).is_ok(),
                None => false,
            }
        };

        if !sent {
            *self.pending.lock() = 0;
            *self.state.write() = DecoderState::Error {
                reason: "decode queue disconnected".into(),
            };
            return Err(DecoderError::ChannelDisconnected);
        }

        let mut state = self.state.write();
        if matches!(*state, DecoderState::Ready) {
            *state = DecoderState::Decoding;
        }

        Ok(())
    }

    /// Disable delivery of in-flight completions, then wait for the
    /// backend to finish all outstanding work.
    ///
    /// The generation bump must happen before the drain: reversing the
    /// order would let a frame decoded during the drain be delivered
    /// after this call returns.
    #[instrument(name = "decoder_stop_and_drain", skip(self))]
    pub fn stop_and_drain(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);

        let job_tx = self.job_tx.lock().clone();
        if let Some(tx) = job_tx {
            let (done_tx, done_rx) = crossbeam_channel::bounded(1);
            if tx.send(DecodeJob::Drain { done: done_tx }).is_ok() {
                // Bounded by the backend's own completion guarantee.
                let _ = done_rx.recv();
            }
        }
    }

    /// Stop, release the decode session, and return to idle. Idempotent.
    #[instrument(name = "decoder_reset", skip(self))]
    pub fn reset(&self) {
        self.stop_and_drain();

        drop(self.job_tx.lock().take());
        if let Some(handle) = self.worker.lock().take() {
            let _ = handle.join();
        }

        *self.pending.lock() = 0;
        *self.state.write() = DecoderState::Idle;
        debug!("Decoder session reset");
    }

    /// Current session state.
    pub fn state(&self) -> DecoderState {
        self.state.read().clone()
    }

    /// Frames decoded and delivered since construction.
    pub fn frames_decoded(&self) -> u64 {
        self.frames_decoded.load(Ordering::Relaxed)
    }

    /// Frames shed by the pending budget or a lagging consumer.
    pub fn frames_dropped(&self) -> u64 {
        self.frames_dropped.load(Ordering::Relaxed)
    }

    /// Per-unit decode failures since construction.
    pub fn decode_errors(&self) -> u64 {
        self.decode_errors.load(Ordering::Relaxed)
    }
}

impl Drop for DecoderSession {
    fn drop(&mut self) {
        self.reset();
    }
}

/// Re-frame a start-code-stripped unit payload with a 4-byte big-endian
/// length prefix, as the decode APIs expect.
fn length_prefixed(payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(4 + payload.len());
    buf.put_u32(payload.len() as u32);
    buf.put_slice(payload);
    buf.freeze()
}

#[allow(clippy::too_many_arguments)]
fn worker_loop(
    mut backend: Box<dyn DecodeBackend>,
    job_rx: Receiver<DecodeJob>,
    pending: Arc<Mutex<usize>>,
    generation: Arc<AtomicU64>,
    frame_tx: Sender<DecodedFrame>,
    frames_decoded: Arc<AtomicU64>,
    frames_dropped: Arc<AtomicU64>,
    decode_errors: Arc<AtomicU64>,
) {
    debug!("Decode worker starting");

    while let Ok(job) = job_rx.recv() {
        match job {
            DecodeJob::Unit {
                sample,
                pts_us,
                generation: job_generation,
            } => {
                let result = backend.submit(&sample, pts_us);

                {
                    let mut pending = pending.lock();
                    *pending = pending.saturating_sub(1);
                }

                match result {
                    Ok(frames) => {
                        for frame in frames {
                            if job_generation != generation.load(Ordering::SeqCst) {
                                trace!("Discarding frame from a stale generation");
                                continue;
                            }
                            frames_decoded.fetch_add(1, Ordering::Relaxed);
                            if frame_tx.try_send(frame).is_err() {
                                // Consumer lagging or gone; shed rather
                                // than stall the processing queue.
                                frames_dropped.fetch_add(1, Ordering::Relaxed);
                            }
                        }
                    }
                    Err(e) => {
                        // A corrupt unit must not tear down the session.
                        decode_errors.fetch_add(1, Ordering::Relaxed);
                        warn!(error = %e, "Unit decode failed");
                    }
                }
            }
            DecodeJob::Drain { done } => {
                match backend.flush() {
                    Ok(frames) => {
                        if !frames.is_empty() {
                            trace!(count = frames.len(), "Discarding drained frames");
                        }
                    }
                    Err(e) => warn!(error = %e, "Backend flush failed"),
                }
                let _ = done.send(());
            }
        }
    }

    debug!("Decode worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame_channel;
    use mirrorcast_stream::{CodedUnit, CodedUnitKind};
    use std::time::Duration;

    /// Backend that records samples and optionally blocks each submit on
    /// a gate until the test releases it.
    struct MockBackend {
        submissions: Arc<Mutex<Vec<Bytes>>>,
        gate: Option<Receiver<()>>,
        frames_per_submit: usize,
        fail_submits: bool,
    }

    impl DecodeBackend for MockBackend {
        fn submit(
            &mut self,
            sample: &[u8],
            pts_us: Option<u64>,
        ) -> DecoderResult<Vec<DecodedFrame>> {
            if let Some(gate) = &self.gate {
                let _ = gate.recv();
            }
            self.submissions.lock().push(Bytes::copy_from_slice(sample));
            if self.fail_submits {
                return Err(DecoderError::Decode("synthetic corruption".into()));
            }
            Ok((0..self.frames_per_submit)
                .map(|_| DecodedFrame {
                    data: Bytes::from_static(&[0u8; 6]),
                    width: 2,
                    height: 2,
                    pts_us,
                })
                .collect())
        }

        fn flush(&mut self) -> DecoderResult<Vec<DecodedFrame>> {
            Ok(Vec::new())
        }

        fn name(&self) -> &'static str {
            "mock"
        }
    }

    fn session_with_mock(
        max_pending: usize,
        frames_per_submit: usize,
        fail_submits: bool,
        gate: Option<Receiver<()>>,
    ) -> (
        DecoderSession,
        crossbeam_channel::Receiver<DecodedFrame>,
        Arc<Mutex<Vec<Bytes>>>,
    ) {
        let submissions = Arc::new(Mutex::new(Vec::new()));
        let submissions_clone = Arc::clone(&submissions);
        let gate = Mutex::new(gate);
        let (frame_tx, frame_rx) = frame_channel();
        let session = DecoderSession::with_backend_factory(
            DecoderSessionConfig {
                max_pending_frames: max_pending,
            },
            frame_tx,
            Box::new(move |_bundle| {
                Ok(Box::new(MockBackend {
                    submissions: Arc::clone(&submissions_clone),
                    gate: gate.lock().take(),
                    frames_per_submit,
                    fail_submits,
                }) as Box<dyn DecodeBackend>)
            }),
        );
        (session, frame_rx, submissions)
    }

    fn bundle() -> ParameterSetBundle {
        ParameterSetBundle {
            codec: mirrorcast_ipc::VideoCodec::H264,
            vps: None,
            sps: Bytes::from_static(&[0x67, 0x42]),
            pps: Bytes::from_static(&[0x68, 0xCE]),
        }
    }

    fn key_unit() -> CodedUnit {
        CodedUnit {
            kind: CodedUnitKind::KeyFrame,
            payload: Bytes::from_static(&[0x65, 0x88, 0x84]),
        }
    }

    fn delta_unit() -> CodedUnit {
        CodedUnit {
            kind: CodedUnitKind::DeltaFrame,
            payload: Bytes::from_static(&[0x41, 0x9A]),
        }
    }

    #[test]
    fn initialize_transitions_idle_to_ready() {
        let (session, _rx, _subs) = session_with_mock(3, 0, false, None);
        assert_eq!(session.state(), DecoderState::Idle);

        session.initialize(&bundle()).unwrap();
        assert_eq!(session.state(), DecoderState::Ready);

        // Double initialization is rejected.
        assert!(matches!(
            session.initialize(&bundle()),
            Err(DecoderError::AlreadyInitialized)
        ));

        session.reset();
        assert_eq!(session.state(), DecoderState::Idle);
        session.initialize(&bundle()).unwrap();
        assert_eq!(session.state(), DecoderState::Ready);
    }

    #[test]
    fn decode_before_initialize_is_rejected() {
        let (session, _rx, _subs) = session_with_mock(3, 0, false, None);
        assert!(matches!(
            session.decode(&delta_unit(), None),
            Err(DecoderError::NotInitialized)
        ));
    }

    #[test]
    fn first_submission_moves_to_decoding() {
        let (session, _rx, _subs) = session_with_mock(3, 0, false, None);
        session.initialize(&bundle()).unwrap();
        session.decode(&key_unit(), Some(0)).unwrap();
        assert_eq!(session.state(), DecoderState::Decoding);
    }

    #[test]
    fn budget_sheds_delta_frames_never_key_frames() {
        let max_pending = 3;
        let (gate_tx, gate_rx) = crossbeam_channel::unbounded();
        let (session, _rx, subs) = session_with_mock(max_pending, 0, false, Some(gate_rx));
        session.initialize(&bundle()).unwrap();

        // Fill the budget with delta frames; the worker blocks on the
        // gate so nothing completes.
        for _ in 0..max_pending {
            session.decode(&delta_unit(), None).unwrap();
        }

        // A key frame over budget is still queued.
        session.decode(&key_unit(), None).unwrap();
        assert_eq!(session.frames_dropped(), 0);

        // Five more delta frames over budget are all shed.
        for _ in 0..5 {
            session.decode(&delta_unit(), None).unwrap();
        }
        assert_eq!(session.frames_dropped(), 5);

        // Release the worker and let everything queued complete.
        drop(gate_tx);
        session.reset();

        // 3 deltas + 1 key were actually submitted.
        assert_eq!(subs.lock().len(), 4);
        assert_eq!(session.frames_dropped(), 5);
    }

    #[test]
    fn late_completion_never_escapes_after_drain() {
        let (gate_tx, gate_rx) = crossbeam_channel::unbounded();
        let (session, frame_rx, _subs) = session_with_mock(3, 1, false, Some(gate_rx));
        let session = Arc::new(session);
        session.initialize(&bundle()).unwrap();

        // The worker blocks inside submit, holding the frame hostage.
        session.decode(&key_unit(), Some(1)).unwrap();

        let drainer = {
            let session = Arc::clone(&session);
            std::thread::spawn(move || session.stop_and_drain())
        };

        // Let the generation bump land, then release the decode: its
        // completion now belongs to a stale generation.
        std::thread::sleep(Duration::from_millis(50));
        drop(gate_tx);
        drainer.join().unwrap();

        assert!(frame_rx
            .recv_timeout(Duration::from_millis(100))
            .is_err());
        assert_eq!(session.frames_decoded(), 0);
    }

    #[test]
    fn frames_flow_when_generation_is_current() {
        let (session, frame_rx, _subs) = session_with_mock(3, 1, false, None);
        session.initialize(&bundle()).unwrap();
        session.decode(&key_unit(), Some(42)).unwrap();

        let frame = frame_rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(frame.pts_us, Some(42));
        assert_eq!(session.frames_decoded(), 1);
    }

    #[test]
    fn unit_failures_count_but_do_not_change_state() {
        let (session, _rx, _subs) = session_with_mock(3, 0, true, None);
        session.initialize(&bundle()).unwrap();

        session.decode(&key_unit(), None).unwrap();
        session.decode(&delta_unit(), None).unwrap();
        session.reset();

        assert_eq!(session.decode_errors(), 2);

        // The session is reusable after a reset.
        session.initialize(&bundle()).unwrap();
        assert_eq!(session.state(), DecoderState::Ready);
    }

    #[test]
    fn samples_are_length_prefixed() {
        let (session, _rx, subs) = session_with_mock(3, 0, false, None);
        session.initialize(&bundle()).unwrap();
        session.decode(&key_unit(), None).unwrap();
        session.reset();

        let subs = subs.lock();
        assert_eq!(subs.len(), 1);
        assert_eq!(subs[0].as_ref(), &[0, 0, 0, 3, 0x65, 0x88, 0x84]);
    }

    #[test]
    fn parameter_set_units_are_ignored() {
        let (session, _rx, subs) = session_with_mock(3, 0, false, None);
        session.initialize(&bundle()).unwrap();
        let ps = CodedUnit {
            kind: CodedUnitKind::ParameterSet(mirrorcast_stream::ParameterSetKind::Sps),
            payload: Bytes::from_static(&[0x67]),
        };
        session.decode(&ps, None).unwrap();
        session.reset();
        assert!(subs.lock().is_empty());
    }

    #[test]
    fn reset_is_idempotent() {
        let (session, _rx, _subs) = session_with_mock(3, 0, false, None);
        session.initialize(&bundle()).unwrap();
        session.reset();
        session.reset();
        assert_eq!(session.state(), DecoderState::Idle);
    }

    #[test]
    fn construction_failure_leaves_session_idle() {
        let (frame_tx, _frame_rx) = frame_channel();
        let session = DecoderSession::with_backend_factory(
            DecoderSessionConfig::default(),
            frame_tx,
            Box::new(|_| Err(DecoderError::SessionCreation("no hardware".into()))),
        );
        assert!(session.initialize(&bundle()).is_err());
        assert_eq!(session.state(), DecoderState::Idle);
    }
}
