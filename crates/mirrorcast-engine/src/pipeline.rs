//! The capture data pipeline.
//!
//! Two threads run per capture: the feed loop (socket bytes → demuxer →
//! parser → decoder) and the frame forwarder (decoder output → external
//! frame channel, gated by the pause flag). The feed loop is the single
//! delivery path into the parser, so the parser needs no locking.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender};
use parking_lot::RwLock;
use tracing::{debug, info, trace, warn};

use mirrorcast_decoder::{DecodedFrame, DecoderSession, DecoderState};
use mirrorcast_ipc::{
    ConnectionState, SessionError, SessionErrorKind, SessionEvent, StreamStats, TunnelMode,
    VideoCodec,
};
use mirrorcast_stream::{DemuxEvent, ElementaryStreamParser, FrameDemuxer, SocketEvent};

use crate::session::transition_to;
use crate::stats::StatsCollector;

/// Poll interval for the stop flag on otherwise-blocking receives.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Cadence of statistics events.
const STATS_INTERVAL: Duration = Duration::from_secs(1);

/// Everything the feed loop needs, moved onto its thread.
pub(crate) struct FeedContext {
    pub socket_rx: Receiver<SocketEvent>,
    pub decoder: Arc<DecoderSession>,
    pub mode: TunnelMode,
    pub codec: VideoCodec,
    pub stop_requested: Arc<AtomicBool>,
    pub state: Arc<RwLock<ConnectionState>>,
    pub event_tx: Sender<SessionEvent>,
    pub stats: Arc<StatsCollector>,
    pub bytes_received: Arc<AtomicU64>,
}

/// Feed loop: drains the socket and drives parse + decode.
pub(crate) fn feed_loop(ctx: FeedContext) {
    debug!("Feed loop starting");

    let mut demuxer = FrameDemuxer::new(ctx.mode);
    let mut parser = ElementaryStreamParser::new(ctx.codec);
    let mut last_stats = Instant::now();

    loop {
        if ctx.stop_requested.load(Ordering::SeqCst) {
            break;
        }

        if last_stats.elapsed() >= STATS_INTERVAL {
            emit_stats(&ctx);
            last_stats = Instant::now();
        }

        match ctx.socket_rx.recv_timeout(POLL_INTERVAL) {
            Ok(SocketEvent::Data(chunk)) => match demuxer.push(&chunk) {
                Ok(events) => {
                    for event in events {
                        handle_demux_event(event, &mut parser, &ctx);
                    }
                }
                Err(e) => {
                    warn!(error = %e, "Stream framing desynchronized");
                    fail(
                        &ctx,
                        SessionError::new(SessionErrorKind::Internal, e.to_string()),
                    );
                    break;
                }
            },
            Ok(SocketEvent::Closed) => {
                if !ctx.stop_requested.load(Ordering::SeqCst) {
                    // The data stream dying without a requested stop means
                    // the companion is gone; the process monitor usually
                    // confirms moments later.
                    fail(
                        &ctx,
                        SessionError::new(
                            SessionErrorKind::ProcessTerminated,
                            "video stream ended unexpectedly",
                        ),
                    );
                }
                break;
            }
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => continue,
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => {
                debug!("Socket channel disconnected");
                break;
            }
        }
    }

    debug!("Feed loop stopped");
}

fn handle_demux_event(
    event: DemuxEvent,
    parser: &mut ElementaryStreamParser,
    ctx: &FeedContext,
) {
    match event {
        DemuxEvent::DeviceMeta { name } => {
            info!(device = %name, "Streaming from device");
        }
        DemuxEvent::CodecMeta {
            codec,
            width,
            height,
        } => {
            info!(%codec, width, height, "Stream codec announced");
            if codec != parser.codec() {
                warn!(
                    requested = %parser.codec(),
                    announced = %codec,
                    "Companion announced a different codec than requested"
                );
            }
        }
        DemuxEvent::Packet(packet) => {
            let mut output = parser.append(&packet.payload);
            // The frame header delimits the packet, so the trailing unit
            // is known complete.
            let tail = parser.flush();
            output.units.extend(tail.units);
            output.reconfigured |= tail.reconfigured;

            if output.reconfigured && !matches!(ctx.decoder.state(), DecoderState::Idle) {
                info!("Parameter sets changed mid-stream, rebuilding decoder");
                ctx.decoder.reset();
            }

            // Build the decode session as soon as a complete bundle is
            // held, so the first key frame is never gated on it.
            if matches!(ctx.decoder.state(), DecoderState::Idle) {
                if let Some(bundle) = parser.bundle() {
                    if let Err(e) = ctx.decoder.initialize(bundle) {
                        let kind = match e {
                            mirrorcast_decoder::DecoderError::FormatDescription(_) => {
                                SessionErrorKind::FormatDescription
                            }
                            _ => SessionErrorKind::SessionCreation,
                        };
                        // Not fatal: a fresh bundle may arrive and the
                        // next initialize can succeed.
                        let _ = ctx
                            .event_tx
                            .try_send(SessionEvent::Error(SessionError::new(kind, e.to_string())));
                    }
                }
            }

            for unit in output.units {
                if unit.kind.is_parameter_set() {
                    continue;
                }

                if matches!(ctx.decoder.state(), DecoderState::Idle) {
                    // No decode session yet; frames that precede the
                    // parameter sets cannot be decoded.
                    trace!("Dropping unit with no decode session");
                    continue;
                }

                if let Err(e) = ctx.decoder.decode(&unit, packet.pts_us) {
                    trace!(error = %e, "Unit not submitted");
                }
            }
        }
    }
}

fn emit_stats(ctx: &FeedContext) {
    let frames_decoded = ctx.decoder.frames_decoded();
    let snapshot: StreamStats = ctx.stats.snapshot(
        frames_decoded,
        ctx.decoder.frames_dropped(),
        ctx.decoder.decode_errors(),
        ctx.bytes_received.load(Ordering::Relaxed),
    );
    let _ = ctx.event_tx.try_send(SessionEvent::Stats(snapshot));
    ctx.stats.mark_reported(frames_decoded);
}

fn fail(ctx: &FeedContext, error: SessionError) {
    let _ = ctx
        .event_tx
        .try_send(SessionEvent::Error(error.clone()));
    transition_to(&ctx.state, &ctx.event_tx, ConnectionState::Error { error });
}

/// Frame forwarder: decoder output → external frame channel.
///
/// Paused sessions keep decoding (the decoder must stay in sync with the
/// stream) but frames are discarded here instead of emitted.
pub(crate) fn forward_loop(
    frame_rx: Receiver<DecodedFrame>,
    frame_tx: Sender<DecodedFrame>,
    paused: Arc<AtomicBool>,
    stop_requested: Arc<AtomicBool>,
) {
    debug!("Frame forwarder starting");

    loop {
        if stop_requested.load(Ordering::SeqCst) {
            break;
        }

        match frame_rx.recv_timeout(POLL_INTERVAL) {
            Ok(frame) => {
                if paused.load(Ordering::SeqCst) {
                    continue;
                }
                if frame_tx.try_send(frame).is_err() {
                    trace!("Compositor lagging, frame discarded");
                }
            }
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => continue,
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => break,
        }
    }

    debug!("Frame forwarder stopped");
}
