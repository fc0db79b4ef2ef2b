//! Elementary stream parsing.
//!
//! The companion emits a raw Annex B elementary stream: coded units
//! separated by 3-byte (0x000001) or 4-byte (0x00000001) start codes.
//! [`ElementaryStreamParser`] splits arbitrarily chunked byte input into
//! complete units, classifies them per codec, and tracks the current
//! parameter-set bundle so callers can gate decoder construction.

use bytes::{Bytes, BytesMut};
use tracing::{debug, trace};

use mirrorcast_ipc::VideoCodec;

/// Kind of parameter set carried by a coded unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParameterSetKind {
    /// Video parameter set (H.265 only).
    Vps,
    /// Sequence parameter set.
    Sps,
    /// Picture parameter set.
    Pps,
}

/// Classification of a coded unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodedUnitKind {
    /// Codec configuration data.
    ParameterSet(ParameterSetKind),
    /// Self-contained decodable picture.
    KeyFrame,
    /// Picture dependent on prior pictures.
    DeltaFrame,
}

impl CodedUnitKind {
    /// Returns true for parameter-set units.
    pub fn is_parameter_set(&self) -> bool {
        matches!(self, Self::ParameterSet(_))
    }

    /// Returns true for key frames.
    pub fn is_key_frame(&self) -> bool {
        matches!(self, Self::KeyFrame)
    }
}

/// A single coded video unit, start code stripped.
#[derive(Debug, Clone)]
pub struct CodedUnit {
    /// Unit classification.
    pub kind: CodedUnitKind,
    /// Unit data including the unit header byte(s), excluding the start code.
    pub payload: Bytes,
}

/// The latest complete set of codec configuration units.
///
/// Persists until superseded by a differing bundle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParameterSetBundle {
    /// Codec the parameter sets belong to.
    pub codec: VideoCodec,
    /// Video parameter set, required for H.265.
    pub vps: Option<Bytes>,
    /// Sequence parameter set.
    pub sps: Bytes,
    /// Picture parameter set.
    pub pps: Bytes,
}

/// Units emitted by one parse iteration, plus whether the parameter-set
/// bundle changed during it.
#[derive(Debug, Default)]
pub struct ParserOutput {
    /// Complete units in bitstream order.
    pub units: Vec<CodedUnit>,
    /// True when an arriving parameter set produced a bundle differing
    /// from the one previously held.
    pub reconfigured: bool,
}

/// Incremental Annex B elementary stream parser.
pub struct ElementaryStreamParser {
    codec: VideoCodec,
    buffer: BytesMut,
    pending_vps: Option<Bytes>,
    pending_sps: Option<Bytes>,
    pending_pps: Option<Bytes>,
    bundle: Option<ParameterSetBundle>,
}

impl ElementaryStreamParser {
    /// Create a parser for the given codec.
    pub fn new(codec: VideoCodec) -> Self {
        Self {
            codec,
            buffer: BytesMut::new(),
            pending_vps: None,
            pending_sps: None,
            pending_pps: None,
            bundle: None,
        }
    }

    /// Codec this parser classifies for.
    pub fn codec(&self) -> VideoCodec {
        self.codec
    }

    /// Append raw bytes and emit all units completed by them.
    ///
    /// A unit is complete once the start code of its successor has been
    /// seen; the trailing open unit is retained for the next call, so
    /// payloads are identical regardless of how the stream is chunked.
    pub fn append(&mut self, data: &[u8]) -> ParserOutput {
        self.buffer.extend_from_slice(data);
        let mut out = ParserOutput::default();

        loop {
            let Some((start, prefix)) = find_start_code(&self.buffer, 0) else {
                // No unit can begin before a start code; retain only the
                // bytes that could still be a split start-code prefix.
                if self.buffer.len() > 3 {
                    let tail = self.buffer.split_off(self.buffer.len() - 3);
                    self.buffer = tail;
                }
                break;
            };

            if start > 0 {
                trace!(skipped = start, "Skipping bytes before first start code");
                let _ = self.buffer.split_to(start);
            }

            // Buffer now begins with a start code of length `prefix`.
            let Some((next, _)) = find_start_code(&self.buffer, prefix) else {
                break;
            };

            let raw = self.buffer.split_to(next).freeze();
            let payload = raw.slice(prefix..);
            self.ingest(payload, &mut out);
        }

        out
    }

    /// Emit the retained trailing unit as complete.
    ///
    /// Called at packet or stream boundaries, where the framing layer
    /// guarantees no further bytes belong to the open unit.
    pub fn flush(&mut self) -> ParserOutput {
        let mut out = ParserOutput::default();
        if let Some((start, prefix)) = find_start_code(&self.buffer, 0) {
            let raw = self.buffer.split_off(0).freeze();
            let payload = raw.slice(start + prefix..);
            self.ingest(payload, &mut out);
        }
        self.buffer.clear();
        out
    }

    /// Whether a complete parameter-set bundle has been observed.
    pub fn bundle(&self) -> Option<&ParameterSetBundle> {
        self.bundle.as_ref()
    }

    /// Clear all accumulated state (partial buffers, parameter sets).
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.pending_vps = None;
        self.pending_sps = None;
        self.pending_pps = None;
        self.bundle = None;
    }

    fn ingest(&mut self, payload: Bytes, out: &mut ParserOutput) {
        if payload.is_empty() {
            return;
        }

        let kind = classify(self.codec, payload[0]);

        if let CodedUnitKind::ParameterSet(ps) = kind {
            match ps {
                ParameterSetKind::Vps => self.pending_vps = Some(payload.clone()),
                ParameterSetKind::Sps => self.pending_sps = Some(payload.clone()),
                ParameterSetKind::Pps => self.pending_pps = Some(payload.clone()),
            }
            if let Some(candidate) = self.complete_bundle() {
                match &self.bundle {
                    Some(held) if *held == candidate => {}
                    Some(_) => {
                        debug!(codec = %self.codec, "Parameter sets changed");
                        out.reconfigured = true;
                        self.bundle = Some(candidate);
                    }
                    None => {
                        debug!(codec = %self.codec, "Parameter sets complete");
                        self.bundle = Some(candidate);
                    }
                }
            }
        }

        out.units.push(CodedUnit { kind, payload });
    }

    fn complete_bundle(&self) -> Option<ParameterSetBundle> {
        let sps = self.pending_sps.clone()?;
        let pps = self.pending_pps.clone()?;
        if self.codec == VideoCodec::H265 && self.pending_vps.is_none() {
            return None;
        }
        Some(ParameterSetBundle {
            codec: self.codec,
            vps: self.pending_vps.clone(),
            sps,
            pps,
        })
    }
}

/// Find the next start code at or after `from`.
///
/// Returns the start-code position and its length (3 or 4). A 4-byte
/// code is reported at its leading zero so the preceding unit does not
/// absorb it.
fn find_start_code(data: &[u8], from: usize) -> Option<(usize, usize)> {
    let mut i = from;
    while i + 2 < data.len() {
        if data[i] == 0 && data[i + 1] == 0 {
            if data[i + 2] == 1 {
                return Some((i, 3));
            }
            if data[i + 2] == 0 && i + 3 < data.len() && data[i + 3] == 1 {
                return Some((i, 4));
            }
        }
        i += 1;
    }
    None
}

/// Classify a unit from its header byte per codec specification.
fn classify(codec: VideoCodec, header: u8) -> CodedUnitKind {
    match codec {
        VideoCodec::H264 => match header & 0x1F {
            7 => CodedUnitKind::ParameterSet(ParameterSetKind::Sps),
            8 => CodedUnitKind::ParameterSet(ParameterSetKind::Pps),
            5 => CodedUnitKind::KeyFrame,
            _ => CodedUnitKind::DeltaFrame,
        },
        VideoCodec::H265 => match (header >> 1) & 0x3F {
            32 => CodedUnitKind::ParameterSet(ParameterSetKind::Vps),
            33 => CodedUnitKind::ParameterSet(ParameterSetKind::Sps),
            34 => CodedUnitKind::ParameterSet(ParameterSetKind::Pps),
            // IRAP pictures (BLA/IDR/CRA) are all safe decode entry points.
            16..=23 => CodedUnitKind::KeyFrame,
            _ => CodedUnitKind::DeltaFrame,
        },
    }
}
