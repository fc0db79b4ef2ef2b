//! Stream preamble and frame demuxing.
//!
//! With metadata enabled, the companion's video socket carries, in order:
//! a single dummy byte (forward tunnels only), a 64-byte NUL-padded
//! device name, a codec header (FourCC id, width, height, big-endian),
//! and then framed packets, each prefixed with a 12-byte header: a u64
//! PTS-and-flags word (bit 63 = config packet, bit 62 = key frame) and a
//! u32 payload length. Packet payloads are raw Annex B fragments handed
//! to the elementary stream parser.

use bytes::{Buf, Bytes, BytesMut};
use tracing::{debug, trace};

use mirrorcast_ipc::{TunnelMode, VideoCodec};

use crate::error::StreamError;
use crate::StreamResult;

/// Length of the NUL-padded device name field.
pub const DEVICE_NAME_LEN: usize = 64;

const CODEC_HEADER_LEN: usize = 12;
const FRAME_HEADER_LEN: usize = 12;

const PACKET_FLAG_CONFIG: u64 = 1 << 63;
const PACKET_FLAG_KEY_FRAME: u64 = 1 << 62;
const PACKET_PTS_MASK: u64 = PACKET_FLAG_KEY_FRAME - 1;

/// Upper bound on a sane packet payload; larger lengths mean the stream
/// framing has desynchronized.
const MAX_PACKET_LEN: usize = 1 << 26;

/// One framed video packet.
#[derive(Debug, Clone)]
pub struct VideoPacket {
    /// Presentation timestamp in microseconds; absent on config packets.
    pub pts_us: Option<u64>,

    /// Carries parameter sets rather than a picture.
    pub is_config: bool,

    /// The companion flagged this packet as a key frame.
    pub is_key_frame: bool,

    /// Raw Annex B payload.
    pub payload: Bytes,
}

/// Events produced while demuxing the stream.
#[derive(Debug, Clone)]
pub enum DemuxEvent {
    /// Device metadata from the stream preamble.
    DeviceMeta {
        /// Device name as reported by the companion.
        name: String,
    },

    /// Codec metadata from the stream preamble.
    CodecMeta {
        /// Negotiated codec.
        codec: VideoCodec,
        /// Initial video width in pixels.
        width: u32,
        /// Initial video height in pixels.
        height: u32,
    },

    /// A complete framed packet.
    Packet(VideoPacket),
}

enum Stage {
    DummyByte,
    DeviceName,
    CodecHeader,
    FrameHeader,
    FramePayload {
        pts_us: Option<u64>,
        is_config: bool,
        is_key_frame: bool,
        len: usize,
    },
}

/// Incremental demuxer for the companion's video socket bytes.
///
/// Tolerates arbitrary chunk boundaries; incomplete fields are retained
/// until the remaining bytes arrive.
pub struct FrameDemuxer {
    stage: Stage,
    buffer: BytesMut,
}

impl FrameDemuxer {
    /// Create a demuxer for a tunnel of the given mode.
    ///
    /// Forward tunnels start with the companion's dummy byte, emitted so
    /// a dead forward socket fails the first read instead of hanging.
    pub fn new(mode: TunnelMode) -> Self {
        let stage = match mode {
            TunnelMode::Forward => Stage::DummyByte,
            TunnelMode::Reverse => Stage::DeviceName,
        };
        Self {
            stage,
            buffer: BytesMut::new(),
        }
    }

    /// Feed raw socket bytes, yielding all events completed by them.
    pub fn push(&mut self, data: &[u8]) -> StreamResult<Vec<DemuxEvent>> {
        self.buffer.extend_from_slice(data);
        let mut events = Vec::new();

        loop {
            match self.stage {
                Stage::DummyByte => {
                    if self.buffer.is_empty() {
                        break;
                    }
                    let byte = self.buffer.get_u8();
                    trace!(byte, "Consumed forward-tunnel dummy byte");
                    self.stage = Stage::DeviceName;
                }
                Stage::DeviceName => {
                    if self.buffer.len() < DEVICE_NAME_LEN {
                        break;
                    }
                    let raw = self.buffer.split_to(DEVICE_NAME_LEN);
                    let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
                    let name = String::from_utf8_lossy(&raw[..end]).into_owned();
                    debug!(name = %name, "Device metadata received");
                    events.push(DemuxEvent::DeviceMeta { name });
                    self.stage = Stage::CodecHeader;
                }
                Stage::CodecHeader => {
                    if self.buffer.len() < CODEC_HEADER_LEN {
                        break;
                    }
                    let id = self.buffer.get_u32();
                    let width = self.buffer.get_u32();
                    let height = self.buffer.get_u32();
                    let codec = VideoCodec::from_fourcc(id).ok_or_else(|| {
                        StreamError::Protocol(format!("unknown codec id {id:#010x}"))
                    })?;
                    debug!(%codec, width, height, "Codec metadata received");
                    events.push(DemuxEvent::CodecMeta {
                        codec,
                        width,
                        height,
                    });
                    self.stage = Stage::FrameHeader;
                }
                Stage::FrameHeader => {
                    if self.buffer.len() < FRAME_HEADER_LEN {
                        break;
                    }
                    let pts_flags = self.buffer.get_u64();
                    let len = self.buffer.get_u32() as usize;
                    if len == 0 || len > MAX_PACKET_LEN {
                        return Err(StreamError::Protocol(format!(
                            "implausible packet length {len}"
                        )));
                    }
                    let is_config = pts_flags & PACKET_FLAG_CONFIG != 0;
                    self.stage = Stage::FramePayload {
                        pts_us: (!is_config).then_some(pts_flags & PACKET_PTS_MASK),
                        is_config,
                        is_key_frame: pts_flags & PACKET_FLAG_KEY_FRAME != 0,
                        len,
                    };
                }
                Stage::FramePayload {
                    pts_us,
                    is_config,
                    is_key_frame,
                    len,
                } => {
                    if self.buffer.len() < len {
                        break;
                    }
                    let payload = self.buffer.split_to(len).freeze();
                    events.push(DemuxEvent::Packet(VideoPacket {
                        pts_us,
                        is_config,
                        is_key_frame,
                        payload,
                    }));
                    self.stage = Stage::FrameHeader;
                }
            }
        }

        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn preamble(codec: VideoCodec, width: u32, height: u32) -> Vec<u8> {
        let mut data = Vec::new();
        let mut name = [0u8; DEVICE_NAME_LEN];
        name[..7].copy_from_slice(b"Pixel 8");
        data.extend_from_slice(&name);
        data.extend_from_slice(&codec.fourcc().to_be_bytes());
        data.extend_from_slice(&width.to_be_bytes());
        data.extend_from_slice(&height.to_be_bytes());
        data
    }

    fn packet(pts_flags: u64, payload: &[u8]) -> Vec<u8> {
        let mut data = Vec::new();
        data.extend_from_slice(&pts_flags.to_be_bytes());
        data.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        data.extend_from_slice(payload);
        data
    }

    #[test]
    fn demuxes_preamble_and_packets() {
        let mut stream = preamble(VideoCodec::H264, 1080, 2400);
        stream.extend(packet(PACKET_FLAG_CONFIG, &[0, 0, 0, 1, 0x67]));
        stream.extend(packet(PACKET_FLAG_KEY_FRAME | 40_000, &[0, 0, 0, 1, 0x65]));
        stream.extend(packet(80_000, &[0, 0, 0, 1, 0x41]));

        let mut demuxer = FrameDemuxer::new(TunnelMode::Reverse);
        let events = demuxer.push(&stream).unwrap();
        assert_eq!(events.len(), 5);

        match &events[0] {
            DemuxEvent::DeviceMeta { name } => assert_eq!(name, "Pixel 8"),
            other => panic!("unexpected event: {other:?}"),
        }
        match &events[1] {
            DemuxEvent::CodecMeta {
                codec,
                width,
                height,
            } => {
                assert_eq!(*codec, VideoCodec::H264);
                assert_eq!((*width, *height), (1080, 2400));
            }
            other => panic!("unexpected event: {other:?}"),
        }
        match &events[2] {
            DemuxEvent::Packet(p) => {
                assert!(p.is_config);
                assert_eq!(p.pts_us, None);
            }
            other => panic!("unexpected event: {other:?}"),
        }
        match &events[3] {
            DemuxEvent::Packet(p) => {
                assert!(p.is_key_frame);
                assert_eq!(p.pts_us, Some(40_000));
            }
            other => panic!("unexpected event: {other:?}"),
        }
        match &events[4] {
            DemuxEvent::Packet(p) => {
                assert!(!p.is_key_frame && !p.is_config);
                assert_eq!(p.pts_us, Some(80_000));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn forward_mode_consumes_dummy_byte() {
        let mut stream = vec![0u8];
        stream.extend(preamble(VideoCodec::H265, 720, 1600));

        let mut demuxer = FrameDemuxer::new(TunnelMode::Forward);
        let events = demuxer.push(&stream).unwrap();
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], DemuxEvent::DeviceMeta { .. }));
    }

    #[test]
    fn byte_at_a_time_matches_whole_stream() {
        let mut stream = preamble(VideoCodec::H264, 640, 480);
        stream.extend(packet(PACKET_FLAG_KEY_FRAME | 1, &[1, 2, 3, 4, 5, 6]));
        stream.extend(packet(2, &[7, 8]));

        let mut whole = FrameDemuxer::new(TunnelMode::Reverse);
        let expected = whole.push(&stream).unwrap();

        let mut demuxer = FrameDemuxer::new(TunnelMode::Reverse);
        let mut events = Vec::new();
        for byte in &stream {
            events.extend(demuxer.push(std::slice::from_ref(byte)).unwrap());
        }

        assert_eq!(events.len(), expected.len());
        for (a, b) in events.iter().zip(expected.iter()) {
            if let (DemuxEvent::Packet(a), DemuxEvent::Packet(b)) = (a, b) {
                assert_eq!(a.payload, b.payload);
                assert_eq!(a.pts_us, b.pts_us);
            }
        }
    }

    #[test]
    fn unknown_codec_id_is_a_protocol_error() {
        let mut stream = Vec::new();
        stream.extend_from_slice(&[0u8; DEVICE_NAME_LEN]);
        stream.extend_from_slice(&u32::from_be_bytes(*b"av01").to_be_bytes());
        stream.extend_from_slice(&[0u8; 8]);

        let mut demuxer = FrameDemuxer::new(TunnelMode::Reverse);
        let err = demuxer.push(&stream).unwrap_err();
        assert!(matches!(err, StreamError::Protocol(_)));
    }
}
