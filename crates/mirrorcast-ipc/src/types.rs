//! Common types used across engine messages.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Video codec family carried by the elementary stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VideoCodec {
    /// H.264 / AVC.
    H264,

    /// H.265 / HEVC.
    H265,
}

impl VideoCodec {
    /// FourCC codec id as sent in the stream's codec metadata.
    pub fn fourcc(self) -> u32 {
        match self {
            Self::H264 => u32::from_be_bytes(*b"h264"),
            Self::H265 => u32::from_be_bytes(*b"h265"),
        }
    }

    /// Resolve a codec from its FourCC id.
    pub fn from_fourcc(id: u32) -> Option<Self> {
        if id == Self::H264.fourcc() {
            Some(Self::H264)
        } else if id == Self::H265.fourcc() {
            Some(Self::H265)
        } else {
            None
        }
    }
}

impl fmt::Display for VideoCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::H264 => write!(f, "h264"),
            Self::H265 => write!(f, "h265"),
        }
    }
}

/// Direction of the data tunnel through the device debug bridge.
///
/// Decided once per connect attempt: reverse is preferred (the device
/// connects out to the host), forward is the fallback (the host connects
/// in to a device-exposed socket).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TunnelMode {
    /// Device connects out to a listening host socket.
    Reverse,

    /// Host connects in to a socket forwarded from the device.
    Forward,
}

impl TunnelMode {
    /// Returns true for forward tunnels (used for the companion flag).
    pub fn is_forward(self) -> bool {
        matches!(self, Self::Forward)
    }
}

impl fmt::Display for TunnelMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Reverse => write!(f, "reverse"),
            Self::Forward => write!(f, "forward"),
        }
    }
}

/// Log level forwarded to the companion process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompanionLogLevel {
    Verbose,
    Debug,
    Info,
    Warn,
    Error,
}

impl fmt::Display for CompanionLogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Verbose => "verbose",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        };
        write!(f, "{s}")
    }
}

/// Configuration for a capture stream.
///
/// Optional limits are only forwarded to the companion when set; the
/// companion applies its own defaults otherwise.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamSettings {
    /// Video codec to request from the companion encoder.
    pub codec: VideoCodec,

    /// Maximum dimension of the streamed video in pixels.
    pub max_size: Option<u16>,

    /// Maximum capture frame rate.
    pub max_fps: Option<u16>,

    /// Video bitrate in bits per second.
    pub video_bit_rate: Option<u32>,

    /// Companion log level.
    pub log_level: CompanionLogLevel,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            codec: VideoCodec::H264,
            max_size: None,
            max_fps: None,
            video_bit_rate: None,
            log_level: CompanionLogLevel::Info,
        }
    }
}

/// Real-time stream statistics.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StreamStats {
    /// Decoded frames per second over the last reporting interval.
    pub fps: f32,

    /// Total frames decoded since capture start.
    pub frames_decoded: u64,

    /// Frames dropped by decoder backpressure.
    pub frames_dropped: u64,

    /// Per-unit decode failures (non-fatal).
    pub decode_errors: u64,

    /// Bytes received on the video socket.
    pub bytes_received: u64,

    /// Capture uptime in seconds.
    pub uptime_seconds: u64,
}
