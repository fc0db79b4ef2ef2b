//! Decode session orchestration over codec-specific backends.
//!
//! The platform decode API is abstracted behind [`DecodeBackend`];
//! [`DecoderSession`] owns the dedicated processing queue, backpressure,
//! and the generation token that keeps late completions from escaping a
//! stopped session.

mod error;
#[cfg(feature = "openh264-backend")]
mod openh264;
mod session;

pub use error::DecoderError;
#[cfg(feature = "openh264-backend")]
pub use crate::openh264::OpenH264Backend;
pub use session::{DecoderSession, DecoderSessionConfig, DecoderState};

use bytes::Bytes;
use crossbeam_channel::{Receiver, Sender};

use mirrorcast_stream::ParameterSetBundle;

/// Channel capacity for decoded frames handed to the compositor.
pub const FRAME_CHANNEL_CAPACITY: usize = 3;

/// Result type for decoder operations.
pub type DecoderResult<T> = Result<T, DecoderError>;

/// Factory producing a decode backend for a parameter-set bundle.
///
/// The default is [`create_decode_backend`]; platform ports and tests
/// substitute their own.
pub type BackendFactory =
    dyn Fn(&ParameterSetBundle) -> DecoderResult<Box<dyn DecodeBackend>> + Send + Sync;

/// A decoded image buffer ready for composition.
#[derive(Debug, Clone)]
pub struct DecodedFrame {
    /// Planar I420 pixel data.
    pub data: Bytes,

    /// Presentation width in pixels.
    pub width: u32,

    /// Presentation height in pixels.
    pub height: u32,

    /// Presentation timestamp in microseconds, when the stream carried one.
    pub pts_us: Option<u64>,
}

/// Creates a bounded decoded-frame channel.
pub fn frame_channel() -> (Sender<DecodedFrame>, Receiver<DecodedFrame>) {
    crossbeam_channel::bounded(FRAME_CHANNEL_CAPACITY)
}

/// A codec-specific decode backend.
///
/// Driven exclusively from the session's processing queue, so
/// implementations need `Send` but never `Sync`. `submit` receives
/// length-prefixed samples (4-byte big-endian length before each unit).
pub trait DecodeBackend: Send {
    /// Submit one coded unit; returns any frames completed by it.
    fn submit(&mut self, sample: &[u8], pts_us: Option<u64>)
        -> DecoderResult<Vec<DecodedFrame>>;

    /// Block until all in-flight work is complete, returning whatever
    /// the backend still held.
    fn flush(&mut self) -> DecoderResult<Vec<DecodedFrame>>;

    /// Backend name for diagnostics.
    fn name(&self) -> &'static str;
}

/// Create a decode backend for the given parameter sets.
#[cfg(feature = "openh264-backend")]
pub fn create_decode_backend(
    bundle: &ParameterSetBundle,
) -> DecoderResult<Box<dyn DecodeBackend>> {
    use mirrorcast_ipc::VideoCodec;

    match bundle.codec {
        VideoCodec::H264 => {
            let backend = OpenH264Backend::new(bundle)?;
            tracing::info!("Using OpenH264 decode backend");
            Ok(Box::new(backend))
        }
        VideoCodec::H265 => Err(DecoderError::SessionCreation(
            "no H.265 decode backend available on this platform".into(),
        )),
    }
}

/// Create a decode backend (stub when no backend feature is enabled).
#[cfg(not(feature = "openh264-backend"))]
pub fn create_decode_backend(
    _bundle: &ParameterSetBundle,
) -> DecoderResult<Box<dyn DecodeBackend>> {
    Err(DecoderError::SessionCreation(
        "no decode backend compiled in".into(),
    ))
}
