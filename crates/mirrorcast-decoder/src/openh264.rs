//! OpenH264 software decode backend.

use bytes::{Bytes, BytesMut};
use openh264::decoder::Decoder;
use openh264::formats::YUVSource;
use tracing::{debug, trace};

use mirrorcast_ipc::VideoCodec;
use mirrorcast_stream::ParameterSetBundle;

use crate::error::DecoderError;
use crate::{DecodeBackend, DecodedFrame, DecoderResult};

const START_CODE: [u8; 4] = [0, 0, 0, 1];

/// H.264 decode backend over the OpenH264 reference decoder.
pub struct OpenH264Backend {
    decoder: Decoder,
    frame_count: u64,
}

impl OpenH264Backend {
    /// Build a decoder primed with the bundle's parameter sets.
    pub fn new(bundle: &ParameterSetBundle) -> DecoderResult<Self> {
        if bundle.codec != VideoCodec::H264 {
            return Err(DecoderError::FormatDescription(format!(
                "OpenH264 cannot decode {}",
                bundle.codec
            )));
        }

        let mut decoder = Decoder::new()
            .map_err(|e| DecoderError::SessionCreation(format!("OpenH264 init failed: {e}")))?;

        // Feed SPS and PPS up front so the first key frame decodes
        // without waiting for in-band parameter sets.
        let mut config = BytesMut::new();
        config.extend_from_slice(&START_CODE);
        config.extend_from_slice(&bundle.sps);
        config.extend_from_slice(&START_CODE);
        config.extend_from_slice(&bundle.pps);

        decoder
            .decode(&config)
            .map_err(|e| DecoderError::FormatDescription(format!("parameter sets rejected: {e}")))?;

        debug!(
            sps_len = bundle.sps.len(),
            pps_len = bundle.pps.len(),
            "OpenH264 decoder primed"
        );

        Ok(Self {
            decoder,
            frame_count: 0,
        })
    }
}

impl DecodeBackend for OpenH264Backend {
    fn submit(
        &mut self,
        sample: &[u8],
        pts_us: Option<u64>,
    ) -> DecoderResult<Vec<DecodedFrame>> {
        let annex_b = length_prefixed_to_annex_b(sample)?;

        match self.decoder.decode(&annex_b) {
            Ok(Some(yuv)) => {
                self.frame_count += 1;
                trace!(frame = self.frame_count, "Picture decoded");
                Ok(vec![frame_from_yuv(&yuv, pts_us)])
            }
            // The decoder consumed the unit without completing a picture.
            Ok(None) => Ok(Vec::new()),
            Err(e) => Err(DecoderError::Decode(format!("OpenH264 decode failed: {e}"))),
        }
    }

    fn flush(&mut self) -> DecoderResult<Vec<DecodedFrame>> {
        // The decoder runs without picture reordering; every completed
        // picture is returned at submit time, so there is nothing buffered.
        Ok(Vec::new())
    }

    fn name(&self) -> &'static str {
        "openh264"
    }
}

/// Convert a 4-byte length-prefixed sample back to Annex B for OpenH264.
fn length_prefixed_to_annex_b(sample: &[u8]) -> DecoderResult<Bytes> {
    let mut out = BytesMut::with_capacity(sample.len());
    let mut rest = sample;

    while !rest.is_empty() {
        if rest.len() < 4 {
            return Err(DecoderError::Decode("truncated length prefix".into()));
        }
        let len = u32::from_be_bytes([rest[0], rest[1], rest[2], rest[3]]) as usize;
        rest = &rest[4..];
        if rest.len() < len {
            return Err(DecoderError::Decode(format!(
                "unit length {len} exceeds sample ({} bytes left)",
                rest.len()
            )));
        }
        out.extend_from_slice(&START_CODE);
        out.extend_from_slice(&rest[..len]);
        rest = &rest[len..];
    }

    Ok(out.freeze())
}

/// Copy the decoder-owned YUV planes into a contiguous I420 buffer.
fn frame_from_yuv<S: YUVSource>(yuv: &S, pts_us: Option<u64>) -> DecodedFrame {
    let (width, height) = yuv.dimensions();
    let (stride_y, stride_u, stride_v) = yuv.strides();

    let mut data = BytesMut::with_capacity(width * height * 3 / 2);
    for row in 0..height {
        data.extend_from_slice(&yuv.y()[row * stride_y..row * stride_y + width]);
    }
    let chroma_width = width / 2;
    for row in 0..height / 2 {
        data.extend_from_slice(&yuv.u()[row * stride_u..row * stride_u + chroma_width]);
    }
    for row in 0..height / 2 {
        data.extend_from_slice(&yuv.v()[row * stride_v..row * stride_v + chroma_width]);
    }

    DecodedFrame {
        data: data.freeze(),
        width: width as u32,
        height: height as u32,
        pts_us,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_h265_bundles() {
        let bundle = ParameterSetBundle {
            codec: VideoCodec::H265,
            vps: Some(Bytes::from_static(&[0x40, 0x01])),
            sps: Bytes::from_static(&[0x42, 0x01]),
            pps: Bytes::from_static(&[0x44, 0x01]),
        };
        assert!(matches!(
            OpenH264Backend::new(&bundle),
            Err(DecoderError::FormatDescription(_))
        ));
    }

    #[test]
    fn length_prefix_conversion() {
        let sample = [0, 0, 0, 2, 0x65, 0x88, 0, 0, 0, 1, 0x41];
        let annex_b = length_prefixed_to_annex_b(&sample).unwrap();
        assert_eq!(
            annex_b.as_ref(),
            &[0, 0, 0, 1, 0x65, 0x88, 0, 0, 0, 1, 0x41]
        );
    }

    #[test]
    fn truncated_sample_is_an_error() {
        assert!(length_prefixed_to_annex_b(&[0, 0, 0, 9, 0x65]).is_err());
        assert!(length_prefixed_to_annex_b(&[0, 0]).is_err());
    }
}
