//! Software H.264 decoding through openh264

use openh264::decoder::Decoder;
use openh264::formats::YUVSource;
use tracing::trace;

use super::{DecodeError, FrameDecoder, YuvPicture};

pub struct OpenH264Decoder {
    decoder: Decoder,
}

impl OpenH264Decoder {
    pub fn new() -> Result<Self, DecodeError> {
        let decoder = Decoder::new().map_err(|e| DecodeError::Init(e.to_string()))?;
        Ok(Self { decoder })
    }
}

impl FrameDecoder for OpenH264Decoder {
    fn decode(&mut self, payload: &[u8]) -> Result<Vec<YuvPicture>, DecodeError> {
        let decoded = self
            .decoder
            .decode(payload)
            .map_err(|e| DecodeError::Decode(e.to_string()))?;
        let Some(yuv) = decoded else {
            trace!("openh264 buffered {} bytes without output", payload.len());
            return Ok(Vec::new());
        };

        let (width, height) = yuv.dimensions();
        let (y_stride, u_stride, v_stride) = yuv.strides();
        let picture = YuvPicture {
            width: width as u32,
            height: height as u32,
            planes: [yuv.y().to_vec(), yuv.u().to_vec(), yuv.v().to_vec()],
            strides: [y_stride, u_stride, v_stride],
        };
        Ok(vec![picture])
    }

    fn name(&self) -> &'static str {
        "openh264"
    }
}
