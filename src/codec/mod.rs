//! Codec dispatch: four-character tag → lazily created decoder → I420
//! frames in the output geometry.

#[cfg(feature = "h264")]
pub mod h264;
#[cfg(feature = "vpx")]
pub mod vpx;

use std::fmt;

use once_cell::unsync::OnceCell;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::roundtrip::CompressedReply;
use crate::source::{Geometry, PlanarFrame};
use crate::yuv;
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Codec {
    H264,
    Vp8,
    Vp9,
}

impl Codec {
    pub fn from_fourcc(tag: &str) -> Option<Self> {
        match tag {
            "h264" => Some(Self::H264),
            "VP80" => Some(Self::Vp8),
            "VP90" => Some(Self::Vp9),
            _ => None,
        }
    }

    pub fn fourcc(self) -> &'static str {
        match self {
            Self::H264 => "h264",
            Self::Vp8 => "VP80",
            Self::Vp9 => "VP90",
        }
    }
}

impl fmt::Display for Codec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.fourcc())
    }
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("decoder initialization failed: {0}")]
    Init(String),
    #[error("support for {0} was not compiled in")]
    Unsupported(Codec),
    #[error("decoding failed: {0}")]
    Decode(String),
    #[error("decoded picture is malformed: {0}")]
    Malformed(String),
}

/// Decoder output before normalization. Planes may carry row padding.
#[derive(Debug, Clone)]
pub struct YuvPicture {
    pub width: u32,
    pub height: u32,
    pub planes: [Vec<u8>; 3],
    pub strides: [usize; 3],
}

impl YuvPicture {
    /// Picture from a tightly packed I420 buffer
    pub fn from_i420(width: u32, height: u32, data: &[u8]) -> std::result::Result<Self, DecodeError> {
        let (w, h) = (width as usize, height as usize);
        let (cw, ch) = (w.div_ceil(2), h.div_ceil(2));
        let (luma, chroma) = (w * h, cw * ch);
        if data.len() < luma + 2 * chroma {
            return Err(DecodeError::Malformed(format!(
                "{} bytes cannot hold a {}x{} I420 picture",
                data.len(),
                width,
                height
            )));
        }
        Ok(Self {
            width,
            height,
            planes: [
                data[..luma].to_vec(),
                data[luma..luma + chroma].to_vec(),
                data[luma + chroma..luma + 2 * chroma].to_vec(),
            ],
            strides: [w, cw, cw],
        })
    }

    fn plane_size(&self, plane: usize) -> (usize, usize) {
        let (w, h) = (self.width as usize, self.height as usize);
        if plane == 0 {
            (w, h)
        } else {
            (w.div_ceil(2), h.div_ceil(2))
        }
    }

    fn validate(&self) -> std::result::Result<(), DecodeError> {
        if self.width == 0 || self.height == 0 {
            return Err(DecodeError::Malformed("empty picture".into()));
        }
        for plane in 0..3 {
            let (width, height) = self.plane_size(plane);
            let stride = self.strides[plane];
            let needed = stride * (height - 1) + width;
            if stride < width || self.planes[plane].len() < needed {
                return Err(DecodeError::Malformed(format!(
                    "plane {} has {} bytes with stride {}, {}x{} samples needed",
                    plane,
                    self.planes[plane].len(),
                    stride,
                    width,
                    height
                )));
            }
        }
        Ok(())
    }

    /// Copy (or resample, if the size differs) into `geometry`
    pub fn normalize(&self, geometry: Geometry) -> std::result::Result<PlanarFrame, DecodeError> {
        self.validate()?;
        let mut frame = PlanarFrame::new(geometry.width, geometry.height)
            .map_err(|e| DecodeError::Malformed(e.to_string()))?;
        let same_size = (self.width, self.height) == (geometry.width, geometry.height);
        if !same_size {
            debug!(
                "Resampling decoded {}x{} picture to {}x{}",
                self.width, self.height, geometry.width, geometry.height
            );
        }

        let targets = [
            (geometry.width as usize, geometry.height as usize),
            (geometry.width as usize / 2, geometry.height as usize / 2),
            (geometry.width as usize / 2, geometry.height as usize / 2),
        ];
        let (y, u, v) = frame.planes_mut();
        for (plane, dst) in [y, u, v].into_iter().enumerate() {
            let (src_width, src_height) = self.plane_size(plane);
            let (dst_width, dst_height) = targets[plane];
            let src = &self.planes[plane];
            let stride = self.strides[plane];
            if same_size {
                yuv::copy_plane(src, stride, dst, dst_width, dst_width, dst_height);
            } else {
                yuv::scale_plane(src, stride, src_width, src_height, dst, dst_width, dst_height);
            }
        }
        Ok(frame)
    }
}

pub trait FrameDecoder {
    /// Feed one compressed payload. A decoder may hold frames back, so the
    /// result can be empty or carry several pictures.
    fn decode(&mut self, payload: &[u8]) -> std::result::Result<Vec<YuvPicture>, DecodeError>;

    fn name(&self) -> &'static str;
}

/// Creates the decoder for a codec the first time it shows up
pub trait DecoderFactory {
    fn create(&self, codec: Codec) -> std::result::Result<Box<dyn FrameDecoder>, DecodeError>;
}

impl<F> DecoderFactory for F
where
    F: Fn(Codec) -> std::result::Result<Box<dyn FrameDecoder>, DecodeError>,
{
    fn create(&self, codec: Codec) -> std::result::Result<Box<dyn FrameDecoder>, DecodeError> {
        self(codec)
    }
}

/// Decoders compiled into this build
#[derive(Debug, Default, Clone, Copy)]
pub struct NativeDecoders;

impl DecoderFactory for NativeDecoders {
    fn create(&self, codec: Codec) -> std::result::Result<Box<dyn FrameDecoder>, DecodeError> {
        match codec {
            #[cfg(feature = "h264")]
            Codec::H264 => Ok(Box::new(h264::OpenH264Decoder::new()?)),
            #[cfg(feature = "vpx")]
            Codec::Vp8 | Codec::Vp9 => Ok(Box::new(vpx::VpxDecoder::new(codec)?)),
            #[allow(unreachable_patterns)]
            other => Err(DecodeError::Unsupported(other)),
        }
    }
}

/// Routes replies to one decoder per codec, each created at most once
pub struct CodecDispatcher {
    factory: Box<dyn DecoderFactory>,
    h264: OnceCell<Box<dyn FrameDecoder>>,
    vp8: OnceCell<Box<dyn FrameDecoder>>,
    vp9: OnceCell<Box<dyn FrameDecoder>>,
}

impl CodecDispatcher {
    pub fn new(factory: Box<dyn DecoderFactory>) -> Self {
        Self {
            factory,
            h264: OnceCell::new(),
            vp8: OnceCell::new(),
            vp9: OnceCell::new(),
        }
    }

    pub fn is_initialized(&self, codec: Codec) -> bool {
        match codec {
            Codec::H264 => self.h264.get().is_some(),
            Codec::Vp8 => self.vp8.get().is_some(),
            Codec::Vp9 => self.vp9.get().is_some(),
        }
    }

    fn decoder(&mut self, codec: Codec) -> Result<&mut Box<dyn FrameDecoder>> {
        let cell = match codec {
            Codec::H264 => &mut self.h264,
            Codec::Vp8 => &mut self.vp8,
            Codec::Vp9 => &mut self.vp9,
        };
        if cell.get().is_none() {
            let decoder = self.factory.create(codec).map_err(|e| Error::DecoderInit {
                codec,
                reason: e.to_string(),
            })?;
            info!("Using {} for {}", decoder.name(), codec);
            let _ = cell.set(decoder);
        }
        cell.get_mut().ok_or_else(|| Error::DecoderInit {
            codec,
            reason: "decoder vanished after initialization".into(),
        })
    }

    /// Decode `reply` into frames of `geometry`. An empty result means the
    /// round was not decoded; only decoder initialization fails the call.
    pub fn decode(&mut self, reply: &CompressedReply, geometry: Geometry) -> Result<Vec<PlanarFrame>> {
        let Some(codec) = Codec::from_fourcc(&reply.fourcc) else {
            warn!("Unsupported codec tag '{}'", reply.fourcc);
            return Ok(Vec::new());
        };
        if reply.payload.is_empty() {
            debug!("Empty {} payload", codec);
            return Ok(Vec::new());
        }

        let decoder = self.decoder(codec)?;
        let pictures = match decoder.decode(&reply.payload) {
            Ok(pictures) => pictures,
            Err(e) => {
                metrics::counter!("loopback_decode_failures_total").increment(1);
                warn!("{} decoding for current frame failed: {}", codec, e);
                return Ok(Vec::new());
            }
        };

        let mut frames = Vec::with_capacity(pictures.len());
        for picture in &pictures {
            match picture.normalize(geometry) {
                Ok(frame) => frames.push(frame),
                Err(e) => {
                    metrics::counter!("loopback_decode_failures_total").increment(1);
                    warn!("Dropping {} picture: {}", codec, e);
                }
            }
        }
        Ok(frames)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::cell::Cell;
    use std::rc::Rc;

    use crate::source::Timestamp;

    /// Treats the payload as a packed I420 picture of fixed size
    struct Raw {
        width: u32,
        height: u32,
    }

    impl FrameDecoder for Raw {
        fn decode(&mut self, payload: &[u8]) -> std::result::Result<Vec<YuvPicture>, DecodeError> {
            if payload == b"bad" {
                return Err(DecodeError::Decode("corrupt".into()));
            }
            Ok(vec![YuvPicture::from_i420(self.width, self.height, payload)?])
        }

        fn name(&self) -> &'static str {
            "raw"
        }
    }

    fn reply(tag: &str, payload: Vec<u8>) -> CompressedReply {
        CompressedReply {
            fourcc: tag.into(),
            payload: Bytes::from(payload),
            sent: Timestamp::now(),
        }
    }

    fn counting_dispatcher(width: u32, height: u32) -> (CodecDispatcher, Rc<Cell<u32>>) {
        let created = Rc::new(Cell::new(0));
        let counter = created.clone();
        let factory = move |_codec: Codec| -> std::result::Result<Box<dyn FrameDecoder>, DecodeError> {
            counter.set(counter.get() + 1);
            Ok(Box::new(Raw { width, height }))
        };
        (CodecDispatcher::new(Box::new(factory)), created)
    }

    #[test]
    fn tags_resolve_to_a_closed_set() {
        for codec in [Codec::H264, Codec::Vp8, Codec::Vp9] {
            assert_eq!(Codec::from_fourcc(codec.fourcc()), Some(codec));
        }
        assert_eq!(Codec::from_fourcc("H264"), None);
        assert_eq!(Codec::from_fourcc("AV01"), None);
    }

    #[test]
    fn decoders_are_created_once_per_codec() {
        let (mut dispatcher, created) = counting_dispatcher(2, 2);
        let geometry = Geometry::full(2, 2);
        for _ in 0..3 {
            let frames = dispatcher.decode(&reply("h264", vec![7; 6]), geometry).unwrap();
            assert_eq!(frames.len(), 1);
            assert_eq!(frames[0].as_bytes(), &[7; 6]);
        }
        assert_eq!(created.get(), 1);
        assert!(dispatcher.is_initialized(Codec::H264));
        assert!(!dispatcher.is_initialized(Codec::Vp8));

        dispatcher.decode(&reply("VP80", vec![1; 6]), geometry).unwrap();
        assert_eq!(created.get(), 2);
    }

    #[test]
    fn empty_payload_and_unknown_tag_are_not_decoded() {
        let (mut dispatcher, created) = counting_dispatcher(2, 2);
        let geometry = Geometry::full(2, 2);
        assert!(dispatcher.decode(&reply("h264", Vec::new()), geometry).unwrap().is_empty());
        assert!(dispatcher.decode(&reply("MJPG", vec![1; 6]), geometry).unwrap().is_empty());
        assert_eq!(created.get(), 0);
    }

    #[test]
    fn decode_failure_is_not_fatal() {
        let (mut dispatcher, _) = counting_dispatcher(2, 2);
        let frames = dispatcher
            .decode(&reply("h264", b"bad".to_vec()), Geometry::full(2, 2))
            .unwrap();
        assert!(frames.is_empty());
    }

    #[test]
    fn init_failure_is_fatal() {
        let factory = |codec: Codec| -> std::result::Result<Box<dyn FrameDecoder>, DecodeError> {
            Err(DecodeError::Unsupported(codec))
        };
        let mut dispatcher = CodecDispatcher::new(Box::new(factory));
        let err = dispatcher
            .decode(&reply("VP90", vec![1; 6]), Geometry::full(2, 2))
            .unwrap_err();
        assert!(matches!(err, Error::DecoderInit { codec: Codec::Vp9, .. }));
    }

    #[test]
    fn smaller_pictures_are_resampled_to_the_output_geometry() {
        let (mut dispatcher, _) = counting_dispatcher(2, 2);
        let mut packed = vec![50; 4];
        packed.extend([60, 70]);
        let frames = dispatcher.decode(&reply("h264", packed), Geometry::full(4, 4)).unwrap();
        let frame = &frames[0];
        assert_eq!((frame.width(), frame.height()), (4, 4));
        assert_eq!(frame.y(), &[50; 16]);
        assert_eq!(frame.u(), &[60; 4]);
        assert_eq!(frame.v(), &[70; 4]);
    }

    #[test]
    fn strided_planes_are_packed() {
        let picture = YuvPicture {
            width: 2,
            height: 2,
            planes: [vec![1, 2, 0, 3, 4, 0], vec![5, 0], vec![6, 0]],
            strides: [3, 2, 2],
        };
        let frame = picture.normalize(Geometry::full(2, 2)).unwrap();
        assert_eq!(frame.as_bytes(), &[1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn truncated_planes_are_rejected() {
        let picture = YuvPicture {
            width: 4,
            height: 4,
            planes: [vec![0; 8], vec![0; 4], vec![0; 4]],
            strides: [4, 2, 2],
        };
        assert!(matches!(
            picture.normalize(Geometry::full(4, 4)),
            Err(DecodeError::Malformed(_))
        ));
    }
}
