use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("frame dimensions {width}x{height} must be positive and even")]
    InvalidDimensions { width: u32, height: u32 },
    #[error("buffer of {actual} bytes does not match the expected {expected} bytes")]
    SizeMismatch { expected: usize, actual: usize },
    #[error("pixel conversion failed: {0}")]
    Conversion(String),
}

/// Rectangle inside a source image. A full frame is the rectangle at 0,0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Geometry {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Geometry {
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn full(width: u32, height: u32) -> Self {
        Self::new(0, 0, width, height)
    }

    /// Bytes needed for one I420 frame of this size
    pub fn i420_len(&self) -> usize {
        let (width, height) = (self.width as usize, self.height as usize);
        width * height + 2 * ((width / 2) * (height / 2))
    }

    /// Whether the rectangle lies inside an image of the given size
    pub fn fits_within(&self, width: u32, height: u32) -> bool {
        u64::from(self.x) + u64::from(self.width) <= u64::from(width)
            && u64::from(self.y) + u64::from(self.height) <= u64::from(height)
    }

    pub fn is_even(&self) -> bool {
        self.width > 0 && self.height > 0 && self.width % 2 == 0 && self.height % 2 == 0
    }
}

impl fmt::Display for Geometry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}+{}+{}", self.width, self.height, self.x, self.y)
    }
}

/// Wall-clock instant in microseconds since the Unix epoch
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp(pub i64);

impl Timestamp {
    pub fn now() -> Self {
        match SystemTime::now().duration_since(UNIX_EPOCH) {
            Ok(elapsed) => Self(i64::try_from(elapsed.as_micros()).unwrap_or(i64::MAX)),
            Err(before_epoch) => {
                Self(-i64::try_from(before_epoch.duration().as_micros()).unwrap_or(i64::MAX))
            }
        }
    }

    pub fn from_parts(seconds: i64, microseconds: i64) -> Self {
        Self(seconds.saturating_mul(1_000_000).saturating_add(microseconds))
    }

    pub fn as_micros(self) -> i64 {
        self.0
    }

    pub fn seconds(self) -> i64 {
        self.0.div_euclid(1_000_000)
    }

    pub fn subsec_micros(self) -> i64 {
        self.0.rem_euclid(1_000_000)
    }

    /// Signed distance from `earlier` to `self`
    pub fn micros_since(self, earlier: Timestamp) -> i64 {
        self.0.saturating_sub(earlier.0)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:06}", self.seconds(), self.subsec_micros())
    }
}

/// Planar 4:2:0 frame: Y plane, then U and V at half width and half height,
/// stored back to back.
#[derive(Clone, PartialEq, Eq)]
pub struct PlanarFrame {
    width: u32,
    height: u32,
    data: Vec<u8>,
}

impl PlanarFrame {
    /// Zero-filled frame
    pub fn new(width: u32, height: u32) -> Result<Self, FrameError> {
        let geometry = Self::check(width, height)?;
        Ok(Self {
            width,
            height,
            data: vec![0; geometry.i420_len()],
        })
    }

    pub fn from_bytes(width: u32, height: u32, data: Vec<u8>) -> Result<Self, FrameError> {
        let expected = Self::check(width, height)?.i420_len();
        if data.len() != expected {
            return Err(FrameError::SizeMismatch {
                expected,
                actual: data.len(),
            });
        }
        Ok(Self {
            width,
            height,
            data,
        })
    }

    fn check(width: u32, height: u32) -> Result<Geometry, FrameError> {
        let geometry = Geometry::full(width, height);
        if geometry.is_even() {
            Ok(geometry)
        } else {
            Err(FrameError::InvalidDimensions { width, height })
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn chroma_width(&self) -> u32 {
        self.width / 2
    }

    pub fn chroma_height(&self) -> u32 {
        self.height / 2
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn same_geometry(&self, other: &PlanarFrame) -> bool {
        self.width == other.width && self.height == other.height
    }

    fn luma_len(&self) -> usize {
        self.width as usize * self.height as usize
    }

    fn chroma_len(&self) -> usize {
        self.chroma_width() as usize * self.chroma_height() as usize
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }

    pub fn y(&self) -> &[u8] {
        &self.data[..self.luma_len()]
    }

    pub fn u(&self) -> &[u8] {
        let start = self.luma_len();
        &self.data[start..start + self.chroma_len()]
    }

    pub fn v(&self) -> &[u8] {
        &self.data[self.luma_len() + self.chroma_len()..]
    }

    /// Disjoint mutable views of the Y, U and V planes
    pub fn planes_mut(&mut self) -> (&mut [u8], &mut [u8], &mut [u8]) {
        let (luma, chroma) = (self.luma_len(), self.chroma_len());
        let (y, rest) = self.data.split_at_mut(luma);
        let (u, v) = rest.split_at_mut(chroma);
        (y, u, v)
    }
}

impl fmt::Debug for PlanarFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PlanarFrame")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("bytes", &self.data.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plane_views_follow_the_i420_layout() {
        let mut frame = PlanarFrame::new(4, 2).unwrap();
        assert_eq!(frame.len(), 12);
        {
            let (y, u, v) = frame.planes_mut();
            assert_eq!((y.len(), u.len(), v.len()), (8, 2, 2));
            y.fill(1);
            u.fill(2);
            v.fill(3);
        }
        assert_eq!(frame.as_bytes(), &[1, 1, 1, 1, 1, 1, 1, 1, 2, 2, 3, 3]);
        assert_eq!(frame.u(), &[2, 2]);
        assert_eq!(frame.v(), &[3, 3]);
    }

    #[test]
    fn odd_or_empty_dimensions_are_rejected() {
        assert!(PlanarFrame::new(3, 2).is_err());
        assert!(PlanarFrame::new(0, 2).is_err());
        assert_eq!(
            PlanarFrame::from_bytes(2, 2, vec![0; 5]),
            Err(FrameError::SizeMismatch {
                expected: 6,
                actual: 5
            })
        );
    }

    #[test]
    fn crop_bounds() {
        let crop = Geometry::new(10, 10, 32, 32);
        assert!(crop.fits_within(64, 64));
        assert!(crop.fits_within(42, 42));
        assert!(!crop.fits_within(41, 64));
        assert_eq!(crop.i420_len(), 1536);
    }

    #[test]
    fn timestamp_parts() {
        let ts = Timestamp::from_parts(12, 345);
        assert_eq!(ts.as_micros(), 12_000_345);
        assert_eq!(ts.seconds(), 12);
        assert_eq!(ts.subsec_micros(), 345);
        assert_eq!(ts.micros_since(Timestamp(12_000_000)), 345);
    }
}
