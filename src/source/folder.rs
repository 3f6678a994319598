//! Ordered replay of a folder of still images as I420 frames

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use image::imageops::{self, FilterType};
use image::RgbaImage;
use thiserror::Error;
use tracing::{debug, info, instrument};

use super::frame::{FrameError, Geometry, PlanarFrame};
use crate::yuv;

const EXTENSION: &str = "png";

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("failed to decode '{}': {source}", path.display())]
    Decode {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
    /// Raised only while the output geometry is still being negotiated
    #[error("crop {crop} does not fit into the {width}x{height} source image")]
    InvalidCrop {
        crop: Geometry,
        width: u32,
        height: u32,
    },
    #[error("'{}' ({width}x{height}) cannot hold the crop {crop}", path.display())]
    ImageTooSmall {
        path: PathBuf,
        crop: Geometry,
        width: u32,
        height: u32,
    },
    #[error("'{}' is too small to form an I420 frame ({width}x{height})", path.display())]
    Degenerate { path: PathBuf, width: u32, height: u32 },
    #[error(transparent)]
    Frame(#[from] FrameError),
}

impl SourceError {
    /// Geometry failures abort the run, everything else skips one image
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::InvalidCrop { .. })
    }
}

/// One decoded input image, normalized to the output geometry
#[derive(Debug, Clone)]
pub struct SourceFrame {
    pub path: PathBuf,
    pub frame: PlanarFrame,
}

/// Frame source over a folder. Listing is repeatable; decoding happens one
/// entry at a time as the caller asks for it.
pub struct FrameSource {
    folder: PathBuf,
    crop: Option<Geometry>,
    geometry: Option<Geometry>,
}

impl FrameSource {
    pub fn new(folder: impl Into<PathBuf>, crop: Option<Geometry>) -> Self {
        Self {
            folder: folder.into(),
            crop,
            geometry: None,
        }
    }

    /// Output geometry, fixed by the first image that decoded
    pub fn geometry(&self) -> Option<Geometry> {
        self.geometry
    }

    /// Candidate images in lexicographic order
    pub fn entries(&self) -> io::Result<Vec<PathBuf>> {
        let mut entries = Vec::new();
        for entry in fs::read_dir(&self.folder)? {
            let path = entry?.path();
            let is_image = path
                .extension()
                .and_then(|ext| ext.to_str())
                .is_some_and(|ext| ext.eq_ignore_ascii_case(EXTENSION));
            if is_image && path.is_file() {
                entries.push(path);
            }
        }
        entries.sort();
        Ok(entries)
    }

    /// Decode one image and bring it into the output geometry
    #[instrument(skip(self), fields(path = %path.display()))]
    pub fn load(&mut self, path: &Path) -> Result<SourceFrame, SourceError> {
        let rgba = image::open(path)
            .map_err(|source| SourceError::Decode {
                path: path.to_path_buf(),
                source,
            })?
            .into_rgba8();
        let (width, height) = rgba.dimensions();

        let geometry = match self.geometry {
            Some(geometry) => geometry,
            None => {
                let geometry = self.negotiate(path, width, height)?;
                info!("Output geometry {} from {}x{} source", geometry, width, height);
                self.geometry = Some(geometry);
                geometry
            }
        };

        let normalized = self.normalize(path, rgba, geometry)?;
        let mut frame = PlanarFrame::new(geometry.width, geometry.height)?;
        yuv::rgba_to_i420(normalized.as_raw(), &mut frame)?;

        Ok(SourceFrame {
            path: path.to_path_buf(),
            frame,
        })
    }

    fn negotiate(&self, path: &Path, width: u32, height: u32) -> Result<Geometry, SourceError> {
        match self.crop {
            Some(crop) if crop.fits_within(width, height) => Ok(crop),
            Some(crop) => Err(SourceError::InvalidCrop {
                crop,
                width,
                height,
            }),
            None => {
                // Subsampling needs even sides: cut a trailing odd row/column
                let geometry = Geometry::full(width & !1, height & !1);
                if geometry.is_even() {
                    Ok(geometry)
                } else {
                    Err(SourceError::Degenerate {
                        path: path.to_path_buf(),
                        width,
                        height,
                    })
                }
            }
        }
    }

    fn normalize(
        &self,
        path: &Path,
        rgba: RgbaImage,
        geometry: Geometry,
    ) -> Result<RgbaImage, SourceError> {
        let (width, height) = rgba.dimensions();
        if let Some(crop) = self.crop {
            if !crop.fits_within(width, height) {
                return Err(SourceError::ImageTooSmall {
                    path: path.to_path_buf(),
                    crop,
                    width,
                    height,
                });
            }
            return Ok(imageops::crop_imm(&rgba, crop.x, crop.y, crop.width, crop.height).to_image());
        }

        if (width, height) == (geometry.width, geometry.height) {
            Ok(rgba)
        } else if (width & !1, height & !1) == (geometry.width, geometry.height) {
            Ok(imageops::crop_imm(&rgba, 0, 0, geometry.width, geometry.height).to_image())
        } else {
            debug!(
                "Scaling {}x{} to {}x{}",
                width, height, geometry.width, geometry.height
            );
            Ok(imageops::resize(
                &rgba,
                geometry.width,
                geometry.height,
                FilterType::Triangle,
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgba;

    fn scratch_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("loopback-source-{}-{}", std::process::id(), tag));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn write_png(dir: &Path, name: &str, width: u32, height: u32, value: u8) {
        RgbaImage::from_pixel(width, height, Rgba([value, value, value, 255]))
            .save(dir.join(name))
            .unwrap();
    }

    #[test]
    fn entries_are_sorted_and_filtered() {
        let dir = scratch_dir("order");
        for name in ["c.png", "a.png", "b.PNG", "10.png", "2.png"] {
            write_png(&dir, name, 4, 4, 0);
        }
        fs::write(dir.join("notes.txt"), b"skip me").unwrap();
        fs::write(dir.join("png"), b"no extension").unwrap();

        let source = FrameSource::new(&dir, None);
        let names: Vec<_> = source
            .entries()
            .unwrap()
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, ["10.png", "2.png", "a.png", "b.PNG", "c.png"]);
        // Listing again yields the same sequence
        assert_eq!(source.entries().unwrap().len(), 5);
    }

    #[test]
    fn first_image_fixes_the_geometry() {
        let dir = scratch_dir("geometry");
        write_png(&dir, "0.png", 8, 6, 0);
        write_png(&dir, "1.png", 16, 16, 255);

        let mut source = FrameSource::new(&dir, None);
        let entries = source.entries().unwrap();
        assert_eq!(entries.len(), 2);
        for path in &entries {
            let loaded = source.load(path).unwrap();
            assert_eq!((loaded.frame.width(), loaded.frame.height()), (8, 6));
            assert_eq!(loaded.frame.len(), 8 * 6 * 3 / 2);
        }
        assert_eq!(source.geometry(), Some(Geometry::full(8, 6)));
    }

    #[test]
    fn odd_native_size_is_trimmed_to_even() {
        let dir = scratch_dir("odd");
        write_png(&dir, "0.png", 7, 5, 0);
        let mut source = FrameSource::new(&dir, None);
        let loaded = source.load(&dir.join("0.png")).unwrap();
        assert_eq!((loaded.frame.width(), loaded.frame.height()), (6, 4));
        assert_eq!(source.geometry(), Some(Geometry::full(6, 4)));
    }

    #[test]
    fn crop_outside_first_image_is_fatal() {
        let dir = scratch_dir("crop");
        write_png(&dir, "0.png", 64, 64, 0);
        let mut source = FrameSource::new(&dir, Some(Geometry::new(40, 40, 32, 32)));
        let err = source.load(&dir.join("0.png")).unwrap_err();
        assert!(err.is_fatal(), "{err}");
        assert_eq!(source.geometry(), None);
    }

    #[test]
    fn crop_outside_later_image_skips_it() {
        let dir = scratch_dir("crop-later");
        write_png(&dir, "0.png", 64, 64, 0);
        write_png(&dir, "1.png", 16, 16, 0);
        let mut source = FrameSource::new(&dir, Some(Geometry::new(10, 10, 32, 32)));
        let first = source.load(&dir.join("0.png")).unwrap();
        assert_eq!(first.frame.len(), 1536);
        let err = source.load(&dir.join("1.png")).unwrap_err();
        assert!(!err.is_fatal());
        assert!(matches!(err, SourceError::ImageTooSmall { .. }));
    }

    #[test]
    fn undecodable_file_is_reported() {
        let dir = scratch_dir("corrupt");
        fs::write(dir.join("broken.png"), b"definitely not a png").unwrap();
        let mut source = FrameSource::new(&dir, None);
        let err = source.load(&dir.join("broken.png")).unwrap_err();
        assert!(matches!(err, SourceError::Decode { .. }));
        assert!(!err.is_fatal());
    }
}
