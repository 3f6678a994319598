//! Quality records and where they go

use std::fmt;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use image::error::{ParameterError, ParameterErrorKind};
use image::RgbaImage;
use tracing::{info, warn};

use crate::quality::Score;
use crate::source::{Geometry, PlanarFrame};
use crate::yuv;

/// One scored round
#[derive(Debug, Clone, PartialEq)]
pub struct QualityRecord {
    pub file: PathBuf,
    pub geometry: Geometry,
    pub compressed_len: usize,
    pub score: Score,
    pub duration_us: i64,
}

impl fmt::Display for QualityRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{};{};{};{};{};size[bytes];{};PSNR;{};SSIM;{};duration[microseconds];{}",
            self.file.display(),
            self.geometry.x,
            self.geometry.y,
            self.geometry.width,
            self.geometry.height,
            self.compressed_len,
            self.score.psnr,
            self.score.ssim,
            self.duration_us
        )
    }
}

pub struct Reporter {
    file: Option<BufWriter<File>>,
}

impl Reporter {
    /// Truncates `path` if given. A file that cannot be created leaves the
    /// reporter logging only.
    pub fn open(path: Option<&Path>) -> Self {
        let file = path.and_then(|path| match File::create(path) {
            Ok(file) => {
                info!("Writing report to {}", path.display());
                Some(BufWriter::new(file))
            }
            Err(e) => {
                warn!("Cannot open report file {}: {}", path.display(), e);
                None
            }
        });
        Self { file }
    }

    pub fn is_persistent(&self) -> bool {
        self.file.is_some()
    }

    pub fn append(&mut self, record: &QualityRecord) {
        info!("{}", record);
        let Some(file) = self.file.as_mut() else {
            return;
        };
        if let Err(e) = writeln!(file, "{}", record).and_then(|_| file.flush()) {
            warn!("Report file is no longer writable, continuing without it: {}", e);
            self.file = None;
        }
    }
}

/// File name used by `--savepng` for the given 1-based input position
pub fn reconstruction_name(position: usize) -> String {
    format!("lossy_{position:010}.png")
}

pub fn save_reconstruction(frame: &PlanarFrame, path: &Path) -> Result<(), image::ImageError> {
    let parameter = |kind| image::ImageError::Parameter(ParameterError::from_kind(kind));
    let rgba = yuv::i420_to_rgba(frame).map_err(|e| parameter(ParameterErrorKind::Generic(e.to_string())))?;
    let image = RgbaImage::from_raw(frame.width(), frame.height(), rgba)
        .ok_or_else(|| parameter(ParameterErrorKind::DimensionMismatch))?;
    image.save(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn record() -> QualityRecord {
        QualityRecord {
            file: PathBuf::from("frames/0001.png"),
            geometry: Geometry::new(10, 10, 32, 32),
            compressed_len: 1234,
            score: Score {
                psnr: 38.5,
                ssim: 0.97,
            },
            duration_us: 1500,
        }
    }

    fn scratch(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("loopback-report-{}-{}", std::process::id(), tag));
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn record_line_layout() {
        assert_eq!(
            record().to_string(),
            "frames/0001.png;10;10;32;32;size[bytes];1234;PSNR;38.5;SSIM;0.97;duration[microseconds];1500"
        );
    }

    #[test]
    fn report_file_is_truncated_and_appended() {
        let dir = scratch("append");
        let path = dir.join("report.csv");
        fs::write(&path, "old contents\n").unwrap();

        let mut reporter = Reporter::open(Some(&path));
        assert!(reporter.is_persistent());
        reporter.append(&record());
        reporter.append(&record());
        drop(reporter);

        let written = fs::read_to_string(&path).unwrap();
        assert_eq!(written.lines().count(), 2);
        assert!(written.lines().all(|line| line == record().to_string()));
        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn unopenable_report_degrades_to_logging() {
        let dir = scratch("missing");
        let mut reporter = Reporter::open(Some(&dir.join("no/such/dir/report.csv")));
        assert!(!reporter.is_persistent());
        reporter.append(&record());
        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn reconstruction_png() {
        assert_eq!(reconstruction_name(7), "lossy_0000000007.png");

        let dir = scratch("png");
        let path = dir.join(reconstruction_name(1));
        let frame = PlanarFrame::new(4, 2).unwrap();
        save_reconstruction(&frame, &path).unwrap();
        let decoded = image::open(&path).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (4, 2));
        fs::remove_dir_all(&dir).unwrap();
    }
}
