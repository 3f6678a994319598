//! Command line, file and environment configuration
//!
//! Sources are layered lowest to highest: built-in defaults, the optional
//! TOML file given with `--config`, `LOOPBACK_*` environment variables
//! (`__` separates nested keys, e.g. `LOOPBACK_CROP__X`) and finally the
//! command line.

use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::Parser;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::source::Geometry;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required option --{0}")]
    Missing(&'static str),
    #[error("--crop.x, --crop.y, --crop.width and --crop.height must be given together")]
    PartialCrop,
    #[error("crop {0} needs a positive, even width and height")]
    InvalidCrop(Geometry),
    #[error("session id {0} is outside 1..=254")]
    InvalidCid(u16),
    #[error("timeout must be at least 1 ms")]
    ZeroTimeout,
    #[error(transparent)]
    Load(#[from] config::ConfigError),
}

#[derive(Debug, Clone, Parser)]
#[command(
    name = "loopback",
    version,
    about = "Feeds still images to an external encoder over shared memory and scores what comes back"
)]
pub struct Cli {
    /// Folder with the .png input images
    #[arg(long)]
    pub folder: Option<PathBuf>,
    /// Name of the shared memory area to publish frames in
    #[arg(long)]
    pub name: Option<String>,
    /// OD4 session to listen on for encoded frames
    #[arg(long)]
    pub cid: Option<u16>,
    #[arg(long = "crop.x")]
    pub crop_x: Option<u32>,
    #[arg(long = "crop.y")]
    pub crop_y: Option<u32>,
    #[arg(long = "crop.width")]
    pub crop_width: Option<u32>,
    #[arg(long = "crop.height")]
    pub crop_height: Option<u32>,
    /// Delay between frames in ms
    #[arg(long)]
    pub delay: Option<u64>,
    /// Delay before the first frame in ms
    #[arg(long = "delay.start")]
    pub start_delay: Option<u64>,
    /// Time to wait for a reply in ms
    #[arg(long)]
    pub timeout: Option<u64>,
    /// Skip frames without a reply instead of stopping
    #[arg(long)]
    pub noexitontimeout: bool,
    /// Stop after this many frames (0 runs through the folder)
    #[arg(long)]
    pub stopafter: Option<u64>,
    /// Save reconstructed frames as PNG in the working directory
    #[arg(long)]
    pub savepng: bool,
    /// Append quality records to this file
    #[arg(long)]
    pub report: Option<PathBuf>,
    /// Debug logging and preview windows
    #[arg(short, long)]
    pub verbose: bool,
    /// TOML file with defaults for any of the options above
    #[arg(long)]
    pub config: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CropConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub x: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub y: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
}

impl CropConfig {
    fn resolve(&self) -> Result<Option<Geometry>, ConfigError> {
        match (self.x, self.y, self.width, self.height) {
            (None, None, None, None) => Ok(None),
            (Some(x), Some(y), Some(width), Some(height)) => {
                let crop = Geometry::new(x, y, width, height);
                if crop.is_even() {
                    Ok(Some(crop))
                } else {
                    Err(ConfigError::InvalidCrop(crop))
                }
            }
            _ => Err(ConfigError::PartialCrop),
        }
    }
}

/// Raw, layered configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub folder: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cid: Option<u16>,
    pub crop: CropConfig,
    pub delay_ms: u64,
    pub start_delay_ms: u64,
    pub timeout_ms: u64,
    pub exit_on_timeout: bool,
    pub stop_after: u64,
    pub save_png: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub report: Option<PathBuf>,
    pub verbose: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            folder: None,
            name: None,
            cid: None,
            crop: CropConfig::default(),
            delay_ms: 1000,
            start_delay_ms: 5000,
            timeout_ms: 40, // one frame at 25 fps
            exit_on_timeout: true,
            stop_after: 0,
            save_png: false,
            report: None,
            verbose: false,
        }
    }
}

fn path_value(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

impl Config {
    pub fn load(cli: &Cli) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder().add_source(config::Config::try_from(&Config::default())?);
        if let Some(path) = &cli.config {
            builder = builder.add_source(config::File::from(path.as_path()).format(config::FileFormat::Toml));
        }
        builder = builder
            .add_source(
                config::Environment::with_prefix("LOOPBACK")
                    .separator("__")
                    .try_parsing(true),
            )
            .set_override_option("folder", cli.folder.as_deref().map(path_value))?
            .set_override_option("name", cli.name.clone())?
            .set_override_option("cid", cli.cid.map(u64::from))?
            .set_override_option("crop.x", cli.crop_x.map(u64::from))?
            .set_override_option("crop.y", cli.crop_y.map(u64::from))?
            .set_override_option("crop.width", cli.crop_width.map(u64::from))?
            .set_override_option("crop.height", cli.crop_height.map(u64::from))?
            .set_override_option("delay_ms", cli.delay)?
            .set_override_option("start_delay_ms", cli.start_delay)?
            .set_override_option("timeout_ms", cli.timeout)?
            .set_override_option("exit_on_timeout", cli.noexitontimeout.then_some(false))?
            .set_override_option("stop_after", cli.stopafter)?
            .set_override_option("save_png", cli.savepng.then_some(true))?
            .set_override_option("report", cli.report.as_deref().map(path_value))?
            .set_override_option("verbose", cli.verbose.then_some(true))?;

        Ok(builder.build()?.try_deserialize()?)
    }

    pub fn validate(&self) -> Result<RunConfig, ConfigError> {
        let folder = self.folder.clone().ok_or(ConfigError::Missing("folder"))?;
        let name = self
            .name
            .clone()
            .filter(|name| !name.is_empty())
            .ok_or(ConfigError::Missing("name"))?;
        let cid = self.cid.ok_or(ConfigError::Missing("cid"))?;
        let cid = match u8::try_from(cid) {
            Ok(cid @ 1..=254) => cid,
            _ => return Err(ConfigError::InvalidCid(cid)),
        };
        let crop = self.crop.resolve()?;
        if self.timeout_ms == 0 {
            return Err(ConfigError::ZeroTimeout);
        }

        Ok(RunConfig {
            folder,
            name,
            cid,
            crop,
            delay: Duration::from_millis(self.delay_ms),
            start_delay: Duration::from_millis(self.start_delay_ms),
            timeout: Duration::from_millis(self.timeout_ms),
            exit_on_timeout: self.exit_on_timeout,
            stop_after: (self.stop_after > 0).then_some(self.stop_after),
            save_png: self.save_png,
            png_dir: PathBuf::from("."),
            report: self.report.clone(),
            verbose: self.verbose,
        })
    }
}

/// Validated settings for one evaluation run
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub folder: PathBuf,
    pub name: String,
    pub cid: u8,
    pub crop: Option<Geometry>,
    pub delay: Duration,
    pub start_delay: Duration,
    pub timeout: Duration,
    pub exit_on_timeout: bool,
    pub stop_after: Option<u64>,
    pub save_png: bool,
    pub png_dir: PathBuf,
    pub report: Option<PathBuf>,
    pub verbose: bool,
}

impl RunConfig {
    /// Defaults for everything but the required options
    pub fn new(folder: impl Into<PathBuf>, name: impl Into<String>, cid: u8) -> Self {
        let defaults = Config::default();
        Self {
            folder: folder.into(),
            name: name.into(),
            cid,
            crop: None,
            delay: Duration::from_millis(defaults.delay_ms),
            start_delay: Duration::from_millis(defaults.start_delay_ms),
            timeout: Duration::from_millis(defaults.timeout_ms),
            exit_on_timeout: defaults.exit_on_timeout,
            stop_after: None,
            save_png: defaults.save_png,
            png_dir: PathBuf::from("."),
            report: None,
            verbose: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn cli(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("loopback").chain(args.iter().copied())).unwrap()
    }

    fn run_config(args: &[&str]) -> Result<RunConfig, ConfigError> {
        Config::load(&cli(args))?.validate()
    }

    const REQUIRED: [&str; 6] = ["--folder", "images", "--name", "video0.i420", "--cid", "111"];

    #[test]
    fn defaults_apply() {
        let run = run_config(&REQUIRED).unwrap();
        assert_eq!(run.folder, PathBuf::from("images"));
        assert_eq!(run.name, "video0.i420");
        assert_eq!(run.cid, 111);
        assert_eq!(run.crop, None);
        assert_eq!(run.delay, Duration::from_secs(1));
        assert_eq!(run.start_delay, Duration::from_secs(5));
        assert_eq!(run.timeout, Duration::from_millis(40));
        assert!(run.exit_on_timeout);
        assert_eq!(run.stop_after, None);
        assert!(!run.save_png);
        assert!(!run.verbose);
    }

    #[test]
    fn command_line_overrides() {
        let mut args = REQUIRED.to_vec();
        args.extend([
            "--crop.x",
            "10",
            "--crop.y",
            "12",
            "--crop.width",
            "32",
            "--crop.height",
            "16",
            "--delay",
            "0",
            "--delay.start",
            "250",
            "--timeout",
            "100",
            "--noexitontimeout",
            "--stopafter",
            "3",
            "--savepng",
            "--report",
            "out.csv",
            "--verbose",
        ]);
        let run = run_config(&args).unwrap();
        assert_eq!(run.crop, Some(Geometry::new(10, 12, 32, 16)));
        assert_eq!(run.delay, Duration::ZERO);
        assert_eq!(run.start_delay, Duration::from_millis(250));
        assert_eq!(run.timeout, Duration::from_millis(100));
        assert!(!run.exit_on_timeout);
        assert_eq!(run.stop_after, Some(3));
        assert!(run.save_png);
        assert_eq!(run.report, Some(PathBuf::from("out.csv")));
        assert!(run.verbose);
    }

    #[rstest]
    #[case::x_only(&["--crop.x", "1"])]
    #[case::no_height(&["--crop.x", "0", "--crop.y", "0", "--crop.width", "8"])]
    #[case::size_only(&["--crop.width", "8", "--crop.height", "8"])]
    fn partial_crop_is_rejected(#[case] crop: &[&str]) {
        let mut args = REQUIRED.to_vec();
        args.extend_from_slice(crop);
        assert!(matches!(run_config(&args), Err(ConfigError::PartialCrop)));
    }

    #[rstest]
    #[case::odd_width("33", "32")]
    #[case::zero_height("32", "0")]
    fn unusable_crop_sizes_are_rejected(#[case] width: &str, #[case] height: &str) {
        let mut args = REQUIRED.to_vec();
        args.extend(["--crop.x", "0", "--crop.y", "0", "--crop.width", width, "--crop.height", height]);
        assert!(matches!(run_config(&args), Err(ConfigError::InvalidCrop(_))));
    }

    #[rstest]
    #[case::folder(&["--name", "a", "--cid", "1"], "folder")]
    #[case::name(&["--folder", "f", "--cid", "1"], "name")]
    #[case::cid(&["--folder", "f", "--name", "a"], "cid")]
    fn required_options(#[case] args: &[&str], #[case] missing: &str) {
        match run_config(args) {
            Err(ConfigError::Missing(name)) => assert_eq!(name, missing),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[rstest]
    #[case(0)]
    #[case(255)]
    #[case(1000)]
    fn cid_range(#[case] cid: u16) {
        let cid = cid.to_string();
        let args = ["--folder", "f", "--name", "a", "--cid", cid.as_str()];
        assert!(matches!(run_config(&args), Err(ConfigError::InvalidCid(_))));
    }

    #[test]
    fn zero_timeout_is_rejected() {
        let mut args = REQUIRED.to_vec();
        args.extend(["--timeout", "0"]);
        assert!(matches!(run_config(&args), Err(ConfigError::ZeroTimeout)));
    }

    #[test]
    fn toml_file_sits_under_the_command_line() {
        let dir = std::env::temp_dir().join(format!("loopback-config-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("loopback.toml");
        std::fs::write(
            &path,
            "folder = \"from-file\"\nname = \"shm\"\ncid = 42\ntimeout_ms = 80\n\n[crop]\nx = 2\ny = 2\nwidth = 4\nheight = 4\n",
        )
        .unwrap();

        let path_arg = path.to_string_lossy().into_owned();
        let run = run_config(&["--config", path_arg.as_str(), "--folder", "from-cli"]).unwrap();
        assert_eq!(run.folder, PathBuf::from("from-cli"));
        assert_eq!(run.name, "shm");
        assert_eq!(run.cid, 42);
        assert_eq!(run.timeout, Duration::from_millis(80));
        assert_eq!(run.crop, Some(Geometry::new(2, 2, 4, 4)));

        std::fs::remove_dir_all(&dir).unwrap();
    }
}
