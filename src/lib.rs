//! Closed-loop evaluation of an external video encoder
//!
//! Still images are converted to I420 and published one at a time in a
//! named shared memory area. The encoder under test answers each frame with
//! an encoded image on an OD4 session; the answer is decoded and scored
//! against the published frame with PSNR and SSIM.

pub mod bus;
pub mod channel;
pub mod codec;
pub mod config;
pub mod display;
pub mod error;
pub mod pipeline;
pub mod quality;
pub mod report;
pub mod roundtrip;
pub mod source;
pub mod utils;
pub mod yuv;

pub use crate::config::{Cli, Config, RunConfig};
pub use crate::error::{Error, Result};
pub use crate::pipeline::{Evaluator, RunSummary};
