//! Live preview of source and reconstructed frames in verbose mode.
//! Never on the measurement path: failures are logged and the preview goes
//! quiet.

#[cfg(feature = "preview")]
pub mod sdl;

use tracing::{trace, warn};

use crate::source::PlanarFrame;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pane {
    Source,
    Reconstruction,
}

impl Pane {
    pub fn title(self) -> &'static str {
        match self {
            Pane::Source => "loopback: source",
            Pane::Reconstruction => "loopback: reconstruction",
        }
    }
}

pub trait Preview {
    fn show(&mut self, pane: Pane, frame: &PlanarFrame);
}

/// Preview that only traces what it would have shown
#[derive(Debug, Default)]
pub struct NoPreview;

impl Preview for NoPreview {
    fn show(&mut self, pane: Pane, frame: &PlanarFrame) {
        trace!("{:?} frame {}x{}", pane, frame.width(), frame.height());
    }
}

/// Windowed preview when asked for and compiled in
pub fn open(enabled: bool) -> Box<dyn Preview> {
    if !enabled {
        return Box::new(NoPreview);
    }
    #[cfg(feature = "preview")]
    {
        match sdl::Sdl2Preview::new() {
            Ok(preview) => return Box::new(preview),
            Err(e) => warn!("Preview unavailable: {:#}", e),
        }
    }
    #[cfg(not(feature = "preview"))]
    warn!("Preview requested but this build has no window support");
    Box::new(NoPreview)
}
