//! SDL2 preview windows, one per pane, sized by the first frame shown

use color_eyre::{eyre::eyre, Result};
use sdl2::event::Event;
use sdl2::pixels::PixelFormatEnum;
use sdl2::render::{Canvas, TextureCreator};
use sdl2::video::{Window, WindowContext};
use sdl2::{EventPump, Sdl, VideoSubsystem};
use tracing::{info, warn};

use super::{Pane, Preview};
use crate::source::PlanarFrame;
use crate::yuv;

struct PaneWindow {
    canvas: Canvas<Window>,
    texture_creator: TextureCreator<WindowContext>,
}

impl PaneWindow {
    fn new(video: &VideoSubsystem, pane: Pane, width: u32, height: u32) -> Result<Self> {
        let window = video.window(pane.title(), width, height).position_centered().build()?;
        let canvas = window.into_canvas().build()?;
        let texture_creator = canvas.texture_creator();
        Ok(Self {
            canvas,
            texture_creator,
        })
    }

    fn render(&mut self, frame: &PlanarFrame) -> Result<()> {
        let rgba = yuv::i420_to_rgba(frame)?;
        let mut texture = self
            .texture_creator
            .create_texture_streaming(PixelFormatEnum::RGBA32, frame.width(), frame.height())
            .map_err(|e| eyre!(e))?;
        texture
            .update(None, &rgba, frame.width() as usize * 4)
            .map_err(|e| eyre!(e))?;

        self.canvas.clear();
        // Scaled to the window if later frames differ in size
        self.canvas.copy(&texture, None, None).map_err(|e| eyre!(e))?;
        self.canvas.present();
        Ok(())
    }
}

pub struct Sdl2Preview {
    _context: Sdl,
    video: VideoSubsystem,
    event_pump: EventPump,
    source: Option<PaneWindow>,
    reconstruction: Option<PaneWindow>,
    closed: bool,
}

impl Sdl2Preview {
    pub fn new() -> Result<Self> {
        let context = sdl2::init().map_err(|e| eyre!(e))?;
        let video = context.video().map_err(|e| eyre!(e))?;
        let event_pump = context.event_pump().map_err(|e| eyre!(e))?;
        Ok(Self {
            _context: context,
            video,
            event_pump,
            source: None,
            reconstruction: None,
            closed: false,
        })
    }

    fn pump_events(&mut self) {
        for event in self.event_pump.poll_iter() {
            if let Event::Quit { .. } = event {
                info!("Preview closed");
                self.closed = true;
            }
        }
    }

    fn try_show(&mut self, pane: Pane, frame: &PlanarFrame) -> Result<()> {
        let slot = match pane {
            Pane::Source => &mut self.source,
            Pane::Reconstruction => &mut self.reconstruction,
        };
        if slot.is_none() {
            *slot = Some(PaneWindow::new(&self.video, pane, frame.width(), frame.height())?);
        }
        match slot {
            Some(window) => window.render(frame),
            None => Ok(()),
        }
    }
}

impl Preview for Sdl2Preview {
    fn show(&mut self, pane: Pane, frame: &PlanarFrame) {
        self.pump_events();
        if self.closed {
            self.source = None;
            self.reconstruction = None;
            return;
        }
        if let Err(e) = self.try_show(pane, frame) {
            warn!("Closing preview after render failure: {:#}", e);
            self.closed = true;
        }
    }
}
