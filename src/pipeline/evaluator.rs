//! The evaluation loop: image → channel → encoder → bus → decoder → score

use std::time::Duration;

use tracing::{debug, info, instrument, warn};

use crate::bus::{EncodedImage, EventBus};
use crate::channel::SharedFrameChannel;
use crate::codec::{CodecDispatcher, DecoderFactory, NativeDecoders};
use crate::config::RunConfig;
use crate::display::{self, Pane, Preview};
use crate::quality;
use crate::report::{self, QualityRecord, Reporter};
use crate::roundtrip::{CompressedReply, ReplyLatch, RoundOutcome, RoundTripCoordinator};
use crate::source::{FrameSource, Geometry, SourceFrame};
use crate::utils::{self, CancelToken};
use crate::{Error, Result};

/// What a run did
#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    /// Frames published to the encoder
    pub rounds: u64,
    pub scored: u64,
    pub timeouts: u64,
    pub not_decoded: u64,
    /// Inputs that could not be turned into a frame
    pub skipped_inputs: u64,
    pub cancelled: bool,
    pub geometry: Option<Geometry>,
    /// Zero until the first frame created the channel
    pub channel_size: usize,
    /// Most recent scored round
    pub last_record: Option<QualityRecord>,
    psnr_sum: f64,
    ssim_sum: f64,
}

impl RunSummary {
    fn record(&mut self, record: QualityRecord) {
        self.scored += 1;
        self.psnr_sum += record.score.psnr;
        self.ssim_sum += record.score.ssim;
        self.last_record = Some(record);
    }

    pub fn mean_psnr(&self) -> Option<f64> {
        self.mean(self.psnr_sum)
    }

    pub fn mean_ssim(&self) -> Option<f64> {
        self.mean(self.ssim_sum)
    }

    fn mean(&self, sum: f64) -> Option<f64> {
        (self.scored > 0).then(|| sum / self.scored as f64)
    }
}

enum Flow {
    Continue,
    Stop,
}

pub struct Evaluator {
    config: RunConfig,
    cancel: CancelToken,
    decoders: Box<dyn DecoderFactory>,
}

impl Evaluator {
    pub fn new(config: RunConfig, cancel: CancelToken) -> Self {
        Self {
            config,
            cancel,
            decoders: Box::new(NativeDecoders),
        }
    }

    /// Replace the compiled-in decoders
    pub fn with_decoders(mut self, decoders: impl DecoderFactory + 'static) -> Self {
        self.decoders = Box::new(decoders);
        self
    }

    /// Feed every input image through the external encoder once
    #[instrument(skip_all, fields(folder = %self.config.folder.display(), name = %self.config.name))]
    pub async fn run(self, bus: &EventBus) -> Result<RunSummary> {
        let Evaluator {
            config,
            cancel,
            decoders,
        } = self;

        let latch = ReplyLatch::new();
        bus.data_trigger(EncodedImage::ID, latch.handler());

        let mut source = FrameSource::new(&config.folder, config.crop);
        let entries = source.entries()?;
        info!("Found {} images in {}", entries.len(), config.folder.display());

        let mut run = Run {
            reporter: Reporter::open(config.report.as_deref()),
            dispatcher: CodecDispatcher::new(decoders),
            preview: display::open(config.verbose),
            summary: RunSummary::default(),
            config: &config,
        };
        let mut coordinator: Option<RoundTripCoordinator> = None;

        for (index, path) in entries.iter().enumerate() {
            if cancel.is_cancelled() {
                run.summary.cancelled = true;
                break;
            }
            if config.stop_after.is_some_and(|limit| run.summary.rounds >= limit) {
                break;
            }
            let position = index + 1;
            debug!("Processing {}/{}: '{}'", position, entries.len(), path.display());

            let input = match source.load(path) {
                Ok(input) => input,
                Err(e) if e.is_fatal() => return Err(e.into()),
                Err(e) => {
                    warn!("Skipping input: {}", e);
                    run.summary.skipped_inputs += 1;
                    continue;
                }
            };

            if coordinator.is_none() {
                let geometry = source
                    .geometry()
                    .unwrap_or_else(|| Geometry::full(input.frame.width(), input.frame.height()));
                let channel = SharedFrameChannel::create(&config.name, geometry.i420_len())?;
                info!(
                    "Created shared memory '{}' of size {} holding an i420 frame of size {}x{}",
                    channel.name(),
                    channel.size(),
                    geometry.width,
                    geometry.height
                );
                run.summary.geometry = Some(geometry);
                run.summary.channel_size = channel.size();
                coordinator = Some(RoundTripCoordinator::new(
                    channel,
                    latch.clone(),
                    config.timeout,
                    cancel.clone(),
                ));
                // Give the encoder time to attach
                if !utils::pace(config.start_delay, &cancel).await {
                    run.summary.cancelled = true;
                    break;
                }
            }
            let Some(active) = coordinator.as_ref() else {
                continue;
            };

            if let Flow::Stop = run.round(active, position, &input).await? {
                break;
            }

            let last = position == entries.len();
            let limit_reached = config.stop_after.is_some_and(|limit| run.summary.rounds >= limit);
            if !last && !limit_reached && !utils::pace(config.delay, &cancel).await {
                run.summary.cancelled = true;
                break;
            }
        }

        Ok(run.summary)
    }
}

/// Per-run state shared by all rounds
struct Run<'a> {
    config: &'a RunConfig,
    reporter: Reporter,
    dispatcher: CodecDispatcher,
    preview: Box<dyn Preview>,
    summary: RunSummary,
}

impl Run<'_> {
    #[instrument(skip_all, fields(round = position))]
    async fn round(&mut self, coordinator: &RoundTripCoordinator, position: usize, source: &SourceFrame) -> Result<Flow> {
        self.preview.show(Pane::Source, &source.frame);

        let outcome = coordinator.round_trip(&source.frame).await?;
        if matches!(outcome, RoundOutcome::Cancelled) {
            self.summary.cancelled = true;
            return Ok(Flow::Stop);
        }
        self.summary.rounds += 1;
        metrics::counter!("loopback_rounds_total").increment(1);

        match outcome {
            RoundOutcome::Replied { reply, duration_us, .. } => {
                metrics::histogram!("loopback_round_trip_us").record(duration_us as f64);
                self.evaluate(position, source, &reply, duration_us)?;
            }
            RoundOutcome::TimedOut { sequence } => {
                self.summary.timeouts += 1;
                metrics::counter!("loopback_timeouts_total").increment(1);
                warn!("Timed out while waiting for encoded frame #{}", sequence);
                if self.config.exit_on_timeout {
                    return Err(Error::Timeout(coordinator.timeout()));
                }
            }
            RoundOutcome::Cancelled => {}
        }
        Ok(Flow::Continue)
    }

    fn evaluate(
        &mut self,
        position: usize,
        source: &SourceFrame,
        reply: &CompressedReply,
        duration_us: i64,
    ) -> Result<()> {
        debug!("Received {} of size {}", reply.fourcc, reply.payload.len());
        let geometry = self
            .summary
            .geometry
            .unwrap_or_else(|| Geometry::full(source.frame.width(), source.frame.height()));

        let decoded = self.dispatcher.decode(reply, geometry)?;
        for frame in &decoded {
            self.preview.show(Pane::Reconstruction, frame);
        }
        let Some(reconstruction) = decoded.last() else {
            self.summary.not_decoded += 1;
            warn!("Frame {} was not decoded, no score", position);
            return Ok(());
        };

        let score = quality::score(&source.frame, reconstruction);
        metrics::histogram!("loopback_psnr_db").record(score.psnr);

        if self.config.save_png {
            let target = self.config.png_dir.join(report::reconstruction_name(position));
            if let Err(e) = report::save_reconstruction(reconstruction, &target) {
                warn!("Failed to save {}: {}", target.display(), e);
            }
        }

        let record = QualityRecord {
            file: source.path.clone(),
            geometry,
            compressed_len: reply.payload.len(),
            score,
            duration_us,
        };
        self.reporter.append(&record);
        self.summary.record(record);
        Ok(())
    }
}

/// Log the outcome of a run
pub fn log_summary(summary: &RunSummary, elapsed: Duration) {
    info!(
        "{} rounds in {:.1?}: {} scored, {} not decoded, {} timed out, {} inputs skipped{}",
        summary.rounds,
        elapsed,
        summary.scored,
        summary.not_decoded,
        summary.timeouts,
        summary.skipped_inputs,
        if summary.cancelled { " (interrupted)" } else { "" }
    );
    if let (Some(psnr), Some(ssim)) = (summary.mean_psnr(), summary.mean_ssim()) {
        info!("Mean PSNR {:.3} dB, mean SSIM {:.5}", psnr, ssim);
    }
}
