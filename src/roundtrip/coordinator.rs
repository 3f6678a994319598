//! One publish → notify → wait cycle per frame

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, instrument, trace, warn};

use super::latch::{CompressedReply, ReplyLatch};
use crate::channel::{ChannelError, Published, SharedFrameChannel};
use crate::source::PlanarFrame;
use crate::utils::CancelToken;

pub const POLL_INTERVAL: Duration = Duration::from_millis(1);

/// How a round trip ended
#[derive(Debug, Clone)]
pub enum RoundOutcome {
    Replied {
        reply: Arc<CompressedReply>,
        sequence: u64,
        /// reply.sent - published, never negative
        duration_us: i64,
    },
    TimedOut {
        sequence: u64,
    },
    Cancelled,
}

pub struct RoundTripCoordinator {
    channel: SharedFrameChannel,
    latch: Arc<ReplyLatch>,
    timeout: Duration,
    cancel: CancelToken,
}

impl RoundTripCoordinator {
    pub fn new(
        channel: SharedFrameChannel,
        latch: Arc<ReplyLatch>,
        timeout: Duration,
        cancel: CancelToken,
    ) -> Self {
        Self {
            channel,
            latch,
            timeout,
            cancel,
        }
    }

    pub fn channel(&self) -> &SharedFrameChannel {
        &self.channel
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Hand `frame` to the external encoder and wait for its reply
    #[instrument(skip_all, fields(bytes = frame.len()))]
    pub async fn round_trip(&self, frame: &PlanarFrame) -> Result<RoundOutcome, ChannelError> {
        // Anything latched before this publish belongs to an earlier round
        self.latch.clear();
        let Some(Published {
            sequence,
            timestamp: published,
        }) = self.publish(frame).await?
        else {
            return Ok(RoundOutcome::Cancelled);
        };
        let deadline = Instant::now() + self.timeout;

        loop {
            if self.cancel.is_cancelled() {
                return Ok(RoundOutcome::Cancelled);
            }
            if let Some(reply) = self.latch.take() {
                if reply.sent < published {
                    metrics::counter!("loopback_stale_replies_total").increment(1);
                    warn!(
                        "Discarding {} reply sent at {} before frame #{} was published at {}",
                        reply.fourcc, reply.sent, sequence, published
                    );
                } else {
                    let duration_us = reply.sent.micros_since(published);
                    debug!(
                        "Frame #{} answered with {} bytes of {} after {} µs",
                        sequence,
                        reply.payload.len(),
                        reply.fourcc,
                        duration_us
                    );
                    return Ok(RoundOutcome::Replied {
                        reply,
                        sequence,
                        duration_us,
                    });
                }
            }
            if Instant::now() >= deadline {
                return Ok(RoundOutcome::TimedOut { sequence });
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    /// Wait for the slot without blocking the runtime. `None` if cancelled
    /// first; an error if another party holds it for the whole timeout.
    async fn publish(&self, frame: &PlanarFrame) -> Result<Option<Published>, ChannelError> {
        let deadline = Instant::now() + self.timeout;
        loop {
            if self.cancel.is_cancelled() {
                return Ok(None);
            }
            if let Some(published) = self.channel.try_publish(frame)? {
                return Ok(Some(published));
            }
            if Instant::now() >= deadline {
                return Err(ChannelError::Busy(self.timeout));
            }
            trace!("Shared memory busy, retrying");
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }
}
