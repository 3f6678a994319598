//! Single-writer handoff of the latest encoded reply

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use bytes::Bytes;
use crossbeam::utils::CachePadded;
use tracing::{trace, warn};

use crate::bus::{EncodedImage, Envelope};
use crate::source::Timestamp;

/// Encoded frame captured from the bus
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompressedReply {
    pub fourcc: String,
    pub payload: Bytes,
    /// Publish time stamped by the sender
    pub sent: Timestamp,
}

/// Latch between the bus dispatcher (writer) and the coordinator (reader).
/// The payload is stored before the flag is raised with release ordering;
/// the reader checks the flag with acquire ordering before loading it.
#[derive(Default)]
pub struct ReplyLatch {
    ready: CachePadded<AtomicBool>,
    reply: ArcSwapOption<CompressedReply>,
    received: AtomicU64,
}

impl ReplyLatch {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set(&self, reply: CompressedReply) {
        self.reply.store(Some(Arc::new(reply)));
        self.ready.store(true, Ordering::Release);
        self.received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn clear(&self) {
        self.ready.store(false, Ordering::Release);
    }

    pub fn is_set(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    /// Consume the latched reply, if any
    pub fn take(&self) -> Option<Arc<CompressedReply>> {
        if self.ready.swap(false, Ordering::AcqRel) {
            self.reply.load_full()
        } else {
            None
        }
    }

    /// Replies latched since creation
    pub fn received(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }

    /// Bus trigger that latches every decodable encoded image
    pub fn handler(self: &Arc<Self>) -> impl Fn(Envelope) + Send + 'static {
        let latch = Arc::clone(self);
        move |envelope: Envelope| match EncodedImage::decode(&envelope.serialized_data) {
            Ok(image) => {
                trace!(
                    "Latched {} reply of {} bytes sent at {}",
                    image.fourcc,
                    image.data.len(),
                    envelope.sent
                );
                latch.set(CompressedReply {
                    fourcc: image.fourcc,
                    payload: image.data,
                    sent: envelope.sent,
                });
            }
            Err(e) => warn!("Ignoring malformed encoded image: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn reply(byte: u8) -> CompressedReply {
        CompressedReply {
            fourcc: "h264".into(),
            payload: Bytes::from(vec![byte; 4]),
            sent: Timestamp(i64::from(byte)),
        }
    }

    #[test]
    fn take_consumes_the_latch() {
        let latch = ReplyLatch::new();
        assert!(latch.take().is_none());
        latch.set(reply(1));
        assert!(latch.is_set());
        assert_eq!(*latch.take().unwrap(), reply(1));
        assert!(!latch.is_set());
        assert!(latch.take().is_none());
    }

    #[test]
    fn clear_discards_an_unread_reply() {
        let latch = ReplyLatch::new();
        latch.set(reply(1));
        latch.clear();
        assert!(latch.take().is_none());
        assert_eq!(latch.received(), 1);
    }

    #[test]
    fn payload_is_visible_once_the_flag_is() {
        let latch = ReplyLatch::new();
        let writer = {
            let latch = latch.clone();
            thread::spawn(move || latch.set(reply(9)))
        };
        let seen = loop {
            if let Some(seen) = latch.take() {
                break seen;
            }
            thread::yield_now();
        };
        writer.join().unwrap();
        assert_eq!(seen.payload.len(), 4);
        assert_eq!(seen.sent, Timestamp(9));
    }

    #[test]
    fn handler_decodes_the_envelope() {
        let latch = ReplyLatch::new();
        let handler = latch.handler();
        let image = EncodedImage {
            fourcc: "VP80".into(),
            width: 2,
            height: 2,
            data: Bytes::from_static(b"abc"),
        };
        handler(image.into_envelope(Timestamp(5)));
        let latched = latch.take().unwrap();
        assert_eq!(latched.fourcc, "VP80");
        assert_eq!(&latched.payload[..], b"abc");
        assert_eq!(latched.sent, Timestamp(5));
    }
}
