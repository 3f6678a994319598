pub mod coordinator;
pub mod latch;

pub use coordinator::{RoundOutcome, RoundTripCoordinator, POLL_INTERVAL};
pub use latch::{CompressedReply, ReplyLatch};
