pub mod shm;

pub use shm::{ChannelError, ExclusiveAccess, Published, SharedFrameChannel};
