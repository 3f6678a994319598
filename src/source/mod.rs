pub mod folder;
pub mod frame;

pub use folder::{FrameSource, SourceError, SourceFrame};
pub use frame::{FrameError, Geometry, PlanarFrame, Timestamp};
