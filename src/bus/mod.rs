pub mod session;
pub mod wire;

pub use session::{BusError, EventBus, OD4_PORT};
pub use wire::{EncodedImage, Envelope, WireError};
