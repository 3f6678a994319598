use std::time::Duration;

use thiserror::Error;

use crate::bus::BusError;
use crate::channel::ChannelError;
use crate::codec::Codec;
use crate::config::ConfigError;
use crate::source::SourceError;

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Source(#[from] SourceError),
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error(transparent)]
    Bus(#[from] BusError),
    #[error("failed to initialize the {codec} decoder: {reason}")]
    DecoderInit { codec: Codec, reason: String },
    #[error("no reply from the encoder within {0:?}")]
    Timeout(Duration),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
