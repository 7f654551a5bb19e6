// src/error.rs

use thiserror::Error;

use crate::format::DataFormat;

/// Errors surfaced by the engine, its streams and the sinks.
#[derive(Error, Debug)]
pub enum AeError {
    /// The sink could not be opened on the requested device/format.
    #[error("failed to open sink '{device}': {reason}")]
    SinkOpen { device: String, reason: String },

    #[error("unsupported data format: {0:?}")]
    UnsupportedFormat(DataFormat),

    /// Resampler or remap matrix could not be built for a stream.
    #[error("stream initialization failed: {0}")]
    StreamInit(String),

    #[error("resampler error: {0}")]
    Resampler(String),

    #[error("encoder error: {0}")]
    Encoder(String),

    /// A bitstream pack call failed; no partial frame was emitted.
    #[error("bitstream pack failed: {0}")]
    Pack(String),

    #[error("sink write failed: {0}")]
    SinkWrite(String),

    #[error("engine is not running")]
    NotRunning,

    #[error("decode error: {0}")]
    Decode(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type AeResult<T> = Result<T, AeError>;
