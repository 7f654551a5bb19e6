// src/lib.rs

pub mod bitstream;
pub mod config;
pub mod convert;
pub mod encoder;
pub mod engine;
pub mod error;
pub mod format;
pub mod sink;
pub mod sound;
pub mod stream;

pub use config::EngineConfig;
pub use engine::{Engine, StreamStage};
pub use error::{AeError, AeResult};
pub use format::{AudioFormat, ChannelLayout, ChannelRole, DataFormat, StdLayout};
pub use sound::Sound;
pub use stream::{Stream, StreamOptions};
