// src/convert/mod.rs

pub mod dsp;
pub mod remap;
pub mod resample;
pub mod sample;

pub use remap::RemapMatrix;
pub use resample::StreamResampler;
