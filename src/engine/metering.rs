// src/engine/metering.rs

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

/// Lock-free meter values for one channel. The mixing thread writes, anyone reads.
#[derive(Default)]
pub struct ChannelMeter {
    peak: AtomicU32,
    hold: AtomicU32,
    rms: AtomicU32,
}

impl ChannelMeter {
    fn store(&self, peak: f32, hold: f32, rms: f32) {
        self.peak.store(peak.to_bits(), Ordering::Relaxed);
        self.hold.store(hold.to_bits(), Ordering::Relaxed);
        self.rms.store(rms.to_bits(), Ordering::Relaxed);
    }

    pub fn reading(&self) -> MeterReading {
        MeterReading {
            peak: f32::from_bits(self.peak.load(Ordering::Relaxed)),
            hold: f32::from_bits(self.hold.load(Ordering::Relaxed)),
            rms: f32::from_bits(self.rms.load(Ordering::Relaxed)),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct MeterReading {
    /// Peak of the last period.
    pub peak: f32,
    /// Held peak with release.
    pub hold: f32,
    pub rms: f32,
}

/// Meters of the final mix, left and right. Mono output mirrors into both.
#[derive(Default)]
pub struct OutputMeters {
    pub left: ChannelMeter,
    pub right: ChannelMeter,
}

impl OutputMeters {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn reset(&self) {
        self.left.store(0.0, 0.0, 0.0);
        self.right.store(0.0, 0.0, 0.0);
    }
}

/// Peak hold followed by exponential release.
struct HoldDecay {
    value: f32,
    hold_left: usize,
}

impl HoldDecay {
    fn update(&mut self, peak: f32, frames: usize, hold_frames: usize, decay: f32) -> f32 {
        if peak > self.value {
            self.value = peak;
            self.hold_left = hold_frames;
        } else if self.hold_left > 0 {
            self.hold_left = self.hold_left.saturating_sub(frames);
        } else {
            self.value *= decay;
            if self.value < 1e-20 {
                self.value = 0.0;
            }
        }
        self.value
    }
}

/// Meter state owned by the mixing thread.
pub struct MeterState {
    sample_rate: u32,
    decay_coeff: f32,
    hold_frames: usize,
    left: HoldDecay,
    right: HoldDecay,
}

impl MeterState {
    pub fn new(sample_rate: u32) -> Self {
        let rate = sample_rate.max(1) as f32;
        // 300ms release, 500ms hold
        let decay_coeff = (-1.0 / (0.300 * rate)).exp();
        let hold_frames = (0.500 * rate) as usize;
        Self {
            sample_rate,
            decay_coeff,
            hold_frames,
            left: HoldDecay { value: 0.0, hold_left: 0 },
            right: HoldDecay { value: 0.0, hold_left: 0 },
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn process_block(&mut self, buffer: &[f32], channels: usize, meters: &OutputMeters) {
        if channels == 0 {
            return;
        }
        let frames = buffer.len() / channels;
        if frames == 0 {
            return;
        }
        let right_ch = if channels > 1 { 1 } else { 0 };

        let (mut max_l, mut max_r, mut sq_l, mut sq_r) = (0.0f32, 0.0f32, 0.0f32, 0.0f32);
        for frame in buffer.chunks_exact(channels) {
            let (l, r) = (frame[0], frame[right_ch]);
            max_l = max_l.max(l.abs());
            max_r = max_r.max(r.abs());
            sq_l += l * l;
            sq_r += r * r;
        }

        let block_decay = self.decay_coeff.powf(frames as f32);
        let hold_l = self.left.update(max_l, frames, self.hold_frames, block_decay);
        let hold_r = self.right.update(max_r, frames, self.hold_frames, block_decay);

        meters.left.store(max_l, hold_l, (sq_l / frames as f32).sqrt());
        meters.right.store(max_r, hold_r, (sq_r / frames as f32).sqrt());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn peak_and_rms_of_a_block() {
        let meters = OutputMeters::new();
        let mut state = MeterState::new(48_000);
        state.process_block(&[0.5, -0.25, -0.5, 0.25], 2, &meters);
        let l = meters.left.reading();
        let r = meters.right.reading();
        assert_relative_eq!(l.peak, 0.5);
        assert_relative_eq!(l.rms, 0.5);
        assert_relative_eq!(r.peak, 0.25);
        assert_relative_eq!(r.hold, 0.25);
    }

    #[test]
    fn hold_outlasts_peak_then_releases() {
        let meters = OutputMeters::new();
        let mut state = MeterState::new(1000);
        state.process_block(&[0.8], 1, &meters);
        let silence = vec![0.0f32; 100];
        state.process_block(&silence, 1, &meters);
        assert_relative_eq!(meters.left.reading().hold, 0.8);
        assert_relative_eq!(meters.left.reading().peak, 0.0);
        for _ in 0..10 {
            state.process_block(&silence, 1, &meters);
        }
        assert!(meters.left.reading().hold < 0.8);
        assert_relative_eq!(meters.right.reading().peak, meters.left.reading().peak);
    }
}
