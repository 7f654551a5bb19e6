// src/stream/fade.rs

/// Linear volume ramp measured in output frames.
#[derive(Clone, Debug, Default)]
pub struct Fade {
    from: f32,
    to: f32,
    total_frames: u64,
    elapsed_frames: u64,
    running: bool,
}

impl Fade {
    pub fn start(from: f32, to: f32, duration_ms: u32, sample_rate: u32) -> Self {
        let total_frames = sample_rate as u64 * duration_ms as u64 / 1000;
        Self {
            from,
            to,
            total_frames,
            elapsed_frames: 0,
            running: total_frames > 0,
        }
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn target(&self) -> f32 {
        self.to
    }

    /// Volume at the current position.
    pub fn volume(&self) -> f32 {
        if !self.running || self.total_frames == 0 {
            return self.to;
        }
        let t = self.elapsed_frames as f32 / self.total_frames as f32;
        self.from + (self.to - self.from) * t
    }

    /// Moves the ramp forward by `frames` and returns the new volume. The
    /// fade stops and pins to its target once the duration has elapsed.
    pub fn advance(&mut self, frames: usize) -> f32 {
        if !self.running {
            return self.to;
        }
        self.elapsed_frames += frames as u64;
        if self.elapsed_frames >= self.total_frames {
            self.elapsed_frames = self.total_frames;
            self.running = false;
        }
        self.volume()
    }
}
