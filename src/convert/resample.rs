// src/convert/resample.rs

use rubato::{
    calculate_cutoff, Resampler, SincFixedIn, SincInterpolationParameters,
    SincInterpolationType, WindowFunction,
};

use crate::convert::dsp;
use crate::error::{AeError, AeResult};

const CHUNK_SIZE: usize = 1024;
const MAX_RATIO_RELATIVE: f64 = 2.0;

fn build_sinc(ratio: f64, channels: usize) -> AeResult<SincFixedIn<f32>> {
    let sinc_len = 256usize;
    let window = WindowFunction::BlackmanHarris2;
    let f_cutoff = calculate_cutoff(sinc_len, window);
    let params = SincInterpolationParameters {
        sinc_len,
        f_cutoff,
        interpolation: SincInterpolationType::Linear,
        oversampling_factor: 128,
        window,
    };
    SincFixedIn::<f32>::new(ratio, MAX_RATIO_RELATIVE, params, CHUNK_SIZE, channels)
        .map_err(|e| AeError::Resampler(e.to_string()))
}

/// Sample-rate converter for one stream. Takes interleaved input of any
/// length, stages it planar and runs rubato once a full chunk is available.
pub struct StreamResampler {
    inner: SincFixedIn<f32>,
    channels: usize,
    base_ratio: f64,
    ratio: f64,
    stage_planar: Vec<Vec<f32>>,
}

impl StreamResampler {
    /// Returns `None` when the rates match and no resampling was forced.
    pub fn build(
        src_rate: u32,
        dst_rate: u32,
        channels: usize,
        force: bool,
    ) -> AeResult<Option<Self>> {
        if src_rate == dst_rate && !force {
            return Ok(None);
        }
        Self::new(src_rate, dst_rate, channels).map(Some)
    }

    pub fn new(src_rate: u32, dst_rate: u32, channels: usize) -> AeResult<Self> {
        if src_rate == 0 || dst_rate == 0 || channels == 0 {
            return Err(AeError::Resampler(format!(
                "cannot resample {src_rate}Hz -> {dst_rate}Hz with {channels} channels"
            )));
        }
        let ratio = dst_rate as f64 / src_rate as f64;
        Ok(Self {
            inner: build_sinc(ratio, channels)?,
            channels,
            base_ratio: ratio,
            ratio,
            stage_planar: vec![Vec::with_capacity(CHUNK_SIZE * 2); channels],
        })
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    /// Output rate divided by input rate.
    pub fn ratio(&self) -> f64 {
        self.ratio
    }

    /// Changes the conversion ratio on the fly. Must stay within a factor of
    /// two of the ratio the resampler was built with.
    pub fn set_ratio(&mut self, ratio: f64) -> AeResult<()> {
        let lo = self.base_ratio / MAX_RATIO_RELATIVE;
        let hi = self.base_ratio * MAX_RATIO_RELATIVE;
        if !(lo..=hi).contains(&ratio) {
            return Err(AeError::Resampler(format!(
                "ratio {ratio} outside {lo}..={hi}"
            )));
        }
        self.inner
            .set_resample_ratio(ratio, true)
            .map_err(|e| AeError::Resampler(e.to_string()))?;
        self.ratio = ratio;
        Ok(())
    }

    /// Input frames held back waiting for a full chunk.
    pub fn pending_frames(&self) -> usize {
        dsp::planar_len(&self.stage_planar)
    }

    /// Upper bound of frames one `process` chunk can produce.
    pub fn output_frames_max(&self) -> usize {
        self.inner.output_frames_max()
    }

    /// Feeds interleaved input and appends every completed output chunk,
    /// interleaved, to `out`. Returns the number of output frames appended.
    pub fn process(&mut self, input: &[f32], out: &mut Vec<f32>) -> AeResult<usize> {
        dsp::append_interleaved_to_planar(input, &mut self.stage_planar, self.channels);
        let mut produced = 0;
        loop {
            let need = self.inner.input_frames_next();
            if dsp::planar_len(&self.stage_planar) < need {
                break;
            }
            let in_block = dsp::take_from_planar(&mut self.stage_planar, need);
            let block = self
                .inner
                .process(&in_block, None)
                .map_err(|e| AeError::Resampler(e.to_string()))?;
            produced += dsp::planar_len(&block);
            dsp::interleave_into(&block, out);
        }
        Ok(produced)
    }

    /// Pushes staged input plus the filter tail through, appending to `out`.
    pub fn flush(&mut self, out: &mut Vec<f32>) -> AeResult<usize> {
        let mut produced = 0;
        let have = dsp::planar_len(&self.stage_planar);
        if have > 0 {
            let in_block = dsp::take_from_planar(&mut self.stage_planar, have);
            let block = self
                .inner
                .process_partial(Some(in_block.as_slice()), None)
                .map_err(|e| AeError::Resampler(e.to_string()))?;
            produced += dsp::planar_len(&block);
            dsp::interleave_into(&block, out);
        }
        let tail = self
            .inner
            .process_partial::<Vec<f32>>(None, None)
            .map_err(|e| AeError::Resampler(e.to_string()))?;
        produced += dsp::planar_len(&tail);
        dsp::interleave_into(&tail, out);
        Ok(produced)
    }

    /// Drops staged input and filter history.
    pub fn reset(&mut self) {
        for ch in &mut self.stage_planar {
            ch.clear();
        }
        self.inner.reset();
    }
}
