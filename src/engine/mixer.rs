// src/engine/mixer.rs

/// Multiply-adds `src` into `dst` at `gain`. A short `src` only covers the
/// front of `dst`.
#[inline]
pub fn mul_add(dst: &mut [f32], src: &[f32], gain: f32) {
    for (d, s) in dst.iter_mut().zip(src) {
        *d += s * gain;
    }
}

/// Largest absolute sample.
pub fn peak(buf: &[f32]) -> f32 {
    buf.iter().fold(0.0f32, |m, s| m.max(s.abs()))
}

/// Scales the buffer down so its peak is 1.0. Buffers that don't clip are
/// left untouched, so this never amplifies.
pub fn normalize(buf: &mut [f32]) {
    let p = peak(buf);
    if p > 1.0 {
        let scale = 1.0 / p;
        for s in buf.iter_mut() {
            *s *= scale;
        }
    }
}

/// Master volume and hard clip ahead of sample format conversion.
pub fn finalize(buf: &mut [f32], volume: f32) {
    if (volume - 1.0).abs() > f32::EPSILON {
        for s in buf.iter_mut() {
            *s *= volume;
        }
    }
    for s in buf.iter_mut() {
        *s = s.clamp(-1.0, 1.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn mul_add_accumulates() {
        let mut dst = vec![0.1, 0.2, 0.3];
        mul_add(&mut dst, &[1.0, 1.0], 0.5);
        assert_relative_eq!(dst[0], 0.6);
        assert_relative_eq!(dst[1], 0.7);
        assert_relative_eq!(dst[2], 0.3);
    }

    #[test]
    fn quiet_buffer_is_bit_identical() {
        let orig = vec![0.25, -0.999, 1.0, 0.0];
        let mut buf = orig.clone();
        normalize(&mut buf);
        assert_eq!(buf, orig);
    }

    #[test]
    fn clipping_buffer_is_scaled_to_unit_peak() {
        let mut buf = vec![2.0, -1.0, 0.5];
        normalize(&mut buf);
        assert_relative_eq!(peak(&buf), 1.0);
        assert_relative_eq!(buf[1], -0.5);
    }

    #[test]
    fn finalize_applies_volume_then_clamps() {
        let mut buf = vec![0.5, -2.0];
        finalize(&mut buf, 0.5);
        assert_relative_eq!(buf[0], 0.25);
        assert_relative_eq!(buf[1], -1.0);
    }
}
