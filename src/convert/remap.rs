// src/convert/remap.rs

use crate::error::{AeError, AeResult};
use crate::format::{ChannelLayout, ChannelRole};

const CENTER_MIX: f32 = std::f32::consts::FRAC_1_SQRT_2;

/// Gain matrix mapping an input channel layout onto an output layout.
///
/// Rows are output channels, columns input channels. A row whose gains sum
/// above 1.0 is scaled back down so a full-scale input can't clip the output
/// on its own.
#[derive(Clone, Debug)]
pub struct RemapMatrix {
    in_channels: usize,
    out_channels: usize,
    gains: Vec<f32>,
    identity: bool,
}

impl RemapMatrix {
    pub fn new(input: &ChannelLayout, output: &ChannelLayout) -> AeResult<Self> {
        let in_channels = input.count();
        let out_channels = output.count();
        if in_channels == 0 || out_channels == 0 {
            return Err(AeError::StreamInit(format!(
                "cannot remap [{input}] to [{output}]"
            )));
        }

        if input == output {
            let mut gains = vec![0.0; in_channels * out_channels];
            for i in 0..in_channels {
                gains[i * in_channels + i] = 1.0;
            }
            return Ok(Self { in_channels, out_channels, gains, identity: true });
        }

        let mut gains = vec![0.0f32; in_channels * out_channels];
        let mut routed_any = false;
        for (ic, role) in input.roles().iter().enumerate() {
            for (target, gain) in routes_for(*role, input, output) {
                if let Some(oc) = output.position(target) {
                    gains[oc * in_channels + ic] += gain;
                    routed_any = true;
                }
            }
        }
        if !routed_any {
            return Err(AeError::StreamInit(format!(
                "no channel of [{input}] can be routed to [{output}]"
            )));
        }

        for oc in 0..out_channels {
            let row = &mut gains[oc * in_channels..(oc + 1) * in_channels];
            let sum: f32 = row.iter().sum();
            if sum > 1.0 {
                row.iter_mut().for_each(|g| *g /= sum);
            }
        }

        Ok(Self { in_channels, out_channels, gains, identity: false })
    }

    pub fn in_channels(&self) -> usize {
        self.in_channels
    }

    pub fn out_channels(&self) -> usize {
        self.out_channels
    }

    pub fn is_identity(&self) -> bool {
        self.identity
    }

    pub fn gain(&self, out_ch: usize, in_ch: usize) -> f32 {
        self.gains[out_ch * self.in_channels + in_ch]
    }

    /// Remaps interleaved `input`, appending to `out`.
    pub fn remap_into(&self, input: &[f32], out: &mut Vec<f32>) {
        if self.identity {
            out.extend_from_slice(input);
            return;
        }
        let frames = input.len() / self.in_channels;
        out.reserve(frames * self.out_channels);
        for frame in input.chunks_exact(self.in_channels) {
            for oc in 0..self.out_channels {
                let row = &self.gains[oc * self.in_channels..(oc + 1) * self.in_channels];
                let s: f32 = row.iter().zip(frame).map(|(g, x)| g * x).sum();
                out.push(s);
            }
        }
    }
}

/// Where a role ends up when the output layout lacks it.
fn routes_for(
    role: ChannelRole,
    input: &ChannelLayout,
    output: &ChannelLayout,
) -> Vec<(ChannelRole, f32)> {
    use ChannelRole::*;

    if output.contains(role) {
        return vec![(role, 1.0)];
    }

    match role {
        FC => {
            // A lone centre (mono source) is duplicated at full level.
            if !input.contains(FL) && !input.contains(FR) {
                vec![(FL, 1.0), (FR, 1.0)]
            } else {
                vec![(FL, CENTER_MIX), (FR, CENTER_MIX)]
            }
        }
        FL | FR => vec![(FC, 1.0)],
        FLOC => vec![(FL, 1.0), (FC, CENTER_MIX)],
        FROC => vec![(FR, 1.0), (FC, CENTER_MIX)],
        BL => side_or_front(output, SL, FL),
        BR => side_or_front(output, SR, FR),
        SL => side_or_front(output, BL, FL),
        SR => side_or_front(output, BR, FR),
        BC => {
            if output.contains(BL) || output.contains(BR) {
                vec![(BL, CENTER_MIX), (BR, CENTER_MIX)]
            } else if output.contains(SL) || output.contains(SR) {
                vec![(SL, CENTER_MIX), (SR, CENTER_MIX)]
            } else {
                vec![(FL, 0.5), (FR, 0.5), (FC, CENTER_MIX)]
            }
        }
        LFE => Vec::new(),
    }
}

fn side_or_front(output: &ChannelLayout, alt: ChannelRole, front: ChannelRole) -> Vec<(ChannelRole, f32)> {
    if output.contains(alt) {
        vec![(alt, 1.0)]
    } else if output.contains(front) {
        vec![(front, CENTER_MIX)]
    } else {
        vec![(ChannelRole::FC, CENTER_MIX)]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::StdLayout;
    use approx::assert_relative_eq;

    #[test]
    fn identical_layouts_pass_through() {
        let l = ChannelLayout::from_std(StdLayout::FiveOne);
        let m = RemapMatrix::new(&l, &l).unwrap();
        assert!(m.is_identity());
        let mut out = Vec::new();
        m.remap_into(&[0.1, 0.2, 0.3, 0.4, 0.5, 0.6], &mut out);
        assert_eq!(out, vec![0.1, 0.2, 0.3, 0.4, 0.5, 0.6]);
    }

    #[test]
    fn mono_is_duplicated_to_stereo() {
        let m = RemapMatrix::new(
            &ChannelLayout::from_std(StdLayout::Mono),
            &ChannelLayout::from_std(StdLayout::Stereo),
        )
        .unwrap();
        let mut out = Vec::new();
        m.remap_into(&[0.5, -0.25], &mut out);
        assert_eq!(out, vec![0.5, 0.5, -0.25, -0.25]);
    }

    #[test]
    fn stereo_folds_to_mono_without_clipping() {
        let m = RemapMatrix::new(
            &ChannelLayout::from_std(StdLayout::Stereo),
            &ChannelLayout::from_std(StdLayout::Mono),
        )
        .unwrap();
        assert_relative_eq!(m.gain(0, 0), 0.5);
        assert_relative_eq!(m.gain(0, 1), 0.5);
        let mut out = Vec::new();
        m.remap_into(&[1.0, 1.0], &mut out);
        assert_relative_eq!(out[0], 1.0);
    }

    #[test]
    fn surround_downmix_drops_lfe_and_keeps_rows_bounded() {
        let m = RemapMatrix::new(
            &ChannelLayout::from_std(StdLayout::FiveOne),
            &ChannelLayout::from_std(StdLayout::Stereo),
        )
        .unwrap();
        // LFE is column 3
        assert_eq!(m.gain(0, 3), 0.0);
        assert_eq!(m.gain(1, 3), 0.0);
        for oc in 0..2 {
            let sum: f32 = (0..6).map(|ic| m.gain(oc, ic)).sum();
            assert!(sum <= 1.0 + 1e-6);
        }
    }

    #[test]
    fn empty_layout_fails() {
        let err = RemapMatrix::new(
            &ChannelLayout::new(Vec::new()),
            &ChannelLayout::from_std(StdLayout::Stereo),
        );
        assert!(matches!(err, Err(AeError::StreamInit(_))));
    }
}
