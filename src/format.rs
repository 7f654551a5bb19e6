// src/format.rs

use serde::{Deserialize, Serialize};
use std::fmt;

/// Sample representation of a buffer.
///
/// `Raw` is opaque compressed data that a producer has already framed for
/// passthrough. `Iec61937` is the carrier the engine itself emits when it
/// transcodes. Both travel as 16-bit stereo words on the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataFormat {
    U8,
    S16LE,
    S16BE,
    S24LE3,
    S32LE,
    FloatLE,
    Raw,
    Iec61937,
}

impl DataFormat {
    pub fn is_raw(self) -> bool {
        matches!(self, DataFormat::Raw | DataFormat::Iec61937)
    }

    pub fn bytes_per_sample(self) -> usize {
        match self {
            DataFormat::U8 => 1,
            DataFormat::S16LE | DataFormat::S16BE => 2,
            DataFormat::S24LE3 => 3,
            DataFormat::S32LE | DataFormat::FloatLE => 4,
            DataFormat::Raw | DataFormat::Iec61937 => 2,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChannelRole {
    FL,
    FR,
    FC,
    LFE,
    BL,
    BR,
    FLOC,
    FROC,
    BC,
    SL,
    SR,
}

impl fmt::Display for ChannelRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// The standard speaker layouts the engine can be configured for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum StdLayout {
    #[serde(rename = "1.0")]
    Mono,
    #[default]
    #[serde(rename = "2.0")]
    Stereo,
    #[serde(rename = "2.1")]
    TwoOne,
    #[serde(rename = "3.0")]
    ThreeZero,
    #[serde(rename = "4.0")]
    FourZero,
    #[serde(rename = "5.1")]
    FiveOne,
    #[serde(rename = "7.1")]
    SevenOne,
}

/// Ordered set of channel roles. Sample `i` of a frame belongs to role `i`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChannelLayout(Vec<ChannelRole>);

impl ChannelLayout {
    pub fn new(roles: Vec<ChannelRole>) -> Self {
        let mut unique: Vec<ChannelRole> = Vec::with_capacity(roles.len());
        for r in roles {
            if !unique.contains(&r) {
                unique.push(r);
            }
        }
        Self(unique)
    }

    pub fn from_std(layout: StdLayout) -> Self {
        use ChannelRole::*;
        let roles = match layout {
            StdLayout::Mono => vec![FC],
            StdLayout::Stereo => vec![FL, FR],
            StdLayout::TwoOne => vec![FL, FR, LFE],
            StdLayout::ThreeZero => vec![FL, FR, FC],
            StdLayout::FourZero => vec![FL, FR, BL, BR],
            StdLayout::FiveOne => vec![FL, FR, FC, LFE, BL, BR],
            StdLayout::SevenOne => vec![FL, FR, FC, LFE, BL, BR, SL, SR],
        };
        Self(roles)
    }

    /// Conventional layout for a bare channel count.
    pub fn for_count(channels: usize) -> Self {
        match channels {
            1 => Self::from_std(StdLayout::Mono),
            2 => Self::from_std(StdLayout::Stereo),
            3 => Self::from_std(StdLayout::ThreeZero),
            4 => Self::from_std(StdLayout::FourZero),
            6 => Self::from_std(StdLayout::FiveOne),
            n => {
                let all = Self::from_std(StdLayout::SevenOne);
                Self(all.0.into_iter().take(n.max(1)).collect())
            }
        }
    }

    pub fn count(&self) -> usize {
        self.0.len()
    }

    pub fn roles(&self) -> &[ChannelRole] {
        &self.0
    }

    pub fn position(&self, role: ChannelRole) -> Option<usize> {
        self.0.iter().position(|r| *r == role)
    }

    pub fn contains(&self, role: ChannelRole) -> bool {
        self.position(role).is_some()
    }
}

impl fmt::Display for ChannelLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<String> = self.0.iter().map(|r| r.to_string()).collect();
        write!(f, "{}", names.join(","))
    }
}

/// Format a stream or the engine is opened against. Changing any field
/// requires a re-open.
#[derive(Clone, Debug, PartialEq)]
pub struct AudioFormat {
    pub data_format: DataFormat,
    pub sample_rate: u32,
    pub channel_layout: ChannelLayout,
    /// Bytes per frame: `bytes_per_sample * channel_count`.
    pub frame_size: usize,
    pub frames_per_period: usize,
}

impl AudioFormat {
    pub fn new(
        data_format: DataFormat,
        sample_rate: u32,
        channel_layout: ChannelLayout,
        frames_per_period: usize,
    ) -> Self {
        let frame_size = data_format.bytes_per_sample() * channel_layout.count();
        Self {
            data_format,
            sample_rate,
            channel_layout,
            frame_size,
            frames_per_period,
        }
    }

    pub fn channel_count(&self) -> usize {
        self.channel_layout.count()
    }

    pub fn is_raw(&self) -> bool {
        self.data_format.is_raw()
    }

    pub fn period_bytes(&self) -> usize {
        self.frames_per_period * self.frame_size
    }

    /// Wall-clock length of one period.
    pub fn period_duration(&self) -> std::time::Duration {
        if self.sample_rate == 0 {
            return std::time::Duration::ZERO;
        }
        std::time::Duration::from_secs_f64(self.frames_per_period as f64 / self.sample_rate as f64)
    }
}

impl fmt::Display for AudioFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?} {}Hz [{}] {} frames/period",
            self.data_format, self.sample_rate, self.channel_layout, self.frames_per_period
        )
    }
}
