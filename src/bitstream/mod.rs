// src/bitstream/mod.rs

pub mod iec61937;

use serde::{Deserialize, Serialize};

use crate::error::{AeError, AeResult};
use iec61937::PackFn;

/// Compressed formats the packer knows how to frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StreamType {
    Ac3,
    Eac3,
    Dts512,
    Dts1024,
    Dts2048,
    DtsHd,
    TrueHd,
}

impl StreamType {
    /// Single-burst pack function; `None` for the formats that aggregate.
    pub fn pack_fn(self) -> Option<PackFn> {
        match self {
            StreamType::Ac3 => Some(iec61937::pack_ac3),
            StreamType::Eac3 => Some(iec61937::pack_eac3),
            StreamType::Dts512 => Some(iec61937::pack_dts_512),
            StreamType::Dts1024 => Some(iec61937::pack_dts_1024),
            StreamType::Dts2048 => Some(iec61937::pack_dts_2048),
            StreamType::DtsHd | StreamType::TrueHd => None,
        }
    }
}

/// What an encoder produces and how its output is carried.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct StreamInfo {
    pub data_type: StreamType,
    pub output_rate: u32,
    pub output_channels: u32,
    /// DTS blocks per frame, only meaningful for DTS-HD.
    pub dts_blocks: u32,
}

const TRUEHD_FRAME_OFFSET: usize = 2560;
const MAT_MIDDLE_CODE_OFFSET: usize = 4;
const MAT_FRAME_SIZE: usize = 61424;
const MAT_UNITS: usize = 24;

const MAT_START_CODE: [u8; 20] = [
    0x07, 0x9E, 0x00, 0x03, 0x84, 0x01, 0x01, 0x01, 0x80, 0x00, 0x56, 0xA5, 0x3B, 0xF4, 0x81,
    0x83, 0x49, 0x80, 0x77, 0xE0,
];
const MAT_MIDDLE_CODE: [u8; 12] = [
    0xC3, 0xC1, 0x42, 0x49, 0x3B, 0xFA, 0x82, 0x83, 0x49, 0x80, 0x77, 0xE0,
];
const MAT_END_CODE: [u8; 16] = [
    0xC3, 0xC2, 0xC0, 0xC4, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x97, 0x11,
];

const MAT_MIDDLE_CODE_POS: usize =
    12 * TRUEHD_FRAME_OFFSET - iec61937::BURST_HEADER_SIZE - MAT_MIDDLE_CODE_OFFSET;

const DTSHD_START_CODE: [u8; 10] = [0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0xFE, 0xFE];

/// Offset of TrueHD access unit `pos` inside the MAT frame.
fn mat_unit_offset(pos: usize) -> usize {
    match pos {
        0 => MAT_START_CODE.len(),
        12 => MAT_MIDDLE_CODE_POS + MAT_MIDDLE_CODE.len(),
        _ => pos * TRUEHD_FRAME_OFFSET - iec61937::BURST_HEADER_SIZE,
    }
}

/// Frames encoder output into IEC61937 bursts.
///
/// TrueHD access units are collected 24 at a time into a MAT frame before a
/// burst is produced. DTS-HD payloads get a start code and size prefix in a
/// scratch buffer that only ever grows. Every other format is one burst per
/// unit.
#[derive(Default)]
pub struct BitstreamPacker {
    mat: Vec<u8>,
    mat_pos: usize,
    dtshd: Vec<u8>,
    packed: Vec<u8>,
    data_size: usize,
}

impl BitstreamPacker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Packs one encoder unit. On error the previous frame is discarded and
    /// [`BitstreamPacker::size`] reports zero.
    pub fn pack(&mut self, info: &StreamInfo, data: &[u8]) -> AeResult<()> {
        let result = match info.data_type {
            StreamType::TrueHd => self.pack_truehd(data),
            StreamType::DtsHd => self.pack_dtshd(info, data),
            other => match other.pack_fn() {
                Some(pack) => pack(data, &mut self.packed).map(|n| self.data_size = n),
                None => Ok(()),
            },
        };
        if let Err(e) = &result {
            log::warn!("dropping {:?} unit of {} bytes: {e}", info.data_type, data.len());
            self.data_size = 0;
        }
        result
    }

    /// Bytes of the last packed burst, zero once it has been fetched.
    pub fn size(&self) -> usize {
        self.data_size
    }

    /// The last packed burst. Fetching it resets [`BitstreamPacker::size`].
    pub fn buffer(&mut self) -> &[u8] {
        let n = std::mem::take(&mut self.data_size);
        &self.packed[..n.min(self.packed.len())]
    }

    /// Current capacity of the DTS-HD scratch buffer.
    pub fn dtshd_capacity(&self) -> usize {
        self.dtshd.capacity()
    }

    /// TrueHD units collected towards the next MAT frame.
    pub fn truehd_position(&self) -> usize {
        self.mat_pos
    }

    fn reset_mat(&mut self) {
        self.mat.clear();
        self.mat.resize(MAT_FRAME_SIZE, 0);
        self.mat[..MAT_START_CODE.len()].copy_from_slice(&MAT_START_CODE);
        self.mat[MAT_MIDDLE_CODE_POS..MAT_MIDDLE_CODE_POS + MAT_MIDDLE_CODE.len()]
            .copy_from_slice(&MAT_MIDDLE_CODE);
        self.mat[MAT_FRAME_SIZE - MAT_END_CODE.len()..].copy_from_slice(&MAT_END_CODE);
    }

    fn pack_truehd(&mut self, data: &[u8]) -> AeResult<()> {
        if self.mat_pos == 0 {
            self.reset_mat();
        }

        let offset = mat_unit_offset(self.mat_pos);
        let end = offset + data.len();
        if end > MAT_FRAME_SIZE {
            return Err(AeError::Pack(format!(
                "TrueHD unit {} of {} bytes overruns the MAT frame",
                self.mat_pos,
                data.len()
            )));
        }
        self.mat[offset..end].copy_from_slice(data);

        self.mat_pos += 1;
        if self.mat_pos == MAT_UNITS {
            self.mat_pos = 0;
            self.data_size = iec61937::pack_truehd(&self.mat, &mut self.packed)?;
        }
        Ok(())
    }

    fn pack_dtshd(&mut self, info: &StreamInfo, data: &[u8]) -> AeResult<()> {
        if info.output_rate == 0 {
            return Err(AeError::Pack("DTS-HD stream with a zero output rate".to_string()));
        }
        let size = u16::try_from(data.len())
            .map_err(|_| AeError::Pack(format!("{} byte DTS-HD unit", data.len())))?;

        // the rate cancels out
        let rate = info.output_rate as u64;
        let period = rate * (info.output_channels as u64 / 2) * ((info.dts_blocks as u64) << 5) / rate;
        let period = u32::try_from(period)
            .map_err(|_| AeError::Pack(format!("DTS-HD period {period} out of range")))?;

        let needed = DTSHD_START_CODE.len() + 2 + data.len();
        if needed > self.dtshd.capacity() {
            self.dtshd.try_reserve_exact(needed).map_err(|e| {
                AeError::Pack(format!("DTS-HD scratch buffer of {needed} bytes: {e}"))
            })?;
        }
        self.dtshd.clear();
        self.dtshd.extend_from_slice(&DTSHD_START_CODE);
        self.dtshd.extend_from_slice(&size.to_be_bytes());
        self.dtshd.extend_from_slice(data);

        self.data_size = iec61937::pack_dtshd(&self.dtshd, &mut self.packed, period)?;
        Ok(())
    }
}
