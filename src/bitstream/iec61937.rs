// src/bitstream/iec61937.rs

//! IEC61937 burst framing: an 8-byte preamble (Pa, Pb, Pc, Pd as
//! little-endian 16-bit words) followed by the payload with each 16-bit word
//! byte-swapped, zero-padded to the burst length of the format.

use crate::error::{AeError, AeResult};

pub const PREAMBLE_PA: u16 = 0xF872;
pub const PREAMBLE_PB: u16 = 0x4E1F;
pub const BURST_HEADER_SIZE: usize = 8;

pub const AC3_BURST_SIZE: usize = 1536 * 4;
pub const EAC3_BURST_SIZE: usize = AC3_BURST_SIZE * 4;
pub const TRUEHD_BURST_SIZE: usize = 61440;
pub const DTS1_BURST_SIZE: usize = 512 * 4;
pub const DTS2_BURST_SIZE: usize = 1024 * 4;
pub const DTS3_BURST_SIZE: usize = 2048 * 4;

const TYPE_AC3: u16 = 0x01;
const TYPE_DTS1: u16 = 0x0B;
const TYPE_DTS2: u16 = 0x0C;
const TYPE_DTS3: u16 = 0x0D;
const TYPE_DTSHD: u16 = 0x11;
const TYPE_EAC3: u16 = 0x15;
const TYPE_TRUEHD: u16 = 0x16;

/// Wraps one payload into a burst written to `out`; returns the burst length.
pub type PackFn = fn(&[u8], &mut Vec<u8>) -> AeResult<usize>;

fn pack_burst(
    data_type: u16,
    length_code: usize,
    payload: &[u8],
    burst_size: usize,
    out: &mut Vec<u8>,
) -> AeResult<usize> {
    if payload.len() + BURST_HEADER_SIZE > burst_size {
        return Err(AeError::Pack(format!(
            "{} byte payload does not fit a {burst_size} byte burst",
            payload.len()
        )));
    }
    let length_code = u16::try_from(length_code)
        .map_err(|_| AeError::Pack(format!("length code {length_code} overflows Pd")))?;

    out.clear();
    out.resize(burst_size, 0);
    for (i, word) in [PREAMBLE_PA, PREAMBLE_PB, data_type, length_code].iter().enumerate() {
        out[i * 2..i * 2 + 2].copy_from_slice(&word.to_le_bytes());
    }

    let body = &mut out[BURST_HEADER_SIZE..];
    for (dst, src) in body.chunks_exact_mut(2).zip(payload.chunks(2)) {
        dst[0] = src.get(1).copied().unwrap_or(0);
        dst[1] = src[0];
    }
    Ok(burst_size)
}

pub fn pack_ac3(data: &[u8], out: &mut Vec<u8>) -> AeResult<usize> {
    pack_burst(TYPE_AC3, data.len() << 3, data, AC3_BURST_SIZE, out)
}

pub fn pack_eac3(data: &[u8], out: &mut Vec<u8>) -> AeResult<usize> {
    pack_burst(TYPE_EAC3, data.len(), data, EAC3_BURST_SIZE, out)
}

pub fn pack_dts_512(data: &[u8], out: &mut Vec<u8>) -> AeResult<usize> {
    pack_burst(TYPE_DTS1, data.len() << 3, data, DTS1_BURST_SIZE, out)
}

pub fn pack_dts_1024(data: &[u8], out: &mut Vec<u8>) -> AeResult<usize> {
    pack_burst(TYPE_DTS2, data.len() << 3, data, DTS2_BURST_SIZE, out)
}

pub fn pack_dts_2048(data: &[u8], out: &mut Vec<u8>) -> AeResult<usize> {
    pack_burst(TYPE_DTS3, data.len() << 3, data, DTS3_BURST_SIZE, out)
}

/// `data` is a whole MAT frame.
pub fn pack_truehd(data: &[u8], out: &mut Vec<u8>) -> AeResult<usize> {
    pack_burst(TYPE_TRUEHD, data.len(), data, TRUEHD_BURST_SIZE, out)
}

/// DTS-HD bursts last `period` frames of the 2ch carrier; the subtype in Pc
/// encodes that period.
pub fn pack_dtshd(data: &[u8], out: &mut Vec<u8>, period: u32) -> AeResult<usize> {
    let subtype: u16 = match period {
        512 => 0,
        1024 => 1,
        2048 => 2,
        4096 => 3,
        8192 => 4,
        16384 => 5,
        other => {
            return Err(AeError::Pack(format!("no DTS-HD subtype for a {other} frame period")));
        }
    };
    // Pd counts payload plus header rounded up to 16 bytes, minus the header
    let length_code = (data.len() + BURST_HEADER_SIZE).div_ceil(16) * 16 - BURST_HEADER_SIZE;
    pack_burst(
        TYPE_DTSHD | (subtype << 8),
        length_code,
        data,
        period as usize * 4,
        out,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn word(buf: &[u8], i: usize) -> u16 {
        u16::from_le_bytes([buf[i * 2], buf[i * 2 + 1]])
    }

    #[test]
    fn ac3_burst_layout() {
        let mut out = Vec::new();
        let n = pack_ac3(&[0x0B, 0x77, 0x12], &mut out).unwrap();
        assert_eq!(n, AC3_BURST_SIZE);
        assert_eq!(out.len(), AC3_BURST_SIZE);
        assert_eq!(word(&out, 0), PREAMBLE_PA);
        assert_eq!(word(&out, 1), PREAMBLE_PB);
        assert_eq!(word(&out, 2), TYPE_AC3);
        assert_eq!(word(&out, 3), 24);
        assert_eq!(&out[8..12], &[0x77, 0x0B, 0x00, 0x12]);
        assert!(out[12..].iter().all(|b| *b == 0));
    }

    #[test]
    fn eac3_length_is_in_bytes() {
        let mut out = Vec::new();
        pack_eac3(&[0u8; 1000], &mut out).unwrap();
        assert_eq!(word(&out, 2), TYPE_EAC3);
        assert_eq!(word(&out, 3), 1000);
        assert_eq!(out.len(), EAC3_BURST_SIZE);
    }

    #[test]
    fn oversized_payload_is_rejected() {
        let mut out = Vec::new();
        assert!(pack_dts_512(&[0u8; DTS1_BURST_SIZE], &mut out).is_err());
    }

    #[test]
    fn dtshd_subtype_follows_period() {
        let mut out = Vec::new();
        let n = pack_dtshd(&[0u8; 100], &mut out, 2048).unwrap();
        assert_eq!(n, 8192);
        assert_eq!(word(&out, 2), TYPE_DTSHD | (2 << 8));
        assert_eq!(word(&out, 3), 104);
        assert!(pack_dtshd(&[0u8; 100], &mut out, 3000).is_err());
    }
}
