//! Opus packets and the `dOps` box.

use crate::error::{HlsError, HlsResult};

/// Opus always runs at 48 kHz.
pub const CLOCK_RATE: u32 = 48000;

/// Decoder delay advertised in `dOps`, in 48 kHz samples.
pub const PRE_SKIP: u16 = 312;

/// Duration of a single Opus packet, in 48 kHz samples, read from its TOC
/// byte.
pub fn packet_duration(packet: &[u8]) -> HlsResult<u32> {
    let toc = *packet
        .first()
        .ok_or_else(|| HlsError::codec("Opus", "empty packet"))?;
    let config = toc >> 3;
    let frame = match config {
        0..=11 => [480, 960, 1920, 2880][(config % 4) as usize],
        12..=15 => [480, 960][(config % 2) as usize],
        _ => [120, 240, 480, 960][(config % 4) as usize],
    };
    let frames = match toc & 0x03 {
        0 => 1,
        1 | 2 => 2,
        _ => {
            let count = packet
                .get(1)
                .ok_or_else(|| HlsError::codec("Opus", "missing frame count"))?;
            (count & 0x3F) as u32
        }
    };
    Ok(frame * frames)
}

/// Builds the payload of a `dOps` box for mapping family 0.
pub fn opus_config(channel_count: u8) -> Vec<u8> {
    let mut out = Vec::with_capacity(11);
    out.push(0);
    out.push(channel_count);
    out.extend_from_slice(&PRE_SKIP.to_be_bytes());
    out.extend_from_slice(&CLOCK_RATE.to_be_bytes());
    out.extend_from_slice(&0i16.to_be_bytes());
    out.push(0);
    out
}

/// Returns the output channel count of a `dOps` payload.
pub fn parse_opus_config(data: &[u8]) -> HlsResult<u8> {
    match data {
        [0, channels, ..] if data.len() >= 11 => Ok(*channels),
        _ => Err(HlsError::codec("Opus", "invalid dOps")),
    }
}
