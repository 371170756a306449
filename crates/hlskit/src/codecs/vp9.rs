//! VP9 uncompressed frame header and `vpcC` handling.

use super::bits::BitReader;
use crate::error::{HlsError, HlsResult};

const SYNC_CODE: u32 = 0x49_83_42;
const CS_RGB: u8 = 7;

/// Stream parameters carried by key frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Vp9Params {
    pub width: u32,
    pub height: u32,
    pub profile: u8,
    pub bit_depth: u8,
    /// 0 and 1 are 4:2:0, 2 is 4:2:2, 3 is 4:4:4.
    pub chroma_subsampling: u8,
    pub full_range: bool,
}

impl Vp9Params {
    /// Parses the uncompressed header of a key frame.
    pub fn parse(frame: &[u8]) -> HlsResult<Self> {
        let mut r = BitReader::new(frame, "VP9");
        if r.read_u8(2)? != 2 {
            return Err(HlsError::codec("VP9", "invalid frame marker"));
        }
        let profile_low = r.read_u8(1)?;
        let profile_high = r.read_u8(1)?;
        let profile = (profile_high << 1) | profile_low;
        if profile == 3 {
            r.skip(1)?;
        }
        if r.read_bit()? {
            return Err(HlsError::codec("VP9", "frame shows an existing frame"));
        }
        if r.read_bit()? {
            return Err(HlsError::codec("VP9", "not a key frame"));
        }
        r.skip(2)?; // show_frame, error_resilient_mode
        if r.read_u32(24)? != SYNC_CODE {
            return Err(HlsError::codec("VP9", "invalid sync code"));
        }

        let bit_depth = if profile >= 2 {
            if r.read_bit()? {
                12
            } else {
                10
            }
        } else {
            8
        };
        let color_space = r.read_u8(3)?;
        let (full_range, subsampling_x, subsampling_y);
        if color_space != CS_RGB {
            full_range = r.read_bit()?;
            if profile == 1 || profile == 3 {
                subsampling_x = r.read_bit()?;
                subsampling_y = r.read_bit()?;
                r.skip(1)?;
            } else {
                subsampling_x = true;
                subsampling_y = true;
            }
        } else {
            full_range = true;
            subsampling_x = false;
            subsampling_y = false;
            if profile == 1 || profile == 3 {
                r.skip(1)?;
            }
        }

        let width = r.read_u32(16)? + 1;
        let height = r.read_u32(16)? + 1;

        let chroma_subsampling = match (subsampling_x, subsampling_y) {
            (true, true) => 1,
            (true, false) => 2,
            _ => 3,
        };

        Ok(Self {
            width,
            height,
            profile,
            bit_depth,
            chroma_subsampling,
            full_range,
        })
    }

    /// `vp09.<profile>.<level>.<bit depth>`. The level is not signalled in the
    /// bitstream and is always reported as 1.0.
    pub fn codec_string(&self) -> String {
        format!("vp09.{:02}.10.{:02}", self.profile, self.bit_depth)
    }
}

/// A frame is a random access point when it is a key frame.
pub fn is_random_access(frame: &[u8]) -> bool {
    let Some(&b) = frame.first() else {
        return false;
    };
    if b >> 6 != 2 {
        return false;
    }
    let profile = (((b >> 4) & 1) << 1) | ((b >> 5) & 1);
    // show_existing_frame and frame_type follow the profile bits
    let shift = if profile == 3 { 2 } else { 3 };
    let show_existing_frame = (b >> shift) & 1;
    let frame_type = (b >> (shift - 1)) & 1;
    show_existing_frame == 0 && frame_type == 0
}

/// Builds the payload of a `vpcC` box (version 1).
pub fn vp_config(params: &Vp9Params) -> Vec<u8> {
    vec![
        1,
        0,
        0,
        0,
        params.profile,
        10,
        (params.bit_depth << 4) | (params.chroma_subsampling << 1) | params.full_range as u8,
        2, // colour primaries, unspecified
        2, // transfer characteristics, unspecified
        2, // matrix coefficients, unspecified
        0,
        0,
    ]
}

/// Reads profile, bit depth, subsampling and range from a `vpcC` payload.
/// Frame size is not part of the box and must be supplied.
pub fn parse_vp_config(data: &[u8], width: u32, height: u32) -> HlsResult<Vp9Params> {
    if data.len() < 8 || data[0] != 1 {
        return Err(HlsError::codec("VP9", "invalid vpcC"));
    }
    Ok(Vp9Params {
        width,
        height,
        profile: data[4],
        bit_depth: data[6] >> 4,
        chroma_subsampling: (data[6] >> 1) & 0x07,
        full_range: data[6] & 1 != 0,
    })
}
