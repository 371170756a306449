//! H265 access unit helpers.

use bytes::Bytes;

use super::bits::{remove_emulation_prevention, BitReader};
use crate::error::{HlsError, HlsResult};

pub const NALU_TYPE_BLA_W_LP: u8 = 16;
pub const NALU_TYPE_IDR_W_RADL: u8 = 19;
pub const NALU_TYPE_IDR_N_LP: u8 = 20;
pub const NALU_TYPE_CRA_NUT: u8 = 21;
pub const NALU_TYPE_VPS: u8 = 32;
pub const NALU_TYPE_SPS: u8 = 33;
pub const NALU_TYPE_PPS: u8 = 34;
pub const NALU_TYPE_AUD: u8 = 35;

pub fn nalu_type(nalu: &[u8]) -> u8 {
    nalu.first().map_or(0, |b| (b >> 1) & 0x3F)
}

fn is_irap(typ: u8) -> bool {
    (NALU_TYPE_BLA_W_LP..=NALU_TYPE_CRA_NUT).contains(&typ)
}

fn is_slice(typ: u8) -> bool {
    typ <= NALU_TYPE_CRA_NUT
}

pub fn is_random_access(au: &[Bytes]) -> bool {
    au.iter().any(|n| is_irap(nalu_type(n)))
}

pub fn find_params(au: &[Bytes]) -> (Option<&Bytes>, Option<&Bytes>, Option<&Bytes>) {
    let find = |typ| au.iter().find(|n| nalu_type(n) == typ);
    (
        find(NALU_TYPE_VPS),
        find(NALU_TYPE_SPS),
        find(NALU_TYPE_PPS),
    )
}

pub fn strip_params(au: &[Bytes]) -> Vec<Bytes> {
    au.iter()
        .filter(|n| {
            !matches!(
                nalu_type(n),
                NALU_TYPE_VPS | NALU_TYPE_SPS | NALU_TYPE_PPS | NALU_TYPE_AUD
            )
        })
        .cloned()
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sps {
    pub profile_space: u8,
    pub tier_flag: bool,
    pub profile_idc: u8,
    pub profile_compatibility_flags: u32,
    pub constraint_indicator_flags: [u8; 6],
    pub level_idc: u8,
    pub chroma_format_idc: u32,
    pub separate_colour_plane: bool,
    pub width: u32,
    pub height: u32,
    pub bit_depth_luma: u32,
    pub bit_depth_chroma: u32,
    pub log2_max_pic_order_cnt_lsb: u32,
}

impl Sps {
    pub fn parse(nalu: &[u8]) -> HlsResult<Self> {
        if nalu_type(nalu) != NALU_TYPE_SPS || nalu.len() < 3 {
            return Err(HlsError::codec("H265", "not a SPS"));
        }
        let rbsp = remove_emulation_prevention(&nalu[2..]);
        let mut r = BitReader::new(&rbsp, "H265");

        r.skip(4)?; // sps_video_parameter_set_id
        let max_sub_layers_minus1 = r.read_u8(3)?;
        r.skip(1)?;

        let profile_space = r.read_u8(2)?;
        let tier_flag = r.read_bit()?;
        let profile_idc = r.read_u8(5)?;
        let profile_compatibility_flags = r.read_u32(32)?;
        let mut constraint_indicator_flags = [0u8; 6];
        for b in constraint_indicator_flags.iter_mut() {
            *b = r.read_u8(8)?;
        }
        let level_idc = r.read_u8(8)?;

        if max_sub_layers_minus1 > 0 {
            let mut profile_present = [false; 8];
            let mut level_present = [false; 8];
            for i in 0..max_sub_layers_minus1 as usize {
                profile_present[i] = r.read_bit()?;
                level_present[i] = r.read_bit()?;
            }
            for _ in max_sub_layers_minus1..8 {
                r.skip(2)?;
            }
            for i in 0..max_sub_layers_minus1 as usize {
                if profile_present[i] {
                    r.skip(88)?;
                }
                if level_present[i] {
                    r.skip(8)?;
                }
            }
        }

        r.read_ue()?; // sps_seq_parameter_set_id
        let chroma_format_idc = r.read_ue()?;
        let mut separate_colour_plane = false;
        if chroma_format_idc == 3 {
            separate_colour_plane = r.read_bit()?;
        }
        let mut width = r.read_ue()?;
        let mut height = r.read_ue()?;

        if r.read_bit()? {
            let left = r.read_ue()?;
            let right = r.read_ue()?;
            let top = r.read_ue()?;
            let bottom = r.read_ue()?;
            let (sub_width, sub_height) = match (chroma_format_idc, separate_colour_plane) {
                (1, false) => (2, 2),
                (2, false) => (2, 1),
                _ => (1, 1),
            };
            width = width.saturating_sub(sub_width * (left + right));
            height = height.saturating_sub(sub_height * (top + bottom));
        }

        let bit_depth_luma = r.read_ue()? + 8;
        let bit_depth_chroma = r.read_ue()? + 8;
        let log2_max_pic_order_cnt_lsb = r.read_ue()? + 4;
        if log2_max_pic_order_cnt_lsb > 16 {
            return Err(HlsError::codec("H265", "invalid log2_max_pic_order_cnt_lsb"));
        }

        Ok(Self {
            profile_space,
            tier_flag,
            profile_idc,
            profile_compatibility_flags,
            constraint_indicator_flags,
            level_idc,
            chroma_format_idc,
            separate_colour_plane,
            width,
            height,
            bit_depth_luma,
            bit_depth_chroma,
            log2_max_pic_order_cnt_lsb,
        })
    }

    /// `hvc1.<profile>.<compatibility>.<tier><level>.<constraints>`
    pub fn codec_string(&self) -> String {
        let space = match self.profile_space {
            1 => "A",
            2 => "B",
            3 => "C",
            _ => "",
        };
        let mut s = format!(
            "hvc1.{space}{}.{:X}.{}{}",
            self.profile_idc,
            self.profile_compatibility_flags.reverse_bits(),
            if self.tier_flag { 'H' } else { 'L' },
            self.level_idc,
        );

        let last = self
            .constraint_indicator_flags
            .iter()
            .rposition(|b| *b != 0)
            .map_or(1, |p| p + 1);
        for b in &self.constraint_indicator_flags[..last] {
            s.push_str(&format!(".{b:X}"));
        }
        s
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pps {
    pub dependent_slice_segments_enabled: bool,
    pub output_flag_present: bool,
    pub num_extra_slice_header_bits: u32,
}

impl Pps {
    pub fn parse(nalu: &[u8]) -> HlsResult<Self> {
        if nalu_type(nalu) != NALU_TYPE_PPS || nalu.len() < 3 {
            return Err(HlsError::codec("H265", "not a PPS"));
        }
        let rbsp = remove_emulation_prevention(&nalu[2..]);
        let mut r = BitReader::new(&rbsp, "H265");
        r.read_ue()?; // pps_pic_parameter_set_id
        r.read_ue()?; // pps_seq_parameter_set_id
        Ok(Self {
            dependent_slice_segments_enabled: r.read_bit()?,
            output_flag_present: r.read_bit()?,
            num_extra_slice_header_bits: r.read_u32(3)?,
        })
    }
}

/// Reads slice_pic_order_cnt_lsb from the first slice segment of a picture.
/// IDR pictures have an implicit value of zero.
pub(crate) fn slice_poc_lsb(nalu: &[u8], sps: &Sps, pps: &Pps) -> HlsResult<u32> {
    let typ = nalu_type(nalu);
    if !is_slice(typ) {
        return Err(HlsError::codec("H265", "not a slice"));
    }
    if typ == NALU_TYPE_IDR_W_RADL || typ == NALU_TYPE_IDR_N_LP {
        return Ok(0);
    }

    let rbsp = remove_emulation_prevention(nalu.get(2..).unwrap_or_default());
    let mut r = BitReader::new(&rbsp, "H265");

    let first_slice_segment_in_pic = r.read_bit()?;
    if !first_slice_segment_in_pic {
        return Err(HlsError::codec("H265", "first slice segment is missing"));
    }
    if is_irap(typ) {
        r.skip(1)?; // no_output_of_prior_pics_flag
    }
    r.read_ue()?; // slice_pic_parameter_set_id
    r.skip(pps.num_extra_slice_header_bits as usize)?;
    r.read_ue()?; // slice_type
    if pps.output_flag_present {
        r.skip(1)?;
    }
    if sps.separate_colour_plane {
        r.skip(2)?;
    }
    r.read_u32(sps.log2_max_pic_order_cnt_lsb)
}

/// Returns the first slice NAL unit of an access unit.
pub(crate) fn first_slice(au: &[Bytes]) -> Option<&Bytes> {
    au.iter().find(|n| is_slice(nalu_type(n)))
}

/// Builds the payload of a `hvcC` box.
pub fn hevc_config(vps: &[u8], sps: &[u8], pps: &[u8]) -> HlsResult<Vec<u8>> {
    let info = Sps::parse(sps)?;

    let mut out = Vec::with_capacity(23 + 3 * 5 + vps.len() + sps.len() + pps.len());
    out.push(1);
    out.push((info.profile_space << 6) | ((info.tier_flag as u8) << 5) | info.profile_idc);
    out.extend_from_slice(&info.profile_compatibility_flags.to_be_bytes());
    out.extend_from_slice(&info.constraint_indicator_flags);
    out.push(info.level_idc);
    out.extend_from_slice(&[0xF0, 0x00]); // min_spatial_segmentation_idc
    out.push(0xFC); // parallelism type
    out.push(0xFC | (info.chroma_format_idc as u8 & 0x03));
    out.push(0xF8 | ((info.bit_depth_luma - 8) as u8 & 0x07));
    out.push(0xF8 | ((info.bit_depth_chroma - 8) as u8 & 0x07));
    out.extend_from_slice(&[0, 0]); // avg frame rate
    out.push(0x03); // 4 byte NALU lengths
    out.push(3);

    for (typ, unit) in [
        (NALU_TYPE_VPS, vps),
        (NALU_TYPE_SPS, sps),
        (NALU_TYPE_PPS, pps),
    ] {
        out.push(0x80 | typ);
        out.extend_from_slice(&1u16.to_be_bytes());
        out.extend_from_slice(&(unit.len() as u16).to_be_bytes());
        out.extend_from_slice(unit);
    }

    Ok(out)
}

/// Extracts VPS, SPS and PPS from a `hvcC` payload.
pub fn parse_hevc_config(data: &[u8]) -> HlsResult<(Vec<u8>, Vec<u8>, Vec<u8>)> {
    let err = || HlsError::codec("H265", "invalid hvcC");
    let mut pos = 22;
    let arrays = *data.get(pos).ok_or_else(err)?;
    pos += 1;

    let (mut vps, mut sps, mut pps) = (Vec::new(), Vec::new(), Vec::new());
    for _ in 0..arrays {
        let typ = *data.get(pos).ok_or_else(err)? & 0x3F;
        let count_bytes = data.get(pos + 1..pos + 3).ok_or_else(err)?;
        let count = u16::from_be_bytes([count_bytes[0], count_bytes[1]]);
        pos += 3;
        for i in 0..count {
            let len_bytes = data.get(pos..pos + 2).ok_or_else(err)?;
            let len = u16::from_be_bytes([len_bytes[0], len_bytes[1]]) as usize;
            pos += 2;
            let unit = data.get(pos..pos + len).ok_or_else(err)?;
            pos += len;
            if i > 0 {
                continue;
            }
            match typ {
                NALU_TYPE_VPS => vps = unit.to_vec(),
                NALU_TYPE_SPS => sps = unit.to_vec(),
                NALU_TYPE_PPS => pps = unit.to_vec(),
                _ => {}
            }
        }
    }

    Ok((vps, sps, pps))
}
