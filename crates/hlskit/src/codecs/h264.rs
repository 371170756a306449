//! H264 access unit helpers.

use bytes::Bytes;
use h264_reader::nal::sps::SeqParameterSet;
use h264_reader::rbsp::{decode_nal, BitReader as RbspReader};

use super::bits::{remove_emulation_prevention, BitReader};
use crate::error::{HlsError, HlsResult};

pub const NALU_TYPE_NON_IDR: u8 = 1;
pub const NALU_TYPE_IDR: u8 = 5;
pub const NALU_TYPE_SEI: u8 = 6;
pub const NALU_TYPE_SPS: u8 = 7;
pub const NALU_TYPE_PPS: u8 = 8;
pub const NALU_TYPE_AUD: u8 = 9;

/// An access unit delimiter with primary_pic_type = 7 (any slice type).
pub const AUD: [u8; 2] = [NALU_TYPE_AUD, 0xF0];

pub fn nalu_type(nalu: &[u8]) -> u8 {
    nalu.first().map_or(0, |b| b & 0x1F)
}

/// Splits an Annex-B byte stream into NAL units, start codes excluded.
pub fn split_annexb(data: &[u8]) -> HlsResult<Vec<Bytes>> {
    let mut nalus = Vec::new();
    let mut start: Option<usize> = None;
    let mut zeros = 0;

    for (i, &b) in data.iter().enumerate() {
        match b {
            0 => zeros += 1,
            1 if zeros >= 2 => {
                if let Some(s) = start {
                    let end = i - zeros.min(3);
                    if end > s {
                        nalus.push(Bytes::copy_from_slice(&data[s..end]));
                    }
                } else if i - zeros != 0 {
                    return Err(HlsError::codec("H26x", "data doesn't start with a start code"));
                }
                start = Some(i + 1);
                zeros = 0;
            }
            _ => zeros = 0,
        }
    }

    match start {
        Some(s) if s < data.len() => {
            // trailing zero bytes belong to the next start code
            let end = data.len() - zeros;
            if end > s {
                nalus.push(Bytes::copy_from_slice(&data[s..end]));
            }
        }
        Some(_) => {}
        None => {
            return Err(HlsError::codec("H26x", "data doesn't start with a start code"));
        }
    }

    Ok(nalus)
}

pub fn join_annexb(nalus: &[Bytes]) -> Vec<u8> {
    let mut out = Vec::with_capacity(nalus.iter().map(|n| n.len() + 4).sum());
    for nalu in nalus {
        out.extend_from_slice(&[0, 0, 0, 1]);
        out.extend_from_slice(nalu);
    }
    out
}

/// Splits an AVCC (4-byte length prefixed) payload into NAL units.
pub fn split_avcc(mut data: &[u8]) -> HlsResult<Vec<Bytes>> {
    let mut nalus = Vec::new();
    while !data.is_empty() {
        if data.len() < 4 {
            return Err(HlsError::codec("H26x", "invalid length prefix"));
        }
        let size = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;
        data = &data[4..];
        if size > data.len() {
            return Err(HlsError::codec("H26x", "NAL unit size exceeds payload"));
        }
        nalus.push(Bytes::copy_from_slice(&data[..size]));
        data = &data[size..];
    }
    Ok(nalus)
}

pub fn join_avcc(nalus: &[Bytes]) -> Vec<u8> {
    let mut out = Vec::with_capacity(nalus.iter().map(|n| n.len() + 4).sum());
    for nalu in nalus {
        out.extend_from_slice(&(nalu.len() as u32).to_be_bytes());
        out.extend_from_slice(nalu);
    }
    out
}

pub fn is_random_access(au: &[Bytes]) -> bool {
    au.iter().any(|n| nalu_type(n) == NALU_TYPE_IDR)
}

/// Returns the SPS and PPS carried by an access unit.
pub fn find_params(au: &[Bytes]) -> (Option<&Bytes>, Option<&Bytes>) {
    let sps = au.iter().find(|n| nalu_type(n) == NALU_TYPE_SPS);
    let pps = au.iter().find(|n| nalu_type(n) == NALU_TYPE_PPS);
    (sps, pps)
}

/// Removes parameter sets and delimiters; they are stored in the init section
/// of fMP4 and re-added when writing MPEG-TS.
pub fn strip_params(au: &[Bytes]) -> Vec<Bytes> {
    au.iter()
        .filter(|n| {
            !matches!(
                nalu_type(n),
                NALU_TYPE_SPS | NALU_TYPE_PPS | NALU_TYPE_AUD
            )
        })
        .cloned()
        .collect()
}

/// Prepends an AUD and, on IDR access units, the parameter sets.
pub fn with_params(au: &[Bytes], sps: &[u8], pps: &[u8]) -> Vec<Bytes> {
    let mut out = Vec::with_capacity(au.len() + 3);
    out.push(Bytes::from_static(&AUD));
    if is_random_access(au) && !sps.is_empty() && !pps.is_empty() {
        out.push(Bytes::copy_from_slice(sps));
        out.push(Bytes::copy_from_slice(pps));
    }
    out.extend(strip_params(au));
    out
}

/// Fields of a SPS needed for codec strings, resolution and POC decoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sps {
    pub profile_idc: u8,
    pub constraint_flags: u8,
    pub level_idc: u8,
    pub width: u32,
    pub height: u32,
    pub separate_colour_plane: bool,
    pub log2_max_frame_num: u32,
    pub pic_order_cnt_type: u32,
    pub log2_max_pic_order_cnt_lsb: u32,
    pub frame_mbs_only: bool,
}

impl Sps {
    pub fn parse(nalu: &[u8]) -> HlsResult<Self> {
        if nalu_type(nalu) != NALU_TYPE_SPS || nalu.len() < 4 {
            return Err(HlsError::codec("H264", "not a SPS"));
        }

        let rbsp = decode_nal(nalu).map_err(|e| HlsError::codec("H264", e.to_string()))?;
        let parsed = SeqParameterSet::from_bits(RbspReader::new(&rbsp[..]))
            .map_err(|e| HlsError::codec("H264", format!("invalid SPS: {e:?}")))?;
        let (width, height) = parsed
            .pixel_dimensions()
            .map_err(|e| HlsError::codec("H264", format!("invalid SPS dimensions: {e:?}")))?;

        let rbsp = remove_emulation_prevention(&nalu[1..]);
        let mut r = BitReader::new(&rbsp, "H264");
        let profile_idc = r.read_u8(8)?;
        let constraint_flags = r.read_u8(8)?;
        let level_idc = r.read_u8(8)?;
        r.read_ue()?; // seq_parameter_set_id

        let mut separate_colour_plane = false;
        if matches!(
            profile_idc,
            100 | 110 | 122 | 244 | 44 | 83 | 86 | 118 | 128 | 138 | 139 | 134 | 135
        ) {
            let chroma_format_idc = r.read_ue()?;
            if chroma_format_idc == 3 {
                separate_colour_plane = r.read_bit()?;
            }
            r.read_ue()?; // bit_depth_luma_minus8
            r.read_ue()?; // bit_depth_chroma_minus8
            r.read_bit()?; // qpprime_y_zero_transform_bypass_flag
            if r.read_bit()? {
                let count = if chroma_format_idc != 3 { 8 } else { 12 };
                for i in 0..count {
                    if r.read_bit()? {
                        skip_scaling_list(&mut r, if i < 6 { 16 } else { 64 })?;
                    }
                }
            }
        }

        let log2_max_frame_num = r.read_ue()? + 4;
        let pic_order_cnt_type = r.read_ue()?;
        let mut log2_max_pic_order_cnt_lsb = 0;
        match pic_order_cnt_type {
            0 => log2_max_pic_order_cnt_lsb = r.read_ue()? + 4,
            1 => {
                r.read_bit()?;
                r.read_se()?;
                r.read_se()?;
                let cycle = r.read_ue()?;
                for _ in 0..cycle {
                    r.read_se()?;
                }
            }
            _ => {}
        }
        r.read_ue()?; // max_num_ref_frames
        r.read_bit()?; // gaps_in_frame_num_value_allowed_flag
        r.read_ue()?;
        r.read_ue()?;
        let frame_mbs_only = r.read_bit()?;

        Ok(Self {
            profile_idc,
            constraint_flags,
            level_idc,
            width,
            height,
            separate_colour_plane,
            log2_max_frame_num,
            pic_order_cnt_type,
            log2_max_pic_order_cnt_lsb,
            frame_mbs_only,
        })
    }

    pub fn codec_string(&self) -> String {
        format!(
            "avc1.{:02x}{:02x}{:02x}",
            self.profile_idc, self.constraint_flags, self.level_idc
        )
    }
}

fn skip_scaling_list(r: &mut BitReader, size: usize) -> HlsResult<()> {
    let mut last = 8i32;
    let mut next = 8i32;
    for _ in 0..size {
        if next != 0 {
            let delta = r.read_se()?;
            next = (last + delta + 256) % 256;
        }
        if next != 0 {
            last = next;
        }
    }
    Ok(())
}

/// Reads pic_order_cnt_lsb from the header of a coded slice.
pub(crate) fn slice_poc_lsb(nalu: &[u8], sps: &Sps) -> HlsResult<u32> {
    let is_idr = nalu_type(nalu) == NALU_TYPE_IDR;
    let rbsp = remove_emulation_prevention(nalu.get(1..).unwrap_or_default());
    let mut r = BitReader::new(&rbsp, "H264");

    r.read_ue()?; // first_mb_in_slice
    r.read_ue()?; // slice_type
    r.read_ue()?; // pic_parameter_set_id
    if sps.separate_colour_plane {
        r.skip(2)?;
    }
    r.skip(sps.log2_max_frame_num as usize)?; // frame_num
    if !sps.frame_mbs_only && r.read_bit()? {
        r.skip(1)?; // bottom_field_flag
    }
    if is_idr {
        r.read_ue()?; // idr_pic_id
    }

    r.read_u32(sps.log2_max_pic_order_cnt_lsb)
}

/// Builds the payload of an `avcC` box.
pub fn avc_config(sps: &[u8], pps: &[u8]) -> HlsResult<Vec<u8>> {
    if sps.len() < 4 {
        return Err(HlsError::codec("H264", "SPS is too short"));
    }
    let mut out = Vec::with_capacity(11 + sps.len() + pps.len());
    out.push(1);
    out.extend_from_slice(&sps[1..4]);
    out.push(0xFF); // 4 byte NALU lengths
    out.push(0xE1); // one SPS
    out.extend_from_slice(&(sps.len() as u16).to_be_bytes());
    out.extend_from_slice(sps);
    out.push(1);
    out.extend_from_slice(&(pps.len() as u16).to_be_bytes());
    out.extend_from_slice(pps);
    Ok(out)
}

/// Extracts the first SPS and PPS from an `avcC` payload.
pub fn parse_avc_config(data: &[u8]) -> HlsResult<(Vec<u8>, Vec<u8>)> {
    let err = || HlsError::codec("H264", "invalid avcC");
    let mut pos = 5;
    let sps_count = *data.get(pos).ok_or_else(err)? & 0x1F;
    pos += 1;

    let read_unit = |pos: &mut usize| -> HlsResult<Vec<u8>> {
        let len_bytes = data.get(*pos..*pos + 2).ok_or_else(err)?;
        let len = u16::from_be_bytes([len_bytes[0], len_bytes[1]]) as usize;
        *pos += 2;
        let unit = data.get(*pos..*pos + len).ok_or_else(err)?.to_vec();
        *pos += len;
        Ok(unit)
    };

    let mut sps = Vec::new();
    for i in 0..sps_count {
        let unit = read_unit(&mut pos)?;
        if i == 0 {
            sps = unit;
        }
    }
    let pps_count = *data.get(pos).ok_or_else(err)?;
    pos += 1;
    let mut pps = Vec::new();
    for i in 0..pps_count {
        let unit = read_unit(&mut pos)?;
        if i == 0 {
            pps = unit;
        }
    }

    Ok((sps, pps))
}
