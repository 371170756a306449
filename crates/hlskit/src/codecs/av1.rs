//! AV1 temporal units in the low overhead bitstream format.

use bytes::Bytes;

use super::bits::BitReader;
use crate::error::{HlsError, HlsResult};

pub const OBU_SEQUENCE_HEADER: u8 = 1;
pub const OBU_TEMPORAL_DELIMITER: u8 = 2;

pub fn obu_type(obu: &[u8]) -> u8 {
    obu.first().map_or(0, |b| (b >> 3) & 0x0F)
}

fn read_leb128(data: &[u8]) -> HlsResult<(u64, usize)> {
    let mut value = 0u64;
    for i in 0..8 {
        let b = *data
            .get(i)
            .ok_or_else(|| HlsError::codec("AV1", "truncated LEB128"))?;
        value |= ((b & 0x7F) as u64) << (i * 7);
        if b & 0x80 == 0 {
            return Ok((value, i + 1));
        }
    }
    Err(HlsError::codec("AV1", "LEB128 is too long"))
}

fn write_leb128(out: &mut Vec<u8>, mut v: u64) {
    loop {
        let mut b = (v & 0x7F) as u8;
        v >>= 7;
        if v != 0 {
            b |= 0x80;
        }
        out.push(b);
        if v == 0 {
            break;
        }
    }
}

/// Splits a temporal unit into OBUs. Every OBU must carry obu_size.
pub fn split_temporal_unit(mut data: &[u8]) -> HlsResult<Vec<Bytes>> {
    let mut obus = Vec::new();
    while !data.is_empty() {
        let header = data[0];
        if header & 0x02 == 0 {
            return Err(HlsError::codec("AV1", "OBU size is missing"));
        }
        let header_len = if header & 0x04 != 0 { 2 } else { 1 };
        let (size, size_len) = read_leb128(data.get(header_len..).unwrap_or_default())?;
        let end = header_len + size_len + size as usize;
        if end > data.len() {
            return Err(HlsError::codec("AV1", "OBU size exceeds payload"));
        }
        obus.push(Bytes::copy_from_slice(&data[..end]));
        data = &data[end..];
    }
    Ok(obus)
}

/// Joins OBUs into a temporal unit, adding obu_size where missing and
/// dropping temporal delimiters.
pub fn join_temporal_unit(obus: &[Bytes]) -> Vec<u8> {
    let mut out = Vec::with_capacity(obus.iter().map(|o| o.len() + 2).sum());
    for obu in obus {
        if obu.is_empty() || obu_type(obu) == OBU_TEMPORAL_DELIMITER {
            continue;
        }
        if obu[0] & 0x02 != 0 {
            out.extend_from_slice(obu);
            continue;
        }
        let header_len = if obu[0] & 0x04 != 0 { 2 } else { 1 };
        let header_len = header_len.min(obu.len());
        out.push(obu[0] | 0x02);
        out.extend_from_slice(&obu[1..header_len]);
        write_leb128(&mut out, (obu.len() - header_len) as u64);
        out.extend_from_slice(&obu[header_len..]);
    }
    out
}

/// A temporal unit is a random access point when it starts a coded video
/// sequence.
pub fn is_random_access(obus: &[Bytes]) -> bool {
    obus.iter().any(|o| obu_type(o) == OBU_SEQUENCE_HEADER)
}

pub fn find_sequence_header(obus: &[Bytes]) -> Option<&Bytes> {
    obus.iter().find(|o| obu_type(o) == OBU_SEQUENCE_HEADER)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SequenceHeader {
    pub seq_profile: u8,
    pub seq_level_idx: u8,
    pub seq_tier: bool,
    pub max_frame_width: u32,
    pub max_frame_height: u32,
    pub bit_depth: u8,
    pub mono_chrome: bool,
    pub subsampling_x: bool,
    pub subsampling_y: bool,
    pub chroma_sample_position: u8,
}

impl SequenceHeader {
    /// Parses a sequence header OBU, header included.
    pub fn parse(obu: &[u8]) -> HlsResult<Self> {
        if obu_type(obu) != OBU_SEQUENCE_HEADER {
            return Err(HlsError::codec("AV1", "not a sequence header"));
        }
        let mut header_len = if obu[0] & 0x04 != 0 { 2 } else { 1 };
        if obu[0] & 0x02 != 0 {
            let (_, size_len) = read_leb128(obu.get(header_len..).unwrap_or_default())?;
            header_len += size_len;
        }
        let mut r = BitReader::new(obu.get(header_len..).unwrap_or_default(), "AV1");

        let seq_profile = r.read_u8(3)?;
        r.skip(1)?; // still_picture
        let reduced_still_picture_header = r.read_bit()?;

        let mut seq_level_idx = 0;
        let mut seq_tier = false;
        if reduced_still_picture_header {
            seq_level_idx = r.read_u8(5)?;
        } else {
            let mut decoder_model_info_present = false;
            let mut buffer_delay_length = 0;
            if r.read_bit()? {
                r.skip(64)?; // num_units_in_display_tick, time_scale
                if r.read_bit()? {
                    r.read_uvlc()?;
                }
                decoder_model_info_present = r.read_bit()?;
                if decoder_model_info_present {
                    buffer_delay_length = r.read_u32(5)? + 1;
                    r.skip(32 + 5 + 5)?;
                }
            }
            let initial_display_delay_present = r.read_bit()?;
            let operating_points = r.read_u32(5)? + 1;
            for i in 0..operating_points {
                r.skip(12)?; // operating_point_idc
                let level = r.read_u8(5)?;
                let tier = level > 7 && r.read_bit()?;
                if i == 0 {
                    seq_level_idx = level;
                    seq_tier = tier;
                }
                if decoder_model_info_present && r.read_bit()? {
                    r.skip(2 * buffer_delay_length as usize + 1)?;
                }
                if initial_display_delay_present && r.read_bit()? {
                    r.skip(4)?;
                }
            }
        }

        let width_bits = r.read_u32(4)? + 1;
        let height_bits = r.read_u32(4)? + 1;
        let max_frame_width = r.read_u32(width_bits)? + 1;
        let max_frame_height = r.read_u32(height_bits)? + 1;

        if !reduced_still_picture_header && r.read_bit()? {
            r.skip(4 + 3)?; // frame id lengths
        }
        r.skip(3)?; // use_128x128_superblock, enable_filter_intra, enable_intra_edge_filter
        if !reduced_still_picture_header {
            r.skip(4)?; // interintra, masked compound, warped motion, dual filter
            let enable_order_hint = r.read_bit()?;
            if enable_order_hint {
                r.skip(2)?; // jnt_comp, ref_frame_mvs
            }
            let seq_force_screen_content_tools = if r.read_bit()? {
                2
            } else {
                r.read_u8(1)?
            };
            if seq_force_screen_content_tools > 0 && !r.read_bit()? {
                r.skip(1)?; // seq_force_integer_mv
            }
            if enable_order_hint {
                r.skip(3)?;
            }
        }
        r.skip(3)?; // superres, cdef, restoration

        // color_config
        let high_bitdepth = r.read_bit()?;
        let bit_depth = if seq_profile == 2 && high_bitdepth {
            if r.read_bit()? {
                12
            } else {
                10
            }
        } else if high_bitdepth {
            10
        } else {
            8
        };
        let mono_chrome = seq_profile != 1 && r.read_bit()?;
        let (mut primaries, mut transfer, mut matrix) = (2, 2, 2);
        if r.read_bit()? {
            primaries = r.read_u8(8)?;
            transfer = r.read_u8(8)?;
            matrix = r.read_u8(8)?;
        }

        let (subsampling_x, subsampling_y);
        let mut chroma_sample_position = 0;
        if mono_chrome {
            r.skip(1)?;
            subsampling_x = true;
            subsampling_y = true;
        } else if primaries == 1 && transfer == 13 && matrix == 0 {
            subsampling_x = false;
            subsampling_y = false;
        } else {
            r.skip(1)?; // color_range
            match seq_profile {
                0 => {
                    subsampling_x = true;
                    subsampling_y = true;
                }
                1 => {
                    subsampling_x = false;
                    subsampling_y = false;
                }
                _ => {
                    if bit_depth == 12 {
                        subsampling_x = r.read_bit()?;
                        subsampling_y = subsampling_x && r.read_bit()?;
                    } else {
                        subsampling_x = true;
                        subsampling_y = false;
                    }
                }
            }
            if subsampling_x && subsampling_y {
                chroma_sample_position = r.read_u8(2)?;
            }
        }

        Ok(Self {
            seq_profile,
            seq_level_idx,
            seq_tier,
            max_frame_width,
            max_frame_height,
            bit_depth,
            mono_chrome,
            subsampling_x,
            subsampling_y,
            chroma_sample_position,
        })
    }

    /// `av01.<profile>.<level><tier>.<bit depth>`
    pub fn codec_string(&self) -> String {
        format!(
            "av01.{}.{:02}{}.{:02}",
            self.seq_profile,
            self.seq_level_idx,
            if self.seq_tier { 'H' } else { 'M' },
            self.bit_depth
        )
    }
}

/// Builds the payload of an `av1C` box.
pub fn av1_config(sequence_header: &[u8]) -> HlsResult<Vec<u8>> {
    let sh = SequenceHeader::parse(sequence_header)?;
    let mut out = Vec::with_capacity(4 + sequence_header.len());
    out.push(0x81);
    out.push((sh.seq_profile << 5) | (sh.seq_level_idx & 0x1F));
    out.push(
        ((sh.seq_tier as u8) << 7)
            | (((sh.bit_depth > 8) as u8) << 6)
            | (((sh.bit_depth == 12) as u8) << 5)
            | ((sh.mono_chrome as u8) << 4)
            | ((sh.subsampling_x as u8) << 3)
            | ((sh.subsampling_y as u8) << 2)
            | (sh.chroma_sample_position & 0x03),
    );
    out.push(0);
    out.extend_from_slice(&join_temporal_unit(&[Bytes::copy_from_slice(
        sequence_header,
    )]));
    Ok(out)
}

/// Extracts the sequence header OBU from an `av1C` payload.
pub fn parse_av1_config(data: &[u8]) -> HlsResult<Vec<u8>> {
    let obus = split_temporal_unit(data.get(4..).unwrap_or_default())?;
    find_sequence_header(&obus)
        .map(|o| o.to_vec())
        .ok_or_else(|| HlsError::codec("AV1", "av1C doesn't contain a sequence header"))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// 1920x1080 main profile 8 bit, level 4.0.
    pub(crate) const SEQUENCE_HEADER: [u8; 13] = [
        0x0a, 0x0b, 0x00, 0x00, 0x00, 0x42, 0xab, 0xbf, 0xc3, 0x77, 0xff, 0xe6, 0x02,
    ];

    #[test]
    fn test_parse_sequence_header() -> HlsResult<()> {
        let sh = SequenceHeader::parse(&SEQUENCE_HEADER)?;
        assert_eq!(sh.seq_profile, 0);
        assert_eq!(sh.max_frame_width, 1920);
        assert_eq!(sh.max_frame_height, 1080);
        assert_eq!(sh.bit_depth, 8);
        assert_eq!(sh.codec_string(), "av01.0.08M.08");
        Ok(())
    }

    #[test]
    fn test_temporal_unit() -> HlsResult<()> {
        // temporal delimiter, sequence header, frame without obu_size
        let obus = vec![
            Bytes::from_static(&[0x12, 0x00]),
            Bytes::from_static(&SEQUENCE_HEADER),
            Bytes::from_static(&[0x30, 1, 2, 3]),
        ];
        let tu = join_temporal_unit(&obus);
        let split = split_temporal_unit(&tu)?;
        assert_eq!(split.len(), 2);
        assert_eq!(split[0], Bytes::from_static(&SEQUENCE_HEADER));
        assert_eq!(split[1], Bytes::from_static(&[0x32, 3, 1, 2, 3]));
        assert!(is_random_access(&split));
        Ok(())
    }
}
