//! MPEG-1/2 audio frame headers (layers I, II and III).

use bytes::Bytes;

use crate::error::{HlsError, HlsResult};

const BITRATES_V1: [[u32; 15]; 3] = [
    [0, 32, 64, 96, 128, 160, 192, 224, 256, 288, 320, 352, 384, 416, 448],
    [0, 32, 48, 56, 64, 80, 96, 112, 128, 160, 192, 224, 256, 320, 384],
    [0, 32, 40, 48, 56, 64, 80, 96, 112, 128, 160, 192, 224, 256, 320],
];
const BITRATES_V2: [[u32; 15]; 2] = [
    [0, 32, 48, 56, 64, 80, 96, 112, 128, 144, 160, 176, 192, 224, 256],
    [0, 8, 16, 24, 32, 40, 48, 56, 64, 80, 96, 112, 128, 144, 160],
];
const SAMPLE_RATES_V1: [u32; 3] = [44100, 48000, 32000];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// 1 for MPEG-1, 2 for MPEG-2 and MPEG-2.5.
    pub version: u8,
    pub layer: u8,
    pub bitrate: u32,
    pub sample_rate: u32,
    pub padding: bool,
    pub channel_count: u8,
}

impl FrameHeader {
    pub fn parse(data: &[u8]) -> HlsResult<Self> {
        let err = |reason: &str| HlsError::codec("MPEG-1 audio", reason.to_string());
        let header = data.get(..4).ok_or_else(|| err("not enough bytes"))?;
        if header[0] != 0xFF || header[1] & 0xE0 != 0xE0 {
            return Err(err("invalid sync word"));
        }

        let (version, rate_divider) = match (header[1] >> 3) & 0x03 {
            3 => (1, 1),
            2 => (2, 2),
            0 => (2, 4),
            _ => return Err(err("invalid version")),
        };
        let layer = match (header[1] >> 1) & 0x03 {
            3 => 1,
            2 => 2,
            1 => 3,
            _ => return Err(err("invalid layer")),
        };

        let bitrate_index = (header[2] >> 4) as usize;
        if bitrate_index == 0 || bitrate_index == 15 {
            return Err(err("free or invalid bitrate"));
        }
        let bitrate = if version == 1 {
            BITRATES_V1[layer as usize - 1][bitrate_index]
        } else {
            BITRATES_V2[(layer != 1) as usize][bitrate_index]
        } * 1000;

        let sample_rate = SAMPLE_RATES_V1
            .get(((header[2] >> 2) & 0x03) as usize)
            .ok_or_else(|| err("invalid sample rate"))?
            / rate_divider;

        Ok(Self {
            version,
            layer,
            bitrate,
            sample_rate,
            padding: header[2] & 0x02 != 0,
            channel_count: if header[3] >> 6 == 3 { 1 } else { 2 },
        })
    }

    pub fn sample_count(&self) -> u32 {
        match (self.layer, self.version) {
            (1, _) => 384,
            (3, 2) => 576,
            _ => 1152,
        }
    }

    /// Frame size in bytes, header included.
    pub fn frame_len(&self) -> usize {
        if self.layer == 1 {
            ((12 * self.bitrate / self.sample_rate + self.padding as u32) * 4) as usize
        } else {
            (self.sample_count() / 8 * self.bitrate / self.sample_rate + self.padding as u32)
                as usize
        }
    }
}

/// Splits a buffer of consecutive frames.
pub fn split_frames(data: &Bytes) -> HlsResult<Vec<Bytes>> {
    let mut frames = Vec::new();
    let mut pos = 0;
    while pos < data.len() {
        let header = FrameHeader::parse(&data[pos..])?;
        let end = pos + header.frame_len();
        if end > data.len() {
            return Err(HlsError::codec("MPEG-1 audio", "frame is truncated"));
        }
        frames.push(data.slice(pos..end));
        pos = end;
    }
    Ok(frames)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// MPEG-1 layer III, 128 kbit/s, 44.1 kHz, joint stereo.
    pub(crate) fn frame(padding: bool) -> Vec<u8> {
        let header = FrameHeader::parse(&[0xFF, 0xFB, 0x90 | ((padding as u8) << 1), 0x64])
            .unwrap();
        let mut out = vec![0xFF, 0xFB, 0x90 | ((padding as u8) << 1), 0x64];
        out.resize(header.frame_len(), 0);
        out
    }

    #[test]
    fn test_parse_header() -> HlsResult<()> {
        let header = FrameHeader::parse(&[0xFF, 0xFB, 0x90, 0x64])?;
        assert_eq!(header.version, 1);
        assert_eq!(header.layer, 3);
        assert_eq!(header.bitrate, 128000);
        assert_eq!(header.sample_rate, 44100);
        assert_eq!(header.channel_count, 2);
        assert_eq!(header.sample_count(), 1152);
        assert_eq!(header.frame_len(), 417);
        Ok(())
    }

    #[test]
    fn test_split_frames() -> HlsResult<()> {
        let mut data = frame(false);
        data.extend(frame(true));
        let frames = split_frames(&Bytes::from(data))?;
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].len(), 417);
        assert_eq!(frames[1].len(), 418);
        Ok(())
    }

    #[test]
    fn test_invalid_header() {
        assert!(FrameHeader::parse(&[0x00, 0x00, 0x00, 0x00]).is_err());
        assert!(FrameHeader::parse(&[0xFF, 0xFB]).is_err());
    }
}
