//! ADTS framing of MPEG-4 audio access units.

use crate::{TsError, TsResult};

pub const SAMPLE_RATES: [u32; 13] = [
    96000, 88200, 64000, 48000, 44100, 32000, 24000, 22050, 16000, 12000, 11025, 8000, 7350,
];

const HEADER_SIZE: usize = 7;
const MAX_FRAME_SIZE: usize = (1 << 13) - 1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdtsPacket {
    /// MPEG-4 audio object type (profile + 1).
    pub object_type: u8,
    pub sample_rate_index: u8,
    pub channel_config: u8,
    pub au: Vec<u8>,
}

impl AdtsPacket {
    pub fn sample_rate(&self) -> Option<u32> {
        SAMPLE_RATES.get(self.sample_rate_index as usize).copied()
    }
}

pub fn sample_rate_index(rate: u32) -> Option<u8> {
    SAMPLE_RATES.iter().position(|r| *r == rate).map(|i| i as u8)
}

pub fn decode(mut data: &[u8]) -> TsResult<Vec<AdtsPacket>> {
    let mut packets = Vec::new();

    while !data.is_empty() {
        if data.len() < HEADER_SIZE {
            return Err(TsError::InvalidAdts("not enough bytes for header"));
        }
        if data[0] != 0xFF || data[1] & 0xF0 != 0xF0 {
            return Err(TsError::InvalidAdts("invalid syncword"));
        }

        let protection_absent = data[1] & 0x01 != 0;
        let object_type = ((data[2] >> 6) & 0x03) + 1;
        let sample_rate_index = (data[2] >> 2) & 0x0F;
        if sample_rate_index as usize >= SAMPLE_RATES.len() {
            return Err(TsError::InvalidAdts("invalid sample rate index"));
        }
        let channel_config = ((data[2] & 0x01) << 2) | ((data[3] >> 6) & 0x03);
        if channel_config == 0 {
            return Err(TsError::InvalidAdts("channel configuration 0 is not supported"));
        }
        let frame_len = (((data[3] & 0x03) as usize) << 11)
            | ((data[4] as usize) << 3)
            | ((data[5] >> 5) as usize);
        let frame_count = (data[6] & 0x03) + 1;
        if frame_count != 1 {
            return Err(TsError::InvalidAdts("multiple frames per ADTS packet"));
        }

        let header_len = if protection_absent { 7 } else { 9 };
        if frame_len < header_len || frame_len > data.len() {
            return Err(TsError::InvalidAdts("invalid frame length"));
        }

        packets.push(AdtsPacket {
            object_type,
            sample_rate_index,
            channel_config,
            au: data[header_len..frame_len].to_vec(),
        });
        data = &data[frame_len..];
    }

    Ok(packets)
}

pub fn encode(packets: &[AdtsPacket]) -> TsResult<Vec<u8>> {
    let mut out = Vec::with_capacity(packets.iter().map(|p| p.au.len() + HEADER_SIZE).sum());

    for packet in packets {
        let frame_len = packet.au.len() + HEADER_SIZE;
        if frame_len > MAX_FRAME_SIZE {
            return Err(TsError::InvalidAdts("access unit is too big"));
        }
        // buffer fullness is always signalled as variable bit rate
        let fullness = 0x07FFusize;
        out.extend_from_slice(&[
            0xFF,
            0xF1,
            ((packet.object_type.saturating_sub(1) & 0x03) << 6)
                | ((packet.sample_rate_index & 0x0F) << 2)
                | ((packet.channel_config >> 2) & 0x01),
            ((packet.channel_config & 0x03) << 6) | ((frame_len >> 11) as u8 & 0x03),
            (frame_len >> 3) as u8,
            (((frame_len & 0x07) << 5) | (fullness >> 6)) as u8,
            ((fullness & 0x3F) << 2) as u8,
        ]);
        out.extend_from_slice(&packet.au);
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_two_frames() -> TsResult<()> {
        let packets = vec![
            AdtsPacket {
                object_type: 2,
                sample_rate_index: 4,
                channel_config: 2,
                au: vec![1, 2, 3],
            },
            AdtsPacket {
                object_type: 2,
                sample_rate_index: 4,
                channel_config: 2,
                au: vec![4; 300],
            },
        ];
        let data = encode(&packets)?;
        assert_eq!(&data[..2], &[0xFF, 0xF1]);

        let decoded = decode(&data)?;
        assert_eq!(decoded, packets);
        assert_eq!(decoded[0].sample_rate(), Some(44100));
        Ok(())
    }

    #[test]
    fn test_invalid_syncword() {
        assert!(decode(&[0x00, 0xF1, 0x50, 0x80, 0x01, 0x7F, 0xFC]).is_err());
    }
}
