//! MPEG-4 audio AudioSpecificConfig and the `esds` box.

use hlskit_mpegts::adts::{self, AdtsPacket};

use super::bits::BitReader;
use crate::error::{HlsError, HlsResult};

/// Samples per access unit for AAC.
pub const SAMPLES_PER_ACCESS_UNIT: u32 = 1024;

pub const OBJECT_TYPE_INDICATION_MPEG4_AUDIO: u8 = 0x40;
pub const OBJECT_TYPE_INDICATION_MPEG1_AUDIO: u8 = 0x6B;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioSpecificConfig {
    pub object_type: u8,
    pub sample_rate: u32,
    pub channel_count: u8,
}

impl AudioSpecificConfig {
    pub fn parse(data: &[u8]) -> HlsResult<Self> {
        let mut r = BitReader::new(data, "MPEG-4 audio");
        let mut object_type = r.read_u8(5)?;
        if object_type == 31 {
            object_type = 32 + r.read_u8(6)?;
        }
        let index = r.read_u8(4)?;
        let sample_rate = if index == 15 {
            r.read_u32(24)?
        } else {
            adts::SAMPLE_RATES
                .get(index as usize)
                .copied()
                .ok_or_else(|| {
                    HlsError::codec("MPEG-4 audio", format!("invalid sample rate index {index}"))
                })?
        };
        let channel_config = r.read_u8(4)?;
        let channel_count = match channel_config {
            0 => {
                return Err(HlsError::codec(
                    "MPEG-4 audio",
                    "channel configuration 0 is not supported",
                ))
            }
            1..=6 => channel_config,
            7 => 8,
            _ => {
                return Err(HlsError::codec(
                    "MPEG-4 audio",
                    format!("invalid channel configuration {channel_config}"),
                ))
            }
        };
        Ok(Self {
            object_type,
            sample_rate,
            channel_count,
        })
    }

    pub fn marshal(&self) -> HlsResult<Vec<u8>> {
        let channel_config = match self.channel_count {
            1..=6 => self.channel_count,
            8 => 7,
            n => {
                return Err(HlsError::codec(
                    "MPEG-4 audio",
                    format!("unsupported channel count {n}"),
                ))
            }
        };

        let mut bits: Vec<(u32, u32)> = Vec::with_capacity(5);
        if self.object_type >= 31 {
            bits.push((31, 5));
            bits.push(((self.object_type - 32) as u32, 6));
        } else {
            bits.push((self.object_type as u32, 5));
        }
        match adts::sample_rate_index(self.sample_rate) {
            Some(index) => bits.push((index as u32, 4)),
            None => {
                bits.push((15, 4));
                bits.push((self.sample_rate, 24));
            }
        }
        bits.push((channel_config as u32, 4));

        let mut out = Vec::new();
        let (mut acc, mut len) = (0u64, 0u32);
        for (value, n) in bits {
            acc = (acc << n) | value as u64;
            len += n;
            while len >= 8 {
                len -= 8;
                out.push((acc >> len) as u8);
            }
        }
        if len > 0 {
            out.push((acc << (8 - len)) as u8);
        }
        Ok(out)
    }

    /// `mp4a.40.<object type>`
    pub fn codec_string(&self) -> String {
        format!("mp4a.40.{}", self.object_type)
    }

    pub fn from_adts(packet: &AdtsPacket) -> HlsResult<Self> {
        Ok(Self {
            object_type: packet.object_type,
            sample_rate: packet.sample_rate().ok_or_else(|| {
                HlsError::codec("MPEG-4 audio", "invalid ADTS sample rate index")
            })?,
            channel_count: match packet.channel_config {
                7 => 8,
                n => n,
            },
        })
    }

    pub fn to_adts(&self, au: Vec<u8>) -> HlsResult<AdtsPacket> {
        let sample_rate_index = adts::sample_rate_index(self.sample_rate).ok_or_else(|| {
            HlsError::codec(
                "MPEG-4 audio",
                format!("sample rate {} can't be carried in ADTS", self.sample_rate),
            )
        })?;
        Ok(AdtsPacket {
            object_type: self.object_type,
            sample_rate_index,
            channel_config: match self.channel_count {
                8 => 7,
                n => n,
            },
            au,
        })
    }
}

fn put_descriptor(out: &mut Vec<u8>, tag: u8, body: &[u8]) {
    out.push(tag);
    let mut len = body.len();
    let mut size = [0u8; 4];
    for i in (0..4).rev() {
        size[i] = (len & 0x7F) as u8 | if i < 3 { 0x80 } else { 0 };
        len >>= 7;
    }
    out.extend_from_slice(&size);
    out.extend_from_slice(body);
}

/// Builds the payload of an `esds` box, version and flags included.
pub fn esds(track_id: u32, object_type_indication: u8, specific_info: Option<&[u8]>) -> Vec<u8> {
    let mut decoder_config = vec![object_type_indication, 0x15, 0, 0, 0];
    decoder_config.extend_from_slice(&0u32.to_be_bytes()); // max bitrate
    decoder_config.extend_from_slice(&0u32.to_be_bytes()); // average bitrate
    if let Some(info) = specific_info {
        put_descriptor(&mut decoder_config, 0x05, info);
    }

    let mut es = Vec::new();
    es.extend_from_slice(&(track_id as u16).to_be_bytes());
    es.push(0);
    put_descriptor(&mut es, 0x04, &decoder_config);
    put_descriptor(&mut es, 0x06, &[0x02]);

    let mut out = vec![0, 0, 0, 0];
    put_descriptor(&mut out, 0x03, &es);
    out
}

/// Object type indication and decoder specific info of an `esds` payload.
pub fn parse_esds(data: &[u8]) -> HlsResult<(u8, Option<Vec<u8>>)> {
    let err = || HlsError::codec("MPEG-4 audio", "invalid esds");

    fn descriptor(data: &[u8]) -> Option<(u8, &[u8], &[u8])> {
        let tag = *data.first()?;
        let mut len = 0usize;
        let mut pos = 1;
        for _ in 0..4 {
            let b = *data.get(pos)?;
            pos += 1;
            len = (len << 7) | (b & 0x7F) as usize;
            if b & 0x80 == 0 {
                break;
            }
        }
        let body = data.get(pos..pos + len)?;
        Some((tag, body, &data[pos + len..]))
    }

    let (tag, es, _) = descriptor(data.get(4..).ok_or_else(err)?).ok_or_else(err)?;
    if tag != 0x03 {
        return Err(err());
    }
    let flags = *es.get(2).ok_or_else(err)?;
    let mut pos = 3;
    if flags & 0x80 != 0 {
        pos += 2;
    }
    if flags & 0x40 != 0 {
        pos += 1 + *es.get(pos).ok_or_else(err)? as usize;
    }
    if flags & 0x20 != 0 {
        pos += 2;
    }

    let (tag, decoder_config, _) =
        descriptor(es.get(pos..).ok_or_else(err)?).ok_or_else(err)?;
    if tag != 0x04 {
        return Err(err());
    }
    let object_type_indication = *decoder_config.first().ok_or_else(err)?;
    let specific_info = decoder_config
        .get(13..)
        .and_then(descriptor)
        .filter(|(tag, _, _)| *tag == 0x05)
        .map(|(_, body, _)| body.to_vec());

    Ok((object_type_indication, specific_info))
}
