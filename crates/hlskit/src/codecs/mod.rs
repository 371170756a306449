//! Codecs carried by HLS tracks, their parameters and bitstream helpers.

pub mod av1;
pub(crate) mod bits;
pub mod dts;
pub mod h264;
pub mod h265;
pub mod mpeg1audio;
pub mod mpeg4audio;
pub mod opus;
pub mod vp9;

use bytes::Bytes;
use hlskit_fmp4::{ConfigBox, SampleEntry};

pub use mpeg4audio::AudioSpecificConfig;
pub use vp9::Vp9Params;

use crate::error::{HlsError, HlsResult};

/// Clock rate of video tracks and of MPEG-TS timestamps.
pub const VIDEO_CLOCK_RATE: u32 = 90000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Codec {
    Av1 {
        /// Sequence header OBU.
        sequence_header: Bytes,
    },
    Vp9(Vp9Params),
    H265 {
        vps: Bytes,
        sps: Bytes,
        pps: Bytes,
    },
    H264 {
        sps: Bytes,
        pps: Bytes,
    },
    Opus {
        channel_count: u8,
    },
    Mpeg4Audio(AudioSpecificConfig),
    Mpeg1Audio,
    Klv,
}

impl Codec {
    pub fn name(&self) -> &'static str {
        match self {
            Codec::Av1 { .. } => "AV1",
            Codec::Vp9(_) => "VP9",
            Codec::H265 { .. } => "H265",
            Codec::H264 { .. } => "H264",
            Codec::Opus { .. } => "Opus",
            Codec::Mpeg4Audio(_) => "MPEG-4 audio",
            Codec::Mpeg1Audio => "MPEG-1 audio",
            Codec::Klv => "KLV",
        }
    }

    pub fn is_video(&self) -> bool {
        match self {
            Codec::Av1 { .. } | Codec::Vp9(_) | Codec::H265 { .. } | Codec::H264 { .. } => true,
            Codec::Opus { .. } | Codec::Mpeg4Audio(_) | Codec::Mpeg1Audio | Codec::Klv => false,
        }
    }

    pub fn clock_rate(&self) -> u32 {
        match self {
            Codec::Av1 { .. }
            | Codec::Vp9(_)
            | Codec::H265 { .. }
            | Codec::H264 { .. }
            | Codec::Mpeg1Audio
            | Codec::Klv => VIDEO_CLOCK_RATE,
            Codec::Opus { .. } => opus::CLOCK_RATE,
            Codec::Mpeg4Audio(config) => config.sample_rate,
        }
    }

    /// RFC 6381 codec string, when the parameters needed to build it are
    /// known.
    pub fn codec_string(&self) -> Option<String> {
        match self {
            Codec::Av1 { sequence_header } => av1::SequenceHeader::parse(sequence_header)
                .ok()
                .map(|sh| sh.codec_string()),
            Codec::Vp9(params) => Some(params.codec_string()),
            Codec::H265 { sps, .. } => h265::Sps::parse(sps).ok().map(|sps| sps.codec_string()),
            Codec::H264 { sps, .. } => h264::Sps::parse(sps).ok().map(|sps| sps.codec_string()),
            Codec::Opus { .. } => Some("opus".to_string()),
            Codec::Mpeg4Audio(config) => Some(config.codec_string()),
            Codec::Mpeg1Audio => Some("mp4a.40.34".to_string()),
            Codec::Klv => None,
        }
    }

    /// Picture size of video codecs, when known.
    pub fn resolution(&self) -> Option<(u32, u32)> {
        match self {
            Codec::Av1 { sequence_header } => av1::SequenceHeader::parse(sequence_header)
                .ok()
                .map(|sh| (sh.max_frame_width, sh.max_frame_height)),
            Codec::Vp9(params) => Some((params.width, params.height)),
            Codec::H265 { sps, .. } => h265::Sps::parse(sps).ok().map(|s| (s.width, s.height)),
            Codec::H264 { sps, .. } => h264::Sps::parse(sps).ok().map(|s| (s.width, s.height)),
            Codec::Opus { .. } | Codec::Mpeg4Audio(_) | Codec::Mpeg1Audio | Codec::Klv => None,
        }
    }

    /// Whether the parameters needed to describe the track in an init
    /// segment are present.
    pub fn is_ready(&self) -> bool {
        match self {
            Codec::Av1 { sequence_header } => !sequence_header.is_empty(),
            Codec::H265 { vps, sps, pps } => !vps.is_empty() && !sps.is_empty() && !pps.is_empty(),
            Codec::H264 { sps, pps } => !sps.is_empty() && !pps.is_empty(),
            Codec::Vp9(_)
            | Codec::Opus { .. }
            | Codec::Mpeg4Audio(_)
            | Codec::Mpeg1Audio
            | Codec::Klv => true,
        }
    }

    pub fn sample_entry(&self, track_id: u32) -> HlsResult<SampleEntry> {
        let video = |format: &[u8; 4], config: ConfigBox| {
            let (width, height) = self.resolution().unwrap_or_default();
            SampleEntry::Video {
                format: *format,
                width: width as u16,
                height: height as u16,
                config: vec![config],
            }
        };

        Ok(match self {
            Codec::Av1 { sequence_header } => video(
                b"av01",
                ConfigBox::new(b"av1C", av1::av1_config(sequence_header)?),
            ),
            Codec::Vp9(params) => video(b"vp09", ConfigBox::new(b"vpcC", vp9::vp_config(params))),
            Codec::H265 { vps, sps, pps } => video(
                b"hvc1",
                ConfigBox::new(b"hvcC", h265::hevc_config(vps, sps, pps)?),
            ),
            Codec::H264 { sps, pps } => {
                video(b"avc1", ConfigBox::new(b"avcC", h264::avc_config(sps, pps)?))
            }
            Codec::Opus { channel_count } => SampleEntry::Audio {
                format: *b"Opus",
                channel_count: *channel_count as u16,
                sample_rate: opus::CLOCK_RATE,
                config: vec![ConfigBox::new(b"dOps", opus::opus_config(*channel_count))],
            },
            Codec::Mpeg4Audio(config) => SampleEntry::Audio {
                format: *b"mp4a",
                channel_count: config.channel_count as u16,
                sample_rate: config.sample_rate,
                config: vec![ConfigBox::new(
                    b"esds",
                    mpeg4audio::esds(
                        track_id,
                        mpeg4audio::OBJECT_TYPE_INDICATION_MPEG4_AUDIO,
                        Some(&config.marshal()?),
                    ),
                )],
            },
            Codec::Mpeg1Audio => SampleEntry::Audio {
                format: *b"mp4a",
                channel_count: 2,
                sample_rate: 0,
                config: vec![ConfigBox::new(
                    b"esds",
                    mpeg4audio::esds(
                        track_id,
                        mpeg4audio::OBJECT_TYPE_INDICATION_MPEG1_AUDIO,
                        None,
                    ),
                )],
            },
            Codec::Klv => return Err(HlsError::UnsupportedCodec("KLV in fMP4".to_string())),
        })
    }

    pub fn from_sample_entry(entry: &SampleEntry) -> HlsResult<Self> {
        let config = |kind: &[u8; 4]| {
            entry.config(kind).ok_or_else(|| {
                HlsError::codec(
                    "fMP4",
                    format!("{} box is missing", String::from_utf8_lossy(kind)),
                )
            })
        };

        match (entry.format(), entry) {
            (b"av01", _) => Ok(Codec::Av1 {
                sequence_header: av1::parse_av1_config(config(b"av1C")?)?.into(),
            }),
            (b"vp09", SampleEntry::Video { width, height, .. }) => Ok(Codec::Vp9(
                vp9::parse_vp_config(config(b"vpcC")?, *width as u32, *height as u32)?,
            )),
            (b"hvc1" | b"hev1", _) => {
                let (vps, sps, pps) = h265::parse_hevc_config(config(b"hvcC")?)?;
                Ok(Codec::H265 {
                    vps: vps.into(),
                    sps: sps.into(),
                    pps: pps.into(),
                })
            }
            (b"avc1" | b"avc3", _) => {
                let (sps, pps) = h264::parse_avc_config(config(b"avcC")?)?;
                Ok(Codec::H264 {
                    sps: sps.into(),
                    pps: pps.into(),
                })
            }
            (b"Opus", _) => Ok(Codec::Opus {
                channel_count: opus::parse_opus_config(config(b"dOps")?)?,
            }),
            (b"mp4a", _) => match mpeg4audio::parse_esds(config(b"esds")?)? {
                (mpeg4audio::OBJECT_TYPE_INDICATION_MPEG4_AUDIO, Some(info)) => Ok(
                    Codec::Mpeg4Audio(AudioSpecificConfig::parse(&info)?),
                ),
                (0x69 | mpeg4audio::OBJECT_TYPE_INDICATION_MPEG1_AUDIO, _) => {
                    Ok(Codec::Mpeg1Audio)
                }
                (oti, _) => Err(HlsError::UnsupportedCodec(format!(
                    "mp4a with object type indication 0x{oti:02x}"
                ))),
            },
            (format, _) => Err(HlsError::UnsupportedCodec(
                String::from_utf8_lossy(format).into_owned(),
            )),
        }
    }

    /// Builds a codec from an MPEG-TS stream type and the payload of its
    /// first PES packet.
    pub fn from_ts(codec: hlskit_mpegts::Codec, first_payload: &[u8]) -> HlsResult<Self> {
        use hlskit_mpegts::Codec as Ts;

        match codec {
            Ts::H264 => {
                let au = h264::split_annexb(first_payload).unwrap_or_default();
                let (sps, pps) = h264::find_params(&au);
                Ok(Codec::H264 {
                    sps: sps.cloned().unwrap_or_default(),
                    pps: pps.cloned().unwrap_or_default(),
                })
            }
            Ts::H265 => {
                let au = h264::split_annexb(first_payload).unwrap_or_default();
                let (vps, sps, pps) = h265::find_params(&au);
                Ok(Codec::H265 {
                    vps: vps.cloned().unwrap_or_default(),
                    sps: sps.cloned().unwrap_or_default(),
                    pps: pps.cloned().unwrap_or_default(),
                })
            }
            Ts::Mpeg4Audio => {
                let packets = hlskit_mpegts::adts::decode(first_payload)?;
                let first = packets
                    .first()
                    .ok_or_else(|| HlsError::codec("MPEG-4 audio", "no ADTS packets"))?;
                Ok(Codec::Mpeg4Audio(AudioSpecificConfig::from_adts(first)?))
            }
            Ts::Mpeg1Audio => Ok(Codec::Mpeg1Audio),
            Ts::Klv => Ok(Codec::Klv),
            Ts::Unsupported(stream_type) => Err(HlsError::UnsupportedCodec(format!(
                "MPEG-TS stream type 0x{stream_type:02x}"
            ))),
        }
    }

    /// MPEG-TS stream type of codecs the muxer can write in MPEG-TS.
    pub fn ts_codec(&self) -> Option<hlskit_mpegts::Codec> {
        match self {
            Codec::H264 { .. } => Some(hlskit_mpegts::Codec::H264),
            Codec::Mpeg4Audio(_) => Some(hlskit_mpegts::Codec::Mpeg4Audio),
            Codec::Mpeg1Audio => Some(hlskit_mpegts::Codec::Mpeg1Audio),
            Codec::Klv => Some(hlskit_mpegts::Codec::Klv),
            Codec::Av1 { .. } | Codec::Vp9(_) | Codec::H265 { .. } | Codec::Opus { .. } => None,
        }
    }
}
