use crate::reader::{find_child, BoxReader, Fields};
use crate::writer::{put_unity_matrix, write_box, write_full_box, PutBytes};
use crate::{Fmp4Error, Fmp4Result};

/// A child box of a sample entry (`avcC`, `hvcC`, `av1C`, `vpcC`, `esds`,
/// `dOps`, ...), stored without its header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigBox {
    pub kind: [u8; 4],
    pub payload: Vec<u8>,
}

impl ConfigBox {
    pub fn new(kind: &[u8; 4], payload: Vec<u8>) -> Self {
        Self {
            kind: *kind,
            payload,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SampleEntry {
    Video {
        format: [u8; 4],
        width: u16,
        height: u16,
        config: Vec<ConfigBox>,
    },
    Audio {
        format: [u8; 4],
        channel_count: u16,
        sample_rate: u32,
        config: Vec<ConfigBox>,
    },
}

impl SampleEntry {
    pub fn format(&self) -> &[u8; 4] {
        match self {
            SampleEntry::Video { format, .. } | SampleEntry::Audio { format, .. } => format,
        }
    }

    pub fn is_video(&self) -> bool {
        matches!(self, SampleEntry::Video { .. })
    }

    pub fn config(&self, kind: &[u8; 4]) -> Option<&[u8]> {
        let config = match self {
            SampleEntry::Video { config, .. } | SampleEntry::Audio { config, .. } => config,
        };
        config
            .iter()
            .find(|c| &c.kind == kind)
            .map(|c| c.payload.as_slice())
    }

    fn handler(&self) -> &'static [u8; 4] {
        if self.is_video() {
            b"vide"
        } else {
            b"soun"
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitTrack {
    pub id: u32,
    pub time_scale: u32,
    pub sample_entry: SampleEntry,
}

/// Initialization section of a fragmented MP4 stream.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Init {
    pub tracks: Vec<InitTrack>,
}

impl Init {
    pub fn marshal(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(1024);

        write_box(&mut out, b"ftyp", |out| {
            out.extend_from_slice(b"mp42");
            out.put_u32(1);
            for brand in [b"mp41", b"mp42", b"isom", b"hlsf"] {
                out.extend_from_slice(brand);
            }
        });

        write_box(&mut out, b"moov", |out| {
            write_full_box(out, b"mvhd", 0, 0, |out| {
                out.put_u32(0); // creation time
                out.put_u32(0); // modification time
                out.put_u32(1000);
                out.put_u32(0); // duration
                out.put_u32(0x0001_0000); // rate
                out.put_u16(0x0100); // volume
                out.put_zeros(10);
                put_unity_matrix(out);
                out.put_zeros(24);
                out.put_u32(self.tracks.len() as u32 + 1);
            });

            for track in &self.tracks {
                write_trak(out, track);
            }

            write_box(out, b"mvex", |out| {
                for track in &self.tracks {
                    write_full_box(out, b"trex", 0, 0, |out| {
                        out.put_u32(track.id);
                        out.put_u32(1); // sample description index
                        out.put_u32(0);
                        out.put_u32(0);
                        out.put_u32(0);
                    });
                }
            });
        });

        out
    }

    pub fn unmarshal(data: &[u8]) -> Fmp4Result<Self> {
        let moov = BoxReader::new(data)
            .find(b"moov")?
            .ok_or(Fmp4Error::MissingBox("moov"))?;

        let mut tracks = Vec::new();
        let mut children = BoxReader::new(moov.payload);
        while let Some(trak) = children.find(b"trak")? {
            if let Some(track) = read_trak(trak.payload)? {
                tracks.push(track);
            }
        }

        Ok(Self { tracks })
    }

    pub fn track(&self, id: u32) -> Option<&InitTrack> {
        self.tracks.iter().find(|t| t.id == id)
    }
}

fn write_trak(out: &mut Vec<u8>, track: &InitTrack) {
    let (width, height) = match &track.sample_entry {
        SampleEntry::Video { width, height, .. } => (*width as u32, *height as u32),
        SampleEntry::Audio { .. } => (0, 0),
    };

    write_box(out, b"trak", |out| {
        // enabled | in movie
        write_full_box(out, b"tkhd", 0, 3, |out| {
            out.put_u32(0);
            out.put_u32(0);
            out.put_u32(track.id);
            out.put_u32(0);
            out.put_u32(0); // duration
            out.put_zeros(8);
            out.put_u16(0); // layer
            out.put_u16(0); // alternate group
            out.put_u16(if track.sample_entry.is_video() {
                0
            } else {
                0x0100
            });
            out.put_u16(0);
            put_unity_matrix(out);
            out.put_u32(width << 16);
            out.put_u32(height << 16);
        });

        write_box(out, b"mdia", |out| {
            write_full_box(out, b"mdhd", 0, 0, |out| {
                out.put_u32(0);
                out.put_u32(0);
                out.put_u32(track.time_scale);
                out.put_u32(0);
                out.put_u16(0x55C4); // und
                out.put_u16(0);
            });

            write_full_box(out, b"hdlr", 0, 0, |out| {
                out.put_u32(0);
                out.extend_from_slice(track.sample_entry.handler());
                out.put_zeros(12);
                let name: &[u8] = if track.sample_entry.is_video() {
                    b"VideoHandler\0"
                } else {
                    b"SoundHandler\0"
                };
                out.extend_from_slice(name);
            });

            write_box(out, b"minf", |out| {
                if track.sample_entry.is_video() {
                    write_full_box(out, b"vmhd", 0, 1, |out| out.put_zeros(8));
                } else {
                    write_full_box(out, b"smhd", 0, 0, |out| out.put_zeros(4));
                }

                write_box(out, b"dinf", |out| {
                    write_full_box(out, b"dref", 0, 0, |out| {
                        out.put_u32(1);
                        // self-contained
                        write_full_box(out, b"url ", 0, 1, |_| {});
                    });
                });

                write_box(out, b"stbl", |out| {
                    write_full_box(out, b"stsd", 0, 0, |out| {
                        out.put_u32(1);
                        write_sample_entry(out, &track.sample_entry);
                    });
                    write_full_box(out, b"stts", 0, 0, |out| out.put_u32(0));
                    write_full_box(out, b"stsc", 0, 0, |out| out.put_u32(0));
                    write_full_box(out, b"stsz", 0, 0, |out| {
                        out.put_u32(0);
                        out.put_u32(0);
                    });
                    write_full_box(out, b"stco", 0, 0, |out| out.put_u32(0));
                });
            });
        });
    });
}

fn write_sample_entry(out: &mut Vec<u8>, entry: &SampleEntry) {
    match entry {
        SampleEntry::Video {
            format,
            width,
            height,
            config,
        } => write_box(out, format, |out| {
            out.put_zeros(6);
            out.put_u16(1); // data reference index
            out.put_zeros(16);
            out.put_u16(*width);
            out.put_u16(*height);
            out.put_u32(0x0048_0000);
            out.put_u32(0x0048_0000);
            out.put_u32(0);
            out.put_u16(1); // frame count
            out.put_zeros(32); // compressor name
            out.put_u16(0x0018);
            out.put_u16(0xFFFF);
            for c in config {
                write_box(out, &c.kind, |out| out.extend_from_slice(&c.payload));
            }
        }),
        SampleEntry::Audio {
            format,
            channel_count,
            sample_rate,
            config,
        } => write_box(out, format, |out| {
            out.put_zeros(6);
            out.put_u16(1);
            out.put_zeros(8);
            out.put_u16(*channel_count);
            out.put_u16(16);
            out.put_zeros(4);
            // 16.16 fixed point, rates above 65535 do not fit
            let rate = if *sample_rate > 0xFFFF { 0 } else { *sample_rate };
            out.put_u32(rate << 16);
            for c in config {
                write_box(out, &c.kind, |out| out.extend_from_slice(&c.payload));
            }
        }),
    }
}

fn read_trak(trak: &[u8]) -> Fmp4Result<Option<InitTrack>> {
    let tkhd = find_child(trak, b"tkhd", "tkhd")?;
    let mut fields = Fields::new(tkhd.payload, "tkhd");
    let (version, _) = fields.full_header()?;
    fields.skip(if version == 1 { 16 } else { 8 })?;
    let id = fields.u32()?;

    let mdia = find_child(trak, b"mdia", "mdia")?;

    let mdhd = find_child(mdia.payload, b"mdhd", "mdhd")?;
    let mut fields = Fields::new(mdhd.payload, "mdhd");
    let (version, _) = fields.full_header()?;
    fields.skip(if version == 1 { 16 } else { 8 })?;
    let time_scale = fields.u32()?;

    let hdlr = find_child(mdia.payload, b"hdlr", "hdlr")?;
    let mut fields = Fields::new(hdlr.payload, "hdlr");
    fields.full_header()?;
    fields.skip(4)?;
    let mut handler = [0u8; 4];
    for b in handler.iter_mut() {
        *b = fields.u8()?;
    }

    let minf = find_child(mdia.payload, b"minf", "minf")?;
    let stbl = find_child(minf.payload, b"stbl", "stbl")?;
    let stsd = find_child(stbl.payload, b"stsd", "stsd")?;
    let mut fields = Fields::new(stsd.payload, "stsd");
    fields.full_header()?;
    let count = fields.u32()?;
    if count == 0 {
        return Err(Fmp4Error::MissingBox("sample entry"));
    }
    let entry = BoxReader::new(fields.rest())
        .next_box()?
        .ok_or(Fmp4Error::MissingBox("sample entry"))?;

    let sample_entry = match &handler {
        b"vide" => read_video_entry(entry.kind, entry.payload)?,
        b"soun" => read_audio_entry(entry.kind, entry.payload)?,
        _ => return Ok(None),
    };

    Ok(Some(InitTrack {
        id,
        time_scale,
        sample_entry,
    }))
}

fn read_config_boxes(data: &[u8]) -> Fmp4Result<Vec<ConfigBox>> {
    let mut reader = BoxReader::new(data);
    let mut config = Vec::new();
    while let Some(b) = reader.next_box()? {
        config.push(ConfigBox::new(&b.kind, b.payload.to_vec()));
    }
    Ok(config)
}

fn read_video_entry(format: [u8; 4], payload: &[u8]) -> Fmp4Result<SampleEntry> {
    let mut fields = Fields::new(payload, "visual sample entry");
    fields.skip(24)?;
    let width = fields.u16()?;
    let height = fields.u16()?;
    fields.skip(50)?;
    Ok(SampleEntry::Video {
        format,
        width,
        height,
        config: read_config_boxes(fields.rest())?,
    })
}

fn read_audio_entry(format: [u8; 4], payload: &[u8]) -> Fmp4Result<SampleEntry> {
    let mut fields = Fields::new(payload, "audio sample entry");
    fields.skip(8)?;
    let version = fields.u16()?;
    fields.skip(6)?;
    let channel_count = fields.u16()?;
    fields.skip(6)?;
    let sample_rate = fields.u32()? >> 16;
    match version {
        0 => {}
        // QuickTime sound description v1 carries four more fields
        1 => fields.skip(16)?,
        _ => {
            return Err(Fmp4Error::UnsupportedVersion {
                kind: "audio sample entry",
                version: version as u8,
            })
        }
    }
    Ok(SampleEntry::Audio {
        format,
        channel_count,
        sample_rate,
        config: read_config_boxes(fields.rest())?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_init() -> Init {
        Init {
            tracks: vec![
                InitTrack {
                    id: 1,
                    time_scale: 90000,
                    sample_entry: SampleEntry::Video {
                        format: *b"avc1",
                        width: 1920,
                        height: 1080,
                        config: vec![ConfigBox::new(b"avcC", vec![1, 0x64, 0, 0x28, 0xFF])],
                    },
                },
                InitTrack {
                    id: 2,
                    time_scale: 44100,
                    sample_entry: SampleEntry::Audio {
                        format: *b"mp4a",
                        channel_count: 2,
                        sample_rate: 44100,
                        config: vec![ConfigBox::new(b"esds", vec![0, 0, 0, 0, 3, 1])],
                    },
                },
            ],
        }
    }

    #[test]
    fn test_init_unmarshal_marshalled() -> Fmp4Result<()> {
        let init = sample_init();
        let data = init.marshal();
        assert_eq!(&data[4..8], b"ftyp");

        let decoded = Init::unmarshal(&data)?;
        assert_eq!(decoded, init);
        Ok(())
    }

    #[test]
    fn test_init_without_moov() {
        let mut data = Vec::new();
        write_box(&mut data, b"ftyp", |out| out.extend_from_slice(b"isom"));
        assert!(matches!(
            Init::unmarshal(&data),
            Err(Fmp4Error::MissingBox("moov"))
        ));
    }
}
