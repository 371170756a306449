use bytes::Bytes;

use crate::reader::{BoxReader, Fields};
use crate::writer::{write_box, write_full_box, PutBytes};
use crate::{Fmp4Error, Fmp4Result};

const TFHD_BASE_DATA_OFFSET: u32 = 0x01;
const TFHD_SAMPLE_DESCRIPTION_INDEX: u32 = 0x02;
const TFHD_DEFAULT_DURATION: u32 = 0x08;
const TFHD_DEFAULT_SIZE: u32 = 0x10;
const TFHD_DEFAULT_FLAGS: u32 = 0x20;
const TFHD_DEFAULT_BASE_IS_MOOF: u32 = 0x02_0000;

const TRUN_DATA_OFFSET: u32 = 0x01;
const TRUN_FIRST_SAMPLE_FLAGS: u32 = 0x04;
const TRUN_DURATION: u32 = 0x100;
const TRUN_SIZE: u32 = 0x200;
const TRUN_FLAGS: u32 = 0x400;
const TRUN_CTS: u32 = 0x800;

/// Bytes of the `moof`, `mfhd` and `mdat` headers of a part.
pub const PART_OVERHEAD: usize = 8 + 16 + 8;
/// Bytes of the `traf`, `tfhd`, `tfdt` and `trun` headers of a track.
pub const TRACK_OVERHEAD: usize = 8 + 16 + 20 + 20;
/// Bytes of a `trun` entry.
pub const SAMPLE_OVERHEAD: usize = 16;

const SAMPLE_IS_NON_SYNC: u32 = 0x0001_0000;
const SAMPLE_DEPENDS_ON_OTHERS: u32 = 0x0100_0000;
const SAMPLE_DEPENDS_ON_NONE: u32 = 0x0200_0000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sample {
    /// Duration in track time scale units.
    pub duration: u32,
    /// Difference between PTS and DTS.
    pub pts_offset: i32,
    pub is_non_sync: bool,
    pub payload: Bytes,
}

impl Sample {
    fn flags(&self) -> u32 {
        if self.is_non_sync {
            SAMPLE_DEPENDS_ON_OTHERS | SAMPLE_IS_NON_SYNC
        } else {
            SAMPLE_DEPENDS_ON_NONE
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartTrack {
    pub id: u32,
    /// Decode time of the first sample.
    pub base_time: u64,
    pub samples: Vec<Sample>,
}

impl PartTrack {
    pub fn duration(&self) -> u64 {
        self.samples.iter().map(|s| s.duration as u64).sum()
    }
}

/// A `moof` + `mdat` pair.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Part {
    pub sequence_number: u32,
    pub tracks: Vec<PartTrack>,
}

impl Part {
    /// Length of [`Self::marshal`] output.
    pub fn size(&self) -> usize {
        PART_OVERHEAD
            + self
                .tracks
                .iter()
                .map(|t| {
                    TRACK_OVERHEAD
                        + t.samples
                            .iter()
                            .map(|s| SAMPLE_OVERHEAD + s.payload.len())
                            .sum::<usize>()
                })
                .sum::<usize>()
    }

    pub fn marshal(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.size());
        let mut offset_fields = Vec::with_capacity(self.tracks.len());

        write_box(&mut out, b"moof", |out| {
            write_full_box(out, b"mfhd", 0, 0, |out| out.put_u32(self.sequence_number));

            for track in &self.tracks {
                write_box(out, b"traf", |out| {
                    write_full_box(out, b"tfhd", 0, TFHD_DEFAULT_BASE_IS_MOOF, |out| {
                        out.put_u32(track.id)
                    });
                    write_full_box(out, b"tfdt", 1, 0, |out| out.put_u64(track.base_time));

                    let flags =
                        TRUN_DATA_OFFSET | TRUN_DURATION | TRUN_SIZE | TRUN_FLAGS | TRUN_CTS;
                    write_full_box(out, b"trun", 1, flags, |out| {
                        out.put_u32(track.samples.len() as u32);
                        offset_fields.push(out.len());
                        out.put_i32(0);
                        for sample in &track.samples {
                            out.put_u32(sample.duration);
                            out.put_u32(sample.payload.len() as u32);
                            out.put_u32(sample.flags());
                            out.put_i32(sample.pts_offset);
                        }
                    });
                });
            }
        });

        // data offsets are relative to the start of moof
        let mut data_offset = out.len() + 8;
        for (track, field) in self.tracks.iter().zip(offset_fields) {
            out[field..field + 4].copy_from_slice(&(data_offset as i32).to_be_bytes());
            data_offset += track.samples.iter().map(|s| s.payload.len()).sum::<usize>();
        }

        write_box(&mut out, b"mdat", |out| {
            for track in &self.tracks {
                for sample in &track.samples {
                    out.extend_from_slice(&sample.payload);
                }
            }
        });

        out
    }

    /// Decodes every `moof` of a segment or part.
    pub fn unmarshal_all(data: &[u8]) -> Fmp4Result<Vec<Part>> {
        let mut parts = Vec::new();
        let mut reader = BoxReader::new(data);
        while let Some(b) = reader.next_box()? {
            if &b.kind == b"moof" {
                parts.push(read_moof(data, b.offset, b.payload)?);
            }
        }
        Ok(parts)
    }
}

#[derive(Default)]
struct TrackDefaults {
    base_data_offset: Option<u64>,
    duration: u32,
    size: u32,
    flags: u32,
}

fn read_moof(data: &[u8], moof_offset: usize, moof: &[u8]) -> Fmp4Result<Part> {
    let mut part = Part::default();
    let mut reader = BoxReader::new(moof);

    while let Some(b) = reader.next_box()? {
        match &b.kind {
            b"mfhd" => {
                let mut fields = Fields::new(b.payload, "mfhd");
                fields.full_header()?;
                part.sequence_number = fields.u32()?;
            }
            b"traf" => part.tracks.push(read_traf(data, moof_offset, b.payload)?),
            _ => {}
        }
    }

    Ok(part)
}

fn read_traf(data: &[u8], moof_offset: usize, traf: &[u8]) -> Fmp4Result<PartTrack> {
    let mut track = PartTrack {
        id: 0,
        base_time: 0,
        samples: Vec::new(),
    };
    let mut defaults = TrackDefaults::default();
    let mut has_tfhd = false;
    let mut next_data_offset: Option<usize> = None;

    let mut reader = BoxReader::new(traf);
    while let Some(b) = reader.next_box()? {
        match &b.kind {
            b"tfhd" => {
                let mut fields = Fields::new(b.payload, "tfhd");
                let (_, flags) = fields.full_header()?;
                track.id = fields.u32()?;
                if flags & TFHD_BASE_DATA_OFFSET != 0 {
                    defaults.base_data_offset = Some(fields.u64()?);
                }
                if flags & TFHD_SAMPLE_DESCRIPTION_INDEX != 0 {
                    fields.skip(4)?;
                }
                if flags & TFHD_DEFAULT_DURATION != 0 {
                    defaults.duration = fields.u32()?;
                }
                if flags & TFHD_DEFAULT_SIZE != 0 {
                    defaults.size = fields.u32()?;
                }
                if flags & TFHD_DEFAULT_FLAGS != 0 {
                    defaults.flags = fields.u32()?;
                }
                has_tfhd = true;
            }
            b"tfdt" => {
                let mut fields = Fields::new(b.payload, "tfdt");
                let (version, _) = fields.full_header()?;
                track.base_time = match version {
                    0 => fields.u32()? as u64,
                    1 => fields.u64()?,
                    version => {
                        return Err(Fmp4Error::UnsupportedVersion {
                            kind: "tfdt",
                            version,
                        })
                    }
                };
            }
            b"trun" => {
                if !has_tfhd {
                    return Err(Fmp4Error::MissingBox("tfhd"));
                }
                let base = defaults
                    .base_data_offset
                    .map(|o| o as usize)
                    .unwrap_or(moof_offset);
                next_data_offset = Some(read_trun(
                    data,
                    base,
                    next_data_offset,
                    &defaults,
                    &mut track,
                    b.payload,
                )?);
            }
            _ => {}
        }
    }

    if !has_tfhd {
        return Err(Fmp4Error::MissingBox("tfhd"));
    }
    Ok(track)
}

/// Reads the samples of one `trun` and returns the offset right after its data.
fn read_trun(
    data: &[u8],
    base: usize,
    previous_end: Option<usize>,
    defaults: &TrackDefaults,
    track: &mut PartTrack,
    trun: &[u8],
) -> Fmp4Result<usize> {
    let mut fields = Fields::new(trun, "trun");
    let (version, flags) = fields.full_header()?;
    let count = fields.u32()?;

    let mut pos = if flags & TRUN_DATA_OFFSET != 0 {
        let offset = fields.i32()?;
        base.checked_add_signed(offset as isize)
            .ok_or(Fmp4Error::DataOutOfBounds(track.id))?
    } else {
        previous_end.unwrap_or(base)
    };

    let first_flags = if flags & TRUN_FIRST_SAMPLE_FLAGS != 0 {
        Some(fields.u32()?)
    } else {
        None
    };

    for i in 0..count {
        let duration = if flags & TRUN_DURATION != 0 {
            fields.u32()?
        } else {
            defaults.duration
        };
        let size = if flags & TRUN_SIZE != 0 {
            fields.u32()?
        } else {
            defaults.size
        } as usize;
        let mut sample_flags = if flags & TRUN_FLAGS != 0 {
            fields.u32()?
        } else {
            defaults.flags
        };
        if i == 0 {
            if let Some(first) = first_flags {
                sample_flags = first;
            }
        }
        let pts_offset = if flags & TRUN_CTS != 0 {
            // version 0 stores an unsigned offset
            let raw = fields.u32()?;
            if version == 0 {
                raw.min(i32::MAX as u32) as i32
            } else {
                raw as i32
            }
        } else {
            0
        };

        let end = pos + size;
        if end > data.len() {
            return Err(Fmp4Error::DataOutOfBounds(track.id));
        }
        track.samples.push(Sample {
            duration,
            pts_offset,
            is_non_sync: sample_flags & SAMPLE_IS_NON_SYNC != 0,
            payload: Bytes::copy_from_slice(&data[pos..end]),
        });
        pos = end;
    }

    Ok(pos)
}
