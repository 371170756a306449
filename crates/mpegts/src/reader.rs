use std::collections::HashMap;
use std::io::{self, Cursor, Read};
use std::sync::{Arc, Mutex};

use mpeg2ts::ts::{ReadTsPacket, TsPacketReader, TsPayload};

use crate::{Codec, Track, TsError, TsResult};

/// A reassembled PES packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pes {
    pub pid: u16,
    pub pts: Option<u64>,
    pub dts: Option<u64>,
    /// Random access indicator of the packet carrying the PES start.
    pub random_access: bool,
    pub data: Vec<u8>,
}

impl Pes {
    /// DTS, falling back to PTS when the stream omits it.
    pub fn decode_time(&self) -> Option<u64> {
        self.dts.or(self.pts)
    }
}

/// The buffer the packet reader pulls from, swapped for every segment.
#[derive(Clone, Default)]
struct SegmentInput(Arc<Mutex<Cursor<Vec<u8>>>>);

impl SegmentInput {
    fn replace(&self, data: Vec<u8>) -> io::Result<()> {
        let mut cursor = self
            .0
            .lock()
            .map_err(|_| io::Error::other("segment input lock poisoned"))?;
        *cursor = Cursor::new(data);
        Ok(())
    }
}

impl Read for SegmentInput {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.0
            .lock()
            .map_err(|_| io::Error::other("segment input lock poisoned"))?
            .read(buf)
    }
}

/// Demuxes the consecutive segments of one stream.
///
/// The PID table learnt from PAT and PMT outlives the segment carrying them,
/// so following segments may omit the tables.
pub struct Demuxer {
    input: SegmentInput,
    reader: TsPacketReader<SegmentInput>,
    tracks: Option<Vec<Track>>,
}

impl Default for Demuxer {
    fn default() -> Self {
        Self::new()
    }
}

impl Demuxer {
    pub fn new() -> Self {
        let input = SegmentInput::default();
        Self {
            reader: TsPacketReader::new(input.clone()),
            input,
            tracks: None,
        }
    }

    /// Elementary streams of the first PMT seen so far.
    pub fn tracks(&self) -> Option<&[Track]> {
        self.tracks.as_deref()
    }

    /// Demuxes a whole segment into PES packets, ordered by the position of
    /// their first TS packet. A PES never continues into the next segment.
    pub fn demux(&mut self, data: Vec<u8>) -> TsResult<Vec<Pes>> {
        self.input.replace(data)?;
        let mut output: Vec<Pes> = Vec::new();
        let mut open = HashMap::new();

        while let Some(packet) = self.reader.read_ts_packet()? {
            let pid = packet.header.pid.as_u16();
            let random_access = packet
                .adaptation_field
                .as_ref()
                .is_some_and(|a| a.random_access_indicator);

            match packet.payload {
                Some(TsPayload::Pmt(pmt)) => {
                    if self.tracks.is_none() {
                        self.tracks = Some(
                            pmt.es_info
                                .iter()
                                .map(|es| Track {
                                    pid: es.elementary_pid.as_u16(),
                                    codec: Codec::from_stream_type(es.stream_type as u8),
                                })
                                .collect(),
                        );
                    }
                }
                Some(TsPayload::Pes(pes)) => {
                    open.insert(pid, output.len());
                    output.push(Pes {
                        pid,
                        pts: pes.header.pts.map(|t| t.as_u64()),
                        dts: pes.header.dts.map(|t| t.as_u64()),
                        random_access,
                        data: pes.data.to_vec(),
                    });
                }
                Some(TsPayload::Raw(bytes)) => {
                    if let Some(&index) = open.get(&pid) {
                        output[index].data.extend_from_slice(&bytes);
                    } else {
                        log::trace!("dropping continuation packet of PID {pid} without PES start");
                    }
                }
                _ => {}
            }
        }

        if self.tracks.is_none() {
            return Err(TsError::PmtNotFound);
        }
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Writer;

    fn h264_track() -> Track {
        Track {
            pid: 0x100,
            codec: Codec::H264,
        }
    }

    #[test]
    fn test_segment_without_tables() -> TsResult<()> {
        let mut writer = Writer::new(vec![h264_track()]);
        let mut first = Vec::new();
        writer.write_tables(&mut first)?;
        writer.write_pes(&mut first, 0x100, 0, 0, true, &[0, 0, 0, 1, 0x65, 1])?;
        let mut second = Vec::new();
        writer.write_pes(&mut second, 0x100, 3000, 3000, false, &[0, 0, 0, 1, 0x41, 2])?;

        let mut demuxer = Demuxer::new();
        assert!(demuxer.tracks().is_none());
        let pes = demuxer.demux(first)?;
        assert_eq!(pes.len(), 1);
        assert_eq!(demuxer.tracks(), Some(&[h264_track()][..]));

        let pes = demuxer.demux(second)?;
        assert_eq!(pes.len(), 1);
        assert_eq!(pes[0].pts, Some(3000));
        assert_eq!(pes[0].data, vec![0, 0, 0, 1, 0x41, 2]);
        Ok(())
    }

    #[test]
    fn test_first_segment_without_pmt() -> TsResult<()> {
        let mut writer = Writer::new(vec![h264_track()]);
        let mut data = Vec::new();
        writer.write_pes(&mut data, 0x100, 0, 0, true, &[1])?;

        let res = Demuxer::new().demux(data);
        assert!(res.is_err());
        Ok(())
    }
}
