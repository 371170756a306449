use std::collections::HashMap;
use std::io::Write;

use mpeg2ts::es::{StreamId, StreamType};
use mpeg2ts::pes::PesHeader;
use mpeg2ts::time::{ClockReference, Timestamp};
use mpeg2ts::ts::payload::{Bytes, Pat, Pes, Pmt};
use mpeg2ts::ts::{
    AdaptationField, ContinuityCounter, EsInfo, Pid, ProgramAssociation,
    TransportScramblingControl, TsHeader, TsPacket, TsPacketWriter, TsPayload, VersionNumber,
    WriteTsPacket,
};

use crate::{Codec, Track, TsError, TsResult, TIMESTAMP_MASK};

const PAT_PID: u16 = 0;
const PMT_PID: u16 = 0x1000;
const PROGRAM_NUM: u16 = 1;
const TS_PACKET_SIZE: usize = 188;
const PAYLOAD_SIZE: usize = 184;
const PCR_ADAPTATION_SIZE: usize = 8;
const FLAGS_ADAPTATION_SIZE: usize = 2;

/// Writes PAT/PMT tables and packetizes PES payloads, keeping one
/// continuity counter per PID across calls.
pub struct Writer {
    tracks: Vec<Track>,
    pcr_pid: u16,
    counters: HashMap<u16, ContinuityCounter>,
}

impl Writer {
    /// The PCR is carried by the first video track, or by the first track.
    pub fn new(tracks: Vec<Track>) -> Self {
        let pcr_pid = tracks
            .iter()
            .find(|t| t.codec.is_video())
            .or(tracks.first())
            .map_or(0x100, |t| t.pid);

        Self {
            tracks,
            pcr_pid,
            counters: HashMap::new(),
        }
    }

    pub fn write_tables<W: Write>(&mut self, out: W) -> TsResult<()> {
        let mut writer = TsPacketWriter::new(out);

        let pat = Pat {
            transport_stream_id: 1,
            version_number: VersionNumber::new(),
            table: vec![ProgramAssociation {
                program_num: PROGRAM_NUM,
                program_map_pid: Pid::new(PMT_PID)?,
            }],
        };
        self.write_packet(&mut writer, PAT_PID, None, TsPayload::Pat(pat))?;

        let mut es_info = Vec::with_capacity(self.tracks.len());
        for track in &self.tracks {
            es_info.push(EsInfo {
                stream_type: stream_type(track.codec)?,
                elementary_pid: Pid::new(track.pid)?,
                descriptors: Vec::new(),
            });
        }
        let pmt = Pmt {
            program_num: PROGRAM_NUM,
            pcr_pid: Some(Pid::new(self.pcr_pid)?),
            version_number: VersionNumber::new(),
            program_info: Vec::new(),
            es_info,
        };
        self.write_packet(&mut writer, PMT_PID, None, TsPayload::Pmt(pmt))?;

        Ok(())
    }

    /// Writes one PES. `dts` is omitted from the header when equal to `pts`.
    pub fn write_pes<W: Write>(
        &mut self,
        out: W,
        pid: u16,
        pts: u64,
        dts: u64,
        random_access: bool,
        data: &[u8],
    ) -> TsResult<()> {
        let track = *self
            .tracks
            .iter()
            .find(|t| t.pid == pid)
            .ok_or(TsError::UnknownPid(pid))?;
        let mut writer = TsPacketWriter::new(out);

        let pts = pts & TIMESTAMP_MASK;
        let dts = dts & TIMESTAMP_MASK;
        let has_dts = dts != pts;

        let with_pcr = pid == self.pcr_pid;
        let adaptation_field = if with_pcr || random_access {
            Some(AdaptationField {
                discontinuity_indicator: false,
                random_access_indicator: random_access,
                es_priority_indicator: false,
                pcr: if with_pcr {
                    Some(ClockReference::new(dts * 300)?)
                } else {
                    None
                },
                opcr: None,
                splice_countdown: None,
                transport_private_data: Vec::new(),
                extension: None,
            })
        } else {
            None
        };
        let optional_len = if has_dts { 10 } else { 5 };
        let first_len = self
            .first_payload_capacity(pid, has_dts, random_access)
            .min(data.len());
        let packet_len = 3 + optional_len + data.len();
        let pes_packet_len = if track.codec.is_video() || packet_len > u16::MAX as usize {
            0
        } else {
            packet_len as u16
        };

        let pes = Pes {
            header: PesHeader {
                stream_id: StreamId::new(track.codec.stream_id()),
                priority: false,
                data_alignment_indicator: true,
                copyright: false,
                original_or_copy: false,
                pts: Some(Timestamp::new(pts)?),
                dts: if has_dts {
                    Some(Timestamp::new(dts)?)
                } else {
                    None
                },
                escr: None,
            },
            pes_packet_len,
            data: Bytes::new(&data[..first_len])?,
        };
        self.write_packet(&mut writer, pid, adaptation_field, TsPayload::Pes(pes))?;

        for chunk in data[first_len..].chunks(PAYLOAD_SIZE) {
            self.write_packet(&mut writer, pid, None, TsPayload::Raw(Bytes::new(chunk)?))?;
        }

        Ok(())
    }

    /// Bytes [`Self::write_pes`] outputs for the same arguments and a
    /// payload of `len` bytes.
    pub fn pes_size(&self, pid: u16, pts: u64, dts: u64, random_access: bool, len: usize) -> usize {
        let has_dts = pts & TIMESTAMP_MASK != dts & TIMESTAMP_MASK;
        let first_len = self
            .first_payload_capacity(pid, has_dts, random_access)
            .min(len);
        (1 + (len - first_len).div_ceil(PAYLOAD_SIZE)) * TS_PACKET_SIZE
    }

    /// Payload bytes fitting in the packet carrying the PES header.
    fn first_payload_capacity(&self, pid: u16, has_dts: bool, random_access: bool) -> usize {
        let adaptation_size = if pid == self.pcr_pid {
            PCR_ADAPTATION_SIZE
        } else if random_access {
            FLAGS_ADAPTATION_SIZE
        } else {
            0
        };
        let optional_len = if has_dts { 10 } else { 5 };
        PAYLOAD_SIZE - 9 - optional_len - adaptation_size
    }

    fn write_packet<W: Write>(
        &mut self,
        writer: &mut TsPacketWriter<W>,
        pid: u16,
        adaptation_field: Option<AdaptationField>,
        payload: TsPayload,
    ) -> TsResult<()> {
        let counter = self.counters.entry(pid).or_insert_with(ContinuityCounter::new);
        let packet = TsPacket {
            header: TsHeader {
                pid: Pid::new(pid)?,
                transport_scrambling_control: TransportScramblingControl::NotScrambled,
                transport_error_indicator: false,
                transport_priority: false,
                continuity_counter: *counter,
            },
            adaptation_field,
            payload: Some(payload),
        };
        counter.increment();

        writer.write_ts_packet(&packet)?;
        Ok(())
    }
}

fn stream_type(codec: Codec) -> TsResult<StreamType> {
    Ok(match codec {
        Codec::H264 => StreamType::H264,
        Codec::Mpeg4Audio => StreamType::AdtsAac,
        Codec::Mpeg1Audio => StreamType::Mpeg1Audio,
        Codec::Klv => StreamType::Mpeg2PacketizedData,
        Codec::H265 | Codec::Unsupported(_) => {
            return Err(TsError::UnsupportedCodec(codec));
        }
    })
}
