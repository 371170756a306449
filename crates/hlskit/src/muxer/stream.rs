use std::{collections::HashMap, time::Duration};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use hlskit_fmp4::{
    Init, InitTrack, Part, PartTrack, PART_OVERHEAD, SAMPLE_OVERHEAD, TRACK_OVERHEAD,
};
use hlskit_mpegts::{adts, Writer, CLOCK_RATE, TIMESTAMP_MASK};

use super::{
    playlist::{MediaPlaylistView, SegmentWindow},
    segment::{FinalizedSegment, MuxerPart, MuxerSegment},
    segmenter::{MuxerSample, MuxerTrack, PartDurationAdjuster, SamplePayload},
    MuxerConfig, MuxerVariant, Resource,
};
use crate::{
    clock::{from_nanos, rescale, to_nanos},
    codecs::{av1, h264, h265, Codec},
    error::{HlsError, HlsResult},
    storage::{Storage, StorageReader},
    Track,
};

/// Gap segments published before the first real segment of a LL-HLS stream.
pub(crate) const LOW_LATENCY_GAPS: u64 = 7;

const FIRST_PID: u16 = 0x100;

/// What a stream needs from the muxer while writing.
pub(crate) struct StreamEnv<'a> {
    pub(crate) storage: &'a Storage,
    pub(crate) paths: &'a mut HashMap<String, Resource>,
    /// Nanoseconds subtracted from every timestamp.
    pub(crate) origin: i64,
}

enum Container {
    MpegTs(Writer),
    Fmp4,
}

/// The LL-HLS part being filled, one fragment per track.
struct PendingPart {
    id: u64,
    name: String,
    start_dts: i64,
    independent: Option<bool>,
    tracks: Vec<Option<PartTrack>>,
    /// Serialized size accounted for in the segment.
    reserved: u64,
}

/// A media playlist of the muxer and the segments it lists.
pub(crate) struct MuxerStream {
    pub(crate) index: usize,
    pub(crate) name: String,
    /// Muxer track indexes, in stream order.
    pub(crate) tracks: Vec<usize>,
    variant: MuxerVariant,
    prefix: String,
    container: Container,
    has_video: bool,
    segment_min_duration: Duration,
    segment_max_size: u64,
    segment: Option<MuxerSegment>,
    part: Option<PendingPart>,
    pub(crate) window: SegmentWindow,
    part_duration: PartDurationAdjuster,
    next_segment: u64,
    next_part: u64,
}

impl MuxerStream {
    pub(crate) fn new(
        index: usize,
        name: String,
        tracks: Vec<(usize, &Track)>,
        prefix: String,
        config: &MuxerConfig,
    ) -> HlsResult<Self> {
        let container = match config.variant {
            MuxerVariant::MpegTs => {
                let mut ts_tracks = Vec::with_capacity(tracks.len());
                for (position, (_, track)) in tracks.iter().enumerate() {
                    let codec = track.codec.ts_codec().ok_or_else(|| {
                        HlsError::UnsupportedCodec(format!(
                            "{} can't be muxed into MPEG-TS",
                            track.codec.name()
                        ))
                    })?;
                    ts_tracks.push(hlskit_mpegts::Track {
                        pid: FIRST_PID + position as u16,
                        codec,
                    });
                }
                Container::MpegTs(Writer::new(ts_tracks))
            }
            MuxerVariant::Fmp4 | MuxerVariant::LowLatency => Container::Fmp4,
        };

        let (window, next_segment) = match config.variant {
            MuxerVariant::LowLatency => (
                SegmentWindow::with_gaps(
                    config.segment_count,
                    LOW_LATENCY_GAPS,
                    config.segment_min_duration,
                ),
                LOW_LATENCY_GAPS,
            ),
            _ => (SegmentWindow::new(config.segment_count), 0),
        };

        Ok(Self {
            index,
            name,
            has_video: tracks.iter().any(|(_, t)| t.codec.is_video()),
            tracks: tracks.into_iter().map(|(i, _)| i).collect(),
            variant: config.variant,
            prefix,
            container,
            segment_min_duration: config.segment_min_duration,
            segment_max_size: config.segment_max_size,
            segment: None,
            part: None,
            window,
            part_duration: PartDurationAdjuster::new(config.part_min_duration),
            next_segment,
            next_part: 0,
        })
    }

    pub(crate) fn playlist_name(&self) -> String {
        format!("{}.m3u8", self.name)
    }

    pub(crate) fn init_name(&self) -> Option<String> {
        match self.container {
            Container::MpegTs(_) => None,
            Container::Fmp4 => Some(format!("{}_init.mp4", self.name)),
        }
    }

    pub(crate) fn is_started(&self) -> bool {
        self.segment.is_some()
    }

    /// Opens the first segment at the first random access sample of the
    /// leading track.
    pub(crate) async fn start(
        &mut self,
        env: &mut StreamEnv<'_>,
        dts: i64,
        ntp: DateTime<Utc>,
    ) -> HlsResult<()> {
        log::debug!("stream {} started", self.name);
        self.open_segment(env, dts, ntp).await
    }

    async fn open_segment(
        &mut self,
        env: &mut StreamEnv<'_>,
        dts: i64,
        ntp: DateTime<Utc>,
    ) -> HlsResult<()> {
        let sequence = self.next_segment;
        self.next_segment += 1;

        let extension = match self.container {
            Container::MpegTs(_) => "ts",
            Container::Fmp4 => "mp4",
        };
        let name = format!("{}_{}_seg{}.{}", self.name, self.prefix, sequence, extension);
        let file = env.storage.allocate(&name).await?;
        let mut segment = MuxerSegment::new(
            file,
            sequence,
            name.clone(),
            dts,
            ntp,
            self.segment_max_size,
        );
        env.paths.insert(name, Resource::Segment(self.index, sequence));

        if let Container::MpegTs(writer) = &mut self.container {
            let mut tables = Vec::new();
            writer.write_tables(&mut tables)?;
            segment.append(&tables).await?;
        } else {
            self.open_part(dts);
        }
        self.segment = Some(segment);
        Ok(())
    }

    fn open_part(&mut self, dts: i64) {
        let id = self.next_part;
        self.next_part += 1;
        self.part = Some(PendingPart {
            id,
            name: format!("{}_{}_part{}.mp4", self.name, self.prefix, id),
            start_dts: dts,
            independent: if self.has_video { None } else { Some(true) },
            tracks: vec![None; self.tracks.len()],
            reserved: 0,
        });
    }

    /// Writes a sample whose duration is known. Timestamps are in ticks of
    /// the track clock.
    pub(crate) async fn write_sample(
        &mut self,
        env: &mut StreamEnv<'_>,
        track: &MuxerTrack,
        sample: MuxerSample,
        duration: i64,
    ) -> HlsResult<()> {
        let clock = track.track.clock_rate;
        let origin = from_nanos(env.origin, clock);
        let dts = sample.dts - origin;
        let pts = sample.pts - origin;
        if dts < 0 {
            return Ok(());
        }
        let segment = self.segment.as_mut().ok_or(HlsError::NotStarted)?;

        if track.is_leading {
            segment.leading_samples += 1;
            if self.variant == MuxerVariant::LowLatency {
                let nanos = to_nanos(duration, clock).max(0) as u64;
                self.part_duration.observe(Duration::from_nanos(nanos));
            }
        }

        match &mut self.container {
            Container::MpegTs(writer) => {
                let data = ts_payload(&track.track.codec, sample.payload)?;
                let pid = FIRST_PID + track.position as u16;
                let (pts, dts) = (ts_timestamp(pts, clock), ts_timestamp(dts, clock));
                // continuity counters must not move for a rejected sample
                let size = writer.pes_size(pid, pts, dts, sample.random_access, data.len());
                segment.reserve(size as u64)?;

                let mut packets = Vec::with_capacity(size);
                writer.write_pes(&mut packets, pid, pts, dts, sample.random_access, &data)?;
                segment.write(&packets).await
            }
            Container::Fmp4 => {
                let data = fmp4_payload(&track.track.codec, sample.payload)?;
                let part = self.part.as_mut().ok_or(HlsError::NotStarted)?;
                let slot = part
                    .tracks
                    .get_mut(track.position)
                    .ok_or(HlsError::InvalidTrack(track.position))?;

                // the moof entries count toward the segment size too
                let mut size = data.len() + SAMPLE_OVERHEAD;
                if slot.is_none() {
                    size += TRACK_OVERHEAD;
                }
                if part.reserved == 0 {
                    size += PART_OVERHEAD;
                }
                segment.reserve(size as u64)?;
                part.reserved += size as u64;

                if track.is_leading && part.independent.is_none() {
                    part.independent = Some(sample.random_access);
                }
                let fragment = slot.get_or_insert_with(|| PartTrack {
                    id: track.position as u32 + 1,
                    base_time: dts as u64,
                    samples: Vec::new(),
                });
                fragment.samples.push(hlskit_fmp4::Sample {
                    duration: duration as u32,
                    pts_offset: (pts - dts) as i32,
                    is_non_sync: !sample.random_access,
                    payload: Bytes::from(data),
                });
                Ok(())
            }
        }
    }

    /// Called with the lookahead sample of the leading track, before it is
    /// written. Closes the current segment or part when the sample has to
    /// start a new one.
    pub(crate) async fn advance(
        &mut self,
        env: &mut StreamEnv<'_>,
        track: &MuxerTrack,
        next: &MuxerSample,
    ) -> HlsResult<()> {
        let Some(segment) = &self.segment else {
            return Ok(());
        };
        let dts = to_nanos(next.dts, track.track.clock_rate) - env.origin;
        let min_duration = self.segment_min_duration.as_nanos() as i64;

        if next.random_access && (next.params_changed || dts - segment.start_dts >= min_duration) {
            if next.params_changed {
                log::info!("stream {}: parameters changed", self.name);
                self.part_duration.reset();
            } else {
                self.part_duration.stop_learning();
            }
            return self.rotate_segment(env, dts, next.ntp).await;
        }

        if self.variant == MuxerVariant::LowLatency {
            if let Some(part) = &self.part {
                let target = self.part_duration.current().as_nanos() as i64;
                if dts - part.start_dts >= target {
                    self.flush_part(env, dts).await?;
                    self.open_part(dts);
                }
            }
        }
        Ok(())
    }

    async fn flush_part(&mut self, env: &mut StreamEnv<'_>, end_dts: i64) -> HlsResult<()> {
        let Some(part) = self.part.take() else {
            return Ok(());
        };
        let segment = self.segment.as_mut().ok_or(HlsError::NotStarted)?;

        let data = Part {
            sequence_number: part.id as u32 + 1,
            tracks: part.tracks.into_iter().flatten().collect(),
        }
        .marshal();
        segment.reserve((data.len() as u64).saturating_sub(part.reserved))?;
        segment.write(&data).await?;

        let muxer_part = MuxerPart {
            id: part.id,
            name: part.name,
            duration: Duration::from_nanos((end_dts - part.start_dts).max(0) as u64),
            independent: part.independent.unwrap_or(false),
            index: segment.parts.len(),
        };
        if self.variant == MuxerVariant::LowLatency {
            env.paths
                .insert(muxer_part.name.clone(), Resource::Part(self.index, part.id));
        }
        segment.finish_part(muxer_part).await
    }

    async fn rotate_segment(
        &mut self,
        env: &mut StreamEnv<'_>,
        end_dts: i64,
        ntp: DateTime<Utc>,
    ) -> HlsResult<()> {
        self.flush_part(env, end_dts).await?;
        let Some(segment) = self.segment.take() else {
            return Ok(());
        };
        let finalized = segment.finalize(end_dts).await?;
        tracing::debug!(
            stream = %self.name,
            sequence = finalized.sequence,
            duration = ?finalized.duration,
            size = finalized.size,
            "segment complete"
        );

        for evicted in self.window.push(finalized) {
            forget(env.paths, &evicted);
            evicted.remove().await?;
        }
        self.open_segment(env, end_dts, ntp).await
    }

    /// Removes every segment, on close.
    pub(crate) async fn clear(&mut self, paths: &mut HashMap<String, Resource>) -> HlsResult<()> {
        self.part = None;
        if let Some(segment) = self.segment.take() {
            paths.remove(&segment.name);
            let end = segment.start_dts;
            segment.finalize(end).await?.remove().await?;
        }
        for segment in self.window.drain() {
            forget(paths, &segment);
            segment.remove().await?;
        }
        Ok(())
    }

    /// The initialization section, once the parameters of every track are
    /// known.
    pub(crate) fn init(&self, tracks: &[MuxerTrack]) -> HlsResult<Option<Vec<u8>>> {
        let mut init = Init::default();
        for (position, index) in self.tracks.iter().enumerate() {
            let track = &tracks[*index].track;
            if !track.codec.is_ready() {
                return Ok(None);
            }
            let id = position as u32 + 1;
            init.tracks.push(InitTrack {
                id,
                time_scale: track.clock_rate,
                sample_entry: track.codec.sample_entry(id)?,
            });
        }
        Ok(Some(init.marshal()))
    }

    /// Sequence number of the segment being written and its finished parts.
    pub(crate) fn pending(&self) -> Option<(u64, &[MuxerPart])> {
        self.segment
            .as_ref()
            .map(|segment| (segment.sequence, segment.parts.as_slice()))
    }

    /// Whether `name` is the part announced by the preload hint.
    pub(crate) fn is_preload_hint(&self, name: &str) -> bool {
        self.variant == MuxerVariant::LowLatency
            && self.part.as_ref().is_some_and(|part| part.name == name)
    }

    pub(crate) fn segment_reader(&self, sequence: u64) -> Option<StorageReader> {
        self.window.segment(sequence).map(FinalizedSegment::reader)
    }

    pub(crate) fn part_reader(&self, id: u64) -> Option<StorageReader> {
        if let Some((segment, part)) = self.window.find_part(id) {
            return segment.part_reader(part.index);
        }
        let segment = self.segment.as_ref()?;
        let part = segment.parts.iter().find(|p| p.id == id)?;
        segment.part_reader(part.index)
    }

    pub(crate) fn playlist_view(&self) -> MediaPlaylistView<'_> {
        let pending = self.segment.as_ref();
        let pending_parts = pending.map_or(&[][..], |s| s.parts.as_slice());
        let part_target = self
            .window
            .parts()
            .chain(pending_parts)
            .map(|p| p.duration)
            .fold(self.part_duration.current(), Duration::max);

        MediaPlaylistView {
            variant: self.variant,
            window: &self.window,
            init: self.init_name(),
            pending_ntp: pending.map(|s| s.ntp),
            pending_parts,
            preload_hint: self.part.as_ref().map(|p| p.name.as_str()),
            part_target,
        }
    }
}

fn forget(paths: &mut HashMap<String, Resource>, segment: &FinalizedSegment) {
    paths.remove(&segment.name);
    for part in &segment.parts {
        paths.remove(&part.name);
    }
}

fn ts_timestamp(ticks: i64, clock_rate: u32) -> u64 {
    rescale(ticks, clock_rate, CLOCK_RATE) as u64 & TIMESTAMP_MASK
}

fn payload_mismatch(codec: &Codec) -> HlsError {
    HlsError::codec(codec.name(), "unexpected payload")
}

fn ts_payload(codec: &Codec, payload: SamplePayload) -> HlsResult<Vec<u8>> {
    match (codec, payload) {
        (Codec::H264 { sps, pps }, SamplePayload::Units(au)) => {
            Ok(h264::join_annexb(&h264::with_params(&au, sps, pps)))
        }
        (Codec::Mpeg4Audio(config), SamplePayload::Frame(au)) => {
            Ok(adts::encode(&[config.to_adts(au.to_vec())?])?)
        }
        (Codec::Mpeg1Audio | Codec::Klv, SamplePayload::Frame(frame)) => Ok(frame.to_vec()),
        (Codec::H264 { .. } | Codec::Mpeg4Audio(_) | Codec::Mpeg1Audio | Codec::Klv, _) => {
            Err(payload_mismatch(codec))
        }
        _ => Err(HlsError::UnsupportedCodec(codec.name().to_string())),
    }
}

fn fmp4_payload(codec: &Codec, payload: SamplePayload) -> HlsResult<Vec<u8>> {
    match (codec, payload) {
        (Codec::H264 { .. }, SamplePayload::Units(au)) => {
            Ok(h264::join_avcc(&h264::strip_params(&au)))
        }
        (Codec::H265 { .. }, SamplePayload::Units(au)) => {
            Ok(h264::join_avcc(&h265::strip_params(&au)))
        }
        (Codec::Av1 { .. }, SamplePayload::Units(obus)) => Ok(av1::join_temporal_unit(&obus)),
        (
            Codec::Vp9(_) | Codec::Opus { .. } | Codec::Mpeg4Audio(_) | Codec::Mpeg1Audio,
            SamplePayload::Frame(frame),
        ) => Ok(frame.to_vec()),
        (Codec::Klv, _) => Err(HlsError::UnsupportedCodec(
            "KLV can't be muxed into fMP4".to_string(),
        )),
        _ => Err(payload_mismatch(codec)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codecs::AudioSpecificConfig;

    fn aac() -> Codec {
        Codec::Mpeg4Audio(AudioSpecificConfig {
            object_type: 2,
            sample_rate: 48000,
            channel_count: 2,
        })
    }

    #[test]
    fn test_ts_timestamp() {
        assert_eq!(ts_timestamp(48000, 48000), 90000);
        assert_eq!(ts_timestamp(-1, 90000), TIMESTAMP_MASK);
    }

    #[test]
    fn test_payloads() -> anyhow::Result<()> {
        let adts = ts_payload(&aac(), SamplePayload::Frame(Bytes::from_static(&[1, 2, 3])))?;
        assert_eq!(adts.len(), 10);
        assert_eq!(&adts[..2], &[0xff, 0xf1]);

        let au = vec![Bytes::from_static(&[0x65, 0x88])];
        let avcc = fmp4_payload(
            &Codec::H264 {
                sps: Bytes::new(),
                pps: Bytes::new(),
            },
            SamplePayload::Units(au),
        )?;
        assert_eq!(avcc, vec![0, 0, 0, 2, 0x65, 0x88]);

        assert!(fmp4_payload(&Codec::Klv, SamplePayload::Frame(Bytes::new())).is_err());
        assert!(ts_payload(&Codec::Opus { channel_count: 2 }, SamplePayload::Frame(Bytes::new()))
            .is_err());
        Ok(())
    }
}
