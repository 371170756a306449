//! HLS muxer.
//!
//! Encoded samples are cut into MPEG-TS, fMP4 or Low-Latency HLS segments,
//! kept in a sliding window and served over HTTP by [`Muxer::handle`] or the
//! axum router returned by [`Muxer::router`].

mod playlist;
mod segment;
mod segmenter;
mod server;
mod stream;

use std::{collections::HashMap, path::PathBuf, sync::Arc, time::Duration};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, Notify};

pub use self::server::MuxerHttpError;
use self::{
    segmenter::{MuxerSample, MuxerTrack},
    server::{Resource, MULTIVARIANT_PLAYLIST},
    stream::{MuxerStream, StreamEnv},
};
use crate::{
    clock::{rescale, to_nanos},
    codecs::{mpeg1audio::FrameHeader, mpeg4audio::SAMPLES_PER_ACCESS_UNIT, opus, Codec},
    error::{HlsError, HlsResult},
    storage::Storage,
    Track,
};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MuxerVariant {
    MpegTs,
    Fmp4,
    #[default]
    LowLatency,
}

impl MuxerVariant {
    fn min_segment_count(&self) -> usize {
        match self {
            MuxerVariant::LowLatency => 7,
            MuxerVariant::MpegTs | MuxerVariant::Fmp4 => 3,
        }
    }
}

/// Tunables of the muxer. Durations are (de)serialized as milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MuxerConfig {
    pub variant: MuxerVariant,
    /// Segments listed by each media playlist.
    pub segment_count: usize,
    #[serde(with = "millis")]
    pub segment_min_duration: Duration,
    #[serde(with = "millis")]
    pub part_min_duration: Duration,
    pub segment_max_size: u64,
    /// Segments are kept in RAM when unset.
    pub directory: Option<PathBuf>,
}

impl Default for MuxerConfig {
    fn default() -> Self {
        Self {
            variant: MuxerVariant::LowLatency,
            segment_count: 7,
            segment_min_duration: Duration::from_secs(1),
            part_min_duration: Duration::from_millis(200),
            segment_max_size: 50 * 1024 * 1024,
            directory: None,
        }
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub(super) fn serialize<S>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub(super) fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

pub struct MuxerBuilder {
    tracks: Vec<Track>,
    config: MuxerConfig,
}

impl MuxerBuilder {
    pub fn new() -> Self {
        Self {
            tracks: Vec::new(),
            config: MuxerConfig::default(),
        }
    }

    /// Adds a track. Tracks are referred to by their position when writing.
    pub fn track(mut self, track: Track) -> Self {
        self.tracks.push(track);
        self
    }

    pub fn config(mut self, config: MuxerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn variant(mut self, variant: MuxerVariant) -> Self {
        self.config.variant = variant;
        self
    }

    pub fn segment_count(mut self, count: usize) -> Self {
        self.config.segment_count = count;
        self
    }

    pub fn segment_min_duration(mut self, duration: Duration) -> Self {
        self.config.segment_min_duration = duration;
        self
    }

    pub fn part_min_duration(mut self, duration: Duration) -> Self {
        self.config.part_min_duration = duration;
        self
    }

    pub fn segment_max_size(mut self, size: u64) -> Self {
        self.config.segment_max_size = size;
        self
    }

    /// Stores segments under `directory` instead of RAM.
    pub fn directory(mut self, directory: impl Into<PathBuf>) -> Self {
        self.config.directory = Some(directory.into());
        self
    }

    pub fn build(self) -> Muxer {
        Muxer {
            inner: Arc::new(MuxerInner {
                config: self.config,
                tracks: self.tracks,
                state: Mutex::new(None),
                notify: Notify::new(),
            }),
        }
    }
}

impl Default for MuxerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

struct MuxerInner {
    config: MuxerConfig,
    tracks: Vec<Track>,
    state: Mutex<Option<MuxerState>>,
    notify: Notify,
}

pub(crate) struct MuxerState {
    variant: MuxerVariant,
    tracks: Vec<MuxerTrack>,
    streams: Vec<MuxerStream>,
    storage: Storage,
    paths: HashMap<String, Resource>,
    /// DTS of the first sample of the main stream, in nanoseconds.
    origin: Option<i64>,
    closed: bool,
}

impl MuxerState {
    fn new(config: &MuxerConfig, tracks: &[Track]) -> HlsResult<Self> {
        let prefix = hex::encode(rand::random::<[u8; 4]>());
        let leading = tracks.iter().position(|t| t.codec.is_video()).unwrap_or(0);

        // stream index, position inside the stream, leading flag
        let layout: Vec<(usize, usize, bool)> = match config.variant {
            MuxerVariant::MpegTs => (0..tracks.len()).map(|i| (0, i, i == leading)).collect(),
            MuxerVariant::Fmp4 | MuxerVariant::LowLatency => {
                let mut next_rendition = 1;
                (0..tracks.len())
                    .map(|i| {
                        if i == leading {
                            (0, 0, true)
                        } else {
                            next_rendition += 1;
                            (next_rendition - 1, 0, true)
                        }
                    })
                    .collect()
            }
        };
        let stream_count = layout.iter().map(|(s, _, _)| s + 1).max().unwrap_or(0);

        let mut streams = Vec::with_capacity(stream_count);
        for index in 0..stream_count {
            let mut members: Vec<(usize, usize)> = layout
                .iter()
                .enumerate()
                .filter(|(_, (stream, _, _))| *stream == index)
                .map(|(track, (_, position, _))| (*position, track))
                .collect();
            members.sort_unstable();
            let name = match index {
                0 => "stream".to_string(),
                i => format!("rendition{i}"),
            };
            streams.push(MuxerStream::new(
                index,
                name,
                members.into_iter().map(|(_, t)| (t, &tracks[t])).collect(),
                prefix.clone(),
                config,
            )?);
        }

        let mut paths = HashMap::new();
        paths.insert(MULTIVARIANT_PLAYLIST.to_string(), Resource::MultivariantPlaylist);
        for stream in &streams {
            paths.insert(stream.playlist_name(), Resource::MediaPlaylist(stream.index));
            if let Some(init) = stream.init_name() {
                paths.insert(init, Resource::Init(stream.index));
            }
        }

        let storage = match &config.directory {
            Some(directory) => Storage::disk(directory),
            None => Storage::memory(),
        };

        Ok(Self {
            variant: config.variant,
            tracks: layout
                .into_iter()
                .zip(tracks)
                .map(|((stream, position, is_leading), track)| {
                    MuxerTrack::new(track.clone(), stream, position, is_leading)
                })
                .collect(),
            streams,
            storage,
            paths,
            origin: None,
            closed: false,
        })
    }

    async fn write_sample(&mut self, index: usize, sample: MuxerSample) -> HlsResult<()> {
        let MuxerState {
            tracks,
            streams,
            storage,
            paths,
            origin,
            ..
        } = self;
        let track = tracks.get_mut(index).ok_or(HlsError::InvalidTrack(index))?;
        let stream = streams
            .get_mut(track.stream)
            .ok_or(HlsError::InvalidTrack(index))?;
        let dts = to_nanos(sample.dts, track.track.clock_rate);

        if !stream.is_started() {
            if !track.is_leading || !sample.random_access {
                return Ok(());
            }
            // renditions start once the main stream has
            let base = match (*origin, track.stream) {
                (Some(base), _) => base,
                (None, 0) => *origin.insert(dts),
                (None, _) => return Ok(()),
            };
            if dts < base {
                return Ok(());
            }
            let mut env = StreamEnv {
                storage: &*storage,
                paths: &mut *paths,
                origin: base,
            };
            stream.start(&mut env, dts - base, sample.ntp).await?;
        }

        let Some(base) = *origin else {
            return Ok(());
        };
        let mut env = StreamEnv {
            storage: &*storage,
            paths: &mut *paths,
            origin: base,
        };
        if let Some((prev, duration)) = track.push(sample) {
            stream.write_sample(&mut env, track, prev, duration).await?;
            if track.is_leading {
                if let Some(next) = track.lookahead() {
                    stream.advance(&mut env, track, next).await?;
                }
            }
        }
        Ok(())
    }
}

/// A HLS muxer. Cloning gives another handle to the same muxer.
#[derive(Clone)]
pub struct Muxer {
    inner: Arc<MuxerInner>,
}

impl Muxer {
    /// Validates the configuration and the tracks and starts accepting
    /// samples.
    pub async fn start(&self) -> HlsResult<()> {
        let config = &self.inner.config;
        let tracks = &self.inner.tracks;

        if tracks.is_empty() {
            return Err(HlsError::InvalidConfig("at least one track is needed".to_string()));
        }
        let min_count = config.variant.min_segment_count();
        if config.segment_count < min_count {
            return Err(HlsError::InvalidConfig(format!(
                "the minimum segment count is {min_count}"
            )));
        }
        match config.variant {
            MuxerVariant::MpegTs => {
                if let Some(track) = tracks.iter().find(|t| t.codec.ts_codec().is_none()) {
                    return Err(HlsError::UnsupportedCodec(format!(
                        "{} can't be used with MPEG-TS",
                        track.codec.name()
                    )));
                }
            }
            MuxerVariant::Fmp4 | MuxerVariant::LowLatency => {
                if tracks.iter().any(|t| t.codec == Codec::Klv) {
                    return Err(HlsError::UnsupportedCodec(
                        "KLV can only be used with MPEG-TS".to_string(),
                    ));
                }
                if tracks.iter().filter(|t| t.codec.is_video()).count() > 1 {
                    return Err(HlsError::InvalidConfig(
                        "only one video track is supported".to_string(),
                    ));
                }
            }
        }

        let mut state = self.inner.state.lock().await;
        if state.is_some() {
            return Err(HlsError::InvalidConfig("muxer is already started".to_string()));
        }
        *state = Some(MuxerState::new(config, tracks)?);
        log::info!(
            "muxer started: {:?}, {} tracks",
            config.variant,
            tracks.len()
        );
        Ok(())
    }

    /// Prepares samples of track `index` and writes them, waking every
    /// pending request afterwards.
    async fn write<F>(&self, index: usize, matches: fn(&Codec) -> bool, prepare: F) -> HlsResult<()>
    where
        F: FnOnce(&mut MuxerTrack) -> HlsResult<Vec<MuxerSample>>,
    {
        let mut guard = self.inner.state.lock().await;
        let state = guard.as_mut().ok_or(HlsError::NotStarted)?;
        if state.closed {
            return Err(HlsError::Terminated);
        }
        let track = state
            .tracks
            .get_mut(index)
            .filter(|t| matches(&t.track.codec))
            .ok_or(HlsError::InvalidTrack(index))?;

        let samples = prepare(track)?;
        for sample in samples {
            state.write_sample(index, sample).await?;
        }
        drop(guard);
        self.inner.notify.notify_waiters();
        Ok(())
    }

    pub async fn write_av1(
        &self,
        track: usize,
        ntp: DateTime<Utc>,
        pts: i64,
        obus: Vec<Bytes>,
    ) -> HlsResult<()> {
        self.write(track, |c| matches!(c, Codec::Av1 { .. }), |t| {
            Ok(t.prepare_av1(ntp, pts, obus)?.into_iter().collect())
        })
        .await
    }

    pub async fn write_vp9(
        &self,
        track: usize,
        ntp: DateTime<Utc>,
        pts: i64,
        frame: Bytes,
    ) -> HlsResult<()> {
        self.write(track, |c| matches!(c, Codec::Vp9(_)), |t| {
            Ok(t.prepare_vp9(ntp, pts, frame)?.into_iter().collect())
        })
        .await
    }

    /// Writes an access unit made of NAL units without start codes.
    pub async fn write_h264(
        &self,
        track: usize,
        ntp: DateTime<Utc>,
        pts: i64,
        au: Vec<Bytes>,
    ) -> HlsResult<()> {
        self.write(track, |c| matches!(c, Codec::H264 { .. }), |t| {
            Ok(t.prepare_h26x(ntp, pts, au)?.into_iter().collect())
        })
        .await
    }

    pub async fn write_h265(
        &self,
        track: usize,
        ntp: DateTime<Utc>,
        pts: i64,
        au: Vec<Bytes>,
    ) -> HlsResult<()> {
        self.write(track, |c| matches!(c, Codec::H265 { .. }), |t| {
            Ok(t.prepare_h26x(ntp, pts, au)?.into_iter().collect())
        })
        .await
    }

    /// Writes consecutive Opus packets starting at `pts`.
    pub async fn write_opus(
        &self,
        track: usize,
        ntp: DateTime<Utc>,
        pts: i64,
        packets: Vec<Bytes>,
    ) -> HlsResult<()> {
        self.write(track, |c| matches!(c, Codec::Opus { .. }), |t| {
            let mut samples = Vec::with_capacity(packets.len());
            let mut offset = 0;
            for packet in packets {
                let duration = opus::packet_duration(&packet)? as i64;
                samples.push(frame_sample(t, ntp, pts, offset, packet));
                offset += duration;
            }
            Ok(samples)
        })
        .await
    }

    /// Writes consecutive MPEG-4 audio access units starting at `pts`.
    pub async fn write_mpeg4audio(
        &self,
        track: usize,
        ntp: DateTime<Utc>,
        pts: i64,
        aus: Vec<Bytes>,
    ) -> HlsResult<()> {
        self.write(track, |c| matches!(c, Codec::Mpeg4Audio(_)), |t| {
            Ok(aus
                .into_iter()
                .enumerate()
                .map(|(i, au)| {
                    let offset = i as i64 * SAMPLES_PER_ACCESS_UNIT as i64;
                    frame_sample(t, ntp, pts, offset, au)
                })
                .collect())
        })
        .await
    }

    /// Writes consecutive MPEG-1 audio frames starting at `pts`.
    pub async fn write_mpeg1audio(
        &self,
        track: usize,
        ntp: DateTime<Utc>,
        pts: i64,
        frames: Vec<Bytes>,
    ) -> HlsResult<()> {
        self.write(track, |c| matches!(c, Codec::Mpeg1Audio), |t| {
            let mut samples = Vec::with_capacity(frames.len());
            let mut offset = 0;
            for frame in frames {
                let header = FrameHeader::parse(&frame)?;
                let duration = rescale(
                    header.sample_count() as i64,
                    header.sample_rate,
                    t.track.clock_rate,
                );
                samples.push(frame_sample(t, ntp, pts, offset, frame));
                offset += duration;
            }
            Ok(samples)
        })
        .await
    }

    pub async fn write_klv(
        &self,
        track: usize,
        ntp: DateTime<Utc>,
        pts: i64,
        unit: Bytes,
    ) -> HlsResult<()> {
        self.write(track, |c| matches!(c, Codec::Klv), |t| {
            Ok(vec![t.prepare_frame(ntp, pts, unit)])
        })
        .await
    }

    /// Stops the muxer, removes every segment and answers pending requests
    /// with 404.
    pub async fn close(&self) {
        let mut guard = self.inner.state.lock().await;
        if let Some(state) = guard.as_mut() {
            state.closed = true;
            for stream in &mut state.streams {
                if let Err(err) = stream.clear(&mut state.paths).await {
                    log::warn!("failed to remove segments of {}: {err}", stream.name);
                }
            }
        }
        drop(guard);
        self.inner.notify.notify_waiters();
        log::info!("muxer closed");
    }
}

/// A frame `offset` ticks after `pts`, its wall clock time shifted alike.
fn frame_sample(
    track: &MuxerTrack,
    ntp: DateTime<Utc>,
    pts: i64,
    offset: i64,
    frame: Bytes,
) -> MuxerSample {
    let ntp = ntp + chrono::Duration::nanoseconds(to_nanos(offset, track.track.clock_rate));
    track.prepare_frame(ntp, pts + offset, frame)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_serde() -> anyhow::Result<()> {
        let config: MuxerConfig = serde_json::from_str(
            r#"{"variant": "mpeg-ts", "segment_min_duration": 2000, "directory": "/tmp/hls"}"#,
        )?;
        assert_eq!(config.variant, MuxerVariant::MpegTs);
        assert_eq!(config.segment_min_duration, Duration::from_secs(2));
        assert_eq!(config.part_min_duration, Duration::from_millis(200));
        assert_eq!(config.segment_count, 7);
        assert_eq!(config.directory, Some(PathBuf::from("/tmp/hls")));

        let json = serde_json::to_value(MuxerConfig::default())?;
        assert_eq!(json["variant"], "low-latency");
        assert_eq!(json["part_min_duration"], 200);
        Ok(())
    }

    #[tokio::test]
    async fn test_write_before_start() {
        let muxer = MuxerBuilder::new()
            .track(Track::new(Codec::Klv))
            .variant(MuxerVariant::MpegTs)
            .build();
        let err = muxer
            .write_klv(0, Utc::now(), 0, Bytes::from_static(&[1]))
            .await
            .unwrap_err();
        assert!(matches!(err, HlsError::NotStarted));
    }

    #[tokio::test]
    async fn test_stream_layout() -> anyhow::Result<()> {
        let aac = Codec::Mpeg4Audio(crate::codecs::AudioSpecificConfig {
            object_type: 2,
            sample_rate: 44100,
            channel_count: 2,
        });
        let config = MuxerConfig::default();
        let tracks = vec![
            Track::new(aac.clone()),
            Track::new(Codec::H264 {
                sps: Bytes::from_static(&crate::codecs::h264::tests::SPS),
                pps: Bytes::from_static(&crate::codecs::h264::tests::PPS),
            }),
            Track::new(aac),
        ];
        let state = MuxerState::new(&config, &tracks)?;
        let layout: Vec<_> = state
            .tracks
            .iter()
            .map(|t| (t.stream, t.position, t.is_leading))
            .collect();
        assert_eq!(layout, vec![(1, 0, true), (0, 0, true), (2, 0, true)]);
        assert_eq!(state.streams[0].name, "stream");
        assert_eq!(state.streams[2].name, "rendition2");
        assert!(state.paths.contains_key("rendition1_init.mp4"));
        assert!(state.paths.contains_key("index.m3u8"));
        Ok(())
    }
}
