//! Playlist window and playlist rendering.
//!
//! Media playlists are written by hand since LL-HLS tags (parts, preload
//! hints, delta updates) have no typed representation in `m3u8-rs`. The
//! multivariant playlist goes through `m3u8-rs`.

use std::{collections::VecDeque, fmt::Write, time::Duration};

use chrono::SecondsFormat;
use m3u8_rs::{AlternativeMedia, AlternativeMediaType, MasterPlaylist, Resolution, VariantStream};
use url::form_urlencoded;

use super::{
    segment::{FinalizedSegment, MuxerPart},
    segmenter::MuxerTrack,
    stream::MuxerStream,
    MuxerVariant,
};
use crate::error::HlsResult;

/// How many parts past the next one a blocking request may ask for.
const MAX_PART_ADVANCE: u64 = 3;

/// Segments listed with their parts in LL-HLS playlists.
const SEGMENTS_WITH_PARTS: usize = 2;

const GAP_URI: &str = "gap.mp4";
const AUDIO_GROUP: &str = "audio";

pub(crate) enum WindowEntry {
    Gap { sequence: u64, duration: Duration },
    Segment(FinalizedSegment),
}

impl WindowEntry {
    fn sequence(&self) -> u64 {
        match self {
            WindowEntry::Gap { sequence, .. } => *sequence,
            WindowEntry::Segment(segment) => segment.sequence,
        }
    }

    fn duration(&self) -> Duration {
        match self {
            WindowEntry::Gap { duration, .. } => *duration,
            WindowEntry::Segment(segment) => segment.duration,
        }
    }
}

/// The segments currently listed by a media playlist.
pub(crate) struct SegmentWindow {
    entries: VecDeque<WindowEntry>,
    capacity: usize,
}

impl SegmentWindow {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity + 1),
            capacity,
        }
    }

    /// A window starting with `count` gap segments.
    pub(crate) fn with_gaps(capacity: usize, count: u64, duration: Duration) -> Self {
        let mut window = Self::new(capacity);
        window
            .entries
            .extend((0..count).map(|sequence| WindowEntry::Gap { sequence, duration }));
        window
    }

    /// Appends a segment and returns the segments that left the window.
    pub(crate) fn push(&mut self, segment: FinalizedSegment) -> Vec<FinalizedSegment> {
        self.entries.push_back(WindowEntry::Segment(segment));
        let mut evicted = Vec::new();
        while self.entries.len() > self.capacity {
            if let Some(WindowEntry::Segment(segment)) = self.entries.pop_front() {
                evicted.push(segment);
            }
        }
        evicted
    }

    pub(crate) fn drain(&mut self) -> Vec<FinalizedSegment> {
        self.entries
            .drain(..)
            .filter_map(|entry| match entry {
                WindowEntry::Segment(segment) => Some(segment),
                WindowEntry::Gap { .. } => None,
            })
            .collect()
    }

    pub(crate) fn segments(&self) -> impl Iterator<Item = &FinalizedSegment> {
        self.entries.iter().filter_map(|entry| match entry {
            WindowEntry::Segment(segment) => Some(segment),
            WindowEntry::Gap { .. } => None,
        })
    }

    pub(crate) fn has_segments(&self) -> bool {
        self.segments().next().is_some()
    }

    pub(crate) fn segment(&self, sequence: u64) -> Option<&FinalizedSegment> {
        self.segments().find(|s| s.sequence == sequence)
    }

    pub(crate) fn parts(&self) -> impl Iterator<Item = &MuxerPart> {
        self.segments().flat_map(|s| s.parts.iter())
    }

    pub(crate) fn find_part(&self, id: u64) -> Option<(&FinalizedSegment, &MuxerPart)> {
        self.segments()
            .find_map(|s| s.parts.iter().find(|p| p.id == id).map(|p| (s, p)))
    }

    pub(crate) fn first_sequence(&self) -> u64 {
        self.entries.front().map_or(0, WindowEntry::sequence)
    }

    pub(crate) fn target_duration(&self) -> u64 {
        self.entries
            .iter()
            .map(|e| e.duration().as_secs_f64().ceil() as u64)
            .max()
            .unwrap_or(0)
            .max(1)
    }

    /// Peak and average bitrate, in bits per second.
    pub(crate) fn bandwidth(&self) -> (u64, u64) {
        let mut peak = 0;
        let (mut size, mut duration) = (0u64, 0f64);
        for segment in self.segments() {
            let seconds = segment.duration.as_secs_f64();
            if seconds > 0.0 {
                peak = peak.max((segment.size as f64 * 8.0 / seconds) as u64);
            }
            size += segment.size;
            duration += seconds;
        }
        let average = if duration > 0.0 {
            (size as f64 * 8.0 / duration) as u64
        } else {
            0
        };
        (peak, average)
    }

    /// Frame rate of the leading track in the last segment.
    pub(crate) fn frame_rate(&self) -> Option<f64> {
        let last = self.segments().last()?;
        let seconds = last.duration.as_secs_f64();
        (seconds > 0.0).then(|| last.leading_samples as f64 / seconds)
    }
}

/// Query parameters of a media playlist request.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PlaylistRequest {
    pub(crate) msn: Option<u64>,
    pub(crate) part: Option<u64>,
    pub(crate) skip: bool,
}

impl PlaylistRequest {
    pub(crate) fn parse(query: Option<&str>) -> Result<Self, String> {
        let mut request = Self::default();
        let Some(query) = query else {
            return Ok(request);
        };

        for (key, value) in form_urlencoded::parse(query.as_bytes()) {
            match key.as_ref() {
                "_HLS_msn" => request.msn = Some(parse_number(&key, &value)?),
                "_HLS_part" => request.part = Some(parse_number(&key, &value)?),
                "_HLS_skip" => match value.as_ref() {
                    "YES" | "v2" => request.skip = true,
                    _ => return Err(format!("invalid _HLS_skip: {value}")),
                },
                _ => {}
            }
        }

        if request.part.is_some() && request.msn.is_none() {
            return Err("_HLS_part requires _HLS_msn".to_string());
        }
        Ok(request)
    }
}

fn parse_number(key: &str, value: &str) -> Result<u64, String> {
    value.parse().map_err(|_| format!("invalid {key}: {value}"))
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Availability {
    Ready,
    Wait,
}

/// Decides whether a playlist request can be answered now. `pending` is the
/// sequence number of the segment being written and its finished parts.
pub(crate) fn availability(
    request: &PlaylistRequest,
    window: &SegmentWindow,
    pending: Option<(u64, &[MuxerPart])>,
) -> Result<Availability, String> {
    let (Some((next, pending_parts)), true) = (pending, window.has_segments()) else {
        return Ok(Availability::Wait);
    };
    let Some(msn) = request.msn else {
        return Ok(Availability::Ready);
    };

    if msn > next + 1 {
        return Err(format!("_HLS_msn {msn} is too far in the future"));
    }
    if let Some(part) = request.part {
        let advance = if msn == next {
            part.saturating_sub(pending_parts.len() as u64)
        } else if msn == next + 1 {
            part + 1
        } else {
            0
        };
        if advance > MAX_PART_ADVANCE {
            return Err(format!("_HLS_part {part} is too far in the future"));
        }
    }

    let (mut msn, mut part) = (msn, request.part);
    if let (Some(p), Some(segment)) = (part, window.segment(msn)) {
        // the last part of a segment is followed by the first of the next
        if p >= segment.parts.len() as u64 {
            msn += 1;
            part = Some(0);
        }
    }

    let ready = if msn < next {
        true
    } else if msn == next {
        part.is_some_and(|p| p < pending_parts.len() as u64)
    } else {
        false
    };
    Ok(if ready {
        Availability::Ready
    } else {
        Availability::Wait
    })
}

pub(crate) fn version(variant: MuxerVariant) -> usize {
    match variant {
        MuxerVariant::MpegTs => 3,
        MuxerVariant::Fmp4 => 7,
        MuxerVariant::LowLatency => 9,
    }
}

/// Formats a duration in seconds with up to five decimals.
fn seconds(duration: Duration) -> String {
    let text = format!("{:.5}", duration.as_secs_f64());
    text.trim_end_matches('0').trim_end_matches('.').to_string()
}

/// Everything a media playlist shows.
pub(crate) struct MediaPlaylistView<'a> {
    pub(crate) variant: MuxerVariant,
    pub(crate) window: &'a SegmentWindow,
    pub(crate) init: Option<String>,
    pub(crate) pending_ntp: Option<chrono::DateTime<chrono::Utc>>,
    pub(crate) pending_parts: &'a [MuxerPart],
    pub(crate) preload_hint: Option<&'a str>,
    pub(crate) part_target: Duration,
}

impl MediaPlaylistView<'_> {
    pub(crate) fn render(&self, skip: bool) -> String {
        let low_latency = self.variant == MuxerVariant::LowLatency;
        let target = self.window.target_duration();
        let skip_until = Duration::from_secs(target * 6);

        let mut out = String::new();
        let _ = writeln!(out, "#EXTM3U");
        let _ = writeln!(out, "#EXT-X-VERSION:{}", version(self.variant));
        let _ = writeln!(out, "#EXT-X-INDEPENDENT-SEGMENTS");
        let _ = writeln!(out, "#EXT-X-TARGETDURATION:{target}");
        if low_latency {
            let _ = writeln!(
                out,
                "#EXT-X-SERVER-CONTROL:CAN-BLOCK-RELOAD=YES,PART-HOLD-BACK={},CAN-SKIP-UNTIL={}",
                seconds(self.part_target.mul_f64(2.5)),
                seconds(skip_until)
            );
            let _ = writeln!(out, "#EXT-X-PART-INF:PART-TARGET={}", seconds(self.part_target));
        }
        let _ = writeln!(out, "#EXT-X-MEDIA-SEQUENCE:{}", self.window.first_sequence());
        if let Some(init) = &self.init {
            let _ = writeln!(out, "#EXT-X-MAP:URI=\"{init}\"");
        }

        let entries = &self.window.entries;
        let mut skipped = 0;
        if low_latency && skip {
            let mut remaining: Duration = entries.iter().map(WindowEntry::duration).sum();
            for entry in entries {
                remaining = remaining.saturating_sub(entry.duration());
                if remaining < skip_until {
                    break;
                }
                skipped += 1;
            }
            let _ = writeln!(out, "#EXT-X-SKIP:SKIPPED-SEGMENTS={skipped}");
        }

        let with_parts = entries.len().saturating_sub(SEGMENTS_WITH_PARTS);
        for (i, entry) in entries.iter().enumerate().skip(skipped) {
            match entry {
                WindowEntry::Gap { duration, .. } => {
                    let _ = writeln!(out, "#EXT-X-GAP");
                    let _ = writeln!(out, "#EXTINF:{},", seconds(*duration));
                    let _ = writeln!(out, "{GAP_URI}");
                }
                WindowEntry::Segment(segment) => {
                    let _ = writeln!(
                        out,
                        "#EXT-X-PROGRAM-DATE-TIME:{}",
                        segment.ntp.to_rfc3339_opts(SecondsFormat::Millis, true)
                    );
                    if low_latency && i >= with_parts {
                        write_parts(&mut out, &segment.parts);
                    }
                    let _ = writeln!(out, "#EXTINF:{},", seconds(segment.duration));
                    let _ = writeln!(out, "{}", segment.name);
                }
            }
        }

        if low_latency {
            if let (Some(ntp), false) = (self.pending_ntp, self.pending_parts.is_empty()) {
                let _ = writeln!(
                    out,
                    "#EXT-X-PROGRAM-DATE-TIME:{}",
                    ntp.to_rfc3339_opts(SecondsFormat::Millis, true)
                );
                write_parts(&mut out, self.pending_parts);
            }
            if let Some(hint) = self.preload_hint {
                let _ = writeln!(out, "#EXT-X-PRELOAD-HINT:TYPE=PART,URI=\"{hint}\"");
            }
        }
        out
    }
}

fn write_parts(out: &mut String, parts: &[MuxerPart]) {
    for part in parts {
        let _ = write!(
            out,
            "#EXT-X-PART:DURATION={},URI=\"{}\"",
            seconds(part.duration),
            part.name
        );
        if part.independent {
            let _ = write!(out, ",INDEPENDENT=YES");
        }
        let _ = writeln!(out);
    }
}

/// Renders the multivariant playlist: the main stream as the only variant
/// and every other stream as an audio rendition.
pub(crate) fn render_multivariant(
    variant: MuxerVariant,
    streams: &[MuxerStream],
    tracks: &[MuxerTrack],
) -> HlsResult<String> {
    let Some((main, renditions)) = streams.split_first() else {
        return Ok(String::new());
    };
    let stream_tracks = |stream: &MuxerStream| {
        stream
            .tracks
            .iter()
            .filter_map(|i| tracks.get(*i))
            .map(|t| &t.track)
            .collect::<Vec<_>>()
    };

    let mut playlist = MasterPlaylist {
        version: Some(version(variant)),
        independent_segments: true,
        ..Default::default()
    };

    let main_tracks = stream_tracks(main);
    let main_is_audio = main_tracks.first().is_some_and(|t| !t.codec.is_video());
    if main_is_audio && !renditions.is_empty() {
        let track = main_tracks[0];
        playlist.alternatives.push(AlternativeMedia {
            media_type: AlternativeMediaType::Audio,
            group_id: AUDIO_GROUP.to_string(),
            name: track.name.clone().unwrap_or_else(|| main.name.clone()),
            language: track.language.clone(),
            default: !renditions
                .iter()
                .any(|r| stream_tracks(r).first().is_some_and(|t| t.is_default)),
            autoselect: true,
            ..Default::default()
        });
    }
    for rendition in renditions {
        let Some(track) = stream_tracks(rendition).first().copied() else {
            continue;
        };
        playlist.alternatives.push(AlternativeMedia {
            media_type: AlternativeMediaType::Audio,
            uri: Some(rendition.playlist_name()),
            group_id: AUDIO_GROUP.to_string(),
            name: track.name.clone().unwrap_or_else(|| rendition.name.clone()),
            language: track.language.clone(),
            default: track.is_default,
            autoselect: true,
            ..Default::default()
        });
    }

    let (mut peak, mut average) = (0, 0);
    let mut codecs = Vec::new();
    for stream in streams {
        let (stream_peak, stream_average) = stream.window.bandwidth();
        peak += stream_peak;
        average += stream_average;
        codecs.extend(
            stream_tracks(stream)
                .iter()
                .filter_map(|t| t.codec.codec_string()),
        );
    }

    let leading = main_tracks.iter().find(|t| t.codec.is_video());
    playlist.variants.push(VariantStream {
        uri: main.playlist_name(),
        bandwidth: peak,
        average_bandwidth: Some(average),
        codecs: (!codecs.is_empty()).then(|| codecs.join(",")),
        resolution: leading
            .and_then(|t| t.codec.resolution())
            .map(|(width, height)| Resolution {
                width: width as u64,
                height: height as u64,
            }),
        frame_rate: leading
            .and(main.window.frame_rate())
            .map(|rate| (rate * 1000.0).round() / 1000.0),
        audio: (!renditions.is_empty()).then(|| AUDIO_GROUP.to_string()),
        ..Default::default()
    });

    let mut out = Vec::new();
    playlist.write_to(&mut out)?;
    Ok(String::from_utf8_lossy(&out).into_owned())
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, Utc};

    use super::*;
    use crate::storage::Storage;

    async fn segment(sequence: u64, parts: usize) -> anyhow::Result<FinalizedSegment> {
        use crate::muxer::segment::MuxerSegment;

        let name = format!("seg{sequence}.mp4");
        let file = Storage::memory().allocate(&name).await?;
        let ntp = DateTime::<Utc>::from_timestamp(1_700_000_000 + sequence as i64, 0)
            .unwrap_or_default();
        let start = sequence as i64 * 1_000_000_000;
        let mut segment = MuxerSegment::new(file, sequence, name, start, ntp, u64::MAX);
        for index in 0..parts {
            segment.append(&[0; 100]).await?;
            segment
                .finish_part(MuxerPart {
                    id: sequence * 10 + index as u64,
                    name: format!("part{sequence}_{index}.mp4"),
                    duration: Duration::from_secs(1) / parts as u32,
                    independent: index == 0,
                    index,
                })
                .await?;
        }
        Ok(segment.finalize(start + 1_000_000_000).await?)
    }

    #[tokio::test]
    async fn test_window_eviction() -> anyhow::Result<()> {
        let mut window = SegmentWindow::with_gaps(3, 2, Duration::from_secs(1));
        assert!(!window.has_segments());
        assert!(window.push(segment(2, 0).await?).is_empty());
        assert_eq!(window.first_sequence(), 0);

        // gaps are dropped without being returned
        assert!(window.push(segment(3, 0).await?).is_empty());
        let evicted = window.push(segment(4, 0).await?);
        assert!(evicted.is_empty());
        let evicted = window.push(segment(5, 0).await?);
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].sequence, 2);
        assert_eq!(window.first_sequence(), 3);
        Ok(())
    }

    #[test]
    fn test_request_parse() {
        assert_eq!(PlaylistRequest::parse(None), Ok(PlaylistRequest::default()));
        assert_eq!(
            PlaylistRequest::parse(Some("_HLS_msn=10&_HLS_part=2&_HLS_skip=YES")),
            Ok(PlaylistRequest {
                msn: Some(10),
                part: Some(2),
                skip: true,
            })
        );
        assert!(PlaylistRequest::parse(Some("_HLS_part=2")).is_err());
        assert!(PlaylistRequest::parse(Some("_HLS_msn=abc")).is_err());
        assert!(PlaylistRequest::parse(Some("_HLS_skip=NO")).is_err());
    }

    #[tokio::test]
    async fn test_availability() -> anyhow::Result<()> {
        let mut window = SegmentWindow::new(7);
        let pending_parts = vec![MuxerPart {
            id: 30,
            name: "part3_0.mp4".to_string(),
            duration: Duration::from_millis(500),
            independent: true,
            index: 0,
        }];
        let request = |msn, part| PlaylistRequest {
            msn: Some(msn),
            part,
            skip: false,
        };

        assert_eq!(
            availability(&PlaylistRequest::default(), &window, Some((0, &[]))),
            Ok(Availability::Wait)
        );
        window.push(segment(2, 2).await?);
        let pending = Some((3, pending_parts.as_slice()));

        assert_eq!(availability(&request(2, None), &window, pending), Ok(Availability::Ready));
        assert_eq!(availability(&request(3, None), &window, pending), Ok(Availability::Wait));
        assert_eq!(availability(&request(3, Some(0)), &window, pending), Ok(Availability::Ready));
        assert_eq!(availability(&request(3, Some(1)), &window, pending), Ok(Availability::Wait));
        // past the last part of segment 2 means part 0 of segment 3
        assert_eq!(availability(&request(2, Some(2)), &window, pending), Ok(Availability::Ready));
        assert_eq!(availability(&request(4, None), &window, pending), Ok(Availability::Wait));

        assert!(availability(&request(5, None), &window, pending).is_err());
        assert!(availability(&request(3, Some(5)), &window, pending).is_err());
        assert!(availability(&request(4, Some(3)), &window, pending).is_err());
        Ok(())
    }

    #[tokio::test]
    async fn test_low_latency_playlist() -> anyhow::Result<()> {
        let mut window = SegmentWindow::with_gaps(7, 7, Duration::from_secs(1));
        window.push(segment(7, 2).await?);
        window.push(segment(8, 2).await?);

        let pending_parts = vec![MuxerPart {
            id: 90,
            name: "part9_0.mp4".to_string(),
            duration: Duration::from_millis(500),
            independent: true,
            index: 0,
        }];
        let view = MediaPlaylistView {
            variant: MuxerVariant::LowLatency,
            window: &window,
            init: Some("stream_init.mp4".to_string()),
            pending_ntp: DateTime::from_timestamp(1_700_000_009, 0),
            pending_parts: &pending_parts,
            preload_hint: Some("part9_1.mp4"),
            part_target: Duration::from_millis(500),
        };

        let text = view.render(false);
        assert!(text.contains("#EXT-X-VERSION:9\n"));
        assert!(text.contains("#EXT-X-TARGETDURATION:1\n"));
        assert!(text.contains(
            "#EXT-X-SERVER-CONTROL:CAN-BLOCK-RELOAD=YES,PART-HOLD-BACK=1.25,CAN-SKIP-UNTIL=6\n"
        ));
        assert!(text.contains("#EXT-X-PART-INF:PART-TARGET=0.5\n"));
        assert!(text.contains("#EXT-X-MEDIA-SEQUENCE:2\n"));
        assert!(text.contains("#EXT-X-MAP:URI=\"stream_init.mp4\"\n"));
        assert_eq!(text.matches("#EXT-X-GAP").count(), 5);
        assert!(text.contains("#EXT-X-PROGRAM-DATE-TIME:2023-11-14T22:13:27.000Z\n"));
        assert!(text.contains("#EXT-X-PART:DURATION=0.5,URI=\"part7_0.mp4\",INDEPENDENT=YES\n"));
        assert!(text.contains("#EXT-X-PART:DURATION=0.5,URI=\"part9_0.mp4\",INDEPENDENT=YES\n"));
        assert!(text.ends_with("#EXT-X-PRELOAD-HINT:TYPE=PART,URI=\"part9_1.mp4\"\n"));

        let delta = view.render(true);
        assert!(delta.contains("#EXT-X-SKIP:SKIPPED-SEGMENTS=1\n"));
        assert_eq!(delta.matches("#EXT-X-GAP").count(), 4);
        Ok(())
    }

    #[test]
    fn test_seconds() {
        assert_eq!(seconds(Duration::from_secs(4)), "4");
        assert_eq!(seconds(Duration::from_millis(250)), "0.25");
        assert_eq!(seconds(Duration::from_nanos(33_333_333)), "0.03333");
    }
}
