//! Per-track preparation of written samples: decode timestamps, parameter
//! set tracking and the one-sample lookahead that gives every sample its
//! duration.

use std::{collections::BTreeSet, time::Duration};

use bytes::Bytes;
use chrono::{DateTime, Utc};

use crate::{
    codecs::{av1, dts::DtsExtractor, h264, h265, Codec, Vp9Params},
    error::{HlsError, HlsResult},
    Track,
};

const PART_DURATION_STEP: Duration = Duration::from_millis(5);
const MAX_PART_DURATION: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub(crate) enum SamplePayload {
    /// NAL units or OBUs.
    Units(Vec<Bytes>),
    /// A VP9 frame, an audio frame or a KLV unit.
    Frame(Bytes),
}

/// A sample waiting to be written, timestamps in ticks of the track clock.
#[derive(Debug, Clone)]
pub(crate) struct MuxerSample {
    pub(crate) ntp: DateTime<Utc>,
    pub(crate) pts: i64,
    pub(crate) dts: i64,
    pub(crate) random_access: bool,
    /// The parameter sets changed with this sample.
    pub(crate) params_changed: bool,
    pub(crate) payload: SamplePayload,
}

pub(crate) struct MuxerTrack {
    pub(crate) track: Track,
    /// Index of the stream the track belongs to.
    pub(crate) stream: usize,
    /// Position of the track inside its stream.
    pub(crate) position: usize,
    pub(crate) is_leading: bool,
    dts_extractor: Option<DtsExtractor>,
    started: bool,
    next: Option<MuxerSample>,
}

impl MuxerTrack {
    pub(crate) fn new(track: Track, stream: usize, position: usize, is_leading: bool) -> Self {
        let dts_extractor = match track.codec {
            Codec::H264 { .. } => Some(DtsExtractor::new_h264()),
            Codec::H265 { .. } => Some(DtsExtractor::new_h265()),
            _ => None,
        };
        Self {
            track,
            stream,
            position,
            is_leading,
            dts_extractor,
            started: false,
            next: None,
        }
    }

    /// Video samples before the first random access point are dropped.
    fn start(&mut self, random_access: bool) -> bool {
        if !self.started && random_access {
            self.started = true;
        }
        self.started
    }

    /// Random access units without parameter sets are decoded with the ones
    /// known from the track.
    fn extract_dts(&mut self, au: &[Bytes], pts: i64, random_access: bool) -> HlsResult<i64> {
        let Some(extractor) = &mut self.dts_extractor else {
            return Ok(pts);
        };
        let params = match &self.track.codec {
            Codec::H264 { sps, pps } if h264::find_params(au).0.is_none() => {
                vec![sps.clone(), pps.clone()]
            }
            Codec::H265 { vps, sps, pps } if h265::find_params(au).1.is_none() => {
                vec![vps.clone(), sps.clone(), pps.clone()]
            }
            _ => Vec::new(),
        };
        if !random_access || params.is_empty() || params.iter().any(Bytes::is_empty) {
            return extractor.extract(au, pts);
        }
        let au: Vec<Bytes> = params.into_iter().chain(au.iter().cloned()).collect();
        extractor.extract(&au, pts)
    }

    pub(crate) fn prepare_h26x(
        &mut self,
        ntp: DateTime<Utc>,
        pts: i64,
        au: Vec<Bytes>,
    ) -> HlsResult<Option<MuxerSample>> {
        let random_access = match &self.track.codec {
            Codec::H264 { .. } => h264::is_random_access(&au),
            Codec::H265 { .. } => h265::is_random_access(&au),
            _ => return Err(HlsError::UnsupportedCodec(self.track.codec.name().to_string())),
        };
        if !self.start(random_access) {
            return Ok(None);
        }

        let params_changed = match &mut self.track.codec {
            Codec::H264 { sps, pps } => {
                let (new_sps, new_pps) = h264::find_params(&au);
                update_param(sps, new_sps) | update_param(pps, new_pps)
            }
            Codec::H265 { vps, sps, pps } => {
                let (new_vps, new_sps, new_pps) = h265::find_params(&au);
                update_param(vps, new_vps) | update_param(sps, new_sps) | update_param(pps, new_pps)
            }
            _ => false,
        };

        let dts = self.extract_dts(&au, pts, random_access)?;
        Ok(Some(MuxerSample {
            ntp,
            pts,
            dts,
            random_access,
            params_changed,
            payload: SamplePayload::Units(au),
        }))
    }

    pub(crate) fn prepare_av1(
        &mut self,
        ntp: DateTime<Utc>,
        pts: i64,
        obus: Vec<Bytes>,
    ) -> HlsResult<Option<MuxerSample>> {
        let random_access = av1::is_random_access(&obus);
        if !self.start(random_access) {
            return Ok(None);
        }

        let params_changed = match &mut self.track.codec {
            Codec::Av1 { sequence_header } => {
                update_param(sequence_header, av1::find_sequence_header(&obus))
            }
            _ => return Err(HlsError::UnsupportedCodec(self.track.codec.name().to_string())),
        };

        Ok(Some(MuxerSample {
            ntp,
            pts,
            dts: pts,
            random_access,
            params_changed,
            payload: SamplePayload::Units(obus),
        }))
    }

    pub(crate) fn prepare_vp9(
        &mut self,
        ntp: DateTime<Utc>,
        pts: i64,
        frame: Bytes,
    ) -> HlsResult<Option<MuxerSample>> {
        let random_access = crate::codecs::vp9::is_random_access(&frame);
        if !self.start(random_access) {
            return Ok(None);
        }

        let mut params_changed = false;
        if random_access {
            let params = Vp9Params::parse(&frame)?;
            match &mut self.track.codec {
                Codec::Vp9(current) if *current != params => {
                    // a zero-sized frame means the size was unknown when the
                    // track was created
                    params_changed = current.width != 0;
                    *current = params;
                }
                Codec::Vp9(_) => {}
                _ => return Err(HlsError::UnsupportedCodec(self.track.codec.name().to_string())),
            }
        }

        Ok(Some(MuxerSample {
            ntp,
            pts,
            dts: pts,
            random_access,
            params_changed,
            payload: SamplePayload::Frame(frame),
        }))
    }

    /// Audio and metadata samples: every sample is a sync sample and DTS
    /// equals PTS.
    pub(crate) fn prepare_frame(&self, ntp: DateTime<Utc>, pts: i64, frame: Bytes) -> MuxerSample {
        MuxerSample {
            ntp,
            pts,
            dts: pts,
            random_access: true,
            params_changed: false,
            payload: SamplePayload::Frame(frame),
        }
    }

    /// Makes `sample` the lookahead sample and returns the previous one with
    /// its duration.
    pub(crate) fn push(&mut self, sample: MuxerSample) -> Option<(MuxerSample, i64)> {
        let next_dts = sample.dts;
        let prev = self.next.replace(sample)?;
        let duration = (next_dts - prev.dts).max(0);
        Some((prev, duration))
    }

    /// The sample that will be written next.
    pub(crate) fn lookahead(&self) -> Option<&MuxerSample> {
        self.next.as_ref()
    }
}

/// Replaces a stored parameter set. Returns true when a known parameter set
/// changed.
fn update_param(current: &mut Bytes, new: Option<&Bytes>) -> bool {
    match new {
        Some(new) if new != current => {
            let changed = !current.is_empty();
            *current = new.clone();
            changed
        }
        _ => false,
    }
}

fn is_compatible(part_duration: Duration, sample_duration: Duration) -> bool {
    if sample_duration.is_zero() {
        return true;
    }
    if sample_duration > part_duration {
        return false;
    }
    let part = part_duration.as_nanos();
    let sample = sample_duration.as_nanos();
    let fraction = part / part.div_ceil(sample);
    sample * 100 >= fraction * 85
}

/// Part duration target of LL-HLS streams.
///
/// During the first segment the target grows until every observed sample
/// duration fits it: players reject parts shorter than 85% of the target.
#[derive(Debug)]
pub(crate) struct PartDurationAdjuster {
    min: Duration,
    current: Duration,
    observed: BTreeSet<Duration>,
    learning: bool,
}

impl PartDurationAdjuster {
    pub(crate) fn new(min: Duration) -> Self {
        Self {
            min,
            current: min,
            observed: BTreeSet::new(),
            learning: true,
        }
    }

    pub(crate) fn current(&self) -> Duration {
        self.current
    }

    pub(crate) fn observe(&mut self, sample_duration: Duration) {
        if !self.learning || !self.observed.insert(sample_duration) {
            return;
        }

        let mut candidate = self.min;
        while candidate < MAX_PART_DURATION
            && !self.observed.iter().all(|d| is_compatible(candidate, *d))
        {
            candidate += PART_DURATION_STEP;
        }
        self.current = candidate;
    }

    /// Called when the first segment is complete.
    pub(crate) fn stop_learning(&mut self) {
        self.learning = false;
    }

    /// Called when the parameter sets change.
    pub(crate) fn reset(&mut self) {
        self.current = self.min;
        self.observed.clear();
        self.learning = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codecs::h264::tests::{PPS, SPS};

    fn ntp() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).unwrap_or_default()
    }

    fn idr() -> Vec<Bytes> {
        vec![
            Bytes::from_static(&SPS),
            Bytes::from_static(&PPS),
            Bytes::from_static(&[0x65, 0x88, 0x84, 0x00]),
        ]
    }

    fn non_idr() -> Vec<Bytes> {
        vec![Bytes::from_static(&[0x41, 0x9a, 0x02, 0x00])]
    }

    fn h264_track() -> MuxerTrack {
        let codec = Codec::H264 {
            sps: Bytes::new(),
            pps: Bytes::new(),
        };
        MuxerTrack::new(Track::new(codec), 0, 0, true)
    }

    #[test]
    fn test_discard_before_sync() {
        let mut track = h264_track();
        assert!(track.prepare_h26x(ntp(), 0, non_idr()).unwrap().is_none());

        let sample = track.prepare_h26x(ntp(), 180000, idr()).unwrap().unwrap();
        assert!(sample.random_access);
        // parameters were unknown, this is not a change
        assert!(!sample.params_changed);
        assert!(track.track.codec.is_ready());

        assert!(track.prepare_h26x(ntp(), 183000, non_idr()).unwrap().is_some());
    }

    #[test]
    fn test_idr_without_params() {
        let codec = Codec::H264 {
            sps: Bytes::from_static(&SPS),
            pps: Bytes::from_static(&PPS),
        };
        let mut track = MuxerTrack::new(Track::new(codec), 0, 0, true);
        let au = vec![Bytes::from_static(&[0x65, 0x88, 0x84, 0x00])];
        let sample = track.prepare_h26x(ntp(), 90000, au).unwrap().unwrap();
        assert_eq!(sample.dts, 90000);
        assert!(!sample.params_changed);
    }

    #[test]
    fn test_params_change() {
        let mut track = h264_track();
        track.prepare_h26x(ntp(), 0, idr()).unwrap();

        let mut sps = SPS.to_vec();
        // different level
        sps[3] = 0x1f;
        let au = vec![
            Bytes::from(sps),
            Bytes::from_static(&PPS),
            Bytes::from_static(&[0x65, 0x88, 0x84, 0x00]),
        ];
        let sample = track.prepare_h26x(ntp(), 3000, au).unwrap().unwrap();
        assert!(sample.params_changed);
    }

    #[test]
    fn test_lookahead() {
        let mut track = MuxerTrack::new(
            Track::new(Codec::Opus { channel_count: 2 }),
            0,
            0,
            true,
        );
        let frame = Bytes::from_static(&[0xfc]);
        let first = track.prepare_frame(ntp(), 0, frame.clone());
        assert!(track.push(first).is_none());

        let second = track.prepare_frame(ntp(), 960, frame);
        let (prev, duration) = track.push(second).unwrap();
        assert_eq!(prev.pts, 0);
        assert_eq!(duration, 960);
        assert_eq!(track.lookahead().map(|s| s.pts), Some(960));
    }

    #[test]
    fn test_part_duration() {
        let mut adjuster = PartDurationAdjuster::new(Duration::from_millis(200));
        adjuster.observe(Duration::from_nanos(33_333_333));
        assert_eq!(adjuster.current(), Duration::from_millis(200));

        adjuster.observe(Duration::from_millis(250));
        assert_eq!(adjuster.current(), Duration::from_millis(250));

        adjuster.stop_learning();
        adjuster.observe(Duration::from_millis(400));
        assert_eq!(adjuster.current(), Duration::from_millis(250));

        adjuster.reset();
        assert_eq!(adjuster.current(), Duration::from_millis(200));
        adjuster.observe(Duration::from_millis(400));
        assert_eq!(adjuster.current(), Duration::from_millis(400));
    }
}
