use std::sync::Arc;

use bytes::Bytes;
use hlskit_mpegts::{adts, Demuxer, Pes, TsError, TIMESTAMP_MASK};

use super::{
    processor::{ProcessorContext, TrackOutput},
    segment_queue::QueuedSegment,
    timesync::{to_nanos, Anchor, TimeSync, TimeSyncMpegTs},
    track_processor::{DataCallback, Payload, Sample},
    ClientTrack,
};
use crate::{
    codecs::{h264, mpeg1audio, Codec},
    error::{HlsError, HlsResult},
    Track,
};

struct TsTrackInfo {
    pid: u16,
    track: Track,
}

/// Demuxes MPEG-TS segments of one rendition.
pub(crate) struct MpegTsProcessor {
    ctx: ProcessorContext,
    demuxer: Demuxer,
    tracks: Vec<TsTrackInfo>,
    leading_pid: Option<u16>,
    anchor: Option<Arc<Anchor>>,
    outputs: Vec<TrackOutput>,
}

type Registered = Vec<(Arc<ClientTrack>, Option<DataCallback>)>;

impl MpegTsProcessor {
    pub(crate) fn new(ctx: ProcessorContext) -> Self {
        Self {
            ctx,
            demuxer: Demuxer::new(),
            tracks: Vec::new(),
            leading_pid: None,
            anchor: None,
            outputs: Vec::new(),
        }
    }

    pub(crate) async fn run(mut self) -> HlsResult<()> {
        let segment = self.ctx.queue.pull(self.ctx.pool.token()).await?;
        let pes = self.demuxer.demux(segment.data.to_vec())?;
        self.discover_tracks(&pes)?;

        let announced = self.tracks.iter().map(|t| t.track.clone()).collect();
        let mut registered = Some(self.ctx.announce(announced).await?);
        let Some(leading_pid) = self.leading_pid else {
            // nothing to deliver, the other renditions carry the tracks
            self.ctx.pool.token().cancelled().await;
            return Err(HlsError::Terminated);
        };
        self.process_segment(&segment, pes, leading_pid, &mut registered)
            .await?;

        loop {
            let segment = self.ctx.queue.pull(self.ctx.pool.token()).await?;
            let pes = self.demuxer.demux(segment.data.to_vec())?;
            self.process_segment(&segment, pes, leading_pid, &mut registered)
                .await?;
        }
    }

    fn discover_tracks(&mut self, pes: &[Pes]) -> HlsResult<()> {
        let ts_tracks = self.demuxer.tracks().ok_or(TsError::PmtNotFound)?;
        if ts_tracks.len() > self.ctx.config.max_ts_tracks {
            return Err(HlsError::TooManyTracks);
        }

        for ts_track in ts_tracks {
            let first_payload = pes
                .iter()
                .find(|p| p.pid == ts_track.pid)
                .map_or(&[][..], |p| p.data.as_slice());
            match Codec::from_ts(ts_track.codec, first_payload) {
                Ok(codec) => self.tracks.push(TsTrackInfo {
                    pid: ts_track.pid,
                    track: Track::new(codec),
                }),
                Err(e) => log::warn!("skipping track with PID {}: {e}", ts_track.pid),
            }
        }

        self.leading_pid = self
            .tracks
            .iter()
            .find(|t| matches!(t.track.codec, Codec::H264 { .. }))
            .or_else(|| self.tracks.first())
            .map(|t| t.pid);
        Ok(())
    }

    async fn process_segment(
        &mut self,
        segment: &QueuedSegment,
        pes: Vec<Pes>,
        leading_pid: u16,
        registered: &mut Option<Registered>,
    ) -> HlsResult<()> {
        let leading = pes
            .iter()
            .find(|p| p.pid == leading_pid)
            .ok_or(HlsError::LeadingTrackDataMissing)?;
        let leading_start = leading.decode_time().ok_or(HlsError::PtsMissing)?;

        let anchor = match &self.anchor {
            Some(anchor) => anchor.clone(),
            None => {
                let anchor = self
                    .ctx
                    .anchor(|| {
                        Ok(Anchor::new(TimeSync::MpegTs(TimeSyncMpegTs::new(
                            leading_start,
                        ))))
                    })
                    .await?;
                self.outputs = self
                    .ctx
                    .spawn_track_processors(registered.take().unwrap_or_default(), &anchor);
                self.anchor = Some(anchor.clone());
                anchor
            }
        };
        let sync = anchor.mpegts()?;

        let mut samples = vec![Vec::new(); self.tracks.len()];
        let mut leading_elapsed = None;
        for pes in pes {
            let Some(index) = self.tracks.iter().position(|t| t.pid == pes.pid) else {
                continue;
            };
            let track = &self.tracks[index].track;
            let pts = pes.pts.ok_or(HlsError::PtsMissing)?;
            let raw_dts = pes.dts.unwrap_or(pts);

            let dts = sync.convert(raw_dts, track.clock_rate);
            let pts = dts + pts_offset(pts, raw_dts, track.clock_rate);
            if pes.pid == leading_pid && leading_elapsed.is_none() {
                leading_elapsed = Some(to_nanos(dts, track.clock_rate));
            }

            samples[index].push(Sample {
                pts,
                dts,
                payload: payload(&track.codec, pes.data)?,
            });
        }

        let correlation = self.ctx.correlation(
            &anchor,
            segment.date_time,
            leading_elapsed.unwrap_or_default(),
        );

        tracing::debug!(
            sequence = segment.sequence,
            size = segment.data.len(),
            "processing MPEG-TS segment"
        );
        self.ctx.dispatch(&self.outputs, samples, correlation).await
    }
}

/// Signed difference between PTS and DTS, in ticks of `clock_rate`.
fn pts_offset(pts: u64, dts: u64, clock_rate: u32) -> i64 {
    let mut diff = (pts.wrapping_sub(dts) & TIMESTAMP_MASK) as i64;
    if diff > 1 << 32 {
        diff -= 1 << 33;
    }
    diff * clock_rate as i64 / hlskit_mpegts::CLOCK_RATE as i64
}

fn payload(codec: &Codec, data: Vec<u8>) -> HlsResult<Payload> {
    Ok(match codec {
        Codec::H264 { .. } | Codec::H265 { .. } => Payload::Units(h264::split_annexb(&data)?),
        Codec::Mpeg4Audio(_) => Payload::Units(
            adts::decode(&data)?
                .into_iter()
                .map(|packet| Bytes::from(packet.au))
                .collect(),
        ),
        Codec::Mpeg1Audio => Payload::Units(mpeg1audio::split_frames(&Bytes::from(data))?),
        Codec::Klv => Payload::Unit(Bytes::from(data)),
        Codec::Av1 { .. } | Codec::Vp9(_) | Codec::Opus { .. } => {
            return Err(HlsError::UnsupportedCodec(format!(
                "{} in MPEG-TS",
                codec.name()
            )))
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pts_offset() {
        assert_eq!(pts_offset(93003, 90000, 90000), 3003);
        // PTS wrapped, DTS did not
        assert_eq!(pts_offset(1000, TIMESTAMP_MASK - 999, 90000), 2000);
        assert_eq!(pts_offset(90000, 90000, 48000), 0);
    }
}
