use std::{collections::HashSet, sync::Arc};

use bytes::Bytes;
use hlskit_fmp4::{Init, Part, PartTrack};

use super::{
    processor::{ProcessorContext, TrackOutput},
    timesync::{to_nanos, Anchor, TimeSync, TimeSyncFmp4},
    track_processor::{Payload, Sample},
};
use crate::{
    codecs::{av1, h264, mpeg1audio, Codec},
    error::{HlsError, HlsResult},
    Track,
};

struct InitTrackInfo {
    id: u32,
    time_scale: u32,
    codec: Codec,
}

/// Demuxes fragmented MP4 segments of one rendition.
pub(crate) struct Fmp4Processor {
    ctx: ProcessorContext,
    tracks: Vec<InitTrackInfo>,
    skipped: HashSet<u32>,
    leading_id: Option<u32>,
}

impl Fmp4Processor {
    pub(crate) fn new(ctx: ProcessorContext, init: &[u8]) -> HlsResult<Self> {
        let init = Init::unmarshal(init)?;

        let mut tracks = Vec::new();
        let mut skipped = HashSet::new();
        for track in init.tracks {
            match Codec::from_sample_entry(&track.sample_entry) {
                Ok(codec) => tracks.push(InitTrackInfo {
                    id: track.id,
                    time_scale: track.time_scale,
                    codec,
                }),
                Err(e) => {
                    log::warn!("skipping track {}: {e}", track.id);
                    skipped.insert(track.id);
                }
            }
        }

        let leading_id = tracks
            .iter()
            .find(|t| t.codec.is_video())
            .or_else(|| tracks.first())
            .map(|t| t.id);

        Ok(Self {
            ctx,
            tracks,
            skipped,
            leading_id,
        })
    }

    pub(crate) async fn run(mut self) -> HlsResult<()> {
        let announced = self
            .tracks
            .iter()
            .map(|t| {
                let mut track = Track::new(t.codec.clone());
                track.clock_rate = t.time_scale;
                track
            })
            .collect();
        let mut registered = Some(self.ctx.announce(announced).await?);
        let Some(leading_id) = self.leading_id else {
            // nothing to deliver, the other renditions carry the tracks
            self.ctx.pool.token().cancelled().await;
            return Err(HlsError::Terminated);
        };
        let leading_time_scale = self.time_scale(leading_id)?;

        let mut state: Option<(Arc<Anchor>, Vec<TrackOutput>)> = None;
        loop {
            let segment = self.ctx.queue.pull(self.ctx.pool.token()).await?;
            let parts = Part::unmarshal_all(&segment.data)?;

            let part_tracks: Vec<&PartTrack> = parts.iter().flat_map(|p| &p.tracks).collect();
            if part_tracks.len() > self.ctx.config.max_part_tracks_per_segment {
                return Err(HlsError::TooManyPartTracks);
            }
            let leading_base = part_tracks
                .iter()
                .find(|t| t.id == leading_id)
                .map(|t| t.base_time);

            let (anchor, outputs) = match state.take() {
                Some(state) => state,
                None => {
                    let anchor = self
                        .ctx
                        .anchor(|| {
                            let base = leading_base.ok_or(HlsError::LeadingTrackDataMissing)?;
                            Ok(Anchor::new(TimeSync::Fmp4(TimeSyncFmp4::new(
                                leading_time_scale,
                                base,
                            ))))
                        })
                        .await?;
                    let outputs = self
                        .ctx
                        .spawn_track_processors(registered.take().unwrap_or_default(), &anchor);
                    (anchor, outputs)
                }
            };
            let sync = anchor.fmp4()?;

            let leading_start = match leading_base {
                Some(base) => to_nanos(
                    sync.convert(base, leading_time_scale),
                    leading_time_scale,
                ),
                None if self.ctx.is_leading => return Err(HlsError::LeadingTrackDataMissing),
                None => 0,
            };
            let correlation = self
                .ctx
                .correlation(&anchor, segment.date_time, leading_start);

            let mut samples = vec![Vec::new(); self.tracks.len()];
            for part_track in part_tracks {
                if self.skipped.contains(&part_track.id) {
                    continue;
                }
                let index = self
                    .tracks
                    .iter()
                    .position(|t| t.id == part_track.id)
                    .ok_or(HlsError::UnknownTrack(part_track.id))?;
                samples[index].extend(convert_samples(part_track, &self.tracks[index], sync)?);
            }

            tracing::debug!(
                sequence = segment.sequence,
                size = segment.data.len(),
                "processing fMP4 segment"
            );
            self.ctx.dispatch(&outputs, samples, correlation).await?;
            state = Some((anchor, outputs));
        }
    }

    fn time_scale(&self, id: u32) -> HlsResult<u32> {
        self.tracks
            .iter()
            .find(|t| t.id == id)
            .map(|t| t.time_scale)
            .ok_or(HlsError::UnknownTrack(id))
    }
}

fn convert_samples(
    part_track: &PartTrack,
    info: &InitTrackInfo,
    sync: &TimeSyncFmp4,
) -> HlsResult<Vec<Sample>> {
    let mut dts = sync.convert(part_track.base_time, info.time_scale);
    let mut samples = Vec::with_capacity(part_track.samples.len());

    for sample in &part_track.samples {
        samples.push(Sample {
            pts: dts + sample.pts_offset as i64,
            dts,
            payload: payload(&info.codec, sample.payload.clone())?,
        });
        dts += sample.duration as i64;
    }
    Ok(samples)
}

fn payload(codec: &Codec, data: Bytes) -> HlsResult<Payload> {
    Ok(match codec {
        Codec::Av1 { .. } => Payload::Units(av1::split_temporal_unit(&data)?),
        Codec::Vp9(_) | Codec::Klv => Payload::Unit(data),
        Codec::H265 { .. } | Codec::H264 { .. } => Payload::Units(h264::split_avcc(&data)?),
        Codec::Opus { .. } | Codec::Mpeg4Audio(_) => Payload::Units(vec![data]),
        Codec::Mpeg1Audio => Payload::Units(mpeg1audio::split_frames(&data)?),
    })
}
