//! Parts shared by the container processors.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot};

use super::{
    routine_pool::RoutinePool,
    segment_queue::SegmentQueue,
    timesync::{wait_anchor, Anchor, AnchorSender, Correlation},
    track_processor::{Batch, DataCallback, Sample, TrackProcessor},
    ClientConfig, ClientTrack,
};
use crate::{
    error::{HlsError, HlsResult},
    Track,
};

/// Attributes of the `EXT-X-MEDIA` entry a stream was opened from.
#[derive(Debug, Clone, Default)]
pub(crate) struct Rendition {
    pub(crate) name: Option<String>,
    pub(crate) language: Option<String>,
    pub(crate) is_default: bool,
}

/// Tracks found by a stream, sent to the primary downloader. The reply
/// carries the client tracks and the callbacks the user registered.
pub(crate) struct StreamTracks {
    pub(crate) tracks: Vec<Track>,
    pub(crate) reply: oneshot::Sender<Vec<(Arc<ClientTrack>, Option<DataCallback>)>>,
}

pub(crate) struct TrackOutput {
    pub(crate) track: Arc<ClientTrack>,
    tx: mpsc::Sender<Batch>,
}

pub(crate) struct ProcessorContext {
    pub(crate) queue: Arc<SegmentQueue>,
    pub(crate) is_leading: bool,
    pub(crate) anchor: AnchorSender,
    pub(crate) config: Arc<ClientConfig>,
    pub(crate) pool: RoutinePool,
    pub(crate) rendition: Rendition,
    pub(crate) announce: Option<oneshot::Sender<StreamTracks>>,
}

impl ProcessorContext {
    /// Announces the tracks of the stream and waits until streaming starts.
    pub(crate) async fn announce(
        &mut self,
        mut tracks: Vec<Track>,
    ) -> HlsResult<Vec<(Arc<ClientTrack>, Option<DataCallback>)>> {
        for track in &mut tracks {
            if track.name.is_none() {
                track.name.clone_from(&self.rendition.name);
            }
            if track.language.is_none() {
                track.language.clone_from(&self.rendition.language);
            }
            track.is_default |= self.rendition.is_default;
        }

        let announce = self.announce.take().ok_or(HlsError::Terminated)?;
        let (reply, registered) = oneshot::channel();
        announce
            .send(StreamTracks { tracks, reply })
            .map_err(|_| HlsError::Terminated)?;

        let token = self.pool.token();
        tokio::select! {
            registered = registered => registered.map_err(|_| HlsError::Terminated),
            _ = token.cancelled() => Err(HlsError::Terminated),
        }
    }

    /// Builds the anchor on the leading rendition, waits for it on the
    /// others.
    pub(crate) async fn anchor(
        &self,
        create: impl FnOnce() -> HlsResult<Anchor>,
    ) -> HlsResult<Arc<Anchor>> {
        if self.is_leading {
            let anchor = Arc::new(create()?);
            self.anchor.send_replace(Some(anchor.clone()));
            Ok(anchor)
        } else {
            wait_anchor(&self.anchor, self.pool.token()).await
        }
    }

    /// Correlation between elapsed time and absolute time for the current
    /// segment. The leading rendition derives it from the segment date, the
    /// others reuse it.
    pub(crate) fn correlation(
        &self,
        anchor: &Anchor,
        date_time: Option<DateTime<Utc>>,
        leading_start: i64,
    ) -> Option<Correlation> {
        if !self.is_leading {
            return anchor.correlation();
        }
        let correlation = date_time.map(|date_time| Correlation {
            date_time,
            elapsed: leading_start,
        });
        anchor.set_correlation(correlation);
        correlation
    }

    pub(crate) fn spawn_track_processors(
        &self,
        registered: Vec<(Arc<ClientTrack>, Option<DataCallback>)>,
        anchor: &Arc<Anchor>,
    ) -> Vec<TrackOutput> {
        registered
            .into_iter()
            .map(|(track, callback)| {
                let (tx, rx) = mpsc::channel(self.config.track_queue_size);
                let processor = TrackProcessor::new(
                    track.clone(),
                    callback,
                    anchor.clone(),
                    rx,
                    self.config.max_dts_rtc_diff,
                );
                self.pool.run(processor.run(self.pool.token().clone()));
                TrackOutput { track, tx }
            })
            .collect()
    }

    /// Sends the samples of a segment to the track processors and waits until
    /// all of them are delivered.
    pub(crate) async fn dispatch(
        &self,
        outputs: &[TrackOutput],
        samples: Vec<Vec<Sample>>,
        correlation: Option<Correlation>,
    ) -> HlsResult<()> {
        let token = self.pool.token();
        let mut pending = Vec::with_capacity(outputs.len());

        for (output, samples) in outputs.iter().zip(samples) {
            if samples.is_empty() {
                continue;
            }
            let (done, done_rx) = oneshot::channel();
            let batch = Batch {
                samples,
                correlation,
                done,
            };
            tokio::select! {
                sent = output.tx.send(batch) => sent.map_err(|_| HlsError::Terminated)?,
                _ = token.cancelled() => return Err(HlsError::Terminated),
            }
            pending.push(done_rx);
        }

        for done in pending {
            tokio::select! {
                done = done => done.map_err(|_| HlsError::Terminated)?,
                _ = token.cancelled() => return Err(HlsError::Terminated),
            }
        }
        Ok(())
    }
}
