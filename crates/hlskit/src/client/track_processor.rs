use std::{sync::Arc, time::Duration};

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use super::{
    timesync::{to_nanos, Anchor, Correlation},
    ClientTrack,
};
use crate::error::{HlsError, HlsResult};

pub(crate) type UnitsFn = Box<dyn FnMut(i64, Vec<Bytes>) -> HlsResult<()> + Send>;
pub(crate) type UnitFn = Box<dyn FnMut(i64, Bytes) -> HlsResult<()> + Send>;
pub(crate) type H26xFn = Box<dyn FnMut(i64, i64, Vec<Bytes>) -> HlsResult<()> + Send>;

/// User callback receiving the samples of a track.
pub(crate) enum DataCallback {
    Av1(UnitsFn),
    Vp9(UnitFn),
    H26x(H26xFn),
    Opus(UnitsFn),
    Mpeg4Audio(UnitsFn),
    Mpeg1Audio(UnitsFn),
    Klv(UnitFn),
}

#[derive(Debug, Clone)]
pub(crate) enum Payload {
    /// NAL units, OBUs or audio frames.
    Units(Vec<Bytes>),
    /// A VP9 frame or a KLV unit.
    Unit(Bytes),
}

/// A sample with timestamps on the elapsed timeline, in ticks of the track
/// clock rate.
#[derive(Debug, Clone)]
pub(crate) struct Sample {
    pub(crate) pts: i64,
    pub(crate) dts: i64,
    pub(crate) payload: Payload,
}

/// The samples of one track in one segment.
pub(crate) struct Batch {
    pub(crate) samples: Vec<Sample>,
    pub(crate) correlation: Option<Correlation>,
    pub(crate) done: oneshot::Sender<()>,
}

/// Delivers the samples of a track at the pace of the wall clock.
pub(crate) struct TrackProcessor {
    track: Arc<ClientTrack>,
    callback: Option<DataCallback>,
    anchor: Arc<Anchor>,
    batches: mpsc::Receiver<Batch>,
    max_dts_rtc_diff: Duration,
}

impl TrackProcessor {
    pub(crate) fn new(
        track: Arc<ClientTrack>,
        callback: Option<DataCallback>,
        anchor: Arc<Anchor>,
        batches: mpsc::Receiver<Batch>,
        max_dts_rtc_diff: Duration,
    ) -> Self {
        Self {
            track,
            callback,
            anchor,
            batches,
            max_dts_rtc_diff,
        }
    }

    pub(crate) async fn run(mut self, token: CancellationToken) -> HlsResult<()> {
        loop {
            let batch = tokio::select! {
                batch = self.batches.recv() => match batch {
                    Some(batch) => batch,
                    None => return Ok(()),
                },
                _ = token.cancelled() => return Err(HlsError::Terminated),
            };

            for sample in batch.samples {
                self.process(sample, batch.correlation.as_ref(), &token)
                    .await?;
            }
            let _ = batch.done.send(());
        }
    }

    async fn process(
        &mut self,
        sample: Sample,
        correlation: Option<&Correlation>,
        token: &CancellationToken,
    ) -> HlsResult<()> {
        if sample.pts < 0 {
            return Ok(());
        }

        let clock_rate = self.track.track().clock_rate;
        let dts = to_nanos(sample.dts, clock_rate);
        self.anchor
            .pace(dts, self.max_dts_rtc_diff, token)
            .await?;

        self.track
            .set_absolute_time(correlation.map(|c| c.absolute_time(dts)));

        let Some(callback) = self.callback.as_mut() else {
            return Ok(());
        };
        match (callback, sample.payload) {
            (DataCallback::H26x(cb), Payload::Units(units)) => cb(sample.pts, sample.dts, units),
            (
                DataCallback::Av1(cb)
                | DataCallback::Opus(cb)
                | DataCallback::Mpeg4Audio(cb)
                | DataCallback::Mpeg1Audio(cb),
                Payload::Units(units),
            ) => cb(sample.pts, units),
            (DataCallback::Vp9(cb) | DataCallback::Klv(cb), Payload::Unit(unit)) => {
                cb(sample.pts, unit)
            }
            _ => Err(HlsError::InvalidTrack(self.track.index())),
        }
    }
}
