//! Mapping of container timestamps to time elapsed since the stream started.

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use chrono::{DateTime, Utc};
use tokio::{sync::watch, time::Instant};
use tokio_util::sync::CancellationToken;

pub(crate) use crate::clock::to_nanos;
use crate::{
    clock::rescale,
    error::{HlsError, HlsResult},
};

/// fMP4 timestamps are relative to the base time of the leading track.
#[derive(Debug)]
pub(crate) struct TimeSyncFmp4 {
    leading_time_scale: u32,
    leading_base_time: u64,
}

impl TimeSyncFmp4 {
    pub(crate) fn new(leading_time_scale: u32, leading_base_time: u64) -> Self {
        Self {
            leading_time_scale,
            leading_base_time,
        }
    }

    pub(crate) fn convert(&self, raw: u64, clock_rate: u32) -> i64 {
        let base = rescale(
            self.leading_base_time as i64,
            self.leading_time_scale,
            clock_rate,
        );
        raw as i64 - base
    }
}

/// MPEG-TS timestamps wrap around every 2^33 ticks of a 90 kHz clock. The
/// decoder accumulates signed differences between consecutive values.
#[derive(Debug)]
pub(crate) struct TimeSyncMpegTs {
    state: Mutex<(u64, i64)>,
}

impl TimeSyncMpegTs {
    pub(crate) fn new(start: u64) -> Self {
        Self {
            state: Mutex::new((start & hlskit_mpegts::TIMESTAMP_MASK, 0)),
        }
    }

    fn decode(&self, raw: u64) -> i64 {
        const HALF: i64 = 1 << 32;
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let (prev, acc) = &mut *state;

        let raw = raw & hlskit_mpegts::TIMESTAMP_MASK;
        let mut diff = (raw.wrapping_sub(*prev) & hlskit_mpegts::TIMESTAMP_MASK) as i64;
        if diff > HALF {
            diff -= 1 << 33;
        }
        *prev = raw;
        *acc += diff;
        *acc
    }

    pub(crate) fn convert(&self, raw: u64, clock_rate: u32) -> i64 {
        rescale(self.decode(raw), hlskit_mpegts::CLOCK_RATE, clock_rate)
    }
}

#[derive(Debug)]
pub(crate) enum TimeSync {
    Fmp4(TimeSyncFmp4),
    MpegTs(TimeSyncMpegTs),
}

/// Absolute time of a point on the elapsed timeline, from
/// `EXT-X-PROGRAM-DATE-TIME`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Correlation {
    pub(crate) date_time: DateTime<Utc>,
    /// Elapsed nanoseconds at `date_time`.
    pub(crate) elapsed: i64,
}

impl Correlation {
    pub(crate) fn absolute_time(&self, elapsed: i64) -> DateTime<Utc> {
        self.date_time + chrono::Duration::nanoseconds(elapsed - self.elapsed)
    }
}

/// Time reference shared by every rendition of a stream.
#[derive(Debug)]
pub(crate) struct Anchor {
    pub(crate) sync: TimeSync,
    started: Instant,
    correlation: Mutex<Option<Correlation>>,
}

impl Anchor {
    pub(crate) fn new(sync: TimeSync) -> Self {
        Self {
            sync,
            started: Instant::now(),
            correlation: Mutex::new(None),
        }
    }

    pub(crate) fn fmp4(&self) -> HlsResult<&TimeSyncFmp4> {
        match &self.sync {
            TimeSync::Fmp4(sync) => Ok(sync),
            TimeSync::MpegTs(_) => Err(HlsError::TimeSyncMismatch),
        }
    }

    pub(crate) fn mpegts(&self) -> HlsResult<&TimeSyncMpegTs> {
        match &self.sync {
            TimeSync::MpegTs(sync) => Ok(sync),
            TimeSync::Fmp4(_) => Err(HlsError::TimeSyncMismatch),
        }
    }

    pub(crate) fn correlation(&self) -> Option<Correlation> {
        *self.correlation.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn set_correlation(&self, correlation: Option<Correlation>) {
        *self.correlation.lock().unwrap_or_else(|e| e.into_inner()) = correlation;
    }

    /// Sleeps until the wall clock catches up with `elapsed` nanoseconds of
    /// media time.
    pub(crate) async fn pace(
        &self,
        elapsed: i64,
        max_diff: Duration,
        token: &CancellationToken,
    ) -> HlsResult<()> {
        if elapsed <= 0 {
            return Ok(());
        }
        let target = self.started + Duration::from_nanos(elapsed as u64);
        let now = Instant::now();
        if target <= now {
            return Ok(());
        }
        if target - now > max_diff {
            return Err(HlsError::DtsRtcDiffTooBig);
        }
        tokio::select! {
            _ = tokio::time::sleep_until(target) => Ok(()),
            _ = token.cancelled() => Err(HlsError::Terminated),
        }
    }
}

/// Publishes the anchor of a rendition group exactly once.
pub(crate) type AnchorSender = Arc<watch::Sender<Option<Arc<Anchor>>>>;

pub(crate) fn anchor_channel() -> AnchorSender {
    Arc::new(watch::channel(None).0)
}

/// Waits for the leading rendition to publish its anchor.
pub(crate) async fn wait_anchor(
    sender: &AnchorSender,
    token: &CancellationToken,
) -> HlsResult<Arc<Anchor>> {
    let mut rx = sender.subscribe();
    tokio::select! {
        anchor = rx.wait_for(|a| a.is_some()) => anchor
            .ok()
            .and_then(|a| a.clone())
            .ok_or(HlsError::Terminated),
        _ = token.cancelled() => Err(HlsError::Terminated),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fmp4_convert() {
        let sync = TimeSyncFmp4::new(90000, 180000);
        assert_eq!(sync.convert(180000, 90000), 0);
        assert_eq!(sync.convert(270000, 90000), 90000);
        // audio track with its own time scale
        assert_eq!(sync.convert(96000 + 48000, 48000), 48000);
    }

    #[test]
    fn test_mpegts_wraparound() {
        let max = hlskit_mpegts::TIMESTAMP_MASK;
        let sync = TimeSyncMpegTs::new(max - 90000);
        assert_eq!(sync.convert(max - 90000, 90000), 0);
        assert_eq!(sync.convert(max, 90000), 90000);
        // wrapped
        assert_eq!(sync.convert(89999, 90000), 180000);
        // slightly backwards, as B-frames do
        assert_eq!(sync.convert(86999, 90000), 177000);
        assert_eq!(sync.convert(89999, 48000), 96000);
    }

    #[test]
    fn test_correlation() {
        let date_time = "2015-02-05T01:02:02Z".parse::<DateTime<Utc>>().unwrap();
        let correlation = Correlation {
            date_time,
            elapsed: 1_000_000_000,
        };
        assert_eq!(correlation.absolute_time(1_000_000_000), date_time);
        assert_eq!(
            correlation.absolute_time(3_500_000_000),
            date_time + chrono::Duration::milliseconds(2500)
        );
    }

    #[tokio::test]
    async fn test_pacing() {
        let anchor = Anchor::new(TimeSync::Fmp4(TimeSyncFmp4::new(90000, 0)));
        let token = CancellationToken::new();
        let max = Duration::from_secs(10);
        assert!(anchor.pace(0, max, &token).await.is_ok());
        assert!(matches!(
            anchor.pace(20_000_000_000, max, &token).await,
            Err(HlsError::DtsRtcDiffTooBig)
        ));

        let started = Instant::now();
        anchor.pace(50_000_000, max, &token).await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(40));
    }

    #[tokio::test]
    async fn test_wait_anchor() {
        let sender = anchor_channel();
        let token = CancellationToken::new();
        let waiter = {
            let sender = sender.clone();
            let token = token.clone();
            tokio::spawn(async move { wait_anchor(&sender, &token).await })
        };
        sender.send_replace(Some(Arc::new(Anchor::new(TimeSync::MpegTs(
            TimeSyncMpegTs::new(0),
        )))));
        let anchor = waiter.await.unwrap().unwrap();
        assert!(anchor.mpegts().is_ok());
        assert!(matches!(anchor.fmp4(), Err(HlsError::TimeSyncMismatch)));
    }
}
