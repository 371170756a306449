//! HLS client.
//!
//! The client downloads a multivariant or media playlist, follows the leading
//! variant and its audio renditions, demuxes every segment and delivers the
//! samples of each track to user callbacks, paced by the wall clock.

mod fetch;
mod playlist;
mod primary_downloader;
mod processor;
mod processor_fmp4;
mod processor_mpegts;
mod routine_pool;
mod segment_queue;
mod stream_downloader;
mod timesync;
mod tls;
mod track_processor;

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use url::Url;

use self::{
    primary_downloader::PrimaryDownloader, routine_pool::RoutinePool,
    track_processor::DataCallback,
};
use crate::{
    codecs::Codec,
    error::{HlsError, HlsResult},
    Track,
};

/// Tunables of the client.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Distance from the end of a live playlist of the first downloaded
    /// segment.
    pub live_initial_distance: usize,
    /// Maximum distance from the end of a live playlist of the next segment.
    pub live_max_distance_from_end: usize,
    /// Maximum difference between the DTS of a sample and the time elapsed
    /// since the stream started.
    pub max_dts_rtc_diff: Duration,
    pub max_part_tracks_per_segment: usize,
    pub max_ts_tracks: usize,
    /// Segments buffered per track between demuxing and delivery.
    pub track_queue_size: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            live_initial_distance: 3,
            live_max_distance_from_end: 5,
            max_dts_rtc_diff: Duration::from_secs(10),
            max_part_tracks_per_segment: 200,
            max_ts_tracks: 16,
            track_queue_size: 100,
        }
    }
}

/// A track found by the client.
#[derive(Debug)]
pub struct ClientTrack {
    index: usize,
    track: Track,
    absolute_time: Mutex<Option<DateTime<Utc>>>,
}

impl ClientTrack {
    pub(crate) fn new(index: usize, track: Track) -> Self {
        Self {
            index,
            track,
            absolute_time: Mutex::new(None),
        }
    }

    /// Position of the track among all tracks of the client.
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn track(&self) -> &Track {
        &self.track
    }

    pub fn codec(&self) -> &Codec {
        &self.track.codec
    }

    /// Absolute time of the last delivered sample.
    pub fn absolute_time(&self) -> Option<DateTime<Utc>> {
        *self.absolute_time.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn set_absolute_time(&self, time: Option<DateTime<Utc>>) {
        *self.absolute_time.lock().unwrap_or_else(|e| e.into_inner()) = time;
    }
}

/// Passed to the `on_tracks` callback to register data callbacks.
pub struct TrackCallbacks {
    tracks: Vec<Arc<ClientTrack>>,
    callbacks: Vec<Option<DataCallback>>,
}

impl TrackCallbacks {
    fn new(tracks: Vec<Arc<ClientTrack>>) -> Self {
        let callbacks = tracks.iter().map(|_| None).collect();
        Self { tracks, callbacks }
    }

    fn into_callbacks(self) -> Vec<Option<DataCallback>> {
        self.callbacks
    }

    pub fn tracks(&self) -> &[Arc<ClientTrack>] {
        &self.tracks
    }

    fn register(
        &mut self,
        track: &ClientTrack,
        matches: impl FnOnce(&Codec) -> bool,
        callback: DataCallback,
    ) -> HlsResult<()> {
        let index = track.index();
        match (self.tracks.get(index), self.callbacks.get_mut(index)) {
            (Some(known), Some(slot)) if matches(known.codec()) => {
                *slot = Some(callback);
                Ok(())
            }
            _ => Err(HlsError::InvalidTrack(index)),
        }
    }

    /// Registers a callback receiving the OBUs of an AV1 track.
    pub fn on_data_av1<F>(&mut self, track: &ClientTrack, callback: F) -> HlsResult<()>
    where
        F: FnMut(i64, Vec<Bytes>) -> HlsResult<()> + Send + 'static,
    {
        self.register(
            track,
            |c| matches!(c, Codec::Av1 { .. }),
            DataCallback::Av1(Box::new(callback)),
        )
    }

    /// Registers a callback receiving the frames of a VP9 track.
    pub fn on_data_vp9<F>(&mut self, track: &ClientTrack, callback: F) -> HlsResult<()>
    where
        F: FnMut(i64, Bytes) -> HlsResult<()> + Send + 'static,
    {
        self.register(
            track,
            |c| matches!(c, Codec::Vp9(_)),
            DataCallback::Vp9(Box::new(callback)),
        )
    }

    /// Registers a callback receiving `(pts, dts, NAL units)` of a H264 or
    /// H265 track.
    pub fn on_data_h26x<F>(&mut self, track: &ClientTrack, callback: F) -> HlsResult<()>
    where
        F: FnMut(i64, i64, Vec<Bytes>) -> HlsResult<()> + Send + 'static,
    {
        self.register(
            track,
            |c| matches!(c, Codec::H264 { .. } | Codec::H265 { .. }),
            DataCallback::H26x(Box::new(callback)),
        )
    }

    pub fn on_data_opus<F>(&mut self, track: &ClientTrack, callback: F) -> HlsResult<()>
    where
        F: FnMut(i64, Vec<Bytes>) -> HlsResult<()> + Send + 'static,
    {
        self.register(
            track,
            |c| matches!(c, Codec::Opus { .. }),
            DataCallback::Opus(Box::new(callback)),
        )
    }

    /// Registers a callback receiving the access units of a MPEG-4 audio
    /// track.
    pub fn on_data_mpeg4audio<F>(&mut self, track: &ClientTrack, callback: F) -> HlsResult<()>
    where
        F: FnMut(i64, Vec<Bytes>) -> HlsResult<()> + Send + 'static,
    {
        self.register(
            track,
            |c| matches!(c, Codec::Mpeg4Audio(_)),
            DataCallback::Mpeg4Audio(Box::new(callback)),
        )
    }

    pub fn on_data_mpeg1audio<F>(&mut self, track: &ClientTrack, callback: F) -> HlsResult<()>
    where
        F: FnMut(i64, Vec<Bytes>) -> HlsResult<()> + Send + 'static,
    {
        self.register(
            track,
            |c| matches!(c, Codec::Mpeg1Audio),
            DataCallback::Mpeg1Audio(Box::new(callback)),
        )
    }

    pub fn on_data_klv<F>(&mut self, track: &ClientTrack, callback: F) -> HlsResult<()>
    where
        F: FnMut(i64, Bytes) -> HlsResult<()> + Send + 'static,
    {
        self.register(
            track,
            |c| matches!(c, Codec::Klv),
            DataCallback::Klv(Box::new(callback)),
        )
    }
}

pub(crate) type OnTracks = Box<dyn FnOnce(&mut TrackCallbacks) -> HlsResult<()> + Send>;

pub struct ClientBuilder {
    uri: String,
    tls_fingerprint: Option<String>,
    http_client: Option<reqwest::Client>,
    config: ClientConfig,
    on_tracks: Option<OnTracks>,
}

impl ClientBuilder {
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            tls_fingerprint: None,
            http_client: None,
            config: ClientConfig::default(),
            on_tracks: None,
        }
    }

    /// SHA-256 fingerprint of the server certificate, in hex. When set, any
    /// other certificate is rejected.
    pub fn tls_fingerprint(mut self, fingerprint: impl Into<String>) -> Self {
        self.tls_fingerprint = Some(fingerprint.into());
        self
    }

    pub fn http_client(mut self, client: reqwest::Client) -> Self {
        self.http_client = Some(client);
        self
    }

    pub fn config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    /// Called once with all tracks before any sample is delivered.
    pub fn on_tracks<F>(mut self, callback: F) -> Self
    where
        F: FnOnce(&mut TrackCallbacks) -> HlsResult<()> + Send + 'static,
    {
        self.on_tracks = Some(Box::new(callback));
        self
    }

    pub fn build(self) -> HlsResult<Client> {
        let url = Url::parse(&self.uri)?;
        let http = match (self.tls_fingerprint, self.http_client) {
            (Some(_), Some(_)) => {
                return Err(HlsError::InvalidConfig(
                    "a TLS fingerprint cannot be used with a custom HTTP client".to_string(),
                ))
            }
            (Some(fingerprint), None) => tls::pinned_client(&fingerprint)?,
            (None, Some(client)) => client,
            (None, None) => reqwest::Client::new(),
        };

        Ok(Client {
            url,
            http,
            config: Arc::new(self.config),
            on_tracks: Some(self.on_tracks.unwrap_or_else(|| Box::new(|_| Ok(())))),
            token: None,
            outcome: Arc::new(Mutex::new(None)),
            done: CancellationToken::new(),
        })
    }
}

pub struct Client {
    url: Url,
    http: reqwest::Client,
    config: Arc<ClientConfig>,
    on_tracks: Option<OnTracks>,
    token: Option<CancellationToken>,
    outcome: Arc<Mutex<Option<HlsError>>>,
    done: CancellationToken,
}

impl Client {
    /// Starts downloading. Must be called inside a Tokio runtime.
    pub fn start(&mut self) -> HlsResult<()> {
        let on_tracks = self
            .on_tracks
            .take()
            .ok_or_else(|| HlsError::InvalidConfig("client is already started".to_string()))?;

        let (pool, mut errors) = RoutinePool::new();
        let token = pool.token().clone();
        self.token = Some(token.clone());

        pool.run(
            PrimaryDownloader {
                http: self.http.clone(),
                url: self.url.clone(),
                config: self.config.clone(),
                pool: pool.clone(),
                on_tracks,
            }
            .run(),
        );

        let outcome = self.outcome.clone();
        let done = self.done.clone();
        tokio::spawn(async move {
            let err = tokio::select! {
                Some(err) = errors.recv() => err,
                _ = token.cancelled() => HlsError::Terminated,
            };
            log::debug!("client stopped: {err}");
            pool.close().await;
            *outcome.lock().unwrap_or_else(|e| e.into_inner()) = Some(err);
            done.cancel();
        });

        log::info!("client started for {}", self.url);
        Ok(())
    }

    /// Waits until the client stops and returns the reason.
    pub async fn wait(&self) -> HlsError {
        if self.token.is_none() {
            return HlsError::NotStarted;
        }
        self.done.cancelled().await;
        self.outcome
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .unwrap_or(HlsError::Terminated)
    }

    /// Stops every task and waits for them to exit.
    pub async fn close(&self) {
        if let Some(token) = &self.token {
            token.cancel();
            self.done.cancelled().await;
        }
    }

    /// Absolute time of the last sample delivered for `track`, if the
    /// playlist carries `EXT-X-PROGRAM-DATE-TIME`.
    pub fn absolute_time(&self, track: &ClientTrack) -> Option<DateTime<Utc>> {
        track.absolute_time()
    }
}
