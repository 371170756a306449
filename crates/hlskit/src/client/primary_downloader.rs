use std::sync::Arc;

use m3u8_rs::Playlist;
use tokio::sync::oneshot;
use url::Url;

use super::{
    playlist::{audio_renditions, choose_leading_variant, download, MediaPlaylistInfo},
    processor::{ProcessorContext, Rendition, StreamTracks},
    routine_pool::RoutinePool,
    segment_queue::SegmentQueue,
    stream_downloader::StreamDownloader,
    timesync::anchor_channel,
    ClientConfig, ClientTrack, OnTracks, TrackCallbacks,
};
use crate::error::{HlsError, HlsResult};

struct StreamSource {
    url: Url,
    initial: Option<MediaPlaylistInfo>,
    rendition: Rendition,
}

/// Resolves the top-level playlist into renditions and starts one stream
/// downloader for each of them.
pub(crate) struct PrimaryDownloader {
    pub(crate) http: reqwest::Client,
    pub(crate) url: Url,
    pub(crate) config: Arc<ClientConfig>,
    pub(crate) pool: RoutinePool,
    pub(crate) on_tracks: OnTracks,
}

impl PrimaryDownloader {
    pub(crate) async fn run(self) -> HlsResult<()> {
        let token = self.pool.token().clone();

        let playlist = download(&self.http, &self.url, &token).await?;
        let sources = match playlist {
            Playlist::MediaPlaylist(playlist) => vec![StreamSource {
                url: self.url.clone(),
                initial: Some(MediaPlaylistInfo::new(playlist)),
                rendition: Rendition::default(),
            }],
            Playlist::MasterPlaylist(playlist) => {
                let variant = choose_leading_variant(&playlist)?;
                log::info!(
                    "selected variant {} with bandwidth {}",
                    variant.uri,
                    variant.bandwidth
                );
                let mut sources = vec![StreamSource {
                    url: self.url.join(&variant.uri)?,
                    initial: None,
                    rendition: Rendition::default(),
                }];
                for media in audio_renditions(&playlist, variant) {
                    let Some(uri) = media.uri.as_deref() else {
                        continue;
                    };
                    sources.push(StreamSource {
                        url: self.url.join(uri)?,
                        initial: None,
                        rendition: Rendition {
                            name: Some(media.name.clone()),
                            language: media.language.clone(),
                            is_default: media.default,
                        },
                    });
                }
                sources
            }
        };

        let anchor = anchor_channel();
        let mut announcements = Vec::with_capacity(sources.len());
        for (i, source) in sources.into_iter().enumerate() {
            let (announce, announced) = oneshot::channel();
            let ctx = ProcessorContext {
                queue: Arc::new(SegmentQueue::new()),
                is_leading: i == 0,
                anchor: anchor.clone(),
                config: self.config.clone(),
                pool: self.pool.clone(),
                rendition: source.rendition,
                announce: Some(announce),
            };
            let downloader =
                StreamDownloader::new(self.http.clone(), source.url, source.initial, ctx);
            self.pool.run(downloader.run());
            announcements.push(announced);
        }

        let mut tracks = Vec::new();
        let mut replies = Vec::with_capacity(announcements.len());
        for announced in announcements {
            let StreamTracks {
                tracks: stream_tracks,
                reply,
            } = tokio::select! {
                announced = announced => announced.map_err(|_| HlsError::Terminated)?,
                _ = token.cancelled() => return Err(HlsError::Terminated),
            };
            replies.push((stream_tracks.len(), reply));
            tracks.extend(stream_tracks);
        }
        if tracks.is_empty() {
            return Err(HlsError::NoSupportedTracks);
        }

        let tracks: Vec<_> = tracks
            .into_iter()
            .enumerate()
            .map(|(index, track)| Arc::new(ClientTrack::new(index, track)))
            .collect();
        let mut callbacks = TrackCallbacks::new(tracks.clone());
        (self.on_tracks)(&mut callbacks)?;

        // start streaming
        let mut registered = tracks.into_iter().zip(callbacks.into_callbacks());
        for (count, reply) in replies {
            let _ = reply.send(registered.by_ref().take(count).collect());
        }

        token.cancelled().await;
        Err(HlsError::Terminated)
    }
}
