//! HTTP side of the muxer.

use axum::{
    extract::{Request, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Router,
};
use bytes::Bytes;

use super::{
    playlist::{availability, render_multivariant, Availability, PlaylistRequest},
    Muxer, MuxerState, MuxerVariant,
};
use crate::{error::HlsError, storage::StorageReader};

pub(crate) const MULTIVARIANT_PLAYLIST: &str = "index.m3u8";

/// What a served path points to. Streams are referred to by index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Resource {
    MultivariantPlaylist,
    MediaPlaylist(usize),
    Init(usize),
    Segment(usize, u64),
    Part(usize, u64),
}

#[derive(Debug)]
pub enum MuxerHttpError {
    BadRequest(String),
    NotFound,
    Internal(String),
}

impl IntoResponse for MuxerHttpError {
    fn into_response(self) -> Response {
        match self {
            MuxerHttpError::BadRequest(message) => {
                (StatusCode::BAD_REQUEST, message).into_response()
            }
            MuxerHttpError::NotFound => StatusCode::NOT_FOUND.into_response(),
            MuxerHttpError::Internal(message) => {
                (StatusCode::INTERNAL_SERVER_ERROR, message).into_response()
            }
        }
    }
}

impl From<HlsError> for MuxerHttpError {
    fn from(err: HlsError) -> Self {
        log::error!("muxer request failed: {err}");
        MuxerHttpError::Internal(err.to_string())
    }
}

enum Content {
    Playlist(String),
    Data(Bytes),
    Stored(StorageReader),
}

enum Lookup {
    Ready(Content),
    Wait,
}

fn content_type(name: &str) -> &'static str {
    if name.ends_with(".m3u8") {
        "application/vnd.apple.mpegurl"
    } else if name.ends_with(".ts") {
        "video/mp2t"
    } else {
        "video/mp4"
    }
}

impl Content {
    async fn into_response(self, name: &str) -> Result<Response, MuxerHttpError> {
        let body = match self {
            Content::Playlist(text) => Bytes::from(text),
            Content::Data(data) => data,
            Content::Stored(reader) => reader.read().await?,
        };
        Ok(([(header::CONTENT_TYPE, content_type(name))], body).into_response())
    }
}

impl MuxerState {
    fn lookup(&self, name: &str, query: Option<&str>) -> Result<Lookup, MuxerHttpError> {
        let Some(resource) = self.paths.get(name).copied() else {
            // the part announced by the preload hint is served once written
            if self.streams.iter().any(|s| s.is_preload_hint(name)) {
                return Ok(Lookup::Wait);
            }
            return Err(MuxerHttpError::NotFound);
        };

        let stream = |index: usize| self.streams.get(index).ok_or(MuxerHttpError::NotFound);
        let content = match resource {
            Resource::MultivariantPlaylist => {
                if !self.streams.iter().all(|s| s.window.has_segments()) {
                    return Ok(Lookup::Wait);
                }
                Content::Playlist(render_multivariant(self.variant, &self.streams, &self.tracks)?)
            }
            Resource::MediaPlaylist(index) => {
                let stream = stream(index)?;
                let request = match self.variant {
                    MuxerVariant::LowLatency => {
                        PlaylistRequest::parse(query).map_err(MuxerHttpError::BadRequest)?
                    }
                    MuxerVariant::MpegTs | MuxerVariant::Fmp4 => PlaylistRequest::default(),
                };
                match availability(&request, &stream.window, stream.pending())
                    .map_err(MuxerHttpError::BadRequest)?
                {
                    Availability::Ready => {
                        Content::Playlist(stream.playlist_view().render(request.skip))
                    }
                    Availability::Wait => return Ok(Lookup::Wait),
                }
            }
            Resource::Init(index) => match stream(index)?.init(&self.tracks)? {
                Some(init) => Content::Data(Bytes::from(init)),
                None => return Ok(Lookup::Wait),
            },
            Resource::Segment(index, sequence) => {
                let stream = stream(index)?;
                match stream.segment_reader(sequence) {
                    Some(reader) => Content::Stored(reader),
                    None if stream.pending().is_some_and(|(seq, _)| seq == sequence) => {
                        return Ok(Lookup::Wait)
                    }
                    None => return Err(MuxerHttpError::NotFound),
                }
            }
            Resource::Part(index, id) => stream(index)?
                .part_reader(id)
                .map(Content::Stored)
                .ok_or(MuxerHttpError::NotFound)?,
        };
        Ok(Lookup::Ready(content))
    }
}

impl Muxer {
    /// Serves a request for a playlist, an init file, a segment or a part.
    /// Only the last path component is looked at, so the router can be
    /// nested under any prefix.
    pub async fn handle(&self, request: Request) -> Response {
        let uri = request.uri();
        let name = uri.path().rsplit('/').next().unwrap_or_default();
        match self.serve(name, uri.query()).await {
            Ok(response) => response,
            Err(err) => err.into_response(),
        }
    }

    async fn serve(&self, name: &str, query: Option<&str>) -> Result<Response, MuxerHttpError> {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let lookup = {
                let state = self.inner.state.lock().await;
                match state.as_ref() {
                    Some(state) if !state.closed => state.lookup(name, query)?,
                    _ => return Err(MuxerHttpError::NotFound),
                }
            };
            match lookup {
                Lookup::Ready(content) => return content.into_response(name).await,
                Lookup::Wait => notified.await,
            }
        }
    }

    /// A router serving every path of the muxer.
    pub fn router(&self) -> Router {
        Router::new().fallback(serve_request).with_state(self.clone())
    }
}

async fn serve_request(State(muxer): State<Muxer>, request: Request) -> Response {
    muxer.handle(request).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        let response = MuxerHttpError::BadRequest("invalid _HLS_msn".into()).into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(MuxerHttpError::NotFound.into_response().status(), StatusCode::NOT_FOUND);
        let response = MuxerHttpError::from(HlsError::MaximumSegmentSize).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn test_content_type() {
        assert_eq!(content_type("index.m3u8"), "application/vnd.apple.mpegurl");
        assert_eq!(content_type("stream_ab_seg0.ts"), "video/mp2t");
        assert_eq!(content_type("stream_init.mp4"), "video/mp4");
    }
}
