use m3u8_rs::{
    AlternativeMedia, AlternativeMediaType, ByteRange, MasterPlaylist, MediaPlaylist,
    MediaPlaylistType, MediaSegment, Playlist, VariantStream,
};
use tokio_util::sync::CancellationToken;
use url::Url;

use super::{fetch::fetch, ClientConfig};
use crate::error::{HlsError, HlsResult};

pub(crate) fn parse(data: &[u8]) -> HlsResult<Playlist> {
    m3u8_rs::parse_playlist_res(data).map_err(|e| HlsError::M3u8ParseError(format!("{e:?}")))
}

/// A media playlist together with the server capabilities it advertises.
#[derive(Debug, Clone)]
pub(crate) struct MediaPlaylistInfo {
    pub(crate) playlist: MediaPlaylist,
    pub(crate) can_block_reload: bool,
}

impl MediaPlaylistInfo {
    pub(crate) fn new(playlist: MediaPlaylist) -> Self {
        Self {
            can_block_reload: can_block_reload(&playlist),
            playlist,
        }
    }
}

/// `EXT-X-SERVER-CONTROL` is kept by the parser as an unknown tag, attached
/// to the first segment.
fn can_block_reload(playlist: &MediaPlaylist) -> bool {
    playlist
        .unknown_tags
        .iter()
        .chain(playlist.segments.iter().flat_map(|s| &s.unknown_tags))
        .filter(|t| t.tag == "X-SERVER-CONTROL")
        .filter_map(|t| t.rest.as_deref())
        .flat_map(|attributes| attributes.split(','))
        .filter_map(|attribute| attribute.split_once('='))
        .any(|(key, value)| key.trim() == "CAN-BLOCK-RELOAD" && value.trim() == "YES")
}

pub(crate) async fn download(
    http: &reqwest::Client,
    url: &Url,
    token: &CancellationToken,
) -> HlsResult<Playlist> {
    log::debug!("downloading playlist {url}");
    let raw = fetch(http, url, None, token).await?;
    parse(&raw)
}

pub(crate) async fn download_media(
    http: &reqwest::Client,
    url: &Url,
    token: &CancellationToken,
) -> HlsResult<MediaPlaylistInfo> {
    match download(http, url, token).await? {
        Playlist::MediaPlaylist(playlist) => Ok(MediaPlaylistInfo::new(playlist)),
        Playlist::MasterPlaylist(_) => Err(HlsError::M3u8ParseError(
            "expected a media playlist, got a multivariant playlist".to_string(),
        )),
    }
}

/// URL of a blocking playlist reload that waits for media sequence `msn`.
pub(crate) fn blocking_reload_url(url: &Url, msn: u64) -> Url {
    let mut url = url.clone();
    let pairs: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(k, _)| !k.starts_with("_HLS_"))
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    url.query_pairs_mut()
        .clear()
        .extend_pairs(pairs)
        .append_pair("_HLS_msn", &msn.to_string());
    url
}

pub(crate) fn is_live(playlist: &MediaPlaylist) -> bool {
    !playlist.end_list && playlist.playlist_type != Some(MediaPlaylistType::Vod)
}

fn is_supported_codec(codec: &str) -> bool {
    let codec = codec.trim();
    codec == "opus"
        || ["avc1.", "hvc1.", "hev1.", "mp4a."]
            .iter()
            .any(|prefix| codec.starts_with(prefix))
}

/// Variants without `CODECS` are assumed to be playable.
fn is_supported_variant(variant: &VariantStream) -> bool {
    !variant.is_i_frame
        && variant
            .codecs
            .as_deref()
            .map_or(true, |codecs| codecs.split(',').all(is_supported_codec))
}

/// The supported variant with the highest bandwidth.
pub(crate) fn choose_leading_variant(playlist: &MasterPlaylist) -> HlsResult<&VariantStream> {
    playlist
        .variants
        .iter()
        .filter(|v| is_supported_variant(v))
        .max_by_key(|v| v.bandwidth)
        .ok_or(HlsError::NoSupportedVariants)
}

/// Audio renditions of the variant that are delivered as separate streams.
pub(crate) fn audio_renditions<'a>(
    playlist: &'a MasterPlaylist,
    variant: &VariantStream,
) -> Vec<&'a AlternativeMedia> {
    let Some(group) = variant.audio.as_deref() else {
        return Vec::new();
    };
    playlist
        .alternatives
        .iter()
        .filter(|a| a.media_type == AlternativeMediaType::Audio && a.group_id == group)
        .filter(|a| a.uri.is_some())
        .collect()
}

/// Byte range of a segment with an absolute offset. Ranges without an offset
/// continue the previous range of the same resource.
pub(crate) fn absolute_byte_range(segments: &[MediaSegment], index: usize) -> Option<ByteRange> {
    let target = segments.get(index)?;
    let range = target.byte_range.as_ref()?;
    let continues = |s: &MediaSegment| {
        s.uri == target.uri && s.byte_range.as_ref().is_some_and(|r| r.offset.is_none())
    };

    let mut start = index;
    while start > 0 && continues(&segments[start]) {
        start -= 1;
    }

    let mut offset = 0;
    for segment in &segments[start..index] {
        if let Some(r) = segment.byte_range.as_ref().filter(|_| segment.uri == target.uri) {
            offset = r.offset.unwrap_or(offset) + r.length;
        }
    }
    Some(ByteRange {
        length: range.length,
        offset: Some(range.offset.unwrap_or(offset)),
    })
}

/// Picks the position of the segment to download next.
///
/// The first segment of a live stream sits `live_initial_distance` segments
/// from the end, the first segment of an on-demand stream is the first one.
/// Afterwards, segments are followed by media sequence number.
pub(crate) fn find_segment(
    playlist: &MediaPlaylist,
    cur_segment_id: Option<u64>,
    config: &ClientConfig,
) -> HlsResult<(u64, usize)> {
    let len = playlist.segments.len();
    let live = is_live(playlist);

    let Some(cur) = cur_segment_id else {
        if live {
            if len < config.live_initial_distance {
                return Err(HlsError::NotEnoughSegments);
            }
            let index = len - config.live_initial_distance;
            return Ok((playlist.media_sequence + index as u64, index));
        }
        if len == 0 {
            return Err(HlsError::NoSegments);
        }
        return Ok((playlist.media_sequence, 0));
    };

    let next = cur + 1;
    let index = next
        .checked_sub(playlist.media_sequence)
        .map(|i| i as usize)
        .filter(|i| *i < len)
        .ok_or(HlsError::NextSegmentNotFound)?;

    if live && len - index > config.live_max_distance_from_end {
        return Err(HlsError::PlaybackTooLate);
    }

    Ok((next, index))
}
