use std::sync::Arc;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use url::Url;

use super::{
    fetch::fetch,
    playlist::{
        absolute_byte_range, blocking_reload_url, download_media, find_segment, MediaPlaylistInfo,
    },
    processor::ProcessorContext,
    processor_fmp4::Fmp4Processor,
    processor_mpegts::MpegTsProcessor,
    routine_pool::RoutinePool,
    segment_queue::{QueuedSegment, SegmentQueue},
    ClientConfig,
};
use crate::error::{HlsError, HlsResult};

/// Downloads the segments of one rendition into its segment queue.
pub(crate) struct StreamDownloader {
    http: reqwest::Client,
    url: Url,
    initial: Option<MediaPlaylistInfo>,
    ctx: Option<ProcessorContext>,
    queue: Arc<SegmentQueue>,
    pool: RoutinePool,
    config: Arc<ClientConfig>,
    cur_segment_id: Option<u64>,
}

impl StreamDownloader {
    pub(crate) fn new(
        http: reqwest::Client,
        url: Url,
        initial: Option<MediaPlaylistInfo>,
        ctx: ProcessorContext,
    ) -> Self {
        Self {
            http,
            url,
            initial,
            queue: ctx.queue.clone(),
            pool: ctx.pool.clone(),
            config: ctx.config.clone(),
            ctx: Some(ctx),
            cur_segment_id: None,
        }
    }

    pub(crate) async fn run(mut self) -> HlsResult<()> {
        let token = self.pool.token().clone();

        let mut info = match self.initial.take() {
            Some(info) => info,
            None => download_media(&self.http, &self.url, &token).await?,
        };
        self.start_processor(&info, &token).await?;

        loop {
            if self.fill_queue(&info, &token).await? {
                token.cancelled().await;
                return Err(HlsError::StreamEnded);
            }
            self.queue.wait_until_size_is_below(1, &token).await?;

            if !info.playlist.end_list {
                info = self.reload(&info, &token).await?;
            }
        }
    }

    async fn start_processor(
        &mut self,
        info: &MediaPlaylistInfo,
        token: &CancellationToken,
    ) -> HlsResult<()> {
        let ctx = self.ctx.take().ok_or(HlsError::Terminated)?;
        let map = info
            .playlist
            .segments
            .iter()
            .find_map(|segment| segment.map.as_ref());

        match map {
            Some(map) => {
                let url = self.url.join(&map.uri)?;
                log::debug!("downloading init segment {url}");
                let init = fetch(&self.http, &url, map.byte_range.as_ref(), token).await?;
                let processor = Fmp4Processor::new(ctx, &init)?;
                self.pool.run(processor.run());
            }
            None => {
                let processor = MpegTsProcessor::new(ctx);
                self.pool.run(processor.run());
            }
        }
        Ok(())
    }

    async fn reload(
        &self,
        info: &MediaPlaylistInfo,
        token: &CancellationToken,
    ) -> HlsResult<MediaPlaylistInfo> {
        let url = match self.cur_segment_id {
            Some(cur) if info.can_block_reload => blocking_reload_url(&self.url, cur + 1),
            _ => self.url.clone(),
        };
        download_media(&self.http, &url, token).await
    }

    /// Downloads the next segment. Returns `true` once the last segment of an
    /// ended playlist has been queued.
    async fn fill_queue(
        &mut self,
        info: &MediaPlaylistInfo,
        token: &CancellationToken,
    ) -> HlsResult<bool> {
        let playlist = &info.playlist;
        let (sequence, index) = find_segment(playlist, self.cur_segment_id, &self.config)?;
        let segment = &playlist.segments[index];

        let url = self.url.join(&segment.uri)?;
        let range = absolute_byte_range(&playlist.segments, index);
        let data = fetch(&self.http, &url, range.as_ref(), token).await?;
        tracing::info!(
            sequence,
            duration = segment.duration,
            size = data.len(),
            "downloaded segment"
        );

        self.cur_segment_id = Some(sequence);
        self.queue.push(QueuedSegment {
            sequence,
            data,
            date_time: segment
                .program_date_time
                .map(|date_time| date_time.with_timezone(&Utc)),
        });

        Ok(playlist.end_list && index + 1 == playlist.segments.len())
    }
}
