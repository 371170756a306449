use std::time::Duration;

use anyhow::Context;
use axum::{
    body::{to_bytes, Body},
    http::{Request, StatusCode},
    Router,
};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use hlskit::{Codec, HlsError, Muxer, MuxerBuilder, MuxerVariant, Track};
use hlskit_fmp4::{Init, Part};
use hlskit_mpegts::Demuxer;
use tower::ServiceExt;

use crate::{h264, idr_with_params, init_test_tracing, p_slice, NON_IDR};

async fn get(router: &Router, uri: &str) -> anyhow::Result<(StatusCode, Bytes)> {
    let request = Request::builder().uri(uri).body(Body::empty())?;
    let response = router.clone().oneshot(request).await?;
    let status = response.status();
    Ok((status, to_bytes(response.into_body(), usize::MAX).await?))
}

async fn get_text(router: &Router, uri: &str) -> anyhow::Result<String> {
    let (status, body) = get(router, uri).await?;
    assert_eq!(status, StatusCode::OK, "{uri}");
    Ok(String::from_utf8(body.to_vec())?)
}

fn uris(playlist: &str) -> Vec<&str> {
    playlist
        .lines()
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .collect()
}

fn start_time() -> DateTime<Utc> {
    "2024-01-01T00:00:00Z".parse().unwrap()
}

fn at(seconds: i64) -> (DateTime<Utc>, i64) {
    (
        start_time() + chrono::Duration::seconds(seconds),
        seconds * 90000,
    )
}

/// Writes an IDR frame every second from `from` to `to` included.
async fn write_idrs(muxer: &Muxer, from: i64, to: i64) -> anyhow::Result<()> {
    for second in from..=to {
        let (ntp, pts) = at(second);
        muxer.write_h264(0, ntp, pts, idr_with_params()).await?;
    }
    Ok(())
}

#[tokio::test]
async fn test_start_validation() {
    let opus = Track::new(Codec::Opus { channel_count: 2 });
    let muxer = MuxerBuilder::new()
        .track(opus.clone())
        .variant(MuxerVariant::MpegTs)
        .build();
    assert!(matches!(
        muxer.start().await,
        Err(HlsError::UnsupportedCodec(_))
    ));

    let h265 = Codec::H265 {
        vps: Bytes::new(),
        sps: Bytes::new(),
        pps: Bytes::new(),
    };
    let muxer = MuxerBuilder::new()
        .track(Track::new(h265))
        .variant(MuxerVariant::MpegTs)
        .build();
    assert!(matches!(
        muxer.start().await,
        Err(HlsError::UnsupportedCodec(_))
    ));

    let muxer = MuxerBuilder::new()
        .track(Track::new(h264()))
        .variant(MuxerVariant::LowLatency)
        .segment_count(3)
        .build();
    assert!(matches!(muxer.start().await, Err(HlsError::InvalidConfig(_))));

    let muxer = MuxerBuilder::new().variant(MuxerVariant::Fmp4).build();
    assert!(matches!(muxer.start().await, Err(HlsError::InvalidConfig(_))));

    let muxer = MuxerBuilder::new()
        .track(Track::new(Codec::Klv))
        .variant(MuxerVariant::Fmp4)
        .build();
    assert!(matches!(
        muxer.start().await,
        Err(HlsError::UnsupportedCodec(_))
    ));

    let muxer = MuxerBuilder::new().track(opus).build();
    assert!(muxer.start().await.is_ok());
    assert!(matches!(muxer.start().await, Err(HlsError::InvalidConfig(_))));
}

#[tokio::test]
async fn test_write_errors() -> anyhow::Result<()> {
    let muxer = MuxerBuilder::new()
        .track(Track::new(h264()))
        .variant(MuxerVariant::MpegTs)
        .segment_count(3)
        .build();
    muxer.start().await?;

    let (ntp, pts) = at(0);
    let err = muxer
        .write_klv(0, ntp, pts, Bytes::from_static(&[1]))
        .await
        .unwrap_err();
    assert!(matches!(err, HlsError::InvalidTrack(0)));
    let err = muxer
        .write_h264(1, ntp, pts, idr_with_params())
        .await
        .unwrap_err();
    assert!(matches!(err, HlsError::InvalidTrack(1)));

    muxer.close().await;
    let err = muxer
        .write_h264(0, ntp, pts, idr_with_params())
        .await
        .unwrap_err();
    assert!(matches!(err, HlsError::Terminated));
    Ok(())
}

#[tokio::test]
async fn test_maximum_segment_size() -> anyhow::Result<()> {
    let muxer = MuxerBuilder::new()
        .track(Track::new(h264()))
        .variant(MuxerVariant::MpegTs)
        .segment_count(3)
        .segment_min_duration(Duration::from_secs(1))
        .segment_max_size(1000)
        .build();
    muxer.start().await?;
    let router = muxer.router();

    let (ntp, _) = at(0);
    muxer.write_h264(0, ntp, 0, idr_with_params()).await?;
    let mut frame = p_slice(2).to_vec();
    frame.resize(2000, 0xFF);
    muxer.write_h264(0, ntp, 3000, vec![Bytes::from(frame)]).await?;

    // the large frame is written once the next one gives its duration
    let err = muxer
        .write_h264(0, ntp, 6000, vec![p_slice(4)])
        .await
        .unwrap_err();
    assert!(matches!(err, HlsError::MaximumSegmentSize));

    let (ntp, pts) = at(1);
    muxer.write_h264(0, ntp, pts, idr_with_params()).await?;

    let playlist = get_text(&router, "/stream.m3u8").await?;
    let segments = uris(&playlist);
    assert_eq!(segments.len(), 1, "{playlist}");
    let (_, data) = get(&router, &format!("/{}", segments[0])).await?;
    assert_eq!(data.len(), 4 * 188);

    let mut demuxer = Demuxer::new();
    let pes = demuxer.demux(data.to_vec())?;
    let pts: Vec<_> = pes.iter().map(|p| p.pts).collect();
    assert_eq!(pts, vec![Some(0), Some(6000)]);

    // continuity counters skip nothing for the rejected frame
    let counters: Vec<u8> = data
        .chunks(188)
        .filter(|packet| u16::from_be_bytes([packet[1] & 0x1F, packet[2]]) == 0x100)
        .map(|packet| packet[3] & 0x0F)
        .collect();
    assert_eq!(counters, vec![0, 1]);
    Ok(())
}

#[tokio::test]
async fn test_maximum_segment_size_counts_fmp4_headers() -> anyhow::Result<()> {
    // an IDR sample takes 119 bytes with its moof, each following one 23
    let muxer = MuxerBuilder::new()
        .track(Track::new(h264()))
        .variant(MuxerVariant::Fmp4)
        .segment_count(3)
        .segment_max_size(200)
        .build();
    muxer.start().await?;

    let (ntp, _) = at(0);
    muxer.write_h264(0, ntp, 0, idr_with_params()).await?;
    for i in 1..=4u8 {
        muxer
            .write_h264(0, ntp, i as i64 * 3000, vec![p_slice(i * 2)])
            .await?;
    }
    let (ntp, pts) = at(1);
    let err = muxer
        .write_h264(0, ntp, pts, idr_with_params())
        .await
        .unwrap_err();
    assert!(matches!(err, HlsError::MaximumSegmentSize));
    Ok(())
}

#[tokio::test]
async fn test_mpegts_segments() -> anyhow::Result<()> {
    init_test_tracing();
    let directory = tempfile::tempdir()?;
    let muxer = MuxerBuilder::new()
        .track(Track::new(h264()))
        .variant(MuxerVariant::MpegTs)
        .segment_count(3)
        .segment_min_duration(Duration::from_secs(1))
        .directory(directory.path())
        .build();
    muxer.start().await?;
    let router = muxer.router();

    // decoding starts at the first IDR
    let (ntp, pts) = at(0);
    muxer
        .write_h264(0, ntp, pts, vec![Bytes::from_static(&NON_IDR)])
        .await?;
    for second in [2, 6, 7] {
        let (ntp, pts) = at(second);
        muxer.write_h264(0, ntp, pts, idr_with_params()).await?;
    }

    let playlist = get_text(&router, "/stream.m3u8").await?;
    assert!(playlist.contains("#EXT-X-VERSION:3\n"), "{playlist}");
    assert!(playlist.contains("#EXT-X-TARGETDURATION:4\n"), "{playlist}");
    assert!(playlist.contains("#EXT-X-MEDIA-SEQUENCE:0\n"), "{playlist}");
    assert!(playlist.contains(
        "#EXT-X-PROGRAM-DATE-TIME:2024-01-01T00:00:02.000Z\n#EXTINF:4,\n"
    ));
    assert!(playlist.contains(
        "#EXT-X-PROGRAM-DATE-TIME:2024-01-01T00:00:06.000Z\n#EXTINF:1,\n"
    ));
    assert!(!playlist.contains("#EXT-X-MAP"));

    let segments = uris(&playlist);
    assert_eq!(segments.len(), 2);
    for segment in &segments {
        assert!(segment.ends_with(".ts"), "{segment}");
        let (status, data) = get(&router, &format!("/{segment}")).await?;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(data.len() % 188, 0);
        assert_eq!(data[0], 0x47);
    }

    let multivariant = get_text(&router, "/index.m3u8").await?;
    assert!(multivariant.contains("avc1.640028"), "{multivariant}");
    assert!(multivariant.contains("RESOLUTION=1920x1080"), "{multivariant}");
    assert!(multivariant.contains("stream.m3u8"), "{multivariant}");

    let (status, _) = get(&router, "/unknown.ts").await?;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let stored = std::fs::read_dir(directory.path())?.count();
    assert!(stored >= segments.len());
    muxer.close().await;
    assert_eq!(std::fs::read_dir(directory.path())?.count(), 0);

    let (status, _) = get(&router, "/stream.m3u8").await?;
    assert_eq!(status, StatusCode::NOT_FOUND);
    Ok(())
}

#[tokio::test]
async fn test_fmp4_segments() -> anyhow::Result<()> {
    let muxer = MuxerBuilder::new()
        .track(Track::new(h264()))
        .variant(MuxerVariant::Fmp4)
        .segment_count(3)
        .build();
    muxer.start().await?;
    let router = muxer.router();
    write_idrs(&muxer, 0, 3).await?;

    let playlist = get_text(&router, "/stream.m3u8").await?;
    assert!(playlist.contains("#EXT-X-VERSION:7\n"), "{playlist}");
    assert!(playlist.contains("#EXT-X-MAP:URI=\"stream_init.mp4\"\n"), "{playlist}");
    assert!(playlist.contains("#EXT-X-TARGETDURATION:1\n"), "{playlist}");

    let (status, init) = get(&router, "/stream_init.mp4").await?;
    assert_eq!(status, StatusCode::OK);
    let init = Init::unmarshal(&init)?;
    assert_eq!(init.tracks.len(), 1);
    assert_eq!(init.tracks[0].time_scale, 90000);
    assert_eq!(
        Codec::from_sample_entry(&init.tracks[0].sample_entry)?,
        h264()
    );

    let segments = uris(&playlist);
    assert_eq!(segments.len(), 3);
    for (i, segment) in segments.iter().enumerate() {
        let (status, data) = get(&router, &format!("/{segment}")).await?;
        assert_eq!(status, StatusCode::OK);
        let parts = Part::unmarshal_all(&data)?;
        let track = parts
            .first()
            .and_then(|p| p.tracks.first())
            .context("empty segment")?;
        assert_eq!(track.base_time, i as u64 * 90000);
        assert_eq!(track.samples.len(), 1);
        assert_eq!(track.samples[0].duration, 90000);
        assert!(!track.samples[0].is_non_sync);
    }
    Ok(())
}

#[tokio::test]
async fn test_fmp4_reordered_frames() -> anyhow::Result<()> {
    let muxer = MuxerBuilder::new()
        .track(Track::new(h264()))
        .variant(MuxerVariant::Fmp4)
        .segment_count(3)
        .segment_min_duration(Duration::from_secs(1))
        .build();
    muxer.start().await?;
    let router = muxer.router();

    // decode order I0 P3 B1 B2, presentation order I0 B1 B2 P3
    let (ntp, _) = at(0);
    muxer.write_h264(0, ntp, 0, idr_with_params()).await?;
    for (poc, pts) in [(6, 9000), (2, 3000), (4, 6000)] {
        muxer.write_h264(0, ntp, pts, vec![p_slice(poc)]).await?;
    }
    write_idrs(&muxer, 1, 2).await?;

    let playlist = get_text(&router, "/stream.m3u8").await?;
    let segments = uris(&playlist);
    let (_, data) = get(&router, &format!("/{}", segments[0])).await?;
    let parts = Part::unmarshal_all(&data)?;
    let track = parts
        .first()
        .and_then(|p| p.tracks.first())
        .context("empty segment")?;
    assert_eq!(track.base_time, 0);
    assert_eq!(track.samples.len(), 4);
    assert!(track.samples.iter().all(|s| s.duration > 0));
    assert_eq!(track.duration(), 90000);

    let mut dts = track.base_time as i64;
    let mut pts = Vec::new();
    for sample in &track.samples {
        pts.push(dts + sample.pts_offset as i64);
        dts += sample.duration as i64;
    }
    assert_eq!(pts, vec![0, 9000, 3000, 6000]);
    assert!(track.samples[1].pts_offset > 0);
    assert!(track.samples[1].is_non_sync);
    Ok(())
}

#[tokio::test]
async fn test_low_latency_playlist() -> anyhow::Result<()> {
    init_test_tracing();
    let muxer = MuxerBuilder::new()
        .track(Track::new(h264()))
        .variant(MuxerVariant::LowLatency)
        .build();
    muxer.start().await?;
    let router = muxer.router();

    // nothing is served before the first segment
    let early = tokio::time::timeout(Duration::from_millis(100), get(&router, "/stream.m3u8"));
    assert!(early.await.is_err());

    write_idrs(&muxer, 0, 2).await?;

    let playlist = get_text(&router, "/stream.m3u8").await?;
    assert!(playlist.contains("#EXT-X-VERSION:9\n"), "{playlist}");
    assert!(playlist.contains("#EXT-X-MEDIA-SEQUENCE:2\n"), "{playlist}");
    assert_eq!(playlist.matches("#EXT-X-GAP\n").count(), 5);
    assert!(playlist.contains("#EXT-X-SERVER-CONTROL:CAN-BLOCK-RELOAD=YES"));
    assert!(playlist.contains("#EXT-X-PART:"), "{playlist}");
    assert!(playlist.contains("#EXT-X-PRELOAD-HINT:TYPE=PART"), "{playlist}");

    let (status, _) = get(&router, "/stream.m3u8?_HLS_msn=20").await?;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let (status, _) = get(&router, "/stream.m3u8?_HLS_part=1").await?;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    // segment 9 is being written, the request blocks until it is done
    let blocked = tokio::spawn({
        let router = router.clone();
        async move { get_text(&router, "/stream.m3u8?_HLS_msn=9").await }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!blocked.is_finished());

    write_idrs(&muxer, 3, 3).await?;
    let playlist = tokio::time::timeout(Duration::from_secs(5), blocked).await???;
    assert!(playlist.contains("#EXT-X-MEDIA-SEQUENCE:3\n"), "{playlist}");
    assert_eq!(playlist.matches("#EXT-X-GAP\n").count(), 4);

    // requests still waiting are answered once the muxer closes
    let waiting = tokio::spawn({
        let router = router.clone();
        async move { get(&router, "/stream.m3u8?_HLS_msn=11").await }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    muxer.close().await;
    let (status, _) = tokio::time::timeout(Duration::from_secs(5), waiting).await???;
    assert_eq!(status, StatusCode::NOT_FOUND);
    Ok(())
}

#[tokio::test]
async fn test_audio_rendition() -> anyhow::Result<()> {
    let aac = Codec::Mpeg4Audio(hlskit::codecs::AudioSpecificConfig {
        object_type: 2,
        sample_rate: 48000,
        channel_count: 2,
    });
    let muxer = MuxerBuilder::new()
        .track(Track::new(h264()))
        .track(Track::new(aac).with_name("English").with_language("en"))
        .variant(MuxerVariant::Fmp4)
        .segment_count(3)
        .build();
    muxer.start().await?;
    let router = muxer.router();

    for second in 0..=3 {
        let (ntp, pts) = at(second);
        muxer.write_h264(0, ntp, pts, idr_with_params()).await?;
        let aus = (0..47).map(|_| Bytes::from_static(&[0x21, 0x10])).collect();
        muxer
            .write_mpeg4audio(1, ntp, second * 48000, aus)
            .await?;
    }

    let multivariant = get_text(&router, "/index.m3u8").await?;
    assert!(multivariant.contains("TYPE=AUDIO"), "{multivariant}");
    assert!(multivariant.contains("GROUP-ID=\"audio\""), "{multivariant}");
    assert!(multivariant.contains("NAME=\"English\""), "{multivariant}");
    assert!(multivariant.contains("URI=\"rendition1.m3u8\""), "{multivariant}");
    assert!(multivariant.contains("AUDIO=\"audio\""), "{multivariant}");
    assert!(multivariant.contains("mp4a.40.2"), "{multivariant}");

    let playlist = get_text(&router, "/rendition1.m3u8").await?;
    assert!(playlist.contains("#EXT-X-MAP:URI=\"rendition1_init.mp4\"\n"), "{playlist}");
    Ok(())
}
