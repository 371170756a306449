use std::time::Duration;

use anyhow::Context;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use hlskit::{codecs::AudioSpecificConfig, ClientBuilder, Codec, HlsError};
use hlskit_fmp4::{Init, InitTrack, Part, PartTrack, Sample};
use hlskit_mpegts::{adts::AdtsPacket, Track as TsTrack, Writer};
use tokio::sync::mpsc;
use wiremock::{
    matchers::{method, path},
    Mock, MockServer, ResponseTemplate,
};

use crate::{h264, init_test_tracing, IDR, PPS, SPS};

trait HlsMock {
    async fn mock<B>(&self, mock_path: &str, body: B) -> &Self
    where
        B: Into<Vec<u8>>;

    async fn mock_once<B>(&self, mock_path: &str, body: B) -> &Self
    where
        B: Into<Vec<u8>>;
}

impl HlsMock for MockServer {
    async fn mock<B>(&self, mock_path: &str, body: B) -> &Self
    where
        B: Into<Vec<u8>>,
    {
        Mock::given(method("GET"))
            .and(path(mock_path))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(body))
            .mount(self)
            .await;
        self
    }

    async fn mock_once<B>(&self, mock_path: &str, body: B) -> &Self
    where
        B: Into<Vec<u8>>,
    {
        Mock::given(method("GET"))
            .and(path(mock_path))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(body))
            .up_to_n_times(1)
            .mount(self)
            .await;
        self
    }
}

fn avcc(nalu: &[u8]) -> Bytes {
    let mut data = (nalu.len() as u32).to_be_bytes().to_vec();
    data.extend_from_slice(nalu);
    Bytes::from(data)
}

fn fmp4_init() -> anyhow::Result<Vec<u8>> {
    Ok(Init {
        tracks: vec![InitTrack {
            id: 1,
            time_scale: 90000,
            sample_entry: h264().sample_entry(1)?,
        }],
    }
    .marshal())
}

/// A segment holding one IDR frame lasting a second.
fn fmp4_segment(sequence_number: u32, base_time: u64, pts_offset: i32) -> Vec<u8> {
    Part {
        sequence_number,
        tracks: vec![PartTrack {
            id: 1,
            base_time,
            samples: vec![Sample {
                duration: 90000,
                pts_offset,
                is_non_sync: false,
                payload: avcc(&IDR),
            }],
        }],
    }
    .marshal()
}

fn annexb(nalus: &[&[u8]]) -> Vec<u8> {
    let mut au = Vec::new();
    for nalu in nalus {
        au.extend_from_slice(&[0, 0, 0, 1]);
        au.extend_from_slice(nalu);
    }
    au
}

fn ts_writer() -> Writer {
    Writer::new(vec![TsTrack {
        pid: 0x100,
        codec: hlskit_mpegts::Codec::H264,
    }])
}

/// Tables and an IDR frame with its parameters at `pts`.
fn ts_first_segment(writer: &mut Writer, pts: u64) -> anyhow::Result<Vec<u8>> {
    let mut out = Vec::new();
    writer.write_tables(&mut out)?;
    writer.write_pes(&mut out, 0x100, pts, pts, true, &annexb(&[&SPS, &PPS, &IDR]))?;
    Ok(out)
}

fn ts_segment() -> anyhow::Result<Vec<u8>> {
    ts_first_segment(&mut ts_writer(), 90000)
}

/// A TS packet starting a video PES whose header carries no timestamps.
fn ts_packet_without_pts() -> Vec<u8> {
    let mut packet = vec![0x47, 0x41, 0x00, 0x10];
    packet.extend_from_slice(&[0, 0, 1, 0xE0, 0, 0, 0x80, 0x00, 0x00]);
    packet.resize(188, 0xFF);
    packet
}

fn vod_playlist(segments: &[&str]) -> String {
    let mut text =
        "#EXTM3U\n#EXT-X-VERSION:3\n#EXT-X-TARGETDURATION:1\n#EXT-X-PLAYLIST-TYPE:VOD\n".to_string();
    for segment in segments {
        text.push_str(&format!("#EXTINF:1,\n{segment}\n"));
    }
    text.push_str("#EXT-X-ENDLIST\n");
    text
}

fn aac() -> Codec {
    Codec::Mpeg4Audio(AudioSpecificConfig {
        object_type: 2,
        sample_rate: 48000,
        channel_count: 2,
    })
}

const MULTIVARIANT: &str = "#EXTM3U
#EXT-X-MEDIA:TYPE=AUDIO,GROUP-ID=\"aac\",NAME=\"English\",LANGUAGE=\"en\",DEFAULT=YES,URI=\"audio.m3u8\"
#EXT-X-STREAM-INF:BANDWIDTH=1000000,CODECS=\"avc1.640028,mp4a.40.2\",AUDIO=\"aac\"
video.m3u8
";

const FMP4_VIDEO: &str = "#EXTM3U
#EXT-X-VERSION:7
#EXT-X-TARGETDURATION:1
#EXT-X-PLAYLIST-TYPE:VOD
#EXT-X-MAP:URI=\"init.mp4\"
#EXTINF:1,
segment1.mp4
#EXT-X-ENDLIST
";

fn live_playlist(media_sequence: u64, count: usize) -> String {
    let mut text = format!(
        "#EXTM3U\n#EXT-X-VERSION:3\n#EXT-X-TARGETDURATION:2\n#EXT-X-MEDIA-SEQUENCE:{media_sequence}\n"
    );
    for _ in 0..count {
        text.push_str("#EXTINF:2,\nsegment.ts\n");
    }
    text
}

#[tokio::test]
async fn test_fmp4_vod_with_date_time() -> anyhow::Result<()> {
    init_test_tracing();
    let server = MockServer::start().await;
    server
        .mock(
            "/index.m3u8",
            "#EXTM3U
#EXT-X-VERSION:7
#EXT-X-TARGETDURATION:2
#EXT-X-PLAYLIST-TYPE:VOD
#EXT-X-MAP:URI=\"init.mp4\"
#EXT-X-PROGRAM-DATE-TIME:2015-02-05T01:02:02Z
#EXTINF:1,
segment1.mp4
#EXTINF:1,
segment2.mp4
#EXT-X-ENDLIST
",
        )
        .await
        .mock("/init.mp4", fmp4_init()?)
        .await
        .mock("/segment1.mp4", fmp4_segment(1, 0, 180000))
        .await
        .mock("/segment2.mp4", fmp4_segment(2, 90000, 0))
        .await;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut client = ClientBuilder::new(format!("{}/index.m3u8", server.uri()))
        .on_tracks(move |callbacks| {
            assert_eq!(callbacks.tracks().len(), 1);
            let track = callbacks.tracks()[0].clone();
            assert_eq!(track.codec(), &h264());
            let clock = track.clone();
            callbacks.on_data_h26x(&track, move |pts, dts, units| {
                let _ = tx.send((pts, dts, units, clock.absolute_time()));
                Ok(())
            })
        })
        .build()?;
    client.start()?;

    let (pts, dts, units, time) = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await?
        .context("no first sample")?;
    assert_eq!(pts, 180000);
    assert_eq!(dts, 0);
    assert_eq!(units, vec![Bytes::from_static(&IDR)]);
    assert_eq!(time, Some("2015-02-05T01:02:02Z".parse::<DateTime<Utc>>()?));

    let (pts, dts, _, time) = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await?
        .context("no second sample")?;
    assert_eq!((pts, dts), (90000, 90000));
    assert_eq!(time, None);

    client.close().await;
    Ok(())
}

#[tokio::test]
async fn test_not_enough_segments() -> anyhow::Result<()> {
    init_test_tracing();
    let server = MockServer::start().await;
    server.mock("/index.m3u8", live_playlist(0, 2)).await;

    let mut client = ClientBuilder::new(format!("{}/index.m3u8", server.uri())).build()?;
    client.start()?;
    let err = tokio::time::timeout(Duration::from_secs(5), client.wait()).await?;
    assert!(matches!(err, HlsError::NotEnoughSegments), "{err}");
    Ok(())
}

#[tokio::test]
async fn test_next_segment_not_found() -> anyhow::Result<()> {
    init_test_tracing();
    let server = MockServer::start().await;
    server
        .mock_once("/index.m3u8", live_playlist(0, 3))
        .await
        .mock("/index.m3u8", live_playlist(10, 3))
        .await
        .mock("/segment.ts", ts_segment()?)
        .await;

    let mut client = ClientBuilder::new(format!("{}/index.m3u8", server.uri())).build()?;
    client.start()?;
    let err = tokio::time::timeout(Duration::from_secs(5), client.wait()).await?;
    assert!(matches!(err, HlsError::NextSegmentNotFound), "{err}");
    Ok(())
}

#[tokio::test]
async fn test_missing_playlist() -> anyhow::Result<()> {
    init_test_tracing();
    let server = MockServer::start().await;

    let mut client = ClientBuilder::new(format!("{}/index.m3u8", server.uri())).build()?;
    client.start()?;
    let err = tokio::time::timeout(Duration::from_secs(5), client.wait()).await?;
    assert!(matches!(err, HlsError::HttpError(status) if status == 404), "{err}");
    Ok(())
}

#[tokio::test]
async fn test_wait_before_start() -> anyhow::Result<()> {
    let client = ClientBuilder::new("http://localhost/index.m3u8").build()?;
    assert!(matches!(client.wait().await, HlsError::NotStarted));
    Ok(())
}

#[tokio::test]
async fn test_mpegts_segment_without_tables() -> anyhow::Result<()> {
    init_test_tracing();
    let mut writer = ts_writer();
    let first = ts_first_segment(&mut writer, 90000)?;
    // later segments rely on the tables of the first one
    let mut second = Vec::new();
    writer.write_pes(&mut second, 0x100, 180000, 180000, true, &annexb(&[&IDR]))?;

    let server = MockServer::start().await;
    server
        .mock("/index.m3u8", vod_playlist(&["segment1.ts", "segment2.ts"]))
        .await
        .mock("/segment1.ts", first)
        .await
        .mock("/segment2.ts", second)
        .await;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut client = ClientBuilder::new(format!("{}/index.m3u8", server.uri()))
        .on_tracks(move |callbacks| {
            assert_eq!(callbacks.tracks().len(), 1);
            let track = callbacks.tracks()[0].clone();
            assert_eq!(track.codec(), &h264());
            callbacks.on_data_h26x(&track, move |pts, dts, units| {
                let _ = tx.send((pts, dts, units));
                Ok(())
            })
        })
        .build()?;
    client.start()?;

    for expected in [0, 90000] {
        let (pts, dts, units) = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await?
            .context("missing sample")?;
        assert_eq!((pts, dts), (expected, expected));
        assert!(units.contains(&Bytes::from_static(&IDR)));
    }

    client.close().await;
    Ok(())
}

#[tokio::test]
async fn test_mpegts_pts_missing() -> anyhow::Result<()> {
    init_test_tracing();
    let server = MockServer::start().await;
    server
        .mock("/index.m3u8", vod_playlist(&["segment1.ts", "segment2.ts"]))
        .await
        .mock("/segment1.ts", ts_segment()?)
        .await
        .mock("/segment2.ts", ts_packet_without_pts())
        .await;

    let mut client = ClientBuilder::new(format!("{}/index.m3u8", server.uri())).build()?;
    client.start()?;
    let err = tokio::time::timeout(Duration::from_secs(5), client.wait()).await?;
    assert!(matches!(err, HlsError::PtsMissing), "{err}");
    Ok(())
}

#[tokio::test]
async fn test_mpegts_leading_track_data_missing() -> anyhow::Result<()> {
    init_test_tracing();
    let mut writer = ts_writer();
    let first = ts_first_segment(&mut writer, 90000)?;
    let mut tables_only = Vec::new();
    writer.write_tables(&mut tables_only)?;

    let server = MockServer::start().await;
    server
        .mock("/index.m3u8", vod_playlist(&["segment1.ts", "segment2.ts"]))
        .await
        .mock("/segment1.ts", first)
        .await
        .mock("/segment2.ts", tables_only)
        .await;

    let mut client = ClientBuilder::new(format!("{}/index.m3u8", server.uri())).build()?;
    client.start()?;
    let err = tokio::time::timeout(Duration::from_secs(5), client.wait()).await?;
    assert!(matches!(err, HlsError::LeadingTrackDataMissing), "{err}");
    Ok(())
}

fn audio_init() -> anyhow::Result<Vec<u8>> {
    Ok(Init {
        tracks: vec![InitTrack {
            id: 1,
            time_scale: 48000,
            sample_entry: aac().sample_entry(1)?,
        }],
    }
    .marshal())
}

fn audio_playlist(init: Option<&str>, segment: &str) -> String {
    let map = init.map_or(String::new(), |uri| format!("#EXT-X-MAP:URI=\"{uri}\"\n"));
    format!(
        "#EXTM3U\n#EXT-X-VERSION:7\n#EXT-X-TARGETDURATION:1\n#EXT-X-PLAYLIST-TYPE:VOD\n\
         {map}#EXTINF:1,\n{segment}\n#EXT-X-ENDLIST\n"
    )
}

#[tokio::test]
async fn test_audio_rendition_shares_anchor() -> anyhow::Result<()> {
    init_test_tracing();
    // both renditions start one second after their clock origin
    let audio_segment = Part {
        sequence_number: 1,
        tracks: vec![PartTrack {
            id: 1,
            base_time: 48000,
            samples: vec![Sample {
                duration: 1024,
                pts_offset: 0,
                is_non_sync: false,
                payload: Bytes::from_static(&[0x21, 0x10]),
            }],
        }],
    }
    .marshal();

    let server = MockServer::start().await;
    server
        .mock("/index.m3u8", MULTIVARIANT)
        .await
        .mock("/video.m3u8", FMP4_VIDEO)
        .await
        .mock("/init.mp4", fmp4_init()?)
        .await
        .mock("/segment1.mp4", fmp4_segment(1, 90000, 0))
        .await
        .mock("/audio.m3u8", audio_playlist(Some("audio_init.mp4"), "audio1.mp4"))
        .await
        .mock("/audio_init.mp4", audio_init()?)
        .await
        .mock("/audio1.mp4", audio_segment)
        .await;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut client = ClientBuilder::new(format!("{}/index.m3u8", server.uri()))
        .on_tracks(move |callbacks| {
            let tracks = callbacks.tracks().to_vec();
            assert_eq!(tracks.len(), 2);
            for track in tracks {
                let tx = tx.clone();
                if track.codec() == &h264() {
                    callbacks.on_data_h26x(&track, move |pts, _, _| {
                        let _ = tx.send(("video", pts));
                        Ok(())
                    })?;
                } else {
                    assert_eq!(track.codec(), &aac());
                    assert_eq!(track.track().name.as_deref(), Some("English"));
                    assert_eq!(track.track().language.as_deref(), Some("en"));
                    callbacks.on_data_mpeg4audio(&track, move |pts, aus| {
                        assert_eq!(aus, vec![Bytes::from_static(&[0x21, 0x10])]);
                        let _ = tx.send(("audio", pts));
                        Ok(())
                    })?;
                }
            }
            Ok(())
        })
        .build()?;
    client.start()?;

    let mut received = Vec::new();
    for _ in 0..2 {
        let sample = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await?
            .context("missing sample")?;
        received.push(sample);
    }
    received.sort_unstable();
    assert_eq!(received, vec![("audio", 0), ("video", 0)]);

    client.close().await;
    Ok(())
}

#[tokio::test]
async fn test_rendition_time_sync_mismatch() -> anyhow::Result<()> {
    init_test_tracing();
    let mut writer = Writer::new(vec![TsTrack {
        pid: 0x101,
        codec: hlskit_mpegts::Codec::Mpeg4Audio,
    }]);
    let frame = hlskit_mpegts::adts::encode(&[AdtsPacket {
        object_type: 2,
        sample_rate_index: 3,
        channel_config: 2,
        au: vec![0x21, 0x10],
    }])?;
    let mut audio_segment = Vec::new();
    writer.write_tables(&mut audio_segment)?;
    writer.write_pes(&mut audio_segment, 0x101, 90000, 90000, true, &frame)?;

    // fMP4 video leads, the MPEG-TS audio can't follow its anchor
    let server = MockServer::start().await;
    server
        .mock("/index.m3u8", MULTIVARIANT)
        .await
        .mock("/video.m3u8", FMP4_VIDEO)
        .await
        .mock("/init.mp4", fmp4_init()?)
        .await
        .mock("/segment1.mp4", fmp4_segment(1, 90000, 0))
        .await
        .mock("/audio.m3u8", audio_playlist(None, "audio1.ts"))
        .await
        .mock("/audio1.ts", audio_segment)
        .await;

    let mut client = ClientBuilder::new(format!("{}/index.m3u8", server.uri())).build()?;
    client.start()?;
    let err = tokio::time::timeout(Duration::from_secs(5), client.wait()).await?;
    assert!(matches!(err, HlsError::TimeSyncMismatch), "{err}");
    Ok(())
}
