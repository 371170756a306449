use std::sync::Arc;

use bytes::Bytes;
use clap::Args;
use hlskit::{client::TrackCallbacks, ClientBuilder, ClientTrack, Codec, HlsError, HlsResult};
use tokio::sync::mpsc;

#[derive(Args, Debug)]
pub struct ProbeCommand {
    /// SHA-256 fingerprint of the server certificate, in hex
    #[clap(long, env = "HLSKIT_TLS_FINGERPRINT")]
    fingerprint: Option<String>,

    /// Exit after printing this many samples
    #[clap(short = 'n', long)]
    count: Option<u64>,

    /// Playlist URL
    url: String,
}

struct SampleInfo {
    track: usize,
    pts: i64,
    dts: Option<i64>,
    size: usize,
    absolute_time: Option<String>,
}

fn total(units: &[Bytes]) -> usize {
    units.iter().map(|u| u.len()).sum()
}

fn register(
    callbacks: &mut TrackCallbacks,
    track: Arc<ClientTrack>,
    tx: mpsc::UnboundedSender<SampleInfo>,
) -> HlsResult<()> {
    let index = track.index();
    let report = {
        let track = track.clone();
        move |pts: i64, dts: Option<i64>, size: usize| {
            tx.send(SampleInfo {
                track: index,
                pts,
                dts,
                size,
                absolute_time: track.absolute_time().map(|t| t.to_rfc3339()),
            })
            .map_err(|_| HlsError::Terminated)
        }
    };
    match track.codec() {
        Codec::H264 { .. } | Codec::H265 { .. } => callbacks
            .on_data_h26x(&track, move |pts, dts, au| report(pts, Some(dts), total(&au))),
        Codec::Av1 { .. } => {
            callbacks.on_data_av1(&track, move |pts, obus| report(pts, None, total(&obus)))
        }
        Codec::Vp9(_) => {
            callbacks.on_data_vp9(&track, move |pts, frame| report(pts, None, frame.len()))
        }
        Codec::Opus { .. } => {
            callbacks.on_data_opus(&track, move |pts, packets| report(pts, None, total(&packets)))
        }
        Codec::Mpeg4Audio(_) => {
            callbacks.on_data_mpeg4audio(&track, move |pts, aus| report(pts, None, total(&aus)))
        }
        Codec::Mpeg1Audio => callbacks
            .on_data_mpeg1audio(&track, move |pts, frames| report(pts, None, total(&frames))),
        Codec::Klv => {
            callbacks.on_data_klv(&track, move |pts, unit| report(pts, None, unit.len()))
        }
    }
}

impl ProbeCommand {
    pub async fn run(self) -> anyhow::Result<()> {
        let (tx, mut rx) = mpsc::unbounded_channel();

        let mut builder = ClientBuilder::new(&self.url);
        if let Some(fingerprint) = &self.fingerprint {
            builder = builder.tls_fingerprint(fingerprint);
        }
        let mut client = builder
            .on_tracks(move |callbacks| {
                for track in callbacks.tracks().to_vec() {
                    let t = track.track();
                    println!(
                        "track {}: {} ({}), clock rate {}{}",
                        track.index(),
                        track.codec().name(),
                        track.codec().codec_string().unwrap_or_default(),
                        t.clock_rate,
                        t.name.as_deref().map(|n| format!(", {n}")).unwrap_or_default(),
                    );
                    register(callbacks, track, tx.clone())?;
                }
                Ok(())
            })
            .build()?;
        client.start()?;

        let mut printed = 0;
        let result = loop {
            tokio::select! {
                sample = rx.recv() => {
                    let Some(sample) = sample else {
                        break Ok(());
                    };
                    println!(
                        "track {} pts {} dts {} size {} time {}",
                        sample.track,
                        sample.pts,
                        sample.dts.unwrap_or(sample.pts),
                        sample.size,
                        sample.absolute_time.as_deref().unwrap_or("-"),
                    );
                    printed += 1;
                    if self.count.is_some_and(|count| printed >= count) {
                        break Ok(());
                    }
                }
                err = client.wait() => break Err(err.into()),
                _ = tokio::signal::ctrl_c() => break Ok(()),
            }
        };

        client.close().await;
        result
    }
}
