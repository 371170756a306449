use std::{future::IntoFuture, net::SocketAddr, path::PathBuf, sync::Arc};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use clap::Args;
use hlskit::{
    client::TrackCallbacks, ClientBuilder, ClientTrack, Codec, HlsError, HlsResult, Muxer,
    MuxerBuilder, MuxerConfig, MuxerVariant, Track,
};
use tokio::{
    net::TcpListener,
    sync::{mpsc, oneshot},
};

fn parse_variant(value: &str) -> Result<MuxerVariant, String> {
    serde_json::from_value(serde_json::Value::String(value.to_string()))
        .map_err(|_| format!("unknown variant {value}, expected mpeg-ts, fmp4 or low-latency"))
}

#[derive(Args, Debug)]
pub struct ServeCommand {
    /// Address to serve the relayed stream on
    #[clap(short, long, default_value = "127.0.0.1:8888", env = "HLSKIT_LISTEN")]
    listen: SocketAddr,

    /// Muxer configuration file, in JSON
    #[clap(short, long, env = "HLSKIT_CONFIG")]
    config: Option<PathBuf>,

    /// Muxer variant: mpeg-ts, fmp4 or low-latency
    #[clap(long, value_parser = parse_variant)]
    variant: Option<MuxerVariant>,

    /// Store segments in this directory instead of RAM
    #[clap(long)]
    directory: Option<PathBuf>,

    /// SHA-256 fingerprint of the upstream server certificate, in hex
    #[clap(long, env = "HLSKIT_TLS_FINGERPRINT")]
    fingerprint: Option<String>,

    /// Upstream playlist URL
    url: String,
}

enum Payload {
    Av1(Vec<Bytes>),
    Vp9(Bytes),
    H264(Vec<Bytes>),
    H265(Vec<Bytes>),
    Opus(Vec<Bytes>),
    Mpeg4Audio(Vec<Bytes>),
    Mpeg1Audio(Vec<Bytes>),
    Klv(Bytes),
}

/// A sample received by the client, on its way to the muxer.
struct Relayed {
    track: usize,
    ntp: DateTime<Utc>,
    pts: i64,
    payload: Payload,
}

fn can_mux(variant: MuxerVariant, codec: &Codec) -> bool {
    match variant {
        MuxerVariant::MpegTs => codec.ts_codec().is_some(),
        MuxerVariant::Fmp4 | MuxerVariant::LowLatency => *codec != Codec::Klv,
    }
}

fn relay(
    callbacks: &mut TrackCallbacks,
    track: Arc<ClientTrack>,
    muxer_track: usize,
    tx: mpsc::UnboundedSender<Relayed>,
) -> HlsResult<()> {
    let send = {
        let track = track.clone();
        move |pts: i64, payload: Payload| {
            tx.send(Relayed {
                track: muxer_track,
                ntp: track.absolute_time().unwrap_or_else(Utc::now),
                pts,
                payload,
            })
            .map_err(|_| HlsError::Terminated)
        }
    };

    match track.codec() {
        Codec::Av1 { .. } => {
            callbacks.on_data_av1(&track, move |pts, obus| send(pts, Payload::Av1(obus)))
        }
        Codec::Vp9(_) => {
            callbacks.on_data_vp9(&track, move |pts, frame| send(pts, Payload::Vp9(frame)))
        }
        Codec::H264 { .. } => {
            callbacks.on_data_h26x(&track, move |pts, _, au| send(pts, Payload::H264(au)))
        }
        Codec::H265 { .. } => {
            callbacks.on_data_h26x(&track, move |pts, _, au| send(pts, Payload::H265(au)))
        }
        Codec::Opus { .. } => {
            callbacks.on_data_opus(&track, move |pts, packets| send(pts, Payload::Opus(packets)))
        }
        Codec::Mpeg4Audio(_) => callbacks
            .on_data_mpeg4audio(&track, move |pts, aus| send(pts, Payload::Mpeg4Audio(aus))),
        Codec::Mpeg1Audio => callbacks
            .on_data_mpeg1audio(&track, move |pts, frames| send(pts, Payload::Mpeg1Audio(frames))),
        Codec::Klv => {
            callbacks.on_data_klv(&track, move |pts, unit| send(pts, Payload::Klv(unit)))
        }
    }
}

async fn write(muxer: &Muxer, sample: Relayed) -> HlsResult<()> {
    let Relayed {
        track,
        ntp,
        pts,
        payload,
    } = sample;
    match payload {
        Payload::Av1(obus) => muxer.write_av1(track, ntp, pts, obus).await,
        Payload::Vp9(frame) => muxer.write_vp9(track, ntp, pts, frame).await,
        Payload::H264(au) => muxer.write_h264(track, ntp, pts, au).await,
        Payload::H265(au) => muxer.write_h265(track, ntp, pts, au).await,
        Payload::Opus(packets) => muxer.write_opus(track, ntp, pts, packets).await,
        Payload::Mpeg4Audio(aus) => muxer.write_mpeg4audio(track, ntp, pts, aus).await,
        Payload::Mpeg1Audio(frames) => muxer.write_mpeg1audio(track, ntp, pts, frames).await,
        Payload::Klv(unit) => muxer.write_klv(track, ntp, pts, unit).await,
    }
}

impl ServeCommand {
    async fn muxer_config(&self) -> anyhow::Result<MuxerConfig> {
        let mut config = match &self.config {
            Some(path) => serde_json::from_str(&tokio::fs::read_to_string(path).await?)?,
            None => MuxerConfig::default(),
        };
        if let Some(variant) = self.variant {
            config.variant = variant;
        }
        if let Some(directory) = &self.directory {
            config.directory = Some(directory.clone());
        }
        Ok(config)
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let config = self.muxer_config().await?;
        let variant = config.variant;

        let (tracks_tx, tracks_rx) = oneshot::channel::<Vec<Track>>();
        let (samples_tx, mut samples_rx) = mpsc::unbounded_channel();

        let mut builder = ClientBuilder::new(&self.url);
        if let Some(fingerprint) = &self.fingerprint {
            builder = builder.tls_fingerprint(fingerprint);
        }
        let mut client = builder
            .on_tracks(move |callbacks| {
                let mut muxed = Vec::new();
                let mut has_video = false;
                for track in callbacks.tracks().to_vec() {
                    let codec = track.codec();
                    if !can_mux(variant, codec) || (codec.is_video() && has_video) {
                        log::warn!("track {} ({}) is not relayed", track.index(), codec.name());
                        continue;
                    }
                    has_video |= codec.is_video();
                    muxed.push(track.track().clone());
                    relay(callbacks, track, muxed.len() - 1, samples_tx.clone())?;
                }
                let _ = tracks_tx.send(muxed);
                Ok(())
            })
            .build()?;
        client.start()?;

        let tracks = tokio::select! {
            tracks = tracks_rx => tracks?,
            err = client.wait() => return Err(err.into()),
        };
        let muxer = tracks
            .into_iter()
            .fold(MuxerBuilder::new().config(config), |builder, track| builder.track(track))
            .build();
        muxer.start().await?;

        let listener = TcpListener::bind(self.listen).await?;
        log::info!("serving http://{}/index.m3u8", self.listen);

        let writer = {
            let muxer = muxer.clone();
            async move {
                while let Some(sample) = samples_rx.recv().await {
                    write(&muxer, sample).await?;
                }
                anyhow::Ok(())
            }
        };

        let result = tokio::select! {
            res = axum::serve(listener, muxer.router()).into_future() => res.map_err(Into::into),
            res = writer => res,
            err = client.wait() => Err(err.into()),
            _ = tokio::signal::ctrl_c() => Ok(()),
        };

        client.close().await;
        muxer.close().await;
        result
    }
}
