//! HTTP Live Streaming in both directions.
//!
//! [`client::Client`] reads a live or on-demand stream, demuxes MPEG-TS or
//! fragmented MP4 segments and hands synchronized samples to callbacks.
//! [`muxer::Muxer`] turns encoded media into MPEG-TS, fMP4 or Low-Latency HLS
//! segments and serves them over HTTP.

pub mod client;
mod clock;
pub mod codecs;
pub mod error;
pub mod muxer;
pub mod storage;
mod track;

pub use client::{Client, ClientBuilder, ClientTrack};
pub use codecs::Codec;
pub use error::{HlsError, HlsResult};
pub use muxer::{Muxer, MuxerBuilder, MuxerConfig, MuxerVariant};
pub use track::Track;
