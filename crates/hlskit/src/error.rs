use thiserror::Error;

#[derive(Error, Debug)]
pub enum HlsError {
    #[error("bad status code: {0}")]
    HttpError(reqwest::StatusCode),

    #[error("Invalid m3u8 file: {0}")]
    M3u8ParseError(String),

    #[error("invalid TLS fingerprint: {0}")]
    InvalidFingerprint(String),

    #[error(transparent)]
    TlsError(#[from] rustls::Error),

    #[error(transparent)]
    IOError(#[from] std::io::Error),

    #[error(transparent)]
    UrlParseError(#[from] url::ParseError),

    #[error(transparent)]
    RequestError(#[from] reqwest::Error),

    #[error("fMP4 error: {0}")]
    Fmp4Error(#[from] hlskit_fmp4::Fmp4Error),

    #[error("{0}")]
    MpegTsError(#[from] hlskit_mpegts::TsError),

    #[error("invalid {codec} bitstream: {reason}")]
    CodecError {
        codec: &'static str,
        reason: String,
    },

    #[error("unsupported codec: {0}")]
    UnsupportedCodec(String),

    #[error("no variants with supported codecs found")]
    NoSupportedVariants,

    #[error("no supported tracks found")]
    NoSupportedTracks,

    #[error("there aren't enough segments to start the playback")]
    NotEnoughSegments,

    #[error("no segments found")]
    NoSegments,

    #[error("next segment not found or not ready yet")]
    NextSegmentNotFound,

    #[error("playback is too late")]
    PlaybackTooLate,

    #[error("stream has ended")]
    StreamEnded,

    #[error("difference between DTS and RTC is too big")]
    DtsRtcDiffTooBig,

    #[error("PTS is missing")]
    PtsMissing,

    #[error("could not find data of leading track")]
    LeadingTrackDataMissing,

    #[error("too many part tracks at once")]
    TooManyPartTracks,

    #[error("too many tracks in MPEG-TS stream")]
    TooManyTracks,

    #[error("rendition time-sync type mismatch")]
    TimeSyncMismatch,

    #[error("init segment does not contain track {0}")]
    UnknownTrack(u32),

    #[error("reached maximum segment size")]
    MaximumSegmentSize,

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("track {0} does not exist or has a different codec")]
    InvalidTrack(usize),

    #[error("not started")]
    NotStarted,

    #[error("terminated")]
    Terminated,
}

impl HlsError {
    pub(crate) fn codec(codec: &'static str, reason: impl Into<String>) -> Self {
        Self::CodecError {
            codec,
            reason: reason.into(),
        }
    }
}

pub type HlsResult<T> = Result<T, HlsError>;
