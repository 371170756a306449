#[derive(thiserror::Error, Debug)]
pub enum TsError {
    #[error("MPEG-TS error: {0}")]
    MpegTsError(#[from] mpeg2ts::Error),

    #[error("PMT not found")]
    PmtNotFound,

    #[error("PID {0} is not a track of this stream")]
    UnknownPid(u16),

    #[error("codec {0:?} cannot be written to MPEG-TS")]
    UnsupportedCodec(crate::Codec),

    #[error("invalid ADTS: {0}")]
    InvalidAdts(&'static str),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

pub type TsResult<T> = Result<T, TsError>;
