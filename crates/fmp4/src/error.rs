#[derive(thiserror::Error, Debug)]
pub enum Fmp4Error {
    #[error("box {0} is truncated")]
    Truncated(String),

    #[error("box {kind} has invalid size {size}")]
    InvalidSize { kind: String, size: u64 },

    #[error("required box {0} not found")]
    MissingBox(&'static str),

    #[error("unsupported {kind} version {version}")]
    UnsupportedVersion { kind: &'static str, version: u8 },

    #[error("sample data of track {0} is out of bounds")]
    DataOutOfBounds(u32),

    #[error("sample entry {0} is not supported")]
    UnsupportedSampleEntry(String),
}

pub type Fmp4Result<T> = Result<T, Fmp4Error>;
