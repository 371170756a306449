//! Fragmented MP4 boxes used by HLS: the initialization section (`ftyp` +
//! `moov`) and media parts (`moof` + `mdat`).
//!
//! Sample entries are kept codec agnostic. Codec specific configuration boxes
//! (`avcC`, `hvcC`, `esds`, ...) are carried as opaque payloads so that the
//! caller decides how to encode and decode them.

mod error;
mod init;
mod part;
mod reader;
mod writer;

pub use error::{Fmp4Error, Fmp4Result};
pub use init::{ConfigBox, Init, InitTrack, SampleEntry};
pub use part::{Part, PartTrack, Sample, PART_OVERHEAD, SAMPLE_OVERHEAD, TRACK_OVERHEAD};
pub use reader::{BoxReader, RawBox};
