//! MPEG-TS helpers on top of [`mpeg2ts`]: elementary track discovery, PES
//! reassembly for reading, and PES packetization with PCR for writing.

pub mod adts;
mod error;
mod reader;
mod writer;

pub use error::{TsError, TsResult};
pub use reader::{Demuxer, Pes};
pub use writer::Writer;

/// Clock rate of PTS, DTS and PCR base values.
pub const CLOCK_RATE: u32 = 90000;

/// Timestamps wrap around after 33 bits.
pub const TIMESTAMP_MASK: u64 = (1 << 33) - 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Codec {
    H264,
    H265,
    Mpeg4Audio,
    Mpeg1Audio,
    Klv,
    Unsupported(u8),
}

impl Codec {
    pub fn from_stream_type(stream_type: u8) -> Self {
        match stream_type {
            0x1B => Codec::H264,
            0x24 => Codec::H265,
            0x0F => Codec::Mpeg4Audio,
            0x03 | 0x04 => Codec::Mpeg1Audio,
            0x06 | 0x15 => Codec::Klv,
            other => Codec::Unsupported(other),
        }
    }

    pub fn is_video(&self) -> bool {
        matches!(self, Codec::H264 | Codec::H265)
    }

    fn stream_id(&self) -> u8 {
        match self {
            Codec::H264 | Codec::H265 => 0xE0,
            Codec::Mpeg4Audio | Codec::Mpeg1Audio => 0xC0,
            Codec::Klv | Codec::Unsupported(_) => 0xBD,
        }
    }
}

/// An elementary stream listed in the PMT.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Track {
    pub pid: u16,
    pub codec: Codec,
}
