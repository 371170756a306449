use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::{
    error::{HlsError, HlsResult},
    storage::{SegmentFile, StorageFile, StorageReader},
};

/// A finished LL-HLS part.
#[derive(Debug, Clone)]
pub(crate) struct MuxerPart {
    pub(crate) id: u64,
    pub(crate) name: String,
    pub(crate) duration: Duration,
    pub(crate) independent: bool,
    /// Position of the part inside its segment.
    pub(crate) index: usize,
}

/// The segment being written.
pub(crate) struct MuxerSegment {
    pub(crate) sequence: u64,
    pub(crate) name: String,
    /// Elapsed nanoseconds at the first sample.
    pub(crate) start_dts: i64,
    pub(crate) ntp: DateTime<Utc>,
    pub(crate) parts: Vec<MuxerPart>,
    /// Samples of the leading track, used for the frame rate.
    pub(crate) leading_samples: u32,
    file: StorageFile,
    max_size: u64,
    size: u64,
}

impl MuxerSegment {
    pub(crate) fn new(
        file: StorageFile,
        sequence: u64,
        name: String,
        start_dts: i64,
        ntp: DateTime<Utc>,
        max_size: u64,
    ) -> Self {
        Self {
            sequence,
            name,
            start_dts,
            ntp,
            parts: Vec::new(),
            leading_samples: 0,
            file,
            max_size,
            size: 0,
        }
    }

    /// Accounts for `len` more bytes. Fails without changing the size when
    /// the segment would grow beyond its maximum size.
    pub(crate) fn reserve(&mut self, len: u64) -> HlsResult<()> {
        if self.size + len > self.max_size {
            return Err(HlsError::MaximumSegmentSize);
        }
        self.size += len;
        Ok(())
    }

    /// Writes data already accounted for with [`Self::reserve`].
    pub(crate) async fn write(&mut self, data: &[u8]) -> HlsResult<()> {
        self.file.write(data).await
    }

    /// Accounts for and writes `data`.
    pub(crate) async fn append(&mut self, data: &[u8]) -> HlsResult<()> {
        self.reserve(data.len() as u64)?;
        self.file.write(data).await
    }

    pub(crate) async fn finish_part(&mut self, part: MuxerPart) -> HlsResult<()> {
        self.file.finish_part().await?;
        self.parts.push(part);
        Ok(())
    }

    pub(crate) fn part_reader(&self, index: usize) -> Option<StorageReader> {
        self.file.part_reader(index)
    }

    pub(crate) async fn finalize(mut self, end_dts: i64) -> HlsResult<FinalizedSegment> {
        self.file.finalize().await?;
        let duration = Duration::from_nanos((end_dts - self.start_dts).max(0) as u64);
        log::debug!(
            "segment {} finalized: {} bytes, {:?}",
            self.name,
            self.file.size(),
            duration
        );
        Ok(FinalizedSegment {
            sequence: self.sequence,
            name: self.name,
            ntp: self.ntp,
            duration,
            size: self.file.size(),
            parts: self.parts,
            leading_samples: self.leading_samples,
            file: self.file,
        })
    }
}

/// A read-only segment of the playlist window.
pub(crate) struct FinalizedSegment {
    pub(crate) sequence: u64,
    pub(crate) name: String,
    pub(crate) ntp: DateTime<Utc>,
    pub(crate) duration: Duration,
    pub(crate) size: u64,
    pub(crate) parts: Vec<MuxerPart>,
    pub(crate) leading_samples: u32,
    file: StorageFile,
}

impl FinalizedSegment {
    pub(crate) fn reader(&self) -> StorageReader {
        self.file.reader()
    }

    pub(crate) fn part_reader(&self, index: usize) -> Option<StorageReader> {
        self.file.part_reader(index)
    }

    pub(crate) async fn remove(self) -> HlsResult<()> {
        self.file.remove().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Storage;

    #[tokio::test]
    async fn test_maximum_size() -> anyhow::Result<()> {
        let file = Storage::memory().allocate("seg0.ts").await?;
        let mut segment = MuxerSegment::new(file, 0, "seg0.ts".into(), 0, Utc::now(), 10);

        segment.append(&[0; 8]).await?;
        let err = segment.append(&[0; 3]).await.unwrap_err();
        assert!(err.to_string().contains("maximum segment size"));

        segment.append(&[0; 2]).await?;
        let segment = segment.finalize(2_000_000_000).await?;
        assert_eq!(segment.size, 10);
        assert_eq!(segment.duration, Duration::from_secs(2));
        assert_eq!(segment.reader().read().await?.len(), 10);
        Ok(())
    }
}
