use bytes::{Bytes, BytesMut};

use super::{SegmentFile, StorageReader};
use crate::error::HlsResult;

/// A file kept in RAM. Each finished part is frozen into its own buffer, the
/// whole file is read by joining them.
#[derive(Default)]
pub struct MemoryFile {
    parts: Vec<Bytes>,
    current: BytesMut,
    size: u64,
}

impl MemoryFile {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SegmentFile for MemoryFile {
    async fn write(&mut self, data: &[u8]) -> HlsResult<()> {
        self.current.extend_from_slice(data);
        self.size += data.len() as u64;
        Ok(())
    }

    async fn finish_part(&mut self) -> HlsResult<()> {
        let part = self.current.split().freeze();
        self.parts.push(part);
        Ok(())
    }

    async fn finalize(&mut self) -> HlsResult<()> {
        if !self.current.is_empty() {
            self.finish_part().await?;
        }
        Ok(())
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn reader(&self) -> StorageReader {
        StorageReader::Memory(self.parts.clone())
    }

    fn part_reader(&self, index: usize) -> Option<StorageReader> {
        self.parts
            .get(index)
            .map(|part| StorageReader::Memory(vec![part.clone()]))
    }

    async fn remove(self) -> HlsResult<()> {
        Ok(())
    }
}
