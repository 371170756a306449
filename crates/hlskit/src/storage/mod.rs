//! Storage of muxed segments, in memory or on disk.
//!
//! A file is written as a sequence of parts. Parts are readable as soon as
//! they are finished, the whole file once it is finalized.

pub mod disk;
pub mod memory;

use std::{future::Future, ops::Range, path::PathBuf};

use bytes::{Bytes, BytesMut};

use crate::error::HlsResult;

/// A storage file being written part by part.
pub trait SegmentFile: Send + Sync + 'static {
    /// Appends data to the current part.
    fn write(&mut self, data: &[u8]) -> impl Future<Output = HlsResult<()>> + Send;

    /// Closes the current part. Following writes start a new one.
    fn finish_part(&mut self) -> impl Future<Output = HlsResult<()>> + Send;

    /// Closes the last part and makes the file read-only.
    fn finalize(&mut self) -> impl Future<Output = HlsResult<()>> + Send;

    /// Bytes written so far.
    fn size(&self) -> u64;

    /// Reader of the whole file. Only meaningful after [`Self::finalize`].
    fn reader(&self) -> StorageReader;

    /// Reader of a finished part.
    fn part_reader(&self, index: usize) -> Option<StorageReader>;

    /// Deletes the file.
    fn remove(self) -> impl Future<Output = HlsResult<()>> + Send;
}

/// A detached handle for reading stored data outside of any lock.
#[derive(Debug, Clone)]
pub enum StorageReader {
    /// Parts of an in-memory file, in order.
    Memory(Vec<Bytes>),
    Disk { path: PathBuf, range: Range<u64> },
}

impl StorageReader {
    pub async fn read(self) -> HlsResult<Bytes> {
        match self {
            StorageReader::Memory(mut parts) if parts.len() <= 1 => {
                Ok(parts.pop().unwrap_or_default())
            }
            StorageReader::Memory(parts) => {
                let mut data = BytesMut::with_capacity(parts.iter().map(Bytes::len).sum());
                for part in parts {
                    data.extend_from_slice(&part);
                }
                Ok(data.freeze())
            }
            StorageReader::Disk { path, range } => disk::read_range(&path, range).await,
        }
    }
}

#[derive(Debug, Clone)]
pub enum Storage {
    Memory,
    Disk(disk::DiskStorage),
}

impl Storage {
    pub fn memory() -> Self {
        Self::Memory
    }

    pub fn disk(path: impl Into<PathBuf>) -> Self {
        Self::Disk(disk::DiskStorage::new(path.into()))
    }

    /// Allocates a new file.
    pub async fn allocate(&self, name: &str) -> HlsResult<StorageFile> {
        match self {
            Storage::Memory => Ok(StorageFile::Memory(memory::MemoryFile::new())),
            Storage::Disk(storage) => Ok(StorageFile::Disk(storage.allocate(name).await?)),
        }
    }
}

pub enum StorageFile {
    Memory(memory::MemoryFile),
    Disk(disk::DiskFile),
}

impl SegmentFile for StorageFile {
    async fn write(&mut self, data: &[u8]) -> HlsResult<()> {
        match self {
            StorageFile::Memory(file) => file.write(data).await,
            StorageFile::Disk(file) => file.write(data).await,
        }
    }

    async fn finish_part(&mut self) -> HlsResult<()> {
        match self {
            StorageFile::Memory(file) => file.finish_part().await,
            StorageFile::Disk(file) => file.finish_part().await,
        }
    }

    async fn finalize(&mut self) -> HlsResult<()> {
        match self {
            StorageFile::Memory(file) => file.finalize().await,
            StorageFile::Disk(file) => file.finalize().await,
        }
    }

    fn size(&self) -> u64 {
        match self {
            StorageFile::Memory(file) => file.size(),
            StorageFile::Disk(file) => file.size(),
        }
    }

    fn reader(&self) -> StorageReader {
        match self {
            StorageFile::Memory(file) => file.reader(),
            StorageFile::Disk(file) => file.reader(),
        }
    }

    fn part_reader(&self, index: usize) -> Option<StorageReader> {
        match self {
            StorageFile::Memory(file) => file.part_reader(index),
            StorageFile::Disk(file) => file.part_reader(index),
        }
    }

    async fn remove(self) -> HlsResult<()> {
        match self {
            StorageFile::Memory(file) => file.remove().await,
            StorageFile::Disk(file) => file.remove().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn write_parts(storage: &Storage) -> HlsResult<StorageFile> {
        let mut file = storage.allocate("seg0.mp4").await?;
        file.write(b"hello").await?;
        file.write(b" ").await?;
        file.finish_part().await?;
        file.write(b"world").await?;
        file.finalize().await?;
        Ok(file)
    }

    async fn check(file: StorageFile) -> HlsResult<()> {
        assert_eq!(file.size(), 11);
        assert_eq!(file.reader().read().await?, Bytes::from_static(b"hello world"));
        let part = file.part_reader(0).map(|r| r.read());
        assert_eq!(part.unwrap().await?, Bytes::from_static(b"hello "));
        let part = file.part_reader(1).map(|r| r.read());
        assert_eq!(part.unwrap().await?, Bytes::from_static(b"world"));
        assert!(file.part_reader(2).is_none());
        file.remove().await
    }

    #[tokio::test]
    async fn test_memory_storage() -> HlsResult<()> {
        let file = write_parts(&Storage::memory()).await?;
        check(file).await
    }

    #[tokio::test]
    async fn test_disk_storage() -> HlsResult<()> {
        let dir = tempfile::tempdir()?;
        let storage = Storage::disk(dir.path().join("segments"));
        let file = write_parts(&storage).await?;
        let path = dir.path().join("segments").join("seg0.mp4");
        assert!(path.exists());
        check(file).await?;
        assert!(!path.exists());
        Ok(())
    }
}
