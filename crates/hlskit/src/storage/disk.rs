use std::{
    io::SeekFrom,
    ops::Range,
    path::{Path, PathBuf},
};

use bytes::Bytes;
use tokio::{
    fs::File,
    io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt},
};

use super::{SegmentFile, StorageReader};
use crate::error::HlsResult;

#[derive(Debug, Clone)]
pub struct DiskStorage {
    directory: PathBuf,
}

impl DiskStorage {
    pub fn new(directory: PathBuf) -> Self {
        Self { directory }
    }

    async fn ensure_directory(&self) -> HlsResult<()> {
        if !self.directory.exists() {
            tokio::fs::create_dir_all(&self.directory).await?;
        }
        Ok(())
    }

    pub(super) async fn allocate(&self, name: &str) -> HlsResult<DiskFile> {
        self.ensure_directory().await?;
        let path = self.directory.join(name.replace('/', "__"));
        let file = File::create(&path).await?;
        Ok(DiskFile {
            path,
            file: Some(file),
            parts: Vec::new(),
            part_start: 0,
            size: 0,
        })
    }
}

/// A file on disk. Finished parts are recorded as byte ranges.
pub struct DiskFile {
    path: PathBuf,
    file: Option<File>,
    parts: Vec<Range<u64>>,
    part_start: u64,
    size: u64,
}

impl SegmentFile for DiskFile {
    async fn write(&mut self, data: &[u8]) -> HlsResult<()> {
        let file = self.file.as_mut().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::PermissionDenied, "file is finalized")
        })?;
        file.write_all(data).await?;
        self.size += data.len() as u64;
        Ok(())
    }

    async fn finish_part(&mut self) -> HlsResult<()> {
        if let Some(file) = self.file.as_mut() {
            file.flush().await?;
        }
        self.parts.push(self.part_start..self.size);
        self.part_start = self.size;
        Ok(())
    }

    async fn finalize(&mut self) -> HlsResult<()> {
        if self.part_start < self.size {
            self.finish_part().await?;
        }
        if let Some(mut file) = self.file.take() {
            file.flush().await?;
            file.sync_data().await?;
        }
        Ok(())
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn reader(&self) -> StorageReader {
        StorageReader::Disk {
            path: self.path.clone(),
            range: 0..self.size,
        }
    }

    fn part_reader(&self, index: usize) -> Option<StorageReader> {
        self.parts.get(index).map(|range| StorageReader::Disk {
            path: self.path.clone(),
            range: range.clone(),
        })
    }

    async fn remove(mut self) -> HlsResult<()> {
        drop(self.file.take());
        if self.path.exists() {
            tokio::fs::remove_file(&self.path).await?;
        }
        Ok(())
    }
}

pub(super) async fn read_range(path: &Path, range: Range<u64>) -> HlsResult<Bytes> {
    let mut file = File::open(path).await?;
    file.seek(SeekFrom::Start(range.start)).await?;
    let mut buf = vec![0u8; (range.end - range.start) as usize];
    file.read_exact(&mut buf).await?;
    Ok(buf.into())
}
