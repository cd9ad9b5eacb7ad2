//! Append-only output file owned by a single writer.

use std::path::{Path, PathBuf};

use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;

use crate::error::DownloadError;

pub struct OutputWriter {
    file: File,
    path: PathBuf,
    bytes_written: u64,
}

impl OutputWriter {
    /// Open `path` truncated, creating parent directories as needed.
    pub async fn create(path: impl Into<PathBuf>) -> Result<Self, DownloadError> {
        let path = path.into();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = File::create(&path).await?;
        Ok(Self {
            file,
            path,
            bytes_written: 0,
        })
    }

    /// Open `path` for appending, keeping existing content. `bytes_written`
    /// starts at the current file size.
    pub async fn append(path: impl Into<PathBuf>) -> Result<Self, DownloadError> {
        let path = path.into();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        let bytes_written = file.metadata().await?.len();
        Ok(Self {
            file,
            path,
            bytes_written,
        })
    }

    pub async fn write_segment(&mut self, data: &[u8]) -> Result<(), DownloadError> {
        self.file.write_all(data).await?;
        self.bytes_written += data.len() as u64;
        Ok(())
    }

    /// Flush and return the total byte count. Consumes the writer; the file
    /// handle closes here.
    pub async fn finish(mut self) -> Result<u64, DownloadError> {
        self.file.flush().await?;
        Ok(self.bytes_written)
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_truncates_and_counts() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.ts");
        tokio::fs::write(&path, b"stale content").await.unwrap();

        let mut writer = OutputWriter::create(&path).await.unwrap();
        writer.write_segment(b"abc").await.unwrap();
        writer.write_segment(b"defg").await.unwrap();
        assert_eq!(writer.bytes_written(), 7);
        assert_eq!(writer.finish().await.unwrap(), 7);

        assert_eq!(tokio::fs::read(&path).await.unwrap(), b"abcdefg");
    }

    #[tokio::test]
    async fn append_continues_from_existing_size() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.bin");
        tokio::fs::write(&path, b"12345").await.unwrap();

        let mut writer = OutputWriter::append(&path).await.unwrap();
        assert_eq!(writer.bytes_written(), 5);
        writer.write_segment(b"678").await.unwrap();
        assert_eq!(writer.finish().await.unwrap(), 8);

        assert_eq!(tokio::fs::read(&path).await.unwrap(), b"12345678");
    }

    #[tokio::test]
    async fn create_makes_missing_parents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a/b/out.ts");
        let writer = OutputWriter::create(&path).await.unwrap();
        assert_eq!(writer.finish().await.unwrap(), 0);
        assert!(path.exists());
    }
}
