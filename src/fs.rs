//! Local file access used by transfer workers.
//!
//! Workers only ever touch the destination file through [`FileSystem`], so
//! tests can substitute their own implementation.

use std::io::ErrorKind;
use std::path::Path;

use async_trait::async_trait;
use tokio::fs::{File, OpenOptions};

/// The destination-file operations a transfer needs.
#[async_trait]
pub trait FileSystem: Send + Sync {
    /// Length of the regular file at `path`, `None` if nothing is there.
    ///
    /// Fails if `path` exists but is not a regular file or cannot be read.
    async fn file_size(&self, path: &Path) -> std::io::Result<Option<u64>>;

    /// Creates `path` and every missing parent.
    async fn create_dir_all(&self, path: &Path) -> std::io::Result<()>;

    /// Opens `path` for appending, creating it if missing.
    async fn open_append(&self, path: &Path) -> std::io::Result<File>;

    /// Creates `path` empty, discarding any existing content.
    async fn create_truncate(&self, path: &Path) -> std::io::Result<File>;
}

/// [`FileSystem`] backed by `tokio::fs`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioFileSystem;

#[async_trait]
impl FileSystem for TokioFileSystem {
    async fn file_size(&self, path: &Path) -> std::io::Result<Option<u64>> {
        match tokio::fs::metadata(path).await {
            Ok(meta) if meta.is_file() => Ok(Some(meta.len())),
            Ok(_) => Err(std::io::Error::new(
                ErrorKind::InvalidInput,
                "destination exists and is not a regular file",
            )),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn create_dir_all(&self, path: &Path) -> std::io::Result<()> {
        tokio::fs::create_dir_all(path).await
    }

    async fn open_append(&self, path: &Path) -> std::io::Result<File> {
        OpenOptions::new().create(true).append(true).open(path).await
    }

    async fn create_truncate(&self, path: &Path) -> std::io::Result<File> {
        File::create(path).await
    }
}
