//! On-disk cache of fetched chunks.
//!
//! A chunk is cached iff a file named after its key exists under the cache
//! directory. There is no expiry: once written, a key is never fetched again.
//! Writes go through a temporary file that is renamed into place, so a crash
//! mid-write never leaves a truncated file behind that would suppress a
//! refetch.
//!
//! The cache does no locking of its own. All writes come from the single
//! scheduler worker, so two writers for one key cannot exist.

use bytes::Bytes;
use std::io::{self, Write};
use std::path::{Component, Path, PathBuf};
use tempfile::NamedTempFile;

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// The key would escape the cache directory or name no file at all.
    #[error("Invalid cache key {key:?}")]
    InvalidKey { key: String },

    #[error("Cache I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug, Clone)]
pub struct ChunkCache {
    dir: PathBuf,
}

impl ChunkCache {
    /// Opens the cache rooted at `dir`, creating the directory if needed.
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self, CacheError> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|source| CacheError::Io {
                path: dir.clone(),
                source,
            })?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Resolves `key` to its file under the cache directory.
    ///
    /// Keys may contain subdirectories but only plain path segments: no
    /// roots, no `.` or `..`.
    pub fn path_for(&self, key: &str) -> Result<PathBuf, CacheError> {
        let relative = Path::new(key);
        let mut components = relative.components().peekable();
        let valid = components.peek().is_some()
            && components.all(|c| matches!(c, Component::Normal(_)));
        if !valid {
            return Err(CacheError::InvalidKey {
                key: key.to_string(),
            });
        }
        Ok(self.dir.join(relative))
    }

    pub async fn exists(&self, key: &str) -> Result<bool, CacheError> {
        let path = self.path_for(key)?;
        tokio::fs::try_exists(&path)
            .await
            .map_err(|source| CacheError::Io { path, source })
    }

    /// Stores `bytes` under `key`, replacing any previous content.
    pub async fn write(&self, key: &str, bytes: Bytes) -> Result<(), CacheError> {
        let path = self.path_for(key)?;
        let target = path.clone();
        tokio::task::spawn_blocking(move || write_atomic(&target, &bytes))
            .await
            .map_err(io::Error::other)
            .and_then(|res| res)
            .map_err(|source| CacheError::Io { path, source })
    }
}

fn write_atomic(target: &Path, bytes: &[u8]) -> io::Result<()> {
    let parent = target
        .parent()
        .ok_or_else(|| io::Error::other("cache path has no parent directory"))?;
    std::fs::create_dir_all(parent)?;

    let mut tmp = NamedTempFile::new_in(parent)?;
    tmp.write_all(bytes)?;
    tmp.flush()?;
    tmp.as_file_mut().sync_all()?;
    tmp.persist(target).map_err(|e| e.error)?;
    Ok(())
}
