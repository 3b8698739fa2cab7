//! On-disk content-addressed store.
//!
//! Entries live under `{root}/narinfo/{hash}.narinfo` and
//! `{root}/nar/{hash}.nar[.ext]`.  Downloads are staged in `{root}/tmp` and
//! published with a single `rename`, so a reader either sees a complete entry
//! or nothing.  The filesystem is the only index.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use super::key::{Category, ContentHash};

const SCRATCH_DIR: &str = "tmp";

// ---------------------------------------------------------------------------
// CacheStore
// ---------------------------------------------------------------------------

/// Path layout of the local cache rooted at the state directory.
#[derive(Debug, Clone)]
pub struct CacheStore {
    root: PathBuf,
}

impl CacheStore {
    /// Create the category and scratch directories under `root`.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let store = Self { root: root.into() };
        for dir in [
            store.category_dir(Category::Narinfo),
            store.category_dir(Category::Nar),
            store.scratch_dir(),
        ] {
            create_private_dir(&dir)
                .with_context(|| format!("failed to create state directory: {}", dir.display()))?;
        }
        Ok(store)
    }

    pub fn category_dir(&self, category: Category) -> PathBuf {
        self.root.join(category.dir_name())
    }

    pub fn scratch_dir(&self) -> PathBuf {
        self.root.join(SCRATCH_DIR)
    }

    /// Canonical path of the entry for `hash`.  Pure computation; the entry
    /// may or may not exist.
    pub fn locate(&self, hash: &ContentHash) -> PathBuf {
        self.category_dir(hash.category()).join(hash.file_name())
    }

    /// Whether a published entry exists at `path`.
    pub async fn exists(path: &Path) -> std::io::Result<bool> {
        tokio::fs::try_exists(path).await
    }

    /// Create a fresh, uniquely named staging file.
    pub async fn scratch(&self) -> std::io::Result<ScratchFile> {
        let path = self.scratch_dir().join(uuid::Uuid::new_v4().to_string());
        let file = tokio::fs::File::create(&path).await?;
        Ok(ScratchFile {
            path,
            file: Some(file),
            written: 0,
        })
    }

    /// Remove staging files left behind by a previous process.
    ///
    /// Must only run before any fetch has started.
    pub fn sweep_scratch(&self) -> Result<usize> {
        let dir = self.scratch_dir();
        let entries = std::fs::read_dir(&dir)
            .with_context(|| format!("failed to read scratch directory: {}", dir.display()))?;

        let mut removed = 0;
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            match std::fs::remove_file(entry.path()) {
                Ok(()) => removed += 1,
                Err(e) => warn!(path = %entry.path().display(), error = %e, "failed to remove stale scratch file"),
            }
        }

        if removed > 0 {
            info!(removed, "swept stale scratch files");
        }
        Ok(removed)
    }
}

#[cfg(unix)]
fn create_private_dir(dir: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::DirBuilderExt;
    std::fs::DirBuilder::new()
        .recursive(true)
        .mode(0o700)
        .create(dir)
}

#[cfg(not(unix))]
fn create_private_dir(dir: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(dir)
}

// ---------------------------------------------------------------------------
// ScratchFile
// ---------------------------------------------------------------------------

/// A staging file that is deleted on drop unless it was published.
#[derive(Debug)]
pub struct ScratchFile {
    path: PathBuf,
    file: Option<tokio::fs::File>,
    written: u64,
}

impl ScratchFile {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Bytes written so far.
    pub fn written(&self) -> u64 {
        self.written
    }

    pub async fn write_all(&mut self, chunk: &[u8]) -> std::io::Result<()> {
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| std::io::Error::other("scratch file already closed"))?;
        file.write_all(chunk).await?;
        self.written += chunk.len() as u64;
        Ok(())
    }

    /// Flush, close and atomically move the staged content to `dest`.
    pub async fn publish(mut self, dest: &Path) -> std::io::Result<()> {
        if let Some(mut file) = self.file.take() {
            file.flush().await?;
            file.sync_all().await?;
        }
        tokio::fs::rename(&self.path, dest).await?;
        debug!(from = %self.path.display(), to = %dest.display(), bytes = self.written, "published store entry");
        // Nothing left to clean up.
        self.path = PathBuf::new();
        Ok(())
    }
}

impl Drop for ScratchFile {
    fn drop(&mut self) {
        if self.path.as_os_str().is_empty() {
            return;
        }
        // Close the handle before unlinking.
        self.file.take();
        if let Err(e) = std::fs::remove_file(&self.path)
            && e.kind() != std::io::ErrorKind::NotFound
        {
            warn!(path = %self.path.display(), error = %e, "failed to remove scratch file");
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
