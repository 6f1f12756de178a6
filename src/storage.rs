//! Artifact storage.
//!
//! The pipeline addresses every file by a path relative to a storage root and
//! never by an absolute path. [`FsStorage`] is the production backend; tests
//! point it at a tempdir.
//!
//! ## Why write-then-rename?
//!
//! The job's artifact pointer is only swapped after `save` returns. Writing
//! into a sibling temp file and renaming it over the target means a crash
//! mid-write leaves either the complete old file or the complete new one,
//! never a torn PDF that a later step would load.

use crate::error::AnonError;
use async_trait::async_trait;
use std::io::Write;
use std::path::{Component, Path, PathBuf};
use tracing::debug;

/// Byte storage addressed by root-relative paths.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Read the whole file.
    async fn load(&self, path: &str) -> Result<Vec<u8>, AnonError>;

    /// Durably write the whole file, replacing any previous content. Returns `path`.
    async fn save(&self, path: &str, bytes: &[u8]) -> Result<String, AnonError>;

    /// True when a file exists at `path`.
    async fn exists(&self, path: &str) -> Result<bool, AnonError>;

    /// Remove a file or a whole directory tree. Missing is fine.
    async fn remove(&self, path: &str) -> Result<(), AnonError>;
}

/// Filesystem-backed [`Storage`].
#[derive(Debug, Clone)]
pub struct FsStorage {
    root: PathBuf,
}

impl FsStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a relative storage path, rejecting anything that escapes the root.
    pub fn resolve(&self, path: &str) -> Result<PathBuf, AnonError> {
        let rel = Path::new(path);
        let escapes = path.is_empty()
            || rel.components().any(|c| {
                matches!(
                    c,
                    Component::ParentDir | Component::RootDir | Component::Prefix(_)
                )
            });
        if escapes {
            return Err(AnonError::InvalidStoragePath {
                path: path.to_string(),
            });
        }
        Ok(self.root.join(rel))
    }
}

fn io_err(path: &str) -> impl FnOnce(std::io::Error) -> AnonError + '_ {
    move |source| AnonError::Storage {
        path: path.to_string(),
        source,
    }
}

#[async_trait]
impl Storage for FsStorage {
    async fn load(&self, path: &str) -> Result<Vec<u8>, AnonError> {
        let full = self.resolve(path)?;
        match tokio::fs::read(&full).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(AnonError::ArtifactNotFound {
                    path: path.to_string(),
                })
            }
            Err(e) => Err(io_err(path)(e)),
        }
    }

    async fn save(&self, path: &str, bytes: &[u8]) -> Result<String, AnonError> {
        let full = self.resolve(path)?;
        let len = bytes.len();
        let bytes = bytes.to_vec();
        let owned = path.to_string();

        tokio::task::spawn_blocking(move || -> Result<(), AnonError> {
            let parent = full
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_else(|| PathBuf::from("."));
            std::fs::create_dir_all(&parent).map_err(io_err(&owned))?;

            // Temp file in the same directory so the rename stays on one filesystem.
            let mut tmp = tempfile::NamedTempFile::new_in(&parent).map_err(io_err(&owned))?;
            tmp.write_all(&bytes).map_err(io_err(&owned))?;
            tmp.as_file().sync_all().map_err(io_err(&owned))?;
            tmp.persist(&full).map_err(|e| io_err(&owned)(e.error))?;
            Ok(())
        })
        .await
        .map_err(|e| AnonError::Internal(format!("Storage task panicked: {}", e)))??;

        debug!("Stored {} ({} bytes)", path, len);
        Ok(path.to_string())
    }

    async fn exists(&self, path: &str) -> Result<bool, AnonError> {
        let full = self.resolve(path)?;
        tokio::fs::try_exists(&full).await.map_err(io_err(path))
    }

    async fn remove(&self, path: &str) -> Result<(), AnonError> {
        let full = self.resolve(path)?;
        let result = match tokio::fs::metadata(&full).await {
            Ok(meta) if meta.is_dir() => tokio::fs::remove_dir_all(&full).await,
            Ok(_) => tokio::fs::remove_file(&full).await,
            Err(e) => Err(e),
        };
        match result {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_err(path)(e)),
        }
    }
}
