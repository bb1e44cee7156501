//! Storage for encrypted file blobs
//!
//! Blobs are addressed by names the store generates (UUID v4) and move
//! through the store as async byte streams, never as whole buffers handed
//! in by the caller.

use std::collections::HashMap;
use std::io::Cursor;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use kvault_core::{VaultError, VaultResult};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// Owned async byte source handed to or returned from a blob store
pub type BlobReader = Box<dyn AsyncRead + Send + Unpin>;

#[async_trait]
pub trait FileBlobStore: Send + Sync {
    /// Consume `reader` to the end and persist it under a new name.
    async fn store(&self, reader: BlobReader) -> VaultResult<String>;

    /// Open a stored blob for reading, or `None` if no such blob exists.
    async fn retrieve(&self, name: &str) -> VaultResult<Option<BlobReader>>;

    /// Remove a blob. Returns whether anything was removed.
    async fn delete(&self, name: &str) -> VaultResult<bool>;

    async fn exists(&self, name: &str) -> VaultResult<bool>;
}

fn generate_name() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Reject names that could escape the blob directory.
pub fn validate_blob_name(name: &str) -> VaultResult<()> {
    let valid = !name.is_empty()
        && name.len() <= 128
        && !name.starts_with('.')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(VaultError::Validation(format!("invalid blob name: {name:?}")))
    }
}

#[derive(Debug, Default)]
pub struct MemoryBlobStore {
    blobs: RwLock<HashMap<String, Bytes>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raw stored bytes, for inspecting ciphertext in tests
    pub async fn raw(&self, name: &str) -> Option<Bytes> {
        self.blobs.read().await.get(name).cloned()
    }

    /// Overwrite raw stored bytes
    pub async fn put_raw(&self, name: &str, data: impl Into<Bytes>) {
        self.blobs.write().await.insert(name.to_string(), data.into());
    }
}

#[async_trait]
impl FileBlobStore for MemoryBlobStore {
    async fn store(&self, mut reader: BlobReader) -> VaultResult<String> {
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf).await?;
        let name = generate_name();
        self.blobs.write().await.insert(name.clone(), Bytes::from(buf));
        Ok(name)
    }

    async fn retrieve(&self, name: &str) -> VaultResult<Option<BlobReader>> {
        validate_blob_name(name)?;
        Ok(self
            .blobs
            .read()
            .await
            .get(name)
            .cloned()
            .map(|bytes| Box::new(Cursor::new(bytes)) as BlobReader))
    }

    async fn delete(&self, name: &str) -> VaultResult<bool> {
        validate_blob_name(name)?;
        Ok(self.blobs.write().await.remove(name).is_some())
    }

    async fn exists(&self, name: &str) -> VaultResult<bool> {
        validate_blob_name(name)?;
        Ok(self.blobs.read().await.contains_key(name))
    }
}

/// Directory of blob files, one file per blob.
///
/// Writes land in a hidden temp file and are renamed into place, so readers
/// never observe a partial blob.
#[derive(Debug, Clone)]
pub struct FsBlobStore {
    dir: PathBuf,
}

impl FsBlobStore {
    /// Open the store, creating `dir` if needed.
    pub async fn open(dir: impl AsRef<Path>) -> VaultResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&dir).await.map_err(|e| {
            VaultError::Config(format!("cannot create blob directory {}: {e}", dir.display()))
        })?;
        let meta = tokio::fs::metadata(&dir).await?;
        if !meta.is_dir() {
            return Err(VaultError::Config(format!(
                "blob path is not a directory: {}",
                dir.display()
            )));
        }
        debug!(dir = %dir.display(), "opened blob store");
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn blob_path(&self, name: &str) -> VaultResult<PathBuf> {
        validate_blob_name(name)?;
        Ok(self.dir.join(name))
    }
}

/// Temp file of a blob being written. Removed on drop unless committed, which
/// covers write errors, a failed rename and a cancelled `store` future.
struct PendingBlob {
    path: PathBuf,
    committed: bool,
}

impl Drop for PendingBlob {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        match std::fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %self.path.display(), "failed to remove partial blob: {e}"),
        }
    }
}

#[async_trait]
impl FileBlobStore for FsBlobStore {
    async fn store(&self, mut reader: BlobReader) -> VaultResult<String> {
        let name = generate_name();
        let final_path = self.dir.join(&name);
        let mut pending = PendingBlob {
            path: self.dir.join(format!(".{name}.tmp")),
            committed: false,
        };

        let mut file = tokio::fs::File::create(&pending.path).await?;
        let bytes = tokio::io::copy(&mut reader, &mut file).await?;
        file.flush().await?;
        file.sync_all().await?;
        drop(file);

        tokio::fs::rename(&pending.path, &final_path).await?;
        pending.committed = true;
        debug!(name = %name, bytes, "stored blob");
        Ok(name)
    }

    async fn retrieve(&self, name: &str) -> VaultResult<Option<BlobReader>> {
        let path = self.blob_path(name)?;
        match tokio::fs::File::open(&path).await {
            Ok(file) => Ok(Some(Box::new(file))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(&self, name: &str) -> VaultResult<bool> {
        let path = self.blob_path(name)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                debug!(name = %name, "deleted blob");
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn exists(&self, name: &str) -> VaultResult<bool> {
        let path = self.blob_path(name)?;
        Ok(tokio::fs::try_exists(&path).await?)
    }
}
