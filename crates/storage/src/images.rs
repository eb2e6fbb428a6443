//! Image blob directory.
//!
//! Blobs are immutable files named by a fresh 128-bit id, so concurrent
//! writers never collide. Readers racing an unlink after a profile update
//! see ENOENT and treat the image as absent.

use crate::StorageError;
use portico_crypto::hex::{decode_hex_array, encode_hex};
use rand::{rngs::OsRng, RngCore};
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tokio::fs;
use tracing::warn;

pub const IMAGE_ID_LEN: usize = 16;

#[derive(Debug, Clone)]
pub struct ImageStore {
    root: PathBuf,
}

impl ImageStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Creates the blob directory when missing.
    pub async fn ensure_dir(&self) -> Result<(), StorageError> {
        fs::create_dir_all(&self.root)
            .await
            .map_err(StorageError::Io)
    }

    /// Allocates a fresh image id.
    pub fn new_image_id() -> [u8; IMAGE_ID_LEN] {
        let mut id = [0u8; IMAGE_ID_LEN];
        OsRng.fill_bytes(&mut id);
        id
    }

    fn path_for(&self, id: &[u8; IMAGE_ID_LEN]) -> PathBuf {
        self.root.join(encode_hex(id))
    }

    /// Writes a blob under the given id.
    pub async fn write(&self, id: &[u8; IMAGE_ID_LEN], data: &[u8]) -> Result<(), StorageError> {
        fs::write(self.path_for(id), data)
            .await
            .map_err(StorageError::Io)
    }

    /// Reads a blob; a missing file is reported as `None`, not an error.
    pub async fn read(&self, id: &[u8; IMAGE_ID_LEN]) -> Result<Option<Vec<u8>>, StorageError> {
        match fs::read(self.path_for(id)).await {
            Ok(data) => Ok(Some(data)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(StorageError::Io(err)),
        }
    }

    /// Unlinks a blob. Failures are logged and swallowed; the orphan sweep
    /// picks up anything left behind.
    pub async fn remove(&self, id: &[u8; IMAGE_ID_LEN]) {
        let path = self.path_for(id);
        if let Err(err) = fs::remove_file(&path).await {
            if err.kind() != std::io::ErrorKind::NotFound {
                warn!(image = %encode_hex(id), error = %err, "failed to unlink image blob");
            }
        }
    }

    /// Lists stored blob ids with their modification times.
    pub async fn list(&self) -> Result<Vec<([u8; IMAGE_ID_LEN], SystemTime)>, StorageError> {
        let mut entries = match fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(StorageError::Io(err)),
        };
        let mut ids = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(StorageError::Io)? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            let Ok(id) = decode_hex_array::<IMAGE_ID_LEN>(name) else {
                continue;
            };
            let modified = entry
                .metadata()
                .await
                .and_then(|meta| meta.modified())
                .unwrap_or(SystemTime::UNIX_EPOCH);
            ids.push((id, modified));
        }
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn write_read_remove_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = ImageStore::new(dir.path());
        store.ensure_dir().await.unwrap();
        let id = ImageStore::new_image_id();
        store.write(&id, b"png-bytes").await.unwrap();
        assert_eq!(store.read(&id).await.unwrap().unwrap(), b"png-bytes");
        store.remove(&id).await;
        assert!(store.read(&id).await.unwrap().is_none());
        // removing again is silent
        store.remove(&id).await;
    }

    #[tokio::test]
    async fn list_skips_foreign_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = ImageStore::new(dir.path());
        store.ensure_dir().await.unwrap();
        let id = ImageStore::new_image_id();
        store.write(&id, b"data").await.unwrap();
        std::fs::write(dir.path().join("not-an-image.txt"), b"x").unwrap();
        let listed = store.list().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].0, id);
    }
}
