//! Content-addressed blob store
//!
//! Large payloads (file transfers, sneakernet relay content) live here as
//! flat files named by the hex content id. Writes are idempotent: the same
//! bytes land on the same name, so a repeated put is a no-op. On open the
//! directory is scanned so in-memory size accounting matches disk.

use std::collections::HashSet;
use std::path::PathBuf;

use tracing::debug;

use lib_wire::{content_id, ContentId};

use crate::error::StoreError;

pub struct BlobStore {
    dir: PathBuf,
    known: HashSet<ContentId>,
    total_bytes: u64,
}

impl BlobStore {
    /// Open the blob directory and rebuild size accounting
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;

        let mut known = HashSet::new();
        let mut total_bytes = 0u64;
        let mut reader = tokio::fs::read_dir(&dir).await?;
        while let Some(dirent) = reader.next_entry().await? {
            let path = dirent.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let Ok(id) = ContentId::from_hex(name) else {
                continue;
            };
            let meta = dirent.metadata().await?;
            known.insert(id);
            total_bytes += meta.len();
        }

        debug!(blobs = known.len(), total_bytes, "blob store opened");
        Ok(BlobStore {
            dir,
            known,
            total_bytes,
        })
    }

    fn blob_path(&self, id: &ContentId) -> PathBuf {
        self.dir.join(id.to_string())
    }

    /// Store content and return its address. Re-putting known content is a
    /// no-op.
    pub async fn put(&mut self, content: &[u8]) -> Result<ContentId, StoreError> {
        let id = content_id(content);
        if self.known.contains(&id) {
            return Ok(id);
        }

        let path = self.blob_path(&id);
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, content).await?;
        tokio::fs::rename(&tmp, &path).await?;

        self.known.insert(id);
        self.total_bytes += content.len() as u64;
        Ok(id)
    }

    /// Resolve a content id to bytes
    pub async fn get(&self, id: &ContentId) -> Result<Vec<u8>, StoreError> {
        if !self.known.contains(id) {
            return Err(StoreError::BlobNotFound);
        }
        match tokio::fs::read(self.blob_path(id)).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(StoreError::BlobNotFound),
            Err(e) => Err(e.into()),
        }
    }

    /// Remove a blob if present
    pub async fn remove(&mut self, id: &ContentId) -> Result<(), StoreError> {
        if !self.known.remove(id) {
            return Err(StoreError::BlobNotFound);
        }
        let path = self.blob_path(id);
        if let Ok(meta) = tokio::fs::metadata(&path).await {
            self.total_bytes = self.total_bytes.saturating_sub(meta.len());
        }
        tokio::fs::remove_file(&path).await.ok();
        Ok(())
    }

    pub fn contains(&self, id: &ContentId) -> bool {
        self.known.contains(id)
    }

    pub fn count(&self) -> usize {
        self.known.len()
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_put_get_roundtrip() {
        let dir = tempdir().unwrap();
        let mut store = BlobStore::open(dir.path()).await.unwrap();

        let id = store.put(b"file chunk payload").await.unwrap();
        assert_eq!(store.get(&id).await.unwrap(), b"file chunk payload");
        assert_eq!(id, content_id(b"file chunk payload"));
    }

    #[tokio::test]
    async fn test_put_is_idempotent() {
        let dir = tempdir().unwrap();
        let mut store = BlobStore::open(dir.path()).await.unwrap();

        let a = store.put(b"same bytes").await.unwrap();
        let b = store.put(b"same bytes").await.unwrap();
        assert_eq!(a, b);
        assert_eq!(store.count(), 1);
        assert_eq!(store.total_bytes(), b"same bytes".len() as u64);
    }

    #[tokio::test]
    async fn test_missing_blob() {
        let dir = tempdir().unwrap();
        let store = BlobStore::open(dir.path()).await.unwrap();
        let missing = content_id(b"never stored");
        assert!(matches!(
            store.get(&missing).await,
            Err(StoreError::BlobNotFound)
        ));
    }

    #[tokio::test]
    async fn test_scan_rebuilds_accounting() {
        let dir = tempdir().unwrap();
        {
            let mut store = BlobStore::open(dir.path()).await.unwrap();
            store.put(b"one").await.unwrap();
            store.put(b"twotwo").await.unwrap();
        }

        let store = BlobStore::open(dir.path()).await.unwrap();
        assert_eq!(store.count(), 2);
        assert_eq!(store.total_bytes(), 9);
        assert!(store.contains(&content_id(b"one")));
    }
}
