//! Filesystem blob store.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::{debug, instrument};

use docflow_core::BlobRef;

use super::{content_ref, validate_ref, BlobError, BlobStore};

/// Blobs as files under a root directory; each `/` in a reference is a
/// directory level.
///
/// Writes go to a dot-prefixed temp file and are renamed into place, so a
/// reader never observes a partial blob.
#[derive(Debug, Clone)]
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_of(&self, blob: &BlobRef) -> Result<PathBuf, BlobError> {
        validate_ref(blob)?;
        Ok(blob.as_str().split('/').fold(self.root.clone(), |path, segment| path.join(segment)))
    }

    async fn write_atomic(&self, path: &Path, bytes: &[u8]) -> Result<(), BlobError> {
        let parent = path
            .parent()
            .ok_or_else(|| BlobError::Io(format!("no parent directory for {}", path.display())))?;
        tokio::fs::create_dir_all(parent).await.map_err(io_error)?;

        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let tmp = parent.join(format!(".{}.{}.tmp", file_name, uuid::Uuid::now_v7()));

        tokio::fs::write(&tmp, bytes).await.map_err(io_error)?;
        if let Err(e) = tokio::fs::rename(&tmp, path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(io_error(e));
        }
        Ok(())
    }
}

fn io_error(err: std::io::Error) -> BlobError {
    BlobError::Io(err.to_string())
}

#[async_trait]
impl BlobStore for FsBlobStore {
    #[instrument(skip(self), fields(blob = %blob), err)]
    async fn get(&self, blob: &BlobRef) -> Result<Vec<u8>, BlobError> {
        let path = self.path_of(blob)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(BlobError::NotFound(blob.clone())),
            Err(e) => Err(io_error(e)),
        }
    }

    #[instrument(skip(self, bytes), fields(len = bytes.len()), err)]
    async fn put(&self, bytes: Vec<u8>) -> Result<BlobRef, BlobError> {
        let blob = content_ref(&bytes)?;
        let path = self.path_of(&blob)?;
        if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            debug!(blob = %blob, "content already stored");
            return Ok(blob);
        }
        self.write_atomic(&path, &bytes).await?;
        Ok(blob)
    }

    #[instrument(skip(self, bytes), fields(blob = %blob, len = bytes.len()), err)]
    async fn put_at(&self, blob: &BlobRef, bytes: Vec<u8>) -> Result<(), BlobError> {
        let path = self.path_of(blob)?;
        self.write_atomic(&path, &bytes).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_root() -> PathBuf {
        std::env::temp_dir().join(format!("docflow-blobs-{}", uuid::Uuid::now_v7()))
    }

    #[tokio::test]
    async fn round_trip_through_disk() {
        let root = temp_root();
        let store = FsBlobStore::new(&root);

        let blob = store.put(b"doc-42".to_vec()).await.unwrap();
        assert_eq!(store.get(&blob).await.unwrap(), b"doc-42");
        assert_eq!(store.put(b"doc-42".to_vec()).await.unwrap(), blob);

        let output = BlobRef::new("jobs/abc/output").unwrap();
        store.put_at(&output, b"first".to_vec()).await.unwrap();
        store.put_at(&output, b"summary text".to_vec()).await.unwrap();
        assert_eq!(store.get(&output).await.unwrap(), b"summary text");
        assert!(root.join("jobs").join("abc").join("output").exists());

        tokio::fs::remove_dir_all(&root).await.unwrap();
    }

    #[tokio::test]
    async fn missing_blob_is_not_found() {
        let store = FsBlobStore::new(temp_root());
        let blob = BlobRef::new("jobs/none/input").unwrap();
        assert_eq!(store.get(&blob).await, Err(BlobError::NotFound(blob.clone())));
    }

    #[tokio::test]
    async fn traversal_is_rejected_before_touching_disk() {
        let store = FsBlobStore::new(temp_root());
        let blob = BlobRef::new("../outside").unwrap();
        assert!(matches!(store.get(&blob).await, Err(BlobError::InvalidRef(_))));
        assert!(matches!(
            store.put_at(&blob, b"x".to_vec()).await,
            Err(BlobError::InvalidRef(_))
        ));
    }
}
