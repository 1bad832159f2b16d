//! Blob storage collaborator and the Blob Reference Resolver.
//!
//! The pipeline never carries document bytes in broker messages. Inputs and
//! outputs live behind a [`BlobStore`] and jobs only hold [`BlobRef`]s.

mod fs;
mod resolver;

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use docflow_core::BlobRef;

pub use fs::FsBlobStore;
pub use resolver::BlobResolver;

/// Blob store error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BlobError {
    #[error("blob not found: {0}")]
    NotFound(BlobRef),
    #[error("blob io error: {0}")]
    Io(String),
    #[error("invalid blob reference: {0}")]
    InvalidRef(String),
}

/// Get/put interface to external binary storage.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn get(&self, blob: &BlobRef) -> Result<Vec<u8>, BlobError>;

    /// Store `bytes` under a content-derived reference (`sha256:<hex>`).
    async fn put(&self, bytes: Vec<u8>) -> Result<BlobRef, BlobError>;

    /// Store `bytes` at a caller-chosen reference, replacing any previous content.
    async fn put_at(&self, blob: &BlobRef, bytes: Vec<u8>) -> Result<(), BlobError>;
}

/// Content address for `bytes`.
pub fn content_ref(bytes: &[u8]) -> Result<BlobRef, BlobError> {
    let digest = Sha256::digest(bytes);
    BlobRef::new(format!("sha256:{}", hex::encode(digest))).map_err(|e| BlobError::InvalidRef(e.to_string()))
}

/// Reject references that could escape a storage root or collide with temp files.
///
/// A reference is one or more `/`-separated segments of `[A-Za-z0-9._:-]`,
/// with no empty, `.` or `..` segments and no leading dot.
pub fn validate_ref(blob: &BlobRef) -> Result<(), BlobError> {
    let raw = blob.as_str();
    let valid = raw.split('/').all(|segment| {
        !segment.is_empty()
            && !segment.starts_with('.')
            && segment
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | ':' | '-'))
    });
    if valid {
        Ok(())
    } else {
        Err(BlobError::InvalidRef(raw.to_string()))
    }
}

/// In-memory blob store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryBlobStore {
    blobs: RwLock<HashMap<BlobRef, Vec<u8>>>,
}

impl InMemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.blobs.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl BlobStore for InMemoryBlobStore {
    async fn get(&self, blob: &BlobRef) -> Result<Vec<u8>, BlobError> {
        let blobs = self.blobs.read().unwrap();
        blobs
            .get(blob)
            .cloned()
            .ok_or_else(|| BlobError::NotFound(blob.clone()))
    }

    async fn put(&self, bytes: Vec<u8>) -> Result<BlobRef, BlobError> {
        let blob = content_ref(&bytes)?;
        self.blobs.write().unwrap().insert(blob.clone(), bytes);
        Ok(blob)
    }

    async fn put_at(&self, blob: &BlobRef, bytes: Vec<u8>) -> Result<(), BlobError> {
        validate_ref(blob)?;
        self.blobs.write().unwrap().insert(blob.clone(), bytes);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_ref_is_stable_sha256() {
        let a = content_ref(b"doc-42").unwrap();
        assert_eq!(a, content_ref(b"doc-42").unwrap());
        assert_ne!(a, content_ref(b"doc-43").unwrap());
        assert!(a.as_str().starts_with("sha256:"));
        assert_eq!(a.as_str().len(), "sha256:".len() + 64);
    }

    #[test]
    fn validate_ref_rejects_traversal() {
        for bad in ["../etc/passwd", "jobs/../x", "/abs", "jobs//x", "jobs/.tmp", "a b"] {
            let blob = BlobRef::new(bad).unwrap();
            assert!(validate_ref(&blob).is_err(), "{bad}");
        }
        for good in ["sha256:ab12", "jobs/0190e3b4-0000-7000-8000-000000000000/output", "x.txt"] {
            assert!(validate_ref(&BlobRef::new(good).unwrap()).is_ok(), "{good}");
        }
    }

    #[tokio::test]
    async fn in_memory_put_and_get() {
        let store = InMemoryBlobStore::new();
        let blob = store.put(b"doc-42".to_vec()).await.unwrap();
        assert_eq!(store.get(&blob).await.unwrap(), b"doc-42");

        let missing = BlobRef::new("jobs/none/output").unwrap();
        assert_eq!(store.get(&missing).await, Err(BlobError::NotFound(missing.clone())));

        store.put_at(&missing, b"late".to_vec()).await.unwrap();
        store.put_at(&missing, b"overwritten".to_vec()).await.unwrap();
        assert_eq!(store.get(&missing).await.unwrap(), b"overwritten");
        assert_eq!(store.len(), 2);
    }
}
