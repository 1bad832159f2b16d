use docflow_core::{BlobRef, Job, JobId};

use super::BlobError;

/// Maps a job to the storage locations of its artifacts.
///
/// Pure naming: no content handling. Locations are id-addressed, so every
/// attempt of a job writes its output to the same place and a retry simply
/// overwrites what an abandoned attempt may have left behind.
#[derive(Debug, Clone)]
pub struct BlobResolver {
    prefix: String,
}

impl Default for BlobResolver {
    fn default() -> Self {
        Self::new("jobs")
    }
}

impl BlobResolver {
    pub fn new(prefix: impl Into<String>) -> Self {
        let prefix = prefix.into();
        Self {
            prefix: prefix.trim_matches('/').to_string(),
        }
    }

    pub fn input_for(&self, id: JobId) -> Result<BlobRef, BlobError> {
        self.artifact(id, "input")
    }

    pub fn output_for(&self, id: JobId) -> Result<BlobRef, BlobError> {
        self.artifact(id, "output")
    }

    /// The job's recorded input reference.
    pub fn input_of(&self, job: &Job) -> Result<BlobRef, BlobError> {
        job.input_ref
            .clone()
            .ok_or_else(|| BlobError::InvalidRef(format!("job {} has no input reference", job.id)))
    }

    fn artifact(&self, id: JobId, name: &str) -> Result<BlobRef, BlobError> {
        let raw = if self.prefix.is_empty() {
            format!("{id}/{name}")
        } else {
            format!("{}/{id}/{name}", self.prefix)
        };
        BlobRef::new(raw).map_err(|e| BlobError::InvalidRef(e.to_string()))
    }
}
