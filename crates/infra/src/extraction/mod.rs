//! Extraction Client: calls the external AI engine with a timeout, an input
//! size limit and a closed classification of failures.
//!
//! Retry decisions are made by matching on [`ExtractionError`] variants,
//! never on message text.

mod openai;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, instrument};

use docflow_core::{BlobRef, ErrorKind, JobError};

use crate::blob::{BlobError, BlobStore};

pub use openai::{OpenAiConfig, OpenAiEngine};

/// Default input size limit (10 MiB).
pub const DEFAULT_MAX_INPUT_BYTES: usize = 10 * 1024 * 1024;

/// Why a retry may help.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransientReason {
    Timeout,
    Network,
    RateLimited,
    EngineUnavailable,
    BlobUnavailable,
}

/// Why a retry cannot help.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PermanentReason {
    MalformedInput,
    UnsupportedFormat,
    InputTooLarge,
    /// The engine explicitly refused the request.
    Rejected,
}

impl PermanentReason {
    pub fn error_kind(self) -> ErrorKind {
        match self {
            PermanentReason::MalformedInput => ErrorKind::MalformedInput,
            PermanentReason::UnsupportedFormat => ErrorKind::UnsupportedFormat,
            PermanentReason::InputTooLarge => ErrorKind::InputTooLarge,
            PermanentReason::Rejected => ErrorKind::EngineRejected,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExtractionError {
    #[error("transient extraction failure ({reason:?}): {message}")]
    Transient { reason: TransientReason, message: String },
    #[error("permanent extraction failure ({reason:?}): {message}")]
    Permanent { reason: PermanentReason, message: String },
}

impl ExtractionError {
    pub fn transient(reason: TransientReason, message: impl Into<String>) -> Self {
        Self::Transient {
            reason,
            message: message.into(),
        }
    }

    pub fn permanent(reason: PermanentReason, message: impl Into<String>) -> Self {
        Self::Permanent {
            reason,
            message: message.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }

    /// The record stored on a `Failed` job.
    pub fn to_job_error(&self) -> Option<JobError> {
        match self {
            Self::Permanent { reason, message } => Some(JobError::new(reason.error_kind(), message.clone())),
            Self::Transient { .. } => None,
        }
    }
}

/// Successful engine output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractedResult {
    pub text: String,
}

impl ExtractedResult {
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }
}

/// The external AI/extraction engine.
#[async_trait]
pub trait ExtractionEngine: Send + Sync {
    async fn extract(&self, input: &[u8]) -> Result<ExtractedResult, ExtractionError>;
}

/// Engine backed by a plain function. Handy for local runs and tests.
pub struct FnEngine<F> {
    f: F,
}

impl<F> FnEngine<F>
where
    F: Fn(&[u8]) -> Result<ExtractedResult, ExtractionError> + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F> ExtractionEngine for FnEngine<F>
where
    F: Fn(&[u8]) -> Result<ExtractedResult, ExtractionError> + Send + Sync,
{
    async fn extract(&self, input: &[u8]) -> Result<ExtractedResult, ExtractionError> {
        (self.f)(input)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ExtractionLimits {
    pub max_input_bytes: usize,
}

impl Default for ExtractionLimits {
    fn default() -> Self {
        Self {
            max_input_bytes: DEFAULT_MAX_INPUT_BYTES,
        }
    }
}

/// Loads the input blob and runs the engine under a deadline.
///
/// On timeout the in-flight engine future is dropped, which cancels the
/// underlying request; nothing outlives `extract`.
#[derive(Clone)]
pub struct ExtractionClient {
    engine: Arc<dyn ExtractionEngine>,
    blobs: Arc<dyn BlobStore>,
    limits: ExtractionLimits,
}

impl ExtractionClient {
    pub fn new(engine: Arc<dyn ExtractionEngine>, blobs: Arc<dyn BlobStore>, limits: ExtractionLimits) -> Self {
        Self { engine, blobs, limits }
    }

    #[instrument(skip(self), fields(input = %input))]
    pub async fn extract(&self, input: &BlobRef, timeout: Duration) -> Result<ExtractedResult, ExtractionError> {
        match tokio::time::timeout(timeout, self.load_and_run(input)).await {
            Ok(result) => result,
            Err(_) => Err(ExtractionError::transient(
                TransientReason::Timeout,
                format!("extraction exceeded {}ms", timeout.as_millis()),
            )),
        }
    }

    async fn load_and_run(&self, input: &BlobRef) -> Result<ExtractedResult, ExtractionError> {
        let bytes = self.blobs.get(input).await.map_err(|e| match e {
            BlobError::NotFound(blob) => {
                ExtractionError::permanent(PermanentReason::MalformedInput, format!("input blob {blob} does not exist"))
            }
            BlobError::InvalidRef(msg) => ExtractionError::permanent(PermanentReason::MalformedInput, msg),
            BlobError::Io(msg) => ExtractionError::transient(TransientReason::BlobUnavailable, msg),
        })?;

        if bytes.is_empty() {
            return Err(ExtractionError::permanent(PermanentReason::MalformedInput, "input is empty"));
        }
        if bytes.len() > self.limits.max_input_bytes {
            return Err(ExtractionError::permanent(
                PermanentReason::InputTooLarge,
                format!("input is {} bytes, limit is {}", bytes.len(), self.limits.max_input_bytes),
            ));
        }

        debug!(len = bytes.len(), "calling extraction engine");
        self.engine.extract(&bytes).await
    }
}

#[cfg(test)]
mod tests {
    use crate::blob::InMemoryBlobStore;

    use super::*;

    struct SlowEngine;

    #[async_trait]
    impl ExtractionEngine for SlowEngine {
        async fn extract(&self, _input: &[u8]) -> Result<ExtractedResult, ExtractionError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(ExtractedResult::new("never"))
        }
    }

    fn upper() -> Arc<dyn ExtractionEngine> {
        Arc::new(FnEngine::new(|input: &[u8]| {
            Ok(ExtractedResult::new(String::from_utf8_lossy(input).to_uppercase()))
        }))
    }

    async fn client_with(engine: Arc<dyn ExtractionEngine>, input: &[u8], max: usize) -> (ExtractionClient, BlobRef) {
        let blobs = Arc::new(InMemoryBlobStore::new());
        let blob = blobs.put(input.to_vec()).await.unwrap();
        let client = ExtractionClient::new(engine, blobs, ExtractionLimits { max_input_bytes: max });
        (client, blob)
    }

    #[tokio::test]
    async fn extracts_through_the_engine() {
        let (client, blob) = client_with(upper(), b"doc-42", 1024).await;
        let result = client.extract(&blob, Duration::from_secs(1)).await.unwrap();
        assert_eq!(result.text, "DOC-42");
    }

    #[tokio::test(start_paused = true)]
    async fn slow_engine_times_out_as_transient() {
        let (client, blob) = client_with(Arc::new(SlowEngine), b"doc", 1024).await;
        let err = client.extract(&blob, Duration::from_secs(5)).await.unwrap_err();
        assert_eq!(
            err,
            ExtractionError::transient(TransientReason::Timeout, "extraction exceeded 5000ms")
        );
        assert!(err.is_transient());
        assert_eq!(err.to_job_error(), None);
    }

    #[tokio::test]
    async fn oversized_input_is_permanent() {
        let (client, blob) = client_with(upper(), &[b'x'; 64], 16).await;
        let err = client.extract(&blob, Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(
            err,
            ExtractionError::Permanent { reason: PermanentReason::InputTooLarge, .. }
        ));
        assert_eq!(err.to_job_error().unwrap().kind, ErrorKind::InputTooLarge);
    }

    #[tokio::test]
    async fn empty_or_missing_input_is_malformed() {
        let (client, blob) = client_with(upper(), b"", 16).await;
        let err = client.extract(&blob, Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, ExtractionError::Permanent { reason: PermanentReason::MalformedInput, .. }));

        let missing = BlobRef::new("jobs/none/input").unwrap();
        let err = client.extract(&missing, Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, ExtractionError::Permanent { reason: PermanentReason::MalformedInput, .. }));
    }

    #[test]
    fn permanent_reasons_map_to_job_error_kinds() {
        assert_eq!(PermanentReason::Rejected.error_kind(), ErrorKind::EngineRejected);
        assert_eq!(PermanentReason::UnsupportedFormat.error_kind(), ErrorKind::UnsupportedFormat);
    }
}
