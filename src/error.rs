//! Error types for the edgequake-docparse library.
//!
//! Three error types reflect three distinct failure scopes:
//!
//! * [`DocParseError`] — **Fatal** for one call: the document cannot be
//!   processed at all (missing file, invalid configuration, cache handle that
//!   could not be created). Returned as `Err(DocParseError)` from the
//!   `process_*` entry points that return `Result`.
//!
//! * [`ChunkError`] — **Non-fatal**: one chunk failed (its pages could not be
//!   extracted, or every attempt against the remote service failed) while
//!   its siblings are fine. Stored inside [`crate::output::ChunkResult`] so
//!   the merged text is always the best-effort result of whatever succeeded.
//!
//! * [`ServiceError`] — what a remote collaborator returned. The retry
//!   executor consumes these; the cache manager wraps them in
//!   [`DocParseError::Cache`].

use std::path::PathBuf;
use thiserror::Error;

/// All fatal errors returned by the edgequake-docparse library.
#[derive(Debug, Error)]
pub enum DocParseError {
    // ── Input errors ──────────────────────────────────────────────────────
    /// Input file was not found at the given path.
    #[error("Document not found: '{path}'\nCheck the path exists and is readable.")]
    FileNotFound { path: PathBuf },

    /// Process does not have read permission on the file.
    #[error("Permission denied reading '{path}'\nTry: chmod +r {path:?}")]
    PermissionDenied { path: PathBuf },

    /// The input string is not a valid file path or URL.
    #[error("Invalid input '{input}': {reason}")]
    InvalidInput { input: String, reason: String },

    /// The file extension does not map to a MIME type the service accepts.
    #[error("Unsupported document type for '{path}' (extension {extension:?})")]
    UnsupportedMimeType { path: PathBuf, extension: String },

    /// HTTP URL was syntactically valid but download failed.
    #[error("Failed to download '{url}': {reason}\nCheck your internet connection.")]
    DownloadFailed { url: String, reason: String },

    /// Download exceeded the configured timeout.
    #[error("Download timed out after {secs}s for '{url}'\nIncrease --download-timeout.")]
    DownloadTimeout { url: String, secs: u64 },

    // ── Document errors ───────────────────────────────────────────────────
    /// The page source could not open the document (before chunk planning).
    #[error("Could not read pages of '{document}': {detail}")]
    PageSource { document: String, detail: String },

    /// Uploading a whole document (not a chunk) failed.
    #[error("Upload of '{document}' failed: {source}")]
    Upload {
        document: String,
        #[source]
        source: ServiceError,
    },

    /// Direct (unchunked) generation failed.
    #[error("Generation failed: {0}")]
    Generation(#[source] ServiceError),

    // ── Cache errors ──────────────────────────────────────────────────────
    /// A cache-management call failed. Create, update and generate-with-cache
    /// failures are always propagated; there is no uncached fallback.
    #[error("Cache {operation} failed for '{name}': {source}")]
    Cache {
        operation: &'static str,
        name: String,
        #[source]
        source: ServiceError,
    },

    // ── Provider errors ───────────────────────────────────────────────────
    /// The configured provider is not initialised (missing API key etc.).
    #[error("Provider '{provider}' is not configured.\n{hint}")]
    ProviderNotConfigured { provider: String, hint: String },

    /// The attached service does not offer the requested capability.
    #[error("{capability} is not available: {hint}")]
    Unsupported {
        capability: &'static str,
        hint: String,
    },

    // ── I/O errors ────────────────────────────────────────────────────────
    /// Could not create or write an output file.
    #[error("Failed to write output file '{path}': {source}")]
    OutputWriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ── Config errors ─────────────────────────────────────────────────────
    /// Builder or planner validation failed. Never retried.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// A non-fatal error for a single chunk.
///
/// Stored alongside [`crate::output::ChunkResult`] when a chunk fails.
/// The chunk contributes no text; its siblings keep their positions.
#[derive(Debug, Clone, PartialEq, Error, serde::Serialize, serde::Deserialize)]
pub enum ChunkError {
    /// The chunk's page range could not be extracted from the document.
    #[error("Chunk {index}: page extraction failed: {detail}")]
    Materialize { index: usize, detail: String },

    /// The chunk payload could not be uploaded to the remote service.
    #[error("Chunk {index}: upload failed: {detail}")]
    Upload { index: usize, detail: String },

    /// Cache-backed processing could not create or extend the cache handle.
    #[error("Chunk {index}: cache setup failed: {detail}")]
    Cache { index: usize, detail: String },

    /// Every attempt against the remote service failed.
    #[error("Chunk {index}: remote call failed after {attempts} attempts: {detail}")]
    RetryExhausted {
        index: usize,
        attempts: u32,
        detail: String,
    },

    /// The run was cancelled (or its deadline passed) before the chunk finished.
    #[error("Chunk {index}: cancelled after {attempts} attempts")]
    Cancelled { index: usize, attempts: u32 },

    /// The worker running the chunk stopped without reporting a result.
    #[error("Chunk {index}: worker aborted: {detail}")]
    Aborted { index: usize, detail: String },
}

impl ChunkError {
    /// Sequence index of the chunk this error belongs to.
    pub fn index(&self) -> usize {
        match self {
            ChunkError::Materialize { index, .. }
            | ChunkError::Upload { index, .. }
            | ChunkError::Cache { index, .. }
            | ChunkError::RetryExhausted { index, .. }
            | ChunkError::Cancelled { index, .. }
            | ChunkError::Aborted { index, .. } => *index,
        }
    }
}

/// Failure reported by a remote collaborator (inference, cache or upload API).
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ServiceError {
    /// Transport-level failure (DNS, TLS, connection reset).
    #[error("{operation}: request failed: {reason}")]
    Http {
        operation: &'static str,
        reason: String,
    },

    /// The call did not complete within its time budget.
    #[error("{operation}: timed out after {secs}s")]
    Timeout { operation: &'static str, secs: u64 },

    /// The service answered with a non-success status.
    #[error("{operation}: HTTP {status}: {message}")]
    Api {
        operation: &'static str,
        status: u16,
        message: String,
    },

    /// The service answered but the body could not be understood.
    #[error("{operation}: unexpected response: {detail}")]
    InvalidResponse {
        operation: &'static str,
        detail: String,
    },

    /// The backend cannot perform this operation at all.
    #[error("{operation} is not supported by the {backend} backend")]
    Unsupported {
        operation: &'static str,
        backend: String,
    },
}

impl ServiceError {
    /// Whether repeating the same call could plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, ServiceError::Unsupported { .. })
    }

    /// HTTP status of an API error, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            ServiceError::Api { status, .. } => Some(*status),
            _ => None,
        }
    }
}
