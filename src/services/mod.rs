//! Seams to the remote inference service and the page source.
//!
//! The pipeline only talks to these traits. Shipped implementations:
//!
//! - [`gemini::GeminiClient`] — REST client for generation, context caches
//!   and the File API; implements every remote trait.
//! - [`llm::LlmProviderService`] — any `edgequake_llm` provider, for plain
//!   (uncached) generation.
//! - [`pages::PdfiumPageSource`] / [`pages::WholeDocumentSource`] — page
//!   counting and page-range extraction.
//!
//! Tests substitute in-memory fakes.

pub mod gemini;
pub mod llm;
pub mod pages;

use crate::document::PageRange;
use crate::error::ServiceError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

/// One piece of request content.
#[derive(Clone, PartialEq)]
pub enum ContentPart {
    Text(String),
    /// Raw bytes sent inside the request body.
    Inline { mime_type: String, data: Vec<u8> },
    /// Reference to content previously uploaded through [`ContentUploadService`].
    File { mime_type: String, uri: String },
}

impl ContentPart {
    pub fn text(t: impl Into<String>) -> Self {
        ContentPart::Text(t.into())
    }

    pub fn inline(mime_type: impl Into<String>, data: Vec<u8>) -> Self {
        ContentPart::Inline {
            mime_type: mime_type.into(),
            data,
        }
    }

    pub fn from_file(file: &FileHandle) -> Self {
        ContentPart::File {
            mime_type: file.mime_type.clone(),
            uri: file.uri.clone(),
        }
    }
}

impl fmt::Debug for ContentPart {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContentPart::Text(t) => f.debug_tuple("Text").field(&t.len()).finish(),
            ContentPart::Inline { mime_type, data } => f
                .debug_struct("Inline")
                .field("mime_type", mime_type)
                .field("bytes", &data.len())
                .finish(),
            ContentPart::File { mime_type, uri } => f
                .debug_struct("File")
                .field("mime_type", mime_type)
                .field("uri", uri)
                .finish(),
        }
    }
}

/// Per-call generation settings.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GenerationConfig {
    pub system_instruction: Option<String>,
    pub temperature: Option<f32>,
    pub max_output_tokens: Option<usize>,
}

/// Text returned by a generation call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Generation {
    pub text: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl Generation {
    pub fn text(t: impl Into<String>) -> Self {
        Self {
            text: t.into(),
            ..Default::default()
        }
    }
}

/// Remote reference to cached content.
///
/// The service owns the cached bytes; this is metadata only.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheHandle {
    /// Remote identifier, e.g. `cachedContents/abc123`.
    pub name: String,
    pub model: String,
    pub display_name: Option<String>,
    /// Absolute expiry as reported by the service (RFC 3339).
    pub expire_time: Option<String>,
    /// Remaining lifetime in seconds, when known.
    pub ttl_seconds: Option<u64>,
    pub system_instruction: Option<String>,
    pub create_time: Option<String>,
    pub update_time: Option<String>,
    pub total_token_count: Option<u64>,
}

/// Remote reference to an uploaded file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FileHandle {
    /// Remote identifier, e.g. `files/abc123`.
    pub name: String,
    pub uri: String,
    pub mime_type: String,
    pub display_name: Option<String>,
    pub size_bytes: Option<u64>,
    /// Processing state (`PROCESSING`, `ACTIVE`, `FAILED`).
    pub state: Option<String>,
    pub expiration_time: Option<String>,
}

#[async_trait]
pub trait InferenceService: Send + Sync {
    /// Short backend name for logs.
    fn backend(&self) -> &str;

    async fn generate(
        &self,
        model: &str,
        parts: &[ContentPart],
        config: &GenerationConfig,
    ) -> Result<Generation, ServiceError>;

    async fn generate_with_cache(
        &self,
        model: &str,
        cache_name: &str,
        prompt: &str,
        config: &GenerationConfig,
    ) -> Result<Generation, ServiceError>;
}

#[async_trait]
pub trait CacheService: Send + Sync {
    async fn create_cache(
        &self,
        model: &str,
        contents: &[ContentPart],
        system_instruction: Option<&str>,
    ) -> Result<CacheHandle, ServiceError>;

    async fn update_cache_ttl(
        &self,
        name: &str,
        ttl_seconds: u64,
    ) -> Result<CacheHandle, ServiceError>;

    /// Metadata for every live handle. Never returns cached content.
    async fn list_caches(&self) -> Result<Vec<CacheHandle>, ServiceError>;

    async fn delete_cache(&self, name: &str) -> Result<(), ServiceError>;
}

#[async_trait]
pub trait ContentUploadService: Send + Sync {
    async fn upload(
        &self,
        data: Vec<u8>,
        mime_type: &str,
        display_name: Option<&str>,
    ) -> Result<FileHandle, ServiceError>;

    async fn list_files(&self) -> Result<Vec<FileHandle>, ServiceError>;

    async fn get_file(&self, name: &str) -> Result<FileHandle, ServiceError>;

    async fn delete_file(&self, name: &str) -> Result<(), ServiceError>;
}

/// Blocking page access for one document type.
///
/// Called from `spawn_blocking`; implementations may do CPU-heavy work.
pub trait PageSource: Send + Sync {
    /// Number of pages in `bytes`.
    fn page_count(&self, bytes: &[u8]) -> Result<usize, String>;

    /// Materialise the pages in `pages` as a standalone payload of the same type.
    fn extract(&self, bytes: &[u8], pages: PageRange) -> Result<Vec<u8>, String>;
}
