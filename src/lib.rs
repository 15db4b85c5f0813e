//! # edgequake-docparse
//!
//! Extract text from long documents with a remote model by splitting them
//! into page-range chunks and processing the chunks in parallel.
//!
//! ## Why chunk?
//!
//! A 300-page PDF sent as one request runs into per-request token limits,
//! and one transient 503 throws away the whole call. Splitting into chunks
//! of a few pages keeps every request small, lets a bounded worker pool
//! send them concurrently, and confines a failure to the pages it
//! affected. The merged text is reassembled in page order regardless of
//! which chunk finished first.
//!
//! ## Pipeline Overview
//!
//! ```text
//! Document
//!  │
//!  ├─ 1. Input      resolve local file or download from URL
//!  ├─ 2. Plan       ceil(P / C) contiguous page ranges
//!  ├─ 3. Schedule   at most `max_threads` chunks in flight
//!  ├─ 4. Chunk job  extract pages (pdfium), inline or upload, optional cache handle
//!  ├─ 5. Retry      fixed delay, bounded attempts, cancellable
//!  └─ 6. Aggregate  index-ordered merge + per-chunk stats
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use edgequake_docparse::{DocumentProcessor, ProcessConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ProcessConfig::builder()
//!         .pages_per_chunk(5)
//!         .max_threads(2)
//!         .build()?;
//!     // Reads GEMINI_API_KEY
//!     let processor = DocumentProcessor::gemini_from_env(config)?;
//!     let output = processor.process_path("report.pdf").await?;
//!     println!("{}", output.text);
//!     eprintln!("{}/{} chunks ok",
//!         output.stats.succeeded_chunks,
//!         output.stats.total_chunks);
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Builds the `docparse` binary (clap, indicatif, tracing-subscriber) |
//!
//! Disable `cli` when using only the library:
//! ```toml
//! edgequake-docparse = { version = "0.1", default-features = false }
//! ```

// ── Modules ──────────────────────────────────────────────────────────────

pub mod cache;
pub mod config;
pub mod document;
pub mod error;
pub mod output;
pub mod pipeline;
pub mod processor;
pub mod progress;
pub mod prompts;
pub mod services;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use cache::{CacheKey, CacheManager, InMemoryResultCache, ResultCache};
pub use config::{ProcessConfig, ProcessConfigBuilder};
pub use document::{Document, PageRange};
pub use error::{ChunkError, DocParseError, ServiceError};
pub use output::{ChunkResult, FolderSummary, ProcessOutput, ProcessStats};
pub use pipeline::cancel::CancelToken;
pub use processor::DocumentProcessor;
pub use progress::{NoopProgressCallback, ProcessProgressCallback, ProgressCallback};
pub use services::gemini::GeminiClient;
pub use services::{
    CacheHandle, CacheService, ContentPart, ContentUploadService, FileHandle, Generation,
    GenerationConfig, InferenceService, PageSource,
};
