//! Result types returned by the processing entry points.

use crate::document::PageRange;
use crate::error::ChunkError;
use serde::Serialize;

/// Outcome of one chunk job.
#[derive(Debug, Clone, Serialize)]
pub struct ChunkResult {
    /// Zero-based sequence index of the chunk.
    pub index: usize,
    /// Pages covered by the chunk.
    pub pages: PageRange,
    /// Extracted text; empty when the chunk failed.
    pub text: String,
    /// Remote attempts made (0 when served from the result cache or when
    /// the chunk failed before reaching the service).
    pub attempts: u32,
    pub duration_ms: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    /// Cache handle left in place for this chunk (only with `keep_caches`).
    pub cache_name: Option<String>,
    /// Text came from the read-through result cache.
    pub from_result_cache: bool,
    /// Set when the chunk reached the failed terminal state.
    pub error: Option<ChunkError>,
}

impl ChunkResult {
    /// A failed result carrying no text.
    pub fn failed(index: usize, pages: PageRange, error: ChunkError) -> Self {
        Self {
            index,
            pages,
            text: String::new(),
            attempts: 0,
            duration_ms: 0,
            input_tokens: 0,
            output_tokens: 0,
            cache_name: None,
            from_result_cache: false,
            error: Some(error),
        }
    }

    /// A successful result with the given text.
    pub fn succeeded(index: usize, pages: PageRange, text: impl Into<String>) -> Self {
        Self {
            index,
            pages,
            text: text.into(),
            attempts: 0,
            duration_ms: 0,
            input_tokens: 0,
            output_tokens: 0,
            cache_name: None,
            from_result_cache: false,
            error: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Aggregate counters for one `process_*` call.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ProcessStats {
    pub total_pages: usize,
    pub total_chunks: usize,
    pub succeeded_chunks: usize,
    pub failed_chunks: usize,
    /// Chunks answered from the read-through result cache.
    pub cached_chunks: usize,
    pub total_input_tokens: u64,
    pub total_output_tokens: u64,
    pub duration_ms: u64,
}

/// Full output of a document run: merged text plus per-chunk detail.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ProcessOutput {
    /// Non-empty chunk texts joined with a blank line, in chunk order.
    pub text: String,
    /// One entry per chunk, ordered by index.
    pub chunks: Vec<ChunkResult>,
    pub stats: ProcessStats,
}

impl ProcessOutput {
    /// The document had no pages, so nothing was sent anywhere.
    pub fn is_empty_document(&self) -> bool {
        self.stats.total_chunks == 0
    }

    /// Chunks existed and every one of them failed.
    pub fn all_failed(&self) -> bool {
        self.stats.total_chunks > 0 && self.stats.succeeded_chunks == 0
    }

    /// Errors of the failed chunks, in chunk order.
    pub fn errors(&self) -> impl Iterator<Item = &ChunkError> {
        self.chunks.iter().filter_map(|c| c.error.as_ref())
    }
}

/// Summary of a folder run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct FolderSummary {
    /// Files that produced text and were written.
    pub written: Vec<std::path::PathBuf>,
    /// Files that produced no text (unreadable, unsupported, all chunks failed).
    pub skipped: Vec<std::path::PathBuf>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_is_not_all_failed() {
        let out = ProcessOutput::default();
        assert!(out.is_empty_document());
        assert!(!out.all_failed());
    }

    #[test]
    fn all_failed_requires_chunks() {
        let out = ProcessOutput {
            stats: ProcessStats {
                total_chunks: 2,
                failed_chunks: 2,
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(out.all_failed());
        assert!(!out.is_empty_document());
    }
}
