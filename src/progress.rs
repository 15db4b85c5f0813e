//! Progress-callback trait for per-chunk processing events.
//!
//! Inject an [`Arc<dyn ProcessProgressCallback>`] via
//! [`crate::config::ProcessConfigBuilder::progress_callback`] to receive
//! events as the worker pool finishes each chunk. Callers can forward them to
//! a channel, a progress bar or a metrics sink without the library knowing
//! how the host application reports progress.
//!
//! # Example
//!
//! ```rust
//! use edgequake_docparse::{ProcessConfig, ProcessProgressCallback};
//! use std::sync::{Arc, atomic::{AtomicUsize, Ordering}};
//!
//! struct CountingCallback {
//!     completed: AtomicUsize,
//! }
//!
//! impl ProcessProgressCallback for CountingCallback {
//!     fn on_chunk_complete(&self, index: usize, total_chunks: usize, text_len: usize) {
//!         self.completed.fetch_add(1, Ordering::SeqCst);
//!         eprintln!("chunk {}/{} done ({} bytes)", index + 1, total_chunks, text_len);
//!     }
//! }
//!
//! let config = ProcessConfig::builder()
//!     .progress_callback(Arc::new(CountingCallback { completed: AtomicUsize::new(0) }))
//!     .build()
//!     .unwrap();
//! ```

use std::sync::Arc;

/// Called by the pipeline as it processes each chunk.
///
/// Chunk events arrive from several worker tasks at once and in completion
/// order, not index order. Implementations must protect shared mutable state
/// with `Mutex`/atomics. All methods default to no-ops.
pub trait ProcessProgressCallback: Send + Sync {
    /// Called once after planning, before any chunk is dispatched.
    fn on_process_start(&self, total_chunks: usize) {
        let _ = total_chunks;
    }

    /// Called when a worker picks up a chunk (`index` is zero-based).
    fn on_chunk_start(&self, index: usize, total_chunks: usize) {
        let _ = (index, total_chunks);
    }

    /// Called when a chunk produced text.
    fn on_chunk_complete(&self, index: usize, total_chunks: usize, text_len: usize) {
        let _ = (index, total_chunks, text_len);
    }

    /// Called when a chunk reached a failed terminal state.
    fn on_chunk_error(&self, index: usize, total_chunks: usize, error: &str) {
        let _ = (index, total_chunks, error);
    }

    /// Called once after every chunk is terminal.
    fn on_process_complete(&self, total_chunks: usize, succeeded: usize) {
        let _ = (total_chunks, succeeded);
    }
}

/// A no-op implementation for callers that don't need progress events.
pub struct NoopProgressCallback;

impl ProcessProgressCallback for NoopProgressCallback {}

/// Convenience alias matching the type stored in [`crate::config::ProcessConfig`].
pub type ProgressCallback = Arc<dyn ProcessProgressCallback>;
