//! Pipeline stages for chunked document processing.
//!
//! Each submodule implements exactly one step, so each is testable on its
//! own and the remote seams can be swapped without touching the others.
//!
//! ## Data Flow
//!
//! ```text
//! input ──▶ planner ──▶ scheduler ──▶ worker ──▶ retry ──▶ aggregate
//! (path/URL) (ranges)   (W workers)  (one chunk) (fixed delay) (ordered merge)
//! ```
//!
//! 1. [`input`]     — resolve a path or URL and load it as a `Document`
//! 2. [`planner`]   — split the page count into contiguous chunk ranges
//! 3. [`scheduler`] — bounded worker pool; at most `max_threads` chunks in flight
//! 4. [`worker`]    — materialise, upload or inline, cache, generate
//! 5. [`retry`]     — fixed-delay attempts raced against [`cancel`]
//! 6. [`aggregate`] — place results by index and join the texts

pub mod aggregate;
pub mod cancel;
pub mod input;
pub mod planner;
pub mod retry;
pub mod scheduler;
pub mod worker;
