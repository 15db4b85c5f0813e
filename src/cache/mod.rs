//! Caching: remote context-cache handles and the local result cache.
//!
//! - [`manager`] — create / update / list / delete handles on the remote
//!   service through [`crate::services::CacheService`].
//! - [`results`] — optional read-through cache of chunk texts, so re-running
//!   the same document with the same model and prompt skips finished chunks.

pub mod manager;
pub mod results;

pub use manager::{hours_to_ttl_seconds, CacheManager, CachedGenerationError};
pub use results::{operation_key, CacheKey, InMemoryResultCache, ResultCache, ResultCacheStats};
