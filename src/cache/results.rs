//! Read-through cache of chunk texts.
//!
//! Keyed by document, operation and page range. The operation string is
//! derived from the model and prompt, so changing either invalidates
//! earlier entries. Only successful texts are stored.

use crate::document::PageRange;
use async_trait::async_trait;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::RwLock;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub document_id: String,
    pub operation: String,
    pub pages: PageRange,
}

impl CacheKey {
    pub fn new(
        document_id: impl Into<String>,
        operation: impl Into<String>,
        pages: PageRange,
    ) -> Self {
        Self {
            document_id: document_id.into(),
            operation: operation.into(),
            pages,
        }
    }
}

/// Operation identifier for a model + prompt pair: `"{model}:{hash:016x}"`.
pub fn operation_key(model: &str, prompt: &str) -> String {
    let mut hasher = DefaultHasher::new();
    prompt.hash(&mut hasher);
    format!("{model}:{:016x}", hasher.finish())
}

#[async_trait]
pub trait ResultCache: Send + Sync {
    async fn get(&self, key: &CacheKey) -> Option<String>;
    async fn put(&self, key: CacheKey, text: String);
}

/// Hit/miss counters of an [`InMemoryResultCache`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResultCacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
}

/// Process-local result cache.
#[derive(Debug, Default)]
pub struct InMemoryResultCache {
    entries: RwLock<HashMap<CacheKey, String>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl InMemoryResultCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn stats(&self) -> ResultCacheStats {
        ResultCacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries: self.entries.read().await.len(),
        }
    }

    pub async fn clear(&self) {
        self.entries.write().await.clear();
    }
}

#[async_trait]
impl ResultCache for InMemoryResultCache {
    async fn get(&self, key: &CacheKey) -> Option<String> {
        let found = self.entries.read().await.get(key).cloned();
        let counter = if found.is_some() { &self.hits } else { &self.misses };
        counter.fetch_add(1, Ordering::Relaxed);
        found
    }

    async fn put(&self, key: CacheKey, text: String) {
        self.entries.write().await.insert(key, text);
    }
}
