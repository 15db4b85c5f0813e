//! The per-chunk job: from a planned page range to a terminal [`ChunkResult`].
//!
//! ## Stages
//!
//! ```text
//! result cache? ──hit──▶ done
//!      │ miss
//!      ▼
//! materialise (spawn_blocking) ──▶ inline part | uploaded file
//!      │
//!      ├─ cache mode: create handle ─▶ set TTL ─▶ generate_with_cache (retried) ─▶ delete handle
//!      └─ plain:      generate (retried)
//!      ▼
//! store text in result cache ──▶ done
//! ```
//!
//! Chunk failures are folded into the returned result and never affect the
//! siblings. The exception is cache mode: a cache handle that cannot be
//! created, extended or generated against aborts the whole run. The runner
//! records that error, cancels its token and the processor returns it.
//!
//! Remote files and cache handles created for a chunk are held by a
//! [`RemoteGuard`], which deletes them when the job ends.

use crate::cache::{operation_key, CacheKey, CacheManager, CachedGenerationError, ResultCache};
use crate::config::ProcessConfig;
use crate::document::Document;
use crate::error::{ChunkError, DocParseError};
use crate::output::ChunkResult;
use crate::pipeline::cancel::CancelToken;
use crate::pipeline::planner::ChunkSpec;
use crate::pipeline::retry::{Retried, RetryExecutor};
use crate::pipeline::scheduler::JobRunner;
use crate::progress::{NoopProgressCallback, ProgressCallback};
use crate::prompts::chunk_prompt;
use crate::services::{
    ContentPart, ContentUploadService, Generation, GenerationConfig, InferenceService, PageSource,
};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;
use tracing::{debug, error, warn};

// ── Remote resource guard ────────────────────────────────────────────────

#[derive(Clone)]
pub(crate) enum RemoteResource {
    File(Arc<dyn ContentUploadService>),
    Cache(CacheManager),
}

impl RemoteResource {
    async fn delete(&self, name: &str) {
        match self {
            RemoteResource::File(service) => {
                if let Err(e) = service.delete_file(name).await {
                    warn!("Could not delete uploaded file {}: {}", name, e);
                }
            }
            RemoteResource::Cache(manager) => manager.delete_cache(name).await,
        }
    }
}

/// Owns one remote file or cache handle until released.
///
/// [`RemoteGuard::release`] deletes it inline. If the guard is dropped
/// without being released (the job future was dropped mid-flight), the
/// delete is spawned onto the current runtime instead.
pub(crate) struct RemoteGuard {
    resource: RemoteResource,
    name: Option<String>,
}

impl RemoteGuard {
    pub(crate) fn new(resource: RemoteResource, name: impl Into<String>) -> Self {
        Self {
            resource,
            name: Some(name.into()),
        }
    }

    pub(crate) async fn release(mut self) {
        if let Some(name) = self.name.take() {
            self.resource.delete(&name).await;
        }
    }

    /// Leave the resource in place and return its name.
    pub(crate) fn keep(mut self) -> Option<String> {
        self.name.take()
    }
}

impl Drop for RemoteGuard {
    fn drop(&mut self) {
        let Some(name) = self.name.take() else { return };
        let resource = self.resource.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move { resource.delete(&name).await });
            }
            Err(_) => warn!("No runtime to delete remote resource {}; it will expire", name),
        }
    }
}

// ── Chunk runner ─────────────────────────────────────────────────────────

/// Everything a chunk job needs, shared read-only across workers.
pub struct ChunkRunner {
    pub(crate) document: Document,
    pub(crate) total_pages: usize,
    pub(crate) config: Arc<ProcessConfig>,
    pub(crate) page_source: Arc<dyn PageSource>,
    pub(crate) inference: Arc<dyn InferenceService>,
    pub(crate) uploads: Option<Arc<dyn ContentUploadService>>,
    pub(crate) caches: Option<CacheManager>,
    pub(crate) result_cache: Option<Arc<dyn ResultCache>>,
    pub(crate) retry: RetryExecutor,
    pub(crate) cancel: CancelToken,
    pub(crate) progress: ProgressCallback,
    fatal: Mutex<Option<DocParseError>>,
}

/// How a chunk ended without text.
enum ChunkFailure {
    /// Confined to this chunk.
    Chunk(ChunkError),
    /// Aborts the run.
    Fatal(DocParseError),
}

impl From<ChunkError> for ChunkFailure {
    fn from(e: ChunkError) -> Self {
        ChunkFailure::Chunk(e)
    }
}

impl ChunkRunner {
    pub fn new(
        document: Document,
        total_pages: usize,
        config: Arc<ProcessConfig>,
        page_source: Arc<dyn PageSource>,
        inference: Arc<dyn InferenceService>,
        cancel: CancelToken,
    ) -> Self {
        let retry = RetryExecutor::from_config(&config);
        let progress = config
            .progress_callback
            .clone()
            .unwrap_or_else(|| Arc::new(NoopProgressCallback));
        Self {
            document,
            total_pages,
            config,
            page_source,
            inference,
            uploads: None,
            caches: None,
            result_cache: None,
            retry,
            cancel,
            progress,
            fatal: Mutex::new(None),
        }
    }

    pub fn with_uploads(mut self, uploads: Option<Arc<dyn ContentUploadService>>) -> Self {
        self.uploads = uploads;
        self
    }

    pub fn with_caches(mut self, caches: Option<CacheManager>) -> Self {
        self.caches = caches;
        self
    }

    pub fn with_result_cache(mut self, cache: Option<Arc<dyn ResultCache>>) -> Self {
        self.result_cache = cache;
        self
    }

    /// The error that aborted the run, if any. Only the first is kept.
    pub async fn take_fatal(&self) -> Option<DocParseError> {
        self.fatal.lock().await.take()
    }

    fn generation_config(&self) -> GenerationConfig {
        GenerationConfig {
            system_instruction: None,
            temperature: self.config.temperature,
            max_output_tokens: self.config.max_output_tokens,
        }
    }

    /// Bytes for `chunk`. A chunk spanning the whole document is the
    /// document itself; anything else is cut out on a blocking thread.
    async fn materialise(&self, chunk: &ChunkSpec) -> Result<Vec<u8>, ChunkError> {
        if chunk.pages.start == 0 && chunk.pages.end == self.total_pages {
            return Ok(self.document.bytes().to_vec());
        }
        let source = Arc::clone(&self.page_source);
        let bytes = self.document.shared_bytes();
        let pages = chunk.pages;
        tokio::task::spawn_blocking(move || source.extract(&bytes, pages))
            .await
            .map_err(|e| ChunkError::Materialize {
                index: chunk.index,
                detail: format!("extraction task panicked: {e}"),
            })?
            .map_err(|detail| ChunkError::Materialize {
                index: chunk.index,
                detail,
            })
    }

    /// Turn the payload into a request part, uploading it when it is too
    /// large to send inline and an upload service is attached.
    async fn content_part(
        &self,
        chunk: &ChunkSpec,
        payload: Vec<u8>,
    ) -> Result<(ContentPart, Option<RemoteGuard>), ChunkError> {
        let mime = self.document.mime_type().to_string();
        let uploads = match self.uploads {
            Some(ref u) if payload.len() > self.config.inline_limit_bytes => u,
            _ => return Ok((ContentPart::inline(mime, payload), None)),
        };

        let display_name = format!("{}#{}", self.document.id(), chunk.pages);
        debug!(
            "Chunk {}: uploading {} bytes as {}",
            chunk.index,
            payload.len(),
            display_name
        );
        let file = uploads
            .upload(payload, &mime, Some(&display_name))
            .await
            .map_err(|e| ChunkError::Upload {
                index: chunk.index,
                detail: e.to_string(),
            })?;
        let guard = RemoteGuard::new(RemoteResource::File(Arc::clone(uploads)), file.name.clone());
        Ok((ContentPart::from_file(&file), Some(guard)))
    }

    /// Cache mode: wrap the chunk in its own handle and prompt against it.
    ///
    /// Create and TTL failures are not retried; generation is. Any of them
    /// is fatal to the run.
    async fn generate_cached(
        &self,
        chunk: &ChunkSpec,
        part: ContentPart,
        prompt: &str,
    ) -> Result<(Retried<Generation>, Option<String>), ChunkFailure> {
        let manager = self.caches.as_ref().ok_or_else(|| {
            ChunkFailure::Fatal(DocParseError::Unsupported {
                capability: "context caching",
                hint: "attach a cache service or disable use_cache".into(),
            })
        })?;
        // A sibling may have aborted the run while this chunk materialised.
        if self.cancel.is_cancelled() {
            return Err(ChunkError::Cancelled {
                index: chunk.index,
                attempts: 0,
            }
            .into());
        }

        let handle = manager
            .create_cache(
                &self.config.model,
                &[part],
                Some(&self.config.cache_system_instruction),
            )
            .await
            .map_err(ChunkFailure::Fatal)?;
        let guard = RemoteGuard::new(RemoteResource::Cache(manager.clone()), handle.name.clone());

        if let Some(hours) = self.config.cache_ttl_hours {
            if let Err(e) = manager.update_cache_ttl(&handle.name, hours).await {
                guard.release().await;
                return Err(ChunkFailure::Fatal(e));
            }
        }

        let outcome = manager
            .generate_with_cache_retried(
                &self.retry,
                &self.cancel,
                chunk.index,
                &self.config.model,
                &handle.name,
                prompt,
                &self.generation_config(),
            )
            .await;

        let kept = if self.config.keep_caches {
            guard.keep()
        } else {
            guard.release().await;
            None
        };
        match outcome {
            Ok(retried) => Ok((retried, kept)),
            Err(CachedGenerationError::Cancelled { attempts }) => Err(ChunkError::Cancelled {
                index: chunk.index,
                attempts,
            }
            .into()),
            Err(CachedGenerationError::Failed { error, .. }) => Err(ChunkFailure::Fatal(error)),
        }
    }

    async fn generate_plain(
        &self,
        chunk: &ChunkSpec,
        part: ContentPart,
        prompt: &str,
    ) -> Result<Retried<Generation>, ChunkError> {
        let parts = [part, ContentPart::text(prompt)];
        let gen_config = self.generation_config();
        let model = self.config.model.as_str();
        let inference = &self.inference;
        self.retry
            .run(chunk.index, &self.cancel, |_| {
                inference.generate(model, &parts, &gen_config)
            })
            .await
    }

    /// Materialise, send and collect one chunk. Returns the generation,
    /// its attempt count and any kept cache handle.
    async fn execute(
        &self,
        chunk: &ChunkSpec,
        prompt: &str,
    ) -> Result<(Retried<Generation>, Option<String>), ChunkFailure> {
        if self.cancel.is_cancelled() {
            return Err(ChunkError::Cancelled {
                index: chunk.index,
                attempts: 0,
            }
            .into());
        }

        let payload = self.materialise(chunk).await?;
        let (part, upload) = self.content_part(chunk, payload).await?;

        let outcome = if self.config.use_cache {
            self.generate_cached(chunk, part, prompt).await
        } else {
            self.generate_plain(chunk, part, prompt)
                .await
                .map(|retried| (retried, None))
                .map_err(ChunkFailure::from)
        };

        if let Some(guard) = upload {
            guard.release().await;
        }
        outcome
    }
}

#[async_trait]
impl JobRunner for ChunkRunner {
    async fn run(&self, chunk: &ChunkSpec, total_chunks: usize) -> ChunkResult {
        let started = Instant::now();
        self.progress.on_chunk_start(chunk.index, total_chunks);

        let prompt = chunk_prompt(
            &self.config.prompt,
            chunk.pages.start,
            chunk.pages.end,
            self.total_pages,
            total_chunks,
        );
        let key = CacheKey::new(
            self.document.id(),
            operation_key(&self.config.model, &prompt),
            chunk.pages,
        );

        if let Some(ref cache) = self.result_cache {
            if let Some(text) = cache.get(&key).await {
                debug!("Chunk {}: served from result cache", chunk.index);
                self.progress
                    .on_chunk_complete(chunk.index, total_chunks, text.len());
                let mut result = ChunkResult::succeeded(chunk.index, chunk.pages, text);
                result.from_result_cache = true;
                result.duration_ms = started.elapsed().as_millis() as u64;
                return result;
            }
        }

        match self.execute(chunk, &prompt).await {
            Ok((retried, cache_name)) => {
                let gen = retried.value;
                if let Some(ref cache) = self.result_cache {
                    if !gen.text.is_empty() {
                        cache.put(key, gen.text.clone()).await;
                    }
                }
                self.progress
                    .on_chunk_complete(chunk.index, total_chunks, gen.text.len());

                let mut result = ChunkResult::succeeded(chunk.index, chunk.pages, gen.text);
                result.attempts = retried.attempts;
                result.input_tokens = gen.input_tokens;
                result.output_tokens = gen.output_tokens;
                result.cache_name = cache_name;
                result.duration_ms = started.elapsed().as_millis() as u64;
                result
            }
            Err(ChunkFailure::Fatal(fatal)) => {
                error!("Chunk {}: {}; aborting the run", chunk.index, fatal);
                let e = ChunkError::Cache {
                    index: chunk.index,
                    detail: fatal.to_string(),
                };
                self.fatal.lock().await.get_or_insert(fatal);
                self.cancel.cancel();
                self.progress
                    .on_chunk_error(chunk.index, total_chunks, &e.to_string());
                let mut result = ChunkResult::failed(chunk.index, chunk.pages, e);
                result.duration_ms = started.elapsed().as_millis() as u64;
                result
            }
            Err(ChunkFailure::Chunk(e)) => {
                self.progress
                    .on_chunk_error(chunk.index, total_chunks, &e.to_string());
                let attempts = match e {
                    ChunkError::RetryExhausted { attempts, .. }
                    | ChunkError::Cancelled { attempts, .. } => attempts,
                    _ => 0,
                };
                let mut result = ChunkResult::failed(chunk.index, chunk.pages, e);
                result.attempts = attempts;
                result.duration_ms = started.elapsed().as_millis() as u64;
                result
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::PageRange;
    use crate::error::ServiceError;
    use crate::pipeline::planner::plan_chunks;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Echo {
        calls: AtomicUsize,
        fail_first: usize,
    }

    #[async_trait]
    impl InferenceService for Echo {
        fn backend(&self) -> &str {
            "echo"
        }

        async fn generate(
            &self,
            _model: &str,
            parts: &[ContentPart],
            _config: &GenerationConfig,
        ) -> Result<Generation, ServiceError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_first {
                return Err(ServiceError::Api {
                    operation: "generate",
                    status: 503,
                    message: "overloaded".into(),
                });
            }
            match &parts[0] {
                ContentPart::Inline { data, .. } => {
                    Ok(Generation::text(String::from_utf8_lossy(data).into_owned()))
                }
                other => Ok(Generation::text(format!("{other:?}"))),
            }
        }

        async fn generate_with_cache(
            &self,
            _model: &str,
            _cache_name: &str,
            _prompt: &str,
            _config: &GenerationConfig,
        ) -> Result<Generation, ServiceError> {
            unreachable!("cache mode is off")
        }
    }

    /// Each page is one byte of the document.
    struct BytePages;

    impl PageSource for BytePages {
        fn page_count(&self, bytes: &[u8]) -> Result<usize, String> {
            Ok(bytes.len())
        }

        fn extract(&self, bytes: &[u8], pages: PageRange) -> Result<Vec<u8>, String> {
            if bytes[pages.start] == b'!' {
                return Err("damaged page".into());
            }
            Ok(bytes[pages.start..pages.end].to_vec())
        }
    }

    fn runner(bytes: &[u8], fail_first: usize) -> ChunkRunner {
        let config = ProcessConfig::builder()
            .pages_per_chunk(2)
            .retry_delay_ms(1)
            .build()
            .unwrap();
        ChunkRunner::new(
            Document::new("doc.txt", bytes.to_vec(), "text/plain"),
            bytes.len(),
            Arc::new(config),
            Arc::new(BytePages),
            Arc::new(Echo {
                calls: AtomicUsize::new(0),
                fail_first,
            }),
            CancelToken::new(),
        )
    }

    #[tokio::test]
    async fn chunk_text_comes_from_its_own_pages() {
        let r = runner(b"abcdef", 0);
        let chunks = plan_chunks("doc.txt", 6, 2).unwrap();
        let result = r.run(&chunks[1], chunks.len()).await;
        assert!(result.is_success());
        assert_eq!(result.text, "cd");
        assert_eq!(result.attempts, 1);
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let r = runner(b"abcd", 2);
        let chunks = plan_chunks("doc.txt", 4, 2).unwrap();
        let result = r.run(&chunks[0], chunks.len()).await;
        assert_eq!(result.text, "ab");
        assert_eq!(result.attempts, 3);
    }

    #[tokio::test]
    async fn extraction_failure_is_attributed_to_the_chunk() {
        let r = runner(b"ab!d", 0);
        let chunks = plan_chunks("doc.txt", 4, 2).unwrap();
        let result = r.run(&chunks[1], chunks.len()).await;
        assert!(matches!(
            result.error,
            Some(ChunkError::Materialize { index: 1, .. })
        ));
        assert_eq!(result.attempts, 0);
    }

    #[tokio::test]
    async fn cancelled_runner_makes_no_calls() {
        let r = runner(b"abcd", 0);
        r.cancel.cancel();
        let chunks = plan_chunks("doc.txt", 4, 2).unwrap();
        let result = r.run(&chunks[0], chunks.len()).await;
        assert!(matches!(result.error, Some(ChunkError::Cancelled { .. })));
    }

    #[tokio::test]
    async fn cache_mode_without_cache_service_aborts_the_run() {
        let mut r = runner(b"abcd", 0);
        let mut config = (*r.config).clone();
        config.use_cache = true;
        r.config = Arc::new(config);
        let chunks = plan_chunks("doc.txt", 4, 2).unwrap();

        let result = r.run(&chunks[0], chunks.len()).await;
        assert!(matches!(result.error, Some(ChunkError::Cache { index: 0, .. })));
        assert!(r.cancel.is_cancelled());

        let second = r.run(&chunks[1], chunks.len()).await;
        assert!(matches!(second.error, Some(ChunkError::Cancelled { .. })));
        assert!(matches!(
            r.take_fatal().await,
            Some(DocParseError::Unsupported { .. })
        ));
        assert!(r.take_fatal().await.is_none());
    }
}
