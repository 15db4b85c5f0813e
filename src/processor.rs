//! Document-level entry points.
//!
//! [`DocumentProcessor`] ties the pipeline stages to a set of remote
//! services. One processor can be shared across tasks: it holds only
//! `Arc`s and an immutable config.
//!
//! ## Two error surfaces
//!
//! The `process_*` methods that return `Result` report fatal problems
//! (missing file, unsupported type, bad configuration, unreadable PDF) as
//! [`DocParseError`]. Per-chunk failures never become fatal; they are
//! recorded on the output's chunk results.
//!
//! The `String`-returning conveniences ([`DocumentProcessor::process_file`],
//! [`DocumentProcessor::process_from_url`],
//! [`DocumentProcessor::process_multiple_files`]) log fatal errors and
//! return an empty string instead, so batch callers such as
//! [`DocumentProcessor::process_folder`] keep going past bad inputs.

use crate::cache::{CacheManager, ResultCache};
use crate::config::ProcessConfig;
use crate::document::Document;
use crate::error::DocParseError;
use crate::output::{FolderSummary, ProcessOutput};
use crate::pipeline::aggregate::{merge_texts, summarise};
use crate::pipeline::cancel::CancelToken;
use crate::pipeline::input;
use crate::pipeline::planner::plan_chunks;
use crate::pipeline::scheduler::Scheduler;
use crate::pipeline::worker::{ChunkRunner, RemoteGuard, RemoteResource};
use crate::services::gemini::GeminiClient;
use crate::services::llm::LlmProviderService;
use crate::services::pages::{PdfiumPageSource, WholeDocumentSource};
use crate::services::{
    CacheHandle, CacheService, ContentPart, ContentUploadService, GenerationConfig,
    InferenceService, PageSource,
};
use edgequake_llm::LLMProvider;
use futures::future::join_all;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

#[derive(Clone)]
pub struct DocumentProcessor {
    config: Arc<ProcessConfig>,
    inference: Arc<dyn InferenceService>,
    caches: Option<CacheManager>,
    uploads: Option<Arc<dyn ContentUploadService>>,
    result_cache: Option<Arc<dyn ResultCache>>,
    pdf_source: Arc<dyn PageSource>,
    text_source: Arc<dyn PageSource>,
}

impl std::fmt::Debug for DocumentProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocumentProcessor")
            .field("backend", &self.inference.backend())
            .field("config", &self.config)
            .field("caches", &self.caches.is_some())
            .field("uploads", &self.uploads.is_some())
            .field("result_cache", &self.result_cache.is_some())
            .finish()
    }
}

impl DocumentProcessor {
    /// A processor that generates through `inference`, with no cache or
    /// upload service attached. PDFs are split with pdfium.
    pub fn new(
        inference: Arc<dyn InferenceService>,
        config: ProcessConfig,
    ) -> Result<Self, DocParseError> {
        config.validate()?;
        Ok(Self {
            config: Arc::new(config),
            inference,
            caches: None,
            uploads: None,
            result_cache: None,
            pdf_source: Arc::new(PdfiumPageSource::new()),
            text_source: Arc::new(WholeDocumentSource),
        })
    }

    /// One [`GeminiClient`] behind every seam.
    pub fn gemini(
        api_key: impl Into<String>,
        config: ProcessConfig,
    ) -> Result<Self, DocParseError> {
        Self::with_gemini_client(Arc::new(GeminiClient::new(api_key)?), config)
    }

    /// Like [`DocumentProcessor::gemini`], reading the key from `GEMINI_API_KEY`.
    pub fn gemini_from_env(config: ProcessConfig) -> Result<Self, DocParseError> {
        Self::with_gemini_client(Arc::new(GeminiClient::from_env()?), config)
    }

    pub fn with_gemini_client(
        client: Arc<GeminiClient>,
        config: ProcessConfig,
    ) -> Result<Self, DocParseError> {
        Ok(Self::new(client.clone(), config)?
            .with_cache_service(client.clone())
            .with_upload_service(client))
    }

    /// Generate through an `edgequake_llm` provider. Cache mode and uploads
    /// are unavailable with this backend.
    pub fn from_llm_provider(
        provider: Arc<dyn LLMProvider>,
        label: impl Into<String>,
        config: ProcessConfig,
    ) -> Result<Self, DocParseError> {
        Self::new(Arc::new(LlmProviderService::new(provider, label)), config)
    }

    pub fn with_cache_service(mut self, caches: Arc<dyn CacheService>) -> Self {
        self.caches = Some(CacheManager::new(caches, Arc::clone(&self.inference)));
        self
    }

    pub fn with_upload_service(mut self, uploads: Arc<dyn ContentUploadService>) -> Self {
        self.uploads = Some(uploads);
        self
    }

    pub fn with_result_cache(mut self, cache: Arc<dyn ResultCache>) -> Self {
        self.result_cache = Some(cache);
        self
    }

    pub fn with_pdf_source(mut self, source: Arc<dyn PageSource>) -> Self {
        self.pdf_source = source;
        self
    }

    pub fn config(&self) -> &ProcessConfig {
        &self.config
    }

    pub fn cache_manager(&self) -> Option<&CacheManager> {
        self.caches.as_ref()
    }

    pub fn upload_service(&self) -> Option<&Arc<dyn ContentUploadService>> {
        self.uploads.as_ref()
    }

    fn page_source_for(&self, document: &Document) -> Arc<dyn PageSource> {
        if document.is_pdf() {
            Arc::clone(&self.pdf_source)
        } else {
            Arc::clone(&self.text_source)
        }
    }

    fn generation_config(&self, system_instruction: Option<String>) -> GenerationConfig {
        GenerationConfig {
            system_instruction,
            temperature: self.config.temperature,
            max_output_tokens: self.config.max_output_tokens,
        }
    }

    // ── Document processing ──────────────────────────────────────────────

    /// Split `document` into chunks, process them in parallel and merge the
    /// texts in page order.
    pub async fn process_document(
        &self,
        document: Document,
    ) -> Result<ProcessOutput, DocParseError> {
        self.process_with_cancel(document, CancelToken::new()).await
    }

    /// [`DocumentProcessor::process_document`] with a caller-held token.
    ///
    /// Cancelling the token (or reaching `deadline_secs`) stops queued and
    /// in-flight chunks at their next await point; they finish as
    /// `ChunkError::Cancelled` and the output holds whatever completed.
    ///
    /// In cache mode a handle that cannot be created, extended or generated
    /// against stops the run and is returned as `DocParseError::Cache`.
    pub async fn process_with_cancel(
        &self,
        document: Document,
        cancel: CancelToken,
    ) -> Result<ProcessOutput, DocParseError> {
        let started = Instant::now();
        self.config.validate()?;
        info!(
            "Processing {} ({} bytes, {})",
            document.id(),
            document.len(),
            document.mime_type()
        );

        // ── Step 1: Count pages ──────────────────────────────────────────
        let source = self.page_source_for(&document);
        let total_pages = {
            let source = Arc::clone(&source);
            let bytes = document.shared_bytes();
            tokio::task::spawn_blocking(move || source.page_count(&bytes))
                .await
                .map_err(|e| DocParseError::Internal(format!("page count task: {e}")))?
                .map_err(|detail| DocParseError::PageSource {
                    document: document.id().to_string(),
                    detail,
                })?
        };
        debug!("{} has {} pages", document.id(), total_pages);

        // ── Step 2: Plan ─────────────────────────────────────────────────
        let chunks = plan_chunks(document.id(), total_pages, self.config.pages_per_chunk)?;
        if chunks.is_empty() {
            let stats = summarise(&[], 0, started.elapsed().as_millis() as u64);
            return Ok(ProcessOutput {
                text: String::new(),
                chunks: Vec::new(),
                stats,
            });
        }

        if let Some(ref cb) = self.config.progress_callback {
            cb.on_process_start(chunks.len());
        }

        // ── Step 3: Fan out ──────────────────────────────────────────────
        // The run gets its own token so a fatal cache failure can stop the
        // siblings without cancelling the caller's token.
        let (run_cancel, _link) = cancel.child();
        let _deadline = self
            .config
            .deadline_secs
            .map(|secs| run_cancel.arm_deadline(Duration::from_secs(secs)));

        let runner = Arc::new(
            ChunkRunner::new(
                document,
                total_pages,
                Arc::clone(&self.config),
                source,
                Arc::clone(&self.inference),
                run_cancel,
            )
            .with_uploads(self.uploads.clone())
            .with_caches(self.caches.clone())
            .with_result_cache(self.result_cache.clone()),
        );

        let results = Scheduler::new(self.config.max_threads)?
            .run(chunks, runner.clone())
            .await?;

        if let Some(fatal) = runner.take_fatal().await {
            error!("Aborted processing of {}: {}", runner.document.id(), fatal);
            return Err(fatal);
        }

        // ── Step 4: Fan in ───────────────────────────────────────────────
        let text = merge_texts(&results);
        let stats = summarise(&results, total_pages, started.elapsed().as_millis() as u64);

        if let Some(ref cb) = self.config.progress_callback {
            cb.on_process_complete(stats.total_chunks, stats.succeeded_chunks);
        }

        Ok(ProcessOutput {
            text,
            chunks: results,
            stats,
        })
    }

    /// Process a local file.
    pub async fn process_path(
        &self,
        path: impl AsRef<Path>,
    ) -> Result<ProcessOutput, DocParseError> {
        let resolved = input::resolve_local(path.as_ref())?;
        let document = input::load_document(&resolved).await?;
        self.process_document(document).await
    }

    /// Download `url` into a temporary directory and process it.
    pub async fn process_url(&self, url: &str) -> Result<ProcessOutput, DocParseError> {
        if !input::is_url(url) {
            return Err(DocParseError::InvalidInput {
                input: url.to_string(),
                reason: "expected an http:// or https:// URL".into(),
            });
        }
        let resolved = input::resolve_input(url, self.config.download_timeout_secs).await?;
        let document = input::load_document(&resolved).await?;
        self.process_document(document).await
        // `resolved` (and its temp dir) drops here
    }

    /// Process an in-memory document.
    pub async fn process_bytes(
        &self,
        id: impl Into<String>,
        bytes: Vec<u8>,
        mime_type: impl Into<String>,
    ) -> Result<ProcessOutput, DocParseError> {
        self.process_document(Document::new(id, bytes, mime_type))
            .await
    }

    /// Extracted text of a local file, or `""` if it could not be processed.
    pub async fn process_file(&self, path: impl AsRef<Path>) -> String {
        let path = path.as_ref();
        match self.process_path(path).await {
            Ok(output) => output.text,
            Err(e) => {
                error!("Error processing file {}: {}", path.display(), e);
                String::new()
            }
        }
    }

    /// Extracted text of a remote document, or `""` on any failure.
    pub async fn process_from_url(&self, url: &str) -> String {
        match self.process_url(url).await {
            Ok(output) => output.text,
            Err(e) => {
                error!("Error processing URL {}: {}", url, e);
                String::new()
            }
        }
    }

    /// Send several files as one request (no chunking) and return the
    /// response text, or `""` on any failure.
    pub async fn process_multiple_files(&self, paths: &[PathBuf]) -> String {
        match self.try_process_multiple(paths).await {
            Ok(text) => text,
            Err(e) => {
                error!("Error processing {} files: {}", paths.len(), e);
                String::new()
            }
        }
    }

    async fn try_process_multiple(&self, paths: &[PathBuf]) -> Result<String, DocParseError> {
        if paths.is_empty() {
            return Ok(String::new());
        }
        info!("Processing {} files as one request", paths.len());

        let mut parts = Vec::with_capacity(paths.len() + 1);
        let mut guards = Vec::new();
        let outcome = match self.collect_parts(paths, &mut parts, &mut guards).await {
            Err(e) => Err(e),
            Ok(()) if self.config.use_cache => self.generate_over_cache(parts).await,
            Ok(()) => {
                parts.push(ContentPart::text(self.config.prompt.as_str()));
                self.inference
                    .generate(&self.config.model, &parts, &self.generation_config(None))
                    .await
                    .map(|gen| gen.text)
                    .map_err(DocParseError::Generation)
            }
        };

        join_all(guards.into_iter().map(RemoteGuard::release)).await;
        outcome
    }

    /// Load each file and turn it into a request part, uploading when an
    /// upload service is attached.
    async fn collect_parts(
        &self,
        paths: &[PathBuf],
        parts: &mut Vec<ContentPart>,
        guards: &mut Vec<RemoteGuard>,
    ) -> Result<(), DocParseError> {
        for path in paths {
            let resolved = input::resolve_local(path)?;
            let document = input::load_document(&resolved).await?;
            match self.uploads {
                Some(ref uploads) => {
                    let file = uploads
                        .upload(
                            document.bytes().to_vec(),
                            document.mime_type(),
                            Some(document.id()),
                        )
                        .await
                        .map_err(|source| DocParseError::Upload {
                            document: document.id().to_string(),
                            source,
                        })?;
                    guards.push(RemoteGuard::new(
                        RemoteResource::File(Arc::clone(uploads)),
                        file.name.clone(),
                    ));
                    parts.push(ContentPart::from_file(&file));
                }
                None => parts.push(ContentPart::inline(
                    document.mime_type(),
                    document.bytes().to_vec(),
                )),
            }
        }
        Ok(())
    }

    async fn generate_over_cache(&self, parts: Vec<ContentPart>) -> Result<String, DocParseError> {
        let manager = self.caches.as_ref().ok_or_else(|| DocParseError::Unsupported {
            capability: "context caching",
            hint: "attach a cache service or disable use_cache".into(),
        })?;
        let handle = manager
            .create_cache(
                &self.config.model,
                &parts,
                Some(&self.config.cache_system_instruction),
            )
            .await?;
        let guard = RemoteGuard::new(RemoteResource::Cache(manager.clone()), handle.name.clone());

        let result = async {
            if let Some(hours) = self.config.cache_ttl_hours {
                manager.update_cache_ttl(&handle.name, hours).await?;
            }
            manager
                .generate_with_cache(
                    &self.config.model,
                    &handle.name,
                    &self.config.prompt,
                    &self.generation_config(None),
                )
                .await
                .map(|gen| gen.text)
        }
        .await;

        if self.config.keep_caches {
            if let Some(name) = guard.keep() {
                info!("Keeping cache {}", name);
            }
        } else {
            guard.release().await;
        }
        result
    }

    /// Process every regular file in `dir` and write non-empty results to
    /// `output_dir/<stem>.<extension>`.
    ///
    /// Files are handled one at a time in name order; each file's chunks
    /// still run in parallel. Files that yield no text are skipped.
    pub async fn process_folder(
        &self,
        dir: impl AsRef<Path>,
        output_dir: impl AsRef<Path>,
        extension: &str,
    ) -> Result<FolderSummary, DocParseError> {
        let dir = dir.as_ref();
        let output_dir = output_dir.as_ref();
        let mut files = list_regular_files(dir).await?;
        files.sort();
        info!("Processing {} files from {}", files.len(), dir.display());

        tokio::fs::create_dir_all(output_dir)
            .await
            .map_err(|e| DocParseError::OutputWriteFailed {
                path: output_dir.to_path_buf(),
                source: e,
            })?;

        let extension = extension.trim_start_matches('.');
        let mut summary = FolderSummary::default();
        for file in files {
            let text = self.process_file(&file).await;
            if text.is_empty() {
                warn!("No text extracted from {}; skipping", file.display());
                summary.skipped.push(file);
                continue;
            }
            let stem = file
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_else(|| "output".to_string());
            let target = output_dir.join(format!("{stem}.{extension}"));
            write_atomic(&target, &text).await?;
            info!("Saved {}", target.display());
            summary.written.push(target);
        }
        Ok(summary)
    }

    // ── Cache management ─────────────────────────────────────────────────

    /// Live cache handles, or an empty list if they cannot be listed.
    pub async fn list_caches(&self) -> Vec<CacheHandle> {
        let Some(ref manager) = self.caches else {
            warn!("No cache service attached; no caches to list");
            return Vec::new();
        };
        match manager.list_caches().await {
            Ok(handles) => handles,
            Err(e) => {
                error!("Error listing caches: {}", e);
                Vec::new()
            }
        }
    }

    /// Best-effort delete; see [`CacheManager::delete_cache`].
    pub async fn delete_cache(&self, name: &str) {
        match self.caches {
            Some(ref manager) => manager.delete_cache(name).await,
            None => warn!("No cache service attached; cannot delete {}", name),
        }
    }

    pub async fn update_cache_ttl(
        &self,
        name: &str,
        hours: f64,
    ) -> Result<CacheHandle, DocParseError> {
        let manager = self.caches.as_ref().ok_or_else(|| DocParseError::Unsupported {
            capability: "context caching",
            hint: "attach a cache service".into(),
        })?;
        manager.update_cache_ttl(name, hours).await
    }
}

async fn list_regular_files(dir: &Path) -> Result<Vec<PathBuf>, DocParseError> {
    let mut entries = tokio::fs::read_dir(dir).await.map_err(|e| match e.kind() {
        std::io::ErrorKind::PermissionDenied => DocParseError::PermissionDenied {
            path: dir.to_path_buf(),
        },
        _ => DocParseError::FileNotFound {
            path: dir.to_path_buf(),
        },
    })?;

    let mut files = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| DocParseError::Internal(format!("reading {}: {e}", dir.display())))?
    {
        let is_file = entry.file_type().await.map(|t| t.is_file()).unwrap_or(false);
        if is_file {
            files.push(entry.path());
        }
    }
    Ok(files)
}

/// Write `text` to `path` via a sibling temp file and rename, so readers
/// never see a partial file.
async fn write_atomic(path: &Path, text: &str) -> Result<(), DocParseError> {
    let write_err = |source| DocParseError::OutputWriteFailed {
        path: path.to_path_buf(),
        source,
    };
    let mut tmp_name = path.as_os_str().to_owned();
    tmp_name.push(".tmp");
    let tmp_path = PathBuf::from(tmp_name);

    tokio::fs::write(&tmp_path, text).await.map_err(write_err)?;
    tokio::fs::rename(&tmp_path, path).await.map_err(write_err)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn atomic_write_leaves_no_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("out.md");
        write_atomic(&target, "hello").await.unwrap();
        assert_eq!(std::fs::read_to_string(&target).unwrap(), "hello");
        assert!(!dir.path().join("out.md.tmp").exists());
    }

    #[tokio::test]
    async fn listing_skips_directories() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "a").unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        let files = list_regular_files(dir.path()).await.unwrap();
        assert_eq!(files, vec![dir.path().join("a.txt")]);
    }

    #[tokio::test]
    async fn missing_folder_is_not_found() {
        let err = list_regular_files(Path::new("/no/such/folder")).await.unwrap_err();
        assert!(matches!(err, DocParseError::FileNotFound { .. }));
    }
}
