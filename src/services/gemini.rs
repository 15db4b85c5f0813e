//! REST client for the Gemini API: generation, context caches and files.
//!
//! One [`GeminiClient`] implements every remote seam the pipeline uses, so
//! a single `Arc<GeminiClient>` can be plugged into the processor as its
//! inference, cache and upload service. The client holds no per-call
//! mutable state and is shared read-only across workers.
//!
//! Endpoints (all under `{base_url}`, default `…/v1beta`):
//!
//! | Operation | Method + path |
//! |-----------|---------------|
//! | generate | `POST models/{model}:generateContent` |
//! | create cache | `POST cachedContents` |
//! | update TTL | `PATCH cachedContents/{id}?updateMask=ttl` |
//! | list caches | `GET cachedContents?pageToken=…` |
//! | delete cache | `DELETE cachedContents/{id}` |
//! | upload | resumable `POST {upload_url}/files` |
//! | list / get / delete file | `GET files`, `GET files/{id}`, `DELETE files/{id}` |

use crate::error::{DocParseError, ServiceError};
use crate::services::{
    CacheHandle, CacheService, ContentPart, ContentUploadService, FileHandle, Generation,
    GenerationConfig, InferenceService,
};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use reqwest::{Method, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info, warn};

pub const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";
pub const DEFAULT_UPLOAD_URL: &str = "https://generativelanguage.googleapis.com/upload/v1beta";

/// How often and how long to poll an uploaded file until it is `ACTIVE`.
const FILE_POLL_INTERVAL: Duration = Duration::from_secs(1);
const FILE_POLL_ATTEMPTS: u32 = 60;

#[derive(Clone)]
pub struct GeminiClient {
    http: reqwest::Client,
    api_key: String,
    base_url: String,
    upload_url: String,
}

impl std::fmt::Debug for GeminiClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GeminiClient")
            .field("base_url", &self.base_url)
            .field("api_key", &"<redacted>")
            .finish()
    }
}

impl GeminiClient {
    pub fn new(api_key: impl Into<String>) -> Result<Self, DocParseError> {
        let api_key = api_key.into();
        if api_key.trim().is_empty() {
            return Err(DocParseError::ProviderNotConfigured {
                provider: "gemini".into(),
                hint: "The API key is empty. Set GEMINI_API_KEY.".into(),
            });
        }
        let http = reqwest::Client::builder()
            .build()
            .map_err(|e| DocParseError::Internal(format!("HTTP client: {e}")))?;
        Ok(Self {
            http,
            api_key,
            base_url: DEFAULT_BASE_URL.to_string(),
            upload_url: DEFAULT_UPLOAD_URL.to_string(),
        })
    }

    /// Read the key from `GEMINI_API_KEY` (or `GOOGLE_API_KEY`).
    pub fn from_env() -> Result<Self, DocParseError> {
        let key = ["GEMINI_API_KEY", "GOOGLE_API_KEY"]
            .iter()
            .find_map(|var| std::env::var(var).ok().filter(|v| !v.is_empty()))
            .ok_or_else(|| DocParseError::ProviderNotConfigured {
                provider: "gemini".into(),
                hint: "Set GEMINI_API_KEY to your Google AI Studio key.".into(),
            })?;
        Self::new(key)
    }

    /// Point the client at another deployment (proxy, regional endpoint).
    pub fn with_base_urls(
        mut self,
        base_url: impl Into<String>,
        upload_url: impl Into<String>,
    ) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self.upload_url = upload_url.into().trim_end_matches('/').to_string();
        self
    }

    fn request(&self, method: Method, url: &str) -> RequestBuilder {
        self.http
            .request(method, url)
            .header("x-goog-api-key", &self.api_key)
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    async fn send(
        operation: &'static str,
        builder: RequestBuilder,
    ) -> Result<Response, ServiceError> {
        let response = builder.send().await.map_err(|e| transport_error(operation, e))?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(ServiceError::Api {
            operation,
            status: status.as_u16(),
            message: api_message(&body),
        })
    }

    async fn send_json<T: DeserializeOwned>(
        operation: &'static str,
        builder: RequestBuilder,
    ) -> Result<T, ServiceError> {
        let response = Self::send(operation, builder).await?;
        response
            .json::<T>()
            .await
            .map_err(|e| ServiceError::InvalidResponse {
                operation,
                detail: e.to_string(),
            })
    }

    async fn generate_request(
        &self,
        operation: &'static str,
        model: &str,
        body: &GenerateRequest,
    ) -> Result<Generation, ServiceError> {
        let url = self.url(&format!("{}:generateContent", model_path(model)));
        let response: GenerateResponse =
            Self::send_json(operation, self.request(Method::POST, &url).json(body)).await?;
        response.into_generation(operation)
    }
}

// ── InferenceService ─────────────────────────────────────────────────────

#[async_trait]
impl InferenceService for GeminiClient {
    fn backend(&self) -> &str {
        "gemini"
    }

    async fn generate(
        &self,
        model: &str,
        parts: &[ContentPart],
        config: &GenerationConfig,
    ) -> Result<Generation, ServiceError> {
        let body = GenerateRequest {
            contents: vec![WireContent::user(parts)],
            system_instruction: config.system_instruction.as_deref().map(WireContent::system),
            generation_config: WireGenerationConfig::from_config(config),
            cached_content: None,
        };
        self.generate_request("models.generateContent", model, &body)
            .await
    }

    async fn generate_with_cache(
        &self,
        model: &str,
        cache_name: &str,
        prompt: &str,
        config: &GenerationConfig,
    ) -> Result<Generation, ServiceError> {
        // A cached request may not carry its own system instruction; the
        // cache already stores one.
        let body = GenerateRequest {
            contents: vec![WireContent::user(&[ContentPart::text(prompt)])],
            system_instruction: None,
            generation_config: WireGenerationConfig::from_config(config),
            cached_content: Some(cache_path(cache_name)),
        };
        self.generate_request("models.generateContent(cached)", model, &body)
            .await
    }
}

// ── CacheService ─────────────────────────────────────────────────────────

#[async_trait]
impl CacheService for GeminiClient {
    async fn create_cache(
        &self,
        model: &str,
        contents: &[ContentPart],
        system_instruction: Option<&str>,
    ) -> Result<CacheHandle, ServiceError> {
        let body = CreateCacheRequest {
            model: model_path(model),
            contents: vec![WireContent::user(contents)],
            system_instruction: system_instruction
                .filter(|s| !s.is_empty())
                .map(WireContent::system),
        };
        let cached: WireCachedContent = Self::send_json(
            "cachedContents.create",
            self.request(Method::POST, &self.url("cachedContents")).json(&body),
        )
        .await?;
        let mut handle = cached.into_handle();
        handle.system_instruction = system_instruction.map(str::to_string);
        Ok(handle)
    }

    async fn update_cache_ttl(
        &self,
        name: &str,
        ttl_seconds: u64,
    ) -> Result<CacheHandle, ServiceError> {
        let url = self.url(&cache_path(name));
        let body = serde_json::json!({ "ttl": format!("{ttl_seconds}s") });
        let cached: WireCachedContent = Self::send_json(
            "cachedContents.patch",
            self.request(Method::PATCH, &url)
                .query(&[("updateMask", "ttl")])
                .json(&body),
        )
        .await?;
        let mut handle = cached.into_handle();
        handle.ttl_seconds = Some(ttl_seconds);
        Ok(handle)
    }

    async fn list_caches(&self) -> Result<Vec<CacheHandle>, ServiceError> {
        let mut handles = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let mut req = self
                .request(Method::GET, &self.url("cachedContents"))
                .query(&[("pageSize", "100")]);
            if let Some(ref token) = page_token {
                req = req.query(&[("pageToken", token.as_str())]);
            }
            let page: ListCachesResponse = Self::send_json("cachedContents.list", req).await?;
            handles.extend(page.cached_contents.into_iter().map(WireCachedContent::into_handle));
            match page.next_page_token.filter(|t| !t.is_empty()) {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }
        debug!("Listed {} cache handles", handles.len());
        Ok(handles)
    }

    async fn delete_cache(&self, name: &str) -> Result<(), ServiceError> {
        let url = self.url(&cache_path(name));
        Self::send("cachedContents.delete", self.request(Method::DELETE, &url)).await?;
        Ok(())
    }
}

// ── ContentUploadService ─────────────────────────────────────────────────

#[async_trait]
impl ContentUploadService for GeminiClient {
    async fn upload(
        &self,
        data: Vec<u8>,
        mime_type: &str,
        display_name: Option<&str>,
    ) -> Result<FileHandle, ServiceError> {
        const OP: &str = "files.upload";
        let size = data.len();

        // Step 1: open a resumable session.
        let start = self
            .request(Method::POST, &format!("{}/files", self.upload_url))
            .header("X-Goog-Upload-Protocol", "resumable")
            .header("X-Goog-Upload-Command", "start")
            .header("X-Goog-Upload-Header-Content-Length", size.to_string())
            .header("X-Goog-Upload-Header-Content-Type", mime_type)
            .json(&serde_json::json!({ "file": { "displayName": display_name } }));
        let response = Self::send(OP, start).await?;
        let session_url = response
            .headers()
            .get("x-goog-upload-url")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| ServiceError::InvalidResponse {
                operation: OP,
                detail: "missing x-goog-upload-url header".into(),
            })?;

        // Step 2: send the bytes and finalise.
        let finish = self
            .http
            .post(&session_url)
            .header("Content-Length", size.to_string())
            .header("X-Goog-Upload-Offset", "0")
            .header("X-Goog-Upload-Command", "upload, finalize")
            .body(data);
        let uploaded: FileEnvelope = Self::send_json(OP, finish).await?;
        let file = uploaded.file.into_handle();
        info!("Uploaded file: {} ({} bytes)", file.name, size);

        // Step 3: wait until the service has processed it.
        await_active(self, file, FILE_POLL_INTERVAL, FILE_POLL_ATTEMPTS).await
    }

    async fn list_files(&self) -> Result<Vec<FileHandle>, ServiceError> {
        let mut files = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let mut req = self
                .request(Method::GET, &self.url("files"))
                .query(&[("pageSize", "100")]);
            if let Some(ref token) = page_token {
                req = req.query(&[("pageToken", token.as_str())]);
            }
            let page: ListFilesResponse = Self::send_json("files.list", req).await?;
            files.extend(page.files.into_iter().map(WireFile::into_handle));
            match page.next_page_token.filter(|t| !t.is_empty()) {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }
        Ok(files)
    }

    async fn get_file(&self, name: &str) -> Result<FileHandle, ServiceError> {
        let url = self.url(&file_path(name));
        let file: WireFile = Self::send_json("files.get", self.request(Method::GET, &url)).await?;
        Ok(file.into_handle())
    }

    async fn delete_file(&self, name: &str) -> Result<(), ServiceError> {
        let url = self.url(&file_path(name));
        Self::send("files.delete", self.request(Method::DELETE, &url)).await?;
        Ok(())
    }
}

// ── Path helpers ─────────────────────────────────────────────────────────

/// `gemini-2.0-flash` → `models/gemini-2.0-flash`; qualified names pass through.
pub fn model_path(model: &str) -> String {
    if model.starts_with("models/") || model.starts_with("tunedModels/") {
        model.to_string()
    } else {
        format!("models/{model}")
    }
}

/// `abc` → `cachedContents/abc`; qualified names pass through.
pub fn cache_path(name: &str) -> String {
    if name.starts_with("cachedContents/") {
        name.to_string()
    } else {
        format!("cachedContents/{name}")
    }
}

/// `abc` → `files/abc`; qualified names pass through.
pub fn file_path(name: &str) -> String {
    if name.starts_with("files/") {
        name.to_string()
    } else {
        format!("files/{name}")
    }
}

/// Parse a protobuf duration string such as `"3600s"` or `"1.5s"`.
pub fn parse_duration_secs(s: &str) -> Option<u64> {
    s.strip_suffix('s')?
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite() && *v >= 0.0)
        .map(|v| v as u64)
}

fn transport_error(operation: &'static str, e: reqwest::Error) -> ServiceError {
    if e.is_timeout() {
        ServiceError::Timeout { operation, secs: 0 }
    } else {
        ServiceError::Http {
            operation,
            reason: e.to_string(),
        }
    }
}

/// Pull `error.message` out of a Google API error body, or fall back to the raw body.
fn api_message(body: &str) -> String {
    serde_json::from_str::<ApiErrorBody>(body)
        .ok()
        .map(|b| match b.error.status {
            Some(status) => format!("{status}: {}", b.error.message),
            None => b.error.message,
        })
        .unwrap_or_else(|| body.chars().take(500).collect())
}

// ── Wire types ───────────────────────────────────────────────────────────

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateRequest {
    contents: Vec<WireContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<WireContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    generation_config: Option<WireGenerationConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    cached_content: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateCacheRequest {
    model: String,
    contents: Vec<WireContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<WireContent>,
}

#[derive(Serialize, Deserialize, Default)]
struct WireContent {
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<String>,
    #[serde(default)]
    parts: Vec<WirePart>,
}

impl WireContent {
    fn user(parts: &[ContentPart]) -> Self {
        Self {
            role: Some("user".into()),
            parts: parts.iter().map(WirePart::from_part).collect(),
        }
    }

    fn system(text: &str) -> Self {
        Self {
            role: None,
            parts: vec![WirePart {
                text: Some(text.to_string()),
                ..Default::default()
            }],
        }
    }
}

#[derive(Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct WirePart {
    #[serde(skip_serializing_if = "Option::is_none")]
    text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    inline_data: Option<WireBlob>,
    #[serde(skip_serializing_if = "Option::is_none")]
    file_data: Option<WireFileData>,
}

impl WirePart {
    fn from_part(part: &ContentPart) -> Self {
        match part {
            ContentPart::Text(t) => Self {
                text: Some(t.clone()),
                ..Default::default()
            },
            ContentPart::Inline { mime_type, data } => Self {
                inline_data: Some(WireBlob {
                    mime_type: mime_type.clone(),
                    data: STANDARD.encode(data),
                }),
                ..Default::default()
            },
            ContentPart::File { mime_type, uri } => Self {
                file_data: Some(WireFileData {
                    mime_type: mime_type.clone(),
                    file_uri: uri.clone(),
                }),
                ..Default::default()
            },
        }
    }
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireBlob {
    mime_type: String,
    data: String,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireFileData {
    mime_type: String,
    file_uri: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct WireGenerationConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_output_tokens: Option<usize>,
}

impl WireGenerationConfig {
    fn from_config(config: &GenerationConfig) -> Option<Self> {
        if config.temperature.is_none() && config.max_output_tokens.is_none() {
            return None;
        }
        Some(Self {
            temperature: config.temperature,
            max_output_tokens: config.max_output_tokens,
        })
    }
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<WireCandidate>,
    usage_metadata: Option<WireUsage>,
    prompt_feedback: Option<WirePromptFeedback>,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct WireCandidate {
    content: Option<WireContent>,
    finish_reason: Option<String>,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct WireUsage {
    #[serde(default)]
    prompt_token_count: u64,
    #[serde(default)]
    candidates_token_count: u64,
    #[serde(default)]
    total_token_count: u64,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct WirePromptFeedback {
    block_reason: Option<String>,
}

impl GenerateResponse {
    fn into_generation(self, operation: &'static str) -> Result<Generation, ServiceError> {
        let Some(candidate) = self.candidates.into_iter().next() else {
            let reason = self
                .prompt_feedback
                .and_then(|f| f.block_reason)
                .unwrap_or_else(|| "no candidates returned".into());
            return Err(ServiceError::InvalidResponse {
                operation,
                detail: reason,
            });
        };

        let text: String = candidate
            .content
            .map(|c| c.parts.into_iter().filter_map(|p| p.text).collect())
            .unwrap_or_default();
        if text.is_empty() {
            return Err(ServiceError::InvalidResponse {
                operation,
                detail: format!(
                    "empty candidate (finishReason={})",
                    candidate.finish_reason.as_deref().unwrap_or("unknown")
                ),
            });
        }

        let usage = self.usage_metadata.unwrap_or_default();
        Ok(Generation {
            text,
            input_tokens: usage.prompt_token_count,
            output_tokens: usage.candidates_token_count,
        })
    }
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct WireCachedContent {
    #[serde(default)]
    name: String,
    #[serde(default)]
    model: String,
    display_name: Option<String>,
    expire_time: Option<String>,
    ttl: Option<String>,
    create_time: Option<String>,
    update_time: Option<String>,
    usage_metadata: Option<WireUsage>,
}

impl WireCachedContent {
    fn into_handle(self) -> CacheHandle {
        CacheHandle {
            name: self.name,
            model: self.model,
            display_name: self.display_name,
            expire_time: self.expire_time,
            ttl_seconds: self.ttl.as_deref().and_then(parse_duration_secs),
            system_instruction: None,
            create_time: self.create_time,
            update_time: self.update_time,
            total_token_count: self.usage_metadata.map(|u| u.total_token_count),
        }
    }
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct ListCachesResponse {
    #[serde(default)]
    cached_contents: Vec<WireCachedContent>,
    next_page_token: Option<String>,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct WireFile {
    #[serde(default)]
    name: String,
    #[serde(default)]
    uri: String,
    #[serde(default)]
    mime_type: String,
    display_name: Option<String>,
    /// int64 fields arrive as JSON strings.
    size_bytes: Option<String>,
    state: Option<String>,
    expiration_time: Option<String>,
}

impl WireFile {
    fn into_handle(self) -> FileHandle {
        FileHandle {
            name: self.name,
            uri: self.uri,
            mime_type: self.mime_type,
            display_name: self.display_name,
            size_bytes: self.size_bytes.and_then(|s| s.parse().ok()),
            state: self.state,
            expiration_time: self.expiration_time,
        }
    }
}

#[derive(Deserialize)]
struct FileEnvelope {
    file: WireFile,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct ListFilesResponse {
    #[serde(default)]
    files: Vec<WireFile>,
    next_page_token: Option<String>,
}

#[derive(Deserialize)]
struct ApiErrorBody {
    error: ApiErrorDetail,
}

#[derive(Deserialize)]
struct ApiErrorDetail {
    #[serde(default)]
    message: String,
    status: Option<String>,
}

/// Poll `file` until it leaves `PROCESSING`.
///
/// The file already exists remotely, so one that fails, never settles or
/// cannot be polled is deleted before the error is returned.
async fn await_active(
    files: &dyn ContentUploadService,
    file: FileHandle,
    interval: Duration,
    max_polls: u32,
) -> Result<FileHandle, ServiceError> {
    let name = file.name.clone();
    match poll_until_settled(files, file, interval, max_polls).await {
        Ok(file) => Ok(file),
        Err(e) => {
            match files.delete_file(&name).await {
                Ok(()) => debug!("Deleted unusable upload {}", name),
                Err(del) => warn!("Could not delete unusable upload {}: {}", name, del),
            }
            Err(e)
        }
    }
}

async fn poll_until_settled(
    files: &dyn ContentUploadService,
    mut file: FileHandle,
    interval: Duration,
    max_polls: u32,
) -> Result<FileHandle, ServiceError> {
    const OP: &str = "files.upload";
    let mut polls = 0;
    while file.state.as_deref() == Some("PROCESSING") {
        if polls >= max_polls {
            return Err(ServiceError::Timeout {
                operation: OP,
                secs: interval.as_secs() * u64::from(max_polls),
            });
        }
        tokio::time::sleep(interval).await;
        file = files.get_file(&file.name).await?;
        polls += 1;
    }
    if file.state.as_deref() == Some("FAILED") {
        return Err(ServiceError::InvalidResponse {
            operation: OP,
            detail: format!("service could not process {}", file.name),
        });
    }
    Ok(file)
}
