//! Configuration types for chunked document processing.
//!
//! All processing behaviour is controlled through [`ProcessConfig`], built
//! via its [`ProcessConfigBuilder`]. Keeping every knob in one struct makes
//! it trivial to share a config across worker tasks and to log exactly what
//! a run was asked to do.
//!
//! Structural limits (`pages_per_chunk`, `max_threads`, `max_retries`,
//! `cache_ttl_hours`) are validated by [`ProcessConfigBuilder::build`] and are
//! never clamped: a zero chunk size is a caller bug, not something to paper
//! over.

use crate::error::DocParseError;
use crate::progress::ProgressCallback;
use crate::prompts::{DEFAULT_CACHE_INSTRUCTION, DEFAULT_PROMPT};
use std::fmt;
use std::time::Duration;

/// Configuration for a document-processing run.
///
/// # Example
/// ```rust
/// use edgequake_docparse::ProcessConfig;
///
/// let config = ProcessConfig::builder()
///     .pages_per_chunk(5)
///     .max_threads(2)
///     .max_retries(3)
///     .retry_delay_ms(2000)
///     .build()
///     .unwrap();
/// assert_eq!(config.pages_per_chunk, 5);
/// ```
#[derive(Clone)]
pub struct ProcessConfig {
    /// Model identifier, e.g. "gemini-2.0-flash". Default: "gemini-2.0-flash".
    pub model: String,

    /// Instruction sent with every chunk. Default: [`DEFAULT_PROMPT`].
    pub prompt: String,

    /// Pages per chunk. Must be ≥ 1. Default: 5.
    ///
    /// Smaller chunks stay further below the service's per-request token
    /// limit and fail independently; larger chunks give the model more
    /// surrounding context per call.
    pub pages_per_chunk: usize,

    /// Maximum chunk jobs in flight at once. Must be ≥ 1. Default: 4.
    pub max_threads: usize,

    /// Total attempts per chunk (first call included). Must be ≥ 1. Default: 3.
    pub max_retries: u32,

    /// Fixed delay between attempts in milliseconds. Default: 2000.
    ///
    /// The delay does not grow between attempts.
    pub retry_delay_ms: u64,

    /// Upper bound for a single remote attempt, in seconds. Default: 120.
    /// An attempt that runs past it counts as a failed attempt.
    pub attempt_timeout_secs: Option<u64>,

    /// Wall-clock budget for a whole `process_*` call, in seconds. Default: none.
    /// When it elapses, in-flight and queued chunks fail as cancelled.
    pub deadline_secs: Option<u64>,

    /// Sampling temperature passed to the model. Default: provider default.
    pub temperature: Option<f32>,

    /// Output-token ceiling per chunk. Default: provider default.
    pub max_output_tokens: Option<usize>,

    /// Wrap each chunk in a remote context cache before generating. Default: false.
    pub use_cache: bool,

    /// TTL applied to newly created cache handles, in hours. Default: none
    /// (the service default applies).
    pub cache_ttl_hours: Option<f64>,

    /// System instruction stored in cache handles. Default: [`DEFAULT_CACHE_INSTRUCTION`].
    pub cache_system_instruction: String,

    /// Keep per-chunk cache handles after the run instead of deleting them. Default: false.
    pub keep_caches: bool,

    /// Payloads larger than this are uploaded instead of sent inline. Default: 15 MiB.
    pub inline_limit_bytes: usize,

    /// Download timeout for URL inputs in seconds. Default: 120.
    pub download_timeout_secs: u64,

    /// Optional per-chunk progress events.
    pub progress_callback: Option<ProgressCallback>,
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            model: "gemini-2.0-flash".to_string(),
            prompt: DEFAULT_PROMPT.to_string(),
            pages_per_chunk: 5,
            max_threads: 4,
            max_retries: 3,
            retry_delay_ms: 2000,
            attempt_timeout_secs: Some(120),
            deadline_secs: None,
            temperature: None,
            max_output_tokens: None,
            use_cache: false,
            cache_ttl_hours: None,
            cache_system_instruction: DEFAULT_CACHE_INSTRUCTION.to_string(),
            keep_caches: false,
            inline_limit_bytes: 15 * 1024 * 1024,
            download_timeout_secs: 120,
            progress_callback: None,
        }
    }
}

impl fmt::Debug for ProcessConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessConfig")
            .field("model", &self.model)
            .field("pages_per_chunk", &self.pages_per_chunk)
            .field("max_threads", &self.max_threads)
            .field("max_retries", &self.max_retries)
            .field("retry_delay_ms", &self.retry_delay_ms)
            .field("attempt_timeout_secs", &self.attempt_timeout_secs)
            .field("deadline_secs", &self.deadline_secs)
            .field("use_cache", &self.use_cache)
            .field("cache_ttl_hours", &self.cache_ttl_hours)
            .field("keep_caches", &self.keep_caches)
            .field("inline_limit_bytes", &self.inline_limit_bytes)
            .field(
                "progress_callback",
                &self.progress_callback.as_ref().map(|_| "<dyn ProcessProgressCallback>"),
            )
            .finish()
    }
}

impl ProcessConfig {
    /// Create a new builder for `ProcessConfig`.
    pub fn builder() -> ProcessConfigBuilder {
        ProcessConfigBuilder {
            config: Self::default(),
        }
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn attempt_timeout(&self) -> Option<Duration> {
        self.attempt_timeout_secs.map(Duration::from_secs)
    }

    /// Check the structural limits. Called by the builder and again by the
    /// processor, since the fields are public.
    pub fn validate(&self) -> Result<(), DocParseError> {
        if self.pages_per_chunk == 0 {
            return Err(DocParseError::InvalidConfig(
                "pages_per_chunk must be ≥ 1, got 0".into(),
            ));
        }
        if self.max_threads == 0 {
            return Err(DocParseError::InvalidConfig(
                "max_threads must be ≥ 1, got 0".into(),
            ));
        }
        if self.max_retries == 0 {
            return Err(DocParseError::InvalidConfig(
                "max_retries must be ≥ 1 (it counts the first attempt)".into(),
            ));
        }
        if let Some(hours) = self.cache_ttl_hours {
            if !hours.is_finite() || hours <= 0.0 {
                return Err(DocParseError::InvalidConfig(format!(
                    "cache_ttl_hours must be a positive number, got {hours}"
                )));
            }
        }
        if self.model.trim().is_empty() {
            return Err(DocParseError::InvalidConfig("model must not be empty".into()));
        }
        Ok(())
    }
}

/// Builder for [`ProcessConfig`].
#[derive(Debug)]
pub struct ProcessConfigBuilder {
    config: ProcessConfig,
}

impl ProcessConfigBuilder {
    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.config.model = model.into();
        self
    }

    pub fn prompt(mut self, prompt: impl Into<String>) -> Self {
        self.config.prompt = prompt.into();
        self
    }

    pub fn pages_per_chunk(mut self, n: usize) -> Self {
        self.config.pages_per_chunk = n;
        self
    }

    pub fn max_threads(mut self, n: usize) -> Self {
        self.config.max_threads = n;
        self
    }

    pub fn max_retries(mut self, n: u32) -> Self {
        self.config.max_retries = n;
        self
    }

    pub fn retry_delay_ms(mut self, ms: u64) -> Self {
        self.config.retry_delay_ms = ms;
        self
    }

    pub fn attempt_timeout_secs(mut self, secs: Option<u64>) -> Self {
        self.config.attempt_timeout_secs = secs;
        self
    }

    pub fn deadline_secs(mut self, secs: Option<u64>) -> Self {
        self.config.deadline_secs = secs;
        self
    }

    pub fn temperature(mut self, t: f32) -> Self {
        self.config.temperature = Some(t.clamp(0.0, 2.0));
        self
    }

    pub fn max_output_tokens(mut self, n: usize) -> Self {
        self.config.max_output_tokens = Some(n);
        self
    }

    pub fn use_cache(mut self, v: bool) -> Self {
        self.config.use_cache = v;
        self
    }

    pub fn cache_ttl_hours(mut self, hours: f64) -> Self {
        self.config.cache_ttl_hours = Some(hours);
        self
    }

    pub fn cache_system_instruction(mut self, instruction: impl Into<String>) -> Self {
        self.config.cache_system_instruction = instruction.into();
        self
    }

    pub fn keep_caches(mut self, v: bool) -> Self {
        self.config.keep_caches = v;
        self
    }

    pub fn inline_limit_bytes(mut self, n: usize) -> Self {
        self.config.inline_limit_bytes = n;
        self
    }

    pub fn download_timeout_secs(mut self, secs: u64) -> Self {
        self.config.download_timeout_secs = secs;
        self
    }

    pub fn progress_callback(mut self, cb: ProgressCallback) -> Self {
        self.config.progress_callback = Some(cb);
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<ProcessConfig, DocParseError> {
        self.config.validate()?;
        Ok(self.config)
    }
}
