//! Lifecycle of remote context-cache handles.
//!
//! A handle moves `Created → Active` when its TTL is set, stays `Active`
//! across TTL updates and ends either `Expired` (remote only, never
//! observed here) or `Deleted`. The manager holds references only; the
//! cached bytes live on the service.
//!
//! Failure policy:
//!
//! | Operation | On failure |
//! |-----------|-----------|
//! | create / update TTL | `DocParseError::Cache`, propagated, never retried |
//! | generate | `DocParseError::Cache`, propagated (after retries when retried) |
//! | list | propagated |
//! | delete | `warn!` and swallowed |

use crate::error::DocParseError;
use crate::pipeline::cancel::CancelToken;
use crate::pipeline::retry::{Retried, RetryExecutor, RetryFailure};
use crate::services::{
    CacheHandle, CacheService, ContentPart, Generation, GenerationConfig, InferenceService,
};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Convert hours to whole seconds, rounding down (`2.0 → 7200`, `0.5 → 1800`).
pub fn hours_to_ttl_seconds(hours: f64) -> Result<u64, DocParseError> {
    if !hours.is_finite() || hours <= 0.0 {
        return Err(DocParseError::InvalidConfig(format!(
            "cache TTL must be a positive number of hours, got {hours}"
        )));
    }
    let secs = (hours * 3600.0).floor() as u64;
    if secs == 0 {
        return Err(DocParseError::InvalidConfig(format!(
            "cache TTL of {hours}h rounds down to 0 seconds"
        )));
    }
    Ok(secs)
}

/// Why a retried cache-backed generation produced no text.
#[derive(Debug)]
pub enum CachedGenerationError {
    /// The run was cancelled before an attempt succeeded.
    Cancelled { attempts: u32 },
    /// Every attempt failed. Always [`DocParseError::Cache`].
    Failed { attempts: u32, error: DocParseError },
}

#[derive(Clone)]
pub struct CacheManager {
    caches: Arc<dyn CacheService>,
    inference: Arc<dyn InferenceService>,
}

impl std::fmt::Debug for CacheManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheManager")
            .field("backend", &self.inference.backend())
            .finish()
    }
}

impl CacheManager {
    pub fn new(caches: Arc<dyn CacheService>, inference: Arc<dyn InferenceService>) -> Self {
        Self { caches, inference }
    }

    /// Register `contents` (plus an optional instruction) as a cache handle.
    pub async fn create_cache(
        &self,
        model: &str,
        contents: &[ContentPart],
        system_instruction: Option<&str>,
    ) -> Result<CacheHandle, DocParseError> {
        let handle = self
            .caches
            .create_cache(model, contents, system_instruction)
            .await
            .map_err(|source| DocParseError::Cache {
                operation: "create",
                name: model.to_string(),
                source,
            })?;
        info!("Created cache: {}", handle.name);
        Ok(handle)
    }

    /// Generate against an existing handle.
    pub async fn generate_with_cache(
        &self,
        model: &str,
        cache_name: &str,
        prompt: &str,
        config: &GenerationConfig,
    ) -> Result<Generation, DocParseError> {
        self.inference
            .generate_with_cache(model, cache_name, prompt, config)
            .await
            .map_err(|source| DocParseError::Cache {
                operation: "generate",
                name: cache_name.to_string(),
                source,
            })
    }

    /// [`CacheManager::generate_with_cache`] under `retry`, for chunk `index`.
    #[allow(clippy::too_many_arguments)]
    pub async fn generate_with_cache_retried(
        &self,
        retry: &RetryExecutor,
        cancel: &CancelToken,
        index: usize,
        model: &str,
        cache_name: &str,
        prompt: &str,
        config: &GenerationConfig,
    ) -> Result<Retried<Generation>, CachedGenerationError> {
        let inference = &self.inference;
        retry
            .run_detailed(index, cancel, |_| {
                inference.generate_with_cache(model, cache_name, prompt, config)
            })
            .await
            .map_err(|failure| match failure {
                RetryFailure::Cancelled { attempts } => {
                    CachedGenerationError::Cancelled { attempts }
                }
                RetryFailure::Exhausted { attempts, last } => CachedGenerationError::Failed {
                    attempts,
                    error: DocParseError::Cache {
                        operation: "generate",
                        name: cache_name.to_string(),
                        source: last,
                    },
                },
            })
    }

    /// Extend (or shorten) a handle's lifetime to `hours` from now.
    pub async fn update_cache_ttl(
        &self,
        name: &str,
        hours: f64,
    ) -> Result<CacheHandle, DocParseError> {
        let ttl_seconds = hours_to_ttl_seconds(hours)?;
        let handle = self
            .caches
            .update_cache_ttl(name, ttl_seconds)
            .await
            .map_err(|source| DocParseError::Cache {
                operation: "update TTL",
                name: name.to_string(),
                source,
            })?;
        info!("Updated cache TTL: {} → {}s", name, ttl_seconds);
        Ok(handle)
    }

    /// Metadata of every live handle.
    pub async fn list_caches(&self) -> Result<Vec<CacheHandle>, DocParseError> {
        self.caches
            .list_caches()
            .await
            .map_err(|source| DocParseError::Cache {
                operation: "list",
                name: "*".to_string(),
                source,
            })
    }

    /// Delete a handle. Never fails: a missing or already-deleted handle,
    /// or any other service error, is logged and ignored.
    pub async fn delete_cache(&self, name: &str) {
        match self.caches.delete_cache(name).await {
            Ok(()) => debug!("Deleted cache: {}", name),
            Err(e) => warn!("Could not delete cache {}: {}", name, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ServiceError;
    use async_trait::async_trait;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingCaches {
        ttl_calls: Mutex<Vec<(String, u64)>>,
        fail: bool,
    }

    #[async_trait]
    impl CacheService for RecordingCaches {
        async fn create_cache(
            &self,
            model: &str,
            _contents: &[ContentPart],
            _system_instruction: Option<&str>,
        ) -> Result<CacheHandle, ServiceError> {
            if self.fail {
                return Err(ServiceError::Api {
                    operation: "cachedContents.create",
                    status: 400,
                    message: "too small to cache".into(),
                });
            }
            Ok(CacheHandle {
                name: "cachedContents/c1".into(),
                model: model.into(),
                ..Default::default()
            })
        }

        async fn update_cache_ttl(
            &self,
            name: &str,
            ttl_seconds: u64,
        ) -> Result<CacheHandle, ServiceError> {
            self.ttl_calls.lock().unwrap().push((name.to_string(), ttl_seconds));
            Ok(CacheHandle {
                name: name.into(),
                ttl_seconds: Some(ttl_seconds),
                ..Default::default()
            })
        }

        async fn list_caches(&self) -> Result<Vec<CacheHandle>, ServiceError> {
            Ok(Vec::new())
        }

        async fn delete_cache(&self, name: &str) -> Result<(), ServiceError> {
            Err(ServiceError::Api {
                operation: "cachedContents.delete",
                status: 404,
                message: format!("{name} not found"),
            })
        }
    }

    struct NoInference;

    #[async_trait]
    impl InferenceService for NoInference {
        fn backend(&self) -> &str {
            "none"
        }

        async fn generate(
            &self,
            _model: &str,
            _parts: &[ContentPart],
            _config: &GenerationConfig,
        ) -> Result<Generation, ServiceError> {
            Ok(Generation::text(""))
        }

        async fn generate_with_cache(
            &self,
            _model: &str,
            cache_name: &str,
            _prompt: &str,
            _config: &GenerationConfig,
        ) -> Result<Generation, ServiceError> {
            Ok(Generation::text(format!("from {cache_name}")))
        }
    }

    fn manager(caches: Arc<RecordingCaches>) -> CacheManager {
        CacheManager::new(caches, Arc::new(NoInference))
    }

    #[test]
    fn ttl_conversion_floors_to_whole_seconds() {
        assert_eq!(hours_to_ttl_seconds(2.0).unwrap(), 7200);
        assert_eq!(hours_to_ttl_seconds(0.5).unwrap(), 1800);
        assert_eq!(hours_to_ttl_seconds(1.0 / 7200.0 * 3.0).unwrap(), 1);
        assert!(hours_to_ttl_seconds(0.0).is_err());
        assert!(hours_to_ttl_seconds(-1.0).is_err());
        assert!(hours_to_ttl_seconds(f64::INFINITY).is_err());
        assert!(hours_to_ttl_seconds(0.0001).is_err());
    }

    #[tokio::test]
    async fn update_ttl_sends_seconds() {
        let caches = Arc::new(RecordingCaches::default());
        let mgr = manager(caches.clone());
        mgr.update_cache_ttl("cachedContents/a", 2.0).await.unwrap();
        mgr.update_cache_ttl("cachedContents/b", 0.5).await.unwrap();
        let calls = caches.ttl_calls.lock().unwrap().clone();
        assert_eq!(
            calls,
            vec![
                ("cachedContents/a".to_string(), 7200),
                ("cachedContents/b".to_string(), 1800)
            ]
        );
    }

    #[tokio::test]
    async fn invalid_ttl_never_reaches_the_service() {
        let caches = Arc::new(RecordingCaches::default());
        let err = manager(caches.clone())
            .update_cache_ttl("cachedContents/a", 0.0)
            .await
            .unwrap_err();
        assert!(matches!(err, DocParseError::InvalidConfig(_)));
        assert!(caches.ttl_calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn create_failure_propagates() {
        let caches = Arc::new(RecordingCaches {
            fail: true,
            ..Default::default()
        });
        let err = manager(caches)
            .create_cache("gemini-2.0-flash", &[ContentPart::text("x")], None)
            .await
            .unwrap_err();
        assert!(matches!(err, DocParseError::Cache { operation: "create", .. }));
    }

    #[tokio::test]
    async fn delete_of_missing_handle_is_swallowed() {
        let mgr = manager(Arc::new(RecordingCaches::default()));
        mgr.delete_cache("cachedContents/gone").await;
        mgr.delete_cache("cachedContents/gone").await;
    }

    #[tokio::test]
    async fn generate_uses_handle() {
        let mgr = manager(Arc::new(RecordingCaches::default()));
        let gen = mgr
            .generate_with_cache("m", "cachedContents/c1", "go", &GenerationConfig::default())
            .await
            .unwrap();
        assert_eq!(gen.text, "from cachedContents/c1");
    }

    struct DownInference;

    #[async_trait]
    impl InferenceService for DownInference {
        fn backend(&self) -> &str {
            "down"
        }

        async fn generate(
            &self,
            _model: &str,
            _parts: &[ContentPart],
            _config: &GenerationConfig,
        ) -> Result<Generation, ServiceError> {
            unreachable!("only cached generation is exercised")
        }

        async fn generate_with_cache(
            &self,
            _model: &str,
            _cache_name: &str,
            _prompt: &str,
            _config: &GenerationConfig,
        ) -> Result<Generation, ServiceError> {
            Err(ServiceError::Http {
                operation: "generate",
                reason: "connection reset".into(),
            })
        }
    }

    #[tokio::test]
    async fn retried_generate_succeeds_through_the_handle() {
        let mgr = manager(Arc::new(RecordingCaches::default()));
        let retry = RetryExecutor::new(3, std::time::Duration::from_millis(1));
        let out = mgr
            .generate_with_cache_retried(
                &retry,
                &CancelToken::new(),
                0,
                "m",
                "cachedContents/c1",
                "go",
                &GenerationConfig::default(),
            )
            .await
            .unwrap();
        assert_eq!(out.value.text, "from cachedContents/c1");
        assert_eq!(out.attempts, 1);
    }

    #[tokio::test]
    async fn retried_generate_exhaustion_is_a_cache_error() {
        let mgr = CacheManager::new(
            Arc::new(RecordingCaches::default()),
            Arc::new(DownInference),
        );
        let retry = RetryExecutor::new(2, std::time::Duration::from_millis(1));
        let err = mgr
            .generate_with_cache_retried(
                &retry,
                &CancelToken::new(),
                0,
                "m",
                "cachedContents/c1",
                "go",
                &GenerationConfig::default(),
            )
            .await
            .unwrap_err();
        match err {
            CachedGenerationError::Failed { attempts, error } => {
                assert_eq!(attempts, 2);
                assert!(matches!(
                    error,
                    DocParseError::Cache {
                        operation: "generate",
                        ..
                    }
                ));
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
