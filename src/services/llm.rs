//! Inference through any `edgequake_llm` provider.
//!
//! Vision-capable chat providers (OpenAI, Anthropic, Gemini via the
//! factory, Ollama, …) accept inline attachments as images, which is
//! enough for plain chunk generation. They have no notion of server-side
//! context caches or uploaded file references, so those paths report
//! [`ServiceError::Unsupported`] and the retry executor gives up on them
//! immediately.

use crate::error::{DocParseError, ServiceError};
use crate::services::{ContentPart, Generation, GenerationConfig, InferenceService};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use edgequake_llm::{ChatMessage, CompletionOptions, ImageData, LLMProvider, ProviderFactory};
use std::sync::Arc;
use tracing::debug;

const DEFAULT_OPENAI_MODEL: &str = "gpt-4.1-nano";

pub struct LlmProviderService {
    provider: Arc<dyn LLMProvider>,
    label: String,
}

impl std::fmt::Debug for LlmProviderService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LlmProviderService")
            .field("label", &self.label)
            .finish()
    }
}

impl LlmProviderService {
    /// Wrap an already configured provider.
    pub fn new(provider: Arc<dyn LLMProvider>, label: impl Into<String>) -> Self {
        Self {
            provider,
            label: label.into(),
        }
    }

    /// Resolve a provider, from most-specific to least-specific:
    ///
    /// 1. `provider_name` (+ `model`) given by the caller.
    /// 2. `EDGEQUAKE_LLM_PROVIDER` + `EDGEQUAKE_MODEL`, when both are set.
    /// 3. `OPENAI_API_KEY` present → OpenAI.
    /// 4. Whatever `ProviderFactory::from_env` detects.
    pub fn resolve(
        provider_name: Option<&str>,
        model: Option<&str>,
    ) -> Result<Self, DocParseError> {
        if let Some(name) = provider_name {
            let model = model.unwrap_or(DEFAULT_OPENAI_MODEL);
            return Self::named(name, model);
        }

        if let (Ok(prov), Ok(model)) = (
            std::env::var("EDGEQUAKE_LLM_PROVIDER"),
            std::env::var("EDGEQUAKE_MODEL"),
        ) {
            if !prov.is_empty() && !model.is_empty() {
                return Self::named(&prov, &model);
            }
        }

        if std::env::var("OPENAI_API_KEY").is_ok_and(|k| !k.is_empty()) {
            return Self::named("openai", model.unwrap_or(DEFAULT_OPENAI_MODEL));
        }

        let (provider, _embedding) =
            ProviderFactory::from_env().map_err(|e| DocParseError::ProviderNotConfigured {
                provider: "auto".to_string(),
                hint: format!(
                    "No LLM provider could be auto-detected from environment.\n\
                    Set GEMINI_API_KEY, OPENAI_API_KEY or EDGEQUAKE_LLM_PROVIDER.\n\
                    Error: {}",
                    e
                ),
            })?;
        Ok(Self::new(provider, "auto"))
    }

    fn named(name: &str, model: &str) -> Result<Self, DocParseError> {
        let provider = ProviderFactory::create_llm_provider(name, model).map_err(|e| {
            DocParseError::ProviderNotConfigured {
                provider: name.to_string(),
                hint: format!("{e}"),
            }
        })?;
        Ok(Self::new(provider, name))
    }
}

/// Split request parts into the prompt text and image attachments.
///
/// Text parts are joined with a blank line. File references cannot be
/// expressed as chat attachments and are rejected.
fn to_user_message(parts: &[ContentPart], backend: &str) -> Result<ChatMessage, ServiceError> {
    let mut texts = Vec::new();
    let mut images = Vec::new();
    for part in parts {
        match part {
            ContentPart::Text(t) => texts.push(t.as_str()),
            ContentPart::Inline { mime_type, data } => {
                images.push(ImageData::new(STANDARD.encode(data), mime_type.as_str()));
            }
            ContentPart::File { .. } => {
                return Err(ServiceError::Unsupported {
                    operation: "file references",
                    backend: backend.to_string(),
                })
            }
        }
    }
    let text = texts.join("\n\n");
    Ok(if images.is_empty() {
        ChatMessage::user(text)
    } else {
        ChatMessage::user_with_images(text, images)
    })
}

fn build_options(config: &GenerationConfig) -> CompletionOptions {
    CompletionOptions {
        temperature: config.temperature,
        max_tokens: config.max_output_tokens,
        ..Default::default()
    }
}

#[async_trait]
impl InferenceService for LlmProviderService {
    fn backend(&self) -> &str {
        &self.label
    }

    async fn generate(
        &self,
        _model: &str,
        parts: &[ContentPart],
        config: &GenerationConfig,
    ) -> Result<Generation, ServiceError> {
        // The provider was created for a specific model; `_model` is only
        // meaningful to services that route per request.
        let mut messages = Vec::with_capacity(2);
        if let Some(ref instruction) = config.system_instruction {
            messages.push(ChatMessage::system(instruction.as_str()));
        }
        messages.push(to_user_message(parts, &self.label)?);

        let options = build_options(config);
        let response = self
            .provider
            .chat(&messages, Some(&options))
            .await
            .map_err(|e| ServiceError::Http {
                operation: "chat",
                reason: e.to_string(),
            })?;
        debug!(
            "{}: {} input tokens, {} output tokens",
            self.label, response.prompt_tokens, response.completion_tokens
        );

        Ok(Generation {
            text: response.content,
            input_tokens: response.prompt_tokens as u64,
            output_tokens: response.completion_tokens as u64,
        })
    }

    async fn generate_with_cache(
        &self,
        _model: &str,
        _cache_name: &str,
        _prompt: &str,
        _config: &GenerationConfig,
    ) -> Result<Generation, ServiceError> {
        Err(ServiceError::Unsupported {
            operation: "context caching",
            backend: self.label.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn options_follow_generation_config() {
        let opts = build_options(&GenerationConfig {
            temperature: Some(0.2),
            max_output_tokens: Some(2048),
            ..Default::default()
        });
        assert_eq!(opts.temperature, Some(0.2));
        assert_eq!(opts.max_tokens, Some(2048));
    }

    #[test]
    fn file_parts_are_unsupported() {
        let parts = [ContentPart::File {
            mime_type: "application/pdf".into(),
            uri: "files/x".into(),
        }];
        let err = to_user_message(&parts, "openai").unwrap_err();
        assert!(!err.is_retryable());
    }

    #[test]
    fn text_only_parts_build_a_message() {
        let parts = [ContentPart::text("a"), ContentPart::text("b")];
        assert!(to_user_message(&parts, "openai").is_ok());
    }
}
