//! AI capability.
//!
//! | provider    | chat | text | image | embeddings |
//! |-------------|------|------|-------|------------|
//! | `openai`    | yes  | yes  | yes   | yes        |
//! | `anthropic` | yes  | yes  | no    | no         |
//! | `google`    | yes  | yes  | yes   | yes        |
//! | `azure`     | yes  | yes  | yes   | yes        |
//!
//! Options left unset fall back to per-provider defaults. Responses always
//! carry every field: missing usage counts are zero, a missing finish reason
//! is `"stop"` and a missing model echoes the requested one.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::{ProviderConfig, DEFAULT_TIMEOUT_MS};
use crate::error::{Capability, ErrorDomain, ServiceError, ServiceResult};
use crate::provider::Provider;
use crate::registry::{ProviderTable, ProviderTableBuilder};

pub mod anthropic;
pub mod azure;
pub mod google;
pub mod openai;

pub const DEFAULT_CHAT_MODEL: &str = "gpt-4";
pub const DEFAULT_TEXT_MODEL: &str = "gpt-3.5-turbo-instruct";
pub const DEFAULT_IMAGE_MODEL: &str = "dall-e-3";
pub const DEFAULT_IMAGE_SIZE: &str = "1024x1024";
pub const DEFAULT_IMAGE_QUALITY: &str = "standard";
pub const DEFAULT_EMBEDDING_MODEL: &str = "text-embedding-ada-002";
pub const DEFAULT_TEMPERATURE: f64 = 0.7;
pub const DEFAULT_MAX_TOKENS: u32 = 1000;
pub const DEFAULT_FINISH_REASON: &str = "stop";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ChatOptions {
    pub model: Option<String>,
    pub temperature: Option<f64>,
    pub max_tokens: Option<u32>,
    pub top_p: Option<f64>,
    pub frequency_penalty: Option<f64>,
    pub presence_penalty: Option<f64>,
    pub stop: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TextOptions {
    pub model: Option<String>,
    pub temperature: Option<f64>,
    pub max_tokens: Option<u32>,
    pub top_p: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ImageOptions {
    pub model: Option<String>,
    pub size: Option<String>,
    pub quality: Option<String>,
    pub style: Option<String>,
    pub n: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EmbeddingOptions {
    pub model: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

impl TokenUsage {
    /// Usage from prompt and completion counts, total being their sum.
    pub fn counted(prompt_tokens: u32, completion_tokens: u32) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens.saturating_add(completion_tokens),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatResponse {
    pub content: String,
    pub model: String,
    pub usage: TokenUsage,
    pub finish_reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TextResponse {
    pub text: String,
    pub model: String,
    pub usage: TokenUsage,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageData {
    /// Hosted image URL; empty when the provider returns inline data only.
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base64: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revised_prompt: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageResponse {
    pub images: Vec<ImageData>,
    pub model: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmbeddingResponse {
    pub embeddings: Vec<f32>,
    pub model: String,
    pub usage: TokenUsage,
}

/// AI capability contract.
#[async_trait]
pub trait AiProvider: Provider {
    async fn chat_completion(
        &self,
        messages: &[ChatMessage],
        options: &ChatOptions,
    ) -> ServiceResult<ChatResponse>;

    async fn generate_text(&self, prompt: &str, options: &TextOptions)
        -> ServiceResult<TextResponse>;

    async fn generate_image(
        &self,
        prompt: &str,
        options: &ImageOptions,
    ) -> ServiceResult<ImageResponse>;

    async fn generate_embeddings(
        &self,
        input: &str,
        options: &EmbeddingOptions,
    ) -> ServiceResult<EmbeddingResponse>;
}

/// Configuration consumed by AI adapters.
///
/// Keys used per provider:
/// - `openai`: `api_key`, `organization`, `base_url`
/// - `anthropic`: `api_key`, `base_url`
/// - `google`: `api_key`, `base_url`
/// - `azure`: `endpoint`, `api_key`, `api_version` (default "2024-02-01")
#[derive(Clone, Default, Deserialize)]
#[serde(default)]
pub struct AiConfig {
    pub api_key: Option<String>,
    pub organization: Option<String>,
    pub endpoint: Option<String>,
    pub api_version: Option<String>,
    pub base_url: Option<String>,
    pub timeout_ms: Option<u64>,
}

impl fmt::Debug for AiConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AiConfig")
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("organization", &self.organization)
            .field("endpoint", &self.endpoint)
            .field("api_version", &self.api_version)
            .field("base_url", &self.base_url)
            .field("timeout_ms", &self.timeout_ms)
            .finish()
    }
}

impl ProviderConfig for AiConfig {
    fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms.unwrap_or(DEFAULT_TIMEOUT_MS))
    }
}

pub(crate) fn temperature(value: Option<f64>) -> f64 {
    value.unwrap_or(DEFAULT_TEMPERATURE)
}

/// A zero token budget is treated as unset.
pub(crate) fn max_tokens(value: Option<u32>) -> u32 {
    value.filter(|n| *n > 0).unwrap_or(DEFAULT_MAX_TOKENS)
}

pub(crate) fn model_or<'a>(value: &'a Option<String>, default: &'a str) -> &'a str {
    value
        .as_deref()
        .filter(|m| !m.trim().is_empty())
        .unwrap_or(default)
}

pub(crate) fn require_messages(messages: &[ChatMessage]) -> ServiceResult<()> {
    if messages.is_empty() {
        return Err(ServiceError::provider_call(
            ErrorDomain::Ai,
            "chat completion requires at least one message",
        ));
    }
    Ok(())
}

type AiTable = ProviderTable<dyn AiProvider, AiConfig>;

/// Resolves AI provider names to adapters.
#[derive(Debug)]
pub struct AiServiceFactory {
    table: AiTable,
}

impl AiServiceFactory {
    pub fn new() -> Self {
        Self::from_table(Self::builder().build())
    }

    /// Builder pre-populated with `openai`, `anthropic`, `google` and `azure`.
    pub fn builder() -> ProviderTableBuilder<dyn AiProvider, AiConfig> {
        ProviderTableBuilder::new(Capability::Ai)
            .with("openai", build_openai)
            .with("anthropic", build_anthropic)
            .with("google", build_google)
            .with("azure", build_azure)
    }

    pub fn from_table(table: AiTable) -> Self {
        Self { table }
    }

    pub fn create_service(
        &self,
        provider: &str,
        config: &AiConfig,
    ) -> ServiceResult<Arc<dyn AiProvider>> {
        self.table.resolve(provider, config)
    }

    pub fn providers(&self) -> Vec<&str> {
        self.table.names()
    }
}

impl Default for AiServiceFactory {
    fn default() -> Self {
        Self::new()
    }
}

fn build_openai(config: &AiConfig) -> ServiceResult<Arc<dyn AiProvider>> {
    Ok(Arc::new(openai::OpenAi::new(config)?))
}

fn build_anthropic(config: &AiConfig) -> ServiceResult<Arc<dyn AiProvider>> {
    Ok(Arc::new(anthropic::Anthropic::new(config)?))
}

fn build_google(config: &AiConfig) -> ServiceResult<Arc<dyn AiProvider>> {
    Ok(Arc::new(google::GoogleAi::new(config)?))
}

fn build_azure(config: &AiConfig) -> ServiceResult<Arc<dyn AiProvider>> {
    Ok(Arc::new(azure::AzureOpenAi::new(config)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_option_defaults() {
        assert_eq!(temperature(None), 0.7);
        assert_eq!(temperature(Some(0.0)), 0.0);
        assert_eq!(max_tokens(None), 1000);
        assert_eq!(max_tokens(Some(0)), 1000);
        assert_eq!(max_tokens(Some(64)), 64);
        assert_eq!(model_or(&None, "gpt-4"), "gpt-4");
        assert_eq!(model_or(&Some(" ".to_string()), "gpt-4"), "gpt-4");
        assert_eq!(model_or(&Some("gpt-4o".to_string()), "gpt-4"), "gpt-4o");
    }

    #[test]
    fn test_message_serialization() {
        let json = serde_json::to_value(ChatMessage::system("be brief")).unwrap();
        assert_eq!(json["role"], "system");
    }

    #[test]
    fn test_usage_counted() {
        assert_eq!(TokenUsage::counted(3, 4).total_tokens, 7);
        assert_eq!(TokenUsage::default().total_tokens, 0);
    }

    #[test]
    fn test_config_debug_redacts_key() {
        let config = AiConfig {
            api_key: Some("sk-secret".to_string()),
            ..Default::default()
        };
        assert!(!format!("{:?}", config).contains("sk-secret"));
    }

    #[test]
    fn test_factory() {
        let factory = AiServiceFactory::new();
        assert_eq!(factory.providers(), vec!["openai", "anthropic", "google", "azure"]);
        let err = factory
            .create_service("cohere", &AiConfig::default())
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnknownProvider);
        assert_eq!(err.domain(), ErrorDomain::Ai);
    }

    #[test]
    fn test_empty_conversation_rejected() {
        assert!(require_messages(&[]).is_err());
        assert!(require_messages(&[ChatMessage::user("hi")]).is_ok());
    }
}
