//! Azure OpenAI adapter.
//!
//! The model name in the options selects the deployment:
//! `{endpoint}/openai/deployments/{model}/...?api-version=...`.

use std::fmt;

use async_trait::async_trait;
use reqwest::RequestBuilder;
use serde_json::Value;

use super::openai::wire;
use super::{
    model_or, require_messages, AiConfig, AiProvider, ChatMessage, ChatOptions, ChatResponse,
    EmbeddingOptions, EmbeddingResponse, ImageOptions, ImageResponse, TextOptions, TextResponse,
    DEFAULT_CHAT_MODEL, DEFAULT_EMBEDDING_MODEL, DEFAULT_IMAGE_MODEL, DEFAULT_TEXT_MODEL,
};
use crate::config::{required, ProviderConfig};
use crate::error::{Capability, ErrorDomain, ErrorKind, ServiceResult};
use crate::http::{base_url, HttpTransport};
use crate::provider::Provider;

const PROVIDER: &str = "azure";
const DEFAULT_API_VERSION: &str = "2024-02-01";

/// Azure OpenAI adapter.
pub struct AzureOpenAi {
    http: HttpTransport,
    endpoint: String,
    api_key: String,
    api_version: String,
}

impl fmt::Debug for AzureOpenAi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AzureOpenAi")
            .field("endpoint", &self.endpoint)
            .field("api_version", &self.api_version)
            .finish_non_exhaustive()
    }
}

impl AzureOpenAi {
    pub fn new(config: &AiConfig) -> ServiceResult<Self> {
        let endpoint = required(&config.endpoint, "endpoint", ErrorDomain::Ai, PROVIDER)?;
        let api_key = required(&config.api_key, "api_key", ErrorDomain::Ai, PROVIDER)?;
        Ok(Self {
            http: HttpTransport::new(ErrorDomain::Ai, PROVIDER, config.timeout())?,
            endpoint: base_url(endpoint),
            api_key: api_key.to_string(),
            api_version: config
                .api_version
                .clone()
                .unwrap_or_else(|| DEFAULT_API_VERSION.to_string()),
        })
    }

    fn post(&self, deployment: &str, operation: &str, body: &Value) -> RequestBuilder {
        self.http
            .client()
            .post(format!(
                "{}/openai/deployments/{}/{}",
                self.endpoint, deployment, operation
            ))
            .query(&[("api-version", &self.api_version)])
            .header("api-key", &self.api_key)
            .json(body)
    }
}

impl Provider for AzureOpenAi {
    fn name(&self) -> &str {
        PROVIDER
    }

    fn capability(&self) -> Capability {
        Capability::Ai
    }
}

#[async_trait]
impl AiProvider for AzureOpenAi {
    async fn chat_completion(
        &self,
        messages: &[ChatMessage],
        options: &ChatOptions,
    ) -> ServiceResult<ChatResponse> {
        require_messages(messages)?;
        let deployment = model_or(&options.model, DEFAULT_CHAT_MODEL);
        let body = wire::chat_body(None, messages, options);
        let response = self
            .http
            .send_json(
                self.post(deployment, "chat/completions", &body),
                ErrorKind::ProviderCallFailed,
                "Azure AI chat completion failed",
            )
            .await?;
        Ok(wire::chat_response(response, deployment))
    }

    async fn generate_text(
        &self,
        prompt: &str,
        options: &TextOptions,
    ) -> ServiceResult<TextResponse> {
        let deployment = model_or(&options.model, DEFAULT_TEXT_MODEL);
        let body = wire::text_body(None, prompt, options);
        let response = self
            .http
            .send_json(
                self.post(deployment, "completions", &body),
                ErrorKind::ProviderCallFailed,
                "Azure AI text generation failed",
            )
            .await?;
        Ok(wire::text_response(response, deployment))
    }

    async fn generate_image(
        &self,
        prompt: &str,
        options: &ImageOptions,
    ) -> ServiceResult<ImageResponse> {
        let deployment = model_or(&options.model, DEFAULT_IMAGE_MODEL);
        let body = wire::image_body(None, prompt, options);
        let response = self
            .http
            .send_json(
                self.post(deployment, "images/generations", &body),
                ErrorKind::ProviderCallFailed,
                "Azure AI image generation failed",
            )
            .await?;
        Ok(wire::image_response(response, deployment))
    }

    async fn generate_embeddings(
        &self,
        input: &str,
        options: &EmbeddingOptions,
    ) -> ServiceResult<EmbeddingResponse> {
        let deployment = model_or(&options.model, DEFAULT_EMBEDDING_MODEL);
        let body = wire::embedding_body(None, input);
        let response = self
            .http
            .send_json(
                self.post(deployment, "embeddings", &body),
                ErrorKind::ProviderCallFailed,
                "Azure AI embedding generation failed",
            )
            .await?;
        Ok(wire::embedding_response(response, deployment))
    }
}
