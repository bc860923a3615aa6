//! Anthropic adapter over the Messages API.
//!
//! System messages are joined into the top-level `system` field. Text
//! generation is a single-turn message. Image generation and embeddings are
//! not offered by Anthropic and fail with `UnsupportedOperation`.

use std::fmt;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Map, Value};

use super::{
    max_tokens, model_or, require_messages, temperature, AiConfig, AiProvider, ChatMessage,
    ChatOptions, ChatResponse, ChatRole, EmbeddingOptions, EmbeddingResponse, ImageOptions,
    ImageResponse, TextOptions, TextResponse, TokenUsage, DEFAULT_FINISH_REASON,
};
use crate::config::{required, ProviderConfig};
use crate::error::{Capability, ErrorDomain, ErrorKind, ServiceResult};
use crate::http::{base_url, HttpTransport};
use crate::provider::Provider;

const PROVIDER: &str = "anthropic";
const API_URL: &str = "https://api.anthropic.com";
const API_VERSION: &str = "2023-06-01";
pub const DEFAULT_MODEL: &str = "claude-3-sonnet-20240229";

#[derive(Debug, Deserialize)]
struct MessageResponse {
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    content: Vec<ContentBlock>,
    #[serde(default)]
    stop_reason: Option<String>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct Usage {
    #[serde(default)]
    input_tokens: u32,
    #[serde(default)]
    output_tokens: u32,
}

impl MessageResponse {
    fn text(&self) -> String {
        self.content
            .iter()
            .filter(|block| block.kind == "text")
            .filter_map(|block| block.text.as_deref())
            .collect()
    }

    fn usage(&self) -> TokenUsage {
        self.usage
            .as_ref()
            .map(|u| TokenUsage::counted(u.input_tokens, u.output_tokens))
            .unwrap_or_default()
    }
}

/// Anthropic adapter.
pub struct Anthropic {
    http: HttpTransport,
    base: String,
    api_key: String,
}

impl fmt::Debug for Anthropic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Anthropic")
            .field("base", &self.base)
            .finish_non_exhaustive()
    }
}

impl Anthropic {
    pub fn new(config: &AiConfig) -> ServiceResult<Self> {
        let api_key = required(&config.api_key, "api_key", ErrorDomain::Ai, PROVIDER)?;
        Ok(Self {
            http: HttpTransport::new(ErrorDomain::Ai, PROVIDER, config.timeout())?,
            base: config
                .base_url
                .as_deref()
                .map(base_url)
                .unwrap_or_else(|| API_URL.to_string()),
            api_key: api_key.to_string(),
        })
    }

    async fn messages(&self, body: Value, context: &str) -> ServiceResult<MessageResponse> {
        let request = self
            .http
            .client()
            .post(format!("{}/v1/messages", self.base))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .json(&body);
        self.http
            .send_json(request, ErrorKind::ProviderCallFailed, context)
            .await
    }
}

fn message_body(model: &str, messages: &[ChatMessage], options: &ChatOptions) -> Value {
    let system: Vec<&str> = messages
        .iter()
        .filter(|m| m.role == ChatRole::System)
        .map(|m| m.content.as_str())
        .collect();
    let turns: Vec<&ChatMessage> = messages
        .iter()
        .filter(|m| m.role != ChatRole::System)
        .collect();

    let mut body = Map::new();
    body.insert("model".to_string(), json!(model));
    body.insert("max_tokens".to_string(), json!(max_tokens(options.max_tokens)));
    body.insert("temperature".to_string(), json!(temperature(options.temperature)));
    body.insert("messages".to_string(), json!(turns));
    if !system.is_empty() {
        body.insert("system".to_string(), json!(system.join("\n\n")));
    }
    if let Some(top_p) = options.top_p {
        body.insert("top_p".to_string(), json!(top_p));
    }
    if !options.stop.is_empty() {
        body.insert("stop_sequences".to_string(), json!(options.stop));
    }
    Value::Object(body)
}

impl Provider for Anthropic {
    fn name(&self) -> &str {
        PROVIDER
    }

    fn capability(&self) -> Capability {
        Capability::Ai
    }

    fn unsupported_operations(&self) -> &[&'static str] {
        &["generate_image", "generate_embeddings"]
    }
}

#[async_trait]
impl AiProvider for Anthropic {
    async fn chat_completion(
        &self,
        messages: &[ChatMessage],
        options: &ChatOptions,
    ) -> ServiceResult<ChatResponse> {
        require_messages(messages)?;
        let model = model_or(&options.model, DEFAULT_MODEL);
        let response = self
            .messages(
                message_body(model, messages, options),
                "Anthropic chat completion failed",
            )
            .await?;
        Ok(ChatResponse {
            content: response.text(),
            usage: response.usage(),
            finish_reason: response
                .stop_reason
                .clone()
                .unwrap_or_else(|| DEFAULT_FINISH_REASON.to_string()),
            model: response.model.unwrap_or_else(|| model.to_string()),
        })
    }

    async fn generate_text(
        &self,
        prompt: &str,
        options: &TextOptions,
    ) -> ServiceResult<TextResponse> {
        let model = model_or(&options.model, DEFAULT_MODEL);
        let chat = ChatOptions {
            temperature: options.temperature,
            max_tokens: options.max_tokens,
            top_p: options.top_p,
            ..Default::default()
        };
        let response = self
            .messages(
                message_body(model, &[ChatMessage::user(prompt)], &chat),
                "Anthropic text generation failed",
            )
            .await?;
        Ok(TextResponse {
            text: response.text(),
            usage: response.usage(),
            model: response.model.unwrap_or_else(|| model.to_string()),
        })
    }

    async fn generate_image(
        &self,
        _prompt: &str,
        _options: &ImageOptions,
    ) -> ServiceResult<ImageResponse> {
        Err(self.unsupported("generate_image"))
    }

    async fn generate_embeddings(
        &self,
        _input: &str,
        _options: &EmbeddingOptions,
    ) -> ServiceResult<EmbeddingResponse> {
        Err(self.unsupported("generate_embeddings"))
    }
}
