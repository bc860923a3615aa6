//! OpenAI adapter, plus the request and response shapes Azure OpenAI
//! shares with it.

use std::fmt;

use async_trait::async_trait;
use reqwest::RequestBuilder;
use serde::Deserialize;
use serde_json::{json, Map, Value};

use super::{
    max_tokens, model_or, require_messages, temperature, AiConfig, AiProvider, ChatMessage,
    ChatOptions, ChatResponse, EmbeddingOptions, EmbeddingResponse, ImageData, ImageOptions,
    ImageResponse, TextOptions, TextResponse, TokenUsage, DEFAULT_CHAT_MODEL,
    DEFAULT_EMBEDDING_MODEL, DEFAULT_FINISH_REASON, DEFAULT_IMAGE_MODEL, DEFAULT_IMAGE_QUALITY,
    DEFAULT_IMAGE_SIZE, DEFAULT_TEXT_MODEL,
};
use crate::config::{required, ProviderConfig};
use crate::error::{Capability, ErrorDomain, ErrorKind, ServiceResult};
use crate::http::{base_url, HttpTransport};
use crate::provider::Provider;

const PROVIDER: &str = "openai";
const API_URL: &str = "https://api.openai.com/v1";

#[derive(Debug, Default, Deserialize)]
struct Usage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
    #[serde(default)]
    total_tokens: u32,
}

impl From<Option<Usage>> for TokenUsage {
    fn from(usage: Option<Usage>) -> Self {
        let usage = usage.unwrap_or_default();
        TokenUsage {
            prompt_tokens: usage.prompt_tokens,
            completion_tokens: usage.completion_tokens,
            total_tokens: usage.total_tokens,
        }
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct ChatCompletion {
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    #[serde(default)]
    message: Option<ChoiceMessage>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct Completion {
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    choices: Vec<TextChoice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct TextChoice {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct Images {
    #[serde(default)]
    data: Vec<ImageItem>,
}

#[derive(Debug, Deserialize)]
struct ImageItem {
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    b64_json: Option<String>,
    #[serde(default)]
    revised_prompt: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct Embeddings {
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    data: Vec<EmbeddingItem>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingItem {
    #[serde(default)]
    embedding: Vec<f32>,
}

/// Request bodies and response mapping of the OpenAI wire format. `model`
/// is `None` for Azure, where the deployment in the URL selects the model.
pub(crate) mod wire {
    use super::*;

    fn insert_opt<T: serde::Serialize>(body: &mut Map<String, Value>, key: &str, value: Option<T>) {
        if let Some(value) = value {
            body.insert(key.to_string(), json!(value));
        }
    }

    pub(crate) fn chat_body(
        model: Option<&str>,
        messages: &[ChatMessage],
        options: &ChatOptions,
    ) -> Value {
        let mut body = Map::new();
        insert_opt(&mut body, "model", model);
        body.insert("messages".to_string(), json!(messages));
        body.insert("temperature".to_string(), json!(temperature(options.temperature)));
        body.insert("max_tokens".to_string(), json!(max_tokens(options.max_tokens)));
        insert_opt(&mut body, "top_p", options.top_p);
        insert_opt(&mut body, "frequency_penalty", options.frequency_penalty);
        insert_opt(&mut body, "presence_penalty", options.presence_penalty);
        if !options.stop.is_empty() {
            body.insert("stop".to_string(), json!(options.stop));
        }
        Value::Object(body)
    }

    pub(crate) fn chat_response(response: ChatCompletion, requested: &str) -> ChatResponse {
        let choice = response.choices.into_iter().next();
        let finish_reason = choice
            .as_ref()
            .and_then(|c| c.finish_reason.clone())
            .unwrap_or_else(|| DEFAULT_FINISH_REASON.to_string());
        ChatResponse {
            content: choice
                .and_then(|c| c.message)
                .and_then(|m| m.content)
                .unwrap_or_default(),
            model: response.model.unwrap_or_else(|| requested.to_string()),
            usage: response.usage.into(),
            finish_reason,
        }
    }

    pub(crate) fn text_body(model: Option<&str>, prompt: &str, options: &TextOptions) -> Value {
        let mut body = Map::new();
        insert_opt(&mut body, "model", model);
        body.insert("prompt".to_string(), json!(prompt));
        body.insert("temperature".to_string(), json!(temperature(options.temperature)));
        body.insert("max_tokens".to_string(), json!(max_tokens(options.max_tokens)));
        insert_opt(&mut body, "top_p", options.top_p);
        Value::Object(body)
    }

    pub(crate) fn text_response(response: Completion, requested: &str) -> TextResponse {
        TextResponse {
            text: response
                .choices
                .into_iter()
                .next()
                .and_then(|c| c.text)
                .unwrap_or_default(),
            model: response.model.unwrap_or_else(|| requested.to_string()),
            usage: response.usage.into(),
        }
    }

    pub(crate) fn image_body(model: Option<&str>, prompt: &str, options: &ImageOptions) -> Value {
        let mut body = Map::new();
        insert_opt(&mut body, "model", model);
        body.insert("prompt".to_string(), json!(prompt));
        body.insert(
            "size".to_string(),
            json!(model_or(&options.size, DEFAULT_IMAGE_SIZE)),
        );
        body.insert(
            "quality".to_string(),
            json!(model_or(&options.quality, DEFAULT_IMAGE_QUALITY)),
        );
        body.insert("n".to_string(), json!(options.n.filter(|n| *n > 0).unwrap_or(1)));
        insert_opt(&mut body, "style", options.style.as_deref());
        Value::Object(body)
    }

    pub(crate) fn image_response(response: Images, requested: &str) -> ImageResponse {
        ImageResponse {
            images: response
                .data
                .into_iter()
                .map(|item| ImageData {
                    url: item.url.unwrap_or_default(),
                    base64: item.b64_json,
                    revised_prompt: item.revised_prompt,
                })
                .collect(),
            model: requested.to_string(),
        }
    }

    pub(crate) fn embedding_body(model: Option<&str>, input: &str) -> Value {
        let mut body = Map::new();
        insert_opt(&mut body, "model", model);
        body.insert("input".to_string(), json!(input));
        Value::Object(body)
    }

    /// Embeddings report no completion tokens.
    pub(crate) fn embedding_response(response: Embeddings, requested: &str) -> EmbeddingResponse {
        let mut usage: TokenUsage = response.usage.into();
        usage.completion_tokens = 0;
        EmbeddingResponse {
            embeddings: response
                .data
                .into_iter()
                .next()
                .map(|item| item.embedding)
                .unwrap_or_default(),
            model: response.model.unwrap_or_else(|| requested.to_string()),
            usage,
        }
    }
}

/// OpenAI adapter.
pub struct OpenAi {
    http: HttpTransport,
    base: String,
    api_key: String,
    organization: Option<String>,
}

impl fmt::Debug for OpenAi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpenAi")
            .field("base", &self.base)
            .field("organization", &self.organization)
            .finish_non_exhaustive()
    }
}

impl OpenAi {
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
            organization: config.organization.clone(),
        })
    }

    fn post(&self, path: &str, body: &Value) -> RequestBuilder {
        let request = self
            .http
            .client()
            .post(format!("{}/{}", self.base, path))
            .bearer_auth(&self.api_key)
            .json(body);
        match &self.organization {
            Some(org) => request.header("OpenAI-Organization", org),
            None => request,
        }
    }
}

impl Provider for OpenAi {
    fn name(&self) -> &str {
        PROVIDER
    }

    fn capability(&self) -> Capability {
        Capability::Ai
    }
}

#[async_trait]
impl AiProvider for OpenAi {
    async fn chat_completion(
        &self,
        messages: &[ChatMessage],
        options: &ChatOptions,
    ) -> ServiceResult<ChatResponse> {
        require_messages(messages)?;
        let model = model_or(&options.model, DEFAULT_CHAT_MODEL);
        let body = wire::chat_body(Some(model), messages, options);
        let response = self
            .http
            .send_json(
                self.post("chat/completions", &body),
                ErrorKind::ProviderCallFailed,
                "OpenAI chat completion failed",
            )
            .await?;
        Ok(wire::chat_response(response, model))
    }

    async fn generate_text(
        &self,
        prompt: &str,
        options: &TextOptions,
    ) -> ServiceResult<TextResponse> {
        let model = model_or(&options.model, DEFAULT_TEXT_MODEL);
        let body = wire::text_body(Some(model), prompt, options);
        let response = self
            .http
            .send_json(
                self.post("completions", &body),
                ErrorKind::ProviderCallFailed,
                "OpenAI text generation failed",
            )
            .await?;
        Ok(wire::text_response(response, model))
    }

    async fn generate_image(
        &self,
        prompt: &str,
        options: &ImageOptions,
    ) -> ServiceResult<ImageResponse> {
        let model = model_or(&options.model, DEFAULT_IMAGE_MODEL);
        let body = wire::image_body(Some(model), prompt, options);
        let response = self
            .http
            .send_json(
                self.post("images/generations", &body),
                ErrorKind::ProviderCallFailed,
                "OpenAI image generation failed",
            )
            .await?;
        Ok(wire::image_response(response, model))
    }

    async fn generate_embeddings(
        &self,
        input: &str,
        options: &EmbeddingOptions,
    ) -> ServiceResult<EmbeddingResponse> {
        let model = model_or(&options.model, DEFAULT_EMBEDDING_MODEL);
        let body = wire::embedding_body(Some(model), input);
        let response = self
            .http
            .send_json(
                self.post("embeddings", &body),
                ErrorKind::ProviderCallFailed,
                "OpenAI embedding generation failed",
            )
            .await?;
        Ok(wire::embedding_response(response, model))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config(server: &MockServer) -> AiConfig {
        AiConfig {
            api_key: Some("sk-test".to_string()),
            organization: Some("org-1".to_string()),
            base_url: Some(server.uri()),
            ..Default::default()
        }
    }

    #[test]
    fn test_new_requires_api_key() {
        let err = OpenAi::new(&AiConfig::default()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidConfiguration);
    }

    #[test]
    fn test_chat_body_defaults() {
        let body = wire::chat_body(Some("gpt-4"), &[ChatMessage::user("hi")], &ChatOptions::default());
        assert_eq!(body["model"], "gpt-4");
        assert_eq!(body["max_tokens"], 1000);
        assert_eq!(body["messages"][0]["role"], "user");
        assert!(body.get("top_p").is_none());
        assert!(body.get("stop").is_none());
    }

    #[test]
    fn test_chat_response_fills_missing_fields() {
        let response: ChatCompletion = serde_json::from_value(json!({
            "choices": [{"message": {"content": null}}]
        }))
        .unwrap();
        let chat = wire::chat_response(response, "gpt-4");
        assert_eq!(chat.content, "");
        assert_eq!(chat.model, "gpt-4");
        assert_eq!(chat.finish_reason, "stop");
        assert_eq!(chat.usage, TokenUsage::default());
    }

    #[tokio::test]
    async fn test_chat_completion() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(header("authorization", "Bearer sk-test"))
            .and(header("openai-organization", "org-1"))
            .and(body_partial_json(json!({"model": "gpt-4", "temperature": 0.2})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "model": "gpt-4-0613",
                "choices": [{
                    "message": {"role": "assistant", "content": "Hello!"},
                    "finish_reason": "length"
                }],
                "usage": {"prompt_tokens": 5, "completion_tokens": 2, "total_tokens": 7}
            })))
            .mount(&server)
            .await;

        let ai = OpenAi::new(&config(&server)).unwrap();
        let options = ChatOptions {
            temperature: Some(0.2),
            ..Default::default()
        };
        let response = ai
            .chat_completion(&[ChatMessage::user("hi")], &options)
            .await
            .unwrap();
        assert_eq!(response.content, "Hello!");
        assert_eq!(response.model, "gpt-4-0613");
        assert_eq!(response.finish_reason, "length");
        assert_eq!(response.usage.total_tokens, 7);
    }

    #[tokio::test]
    async fn test_chat_failure_wrapped() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(429).set_body_string("rate limited"))
            .mount(&server)
            .await;

        let ai = OpenAi::new(&config(&server)).unwrap();
        let err = ai
            .chat_completion(&[ChatMessage::user("hi")], &ChatOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ProviderCallFailed);
        assert_eq!(err.domain(), ErrorDomain::Ai);
        assert_eq!(err.message(), "OpenAI chat completion failed");
    }

    #[tokio::test]
    async fn test_generate_image() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/images/generations"))
            .and(body_partial_json(json!({
                "model": "dall-e-3",
                "size": "1024x1024",
                "quality": "standard",
                "n": 1
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "created": 1,
                "data": [{"url": "https://img/1.png", "revised_prompt": "a red fox"}]
            })))
            .mount(&server)
            .await;

        let ai = OpenAi::new(&config(&server)).unwrap();
        let response = ai.generate_image("fox", &ImageOptions::default()).await.unwrap();
        assert_eq!(response.model, "dall-e-3");
        assert_eq!(response.images[0].url, "https://img/1.png");
        assert_eq!(response.images[0].revised_prompt.as_deref(), Some("a red fox"));
    }

    #[tokio::test]
    async fn test_generate_embeddings() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/embeddings"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "model": "text-embedding-ada-002",
                "data": [{"embedding": [0.5, -0.25]}],
                "usage": {"prompt_tokens": 2, "total_tokens": 2}
            })))
            .mount(&server)
            .await;

        let ai = OpenAi::new(&config(&server)).unwrap();
        let response = ai
            .generate_embeddings("hello", &EmbeddingOptions::default())
            .await
            .unwrap();
        assert_eq!(response.embeddings, vec![0.5, -0.25]);
        assert_eq!(response.usage.completion_tokens, 0);
        assert_eq!(response.usage.total_tokens, 2);
    }

    #[tokio::test]
    async fn test_generate_text() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/completions"))
            .and(body_partial_json(json!({"model": "gpt-3.5-turbo-instruct"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{"text": "once upon a time"}]
            })))
            .mount(&server)
            .await;

        let ai = OpenAi::new(&config(&server)).unwrap();
        let response = ai.generate_text("tell me", &TextOptions::default()).await.unwrap();
        assert_eq!(response.text, "once upon a time");
        assert_eq!(response.model, "gpt-3.5-turbo-instruct");
    }
}
