//! Google Generative Language adapter (Gemini, Imagen, text embeddings).
//!
//! Assistant turns are sent with the `model` role and system messages as
//! the system instruction. Finish reasons are lower-cased (`STOP` becomes
//! `stop`). Imagen returns inline image data only, so `url` is empty.

use std::fmt;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Map, Value};

use super::{
    max_tokens, model_or, require_messages, temperature, AiConfig, AiProvider, ChatMessage,
    ChatOptions, ChatResponse, ChatRole, EmbeddingOptions, EmbeddingResponse, ImageData,
    ImageOptions, ImageResponse, TextOptions, TextResponse, TokenUsage, DEFAULT_FINISH_REASON,
};
use crate::config::{required, ProviderConfig};
use crate::error::{Capability, ErrorDomain, ErrorKind, ServiceResult};
use crate::http::{base_url, HttpTransport};
use crate::provider::Provider;

const PROVIDER: &str = "google";
const API_URL: &str = "https://generativelanguage.googleapis.com/v1beta";
pub const DEFAULT_MODEL: &str = "gemini-pro";
pub const DEFAULT_IMAGE_MODEL: &str = "imagen-2";
pub const DEFAULT_EMBEDDING_MODEL: &str = "text-embedding-004";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    #[serde(default)]
    usage_metadata: Option<UsageMetadata>,
    #[serde(default)]
    model_version: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    #[serde(default)]
    content: Option<Content>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Content {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Deserialize)]
struct Part {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UsageMetadata {
    #[serde(default)]
    prompt_token_count: u32,
    #[serde(default)]
    candidates_token_count: u32,
    #[serde(default)]
    total_token_count: u32,
}

#[derive(Debug, Deserialize)]
struct EmbedResponse {
    #[serde(default)]
    embedding: Option<Embedding>,
}

#[derive(Debug, Deserialize)]
struct Embedding {
    #[serde(default)]
    values: Vec<f32>,
}

#[derive(Debug, Deserialize)]
struct PredictResponse {
    #[serde(default)]
    predictions: Vec<Prediction>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Prediction {
    #[serde(default)]
    bytes_base64_encoded: Option<String>,
}

impl GenerateResponse {
    fn text(&self) -> String {
        self.candidates
            .first()
            .and_then(|c| c.content.as_ref())
            .map(|content| {
                content
                    .parts
                    .iter()
                    .filter_map(|p| p.text.as_deref())
                    .collect()
            })
            .unwrap_or_default()
    }

    fn finish_reason(&self) -> String {
        self.candidates
            .first()
            .and_then(|c| c.finish_reason.as_deref())
            .map(str::to_lowercase)
            .unwrap_or_else(|| DEFAULT_FINISH_REASON.to_string())
    }

    fn usage(&self) -> TokenUsage {
        self.usage_metadata
            .as_ref()
            .map(|u| TokenUsage {
                prompt_tokens: u.prompt_token_count,
                completion_tokens: u.candidates_token_count,
                total_tokens: u.total_token_count,
            })
            .unwrap_or_default()
    }
}

/// Google AI adapter.
pub struct GoogleAi {
    http: HttpTransport,
    base: String,
    api_key: String,
}

impl fmt::Debug for GoogleAi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GoogleAi")
            .field("base", &self.base)
            .finish_non_exhaustive()
    }
}

impl GoogleAi {
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

    async fn call<T: serde::de::DeserializeOwned>(
        &self,
        model: &str,
        method: &str,
        body: &Value,
        context: &str,
    ) -> ServiceResult<T> {
        let request = self
            .http
            .client()
            .post(format!("{}/models/{}:{}", self.base, model, method))
            .query(&[("key", &self.api_key)])
            .json(body);
        self.http
            .send_json(request, ErrorKind::ProviderCallFailed, context)
            .await
    }
}

fn generation_body(
    messages: &[ChatMessage],
    temperature_value: Option<f64>,
    max_output: Option<u32>,
    top_p: Option<f64>,
    stop: &[String],
) -> Value {
    let contents: Vec<Value> = messages
        .iter()
        .filter(|m| m.role != ChatRole::System)
        .map(|m| {
            let role = if m.role == ChatRole::Assistant { "model" } else { "user" };
            json!({"role": role, "parts": [{"text": m.content}]})
        })
        .collect();
    let system: Vec<Value> = messages
        .iter()
        .filter(|m| m.role == ChatRole::System)
        .map(|m| json!({"text": m.content}))
        .collect();

    let mut config = Map::new();
    config.insert("temperature".to_string(), json!(temperature(temperature_value)));
    config.insert("maxOutputTokens".to_string(), json!(max_tokens(max_output)));
    if let Some(top_p) = top_p {
        config.insert("topP".to_string(), json!(top_p));
    }
    if !stop.is_empty() {
        config.insert("stopSequences".to_string(), json!(stop));
    }

    let mut body = json!({
        "contents": contents,
        "generationConfig": Value::Object(config),
    });
    if !system.is_empty() {
        body["systemInstruction"] = json!({ "parts": system });
    }
    body
}

impl Provider for GoogleAi {
    fn name(&self) -> &str {
        PROVIDER
    }

    fn capability(&self) -> Capability {
        Capability::Ai
    }
}

#[async_trait]
impl AiProvider for GoogleAi {
    async fn chat_completion(
        &self,
        messages: &[ChatMessage],
        options: &ChatOptions,
    ) -> ServiceResult<ChatResponse> {
        require_messages(messages)?;
        let model = model_or(&options.model, DEFAULT_MODEL);
        let body = generation_body(
            messages,
            options.temperature,
            options.max_tokens,
            options.top_p,
            &options.stop,
        );
        let response: GenerateResponse = self
            .call(model, "generateContent", &body, "Google AI chat completion failed")
            .await?;
        Ok(ChatResponse {
            content: response.text(),
            usage: response.usage(),
            finish_reason: response.finish_reason(),
            model: response.model_version.unwrap_or_else(|| model.to_string()),
        })
    }

    async fn generate_text(
        &self,
        prompt: &str,
        options: &TextOptions,
    ) -> ServiceResult<TextResponse> {
        let model = model_or(&options.model, DEFAULT_MODEL);
        let body = generation_body(
            &[ChatMessage::user(prompt)],
            options.temperature,
            options.max_tokens,
            options.top_p,
            &[],
        );
        let response: GenerateResponse = self
            .call(model, "generateContent", &body, "Google AI text generation failed")
            .await?;
        Ok(TextResponse {
            text: response.text(),
            usage: response.usage(),
            model: response.model_version.unwrap_or_else(|| model.to_string()),
        })
    }

    async fn generate_image(
        &self,
        prompt: &str,
        options: &ImageOptions,
    ) -> ServiceResult<ImageResponse> {
        let model = model_or(&options.model, DEFAULT_IMAGE_MODEL);
        let body = json!({
            "instances": [{"prompt": prompt}],
            "parameters": {"sampleCount": options.n.filter(|n| *n > 0).unwrap_or(1)},
        });
        let response: PredictResponse = self
            .call(model, "predict", &body, "Google AI image generation failed")
            .await?;
        Ok(ImageResponse {
            images: response
                .predictions
                .into_iter()
                .map(|p| ImageData {
                    url: String::new(),
                    base64: p.bytes_base64_encoded,
                    revised_prompt: None,
                })
                .collect(),
            model: model.to_string(),
        })
    }

    async fn generate_embeddings(
        &self,
        input: &str,
        options: &EmbeddingOptions,
    ) -> ServiceResult<EmbeddingResponse> {
        let model = model_or(&options.model, DEFAULT_EMBEDDING_MODEL);
        let body = json!({ "content": {"parts": [{"text": input}]} });
        let response: EmbedResponse = self
            .call(model, "embedContent", &body, "Google AI embedding generation failed")
            .await?;
        Ok(EmbeddingResponse {
            embeddings: response.embedding.map(|e| e.values).unwrap_or_default(),
            model: model.to_string(),
            usage: TokenUsage::default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config(server: &MockServer) -> AiConfig {
        AiConfig {
            api_key: Some("g-key".to_string()),
            base_url: Some(server.uri()),
            ..Default::default()
        }
    }

    #[test]
    fn test_generation_body_roles() {
        let body = generation_body(
            &[
                ChatMessage::system("be kind"),
                ChatMessage::user("hi"),
                ChatMessage::assistant("hello"),
            ],
            None,
            None,
            None,
            &[],
        );
        assert_eq!(body["contents"][1]["role"], "model");
        assert_eq!(body["systemInstruction"]["parts"][0]["text"], "be kind");
        assert_eq!(body["generationConfig"]["maxOutputTokens"], 1000);
    }

    #[tokio::test]
    async fn test_chat_completion() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/models/gemini-pro:generateContent"))
            .and(query_param("key", "g-key"))
            .and(body_partial_json(json!({
                "contents": [{"role": "user", "parts": [{"text": "hi"}]}]
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "candidates": [{
                    "content": {"role": "model", "parts": [{"text": "Hel"}, {"text": "lo"}]},
                    "finishReason": "STOP"
                }],
                "usageMetadata": {"promptTokenCount": 1, "candidatesTokenCount": 2, "totalTokenCount": 3}
            })))
            .mount(&server)
            .await;

        let ai = GoogleAi::new(&config(&server)).unwrap();
        let response = ai
            .chat_completion(&[ChatMessage::user("hi")], &ChatOptions::default())
            .await
            .unwrap();
        assert_eq!(response.content, "Hello");
        assert_eq!(response.model, "gemini-pro");
        assert_eq!(response.finish_reason, "stop");
        assert_eq!(response.usage.total_tokens, 3);
    }

    #[tokio::test]
    async fn test_generate_embeddings() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/models/text-embedding-004:embedContent"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "embedding": {"values": [0.25, 0.5]}
            })))
            .mount(&server)
            .await;

        let ai = GoogleAi::new(&config(&server)).unwrap();
        let response = ai
            .generate_embeddings("hi", &EmbeddingOptions::default())
            .await
            .unwrap();
        assert_eq!(response.embeddings, vec![0.25, 0.5]);
        assert_eq!(response.model, "text-embedding-004");
    }

    #[tokio::test]
    async fn test_generate_image() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/models/imagen-2:predict"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "predictions": [{"bytesBase64Encoded": "aGk=", "mimeType": "image/png"}]
            })))
            .mount(&server)
            .await;

        let ai = GoogleAi::new(&config(&server)).unwrap();
        let response = ai.generate_image("fox", &ImageOptions::default()).await.unwrap();
        assert_eq!(response.images.len(), 1);
        assert_eq!(response.images[0].url, "");
        assert_eq!(response.images[0].base64.as_deref(), Some("aGk="));
    }

    #[tokio::test]
    async fn test_failure_wrapped() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let ai = GoogleAi::new(&config(&server)).unwrap();
        let err = ai
            .generate_text("hi", &TextOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ProviderCallFailed);
        assert_eq!(err.message(), "Google AI text generation failed");
    }
}
