//! Client for OpenAI-compatible endpoints (Together, OpenAI, Ollama's `/v1`).
//! Serves both `/embeddings` and `/chat/completions`.

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Client, Response};
use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::provider::{EmbedError, Embedder, GenerateError, Generator};

#[derive(Debug, Clone)]
pub struct OpenAiClient {
    client: Client,
    embeddings_endpoint: String,
    chat_endpoint: String,
    embed_model: String,
    chat_model: String,
    temperature: f32,
    max_tokens: usize,
}

impl OpenAiClient {
    /// Builds a client. `api_key` may be absent for local endpoints that don't check it.
    pub fn new(
        api_key: Option<&str>,
        embeddings_base_url: &str,
        embed_model: impl Into<String>,
        chat_base_url: &str,
        chat_model: impl Into<String>,
    ) -> Result<Self, OpenAiError> {
        let mut headers = HeaderMap::new();
        if let Some(key) = api_key.map(str::trim).filter(|k| !k.is_empty()) {
            let auth = format!("Bearer {}", key);
            headers.insert(
                AUTHORIZATION,
                HeaderValue::from_str(&auth).map_err(|_| OpenAiError::InvalidApiKey)?,
            );
        }
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let client = Client::builder()
            .default_headers(headers)
            .build()
            .map_err(OpenAiError::Build)?;
        Ok(Self {
            client,
            embeddings_endpoint: format!("{}/embeddings", embeddings_base_url.trim_end_matches('/')),
            chat_endpoint: format!("{}/chat/completions", chat_base_url.trim_end_matches('/')),
            embed_model: embed_model.into(),
            chat_model: chat_model.into(),
            temperature: 0.7,
            max_tokens: 1024,
        })
    }

    /// Builds a client from the embedding and generation sections of `config`,
    /// reading the API key from the environment.
    pub fn from_config(config: &Config) -> Result<Self, OpenAiError> {
        Ok(Self::new(
            config.api_key().as_deref(),
            &config.embedding.base_url,
            config.embedding.model.clone(),
            &config.generation.base_url,
            config.generation.model.clone(),
        )?
        .with_sampling(config.generation.temperature, config.generation.max_tokens))
    }

    pub fn with_sampling(mut self, temperature: f32, max_tokens: usize) -> Self {
        self.temperature = temperature;
        self.max_tokens = max_tokens;
        self
    }

    pub fn chat_model(&self) -> &str {
        &self.chat_model
    }
}

#[async_trait]
impl Embedder for OpenAiClient {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let request = EmbeddingRequest {
            model: &self.embed_model,
            input: texts,
        };
        let resp = self
            .client
            .post(&self.embeddings_endpoint)
            .json(&request)
            .send()
            .await
            .map_err(|e| EmbedError::Request(e.to_string()))?;
        let resp = check_status(resp)
            .await
            .map_err(|(status, body)| EmbedError::Status { status, body })?;
        let mut parsed: EmbeddingResponse = resp
            .json()
            .await
            .map_err(|e| EmbedError::Malformed(e.to_string()))?;
        parsed.data.sort_by_key(|entry| entry.index);
        if parsed.data.len() != texts.len() {
            return Err(EmbedError::Malformed(format!(
                "returned {} embeddings for {} inputs",
                parsed.data.len(),
                texts.len()
            )));
        }
        Ok(parsed.data.into_iter().map(|entry| entry.embedding).collect())
    }

    fn model(&self) -> &str {
        &self.embed_model
    }
}

#[async_trait]
impl Generator for OpenAiClient {
    async fn generate(&self, prompt: &str) -> Result<String, GenerateError> {
        let body = ChatRequest {
            model: &self.chat_model,
            temperature: self.temperature,
            max_tokens: self.max_tokens,
            messages: vec![ChatMessage {
                role: "user",
                content: prompt,
            }],
        };
        let resp = self
            .client
            .post(&self.chat_endpoint)
            .json(&body)
            .send()
            .await
            .map_err(|e| GenerateError::Request(e.to_string()))?;
        let resp = check_status(resp)
            .await
            .map_err(|(status, body)| GenerateError::Status { status, body })?;
        let parsed: ChatResponse = resp
            .json()
            .await
            .map_err(|e| GenerateError::Malformed(e.to_string()))?;
        parsed
            .choices
            .into_iter()
            .next()
            .map(|choice| choice.message.content)
            .ok_or_else(|| GenerateError::Malformed("response has no choices".to_string()))
    }
}

/// Passes successful responses through; otherwise returns status and body text.
async fn check_status(resp: Response) -> Result<Response, (u16, String)> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp
        .text()
        .await
        .unwrap_or_else(|_| "<body unavailable>".to_string());
    Err((status.as_u16(), body))
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
    index: usize,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    temperature: f32,
    max_tokens: usize,
    messages: Vec<ChatMessage<'a>>,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: AssistantMessage,
}

#[derive(Debug, Deserialize)]
struct AssistantMessage {
    #[serde(default)]
    content: String,
}

#[derive(Debug, thiserror::Error)]
pub enum OpenAiError {
    #[error("invalid API key")]
    InvalidApiKey,
    #[error("failed to build HTTP client: {0}")]
    Build(reqwest::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoints_ignore_trailing_slash() {
        let c = OpenAiClient::new(None, "http://localhost:1/v1/", "e", "http://localhost:2/v1", "m").unwrap();
        assert_eq!(c.embeddings_endpoint, "http://localhost:1/v1/embeddings");
        assert_eq!(c.chat_endpoint, "http://localhost:2/v1/chat/completions");
        assert_eq!(c.chat_model(), "m");
        assert_eq!(Embedder::model(&c), "e");
    }

    #[test]
    fn rejects_key_with_control_characters() {
        let err = OpenAiClient::new(Some("bad\nkey"), "http://x", "e", "http://x", "m").unwrap_err();
        assert!(matches!(err, OpenAiError::InvalidApiKey));
    }

    #[test]
    fn parses_chat_and_embedding_payloads() {
        let chat: ChatResponse =
            serde_json::from_str(r#"{"choices":[{"message":{"role":"assistant","content":"hi"}}]}"#).unwrap();
        assert_eq!(chat.choices[0].message.content, "hi");
        let emb: EmbeddingResponse = serde_json::from_str(
            r#"{"data":[{"embedding":[0.5],"index":1},{"embedding":[0.25],"index":0}]}"#,
        )
        .unwrap();
        assert_eq!(emb.data.len(), 2);
    }

    #[tokio::test]
    async fn empty_embedding_batch_skips_the_network() {
        let c = OpenAiClient::new(None, "http://localhost:1", "e", "http://localhost:1", "m").unwrap();
        assert!(c.embed(&[]).await.unwrap().is_empty());
    }
}
