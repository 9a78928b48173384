//! Local Ollama server as an embedding backend, behind the [Embedder] seam.

use async_trait::async_trait;
use ollama_rs::generation::embeddings::request::{EmbeddingsInput, GenerateEmbeddingsRequest};
use ollama_rs::Ollama;
use thiserror::Error;

use crate::provider::{EmbedError, Embedder};

pub const DEFAULT_EMBED_MODEL: &str = "nomic-embed-text";
pub const DEFAULT_BASE_URL: &str = "http://localhost:11434";

#[derive(Debug, Clone)]
pub struct OllamaClient {
    inner: Ollama,
    embed_model: String,
}

impl OllamaClient {
    /// e.g. `http://localhost:11434`. Uses [DEFAULT_EMBED_MODEL] until
    /// [OllamaClient::with_embed_model] is called.
    pub fn from_url(url: &str) -> Result<Self, OllamaError> {
        Ok(Self {
            inner: Ollama::try_new(url)?,
            embed_model: DEFAULT_EMBED_MODEL.to_string(),
        })
    }

    pub fn with_embed_model(mut self, model: impl Into<String>) -> Self {
        self.embed_model = model.into();
        self
    }
}

#[async_trait]
impl Embedder for OllamaClient {
    /// One request for the whole batch.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let req = GenerateEmbeddingsRequest::new(self.embed_model.clone(), EmbeddingsInput::Multiple(texts.to_vec()));
        let embeddings = self
            .inner
            .generate_embeddings(req)
            .await
            .map_err(|e| EmbedError::Request(OllamaError::from(e).to_string()))?
            .embeddings;
        if embeddings.len() != texts.len() {
            return Err(EmbedError::Malformed(format!(
                "Ollama returned {} embeddings for {} inputs",
                embeddings.len(),
                texts.len()
            )));
        }
        Ok(embeddings)
    }

    fn model(&self) -> &str {
        &self.embed_model
    }
}

#[derive(Debug, Error)]
pub enum OllamaError {
    #[error("invalid Ollama URL: {0}")]
    ParseUrl(#[from] url::ParseError),
    #[error("Ollama request failed: {0}")]
    Request(#[from] ollama_rs::error::OllamaError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_invalid_url() {
        assert!(matches!(
            OllamaClient::from_url("not a url"),
            Err(OllamaError::ParseUrl(_))
        ));
    }

    #[tokio::test]
    async fn empty_batch_skips_the_network() {
        let client = OllamaClient::from_url(DEFAULT_BASE_URL)
            .unwrap()
            .with_embed_model("all-minilm");
        assert_eq!(client.model(), "all-minilm");
        assert!(client.embed(&[]).await.unwrap().is_empty());
    }
}
