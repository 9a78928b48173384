//! Seams to the hosted services: embedding and text generation.
//!
//! Both are external collaborators. Implementations live in [crate::ollama] and
//! [crate::openai]; [crate::retry::Resilient] wraps either with backoff and timeouts.

use std::sync::Arc;

use async_trait::async_trait;

use crate::config::{Config, EmbeddingProvider};
use crate::ollama::OllamaClient;
use crate::openai::OpenAiClient;
use crate::retry::{Resilient, RetryPolicy};

/// Turns texts into fixed-dimension vectors, one per input, order preserved.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError>;

    /// Model identifier, recorded in the index manifest.
    fn model(&self) -> &str;

    /// Embeds a single text.
    async fn embed_one(&self, text: &str) -> Result<Vec<f32>, EmbedError> {
        let mut out = self.embed(&[text.to_string()]).await?;
        match out.len() {
            1 => Ok(out.remove(0)),
            n => Err(EmbedError::Malformed(format!("expected 1 embedding, got {}", n))),
        }
    }
}

/// Produces a completion for a fully rendered prompt.
#[async_trait]
pub trait Generator: Send + Sync {
    async fn generate(&self, prompt: &str) -> Result<String, GenerateError>;
}

#[async_trait]
impl<T: Embedder + ?Sized> Embedder for Arc<T> {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError> {
        (**self).embed(texts).await
    }

    fn model(&self) -> &str {
        (**self).model()
    }
}

#[async_trait]
impl<T: Generator + ?Sized> Generator for Arc<T> {
    async fn generate(&self, prompt: &str) -> Result<String, GenerateError> {
        (**self).generate(prompt).await
    }
}

/// Builds the configured embedder, wrapped with the configured retry policy.
pub fn embedder_from_config(config: &Config) -> Result<Arc<dyn Embedder>, ProviderError> {
    let policy = RetryPolicy::from(&config.retry);
    let embedder: Arc<dyn Embedder> = match config.embedding.provider {
        EmbeddingProvider::Ollama => Arc::new(Resilient::new(
            OllamaClient::from_url(&config.embedding.base_url)
                .map_err(|e| ProviderError::Setup(e.to_string()))?
                .with_embed_model(config.embedding.model.clone()),
            policy,
        )),
        EmbeddingProvider::OpenAi => Arc::new(Resilient::new(
            OpenAiClient::from_config(config).map_err(|e| ProviderError::Setup(e.to_string()))?,
            policy,
        )),
    };
    Ok(embedder)
}

/// Builds the OpenAI-compatible chat client, wrapped with the configured retry policy.
pub fn generator_from_config(config: &Config) -> Result<Arc<dyn Generator>, ProviderError> {
    let client = OpenAiClient::from_config(config).map_err(|e| ProviderError::Setup(e.to_string()))?;
    Ok(Arc::new(Resilient::new(client, RetryPolicy::from(&config.retry))))
}

/// Failure calling the embedding service.
#[derive(Debug, thiserror::Error)]
pub enum EmbedError {
    #[error("embedding request failed: {0}")]
    Request(String),
    #[error("embedding service returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("embedding request timed out after {0:?}")]
    Timeout(std::time::Duration),
    #[error("malformed embedding response: {0}")]
    Malformed(String),
}

impl EmbedError {
    /// Transport errors, timeouts, 429 and 5xx are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            EmbedError::Request(_) | EmbedError::Timeout(_) => true,
            EmbedError::Status { status, .. } => is_retryable_status(*status),
            EmbedError::Malformed(_) => false,
        }
    }
}

/// Failure calling the generation service.
#[derive(Debug, thiserror::Error)]
pub enum GenerateError {
    #[error("generation request failed: {0}")]
    Request(String),
    #[error("generation service returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("generation request timed out after {0:?}")]
    Timeout(std::time::Duration),
    #[error("malformed generation response: {0}")]
    Malformed(String),
}

impl GenerateError {
    /// Transport errors, timeouts, 429 and 5xx are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            GenerateError::Request(_) | GenerateError::Timeout(_) => true,
            GenerateError::Status { status, .. } => is_retryable_status(*status),
            GenerateError::Malformed(_) => false,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("failed to set up service client: {0}")]
    Setup(String),
}

fn is_retryable_status(status: u16) -> bool {
    status == 429 || (500..600).contains(&status)
}
