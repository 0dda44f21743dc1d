//! Embedding client adapter for the external embedding backend.
//!
//! The backend is an opaque collaborator exposing `embed(texts) -> vectors`;
//! this module owns retries and backoff so callers only ever see a final
//! success or `EmbeddingError::Unavailable`.

use crate::config::EmbeddingConfig;
use crate::error::{EmbeddingError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Interface to the external embedding collaborator.
///
/// Implementations return vectors in input order and may return fewer
/// vectors than inputs; callers decide whether truncation is fatal.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Identifier of the model producing the vectors, recorded on chunks.
    fn model_id(&self) -> &str;

    /// Embed a batch of texts into fixed-dimension vectors.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

/// Probe the backend once to learn the model's dimensionality.
pub async fn probe_dimensions(embedder: &dyn Embedder) -> Result<usize> {
    let vectors = embedder.embed(&["dimension probe".to_string()]).await?;
    match vectors.first() {
        Some(vector) if !vector.is_empty() => Ok(vector.len()),
        _ => Err(EmbeddingError::Unavailable {
            attempts: 1,
            message: "backend returned no embedding for probe text".to_string(),
        }
        .into()),
    }
}

/// HTTP client for an Ollama-compatible `/api/embed` endpoint.
pub struct OllamaEmbedder {
    client: reqwest::Client,
    base_url: String,
    model: String,
    max_retries: u32,
}

#[derive(Debug, Serialize)]
struct EmbedRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Debug, Deserialize)]
struct EmbedResponse {
    #[serde(default)]
    embeddings: Vec<Vec<f32>>,
}

/// Whether a failed request is worth retrying.
enum RequestFailure {
    Transient(String),
    Fatal(String),
}

impl OllamaEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| anyhow::anyhow!("failed to build embedding http client: {e}"))?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            max_retries: config.max_retries.max(1),
        })
    }

    async fn request_once(
        &self,
        texts: &[String],
    ) -> std::result::Result<Vec<Vec<f32>>, RequestFailure> {
        let url = format!("{}/api/embed", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(&EmbedRequest {
                model: &self.model,
                input: texts,
            })
            .send()
            .await
            .map_err(|e| RequestFailure::Transient(e.to_string()))?;

        let status = response.status();
        if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(RequestFailure::Transient(format!("http {status}")));
        }
        if !status.is_success() {
            return Err(RequestFailure::Fatal(format!("http {status}")));
        }

        let body: EmbedResponse = response
            .json()
            .await
            .map_err(|e| RequestFailure::Fatal(format!("invalid embed response: {e}")))?;
        Ok(body.embeddings)
    }
}

#[async_trait]
impl Embedder for OllamaEmbedder {
    fn model_id(&self) -> &str {
        &self.model
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let mut delay = Duration::from_millis(250);
        let mut last_error = String::new();
        for attempt in 1..=self.max_retries {
            match self.request_once(texts).await {
                Ok(mut vectors) => {
                    // Only trust pairwise alignment up to the shorter length;
                    // the caller detects any resulting shortfall.
                    vectors.truncate(texts.len());
                    return Ok(vectors);
                }
                Err(RequestFailure::Transient(message)) => {
                    tracing::warn!(attempt, error = %message, "embedding request failed, retrying");
                    last_error = message;
                    if attempt < self.max_retries {
                        tokio::time::sleep(delay).await;
                        delay *= 2;
                    }
                }
                Err(RequestFailure::Fatal(message)) => {
                    return Err(EmbeddingError::Unavailable {
                        attempts: attempt,
                        message,
                    }
                    .into());
                }
            }
        }

        Err(EmbeddingError::Unavailable {
            attempts: self.max_retries,
            message: last_error,
        }
        .into())
    }
}
