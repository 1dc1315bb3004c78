use crate::ChromaError;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

pub const DEFAULT_OLLAMA_URL: &str = "http://localhost:11434";
pub const DEFAULT_EMBEDDING_MODEL: &str = "mxbai-embed-large";

/// Turns texts into vectors before they are sent to Chroma
#[async_trait]
pub trait EmbeddingFunction: Send + Sync {
    /// One embedding per text, in input order
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ChromaError>;
}

/// Embeddings served by an Ollama instance
#[derive(Debug, Clone)]
pub struct OllamaEmbeddings {
    client: Client,
    url: String,
    model: String,
}

#[derive(Debug, Serialize)]
struct EmbedRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Debug, Deserialize)]
struct EmbedResponse {
    embeddings: Vec<Vec<f32>>,
}

impl OllamaEmbeddings {
    pub fn new(url: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            url: url.into().trim_end_matches('/').to_string(),
            model: model.into(),
        }
    }
}

impl Default for OllamaEmbeddings {
    fn default() -> Self {
        Self::new(DEFAULT_OLLAMA_URL, DEFAULT_EMBEDDING_MODEL)
    }
}

#[async_trait]
impl EmbeddingFunction for OllamaEmbeddings {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ChromaError> {
        tracing::debug!(
            "Ollama embedding request: {} texts with model {}",
            texts.len(),
            self.model
        );

        let request = EmbedRequest {
            model: &self.model,
            input: texts,
        };
        let response = self
            .client
            .post(format!("{}/api/embed", self.url))
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ChromaError::Embedding(format!(
                "Ollama API error ({status}): {body}"
            )));
        }

        let response: EmbedResponse = serde_json::from_str(&response.text().await?)?;
        if response.embeddings.len() != texts.len() {
            return Err(ChromaError::Embedding(format!(
                "expected {} embeddings, got {}",
                texts.len(),
                response.embeddings.len()
            )));
        }
        Ok(response.embeddings)
    }
}
