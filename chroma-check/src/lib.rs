//! Connectivity smoke test for a Chroma vector database
pub mod check;
pub mod client;
pub mod embed;

use thiserror::Error;

pub use check::run_check;
pub use client::ChromaClient;
pub use embed::{EmbeddingFunction, OllamaEmbeddings};

#[derive(Debug, Error)]
pub enum ChromaError {
    #[error("Request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("Unexpected status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("Embedding error: {0}")]
    Embedding(String),
    #[error("Could not decode response: {0}")]
    Decode(#[from] serde_json::Error),
}
