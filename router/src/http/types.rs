use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

#[derive(Debug, Deserialize, ToSchema)]
pub(crate) struct RerankRequest {
    #[schema(example = "What is the capital of China?")]
    pub query: String,
    #[schema(example = json!(["The capital of China is Beijing.", "Gravity is a force."]))]
    pub documents: Vec<String>,
    /// Defaults to the server instruction
    #[serde(default)]
    #[schema(
        nullable = true,
        default = "null",
        example = "Given a web search query, retrieve relevant passages that answer the query"
    )]
    pub instruction: Option<String>,
    /// Defaults to `--auto-truncate`
    #[serde(default)]
    #[schema(default = "false", example = "false", nullable = true)]
    pub truncate: Option<bool>,
}

impl RerankRequest {
    /// Characters the model has to process, the query being repeated for every document
    pub(crate) fn compute_chars(&self) -> usize {
        let query_chars = self.query.chars().count();
        self.documents
            .iter()
            .map(|document| query_chars + document.chars().count())
            .sum()
    }
}

/// One relevance score in `[0, 1]` per document, in request order
#[derive(Debug, Serialize, ToSchema)]
pub(crate) struct RerankResponse {
    #[schema(example = json!([0.99, 0.01]))]
    pub scores: Vec<f32>,
}
