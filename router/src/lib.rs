/// Qwen3 reranker webserver
mod logging;
mod prometheus;
mod shutdown;

pub mod http;

use anyhow::{anyhow, Context, Result};
use hf_hub::api::tokio::ApiBuilder;
use hf_hub::{Repo, RepoType};
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use text_rerank_backend::{Backend, DType, ScoringTokens};
use text_rerank_core::download::download_artifacts;
use text_rerank_core::infer::Infer;
use text_rerank_core::templates::Qwen3RerankerTemplate;
use text_rerank_core::tokenization::Tokenization;
use text_rerank_core::RerankError;
use tokenizers::Tokenizer;
use tracing::Span;
use utoipa::ToSchema;

pub use logging::init_logging;

/// Create entrypoint
#[allow(clippy::too_many_arguments)]
pub async fn run(
    model_id: String,
    revision: Option<String>,
    tokenization_workers: Option<usize>,
    dtype: Option<DType>,
    max_concurrent_requests: usize,
    max_client_batch_size: usize,
    auto_truncate: bool,
    rerank_instruction: Option<String>,
    hf_token: Option<String>,
    hostname: Option<String>,
    port: u16,
    huggingface_hub_cache: Option<String>,
    payload_limit: usize,
    api_key: Option<String>,
    cors_allow_origin: Option<Vec<String>>,
) -> Result<()> {
    let model_id_path = Path::new(&model_id);
    let (model_root, api_repo) = if model_id_path.exists() && model_id_path.is_dir() {
        // Using a local model
        (model_id_path.to_path_buf(), None)
    } else {
        let mut builder = ApiBuilder::new()
            .with_progress(false)
            .with_token(hf_token);

        if let Some(cache_dir) = huggingface_hub_cache {
            builder = builder.with_cache_dir(cache_dir.into());
        }

        let api = builder.build().context("could not build the Hugging Face Hub client")?;
        let api_repo = api.repo(Repo::with_revision(
            model_id.clone(),
            RepoType::Model,
            revision.clone().unwrap_or("main".to_string()),
        ));

        // Download model from the Hub
        (
            download_artifacts(&api_repo)
                .await
                .context("Could not download model artifacts")?,
            Some(api_repo),
        )
    };

    // Load config
    let config_path = model_root.join("config.json");
    let config = fs::read_to_string(config_path).context("`config.json` not found")?;
    let config: ModelConfig =
        serde_json::from_str(&config).context("Failed to parse `config.json`")?;

    // Load tokenizer
    let tokenizer_path = model_root.join("tokenizer.json");
    let tokenizer = Tokenizer::from_file(tokenizer_path).map_err(|err| {
        anyhow!("tokenizer.json not found. text-rerank only supports fast tokenizers: {err}")
    })?;

    let scoring_tokens = scoring_tokens(&tokenizer)?;
    tracing::info!("Scoring tokens: {scoring_tokens:?}");

    let max_input_length = config.max_position_embeddings;

    // Tokenization logic
    let tokenization_workers = tokenization_workers.unwrap_or_else(num_cpus::get);
    let template = Qwen3RerankerTemplate::new(rerank_instruction);
    let default_instruction = template.default_instruction().to_string();
    let tokenization = Tokenization::new(
        tokenization_workers,
        tokenizer,
        max_input_length,
        Arc::new(template),
    )
    .context("Could not start tokenization")?;

    // Get dtype
    let dtype = dtype.unwrap_or_default();
    let model_dtype = dtype.to_string();

    // Create backend
    tracing::info!("Starting model backend");
    let backend = Backend::new(model_root, api_repo, dtype, scoring_tokens)
        .await
        .context("Could not create backend")?;
    backend
        .health()
        .await
        .context("Model backend is not healthy")?;

    let infer = Infer::new(tokenization, max_concurrent_requests, backend);

    let info = Info {
        model_id,
        model_sha: revision,
        model_dtype,
        max_concurrent_requests,
        max_input_length,
        max_client_batch_size,
        auto_truncate,
        tokenization_workers,
        default_instruction,
        version: env!("CARGO_PKG_VERSION"),
        sha: option_env!("VERGEN_GIT_SHA"),
        docker_label: option_env!("DOCKER_LABEL"),
    };

    let addr = match hostname.unwrap_or("0.0.0.0".to_string()).parse() {
        Ok(ip) => SocketAddr::new(ip, port),
        Err(_) => {
            tracing::warn!("Invalid hostname, defaulting to 0.0.0.0");
            SocketAddr::new(IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0)), port)
        }
    };

    let prom_builder = prometheus::prometheus_builer(max_input_length)?;

    http::server::run(
        infer,
        info,
        addr,
        prom_builder,
        payload_limit,
        api_key,
        cors_allow_origin,
    )
    .await
}

fn scoring_tokens(tokenizer: &Tokenizer) -> Result<ScoringTokens> {
    let token_id = |token: &str| {
        tokenizer
            .token_to_id(token)
            .ok_or_else(|| anyhow!("`{token}` is not in the tokenizer vocabulary"))
    };
    Ok(ScoringTokens {
        no: token_id("no")?,
        yes: token_id("yes")?,
    })
}

#[derive(Debug, Deserialize)]
pub struct ModelConfig {
    pub max_position_embeddings: usize,
}

#[derive(Clone, Debug, Serialize, ToSchema)]
pub struct Info {
    /// Model info
    #[schema(example = "Qwen/Qwen3-Reranker-0.6B")]
    pub model_id: String,
    #[schema(nullable = true, example = "main")]
    pub model_sha: Option<String>,
    #[schema(example = "float16")]
    pub model_dtype: String,
    /// Router Parameters
    #[schema(example = "512")]
    pub max_concurrent_requests: usize,
    #[schema(example = "40960")]
    pub max_input_length: usize,
    #[schema(example = "128")]
    pub max_client_batch_size: usize,
    #[schema(example = "false")]
    pub auto_truncate: bool,
    #[schema(example = "4")]
    pub tokenization_workers: usize,
    #[schema(
        example = "Given a web search query, retrieve relevant passages that answer the query"
    )]
    pub default_instruction: String,
    /// Router Info
    #[schema(example = "0.1.0")]
    pub version: &'static str,
    #[schema(nullable = true, example = "null")]
    pub sha: Option<&'static str>,
    #[schema(nullable = true, example = "null")]
    pub docker_label: Option<&'static str>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum ErrorType {
    Unhealthy,
    Backend,
    Overloaded,
    Validation,
    Tokenizer,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ErrorResponse {
    pub error: String,
    pub error_type: ErrorType,
}

impl From<RerankError> for ErrorResponse {
    fn from(err: RerankError) -> Self {
        let error_type = match err {
            RerankError::Tokenizer(_) => ErrorType::Tokenizer,
            RerankError::Validation(_) => ErrorType::Validation,
            RerankError::Overloaded(_) => ErrorType::Overloaded,
            RerankError::Backend(_) => ErrorType::Backend,
        };
        Self {
            error: err.to_string(),
            error_type,
        }
    }
}

struct ResponseMetadata {
    compute_chars: usize,
    compute_tokens: usize,
    start_time: Instant,
    tokenization_time: Duration,
    queue_time: Duration,
    inference_time: Duration,
}

impl ResponseMetadata {
    fn new(
        compute_chars: usize,
        compute_tokens: usize,
        start_time: Instant,
        tokenization_time: Duration,
        queue_time: Duration,
        inference_time: Duration,
    ) -> Self {
        Self {
            compute_chars,
            compute_tokens,
            start_time,
            tokenization_time,
            queue_time,
            inference_time,
        }
    }

    fn record_span(&self, span: &Span) {
        // Tracing metadata
        span.record("compute_chars", self.compute_chars);
        span.record("compute_tokens", self.compute_tokens);
        span.record("total_time", format!("{:?}", self.start_time.elapsed()));
        span.record("tokenization_time", format!("{:?}", self.tokenization_time));
        span.record("queue_time", format!("{:?}", self.queue_time));
        span.record("inference_time", format!("{:?}", self.inference_time));
    }

    fn record_metrics(&self) {
        // Metrics
        let histogram = metrics::histogram!("te_request_duration");
        histogram.record(self.start_time.elapsed().as_secs_f64());
        let histogram = metrics::histogram!("te_request_tokenization_duration");
        histogram.record(self.tokenization_time.as_secs_f64());
        let histogram = metrics::histogram!("te_request_queue_duration");
        histogram.record(self.queue_time.as_secs_f64());
        let histogram = metrics::histogram!("te_request_inference_duration");
        histogram.record(self.inference_time.as_secs_f64());
    }
}

impl From<ResponseMetadata> for ::http::HeaderMap {
    fn from(value: ResponseMetadata) -> Self {
        // Headers
        let mut headers = ::http::HeaderMap::new();
        headers.insert("x-compute-type", header_value("gpu+optimized"));
        headers.insert(
            "x-compute-time",
            header_value(value.start_time.elapsed().as_millis()),
        );
        headers.insert("x-compute-characters", header_value(value.compute_chars));
        headers.insert("x-compute-tokens", header_value(value.compute_tokens));
        headers.insert(
            "x-total-time",
            header_value(value.start_time.elapsed().as_millis()),
        );
        headers.insert(
            "x-tokenization-time",
            header_value(value.tokenization_time.as_millis()),
        );
        headers.insert("x-queue-time", header_value(value.queue_time.as_millis()));
        headers.insert(
            "x-inference-time",
            header_value(value.inference_time.as_millis()),
        );
        headers
    }
}

fn header_value(value: impl ToString) -> ::http::HeaderValue {
    // Numbers and ascii literals are always valid header values
    ::http::HeaderValue::from_str(&value.to_string())
        .unwrap_or_else(|_| ::http::HeaderValue::from_static(""))
}
