/// HTTP Server logic
use crate::http::types::{RerankRequest, RerankResponse};
use crate::logging::trace_context_middleware;
use crate::{shutdown, ErrorResponse, ErrorType, Info, ResponseMetadata};
use ::http::HeaderMap;
use anyhow::Context;
use axum::extract::{DefaultBodyLimit, Extension};
use axum::http::HeaderValue;
use axum::http::{Method, StatusCode};
use axum::routing::{get, post};
use axum::{http, Json, Router};
use axum_tracing_opentelemetry::middleware::OtelAxumLayer;
use http::header::AUTHORIZATION;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use std::time::Instant;
use text_rerank_core::infer::Infer;
use tokio::net::TcpListener;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tracing::instrument;
use tracing_opentelemetry::OpenTelemetrySpanExt;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

/// Text Rerank endpoint info
#[utoipa::path(
get,
tag = "Text Rerank",
path = "/info",
responses((status = 200, description = "Served model info", body = Info))
)]
#[instrument]
async fn get_model_info(info: Extension<Info>) -> Json<Info> {
    Json(info.0)
}

#[utoipa::path(
get,
tag = "Text Rerank",
path = "/health",
responses(
(status = 200, description = "Everything is working fine"),
(status = 503, description = "Text Rerank is down", body = ErrorResponse,
example = json ! ({"error": "unhealthy", "error_type": "unhealthy"})),
)
)]
#[instrument(skip(infer))]
/// Health check method
async fn health(infer: Extension<Infer>) -> Result<(), (StatusCode, Json<ErrorResponse>)> {
    match infer.health().await {
        true => Ok(()),
        false => Err(ErrorResponse {
            error: "unhealthy".to_string(),
            error_type: ErrorType::Unhealthy,
        })?,
    }
}

/// Score the relevance of every document to the query.
/// Scores are `p(yes)` in `[0, 1]` and follow the order of `documents`.
#[utoipa::path(
post,
tag = "Text Rerank",
path = "/rerank",
request_body = RerankRequest,
responses(
(status = 200, description = "Relevance scores", body = RerankResponse),
(status = 424, description = "Rerank Error", body = ErrorResponse,
example = json ! ({"error": "Inference failed", "error_type": "backend"})),
(status = 429, description = "Model is overloaded", body = ErrorResponse,
example = json ! ({"error": "Model is overloaded", "error_type": "overloaded"})),
(status = 422, description = "Tokenization error", body = ErrorResponse,
example = json ! ({"error": "Tokenization error", "error_type": "tokenizer"})),
(status = 413, description = "Batch size error", body = ErrorResponse,
example = json ! ({"error": "Batch size error", "error_type": "validation"})),
)
)]
#[instrument(
    skip_all,
    fields(compute_chars, compute_tokens, total_time, tokenization_time, queue_time, inference_time,)
)]
async fn rerank(
    infer: Extension<Infer>,
    info: Extension<Info>,
    Extension(context): Extension<Option<opentelemetry::Context>>,
    Json(req): Json<RerankRequest>,
) -> Result<(HeaderMap, Json<RerankResponse>), (StatusCode, Json<ErrorResponse>)> {
    let span = tracing::Span::current();
    if let Some(context) = context {
        span.set_parent(context);
    }

    let start_time = Instant::now();
    let counter = metrics::counter!("te_request_count", "method" => "rerank");
    counter.increment(1);

    let batch_size = req.documents.len();
    if batch_size > info.max_client_batch_size {
        let message = format!(
            "batch size {batch_size} > maximum allowed batch size {}",
            info.max_client_batch_size
        );
        tracing::error!("{message}");
        let err = ErrorResponse {
            error: message,
            error_type: ErrorType::Validation,
        };
        let counter = metrics::counter!("te_request_failure", "err" => "batch_size");
        counter.increment(1);
        Err(err)?;
    }

    let permit = infer.try_acquire_permit().map_err(ErrorResponse::from)?;

    let compute_chars = req.compute_chars();
    let truncate = req.truncate.unwrap_or(info.auto_truncate);

    let response = infer
        .rerank(req.query, req.documents, req.instruction, truncate, permit)
        .await
        .map_err(ErrorResponse::from)?;

    // Check that no score is NaN
    if response.scores.iter().any(|score| score.is_nan()) {
        let counter = metrics::counter!("te_request_failure", "err" => "nan");
        counter.increment(1);
        Err(ErrorResponse {
            error: "score is NaN".to_string(),
            error_type: ErrorType::Backend,
        })?;
    }

    let metadata = ResponseMetadata::new(
        compute_chars,
        response.metadata.prompt_tokens,
        start_time,
        response.metadata.tokenization,
        response.metadata.queue,
        response.metadata.inference,
    );
    metadata.record_span(&span);
    metadata.record_metrics();

    let counter = metrics::counter!("te_request_success", "method" => "rerank");
    counter.increment(1);

    let headers = HeaderMap::from(metadata);

    tracing::info!("Success");

    Ok((
        headers,
        Json(RerankResponse {
            scores: response.scores,
        }),
    ))
}

/// Prometheus metrics scrape endpoint
#[utoipa::path(
get,
tag = "Text Rerank",
path = "/metrics",
responses((status = 200, description = "Prometheus Metrics", body = String))
)]
async fn metrics(prom_handle: Extension<PrometheusHandle>) -> String {
    prom_handle.render()
}

#[derive(OpenApi)]
#[openapi(
paths(
get_model_info,
health,
rerank,
metrics,
),
components(
schemas(
Info,
RerankRequest,
RerankResponse,
ErrorResponse,
ErrorType,
)
),
tags(
(name = "Text Rerank", description = "Qwen3 reranker API")
),
info(
title = "Text Rerank",
license(
name = "Apache 2.0",
url = "https://www.apache.org/licenses/LICENSE-2.0"
)
)
)]
struct ApiDoc;

/// Build the application router
pub fn app(
    infer: Infer,
    info: Info,
    prom_handle: PrometheusHandle,
    payload_limit: usize,
    api_key: Option<String>,
    cors_allow_origin: Option<Vec<String>>,
) -> Result<Router, anyhow::Error> {
    // CORS allowed origins
    let allow_origin = match cors_allow_origin {
        Some(origins) => AllowOrigin::list(
            origins
                .into_iter()
                .map(|origin| {
                    origin
                        .parse::<HeaderValue>()
                        .with_context(|| format!("invalid CORS origin `{origin}`"))
                })
                .collect::<Result<Vec<_>, _>>()?,
        ),
        None => AllowOrigin::any(),
    };

    // CORS layer
    let cors_layer = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([http::header::CONTENT_TYPE, AUTHORIZATION])
        .allow_origin(allow_origin);

    let mut app = Router::new()
        .merge(SwaggerUi::new("/docs").url("/api-doc/openapi.json", ApiDoc::openapi()))
        // Base routes
        .route("/info", get(get_model_info))
        .route("/rerank", post(rerank))
        // Base Health route
        .route("/health", get(health))
        // Inference API routes
        .route("/", get(health).post(rerank))
        // AWS Sagemaker route
        .route("/invocations", post(rerank))
        // Prometheus metrics route
        .route("/metrics", get(metrics))
        .layer(DefaultBodyLimit::max(payload_limit))
        .layer(axum::middleware::from_fn(trace_context_middleware))
        .layer(Extension(infer))
        .layer(Extension(info))
        .layer(Extension(prom_handle))
        .layer(OtelAxumLayer::default())
        .layer(cors_layer);

    if let Some(api_key) = api_key {
        let mut prefix = "Bearer ".to_string();
        prefix.push_str(&api_key);

        // Leak to allow FnMut
        let api_key: &'static str = prefix.leak();

        let auth = move |headers: HeaderMap,
                         request: axum::extract::Request,
                         next: axum::middleware::Next| async move {
            match headers.get(AUTHORIZATION) {
                Some(token) if token == api_key => {
                    let response = next.run(request).await;
                    Ok(response)
                }
                _ => Err(StatusCode::UNAUTHORIZED),
            }
        };

        app = app.layer(axum::middleware::from_fn(auth));
    }

    Ok(app)
}

/// Serving method
pub async fn run(
    infer: Infer,
    info: Info,
    addr: SocketAddr,
    prom_builder: PrometheusBuilder,
    payload_limit: usize,
    api_key: Option<String>,
    cors_allow_origin: Option<Vec<String>>,
) -> Result<(), anyhow::Error> {
    let prom_handle = prom_builder
        .install_recorder()
        .context("failed to install metrics recorder")?;

    let app = app(
        infer,
        info,
        prom_handle,
        payload_limit,
        api_key,
        cors_allow_origin,
    )?;

    // Run server
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("could not bind {addr}"))?;

    tracing::info!("Starting HTTP server: {}", &addr);
    tracing::info!("Ready");

    axum::serve(listener, app)
        // Wait until all requests are finished to shut down
        .with_graceful_shutdown(shutdown::shutdown_signal())
        .await?;

    Ok(())
}

impl From<&ErrorType> for StatusCode {
    fn from(value: &ErrorType) -> Self {
        match value {
            ErrorType::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
            ErrorType::Backend => StatusCode::FAILED_DEPENDENCY,
            ErrorType::Overloaded => StatusCode::TOO_MANY_REQUESTS,
            ErrorType::Tokenizer => StatusCode::UNPROCESSABLE_ENTITY,
            ErrorType::Validation => StatusCode::PAYLOAD_TOO_LARGE,
        }
    }
}

/// Convert to Axum supported formats
impl From<ErrorResponse> for (StatusCode, Json<ErrorResponse>) {
    fn from(err: ErrorResponse) -> Self {
        (StatusCode::from(&err.error_type), Json(err))
    }
}
