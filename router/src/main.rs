use anyhow::Result;
use clap::Parser;
use opentelemetry::global;
use text_rerank_backend::DType;
use veil::Redact;

#[cfg(not(target_os = "linux"))]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

/// App Configuration
#[derive(Parser, Redact)]
#[clap(author, version, about, long_about = None)]
pub struct Args {
    /// The name of the reranker model to load.
    /// Can be a MODEL_ID as listed on <https://hf.co/models> like
    /// `Qwen/Qwen3-Reranker-0.6B`.
    /// Or it can be a local directory containing `config.json`, `tokenizer.json`
    /// and the safetensors weights.
    #[clap(default_value = "Qwen/Qwen3-Reranker-0.6B", long, env)]
    #[redact(partial)]
    model_id: String,

    /// The actual revision of the model if you're referring to a model
    /// on the hub. You can use a specific commit id or a branch like `refs/pr/2`.
    #[clap(long, env)]
    revision: Option<String>,

    /// Optionally control the number of tokenizer workers used for prompt formatting,
    /// tokenization, validation and truncation.
    /// Default to the number of CPU cores on the machine.
    #[clap(long, env)]
    tokenization_workers: Option<usize>,

    /// The dtype to be forced upon the model.
    #[clap(long, env, value_enum)]
    dtype: Option<DType>,

    /// The maximum amount of concurrent requests for this particular deployment.
    /// Having a low limit will refuse clients requests instead of having them
    /// wait for too long and is usually good to handle backpressure correctly.
    #[clap(default_value = "512", long, env)]
    max_concurrent_requests: usize,

    /// Control the maximum number of documents that a client can send in a single request
    #[clap(default_value = "128", long, env)]
    max_client_batch_size: usize,

    /// Automatically truncate documents whose prompt is longer than the maximum supported size.
    /// Can be overridden per request with the `truncate` field.
    #[clap(long, env)]
    auto_truncate: bool,

    /// The instruction used when a request does not carry one.
    /// Default to "Given a web search query, retrieve relevant passages that answer the query".
    #[clap(long, env)]
    rerank_instruction: Option<String>,

    /// Your Hugging Face Hub token
    #[clap(long, env)]
    #[redact(partial)]
    hf_token: Option<String>,

    /// The IP address to listen on
    #[clap(default_value = "0.0.0.0", long, env)]
    hostname: String,

    /// The port to listen on.
    #[clap(default_value = "3000", long, short, env)]
    port: u16,

    /// The location of the huggingface hub cache.
    /// Used to override the location if you want to provide a mounted disk for instance
    #[clap(long, env)]
    huggingface_hub_cache: Option<String>,

    /// Payload size limit in bytes
    ///
    /// Default is 2MB
    #[clap(default_value = "2000000", long, env)]
    payload_limit: usize,

    /// Set an api key for request authorization.
    ///
    /// By default the server responds to every request. With an api key set, the requests must have the Authorization header set with the api key as Bearer token.
    #[clap(long, env)]
    #[redact(partial)]
    api_key: Option<String>,

    /// Outputs the logs in JSON format (useful for telemetry)
    #[clap(long, env)]
    json_output: bool,

    // Whether or not to include the log trace through spans
    #[clap(long, env)]
    disable_spans: bool,

    /// The grpc endpoint for opentelemetry. Telemetry is sent to this endpoint as OTLP over gRPC.
    /// e.g. `http://localhost:4317`
    #[clap(long, env)]
    otlp_endpoint: Option<String>,

    /// The service name for opentelemetry.
    /// e.g. `text-rerank.server`
    #[clap(default_value = "text-rerank.server", long, env)]
    otlp_service_name: String,

    #[clap(long, env)]
    cors_allow_origin: Option<Vec<String>>,
}


#[tokio::main]
async fn main() -> Result<()> {
    // Pattern match configuration
    let args: Args = Args::parse();

    // Initialize logging and telemetry
    let global_tracer = text_rerank_router::init_logging(
        args.otlp_endpoint.as_ref(),
        args.otlp_service_name.clone(),
        args.json_output,
        args.disable_spans,
    );

    tracing::info!("{args:?}");

    // Hack to trim pages regularly
    // see: https://www.algolia.com/blog/engineering/when-allocators-are-hoarding-your-precious-memory/
    #[cfg(target_os = "linux")]
    tokio::spawn(async move {
        use tokio::time::Duration;
        loop {
            tokio::time::sleep(Duration::from_millis(100)).await;
            unsafe {
                libc::malloc_trim(0);
            }
        }
    });

    text_rerank_router::run(
        args.model_id,
        args.revision,
        args.tokenization_workers,
        args.dtype,
        args.max_concurrent_requests,
        args.max_client_batch_size,
        args.auto_truncate,
        args.rerank_instruction,
        args.hf_token,
        Some(args.hostname),
        args.port,
        args.huggingface_hub_cache,
        args.payload_limit,
        args.api_key,
        args.cors_allow_origin,
    )
    .await?;

    if global_tracer {
        // Shutdown tracer
        global::shutdown_tracer_provider();
    }
    Ok(())
}
