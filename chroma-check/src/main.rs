use chroma_check::embed::{DEFAULT_EMBEDDING_MODEL, DEFAULT_OLLAMA_URL};
use chroma_check::{run_check, ChromaClient, OllamaEmbeddings};
use clap::Parser;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

/// Check that a Chroma server is reachable and can store and query documents
#[derive(Debug, Parser)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// Chroma host
    #[clap(default_value = "localhost", long, env = "CHROMA_HOST")]
    host: String,

    /// Chroma port
    #[clap(default_value = "8000", long, env = "CHROMA_PORT")]
    port: u16,

    #[clap(default_value = "default_tenant", long, env = "CHROMA_TENANT")]
    tenant: String,

    #[clap(default_value = "default_database", long, env = "CHROMA_DATABASE")]
    database: String,

    /// Name of the throwaway collection. It is deleted before and after the check.
    #[clap(default_value = "test_collection", long, env = "CHROMA_COLLECTION")]
    collection: String,

    /// Ollama server used to embed documents and queries
    #[clap(default_value = DEFAULT_OLLAMA_URL, long, env)]
    ollama_url: String,

    #[clap(default_value = DEFAULT_EMBEDDING_MODEL, long, env)]
    embedding_model: String,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let env_filter =
        EnvFilter::try_from_env("LOG_LEVEL").unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    tracing::info!("{args:?}");

    let client = ChromaClient::new(
        format!("http://{}:{}", args.host, args.port),
        args.tenant,
        args.database,
    );
    let embedder = OllamaEmbeddings::new(args.ollama_url, args.embedding_model);

    match run_check(&client, &embedder, &args.collection).await {
        true => ExitCode::SUCCESS,
        false => ExitCode::FAILURE,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_default_values() {
        let args = Args::try_parse_from(["chroma-check"]).unwrap();
        assert_eq!(args.host, "localhost");
        assert_eq!(args.port, 8000);
        assert_eq!(args.tenant, "default_tenant");
        assert_eq!(args.database, "default_database");
        assert_eq!(args.collection, "test_collection");
        assert_eq!(args.ollama_url, "http://localhost:11434");
        assert_eq!(args.embedding_model, "mxbai-embed-large");
    }
}
