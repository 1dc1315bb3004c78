use hf_hub::api::tokio::{ApiError, ApiRepo};
use std::path::PathBuf;
use tracing::instrument;

async fn download_file(api: &ApiRepo, file_path: &str) -> Result<PathBuf, ApiError> {
    tracing::info!("Downloading `{}`", file_path);
    api.get(file_path).await
}

/// Download `config.json` and `tokenizer.json` and return the directory they were stored in.
///
/// The model weights are fetched by the backend.
#[instrument(skip_all)]
pub async fn download_artifacts(api: &ApiRepo) -> Result<PathBuf, ApiError> {
    let start = std::time::Instant::now();
    tracing::info!("Starting download");

    download_file(api, "config.json").await?;
    let path = download_file(api, "tokenizer.json").await?;

    tracing::info!("Model artifacts downloaded in {:?}", start.elapsed());

    let root = path.parent().map(PathBuf::from).ok_or_else(|| {
        ApiError::IoError(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "tokenizer.json has no parent directory",
        ))
    })?;
    Ok(root)
}
