mod dtype;

use hf_hub::api::tokio::{ApiError, ApiRepo};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
pub use text_rerank_backend_core::Backend as CoreBackend;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{instrument, Span};

pub use crate::dtype::DType;
pub use text_rerank_backend_core::{BackendError, Batch, Predictions, ScoringTokens};

#[cfg(feature = "candle")]
use text_rerank_backend_candle::CandleBackend;

#[derive(Debug, Clone)]
pub struct Backend {
    /// Channel to communicate with the background thread
    backend_sender: mpsc::Sender<BackendCommand>,
    /// Health status
    health_receiver: watch::Receiver<bool>,
    _backend_thread: Arc<BackendThread>,
}

impl Backend {
    pub async fn new(
        model_path: PathBuf,
        api_repo: Option<ApiRepo>,
        dtype: DType,
        scoring_tokens: ScoringTokens,
    ) -> Result<Self, BackendError> {
        let backend = init_backend(model_path, api_repo, dtype, scoring_tokens).await?;
        Ok(Self::from_backend(backend))
    }

    /// Wrap an already started backend into its own thread
    pub fn from_backend(backend: Box<dyn CoreBackend + Send>) -> Self {
        let (backend_sender, backend_receiver) = mpsc::channel(8);

        let (health_sender, health_receiver) = watch::channel(false);
        let _backend_thread =
            Arc::new(BackendThread::new(backend, backend_receiver, health_sender));

        Self {
            backend_sender,
            health_receiver,
            _backend_thread,
        }
    }

    #[instrument(skip(self))]
    pub async fn health(&self) -> Result<(), BackendError> {
        if *self.health_receiver.borrow() {
            // The backend is healthy. Only do a basic health check by calling the
            // the underlying health method.
            let (sender, receiver) = oneshot::channel();
            self.send(BackendCommand::Health(Span::current(), sender))
                .await?;
            receiver.await.map_err(|_| dropped_sender())?
        } else {
            // The backend is un-healthy or only just started. Do a more advanced health check
            // by calling the model forward on a test batch
            let batch = Batch::single(vec![0], vec![0]);
            self.predict(batch).await.map(|_| ())
        }
    }

    #[instrument(skip(self))]
    pub fn health_watcher(&self) -> watch::Receiver<bool> {
        self.health_receiver.clone()
    }

    #[instrument(skip_all)]
    pub async fn predict(&self, batch: Batch) -> Result<(Predictions, Duration), BackendError> {
        let (sender, receiver) = oneshot::channel();

        self.send(BackendCommand::Predict(batch, Span::current(), sender))
            .await?;
        receiver.await.map_err(|_| dropped_sender())?
    }

    async fn send(&self, command: BackendCommand) -> Result<(), BackendError> {
        self.backend_sender
            .send(command)
            .await
            .map_err(|_| BackendError::Inference("backend thread is not running".to_string()))
    }
}

fn dropped_sender() -> BackendError {
    BackendError::Inference(
        "backend thread dropped the request without sending a response".to_string(),
    )
}

#[allow(unused)]
async fn init_backend(
    model_path: PathBuf,
    api_repo: Option<ApiRepo>,
    dtype: DType,
    scoring_tokens: ScoringTokens,
) -> Result<Box<dyn CoreBackend + Send>, BackendError> {
    if let Some(api_repo) = api_repo.as_ref() {
        let start = Instant::now();
        download_safetensors(api_repo)
            .await
            .map_err(|err| BackendError::WeightsNotFound(err.to_string()))?;
        tracing::info!("Model weights downloaded in {:?}", start.elapsed());
    }

    if cfg!(feature = "candle") {
        #[cfg(feature = "candle")]
        {
            // Loading mmaps the weights and builds the model, keep it off the runtime threads
            let backend = tokio::task::spawn_blocking(move || {
                CandleBackend::new(&model_path, dtype.to_string(), scoring_tokens)
            })
            .await
            .map_err(|err| BackendError::Start(err.to_string()))?;

            return match backend {
                Ok(b) => Ok(Box::new(b)),
                Err(err) => {
                    tracing::error!("Could not start Candle backend: {err}");
                    Err(BackendError::Start(
                        "Could not start a suitable backend".to_string(),
                    ))
                }
            };
        }
    }

    Err(BackendError::NoBackend)
}

#[derive(Debug)]
struct BackendThread(Option<JoinHandle<()>>);

impl BackendThread {
    fn new(
        backend: Box<dyn CoreBackend + Send>,
        mut backend_receiver: mpsc::Receiver<BackendCommand>,
        health_sender: watch::Sender<bool>,
    ) -> Self {
        let handle = std::thread::spawn(move || {
            while let Some(cmd) = backend_receiver.blocking_recv() {
                let start = Instant::now();
                // Health is published before the response so callers observe it on return
                match cmd {
                    BackendCommand::Health(span, sender) => {
                        let _span = span.entered();
                        let result = backend.health();
                        let _ = health_sender.send(result.is_ok());
                        let _ = sender.send(result);
                    }
                    BackendCommand::Predict(batch, span, sender) => {
                        let _span = span.entered();
                        let result = backend.predict(batch).map(|p| (p, start.elapsed()));
                        let _ = health_sender.send(result.is_ok());
                        let _ = sender.send(result);
                    }
                };
            }
        });
        Self(Some(handle))
    }
}

impl Drop for BackendThread {
    fn drop(&mut self) {
        if let Some(handle) = self.0.take() {
            if handle.join().is_err() {
                tracing::error!("Backend thread panicked");
            }
        }
    }
}

enum BackendCommand {
    Health(Span, oneshot::Sender<Result<(), BackendError>>),
    Predict(
        Batch,
        Span,
        #[allow(clippy::type_complexity)]
        oneshot::Sender<Result<(Predictions, Duration), BackendError>>,
    ),
}

impl std::fmt::Debug for BackendCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendCommand::Health(..) => write!(f, "Health"),
            BackendCommand::Predict(batch, ..) => write!(f, "Predict({} sequences)", batch.len()),
        }
    }
}

async fn download_safetensors(api: &ApiRepo) -> Result<Vec<PathBuf>, ApiError> {
    // Single file
    tracing::info!("Downloading `model.safetensors`");
    match api.get("model.safetensors").await {
        Ok(p) => return Ok(vec![p]),
        Err(err) => tracing::warn!("Could not download `model.safetensors`: {}", err),
    };

    // Sharded weights
    // Download and parse index file
    tracing::info!("Downloading `model.safetensors.index.json`");
    let index_file = api.get("model.safetensors.index.json").await?;
    let index_file_string: String = std::fs::read_to_string(index_file)?;

    let mut safetensors_files = Vec::new();
    for n in shard_filenames(&index_file_string)? {
        tracing::info!("Downloading `{}`", n);
        safetensors_files.push(api.get(&n).await?);
    }

    Ok(safetensors_files)
}

/// Unique shard file names referenced by a `model.safetensors.index.json`
fn shard_filenames(index: &str) -> Result<Vec<String>, std::io::Error> {
    let corrupted = || {
        std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "model.safetensors.index.json is corrupted",
        )
    };

    let json: serde_json::Value = serde_json::from_str(index).map_err(|_| corrupted())?;
    let weight_map = match json.get("weight_map") {
        Some(serde_json::Value::Object(map)) => map,
        _ => return Err(corrupted()),
    };

    let mut filenames: Vec<String> = weight_map
        .values()
        .filter_map(|value| value.as_str().map(str::to_string))
        .collect();
    filenames.sort();
    filenames.dedup();
    Ok(filenames)
}
