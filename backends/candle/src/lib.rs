mod layers;
mod models;

use crate::models::{Model, Qwen3Config, Qwen3Model};
use candle::{DType, Device};
use candle_nn::VarBuilder;
use nohash_hasher::BuildNoHashHasher;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use text_rerank_backend_core::{Backend, BackendError, Batch, Predictions, ScoringTokens};

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "model_type", rename_all = "kebab-case")]
enum Config {
    Qwen3(Qwen3Config),
}

pub struct CandleBackend {
    device: Device,
    model: Box<dyn Model + Send>,
}

impl CandleBackend {
    pub fn new(
        model_path: &Path,
        dtype: String,
        scoring_tokens: ScoringTokens,
    ) -> Result<Self, BackendError> {
        // Load config
        let config: String = std::fs::read_to_string(model_path.join("config.json"))
            .map_err(|err| BackendError::Start(err.to_string()))?;
        let config: Config = serde_json::from_str(&config)
            .map_err(|err| BackendError::Start(format!("Model is not supported: {}", err)))?;

        // Get candle device
        let device = if candle::utils::cuda_is_available() {
            Device::new_cuda(0)
        } else if candle::utils::metal_is_available() {
            Device::new_metal(0)
        } else {
            Ok(Device::Cpu)
        }
        .s()?;

        // Get candle dtype
        let dtype = if &dtype == "float32" {
            Ok(DType::F32)
        } else if &dtype == "float16" {
            Ok(DType::F16)
        } else {
            Err(BackendError::Start(format!(
                "DType {dtype} is not supported"
            )))
        }?;

        let weights = safetensors_files(model_path)?;
        let vb = unsafe { VarBuilder::from_mmaped_safetensors(&weights, dtype, &device) }.s()?;

        let model: Box<dyn Model + Send> = match config {
            Config::Qwen3(config) => {
                tracing::info!("Starting Qwen3 reranker model on {:?}", device);
                Box::new(Qwen3Model::load(vb, &config, scoring_tokens).s()?)
            }
        };

        Ok(Self { device, model })
    }
}

/// `model.safetensors`, or every shard when the checkpoint is split
fn safetensors_files(model_path: &Path) -> Result<Vec<PathBuf>, BackendError> {
    let single = model_path.join("model.safetensors");
    if single.exists() {
        return Ok(vec![single]);
    }

    let entries = std::fs::read_dir(model_path)
        .map_err(|err| BackendError::WeightsNotFound(err.to_string()))?;
    let mut shards: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok().map(|entry| entry.path()))
        .filter(|path| path.extension().is_some_and(|ext| ext == "safetensors"))
        .collect();
    shards.sort();

    if shards.is_empty() {
        return Err(BackendError::WeightsNotFound(format!(
            "no safetensors weights in {}",
            model_path.display()
        )));
    }
    Ok(shards)
}

impl Backend for CandleBackend {
    fn health(&self) -> Result<(), BackendError> {
        Ok(())
    }

    fn predict(&self, batch: Batch) -> Result<Predictions, BackendError> {
        let batch_size = batch.len();
        if batch_size == 0 {
            return Ok(Predictions::default());
        }

        let results = self.model.predict(batch).e()?;
        let results = results.to_dtype(DType::F32).e()?.to_vec2().e()?;

        let mut predictions =
            HashMap::with_capacity_and_hasher(batch_size, BuildNoHashHasher::default());
        for (i, r) in results.into_iter().enumerate() {
            predictions.insert(i, r);
        }

        Ok(predictions)
    }
}

impl std::fmt::Debug for CandleBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CandleBackend")
            .field("device", &self.device)
            .finish_non_exhaustive()
    }
}

pub trait WrapErr<O> {
    fn s(self) -> Result<O, BackendError>;
    fn e(self) -> Result<O, BackendError>;
}

impl<O> WrapErr<O> for Result<O, candle::Error> {
    fn s(self) -> Result<O, BackendError> {
        self.map_err(|e| BackendError::Start(e.to_string()))
    }
    fn e(self) -> Result<O, BackendError> {
        self.map_err(|e| BackendError::Inference(e.to_string()))
    }
}
