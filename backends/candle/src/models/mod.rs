#[cfg(feature = "accelerate")]
extern crate accelerate_src;

#[cfg(feature = "mkl")]
extern crate intel_mkl_src;

use candle::{Result, Tensor};
use text_rerank_backend_core::Batch;

mod qwen3;

pub use qwen3::{Qwen3Config, Qwen3Model};

pub(crate) trait Model {
    /// `[batch_size, 2]` softmax probabilities over the (`no`, `yes`) answer tokens
    fn predict(&self, batch: Batch) -> Result<Tensor>;
}
