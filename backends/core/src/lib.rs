use nohash_hasher::IntMap;
use thiserror::Error;

/// One or more token sequences laid out back to back.
///
/// Every sequence is scored on its own; `cumulative_seq_lengths` delimits them.
#[derive(Debug)]
pub struct Batch {
    pub input_ids: Vec<u32>,
    pub position_ids: Vec<u32>,
    pub cumulative_seq_lengths: Vec<u32>,
    pub max_length: u32,
}

impl Batch {
    pub fn single(input_ids: Vec<u32>, position_ids: Vec<u32>) -> Self {
        let length = input_ids.len() as u32;
        Self {
            input_ids,
            position_ids,
            cumulative_seq_lengths: vec![0, length],
            max_length: length,
        }
    }

    pub fn len(&self) -> usize {
        self.cumulative_seq_lengths.len() - 1
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Vocabulary ids of the two answer tokens the relevance score is read from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScoringTokens {
    pub no: u32,
    pub yes: u32,
}

/// `[p(no), p(yes)]` per sequence index
pub type Predictions = IntMap<usize, Vec<f32>>;

pub trait Backend {
    fn health(&self) -> Result<(), BackendError>;
    fn predict(&self, batch: Batch) -> Result<Predictions, BackendError>;
}

#[derive(Debug, Error, Clone)]
pub enum BackendError {
    #[error("No backend found")]
    NoBackend,
    #[error("Could not start backend: {0}")]
    Start(String),
    #[error("{0}")]
    Inference(String),
    #[error("Backend is unhealthy")]
    Unhealthy,
    #[error("Weights not found: {0}")]
    WeightsNotFound(String),
}
