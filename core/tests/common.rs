use std::sync::{Arc, Mutex};
use text_rerank_backend::{Backend, BackendError, Batch, CoreBackend, Predictions};
use text_rerank_core::infer::Infer;
use text_rerank_core::templates::Qwen3RerankerTemplate;
use text_rerank_core::tokenization::Tokenization;
use tokenizers::Tokenizer;

pub const HELLO: u32 = 3;

/// Word level tokenizer splitting on whitespace and punctuation
pub fn tokenizer() -> Tokenizer {
    let json = r#"{
        "version": "1.0",
        "truncation": null,
        "padding": null,
        "added_tokens": [],
        "normalizer": null,
        "pre_tokenizer": {"type": "Whitespace"},
        "post_processor": null,
        "decoder": null,
        "model": {
            "type": "WordLevel",
            "vocab": {"[UNK]": 0, "no": 1, "yes": 2, "hello": 3, "world": 4, "Query": 5, "Document": 6},
            "unk_token": "[UNK]"
        }
    }"#;
    Tokenizer::from_bytes(json.as_bytes()).unwrap()
}

/// Scores a sequence by the share of `hello` tokens it contains and records what it saw
pub struct HelloBackend {
    pub seen: Arc<Mutex<Vec<Vec<u32>>>>,
}

impl CoreBackend for HelloBackend {
    fn health(&self) -> Result<(), BackendError> {
        Ok(())
    }

    fn predict(&self, batch: Batch) -> Result<Predictions, BackendError> {
        let mut predictions = Predictions::default();
        for i in 0..batch.len() {
            let start = batch.cumulative_seq_lengths[i] as usize;
            let end = batch.cumulative_seq_lengths[i + 1] as usize;
            let ids = &batch.input_ids[start..end];
            self.seen.lock().unwrap().push(ids.to_vec());

            let hellos = ids.iter().filter(|id| **id == HELLO).count();
            let yes = hellos as f32 / ids.len() as f32;
            predictions.insert(i, vec![1.0 - yes, yes]);
        }
        Ok(predictions)
    }
}

pub struct BrokenBackend;

impl CoreBackend for BrokenBackend {
    fn health(&self) -> Result<(), BackendError> {
        Err(BackendError::Unhealthy)
    }

    fn predict(&self, _batch: Batch) -> Result<Predictions, BackendError> {
        Err(BackendError::Inference("device lost".to_string()))
    }
}

pub fn infer(
    backend: Box<dyn CoreBackend + Send>,
    max_input_length: usize,
    max_concurrent_requests: usize,
) -> Infer {
    let tokenization = Tokenization::new(
        2,
        tokenizer(),
        max_input_length,
        Arc::new(Qwen3RerankerTemplate::default()),
    )
    .unwrap();
    Infer::new(
        tokenization,
        max_concurrent_requests,
        Backend::from_backend(backend),
    )
}

pub fn hello_infer(max_input_length: usize) -> (Infer, Arc<Mutex<Vec<Vec<u32>>>>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let infer = infer(
        Box::new(HelloBackend { seen: seen.clone() }),
        max_input_length,
        4,
    );
    (infer, seen)
}
