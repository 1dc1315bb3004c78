use crate::tokenization::Tokenization;
use crate::RerankError;
use futures::future::try_join_all;
use std::sync::Arc;
use std::time::{Duration, Instant};
use text_rerank_backend::{Backend, BackendError, Batch};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::instrument;

/// Inference struct
#[derive(Debug, Clone)]
pub struct Infer {
    tokenization: Tokenization,
    /// Inference limit
    limit_concurrent_requests: Arc<Semaphore>,
    backend: Backend,
}

impl Infer {
    pub fn new(tokenization: Tokenization, max_concurrent_requests: usize, backend: Backend) -> Self {
        // Inference limit with a semaphore
        let semaphore = Arc::new(Semaphore::new(max_concurrent_requests));

        Self {
            tokenization,
            limit_concurrent_requests: semaphore,
            backend,
        }
    }

    #[instrument(skip(self))]
    pub fn try_acquire_permit(&self) -> Result<OwnedSemaphorePermit, RerankError> {
        // Limit concurrent requests by acquiring a permit from the semaphore
        self.clone()
            .limit_concurrent_requests
            .try_acquire_owned()
            .map_err(|err| {
                let counter = metrics::counter!("te_request_failure", "err" => "overloaded");
                counter.increment(1);
                tracing::error!("{err}");
                RerankError::from(err)
            })
    }

    #[instrument(skip(self))]
    pub async fn acquire_permit(&self) -> OwnedSemaphorePermit {
        // Limit concurrent requests by acquiring a permit from the semaphore
        self.clone()
            .limit_concurrent_requests
            .acquire_owned()
            .await
            .expect("Semaphore has been closed. This is a bug.")
    }

    /// Relevance of every document to `query`, in document order.
    ///
    /// Documents are tokenized concurrently on the worker pool, then scored one forward pass
    /// at a time.
    #[instrument(skip(self, query, documents, _permit), fields(documents = documents.len()))]
    pub async fn rerank(
        &self,
        query: String,
        documents: Vec<String>,
        instruction: Option<String>,
        truncate: bool,
        _permit: OwnedSemaphorePermit,
    ) -> Result<RerankInferResponse, RerankError> {
        let start_time = Instant::now();
        let counter = metrics::counter!("te_rerank_count");
        counter.increment(1);
        let histogram = metrics::histogram!("te_rerank_documents");
        histogram.record(documents.len() as f64);

        // Tokenization
        let encodings = try_join_all(documents.into_iter().map(|document| {
            self.tokenization
                .encode(query.clone(), document, instruction.clone(), truncate)
        }))
        .await
        .map_err(|err| {
            let counter = metrics::counter!("te_request_failure", "err" => "tokenization");
            counter.increment(1);
            tracing::error!("{err}");
            err
        })?;
        let tokenization = start_time.elapsed();

        let scoring_start = Instant::now();
        let mut inference = Duration::ZERO;
        let mut prompt_tokens = 0;
        let mut scores = Vec::with_capacity(encodings.len());

        for encoding in encodings {
            prompt_tokens += encoding.input_ids.len();
            let batch = Batch::single(encoding.input_ids, encoding.position_ids);

            let (score, duration) = self.score_batch(batch).await.map_err(|err| {
                let counter = metrics::counter!("te_request_failure", "err" => "inference");
                counter.increment(1);
                tracing::error!("{err}");
                err
            })?;
            inference += duration;
            scores.push(score);
        }

        let metadata = InferMetadata {
            prompt_tokens,
            tokenization,
            queue: scoring_start.elapsed().saturating_sub(inference),
            inference,
        };

        // Timings
        let total_time = start_time.elapsed();

        // Metrics
        let counter = metrics::counter!("te_rerank_success");
        counter.increment(1);
        let histogram = metrics::histogram!("te_rerank_duration");
        histogram.record(total_time.as_secs_f64());
        let histogram = metrics::histogram!("te_rerank_tokenization_duration");
        histogram.record(metadata.tokenization.as_secs_f64());
        let histogram = metrics::histogram!("te_rerank_queue_duration");
        histogram.record(metadata.queue.as_secs_f64());
        let histogram = metrics::histogram!("te_rerank_inference_duration");
        histogram.record(metadata.inference.as_secs_f64());

        Ok(RerankInferResponse { scores, metadata })
    }

    /// `p(yes)` of a single sequence
    async fn score_batch(&self, batch: Batch) -> Result<(f32, Duration), RerankError> {
        let (mut predictions, duration) = self.backend.predict(batch).await?;

        let probabilities = predictions.remove(&0).ok_or_else(|| {
            BackendError::Inference("prediction not found in results".to_string())
        })?;
        let score = probabilities.get(1).copied().ok_or_else(|| {
            BackendError::Inference(format!(
                "expected [p(no), p(yes)], got {} values",
                probabilities.len()
            ))
        })?;

        Ok((score, duration))
    }

    #[instrument(skip(self))]
    pub async fn health(&self) -> bool {
        self.backend.health().await.is_ok()
    }
}

#[derive(Debug)]
pub struct InferMetadata {
    pub prompt_tokens: usize,
    pub tokenization: Duration,
    pub queue: Duration,
    pub inference: Duration,
}

#[derive(Debug)]
pub struct RerankInferResponse {
    pub scores: Vec<f32>,
    pub metadata: InferMetadata,
}
