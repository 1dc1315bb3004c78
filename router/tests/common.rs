#![allow(dead_code)]

use anyhow::Result;
use axum::Router;
use metrics_exporter_prometheus::PrometheusBuilder;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use text_rerank_backend::{Backend, BackendError, Batch, CoreBackend, DType, Predictions};
use text_rerank_core::infer::Infer;
use text_rerank_core::templates::Qwen3RerankerTemplate;
use text_rerank_core::tokenization::Tokenization;
use text_rerank_router::http::server::app;
use text_rerank_router::{run, Info};
use tokenizers::Tokenizer;
use tokio::net::TcpListener;
use tokio::time::Instant;

pub const HELLO: u32 = 3;

#[derive(Serialize, Deserialize, Debug)]
pub struct Score(pub f32);

impl Score {
    fn is_close(&self, other: &Self, abs_tol: f32) -> bool {
        is_close::default()
            .abs_tol(abs_tol)
            .is_close(self.0, other.0)
    }
}

impl PartialEq for Score {
    fn eq(&self, other: &Self) -> bool {
        // Default tolerance for equality
        self.is_close(other, 4e-3)
    }
}

#[derive(Deserialize, Debug)]
pub struct Scores {
    pub scores: Vec<Score>,
}

/// Word level tokenizer splitting on whitespace and punctuation
fn tokenizer() -> Tokenizer {
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
            "vocab": {"[UNK]": 0, "no": 1, "yes": 2, "hello": 3, "world": 4},
            "unk_token": "[UNK]"
        }
    }"#;
    Tokenizer::from_bytes(json.as_bytes()).unwrap()
}

/// `p(yes)` is the share of `hello` tokens in the sequence
struct HelloBackend;

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

            let hellos = ids.iter().filter(|id| **id == HELLO).count();
            let yes = hellos as f32 / ids.len() as f32;
            predictions.insert(i, vec![1.0 - yes, yes]);
        }
        Ok(predictions)
    }
}

fn info(max_input_length: usize, max_client_batch_size: usize) -> Info {
    Info {
        model_id: "hello-reranker".to_string(),
        model_sha: None,
        model_dtype: "float32".to_string(),
        max_concurrent_requests: 4,
        max_input_length,
        max_client_batch_size,
        auto_truncate: false,
        tokenization_workers: 1,
        default_instruction: text_rerank_core::templates::DEFAULT_INSTRUCTION.to_string(),
        version: env!("CARGO_PKG_VERSION"),
        sha: None,
        docker_label: None,
    }
}

/// Router backed by a fake model scoring `hello` tokens
pub fn fake_app(
    max_input_length: usize,
    max_client_batch_size: usize,
    api_key: Option<String>,
    cors_allow_origin: Option<Vec<String>>,
) -> Result<Router> {
    let tokenization = Tokenization::new(
        1,
        tokenizer(),
        max_input_length,
        Arc::new(Qwen3RerankerTemplate::default()),
    )?;
    let backend = Backend::from_backend(Box::new(HelloBackend));
    let infer = Infer::new(tokenization, 4, backend);

    // The recorder is not installed so that every test can build its own router
    let prom_handle = PrometheusBuilder::new().build_recorder().handle();

    app(
        infer,
        info(max_input_length, max_client_batch_size),
        prom_handle,
        2_000_000,
        api_key,
        cors_allow_origin,
    )
}

/// Serve the router on a random local port with a fake backend
pub async fn start_fake_server(
    max_input_length: usize,
    max_client_batch_size: usize,
    api_key: Option<String>,
) -> Result<SocketAddr> {
    let router = fake_app(max_input_length, max_client_batch_size, api_key, None)?;
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    tokio::spawn(async move { axum::serve(listener, router).await });

    Ok(addr)
}

async fn check_health(port: u16, timeout: Duration) -> Result<()> {
    let addr = format!("http://0.0.0.0:{port}/health");
    let client = reqwest::ClientBuilder::new()
        .timeout(timeout)
        .build()
        .unwrap();

    let start = Instant::now();
    loop {
        if client.get(&addr).send().await.is_ok() {
            return Ok(());
        }
        if start.elapsed() < timeout {
            tokio::time::sleep(Duration::from_secs(1)).await;
        } else {
            anyhow::bail!("Backend is not healthy");
        }
    }
}

/// Serve a real model on port 8090
pub async fn start_server(model_id: String, revision: Option<String>, dtype: DType) -> Result<()> {
    let server_task = tokio::spawn({
        run(
            model_id,
            revision,
            Some(1),
            Some(dtype),
            4,
            32,
            true,
            None,
            None,
            None,
            8090,
            None,
            2_000_000,
            None,
            None,
        )
    });

    tokio::select! {
        err = server_task => err?,
        _ = check_health(8090, Duration::from_secs(600)) => Ok(())
    }?;
    Ok(())
}
