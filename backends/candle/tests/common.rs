use anyhow::Result;
use hf_hub::api::sync::ApiBuilder;
use hf_hub::{Repo, RepoType};
use std::path::{Path, PathBuf};
use text_rerank_backend_core::{Batch, ScoringTokens};
use tokenizers::{Encoding, Tokenizer};

pub const PREFIX: &str = "<|im_start|>system\nJudge whether the Document meets the requirements based on the Query and the Instruct provided. Answer only \"yes\" or \"no\".<|im_end|>\n<|im_start|>user\n";
pub const SUFFIX: &str = "<|im_end|>\n<|im_start|>assistant\n<think>\n\n</think>\n\n";
pub const INSTRUCTION: &str =
    "Given a web search query, retrieve relevant passages that answer the query";

pub fn format_input(query: &str, document: &str) -> String {
    format!("{PREFIX}<Instruct>: {INSTRUCTION}\n<Query>: {query}\n<Document>: {document}{SUFFIX}")
}

pub fn is_close(a: f32, b: f32, abs_tol: f32) -> bool {
    is_close::default().abs_tol(abs_tol).is_close(a, b)
}

pub fn download_artifacts(
    model_id: &'static str,
    revision: Option<&'static str>,
) -> Result<PathBuf> {
    let mut builder = ApiBuilder::new().with_progress(false);

    if let Some(cache_dir) = std::env::var_os("HUGGINGFACE_HUB_CACHE") {
        builder = builder.with_cache_dir(cache_dir.into());
    }

    let api = builder.build()?;
    let api_repo = if let Some(revision) = revision {
        api.repo(Repo::with_revision(
            model_id.to_string(),
            RepoType::Model,
            revision.to_string(),
        ))
    } else {
        api.repo(Repo::new(model_id.to_string(), RepoType::Model))
    };

    api_repo.get("config.json")?;
    api_repo.get("tokenizer.json")?;
    let weights = api_repo.get("model.safetensors")?;

    Ok(weights.parent().unwrap().to_path_buf())
}

pub fn load_tokenizer(model_root: &Path) -> Result<Tokenizer> {
    let mut tokenizer = Tokenizer::from_file(model_root.join("tokenizer.json"))
        .map_err(|err| anyhow::anyhow!(err))?;
    tokenizer.with_padding(None);
    tokenizer.with_truncation(None).map_err(|err| anyhow::anyhow!(err))?;
    Ok(tokenizer)
}

pub fn scoring_tokens(tokenizer: &Tokenizer) -> ScoringTokens {
    ScoringTokens {
        no: tokenizer.token_to_id("no").unwrap(),
        yes: tokenizer.token_to_id("yes").unwrap(),
    }
}

pub fn batch(encodings: Vec<Encoding>) -> Batch {
    let mut input_ids = Vec::new();
    let mut position_ids = Vec::new();
    let mut cumulative_seq_lengths = Vec::with_capacity(encodings.len() + 1);
    cumulative_seq_lengths.push(0);

    let mut max_length = 0;
    let mut cumulative_length = 0;

    for encoding in encodings.iter() {
        let encoding_length = encoding.len() as u32;
        input_ids.extend(encoding.get_ids().to_vec());
        position_ids.extend(0..encoding_length);
        cumulative_length += encoding_length;
        cumulative_seq_lengths.push(cumulative_length);
        max_length = max_length.max(encoding_length);
    }

    Batch {
        input_ids,
        position_ids,
        cumulative_seq_lengths,
        max_length,
    }
}
