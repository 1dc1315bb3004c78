use crate::layers::{apply_rotary, get_cos_sin, get_inv_freqs, HiddenAct, Linear, RMSNorm};
use crate::models::Model;
use candle::{DType, Device, IndexOp, Result, Tensor, D};
use candle_nn::{Embedding, Module, VarBuilder};
use serde::Deserialize;
use text_rerank_backend_core::{Batch, ScoringTokens};

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Qwen3Config {
    #[serde(default)]
    pub attention_bias: bool,
    pub vocab_size: usize,
    pub head_dim: Option<usize>,
    pub hidden_size: usize,
    pub intermediate_size: usize,
    pub num_hidden_layers: usize,
    pub num_attention_heads: usize,
    pub num_key_value_heads: usize,
    pub hidden_act: HiddenAct,
    pub max_position_embeddings: usize,
    pub rms_norm_eps: f32,
    pub rope_theta: f32,
    #[serde(default)]
    pub use_sliding_window: bool,
    #[serde(default)]
    pub tie_word_embeddings: bool,
}

impl Qwen3Config {
    fn attention_head_size(&self) -> usize {
        self.head_dim
            .unwrap_or(self.hidden_size / self.num_attention_heads)
    }
}

struct Qwen3Attention {
    q_proj: Linear,
    k_proj: Linear,
    v_proj: Linear,
    o_proj: Linear,
    q_norm: RMSNorm,
    k_norm: RMSNorm,

    num_attention_heads: usize,
    num_key_value_heads: usize,
    attention_head_size: usize,

    softmax_scale: f64,

    span: tracing::Span,
}

impl Qwen3Attention {
    pub fn load(vb: VarBuilder, config: &Qwen3Config) -> Result<Self> {
        if config.use_sliding_window {
            candle::bail!("Sliding window is not supported for Qwen3");
        }

        let num_attention_heads = config.num_attention_heads;
        let attention_head_size = config.attention_head_size();
        let num_key_value_heads = config.num_key_value_heads;
        let hidden_size = config.hidden_size;

        let projection = |name: &str, num_heads: usize| -> Result<Linear> {
            let weight = vb
                .pp(name)
                .get((num_heads * attention_head_size, hidden_size), "weight")?;
            let bias = if config.attention_bias {
                Some(vb.pp(name).get(num_heads * attention_head_size, "bias")?)
            } else {
                None
            };
            Ok(Linear::new(weight, bias, None))
        };

        let q_proj = projection("q_proj", num_attention_heads)?;
        let k_proj = projection("k_proj", num_key_value_heads)?;
        let v_proj = projection("v_proj", num_key_value_heads)?;

        let o_proj_weight = vb.pp("o_proj").get(
            (hidden_size, num_attention_heads * attention_head_size),
            "weight",
        )?;
        let o_proj = Linear::new(o_proj_weight, None, None);

        let q_norm = RMSNorm::load(vb.pp("q_norm"), attention_head_size, config.rms_norm_eps)?;
        let k_norm = RMSNorm::load(vb.pp("k_norm"), attention_head_size, config.rms_norm_eps)?;

        let softmax_scale = 1.0 / (attention_head_size as f64).sqrt();

        Ok(Self {
            q_proj,
            k_proj,
            v_proj,
            o_proj,
            q_norm,
            k_norm,
            num_attention_heads,
            num_key_value_heads,
            attention_head_size,
            softmax_scale,
            span: tracing::span!(tracing::Level::TRACE, "attention"),
        })
    }

    /// Repeat key/value heads to match the number of query heads (GQA)
    fn repeat_kv(&self, x: Tensor) -> Result<Tensor> {
        if self.num_key_value_heads == self.num_attention_heads {
            return Ok(x);
        }
        let repeat_factor = self.num_attention_heads / self.num_key_value_heads;
        let (b, h, s, d) = x.shape().dims4()?;
        x.unsqueeze(2)?
            .expand((b, h, repeat_factor, s, d))?
            .reshape((b, h * repeat_factor, s, d))
    }

    pub fn forward(
        &self,
        hidden_states: &Tensor,
        attention_bias: &Tensor,
        cos: &Tensor,
        sin: &Tensor,
    ) -> Result<Tensor> {
        let _enter = self.span.enter();

        let (batch_size, seq_len, _) = hidden_states.dims3()?;

        let q = self.q_proj.forward(hidden_states)?;
        let k = self.k_proj.forward(hidden_states)?;
        let v = self.v_proj.forward(hidden_states)?;

        // [batch, seq_len, heads, head_dim]
        let q = q.reshape((
            batch_size,
            seq_len,
            self.num_attention_heads,
            self.attention_head_size,
        ))?;
        let k = k.reshape((
            batch_size,
            seq_len,
            self.num_key_value_heads,
            self.attention_head_size,
        ))?;
        let v = v.reshape((
            batch_size,
            seq_len,
            self.num_key_value_heads,
            self.attention_head_size,
        ))?;

        let (q, _) = self.q_norm.forward(&q, None)?;
        let (k, _) = self.k_norm.forward(&k, None)?;

        let q = q.transpose(1, 2)?;
        let k = k.transpose(1, 2)?;
        let v = v.transpose(1, 2)?;

        let q = apply_rotary(&q, cos, sin, self.attention_head_size)?.contiguous()?;
        let k = apply_rotary(&k, cos, sin, self.attention_head_size)?;

        let k = self.repeat_kv(k)?.contiguous()?;
        let v = self.repeat_kv(v)?.contiguous()?;

        let attn_weights = (q.matmul(&k.t()?)? * self.softmax_scale)?;
        let attn_weights = attn_weights.broadcast_add(attention_bias)?;
        let attn_weights = candle_nn::ops::softmax_last_dim(&attn_weights)?;
        let context_layer = attn_weights.matmul(&v)?;

        let context_layer = context_layer.transpose(1, 2)?.flatten_from(D::Minus2)?;

        self.o_proj.forward(&context_layer)
    }
}

struct Qwen3MLP {
    gate_up_proj: Linear,
    down_proj: Linear,

    activation: HiddenAct,
    intermediate_size: usize,

    span: tracing::Span,
}

impl Qwen3MLP {
    pub fn load(vb: VarBuilder, config: &Qwen3Config) -> Result<Self> {
        let intermediate_size = config.intermediate_size;

        let gate_proj_weight = vb
            .pp("gate_proj")
            .get((intermediate_size, config.hidden_size), "weight")?;

        let up_proj_weight = vb
            .pp("up_proj")
            .get((intermediate_size, config.hidden_size), "weight")?;

        let gate_up_proj_weight = Tensor::cat(&[&gate_proj_weight, &up_proj_weight], 0)?;
        let gate_up_proj = Linear::new(gate_up_proj_weight, None, None);

        let down_proj_weight = vb
            .pp("down_proj")
            .get((config.hidden_size, intermediate_size), "weight")?;
        let down_proj = Linear::new(down_proj_weight, None, None);

        Ok(Self {
            gate_up_proj,
            down_proj,
            activation: config.hidden_act.clone(),
            intermediate_size,
            span: tracing::span!(tracing::Level::TRACE, "mlp"),
        })
    }

    pub fn forward(&self, hidden_states: &Tensor) -> Result<Tensor> {
        let _enter = self.span.enter();

        let gate_up_states = self.gate_up_proj.forward(hidden_states)?;
        let gate_states = gate_up_states.narrow(D::Minus1, 0, self.intermediate_size)?;
        let up_states =
            gate_up_states.narrow(D::Minus1, self.intermediate_size, self.intermediate_size)?;

        let gate_states = self.activation.forward(&gate_states)?;
        self.down_proj.forward(&(gate_states * up_states)?)
    }
}

struct Qwen3Layer {
    attention: Qwen3Attention,
    mlp: Qwen3MLP,
    input_layer_norm: RMSNorm,
    post_attention_layer_norm: RMSNorm,

    span: tracing::Span,
}

impl Qwen3Layer {
    pub fn load(vb: VarBuilder, config: &Qwen3Config) -> Result<Self> {
        let attention = Qwen3Attention::load(vb.pp("self_attn"), config)?;
        let mlp = Qwen3MLP::load(vb.pp("mlp"), config)?;

        let input_layer_norm = RMSNorm::load(
            vb.pp("input_layernorm"),
            config.hidden_size,
            config.rms_norm_eps,
        )?;
        let post_attention_layer_norm = RMSNorm::load(
            vb.pp("post_attention_layernorm"),
            config.hidden_size,
            config.rms_norm_eps,
        )?;

        Ok(Self {
            attention,
            mlp,
            input_layer_norm,
            post_attention_layer_norm,
            span: tracing::span!(tracing::Level::TRACE, "layer"),
        })
    }

    pub fn forward(
        &self,
        hidden_states: &Tensor,
        attention_bias: &Tensor,
        cos: &Tensor,
        sin: &Tensor,
    ) -> Result<Tensor> {
        let _enter = self.span.enter();

        let (normed_hidden_states, residual) =
            self.input_layer_norm.forward(hidden_states, None)?;

        let attn_output =
            self.attention
                .forward(&normed_hidden_states, attention_bias, cos, sin)?;

        let (normed_attn_res_output, attn_res) = self
            .post_attention_layer_norm
            .forward(&attn_output, Some(&residual))?;

        let mlp_output = self.mlp.forward(&normed_attn_res_output)?;

        &mlp_output + &attn_res
    }
}

/// The two rows of the LM head that produce the `no` and `yes` logits, in that order
pub struct ScoringHead {
    projection: Linear,
    span: tracing::Span,
}

impl ScoringHead {
    pub fn new(lm_head_weight: &Tensor, scoring_tokens: ScoringTokens) -> Result<Self> {
        let vocab_size = lm_head_weight.dim(0)?;
        for id in [scoring_tokens.no, scoring_tokens.yes] {
            if id as usize >= vocab_size {
                candle::bail!("token id {id} is out of the vocabulary range (size {vocab_size})");
            }
        }

        let ids = Tensor::new(
            &[scoring_tokens.no, scoring_tokens.yes],
            lm_head_weight.device(),
        )?;
        let weight = lm_head_weight.index_select(&ids, 0)?;

        Ok(Self {
            projection: Linear::new(weight, None, None),
            span: tracing::span!(tracing::Level::TRACE, "scoring_head"),
        })
    }

    /// `[n, hidden]` -> `[n, 2]` f32 logits
    pub fn forward(&self, hidden_states: &Tensor) -> Result<Tensor> {
        let _enter = self.span.enter();
        self.projection.forward(hidden_states)?.to_dtype(DType::F32)
    }
}

pub struct Qwen3Model {
    embeddings: Embedding,
    layers: Vec<Qwen3Layer>,
    norm: RMSNorm,
    rotary_cache: (Tensor, Tensor),
    rotary_dim: usize,
    scoring_head: ScoringHead,

    dtype: DType,
    device: Device,

    span: tracing::Span,
}

impl Qwen3Model {
    pub fn load(
        vb: VarBuilder,
        config: &Qwen3Config,
        scoring_tokens: ScoringTokens,
    ) -> Result<Self> {
        // Causal LM checkpoints nest the decoder under `model` and keep `lm_head` at the root
        let lm_head_vb = vb.clone();
        let vb = if vb.contains_tensor("model.embed_tokens.weight") {
            vb.pp("model")
        } else {
            vb
        };

        let embed_weight = vb
            .pp("embed_tokens")
            .get((config.vocab_size, config.hidden_size), "weight")?;

        let scoring_head = if !config.tie_word_embeddings
            && lm_head_vb.contains_tensor("lm_head.weight")
        {
            let lm_head_weight = lm_head_vb
                .pp("lm_head")
                .get((config.vocab_size, config.hidden_size), "weight")?;
            ScoringHead::new(&lm_head_weight, scoring_tokens)?
        } else {
            ScoringHead::new(&embed_weight, scoring_tokens)?
        };

        let embeddings = Embedding::new(embed_weight, config.hidden_size);

        let layers = (0..config.num_hidden_layers)
            .map(|index| Qwen3Layer::load(vb.pp(format!("layers.{index}")), config))
            .collect::<Result<Vec<_>>>()?;

        let norm = RMSNorm::load(vb.pp("norm"), config.hidden_size, config.rms_norm_eps)?;

        let rotary_dim = config.attention_head_size();
        let inv_freqs = get_inv_freqs(rotary_dim, config.rope_theta, vb.device())?;
        let rotary_cache = get_cos_sin(config.max_position_embeddings, &inv_freqs, vb.dtype())?;

        Ok(Self {
            embeddings,
            layers,
            norm,
            rotary_cache,
            rotary_dim,
            scoring_head,
            dtype: vb.dtype(),
            device: vb.device().clone(),
            span: tracing::span!(tracing::Level::TRACE, "model"),
        })
    }

    fn get_causal_attention_bias(&self, seq_len: usize) -> Result<Tensor> {
        let min_value = match self.dtype {
            DType::F32 => f32::MIN,
            _ => -65504.0, // f16 minimum value
        };

        let mask: Vec<f32> = (0..seq_len)
            .flat_map(|i| (0..seq_len).map(move |j| if j > i { min_value } else { 0.0 }))
            .collect();

        Tensor::from_vec(mask, (1, 1, seq_len, seq_len), &self.device)?.to_dtype(self.dtype)
    }

    /// Runs one sequence through the decoder and returns the `[1, 2]` (`no`, `yes`) logits of
    /// its last position.
    pub fn forward(&self, input_ids: &[u32], position_ids: &[u32]) -> Result<Tensor> {
        let _enter = self.span.enter();

        let seq_len = input_ids.len();
        if seq_len == 0 {
            candle::bail!("cannot run the model on an empty sequence");
        }

        let input_ids = Tensor::from_slice(input_ids, (1, seq_len), &self.device)?;
        let position_ids = Tensor::from_slice(position_ids, seq_len, &self.device)?;

        let attention_bias = self.get_causal_attention_bias(seq_len)?;

        let cos = self
            .rotary_cache
            .0
            .index_select(&position_ids, 0)?
            .reshape((1, 1, seq_len, self.rotary_dim))?;
        let sin = self
            .rotary_cache
            .1
            .index_select(&position_ids, 0)?
            .reshape((1, 1, seq_len, self.rotary_dim))?;

        let mut hidden_states = self.embeddings.forward(&input_ids)?;
        for layer in &self.layers {
            hidden_states = layer.forward(&hidden_states, &attention_bias, &cos, &sin)?;
        }

        let (outputs, _) = self.norm.forward(&hidden_states, None)?;
        let last_hidden_state = outputs.i((.., seq_len - 1, ..))?;

        self.scoring_head.forward(&last_hidden_state)
    }
}

impl Model for Qwen3Model {
    fn predict(&self, batch: Batch) -> Result<Tensor> {
        let mut logits = Vec::with_capacity(batch.len());
        for i in 0..batch.len() {
            let start = batch.cumulative_seq_lengths[i] as usize;
            let end = batch.cumulative_seq_lengths[i + 1] as usize;
            logits.push(self.forward(
                &batch.input_ids[start..end],
                &batch.position_ids[start..end],
            )?);
        }
        let logits = Tensor::cat(&logits, 0)?;
        candle_nn::ops::softmax_last_dim(&logits)
    }
}
