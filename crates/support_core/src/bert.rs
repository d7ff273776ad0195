//! BERT encoder shared by the sentence embedder and the toxicity classifier.
//!
//! Checkpoints come either bare (`embeddings.*`, `encoder.*`, as exported by
//! sentence-transformers) or wrapped by a task head (`bert.embeddings.*` next
//! to `classifier.*`). [`BertEncoder::load`] handles both layouts.

use crate::error::{require_file, Result, SupportError};
use candle_core::{DType, Device, Module, Tensor, D};
use candle_nn::{Linear, VarBuilder};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

// ---------------------------------------------------------------------------
// Config (config.json)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct BertConfig {
    pub hidden_size: usize,
    pub intermediate_size: usize,
    pub num_attention_heads: usize,
    pub num_hidden_layers: usize,
    pub vocab_size: usize,
    pub max_position_embeddings: usize,
    #[serde(default = "default_type_vocab_size")]
    pub type_vocab_size: usize,
    #[serde(default = "default_layer_norm_eps")]
    pub layer_norm_eps: f64,
    #[serde(default)]
    pub id2label: BTreeMap<String, String>,
}

fn default_type_vocab_size() -> usize {
    2
}

fn default_layer_norm_eps() -> f64 {
    1e-12
}

impl BertConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(raw)?;
        if config.num_attention_heads == 0 || config.hidden_size % config.num_attention_heads != 0
        {
            return Err(SupportError::invalid(format!(
                "hidden_size {} is not divisible by {} attention heads",
                config.hidden_size, config.num_attention_heads
            )));
        }
        Ok(config)
    }

    pub fn head_dim(&self) -> usize {
        self.hidden_size / self.num_attention_heads
    }

    /// Class labels ordered by index. Missing indices are an error.
    pub fn labels(&self) -> Result<Vec<String>> {
        let mut labels = vec![None; self.id2label.len()];
        for (idx, label) in &self.id2label {
            let i: usize = idx
                .parse()
                .map_err(|_| SupportError::invalid(format!("id2label key {idx:?} is not an index")))?;
            let slot = labels
                .get_mut(i)
                .ok_or_else(|| SupportError::invalid(format!("id2label index {i} out of range")))?;
            *slot = Some(label.clone());
        }
        labels
            .into_iter()
            .map(|l| l.ok_or_else(|| SupportError::invalid("id2label has gaps")))
            .collect()
    }
}

/// `config.json` + `tokenizer.json` + `model.safetensors` in one directory.
#[derive(Debug, Clone)]
pub struct ModelFiles {
    pub config: PathBuf,
    pub tokenizer: PathBuf,
    pub weights: PathBuf,
}

impl ModelFiles {
    pub fn in_dir(dir: &Path) -> Result<Self> {
        Ok(Self {
            config: require_file("model config", dir.join("config.json"))?,
            tokenizer: require_file("tokenizer", dir.join("tokenizer.json"))?,
            weights: require_file("model weights", dir.join("model.safetensors"))?,
        })
    }

    pub fn load_tokenizer(&self) -> Result<tokenizers::Tokenizer> {
        tokenizers::Tokenizer::from_file(&self.tokenizer).map_err(SupportError::tokenizer)
    }

    /// Memory-maps the safetensors weights as f32 on `device`.
    pub fn var_builder(&self, device: &Device) -> Result<VarBuilder<'static>> {
        // SAFETY: weights are opened read-only and never written while mapped.
        let vb = unsafe {
            VarBuilder::from_mmaped_safetensors(&[self.weights.as_path()], DType::F32, device)?
        };
        Ok(vb)
    }
}

// ---------------------------------------------------------------------------
// Layer norm (with bias)
// ---------------------------------------------------------------------------

struct LayerNorm {
    weight: Tensor,
    bias: Tensor,
    eps: f64,
}

impl LayerNorm {
    fn load(vb: VarBuilder, hidden_size: usize, eps: f64) -> Result<Self> {
        let weight = vb.get(hidden_size, "weight")?;
        let bias = vb.get(hidden_size, "bias")?;
        Ok(Self { weight, bias, eps })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let mean = x.mean_keepdim(D::Minus1)?;
        let diff = x.broadcast_sub(&mean)?;
        let var = diff.sqr()?.mean_keepdim(D::Minus1)?;
        let std = (var + self.eps)?.sqrt()?;
        let out = diff
            .broadcast_div(&std)?
            .broadcast_mul(&self.weight)?
            .broadcast_add(&self.bias)?;
        Ok(out)
    }
}

// ---------------------------------------------------------------------------
// Self-attention + FFN, post-norm
// ---------------------------------------------------------------------------

struct SelfAttention {
    query: Linear,
    key: Linear,
    value: Linear,
    output: Linear,
    output_norm: LayerNorm,
    num_heads: usize,
    head_dim: usize,
}

impl SelfAttention {
    fn load(vb: VarBuilder, config: &BertConfig) -> Result<Self> {
        let h = config.hidden_size;
        let vb = vb.pp("attention");
        Ok(Self {
            query: candle_nn::linear(h, h, vb.pp("self").pp("query"))?,
            key: candle_nn::linear(h, h, vb.pp("self").pp("key"))?,
            value: candle_nn::linear(h, h, vb.pp("self").pp("value"))?,
            output: candle_nn::linear(h, h, vb.pp("output").pp("dense"))?,
            output_norm: LayerNorm::load(
                vb.pp("output").pp("LayerNorm"),
                h,
                config.layer_norm_eps,
            )?,
            num_heads: config.num_attention_heads,
            head_dim: config.head_dim(),
        })
    }

    fn split_heads(&self, x: Tensor, batch: usize, seq_len: usize) -> Result<Tensor> {
        Ok(x
            .reshape((batch, seq_len, self.num_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?)
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let (batch, seq_len, _) = x.dims3()?;
        let q = self.split_heads(self.query.forward(x)?, batch, seq_len)?;
        let k = self.split_heads(self.key.forward(x)?, batch, seq_len)?;
        let v = self.split_heads(self.value.forward(x)?, batch, seq_len)?;

        let scale = 1.0 / (self.head_dim as f64).sqrt();
        let weights = q.matmul(&k.t()?)?.affine(scale, 0.0)?;
        let weights = candle_nn::ops::softmax(&weights, D::Minus1)?;
        let attn = weights
            .matmul(&v)?
            .transpose(1, 2)?
            .contiguous()?
            .reshape((batch, seq_len, self.num_heads * self.head_dim))?;

        let out = self.output.forward(&attn)?;
        self.output_norm.forward(&(x + out)?)
    }
}

struct FeedForward {
    up: Linear,
    down: Linear,
    output_norm: LayerNorm,
}

impl FeedForward {
    fn load(vb: VarBuilder, config: &BertConfig) -> Result<Self> {
        Ok(Self {
            up: candle_nn::linear(
                config.hidden_size,
                config.intermediate_size,
                vb.pp("intermediate").pp("dense"),
            )?,
            down: candle_nn::linear(
                config.intermediate_size,
                config.hidden_size,
                vb.pp("output").pp("dense"),
            )?,
            output_norm: LayerNorm::load(
                vb.pp("output").pp("LayerNorm"),
                config.hidden_size,
                config.layer_norm_eps,
            )?,
        })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let h = self.up.forward(x)?.gelu_erf()?;
        let h = self.down.forward(&h)?;
        self.output_norm.forward(&(x + h)?)
    }
}

struct EncoderLayer {
    attention: SelfAttention,
    ffn: FeedForward,
}

impl EncoderLayer {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let x = self.attention.forward(x)?;
        self.ffn.forward(&x)
    }
}

// ---------------------------------------------------------------------------
// Encoder
// ---------------------------------------------------------------------------

pub struct BertEncoder {
    word_embeddings: Tensor,
    position_embeddings: Tensor,
    token_type_embeddings: Tensor,
    embedding_norm: LayerNorm,
    layers: Vec<EncoderLayer>,
    max_positions: usize,
}

impl BertEncoder {
    /// Loads the encoder, looking under `bert.` when the checkpoint carries a
    /// task head.
    pub fn load(vb: VarBuilder, config: &BertConfig) -> Result<Self> {
        let vb = if vb.contains_tensor("bert.embeddings.word_embeddings.weight") {
            vb.pp("bert")
        } else {
            vb
        };

        let emb = vb.pp("embeddings");
        let h = config.hidden_size;
        let word_embeddings = emb
            .pp("word_embeddings")
            .get((config.vocab_size, h), "weight")?;
        let position_embeddings = emb
            .pp("position_embeddings")
            .get((config.max_position_embeddings, h), "weight")?;
        let token_type_embeddings = emb
            .pp("token_type_embeddings")
            .get((config.type_vocab_size, h), "weight")?;
        let embedding_norm = LayerNorm::load(emb.pp("LayerNorm"), h, config.layer_norm_eps)?;

        let layers = (0..config.num_hidden_layers)
            .map(|i| {
                let lvb = vb.pp("encoder").pp("layer").pp(i.to_string());
                Ok(EncoderLayer {
                    attention: SelfAttention::load(lvb.clone(), config)?,
                    ffn: FeedForward::load(lvb, config)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            word_embeddings,
            position_embeddings,
            token_type_embeddings,
            embedding_norm,
            layers,
            max_positions: config.max_position_embeddings,
        })
    }

    /// Hidden states for one sequence, shape `(1, seq_len, hidden)`.
    /// Sequences longer than the position table are cut.
    pub fn forward(&self, token_ids: &[u32]) -> Result<Tensor> {
        if token_ids.is_empty() {
            return Err(SupportError::invalid("cannot encode an empty token sequence"));
        }
        let token_ids = &token_ids[..token_ids.len().min(self.max_positions)];
        let device = self.word_embeddings.device();
        let seq_len = token_ids.len();

        let ids = Tensor::new(token_ids, device)?;
        let positions: Vec<u32> = (0..seq_len as u32).collect();
        let positions = Tensor::new(positions.as_slice(), device)?;
        let types = Tensor::zeros(seq_len, DType::U32, device)?;

        let hidden = ((self.word_embeddings.index_select(&ids, 0)?
            + self.position_embeddings.index_select(&positions, 0)?)?
            + self.token_type_embeddings.index_select(&types, 0)?)?;
        let mut hidden = self.embedding_norm.forward(&hidden)?.unsqueeze(0)?;

        for layer in &self.layers {
            hidden = layer.forward(&hidden)?;
        }
        Ok(hidden)
    }
}

/// Mean over the sequence axis followed by L2 normalisation.
pub fn mean_pool_normalized(hidden: &Tensor) -> Result<Vec<f32>> {
    let pooled = hidden.mean(1)?.squeeze(0)?;
    let norm: f32 = pooled.sqr()?.sum_all()?.sqrt()?.to_scalar()?;
    let pooled = if norm > 0.0 {
        pooled.affine(1.0 / norm as f64, 0.0)?
    } else {
        pooled
    };
    Ok(pooled.to_vec1::<f32>()?)
}
