//! T5 encoder-decoder (flan-t5 checkpoints) on candle.
//!
//! No KV cache: every decoding step re-runs the decoder over the full prefix.
//! Replies are short and the process is single-user, so the quadratic cost
//! stays small next to the encoder pass.

use crate::error::{Result, SupportError};
use candle_core::{Device, Module, Tensor};
use candle_nn::{Embedding, Linear, RmsNorm, VarBuilder};
use serde::Deserialize;
use std::path::Path;

// ---------------------------------------------------------------------------
// Config (config.json)
// ---------------------------------------------------------------------------

fn default_num_buckets() -> usize {
    32
}

fn default_max_distance() -> usize {
    128
}

fn default_eps() -> f64 {
    1e-6
}

fn default_ff_proj() -> String {
    "relu".to_string()
}

fn default_true() -> bool {
    true
}

fn default_eos() -> u32 {
    1
}

#[derive(Debug, Clone, Deserialize)]
pub struct T5Config {
    pub vocab_size: usize,
    pub d_model: usize,
    pub d_kv: usize,
    pub d_ff: usize,
    pub num_layers: usize,
    #[serde(default)]
    pub num_decoder_layers: Option<usize>,
    pub num_heads: usize,
    #[serde(default = "default_num_buckets")]
    pub relative_attention_num_buckets: usize,
    #[serde(default = "default_max_distance")]
    pub relative_attention_max_distance: usize,
    #[serde(default = "default_eps")]
    pub layer_norm_epsilon: f64,
    #[serde(default = "default_ff_proj")]
    pub feed_forward_proj: String,
    #[serde(default = "default_true")]
    pub tie_word_embeddings: bool,
    #[serde(default)]
    pub decoder_start_token_id: u32,
    #[serde(default = "default_eos")]
    pub eos_token_id: u32,
}

impl T5Config {
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(raw)?;
        FeedForwardKind::parse(&config.feed_forward_proj)?;
        Ok(config)
    }

    fn decoder_layers(&self) -> usize {
        self.num_decoder_layers.unwrap_or(self.num_layers)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FeedForwardKind {
    Relu,
    GatedGelu,
}

impl FeedForwardKind {
    fn parse(proj: &str) -> Result<Self> {
        match proj {
            "relu" => Ok(Self::Relu),
            "gated-gelu" => Ok(Self::GatedGelu),
            other => Err(SupportError::invalid(format!(
                "unsupported feed_forward_proj {other:?}"
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// Relative position buckets
// ---------------------------------------------------------------------------

/// Maps `key_pos - query_pos` to a bias bucket. Half the buckets are exact
/// offsets, the rest grow logarithmically up to `max_distance`.
pub fn relative_position_bucket(
    relative_position: i64,
    bidirectional: bool,
    num_buckets: usize,
    max_distance: usize,
) -> u32 {
    let mut num_buckets = num_buckets as i64;
    let mut bucket = 0i64;
    let n = if bidirectional {
        num_buckets /= 2;
        if relative_position > 0 {
            bucket += num_buckets;
        }
        relative_position.abs()
    } else {
        (-relative_position).max(0)
    };

    let max_exact = num_buckets / 2;
    if n < max_exact {
        bucket += n;
    } else {
        let scaled = (n as f64 / max_exact as f64).ln()
            / (max_distance as f64 / max_exact as f64).ln()
            * (num_buckets - max_exact) as f64;
        let large = max_exact + scaled as i64;
        bucket += large.min(num_buckets - 1);
    }
    bucket as u32
}

// ---------------------------------------------------------------------------
// Attention
// ---------------------------------------------------------------------------

struct Attention {
    q: Linear,
    k: Linear,
    v: Linear,
    o: Linear,
    num_heads: usize,
    d_kv: usize,
    /// `(num_buckets, num_heads)`, present on the first block only.
    relative_bias: Option<Tensor>,
    causal: bool,
    num_buckets: usize,
    max_distance: usize,
}

impl Attention {
    fn load(vb: VarBuilder, config: &T5Config, has_bias: bool, causal: bool) -> Result<Self> {
        let inner = config.num_heads * config.d_kv;
        let relative_bias = if has_bias {
            let table = candle_nn::embedding(
                config.relative_attention_num_buckets,
                config.num_heads,
                vb.pp("relative_attention_bias"),
            )?;
            Some(table.embeddings().clone())
        } else {
            None
        };
        Ok(Self {
            q: candle_nn::linear_no_bias(config.d_model, inner, vb.pp("q"))?,
            k: candle_nn::linear_no_bias(config.d_model, inner, vb.pp("k"))?,
            v: candle_nn::linear_no_bias(config.d_model, inner, vb.pp("v"))?,
            o: candle_nn::linear_no_bias(inner, config.d_model, vb.pp("o"))?,
            num_heads: config.num_heads,
            d_kv: config.d_kv,
            relative_bias,
            causal,
            num_buckets: config.relative_attention_num_buckets,
            max_distance: config.relative_attention_max_distance,
        })
    }

    fn split_heads(&self, x: Tensor, len: usize) -> Result<Tensor> {
        Ok(x.reshape((1, len, self.num_heads, self.d_kv))?
            .transpose(1, 2)?
            .contiguous()?)
    }

    /// `(1, heads, q_len, k_len)` position bias, with the causal mask folded in.
    fn position_bias(&self, q_len: usize, k_len: usize, device: &Device) -> Result<Option<Tensor>> {
        let mut bias = match &self.relative_bias {
            Some(table) => {
                let buckets: Vec<u32> = (0..q_len)
                    .flat_map(|i| {
                        (0..k_len).map(move |j| {
                            relative_position_bucket(
                                j as i64 - i as i64,
                                !self.causal,
                                self.num_buckets,
                                self.max_distance,
                            )
                        })
                    })
                    .collect();
                let buckets = Tensor::from_vec(buckets, q_len * k_len, device)?;
                Some(
                    table
                        .index_select(&buckets, 0)?
                        .reshape((q_len, k_len, self.num_heads))?
                        .permute((2, 0, 1))?
                        .unsqueeze(0)?,
                )
            }
            None => None,
        };

        if self.causal {
            let mask: Vec<f32> = (0..q_len)
                .flat_map(|i| (0..k_len).map(move |j| if j > i { f32::NEG_INFINITY } else { 0.0 }))
                .collect();
            let mask = Tensor::from_vec(mask, (1, 1, q_len, k_len), device)?;
            bias = Some(match bias {
                Some(b) => b.broadcast_add(&mask)?,
                None => mask,
            });
        }
        Ok(bias)
    }

    /// Self-attention when `kv` is `None`, cross-attention otherwise. Returns
    /// the bias it used so later blocks can reuse it.
    fn forward(
        &self,
        x: &Tensor,
        kv: Option<&Tensor>,
        bias: Option<&Tensor>,
    ) -> Result<(Tensor, Option<Tensor>)> {
        let (_, q_len, _) = x.dims3()?;
        let src = kv.unwrap_or(x);
        let k_len = src.dim(1)?;

        let q = self.split_heads(self.q.forward(x)?, q_len)?;
        let k = self.split_heads(self.k.forward(src)?, k_len)?;
        let v = self.split_heads(self.v.forward(src)?, k_len)?;

        let bias = match bias {
            Some(b) => Some(b.clone()),
            None if kv.is_none() => self.position_bias(q_len, k_len, x.device())?,
            None => None,
        };

        // T5 folds the 1/sqrt(d) scale into its weights.
        let mut scores = q.matmul(&k.t()?)?;
        if let Some(b) = &bias {
            scores = scores.broadcast_add(b)?;
        }
        let weights = candle_nn::ops::softmax_last_dim(&scores)?;
        let out = weights
            .matmul(&v)?
            .transpose(1, 2)?
            .contiguous()?
            .reshape((1, q_len, self.num_heads * self.d_kv))?;
        Ok((self.o.forward(&out)?, bias))
    }
}

// ---------------------------------------------------------------------------
// Feed forward
// ---------------------------------------------------------------------------

enum FeedForward {
    Relu { wi: Linear, wo: Linear },
    GatedGelu { wi_0: Linear, wi_1: Linear, wo: Linear },
}

impl FeedForward {
    fn load(vb: VarBuilder, config: &T5Config) -> Result<Self> {
        let (d, ff) = (config.d_model, config.d_ff);
        let wo = candle_nn::linear_no_bias(ff, d, vb.pp("wo"))?;
        Ok(match FeedForwardKind::parse(&config.feed_forward_proj)? {
            FeedForwardKind::Relu => Self::Relu {
                wi: candle_nn::linear_no_bias(d, ff, vb.pp("wi"))?,
                wo,
            },
            FeedForwardKind::GatedGelu => Self::GatedGelu {
                wi_0: candle_nn::linear_no_bias(d, ff, vb.pp("wi_0"))?,
                wi_1: candle_nn::linear_no_bias(d, ff, vb.pp("wi_1"))?,
                wo,
            },
        })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let out = match self {
            Self::Relu { wi, wo } => wo.forward(&wi.forward(x)?.relu()?)?,
            Self::GatedGelu { wi_0, wi_1, wo } => {
                // tanh-approximated gelu
                let gate = wi_0.forward(x)?.gelu()?;
                wo.forward(&(gate * wi_1.forward(x)?)?)?
            }
        };
        Ok(out)
    }
}

// ---------------------------------------------------------------------------
// Blocks and stacks (pre-norm)
// ---------------------------------------------------------------------------

struct CrossAttention {
    norm: RmsNorm,
    attn: Attention,
}

struct Block {
    self_norm: RmsNorm,
    self_attn: Attention,
    cross: Option<CrossAttention>,
    ff_norm: RmsNorm,
    ff: FeedForward,
}

impl Block {
    fn load(vb: VarBuilder, config: &T5Config, first: bool, decoder: bool) -> Result<Self> {
        let eps = config.layer_norm_epsilon;
        let d = config.d_model;
        let self_vb = vb.pp("layer").pp("0");
        let self_norm = candle_nn::rms_norm(d, eps, self_vb.pp("layer_norm"))?;
        let self_attn = Attention::load(self_vb.pp("SelfAttention"), config, first, decoder)?;

        let (cross, ff_idx) = if decoder {
            let cvb = vb.pp("layer").pp("1");
            let cross = CrossAttention {
                norm: candle_nn::rms_norm(d, eps, cvb.pp("layer_norm"))?,
                attn: Attention::load(cvb.pp("EncDecAttention"), config, false, false)?,
            };
            (Some(cross), "2")
        } else {
            (None, "1")
        };

        let ff_vb = vb.pp("layer").pp(ff_idx);
        Ok(Self {
            self_norm,
            self_attn,
            cross,
            ff_norm: candle_nn::rms_norm(d, eps, ff_vb.pp("layer_norm"))?,
            ff: FeedForward::load(ff_vb.pp("DenseReluDense"), config)?,
        })
    }

    fn forward(
        &self,
        x: &Tensor,
        bias: Option<&Tensor>,
        encoder_out: Option<&Tensor>,
    ) -> Result<(Tensor, Option<Tensor>)> {
        let (attn, bias) = self.self_attn.forward(&self.self_norm.forward(x)?, None, bias)?;
        let mut x = (x + attn)?;

        if let Some(cross) = &self.cross {
            let enc = encoder_out
                .ok_or_else(|| SupportError::invalid("decoder block needs encoder output"))?;
            let (attn, _) = cross.attn.forward(&cross.norm.forward(&x)?, Some(enc), None)?;
            x = (x + attn)?;
        }

        let ff = self.ff.forward(&self.ff_norm.forward(&x)?)?;
        Ok(((x + ff)?, bias))
    }
}

struct Stack {
    blocks: Vec<Block>,
    final_norm: RmsNorm,
}

impl Stack {
    fn load(vb: VarBuilder, config: &T5Config, decoder: bool) -> Result<Self> {
        let layers = if decoder {
            config.decoder_layers()
        } else {
            config.num_layers
        };
        let blocks = (0..layers)
            .map(|i| Block::load(vb.pp("block").pp(i.to_string()), config, i == 0, decoder))
            .collect::<Result<Vec<_>>>()?;
        let final_norm = candle_nn::rms_norm(
            config.d_model,
            config.layer_norm_epsilon,
            vb.pp("final_layer_norm"),
        )?;
        Ok(Self { blocks, final_norm })
    }

    fn forward(&self, embedded: Tensor, encoder_out: Option<&Tensor>) -> Result<Tensor> {
        let mut hidden = embedded;
        let mut bias: Option<Tensor> = None;
        for block in &self.blocks {
            let (h, b) = block.forward(&hidden, bias.as_ref(), encoder_out)?;
            hidden = h;
            if bias.is_none() {
                bias = b;
            }
        }
        Ok(self.final_norm.forward(&hidden)?)
    }
}

// ---------------------------------------------------------------------------
// Model
// ---------------------------------------------------------------------------

pub struct T5Model {
    shared: Embedding,
    encoder: Stack,
    decoder: Stack,
    lm_head: Linear,
    /// `d_model^-0.5` rescale applied before a tied LM head.
    lm_scale: Option<f64>,
    config: T5Config,
    device: Device,
}

impl T5Model {
    pub fn load(vb: VarBuilder, config: T5Config) -> Result<Self> {
        let device = vb.device().clone();
        let shared = candle_nn::embedding(config.vocab_size, config.d_model, vb.pp("shared"))?;
        let encoder = Stack::load(vb.pp("encoder"), &config, false)?;
        let decoder = Stack::load(vb.pp("decoder"), &config, true)?;

        let (lm_head, lm_scale) = if config.tie_word_embeddings {
            (
                Linear::new(shared.embeddings().clone(), None),
                Some((config.d_model as f64).powf(-0.5)),
            )
        } else {
            (
                candle_nn::linear_no_bias(config.d_model, config.vocab_size, vb.pp("lm_head"))?,
                None,
            )
        };

        Ok(Self {
            shared,
            encoder,
            decoder,
            lm_head,
            lm_scale,
            config,
            device,
        })
    }

    pub fn config(&self) -> &T5Config {
        &self.config
    }

    /// Encoder hidden states, `(1, len, d_model)`.
    pub fn encode(&self, input_ids: &[u32]) -> Result<Tensor> {
        if input_ids.is_empty() {
            return Err(SupportError::invalid("cannot encode an empty prompt"));
        }
        let ids = Tensor::new(input_ids, &self.device)?.unsqueeze(0)?;
        self.encoder.forward(self.shared.forward(&ids)?, None)
    }

    /// Vocabulary logits for the position after `decoder_ids`.
    pub fn next_token_logits(&self, decoder_ids: &[u32], encoder_out: &Tensor) -> Result<Vec<f32>> {
        if decoder_ids.is_empty() {
            return Err(SupportError::invalid("decoder needs at least the start token"));
        }
        let ids = Tensor::new(decoder_ids, &self.device)?.unsqueeze(0)?;
        let hidden = self
            .decoder
            .forward(self.shared.forward(&ids)?, Some(encoder_out))?;
        let last = hidden.narrow(1, decoder_ids.len() - 1, 1)?;
        let last = match self.lm_scale {
            Some(scale) => last.affine(scale, 0.0)?,
            None => last,
        };
        let logits = self.lm_head.forward(&last)?.squeeze(0)?.squeeze(0)?;
        Ok(logits.to_vec1::<f32>()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bidirectional_buckets_match_reference_values() {
        let b = |rel| relative_position_bucket(rel, true, 32, 128);
        assert_eq!(b(0), 0);
        assert_eq!(b(-1), 1);
        assert_eq!(b(1), 17);
        assert_eq!(b(-7), 7);
        assert_eq!(b(-8), 8);
        assert_eq!(b(-20), 10);
        assert_eq!(b(20), 26);
        assert_eq!(b(-1000), 15);
        assert_eq!(b(1000), 31);
    }

    #[test]
    fn causal_buckets_ignore_future_positions() {
        let b = |rel| relative_position_bucket(rel, false, 32, 128);
        assert_eq!(b(0), 0);
        assert_eq!(b(3), 0);
        assert_eq!(b(-1), 1);
        assert_eq!(b(-15), 15);
        assert_eq!(b(-16), 16);
        assert_eq!(b(-20), 17);
        assert_eq!(b(-5000), 31);
    }

    #[test]
    fn flan_t5_config_parses() {
        let config = T5Config::from_json(
            r#"{"vocab_size": 32128, "d_model": 1024, "d_kv": 64, "d_ff": 2816,
                "num_layers": 24, "num_heads": 16, "feed_forward_proj": "gated-gelu",
                "tie_word_embeddings": false, "decoder_start_token_id": 0,
                "eos_token_id": 1, "layer_norm_epsilon": 1e-6}"#,
        )
        .unwrap();
        assert_eq!(config.decoder_layers(), 24);
        assert_eq!(config.relative_attention_num_buckets, 32);
        assert!(!config.tie_word_embeddings);
    }

    #[test]
    fn unknown_feed_forward_is_rejected() {
        let err = T5Config::from_json(
            r#"{"vocab_size": 8, "d_model": 4, "d_kv": 2, "d_ff": 8, "num_layers": 1,
                "num_heads": 2, "feed_forward_proj": "gated-swish"}"#,
        );
        assert!(err.is_err());
    }

    /// Random-weight model end to end: shapes line up and the decoder is causal.
    #[test]
    fn tiny_random_model_runs() {
        use candle_core::DType;
        use candle_nn::VarMap;

        let config = T5Config::from_json(
            r#"{"vocab_size": 16, "d_model": 8, "d_kv": 4, "d_ff": 16, "num_layers": 2,
                "num_decoder_layers": 2, "num_heads": 2, "relative_attention_num_buckets": 8,
                "relative_attention_max_distance": 16, "feed_forward_proj": "gated-gelu",
                "tie_word_embeddings": true}"#,
        )
        .unwrap();
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let model = T5Model::load(vb, config).unwrap();

        let enc = model.encode(&[3, 4, 5, 1]).unwrap();
        assert_eq!(enc.dims(), &[1, 4, 8]);

        let short = model.next_token_logits(&[0, 7], &enc).unwrap();
        assert_eq!(short.len(), 16);
        assert!(short.iter().all(|x| x.is_finite()));

        // appending a token must not change earlier positions' view
        let prefix = model.next_token_logits(&[0], &enc).unwrap();
        let ids = Tensor::new(&[0u32, 7], &Device::Cpu).unwrap().unsqueeze(0).unwrap();
        let hidden = model
            .decoder
            .forward(model.shared.forward(&ids).unwrap(), Some(&enc))
            .unwrap();
        let first = hidden.narrow(1, 0, 1).unwrap();
        let first = model
            .lm_head
            .forward(&first.affine(model.lm_scale.unwrap(), 0.0).unwrap())
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1::<f32>()
            .unwrap();
        for (a, b) in prefix.iter().zip(&first) {
            assert!((a - b).abs() < 1e-4);
        }
    }
}
