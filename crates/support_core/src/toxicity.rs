use crate::bert::{BertConfig, BertEncoder, ModelFiles};
use crate::error::{Result, SupportError};
use candle_core::{Device, IndexOp, Module};
use candle_nn::Linear;
use std::fmt;
use std::path::Path;

pub const SAFE_REASON: &str = "Safe";

#[derive(Debug, Clone, PartialEq)]
pub struct SafetyVerdict {
    pub is_safe: bool,
    pub reason: String,
}

impl SafetyVerdict {
    pub fn safe() -> Self {
        Self {
            is_safe: true,
            reason: SAFE_REASON.to_string(),
        }
    }

    pub fn blocked(label: &str, score: f32) -> Self {
        // two decimals, trailing zeros dropped: 0.9, not 0.90
        let rounded = (score as f64 * 100.0).round() / 100.0;
        Self {
            is_safe: false,
            reason: format!("Blocked due to {label} ({rounded})"),
        }
    }
}

impl fmt::Display for SafetyVerdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.reason)
    }
}

pub trait SafetyCheck {
    fn check_safety(&self, text: &str) -> Result<SafetyVerdict>;
}

/// Picks the highest scoring category strictly above `threshold`.
pub fn verdict_from_scores(scores: &[(String, f32)], threshold: f32) -> SafetyVerdict {
    let mut ranked: Vec<&(String, f32)> = scores.iter().collect();
    ranked.sort_by(|a, b| b.1.total_cmp(&a.1));

    ranked
        .into_iter()
        .find(|(_, score)| *score > threshold)
        .map(|(label, score)| SafetyVerdict::blocked(label, *score))
        .unwrap_or_else(SafetyVerdict::safe)
}

/// Multi-label toxicity classifier (toxic-bert layout): BERT encoder, tanh
/// pooler over `[CLS]`, linear head, independent sigmoid per label.
pub struct ToxicityFilter {
    encoder: BertEncoder,
    pooler: Linear,
    classifier: Linear,
    labels: Vec<String>,
    tokenizer: tokenizers::Tokenizer,
    threshold: f32,
}

impl ToxicityFilter {
    pub fn load(model_dir: &Path, threshold: f32) -> Result<Self> {
        let files = ModelFiles::in_dir(model_dir)?;
        let config = BertConfig::from_file(&files.config)?;
        let labels = config.labels()?;
        if labels.is_empty() {
            return Err(SupportError::invalid(format!(
                "{} declares no id2label entries",
                files.config.display()
            )));
        }

        let vb = files.var_builder(&Device::Cpu)?;
        let encoder = BertEncoder::load(vb.clone(), &config)?;
        let h = config.hidden_size;
        let pooler_vb = if vb.contains_tensor("bert.pooler.dense.weight") {
            vb.pp("bert").pp("pooler")
        } else {
            vb.pp("pooler")
        };
        let pooler = candle_nn::linear(h, h, pooler_vb.pp("dense"))?;
        let classifier = candle_nn::linear(h, labels.len(), vb.pp("classifier"))?;

        Ok(Self {
            encoder,
            pooler,
            classifier,
            labels,
            tokenizer: files.load_tokenizer()?,
            threshold,
        })
    }

    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    /// Sigmoid score per label, in label order.
    pub fn scores(&self, text: &str) -> Result<Vec<(String, f32)>> {
        let encoding = self
            .tokenizer
            .encode(text, true)
            .map_err(SupportError::tokenizer)?;
        let hidden = self.encoder.forward(encoding.get_ids())?;

        let cls = hidden.i((.., 0, ..))?;
        let pooled = self.pooler.forward(&cls)?.tanh()?;
        let logits = self.classifier.forward(&pooled)?;
        let probs = candle_nn::ops::sigmoid(&logits)?
            .squeeze(0)?
            .to_vec1::<f32>()?;

        Ok(self.labels.iter().cloned().zip(probs).collect())
    }
}

impl SafetyCheck for ToxicityFilter {
    fn check_safety(&self, text: &str) -> Result<SafetyVerdict> {
        let scores = self.scores(text)?;
        let verdict = verdict_from_scores(&scores, self.threshold);
        if !verdict.is_safe {
            tracing::debug!(reason = %verdict.reason, "toxicity threshold exceeded");
        }
        Ok(verdict)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scores(pairs: &[(&str, f32)]) -> Vec<(String, f32)> {
        pairs.iter().map(|(l, s)| (l.to_string(), *s)).collect()
    }

    #[test]
    fn all_scores_below_threshold_is_safe() {
        let v = verdict_from_scores(&scores(&[("toxic", 0.2), ("insult", 0.69)]), 0.7);
        assert!(v.is_safe);
        assert_eq!(v.reason, "Safe");
    }

    #[test]
    fn highest_offending_category_is_reported() {
        let v = verdict_from_scores(
            &scores(&[("toxic", 0.81), ("insult", 0.934), ("threat", 0.1)]),
            0.7,
        );
        assert!(!v.is_safe);
        assert_eq!(v.reason, "Blocked due to insult (0.93)");
    }

    #[test]
    fn threshold_is_exclusive() {
        let v = verdict_from_scores(&scores(&[("toxic", 0.7)]), 0.7);
        assert!(v.is_safe);
    }

    #[test]
    fn reason_drops_trailing_zero() {
        let v = SafetyVerdict::blocked("obscene", 0.899);
        assert_eq!(v.reason, "Blocked due to obscene (0.9)");
    }

    #[test]
    fn real_model_blocks_abuse() {
        let dir = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../models/toxic-bert");
        if !dir.join("model.safetensors").exists() {
            eprintln!("Skipping: toxic-bert not found under models/");
            return;
        }
        let filter = ToxicityFilter::load(&dir, 0.7).unwrap();
        assert!(filter.check_safety("Where is my package?").unwrap().is_safe);
        assert!(!filter.check_safety("you are a worthless idiot").unwrap().is_safe);
    }
}
