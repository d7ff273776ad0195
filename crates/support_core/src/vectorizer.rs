use crate::error::{Result, SupportError};
use regex::Regex;
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::OnceLock;

/// Sparse feature row: column index to weight, columns ascending.
pub type SparseVector = Vec<(usize, f32)>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Norm {
    L1,
    L2,
}

fn default_ngram_range() -> (usize, usize) {
    (1, 1)
}

fn default_norm() -> Option<Norm> {
    Some(Norm::L2)
}

fn default_true() -> bool {
    true
}

/// Fitted term-frequency vectorizer, exported as JSON from the training job.
#[derive(Debug, Clone, Deserialize)]
pub struct TfidfVectorizer {
    vocabulary: HashMap<String, usize>,
    #[serde(default)]
    idf: Vec<f32>,
    #[serde(default = "default_ngram_range")]
    ngram_range: (usize, usize),
    #[serde(default)]
    sublinear_tf: bool,
    #[serde(default = "default_norm")]
    norm: Option<Norm>,
    #[serde(default = "default_true")]
    use_idf: bool,
    #[serde(default)]
    stop_words: HashSet<String>,
}

fn token_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\b\w\w+\b").expect("static token pattern"))
}

impl TfidfVectorizer {
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        let v: Self = serde_json::from_str(raw)?;
        v.check()?;
        Ok(v)
    }

    fn check(&self) -> Result<()> {
        let (lo, hi) = self.ngram_range;
        if lo == 0 || lo > hi {
            return Err(SupportError::invalid(format!(
                "bad ngram_range ({lo}, {hi})"
            )));
        }
        if self.use_idf && self.idf.len() != self.num_features() {
            return Err(SupportError::invalid(format!(
                "idf has {} weights for {} features",
                self.idf.len(),
                self.num_features()
            )));
        }
        Ok(())
    }

    pub fn num_features(&self) -> usize {
        self.vocabulary.values().map(|i| i + 1).max().unwrap_or(0)
    }

    fn analyze(&self, text: &str) -> Vec<String> {
        let lowered = text.to_lowercase();
        let tokens: Vec<&str> = token_pattern()
            .find_iter(&lowered)
            .map(|m| m.as_str())
            .filter(|t| !self.stop_words.contains(*t))
            .collect();

        let (lo, hi) = self.ngram_range;
        let mut grams = Vec::new();
        for n in lo..=hi {
            if n > tokens.len() {
                break;
            }
            grams.extend(tokens.windows(n).map(|w| w.join(" ")));
        }
        grams
    }

    /// Vectorizes one document. Terms outside the vocabulary are dropped.
    pub fn transform(&self, text: &str) -> SparseVector {
        let mut counts: BTreeMap<usize, f32> = BTreeMap::new();
        for gram in self.analyze(text) {
            if let Some(&col) = self.vocabulary.get(&gram) {
                *counts.entry(col).or_insert(0.0) += 1.0;
            }
        }

        let mut row: SparseVector = counts
            .into_iter()
            .map(|(col, tf)| {
                let tf = if self.sublinear_tf { tf.ln() + 1.0 } else { tf };
                let w = if self.use_idf { tf * self.idf[col] } else { tf };
                (col, w)
            })
            .collect();

        let norm = match self.norm {
            Some(Norm::L2) => row.iter().map(|(_, w)| w * w).sum::<f32>().sqrt(),
            Some(Norm::L1) => row.iter().map(|(_, w)| w.abs()).sum::<f32>(),
            None => 0.0,
        };
        if norm > 0.0 {
            row.iter_mut().for_each(|(_, w)| *w /= norm);
        }
        row
    }
}
