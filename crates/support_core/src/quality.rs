use crate::embed::EmbeddingProvider;
use crate::error::Result;
use crate::retrieval::cosine_similarity;
use serde::Serialize;
use std::fmt;

/// Responses shorter than this (in characters) are never embedded.
pub const MIN_RESPONSE_CHARS: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum QualityReason {
    TooShort,
    Valid,
}

impl fmt::Display for QualityReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::TooShort => "Too Short",
            Self::Valid => "Valid",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct QualityVerdict {
    pub score: f32,
    pub reason: QualityReason,
}

pub trait GroundednessScorer {
    /// How well `response` sticks to `context`, higher is better.
    fn validate(&self, response: &str, context: &str) -> Result<QualityVerdict>;
}

/// Scores a reply by the cosine similarity between its embedding and the
/// retrieved context's.
pub struct QualityValidator<E> {
    embedder: E,
}

impl<E: EmbeddingProvider> QualityValidator<E> {
    pub fn new(embedder: E) -> Self {
        Self { embedder }
    }
}

impl<E: EmbeddingProvider> GroundednessScorer for QualityValidator<E> {
    fn validate(&self, response: &str, context: &str) -> Result<QualityVerdict> {
        if response.chars().count() < MIN_RESPONSE_CHARS {
            return Ok(QualityVerdict {
                score: 0.0,
                reason: QualityReason::TooShort,
            });
        }

        let r = self.embedder.embed(response)?;
        let c = self.embedder.embed(context)?;
        let score = cosine_similarity(&r, &c);
        tracing::debug!(score, "groundedness scored");
        Ok(QualityVerdict {
            score,
            reason: QualityReason::Valid,
        })
    }
}
