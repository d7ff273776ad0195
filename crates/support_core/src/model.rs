use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkCategory {
    Refund,
    Shipping,
    General,
}

impl ChunkCategory {
    /// Coarse tag guessed from the policy file name.
    pub fn from_file_name(name: &str) -> Self {
        if name.contains("refund") {
            Self::Refund
        } else if name.contains("shipping") {
            Self::Shipping
        } else {
            Self::General
        }
    }
}

impl fmt::Display for ChunkCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Refund => "refund",
            Self::Shipping => "shipping",
            Self::General => "general",
        })
    }
}

/// One paragraph of a policy document, embedded at build time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyChunk {
    pub id: String,
    pub text: String,
    pub category: ChunkCategory,
    pub source: String,
    pub embedding: Vec<f32>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScoredChunk<'a> {
    pub chunk: &'a PolicyChunk,
    pub score: f32,
}
