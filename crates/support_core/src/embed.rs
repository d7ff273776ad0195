use crate::error::Result;
use crate::minilm_embed::MiniLmEmbeddingProvider;
use crate::settings::{EmbedderKind, Settings};
use std::sync::Arc;

pub const HASH_EMBEDDING_DIM: usize = 384;

pub trait EmbeddingProvider {
    fn embed(&self, text: &str) -> Result<Vec<f32>>;
}

impl EmbeddingProvider for Box<dyn EmbeddingProvider> {
    fn embed(&self, text: &str) -> Result<Vec<f32>> {
        (**self).embed(text)
    }
}

impl EmbeddingProvider for Arc<dyn EmbeddingProvider> {
    fn embed(&self, text: &str) -> Result<Vec<f32>> {
        (**self).embed(text)
    }
}

/// Builds the embedder the knowledge base and the quality validator share.
pub fn load_embedder(settings: &Settings) -> Result<Arc<dyn EmbeddingProvider>> {
    match settings.embedder {
        EmbedderKind::MiniLm => {
            let dir = settings.embedding_model_path();
            tracing::info!(model = %dir.display(), "loading sentence embedder");
            Ok(Arc::new(MiniLmEmbeddingProvider::load(&dir)?))
        }
        EmbedderKind::Hash => {
            tracing::info!(dim = HASH_EMBEDDING_DIM, "using hashing embedder");
            Ok(Arc::new(HashEmbeddingProvider::new(HASH_EMBEDDING_DIM)))
        }
    }
}

/// Signed feature hashing over lowercase alphanumeric tokens, L2 normalised.
/// Deterministic, so it can stand in for a real model in tests and offline
/// builds.
#[derive(Debug, Clone)]
pub struct HashEmbeddingProvider {
    dim: usize,
}

impl HashEmbeddingProvider {
    pub fn new(dim: usize) -> Self {
        Self { dim: dim.max(8) }
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Bucket and sign for one token. The top hash bit picks the sign so
    /// colliding tokens tend to cancel instead of piling up.
    fn feature(&self, token: &str) -> (usize, f32) {
        let h = fnv1a(token.as_bytes());
        let sign = if h >> 63 == 0 { 1.0 } else { -1.0 };
        ((h % self.dim as u64) as usize, sign)
    }
}

impl Default for HashEmbeddingProvider {
    fn default() -> Self {
        Self::new(HASH_EMBEDDING_DIM)
    }
}

fn fnv1a(bytes: &[u8]) -> u64 {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;
    bytes
        .iter()
        .fold(OFFSET, |h, b| (h ^ u64::from(*b)).wrapping_mul(PRIME))
}

impl EmbeddingProvider for HashEmbeddingProvider {
    fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let lowered = text.to_lowercase();
        let mut v = vec![0.0f32; self.dim];
        for token in lowered
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
        {
            let (idx, sign) = self.feature(token);
            v[idx] += sign;
        }

        let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            let inv = norm.recip();
            v.iter_mut().for_each(|x| *x *= inv);
        }
        Ok(v)
    }
}
