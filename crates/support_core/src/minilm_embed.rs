use crate::bert::{mean_pool_normalized, BertConfig, BertEncoder, ModelFiles};
use crate::embed::EmbeddingProvider;
use crate::error::{Result, SupportError};
use candle_core::Device;
use std::path::Path;

/// Sentence embeddings from an all-MiniLM-L6-v2 style checkpoint: mean pooled
/// and L2 normalised, so cosine similarity is a dot product.
pub struct MiniLmEmbeddingProvider {
    encoder: BertEncoder,
    tokenizer: tokenizers::Tokenizer,
}

impl MiniLmEmbeddingProvider {
    pub fn load(model_dir: &Path) -> Result<Self> {
        let files = ModelFiles::in_dir(model_dir)?;
        let config = BertConfig::from_file(&files.config)?;
        let vb = files.var_builder(&Device::Cpu)?;
        let encoder = BertEncoder::load(vb, &config)?;
        let tokenizer = files.load_tokenizer()?;
        Ok(Self { encoder, tokenizer })
    }
}

impl EmbeddingProvider for MiniLmEmbeddingProvider {
    fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let encoding = self
            .tokenizer
            .encode(text, true)
            .map_err(SupportError::tokenizer)?;
        let hidden = self.encoder.forward(encoding.get_ids())?;
        mean_pool_normalized(&hidden)
    }
}
