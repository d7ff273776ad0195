pub mod analytics;
pub mod bert;
pub mod boosted;
pub mod classifier;
pub mod embed;
pub mod error;
pub mod generate;
pub mod knowledge;
pub mod minilm_embed;
pub mod model;
pub mod pipeline;
pub mod quality;
pub mod retrieval;
pub mod settings;
pub mod storage;
pub mod t5;
pub mod toxicity;
pub mod vectorizer;

pub use analytics::{ExperimentLogger, LogRecord, LOG_HEADER};
pub use classifier::{ArtifactClassifier, TextClassifier};
pub use embed::{load_embedder, EmbeddingProvider, HashEmbeddingProvider};
pub use error::{Result, SupportError};
pub use generate::{ChatGenerator, DecodingParams, GenerationRequest, ResponseGenerator};
pub use knowledge::{build_knowledge_base, BuildReport, KnowledgeBase, Retriever, NO_POLICY_FOUND};
pub use minilm_embed::MiniLmEmbeddingProvider;
pub use model::{ChunkCategory, PolicyChunk, ScoredChunk};
pub use pipeline::{
    Components, Pipeline, Session, Turn, TurnOutcome, FALLBACK_MESSAGE, SAFETY_BLOCK_VARIANT,
    STAGE_ERROR_MESSAGE, STAGE_ERROR_VARIANT,
};
pub use quality::{GroundednessScorer, QualityReason, QualityValidator, QualityVerdict};
pub use retrieval::{cosine_similarity, top_k, top_match};
pub use settings::{EmbedderKind, Settings};
pub use storage::VectorStore;
pub use toxicity::{SafetyCheck, SafetyVerdict, ToxicityFilter};
