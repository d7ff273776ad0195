use crate::error::{Result, SupportError};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

pub const DEFAULT_TOXICITY_THRESHOLD: f32 = 0.7;
pub const DEFAULT_QUALITY_THRESHOLD: f32 = 0.4;
pub const DEFAULT_LLM_MAX_LENGTH: usize = 256;
pub const DEFAULT_LLM_TEMPERATURE: f64 = 0.7;
pub const DEFAULT_LLM_REPETITION_PENALTY: f32 = 1.2;
pub const DEFAULT_LLM_TOP_K: usize = 50;
pub const DEFAULT_COLLECTION_NAME: &str = "company_knowledge_base";
pub const DEFAULT_VARIANT: &str = "v1_production";
pub const SETTINGS_FILE: &str = "config/settings.toml";
pub const API_KEY_ENV: &str = "OPENAI_API_KEY";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum EmbedderKind {
    /// all-MiniLM-L6-v2 sentence embeddings.
    #[serde(rename = "minilm")]
    MiniLm,
    /// Hashed bag-of-words, no model files needed.
    #[serde(rename = "hash")]
    Hash,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    #[serde(skip)]
    pub home: PathBuf,

    pub artifacts_dir: PathBuf,
    pub logs_dir: PathBuf,
    pub log_file: String,
    pub policy_dir: PathBuf,

    pub sentiment_model: String,
    pub sentiment_vectorizer: String,
    pub sentiment_labels: String,
    pub intent_model: String,
    pub intent_vectorizer: String,
    pub intent_labels: String,

    pub vector_store_dir: PathBuf,
    pub collection_name: String,
    pub embedder: EmbedderKind,
    pub embedding_model_dir: PathBuf,

    pub toxicity_model_dir: PathBuf,
    pub toxicity_threshold: f32,

    pub llm_model_dir: PathBuf,
    pub llm_max_length: usize,
    pub llm_temperature: f64,
    pub llm_repetition_penalty: f32,
    pub llm_top_k: usize,
    pub llm_seed: Option<u64>,

    pub quality_threshold: f32,
    pub variant: String,
    pub log_level: String,

    #[serde(skip)]
    pub api_key: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            home: PathBuf::from("."),
            artifacts_dir: "artifacts".into(),
            logs_dir: "logs".into(),
            log_file: "production_logs.csv".into(),
            policy_dir: "data/raw/policies".into(),
            sentiment_model: "sentiment_xgboost.json".into(),
            sentiment_vectorizer: "tfidf_vectorizer.json".into(),
            sentiment_labels: "label_encoder.json".into(),
            intent_model: "intent_logistic_regression.json".into(),
            intent_vectorizer: "intent_vectorizer.json".into(),
            intent_labels: "intent_label_encoder.json".into(),
            vector_store_dir: "chroma_db_data".into(),
            collection_name: DEFAULT_COLLECTION_NAME.into(),
            embedder: EmbedderKind::MiniLm,
            embedding_model_dir: "models/all-MiniLM-L6-v2".into(),
            toxicity_model_dir: "models/toxic-bert".into(),
            toxicity_threshold: DEFAULT_TOXICITY_THRESHOLD,
            llm_model_dir: "models/flan-t5-large".into(),
            llm_max_length: DEFAULT_LLM_MAX_LENGTH,
            llm_temperature: DEFAULT_LLM_TEMPERATURE,
            llm_repetition_penalty: DEFAULT_LLM_REPETITION_PENALTY,
            llm_top_k: DEFAULT_LLM_TOP_K,
            llm_seed: None,
            quality_threshold: DEFAULT_QUALITY_THRESHOLD,
            variant: DEFAULT_VARIANT.into(),
            log_level: "info".into(),
            api_key: None,
        }
    }
}

/// The three files behind one text classifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassifierFiles {
    pub model: PathBuf,
    pub vectorizer: PathBuf,
    pub labels: PathBuf,
}

impl Settings {
    /// Reads settings rooted at `home`.
    ///
    /// An explicit `config` path must exist. Without one, `config/settings.toml`
    /// under `home` is used when present and defaults apply otherwise.
    pub fn load(home: &Path, config: Option<&Path>) -> Result<Self> {
        let path = match config {
            Some(p) if !p.exists() => {
                return Err(SupportError::InvalidSettings(format!(
                    "config file {} not found",
                    p.display()
                )))
            }
            Some(p) => Some(p.to_path_buf()),
            None => Some(home.join(SETTINGS_FILE)).filter(|p| p.exists()),
        };

        let mut settings = match path {
            Some(p) => {
                let contents = fs::read_to_string(&p)?;
                Self::from_toml(&contents)?
            }
            None => Self::default(),
        };
        settings.home = home.to_path_buf();
        settings.api_key = std::env::var(API_KEY_ENV).ok().filter(|k| !k.is_empty());
        settings.validate()?;
        Ok(settings)
    }

    pub fn from_toml(contents: &str) -> Result<Self> {
        Ok(toml::from_str(contents)?)
    }

    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.toxicity_threshold) {
            return Err(SupportError::InvalidSettings(format!(
                "toxicity_threshold must be within [0, 1], got {}",
                self.toxicity_threshold
            )));
        }
        if !(-1.0..=1.0).contains(&self.quality_threshold) {
            return Err(SupportError::InvalidSettings(format!(
                "quality_threshold must be within [-1, 1], got {}",
                self.quality_threshold
            )));
        }
        if self.llm_max_length < 2 {
            return Err(SupportError::InvalidSettings(
                "llm_max_length must be at least 2".into(),
            ));
        }
        if self.llm_repetition_penalty <= 0.0 {
            return Err(SupportError::InvalidSettings(
                "llm_repetition_penalty must be > 0".into(),
            ));
        }
        if self.collection_name.trim().is_empty() {
            return Err(SupportError::InvalidSettings(
                "collection_name is required".into(),
            ));
        }
        Ok(())
    }

    fn under_home(&self, p: &Path) -> PathBuf {
        if p.is_absolute() {
            p.to_path_buf()
        } else {
            self.home.join(p)
        }
    }

    pub fn artifacts_path(&self) -> PathBuf {
        self.under_home(&self.artifacts_dir)
    }

    fn artifact(&self, p: impl AsRef<Path>) -> PathBuf {
        let p = p.as_ref();
        if p.is_absolute() {
            p.to_path_buf()
        } else {
            self.artifacts_path().join(p)
        }
    }

    pub fn sentiment_files(&self) -> ClassifierFiles {
        ClassifierFiles {
            model: self.artifact(&self.sentiment_model),
            vectorizer: self.artifact(&self.sentiment_vectorizer),
            labels: self.artifact(&self.sentiment_labels),
        }
    }

    pub fn intent_files(&self) -> ClassifierFiles {
        ClassifierFiles {
            model: self.artifact(&self.intent_model),
            vectorizer: self.artifact(&self.intent_vectorizer),
            labels: self.artifact(&self.intent_labels),
        }
    }

    pub fn vector_store_path(&self) -> PathBuf {
        self.artifact(&self.vector_store_dir)
    }

    pub fn embedding_model_path(&self) -> PathBuf {
        self.artifact(&self.embedding_model_dir)
    }

    pub fn toxicity_model_path(&self) -> PathBuf {
        self.artifact(&self.toxicity_model_dir)
    }

    pub fn llm_model_path(&self) -> PathBuf {
        self.artifact(&self.llm_model_dir)
    }

    pub fn policy_path(&self) -> PathBuf {
        self.under_home(&self.policy_dir)
    }

    pub fn log_path(&self) -> PathBuf {
        self.under_home(&self.logs_dir).join(&self.log_file)
    }
}
