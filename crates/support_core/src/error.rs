use std::io;
use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SupportError {
    #[error("missing {what} at {}", path.display())]
    ArtifactMissing { what: &'static str, path: PathBuf },

    #[error("invalid artifact: {0}")]
    InvalidArtifact(String),

    #[error("invalid settings: {0}")]
    InvalidSettings(String),

    #[error("no policy folder found at {}", .0.display())]
    PolicyDirMissing(PathBuf),

    #[error("policy folder {} exists but contains no .txt files", .0.display())]
    PolicyDirEmpty(PathBuf),

    #[error("tokenizer error: {0}")]
    Tokenizer(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("settings parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("tensor error: {0}")]
    Tensor(#[from] candle_core::Error),
}

impl SupportError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidArtifact(msg.into())
    }

    pub(crate) fn tokenizer(err: impl std::fmt::Display) -> Self {
        Self::Tokenizer(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, SupportError>;

/// Fails with [`SupportError::ArtifactMissing`] unless `path` exists.
pub fn require_file(what: &'static str, path: PathBuf) -> Result<PathBuf> {
    if path.exists() {
        Ok(path)
    } else {
        Err(SupportError::ArtifactMissing { what, path })
    }
}
