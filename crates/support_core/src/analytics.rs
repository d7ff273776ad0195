use crate::error::Result;
use chrono::Local;
use serde::Serialize;
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};

pub const LOG_HEADER: [&str; 10] = [
    "timestamp",
    "session_id",
    "variant",
    "user_query",
    "sentiment",
    "intent",
    "retrieved_context",
    "llm_response",
    "latency_seconds",
    "quality_score",
];

/// One conversation turn, as handed to [`ExperimentLogger::log`].
#[derive(Debug, Clone, PartialEq)]
pub struct LogRecord {
    pub session_id: String,
    pub variant: String,
    pub user_query: String,
    pub sentiment: String,
    pub intent: String,
    pub retrieved_context: String,
    pub llm_response: String,
    pub latency_seconds: f64,
    pub quality_score: f64,
}

#[derive(Serialize)]
struct Row<'a> {
    timestamp: String,
    session_id: &'a str,
    variant: &'a str,
    user_query: &'a str,
    sentiment: &'a str,
    intent: &'a str,
    retrieved_context: &'a str,
    llm_response: &'a str,
    latency_seconds: f64,
    quality_score: f64,
}

fn round4(x: f64) -> f64 {
    (x * 10_000.0).round() / 10_000.0
}

/// Append-only CSV of every turn, for offline A/B analysis.
#[derive(Debug, Clone)]
pub struct ExperimentLogger {
    path: PathBuf,
}

impl ExperimentLogger {
    /// Creates the parent directory and writes the header if the file is new.
    /// An existing file is appended to as is.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        if !path.exists() {
            let mut writer = csv::Writer::from_path(&path)?;
            writer.write_record(LOG_HEADER)?;
            writer.flush()?;
            tracing::info!(path = %path.display(), "created experiment log");
        }
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn log(&self, record: &LogRecord) -> Result<()> {
        let file = OpenOptions::new().append(true).open(&self.path)?;
        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(file);

        writer.serialize(Row {
            timestamp: Local::now().format("%Y-%m-%d %H:%M:%S%.6f").to_string(),
            session_id: &record.session_id,
            variant: &record.variant,
            user_query: &record.user_query,
            sentiment: &record.sentiment,
            intent: &record.intent,
            retrieved_context: &record.retrieved_context,
            llm_response: &record.llm_response,
            latency_seconds: round4(record.latency_seconds),
            quality_score: round4(record.quality_score),
        })?;
        writer.flush()?;
        Ok(())
    }
}
