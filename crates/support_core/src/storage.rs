use crate::error::Result;
use crate::model::PolicyChunk;
use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

/// A named collection of embedded chunks, stored as `<dir>/<name>.jsonl`.
#[derive(Debug, Clone)]
pub struct VectorStore {
    dir: PathBuf,
    collection: String,
}

impl VectorStore {
    pub fn new(dir: impl Into<PathBuf>, collection: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            collection: collection.into(),
        }
    }

    pub fn collection_path(&self) -> PathBuf {
        self.dir.join(format!("{}.jsonl", self.collection))
    }

    pub fn collection_name(&self) -> &str {
        &self.collection
    }

    pub fn exists(&self) -> bool {
        self.collection_path().exists()
    }

    pub fn load(&self) -> Result<Vec<PolicyChunk>> {
        load_chunks_jsonl(&self.collection_path())
    }

    /// Returns false when there was nothing to delete.
    pub fn delete_collection(&self) -> Result<bool> {
        match fs::remove_file(self.collection_path()) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    pub fn create_collection(&self, chunks: &[PolicyChunk]) -> Result<PathBuf> {
        fs::create_dir_all(&self.dir)?;
        let path = self.collection_path();
        save_chunks_jsonl(&path, chunks)?;
        Ok(path)
    }
}

pub fn save_chunks_jsonl(path: &Path, chunks: &[PolicyChunk]) -> Result<()> {
    let mut writer = BufWriter::new(File::create(path)?);
    for chunk in chunks {
        serde_json::to_writer(&mut writer, chunk)?;
        writer.write_all(b"\n")?;
    }
    writer.flush()?;
    Ok(())
}

pub fn load_chunks_jsonl(path: &Path) -> Result<Vec<PolicyChunk>> {
    let reader = BufReader::new(File::open(path)?);
    let mut chunks = Vec::new();

    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        chunks.push(serde_json::from_str(&line)?);
    }

    Ok(chunks)
}
