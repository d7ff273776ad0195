use crate::embed::EmbeddingProvider;
use crate::error::{Result, SupportError};
use crate::model::{ChunkCategory, PolicyChunk, ScoredChunk};
use crate::retrieval::top_k;
use crate::storage::VectorStore;
use chrono::Utc;
use std::fs;
use std::path::{Path, PathBuf};

pub const NO_POLICY_FOUND: &str = "No specific policy found for this issue.";

pub trait Retriever {
    /// Text of the best matching document, or [`NO_POLICY_FOUND`].
    fn search(&self, query: &str, n_results: usize) -> Result<String>;
}

/// Read-only view over one vector store collection.
pub struct KnowledgeBase<E> {
    chunks: Vec<PolicyChunk>,
    embedder: E,
}

impl<E: EmbeddingProvider> KnowledgeBase<E> {
    /// Loads the collection, creating it empty if it was never built.
    pub fn open(store: &VectorStore, embedder: E) -> Result<Self> {
        if !store.exists() {
            tracing::warn!(
                collection = store.collection_name(),
                "knowledge base not found, creating an empty one"
            );
            store.create_collection(&[])?;
        }
        let chunks = store.load()?;
        tracing::info!(
            collection = store.collection_name(),
            chunks = chunks.len(),
            "knowledge base ready"
        );
        Ok(Self { chunks, embedder })
    }

    pub fn from_chunks(chunks: Vec<PolicyChunk>, embedder: E) -> Self {
        Self { chunks, embedder }
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn search_top(&self, query: &str, n_results: usize) -> Result<Vec<ScoredChunk<'_>>> {
        if self.chunks.is_empty() || n_results == 0 {
            return Ok(Vec::new());
        }
        let q = self.embedder.embed(query)?;
        Ok(top_k(&q, &self.chunks, n_results))
    }
}

impl<E: EmbeddingProvider> Retriever for KnowledgeBase<E> {
    fn search(&self, query: &str, n_results: usize) -> Result<String> {
        match self.search_top(query, n_results.max(1))?.first() {
            Some(hit) => {
                tracing::debug!(chunk = %hit.chunk.id, score = hit.score, "retrieved policy");
                Ok(hit.chunk.text.clone())
            }
            None => {
                tracing::warn!("no policy chunk matched, using default context");
                Ok(NO_POLICY_FOUND.to_string())
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Offline build
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawChunk {
    pub id: String,
    pub text: String,
    pub category: ChunkCategory,
    pub source: String,
}

#[derive(Debug, Clone)]
pub struct BuildReport {
    pub files: usize,
    pub chunks: usize,
    pub replaced_existing: bool,
    pub output: PathBuf,
}

/// Splits one policy file into paragraph chunks. Ids keep the paragraph's
/// position, so skipped blank paragraphs leave gaps.
pub fn chunk_policy_text(file_name: &str, text: &str) -> Vec<RawChunk> {
    let base = file_name.split('.').next().unwrap_or(file_name);
    let category = ChunkCategory::from_file_name(file_name);

    text.split("\n\n")
        .enumerate()
        .filter_map(|(i, piece)| {
            let trimmed = piece.trim();
            (!trimmed.is_empty()).then(|| RawChunk {
                id: format!("{base}_chunk_{i}"),
                text: trimmed.to_string(),
                category,
                source: file_name.to_string(),
            })
        })
        .collect()
}

/// Reads every `.txt` file in `policy_dir`, sorted by name.
pub fn read_policy_chunks(policy_dir: &Path) -> Result<(usize, Vec<RawChunk>)> {
    if !policy_dir.is_dir() {
        return Err(SupportError::PolicyDirMissing(policy_dir.to_path_buf()));
    }

    let mut files: Vec<PathBuf> = fs::read_dir(policy_dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.is_file() && p.extension().is_some_and(|ext| ext == "txt"))
        .collect();
    if files.is_empty() {
        return Err(SupportError::PolicyDirEmpty(policy_dir.to_path_buf()));
    }
    files.sort();
    tracing::info!(files = files.len(), "found policy files");

    let mut chunks = Vec::new();
    for path in &files {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let text = fs::read_to_string(path)?;
        chunks.extend(chunk_policy_text(&name, &text));
    }
    Ok((files.len(), chunks))
}

/// Rebuilds the collection from scratch: the old one is deleted first.
pub fn build_knowledge_base<E: EmbeddingProvider>(
    policy_dir: &Path,
    store: &VectorStore,
    embedder: &E,
) -> Result<BuildReport> {
    let (files, raw) = read_policy_chunks(policy_dir)?;
    tracing::info!(chunks = raw.len(), "processed policy files into chunks");

    let now = Utc::now();
    let mut chunks = Vec::with_capacity(raw.len());
    for r in raw {
        chunks.push(PolicyChunk {
            embedding: embedder.embed(&r.text)?,
            id: r.id,
            text: r.text,
            category: r.category,
            source: r.source,
            created_at: now,
        });
    }

    let replaced_existing = store.delete_collection()?;
    if replaced_existing {
        tracing::info!(collection = store.collection_name(), "deleted old collection");
    }
    if chunks.is_empty() {
        tracing::warn!("no non-empty paragraphs found, collection will be empty");
    }
    let output = store.create_collection(&chunks)?;

    Ok(BuildReport {
        files,
        chunks: chunks.len(),
        replaced_existing,
        output,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embed::HashEmbeddingProvider;

    const SHIPPING: &str = "Standard shipping takes 3-5 business days.\n\n\
        \n\n  Tracking numbers are emailed once your package ships.  \n\n";
    const REFUNDS: &str = "Refunds are issued within 30 days of purchase.";

    fn policy_dir() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("shipping_policy.txt"), SHIPPING).unwrap();
        fs::write(dir.path().join("refund.policy.txt"), REFUNDS).unwrap();
        fs::write(dir.path().join("notes.md"), "ignored").unwrap();
        dir
    }

    #[test]
    fn chunking_skips_blank_paragraphs_and_keeps_positions() {
        let chunks = chunk_policy_text("shipping_policy.txt", SHIPPING);
        let ids: Vec<&str> = chunks.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["shipping_policy_chunk_0", "shipping_policy_chunk_2"]);
        assert_eq!(
            chunks[1].text,
            "Tracking numbers are emailed once your package ships."
        );
        assert!(chunks.iter().all(|c| c.category == ChunkCategory::Shipping));
    }

    #[test]
    fn chunk_base_id_stops_at_first_dot() {
        let chunks = chunk_policy_text("refund.policy.txt", REFUNDS);
        assert_eq!(chunks[0].id, "refund_chunk_0");
        assert_eq!(chunks[0].category, ChunkCategory::Refund);
    }

    #[test]
    fn build_rejects_missing_and_empty_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let store = VectorStore::new(dir.path().join("db"), "kb");
        let embedder = HashEmbeddingProvider::default();

        let missing = build_knowledge_base(&dir.path().join("nope"), &store, &embedder);
        assert!(matches!(missing, Err(SupportError::PolicyDirMissing(_))));

        let empty = dir.path().join("empty");
        fs::create_dir(&empty).unwrap();
        fs::write(empty.join("readme.md"), "not a policy").unwrap();
        let empty = build_knowledge_base(&empty, &store, &embedder);
        assert!(matches!(empty, Err(SupportError::PolicyDirEmpty(_))));
    }

    #[test]
    fn build_then_search_returns_the_shipping_chunk() {
        let policies = policy_dir();
        let db = tempfile::tempdir().unwrap();
        let store = VectorStore::new(db.path(), "kb");
        let embedder = HashEmbeddingProvider::default();

        let report = build_knowledge_base(policies.path(), &store, &embedder).unwrap();
        assert_eq!(report.files, 2);
        assert_eq!(report.chunks, 3);
        assert!(!report.replaced_existing);

        let again = build_knowledge_base(policies.path(), &store, &embedder).unwrap();
        assert!(again.replaced_existing);
        assert_eq!(store.load().unwrap().len(), 3);

        let kb = KnowledgeBase::open(&store, embedder).unwrap();
        let hit = kb.search("When will tracking numbers be emailed for my package?", 1).unwrap();
        assert_eq!(hit, "Tracking numbers are emailed once your package ships.");
    }

    #[test]
    fn empty_collection_returns_default_text() {
        let db = tempfile::tempdir().unwrap();
        let store = VectorStore::new(db.path().join("fresh"), "kb");

        let kb = KnowledgeBase::open(&store, HashEmbeddingProvider::default()).unwrap();
        assert!(store.exists(), "open creates the missing collection");
        assert!(kb.is_empty());
        assert_eq!(kb.search("Where is my package?", 1).unwrap(), NO_POLICY_FOUND);
    }

    #[test]
    fn search_top_limits_results() {
        let embedder = HashEmbeddingProvider::default();
        let chunks = chunk_policy_text("shipping.txt", SHIPPING)
            .into_iter()
            .map(|r| PolicyChunk {
                embedding: embedder.embed(&r.text).unwrap(),
                id: r.id,
                text: r.text,
                category: r.category,
                source: r.source,
                created_at: Utc::now(),
            })
            .collect();
        let kb = KnowledgeBase::from_chunks(chunks, embedder);
        assert_eq!(kb.search_top("shipping", 5).unwrap().len(), 2);
        assert_eq!(kb.search_top("shipping", 1).unwrap().len(), 1);
        assert!(kb.search_top("shipping", 0).unwrap().is_empty());
    }
}
