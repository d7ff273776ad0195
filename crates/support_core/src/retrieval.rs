use crate::model::{PolicyChunk, ScoredChunk};

/// Cosine of the angle between two embeddings, accumulated in f64.
/// Empty, mismatched or all-zero inputs score 0.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.is_empty() || a.len() != b.len() {
        return 0.0;
    }

    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for (&x, &y) in a.iter().zip(b) {
        let (x, y) = (f64::from(x), f64::from(y));
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = (norm_a * norm_b).sqrt();
    if denom == 0.0 {
        0.0
    } else {
        (dot / denom) as f32
    }
}

/// Chunks ranked by similarity to the query, best first.
pub fn top_k<'a>(query_embedding: &[f32], chunks: &'a [PolicyChunk], k: usize) -> Vec<ScoredChunk<'a>> {
    let mut scored: Vec<ScoredChunk<'a>> = chunks
        .iter()
        .map(|chunk| ScoredChunk {
            chunk,
            score: cosine_similarity(query_embedding, &chunk.embedding),
        })
        .collect();

    scored.sort_by(|a, b| b.score.total_cmp(&a.score));
    scored.truncate(k);
    scored
}

pub fn top_match<'a>(query_embedding: &[f32], chunks: &'a [PolicyChunk]) -> Option<ScoredChunk<'a>> {
    top_k(query_embedding, chunks, 1).into_iter().next()
}
