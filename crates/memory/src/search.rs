//! Brute-force semantic search over journal entries and topics.
//!
//! Candidates are scanned newest-first and scored with a dot product (all
//! stored vectors are unit length, so this is cosine similarity).  The scan
//! is a full O(n·D) pass over at most [`N_CANDIDATES`] entries.

use crate::embed::{EmbedError, Embedder};
use crate::schema::{JournalEntry, Topic};
use crate::store::{Store, StoreError};

/// Score floor for journal hits.
pub const TAU_JOURNAL: f32 = 0.30;
/// Score floor for topic hits.
pub const TAU_TOPIC: f32 = 0.35;
/// Most-recent candidates scanned per search.
pub const N_CANDIDATES: usize = 500;

#[derive(Debug, thiserror::Error)]
pub enum SearchError {
    #[error(transparent)]
    Embed(#[from] EmbedError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone)]
pub struct SearchHit<T> {
    pub item: T,
    pub score: f32,
}

/// Rank `candidates` (given newest-first) against `query` by dot product,
/// dropping scores ≤ `tau`.  The sort is stable, so equal scores keep their
/// newest-first candidate order.
pub fn rank_by_dot<T>(
    candidates: Vec<(T, Vec<f32>)>,
    query: &[f32],
    tau: f32,
    k: usize,
) -> Vec<SearchHit<T>> {
    let mut hits: Vec<SearchHit<T>> = candidates
        .into_iter()
        .filter_map(|(item, vector)| {
            let score = dot(&vector, query);
            (score > tau).then_some(SearchHit { item, score })
        })
        .collect();
    hits.sort_by(|a, b| b.score.total_cmp(&a.score));
    hits.truncate(k);
    hits
}

pub async fn search_journal(
    store: &Store,
    embedder: &Embedder,
    query: &str,
    k: usize,
) -> Result<Vec<SearchHit<JournalEntry>>, SearchError> {
    let query_vec = embedder.embed_query(query).await?;
    let candidates = store.list_journal_with_embeddings(N_CANDIDATES)?;
    Ok(rank_by_dot(candidates, &query_vec, TAU_JOURNAL, k))
}

pub async fn search_topics(
    store: &Store,
    embedder: &Embedder,
    query: &str,
    k: usize,
) -> Result<Vec<SearchHit<Topic>>, SearchError> {
    let query_vec = embedder.embed_query(query).await?;
    let candidates = store.list_topics_with_embeddings(N_CANDIDATES)?;
    Ok(rank_by_dot(candidates, &query_vec, TAU_TOPIC, k))
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ranks_by_similarity_and_applies_floor() {
        let candidates = vec![
            ("close", vec![0.9_f32, 0.435_889_9]), // unit-ish, high dot
            ("far", vec![0.0_f32, 1.0]),
            ("orthogonal-ish", vec![0.31_f32, 0.950_736_6]),
        ];
        let query = vec![1.0_f32, 0.0];

        let hits = rank_by_dot(candidates, &query, 0.30, 10);
        let names: Vec<&str> = hits.iter().map(|h| h.item).collect();
        assert_eq!(names, vec!["close", "orthogonal-ish"]);
        assert!(hits[0].score > hits[1].score);
    }

    #[test]
    fn top_k_truncates() {
        let candidates = vec![
            ("a", vec![1.0_f32]),
            ("b", vec![0.9_f32]),
            ("c", vec![0.8_f32]),
        ];
        let hits = rank_by_dot(candidates, &[1.0], 0.0, 2);
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].item, "a");
    }

    #[test]
    fn ties_keep_newest_first_candidate_order() {
        // Candidates arrive newest-first; equal scores must not reorder.
        let candidates = vec![("newest", vec![1.0_f32]), ("older", vec![1.0_f32])];
        let hits = rank_by_dot(candidates, &[1.0], 0.0, 2);
        assert_eq!(hits[0].item, "newest");
    }

    #[test]
    fn mismatched_dimensions_score_zero() {
        let candidates = vec![("bad", vec![1.0_f32, 0.0, 0.0])];
        let hits = rank_by_dot(candidates, &[1.0, 0.0], 0.5, 10);
        assert!(hits.is_empty());
    }
}
