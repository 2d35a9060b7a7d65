//! Text → unit-vector embedding client over the Ollama embeddings endpoint.
//!
//! Two entry points: [`Embedder::embed_document`] for documents (journal
//! entries, topics) and [`Embedder::embed_query`] for search queries, which
//! prepends the retrieval-instruction prefix the embedding model was trained
//! with.  Collapsing the two degrades retrieval.

use std::time::Duration;

use serde::Deserialize;
use tracing::debug;

/// Prefix prepended to every query embedding, never to documents.
pub const QUERY_PREFIX: &str = "Represent this sentence for searching relevant passages: ";

#[derive(Debug, thiserror::Error)]
pub enum EmbedError {
    /// Transport failure or an empty/invalid model response.  Callers decide
    /// whether to skip embedding (writes) or abort (searches).
    #[error("embedder unavailable: {0}")]
    Unavailable(String),
}

pub struct Embedder {
    client: reqwest::Client,
    url: String,
    model: String,
}

impl Embedder {
    pub fn new(base_url: &str, model: &str, timeout: Duration) -> Result<Self, EmbedError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| EmbedError::Unavailable(e.to_string()))?;
        Ok(Self {
            client,
            url: format!("{}/api/embeddings", base_url.trim_end_matches('/')),
            model: model.to_string(),
        })
    }

    pub async fn embed_document(&self, text: &str) -> Result<Vec<f32>, EmbedError> {
        self.embed_raw(text).await
    }

    pub async fn embed_query(&self, text: &str) -> Result<Vec<f32>, EmbedError> {
        self.embed_raw(&format!("{QUERY_PREFIX}{text}")).await
    }

    async fn embed_raw(&self, prompt: &str) -> Result<Vec<f32>, EmbedError> {
        #[derive(Deserialize)]
        struct EmbeddingResponse {
            #[serde(default)]
            embedding: Vec<f32>,
        }

        let body = serde_json::json!({ "model": self.model, "prompt": prompt });
        let response = self
            .client
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .map_err(|e| EmbedError::Unavailable(e.to_string()))?
            .error_for_status()
            .map_err(|e| EmbedError::Unavailable(e.to_string()))?;

        let parsed: EmbeddingResponse = response
            .json()
            .await
            .map_err(|e| EmbedError::Unavailable(e.to_string()))?;

        let mut vector = parsed.embedding;
        if !normalize(&mut vector) {
            return Err(EmbedError::Unavailable(
                "model returned an empty or zero embedding".to_string(),
            ));
        }
        debug!(dim = vector.len(), "embedded text");
        Ok(vector)
    }
}

/// Scale `vector` to unit length in place.  Returns `false` for empty or
/// zero vectors, which cannot be normalised.
pub fn normalize(vector: &mut [f32]) -> bool {
    let magnitude: f32 = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if magnitude == 0.0 || !magnitude.is_finite() {
        return false;
    }
    for v in vector.iter_mut() {
        *v /= magnitude;
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_produces_unit_vector() {
        let mut v = vec![3.0_f32, 4.0];
        assert!(normalize(&mut v));
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-4);
        assert!((v[0] - 0.6).abs() < 1e-6);
        assert!((v[1] - 0.8).abs() < 1e-6);
    }

    #[test]
    fn normalize_rejects_zero_and_empty() {
        let mut zero = vec![0.0_f32, 0.0];
        assert!(!normalize(&mut zero));
        let mut empty: Vec<f32> = Vec::new();
        assert!(!normalize(&mut empty));
    }

    #[test]
    fn query_prefix_differs_from_document_text() {
        // The prompt sent for a query must never equal the document form of
        // the same text.
        let text = "cats purr";
        assert_ne!(format!("{QUERY_PREFIX}{text}"), text);
        assert!(QUERY_PREFIX.ends_with(": "));
    }
}
