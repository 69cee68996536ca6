//! Embedding provider trait and vector similarity.
//!
//! Concrete providers (OpenAI-compatible, Ollama, local fastembed) live in
//! the `severus` app crate. Core code only needs [`EmbeddingProvider`] and
//! [`cosine_similarity`].

use anyhow::Result;
use async_trait::async_trait;

/// Trait for embedding providers.
///
/// Implementations return one vector per input text, in input order.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Returns the model identifier (e.g. `"multilingual-e5-small"`).
    fn model_name(&self) -> &str;
    /// Returns the embedding vector dimensionality (e.g. `384`).
    fn dims(&self) -> usize;
    /// Embed a batch of texts.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

/// Embed a single text.
pub async fn embed_one(provider: &dyn EmbeddingProvider, text: &str) -> Result<Vec<f32>> {
    provider
        .embed(&[text.to_string()])
        .await?
        .into_iter()
        .next()
        .ok_or_else(|| anyhow::anyhow!("Empty embedding response"))
}

/// Compute cosine similarity between two embedding vectors.
///
/// Returns `None` when the similarity is undefined: empty vectors, vectors
/// of different lengths, an all-zero vector, or non-finite components.
/// Defined results are clamped to `[-1.0, 1.0]` to absorb rounding.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> Option<f32> {
    if a.len() != b.len() || a.is_empty() {
        return None;
    }

    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;

    for (x, y) in a.iter().zip(b.iter()) {
        let (x, y) = (*x as f64, *y as f64);
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if !denom.is_finite() || denom < f64::EPSILON {
        return None;
    }

    let sim = dot / denom;
    if sim.is_nan() {
        return None;
    }
    Some(sim.clamp(-1.0, 1.0) as f32)
}
