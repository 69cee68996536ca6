//! Brute-force cosine retrieval over the in-memory corpus.
//!
//! The corpus is a few hundred chunks at most, so every query scores every
//! embedded document. Documents without an embedding, or whose similarity
//! is undefined, never match.

use crate::embedding::cosine_similarity;
use crate::models::{Document, SearchResult};

/// Rank `corpus` against `query` and keep the best `top_k` results whose
/// similarity is at least `min_similarity`, sorted descending.
///
/// Ties keep corpus order.
pub fn search_corpus(
    query: &[f32],
    corpus: &[Document],
    top_k: usize,
    min_similarity: f32,
) -> Vec<SearchResult> {
    if top_k == 0 {
        return Vec::new();
    }

    let mut scored: Vec<(usize, f32)> = corpus
        .iter()
        .enumerate()
        .filter_map(|(i, doc)| {
            let embedding = doc.embedding.as_deref()?;
            let sim = cosine_similarity(query, embedding)?;
            (sim >= min_similarity).then_some((i, sim))
        })
        .collect();

    scored.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
    scored.truncate(top_k);

    scored
        .into_iter()
        .map(|(i, similarity)| SearchResult {
            document: corpus[i].clone(),
            similarity,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::DocumentMetadata;

    fn doc(id: &str, embedding: Option<Vec<f32>>) -> Document {
        Document {
            id: id.to_string(),
            content: format!("conteúdo {}", id),
            metadata: DocumentMetadata {
                title: id.to_string(),
                source: "Documentos".to_string(),
                category: "incendios_florestais".to_string(),
                date: None,
            },
            embedding,
            hash: None,
        }
    }

    fn corpus() -> Vec<Document> {
        vec![
            doc("a", Some(vec![1.0, 0.0])),
            doc("b", Some(vec![0.9, 0.1])),
            doc("c", Some(vec![0.0, 1.0])),
            doc("d", None),
            doc("e", Some(vec![0.0, 0.0])),
            doc("f", Some(vec![0.95, 0.05])),
            doc("g", Some(vec![1.0, 0.01])),
        ]
    }

    #[test]
    fn test_results_sorted_bounded_and_thresholded() {
        let results = search_corpus(&[1.0, 0.0], &corpus(), 3, 0.9);
        assert_eq!(results.len(), 3);
        assert!(results.iter().all(|r| r.similarity >= 0.9));
        for pair in results.windows(2) {
            assert!(pair[0].similarity >= pair[1].similarity);
        }
        assert_eq!(results[0].document.id, "a");
    }

    #[test]
    fn test_no_match_returns_empty() {
        let results = search_corpus(&[-1.0, 0.0], &corpus(), 3, 0.9);
        assert!(results.is_empty());
    }

    #[test]
    fn test_skips_missing_and_zero_embeddings() {
        let results = search_corpus(&[1.0, 1.0], &corpus(), 10, -1.0);
        let ids: Vec<&str> = results.iter().map(|r| r.document.id.as_str()).collect();
        assert!(!ids.contains(&"d"));
        assert!(!ids.contains(&"e"));
        assert_eq!(ids.len(), 5);
    }

    #[test]
    fn test_zero_query_matches_nothing() {
        assert!(search_corpus(&[0.0, 0.0], &corpus(), 3, -1.0).is_empty());
    }

    #[test]
    fn test_dimension_mismatch_ignored() {
        assert!(search_corpus(&[1.0, 0.0, 0.0], &corpus(), 3, -1.0).is_empty());
    }

    #[test]
    fn test_top_k_zero() {
        assert!(search_corpus(&[1.0, 0.0], &corpus(), 0, -1.0).is_empty());
    }
}
