//! Core data models shared by ingestion, retrieval, and the chat path.
//!
//! A [`Document`] is one embedded chunk of the assistant's corpus. The
//! serialized field names match the on-disk embeddings cache, so the same
//! struct is used to load and to write it.

use serde::{Deserialize, Serialize};

/// A chunk of corpus text plus the vector it was embedded to.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Document {
    /// Unique chunk id: `<file>` or `<file>_chunk_<i>`.
    pub id: String,
    pub content: String,
    pub metadata: DocumentMetadata,
    /// Absent when the embedding provider failed for this chunk.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
    /// SHA-256 of `content`, used to reuse embeddings on re-ingestion.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
}

impl Document {
    /// Id of the source document this chunk was cut from.
    pub fn source_document_id(&self) -> &str {
        match self.id.find("_chunk_") {
            Some(pos) => &self.id[..pos],
            None => &self.id,
        }
    }

    pub fn has_embedding(&self) -> bool {
        self.embedding.as_ref().is_some_and(|v| !v.is_empty())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DocumentMetadata {
    pub title: String,
    pub source: String,
    pub category: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date: Option<String>,
}

/// A document paired with its cosine similarity to a query.
#[derive(Debug, Clone, Serialize)]
pub struct SearchResult {
    pub document: Document,
    pub similarity: f32,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(id: &str) -> Document {
        Document {
            id: id.to_string(),
            content: "texto".to_string(),
            metadata: DocumentMetadata {
                title: "t".to_string(),
                source: "s".to_string(),
                category: "c".to_string(),
                date: None,
            },
            embedding: None,
            hash: None,
        }
    }

    #[test]
    fn test_source_document_id() {
        assert_eq!(doc("guia.pdf_chunk_3").source_document_id(), "guia.pdf");
        assert_eq!(doc("notas.txt").source_document_id(), "notas.txt");
    }

    #[test]
    fn test_cache_record_without_embedding_parses() {
        let json = r#"{"id":"a","content":"x","metadata":{"title":"A","source":"S","category":"C"}}"#;
        let d: Document = serde_json::from_str(json).unwrap();
        assert!(!d.has_embedding());
        assert!(d.metadata.date.is_none());
    }

    #[test]
    fn test_role_serializes_lowercase() {
        let m = ChatMessage::new(Role::Assistant, "ola");
        let v = serde_json::to_value(&m).unwrap();
        assert_eq!(v["role"], "assistant");
    }
}
