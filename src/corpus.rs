//! The assistant's document corpus: cache file I/O, the process-wide
//! in-memory cache, and query-time retrieval.
//!
//! The cache is loaded on first use and afterwards only replaced as a
//! whole. Readers take a cheap `Arc` snapshot, so a refresh never exposes a
//! half-loaded corpus.

use anyhow::{Context, Result};
use serde::Serialize;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use severus_core::chunk::prepare_text;
use severus_core::embedding::{embed_one, EmbeddingProvider};
use severus_core::models::{Document, SearchResult};
use severus_core::search::search_corpus;

use crate::config::Config;

/// Read the embeddings cache file.
pub async fn read_cache_file(path: &Path) -> Result<Vec<Document>> {
    let bytes = tokio::fs::read(path)
        .await
        .with_context(|| format!("Failed to read embeddings cache: {}", path.display()))?;
    serde_json::from_slice(&bytes)
        .with_context(|| format!("Invalid embeddings cache: {}", path.display()))
}

/// Write the cache through a temporary sibling file and rename it into
/// place. Returns the number of bytes written.
pub async fn write_cache_file(path: &Path, docs: &[Document]) -> Result<u64> {
    let json = serde_json::to_vec_pretty(docs)?;
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, &json)
        .await
        .with_context(|| format!("Failed to write {}", tmp.display()))?;
    tokio::fs::rename(&tmp, path)
        .await
        .with_context(|| format!("Failed to move cache into place: {}", path.display()))?;
    Ok(json.len() as u64)
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CorpusStats {
    /// Distinct source documents (chunk ids folded onto their file id).
    pub total_documents: usize,
    pub total_chunks: usize,
    pub categories: Vec<String>,
    pub has_embeddings: bool,
}

impl CorpusStats {
    pub fn from_documents(docs: &[Document]) -> Self {
        let sources: BTreeSet<&str> = docs.iter().map(|d| d.source_document_id()).collect();
        let categories: BTreeSet<&str> = docs.iter().map(|d| d.metadata.category.as_str()).collect();
        Self {
            total_documents: sources.len(),
            total_chunks: docs.len(),
            categories: categories.into_iter().map(str::to_string).collect(),
            has_embeddings: docs.iter().any(Document::has_embedding),
        }
    }
}

/// Process-wide document cache backed by the embeddings cache file.
pub struct DocumentCache {
    path: PathBuf,
    docs: RwLock<Option<Arc<Vec<Document>>>>,
}

impl DocumentCache {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            docs: RwLock::new(None),
        }
    }

    /// A cache pre-filled with `docs`; used when the corpus is built in memory.
    pub fn with_documents(path: impl Into<PathBuf>, docs: Vec<Document>) -> Self {
        Self {
            path: path.into(),
            docs: RwLock::new(Some(Arc::new(docs))),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn snapshot(&self) -> Option<Arc<Vec<Document>>> {
        self.docs
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Current corpus, loading the cache file on first use.
    pub async fn documents(&self) -> Result<Arc<Vec<Document>>> {
        if let Some(docs) = self.snapshot() {
            return Ok(docs);
        }
        self.refresh().await?;
        self.snapshot()
            .ok_or_else(|| anyhow::anyhow!("document cache is empty after load"))
    }

    /// Re-read the cache file and swap it in. Returns the chunk count.
    pub async fn refresh(&self) -> Result<usize> {
        let docs = read_cache_file(&self.path).await?;
        let count = docs.len();
        self.replace(docs);
        tracing::info!(chunks = count, path = %self.path.display(), "document cache loaded");
        Ok(count)
    }

    pub fn replace(&self, docs: Vec<Document>) {
        *self.docs.write().unwrap_or_else(|e| e.into_inner()) = Some(Arc::new(docs));
    }

    /// Drop the loaded corpus; the next read reloads the file.
    pub fn invalidate(&self) {
        *self.docs.write().unwrap_or_else(|e| e.into_inner()) = None;
    }

    pub async fn stats(&self) -> Result<CorpusStats> {
        Ok(CorpusStats::from_documents(&self.documents().await?))
    }
}

/// Query-time retrieval: embed the question and rank the corpus.
pub struct Retriever {
    cache: Arc<DocumentCache>,
    provider: Arc<dyn EmbeddingProvider>,
    max_input_chars: usize,
    top_k: usize,
    min_similarity: f32,
}

impl Retriever {
    pub fn new(config: &Config, cache: Arc<DocumentCache>, provider: Arc<dyn EmbeddingProvider>) -> Self {
        Self {
            cache,
            provider,
            max_input_chars: config.embedding.max_input_chars,
            top_k: config.rag.top_k,
            min_similarity: config.rag.min_similarity,
        }
    }

    pub fn cache(&self) -> &Arc<DocumentCache> {
        &self.cache
    }

    pub fn provider(&self) -> &Arc<dyn EmbeddingProvider> {
        &self.provider
    }

    /// Retrieve with the configured `top_k` and threshold.
    pub async fn retrieve(&self, query: &str) -> Result<Vec<SearchResult>> {
        self.search(query, self.top_k, self.min_similarity).await
    }

    pub async fn search(&self, query: &str, top_k: usize, min_similarity: f32) -> Result<Vec<SearchResult>> {
        let text = prepare_text(query, self.max_input_chars);
        if text.is_empty() {
            return Ok(Vec::new());
        }
        let docs = self.cache.documents().await?;
        let vector = embed_one(self.provider.as_ref(), &text).await?;
        let results = search_corpus(&vector, &docs, top_k, min_similarity);
        tracing::debug!(hits = results.len(), "corpus search");
        Ok(results)
    }
}

/// `severus status`: print cache readiness and statistics.
pub async fn run_status(config: &Config) -> Result<()> {
    let cache = DocumentCache::new(&config.rag.cache_path);
    println!("cache: {}", cache.path().display());
    match cache.stats().await {
        Ok(stats) => {
            println!("  ready: {}", stats.total_chunks > 0 && stats.has_embeddings);
            println!("  documents: {}", stats.total_documents);
            println!("  chunks: {}", stats.total_chunks);
            println!("  categories: {}", stats.categories.join(", "));
            println!("  embeddings: {}", if stats.has_embeddings { "yes" } else { "no" });
        }
        Err(e) => {
            println!("  ready: false");
            eprintln!("Warning: {:#}", e);
        }
    }
    Ok(())
}

/// `severus search`: run retrieval from the command line.
pub async fn run_search(
    config: &Config,
    provider: Arc<dyn EmbeddingProvider>,
    query: &str,
    top_k: Option<usize>,
    min_similarity: Option<f32>,
) -> Result<()> {
    if query.trim().is_empty() {
        anyhow::bail!("query must not be empty");
    }
    let cache = Arc::new(DocumentCache::new(&config.rag.cache_path));
    let retriever = Retriever::new(config, cache, provider);
    let results = retriever
        .search(
            query,
            top_k.unwrap_or(config.rag.top_k),
            min_similarity.unwrap_or(config.rag.min_similarity),
        )
        .await?;

    if results.is_empty() {
        println!("No results.");
        return Ok(());
    }
    for (i, result) in results.iter().enumerate() {
        println!(
            "{}. [{:.3}] {}",
            i + 1,
            result.similarity,
            result.document.metadata.title
        );
        println!("    id: {}", result.document.id);
        println!("    {}", prepare_text(&result.document.content, 160));
        println!();
    }
    Ok(())
}
