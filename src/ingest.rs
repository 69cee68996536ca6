//! Corpus ingestion: source files → text → chunks → embeddings → cache.
//!
//! Runs offline (`severus ingest`) or behind `POST /rag/init`. Records keep a
//! SHA-256 of their content, so a re-run only embeds new or changed chunks
//! unless `--full` is given. A failed embedding batch leaves its chunks
//! without vectors and is counted; it never aborts the run.

use anyhow::{bail, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use severus_core::chunk::{content_hash, normalize_document, prepare_text, split_into_chunks};
use severus_core::embedding::EmbeddingProvider;
use severus_core::models::{Document, DocumentMetadata};

use crate::config::{Config, RagConfig};
use crate::corpus::{read_cache_file, write_cache_file};
use crate::extract::extract_file;

#[derive(Debug, Clone, Copy, Default)]
pub struct IngestOptions {
    /// Scan and chunk only; nothing is embedded or written.
    pub dry_run: bool,
    /// Ignore the existing cache and re-embed every chunk.
    pub full: bool,
}

#[derive(Debug, Clone, Default, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestReport {
    pub files_found: usize,
    pub documents: usize,
    pub skipped: usize,
    pub chunks: usize,
    pub embedded: usize,
    pub reused: usize,
    pub failed: usize,
    pub avg_chunk_chars: usize,
    pub cache_bytes: u64,
    pub dry_run: bool,
}

impl IngestReport {
    pub fn print(&self) {
        if self.dry_run {
            println!("ingest (dry-run)");
        } else {
            println!("ingest");
        }
        println!("  files found: {}", self.files_found);
        println!("  documents: {}", self.documents);
        println!("  skipped: {}", self.skipped);
        println!("  chunks: {}", self.chunks);
        println!("  average chunk size: {} chars", self.avg_chunk_chars);
        if !self.dry_run {
            println!("  embedded: {}", self.embedded);
            println!("  reused: {}", self.reused);
            println!("  failed: {}", self.failed);
            println!("  cache size: {} KB", self.cache_bytes / 1024);
        }
        println!("ok");
    }
}

/// A corpus file: absolute path and the id it is stored under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceFile {
    pub path: PathBuf,
    /// Path relative to `docs_root`, with `/` separators.
    pub id: String,
}

/// List the corpus files under `docs_root`, sorted by id.
pub fn scan_corpus(rag: &RagConfig) -> Result<Vec<SourceFile>> {
    let root = &rag.docs_root;
    if !root.is_dir() {
        bail!("Document folder does not exist: {}", root.display());
    }

    let include_set = build_globset(&rag.include_globs)?;
    let mut excludes = vec!["**/.*".to_string(), "**/~$*".to_string()];
    excludes.extend(rag.exclude_globs.iter().cloned());
    let exclude_set = build_globset(&excludes)?;

    let mut files = Vec::new();
    for entry in WalkDir::new(root) {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        let relative = path.strip_prefix(root).unwrap_or(path);
        let rel_str = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");

        if exclude_set.is_match(&rel_str) || !include_set.is_match(&rel_str) {
            continue;
        }
        files.push(SourceFile {
            path: path.to_path_buf(),
            id: rel_str,
        });
    }

    files.sort_by(|a, b| a.id.cmp(&b.id));
    Ok(files)
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(builder.build()?)
}

/// Cut one document's text into cache records (without embeddings).
///
/// A single chunk keeps the file id and title; otherwise ids are
/// `<file>_chunk_<i>` and titles gain a `(Parte i+1)` suffix.
pub fn document_chunks(file_id: &str, text: &str, rag: &RagConfig, date: &str) -> Vec<Document> {
    let title = Path::new(file_id)
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| file_id.to_string());
    let chunks = split_into_chunks(&normalize_document(text), rag.chunk_max_chars);
    let single = chunks.len() == 1;

    chunks
        .into_iter()
        .enumerate()
        .map(|(i, content)| {
            let (id, chunk_title) = if single {
                (file_id.to_string(), title.clone())
            } else {
                (format!("{}_chunk_{}", file_id, i), format!("{} (Parte {})", title, i + 1))
            };
            Document {
                id,
                hash: Some(content_hash(&content)),
                content,
                metadata: DocumentMetadata {
                    title: chunk_title,
                    source: rag.source_label.clone(),
                    category: rag.category.clone(),
                    date: Some(date.to_string()),
                },
                embedding: None,
            }
        })
        .collect()
}

/// Extract each file on the blocking pool; PDF parsing is CPU-bound and a
/// panicking parser only fails its own file.
pub async fn extract_all(files: Vec<SourceFile>) -> Vec<(SourceFile, Result<String>)> {
    let mut extracted = Vec::with_capacity(files.len());
    for file in files {
        let path = file.path.clone();
        let text = match tokio::task::spawn_blocking(move || extract_file(&path)).await {
            Ok(text) => text,
            Err(e) => Err(anyhow::anyhow!("extraction task failed: {}", e)),
        };
        extracted.push((file, text));
    }
    extracted
}

/// Run a full ingestion and write the cache.
pub async fn run_ingest(
    config: &Config,
    provider: &dyn EmbeddingProvider,
    options: IngestOptions,
) -> Result<(IngestReport, Vec<Document>)> {
    let rag = config.rag.clone();
    let files = tokio::task::spawn_blocking(move || scan_corpus(&rag)).await??;
    let date = chrono::Utc::now().format("%Y-%m-%d").to_string();

    let mut report = IngestReport {
        files_found: files.len(),
        dry_run: options.dry_run,
        ..Default::default()
    };
    let mut docs: Vec<Document> = Vec::new();

    for (file, extracted) in extract_all(files).await {
        let text = match extracted {
            Ok(text) => text,
            Err(e) => {
                tracing::warn!(file = %file.id, error = %e, "skipping unreadable document");
                report.skipped += 1;
                continue;
            }
        };
        let chunks = document_chunks(&file.id, &text, &config.rag, &date);
        if chunks.is_empty() {
            tracing::warn!(file = %file.id, "skipping empty document");
            report.skipped += 1;
            continue;
        }
        report.documents += 1;
        docs.extend(chunks);
    }

    report.chunks = docs.len();
    if !docs.is_empty() {
        let total: usize = docs.iter().map(|d| d.content.chars().count()).sum();
        report.avg_chunk_chars = total / docs.len();
    }

    if options.dry_run {
        return Ok((report, docs));
    }

    let previous = if options.full {
        HashMap::new()
    } else {
        previous_embeddings(&config.rag.cache_path, provider.dims()).await
    };

    let mut pending: Vec<usize> = Vec::new();
    for (i, doc) in docs.iter_mut().enumerate() {
        match doc.hash.as_ref().and_then(|h| previous.get(h)) {
            Some(embedding) => {
                doc.embedding = Some(embedding.clone());
                report.reused += 1;
            }
            None => pending.push(i),
        }
    }

    for batch in pending.chunks(config.embedding.batch_size.max(1)) {
        let texts: Vec<String> = batch
            .iter()
            .map(|&i| prepare_text(&docs[i].content, config.embedding.max_input_chars))
            .collect();
        match provider.embed(&texts).await {
            Ok(vectors) if vectors.len() == batch.len() => {
                for (&i, vector) in batch.iter().zip(vectors) {
                    docs[i].embedding = Some(vector);
                }
                report.embedded += batch.len();
            }
            Ok(vectors) => {
                tracing::warn!(
                    expected = batch.len(),
                    got = vectors.len(),
                    "embedding batch size mismatch"
                );
                report.failed += batch.len();
            }
            Err(e) => {
                tracing::warn!(error = %e, chunks = batch.len(), "embedding batch failed");
                report.failed += batch.len();
            }
        }
    }

    report.cache_bytes = write_cache_file(&config.rag.cache_path, &docs).await?;
    tracing::info!(
        chunks = report.chunks,
        embedded = report.embedded,
        reused = report.reused,
        failed = report.failed,
        "embeddings cache written"
    );
    Ok((report, docs))
}

/// Embeddings from the existing cache, keyed by content hash. Vectors of
/// another dimensionality are ignored.
async fn previous_embeddings(path: &Path, dims: usize) -> HashMap<String, Vec<f32>> {
    let docs = match read_cache_file(path).await {
        Ok(docs) => docs,
        Err(_) => return HashMap::new(),
    };
    docs.into_iter()
        .filter_map(|d| {
            let embedding = d.embedding.filter(|e| !e.is_empty() && e.len() == dims)?;
            Some((d.hash?, embedding))
        })
        .collect()
}
