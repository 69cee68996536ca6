//! TOML configuration.
//!
//! Every section except `[server]` is optional and falls back to the
//! defaults below. Secrets are never read from the file: the Earth Engine
//! token, the chat API key and the OpenAI key are taken from the
//! environment variables the file names.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub server: ServerConfig,
    #[serde(default)]
    pub earth_engine: EarthEngineConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub rag: RagConfig,
    #[serde(default)]
    pub chat: ChatConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub bind: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct EarthEngineConfig {
    #[serde(default = "default_ee_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub project: Option<String>,
    #[serde(default = "default_ee_token_env")]
    pub access_token_env: String,
    /// Re-read on every request so an external refresher can rotate it.
    #[serde(default)]
    pub access_token_file: Option<PathBuf>,
    #[serde(default = "default_ee_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub burned_areas: BurnedAreasConfig,
    /// Ring used when a request carries no geometry.
    #[serde(default = "default_region_of_interest")]
    pub region_of_interest: Vec<[f64; 2]>,
}

impl Default for EarthEngineConfig {
    fn default() -> Self {
        Self {
            base_url: default_ee_base_url(),
            project: None,
            access_token_env: default_ee_token_env(),
            access_token_file: None,
            timeout_secs: default_ee_timeout_secs(),
            burned_areas: BurnedAreasConfig::default(),
            region_of_interest: default_region_of_interest(),
        }
    }
}

fn default_ee_base_url() -> String {
    "https://earthengine.googleapis.com/v1".to_string()
}
fn default_ee_token_env() -> String {
    "EE_ACCESS_TOKEN".to_string()
}
fn default_ee_timeout_secs() -> u64 {
    120
}
fn default_region_of_interest() -> Vec<[f64; 2]> {
    vec![[-9.6, 42.2], [-6.2, 42.2], [-6.2, 36.8], [-9.6, 36.8]]
}

/// Burned-area tables and the property holding each feature's year.
#[derive(Debug, Deserialize, Clone)]
pub struct BurnedAreasConfig {
    #[serde(default = "default_icnf")]
    pub icnf: BurnedAreaTable,
    #[serde(default = "default_effis")]
    pub effis: BurnedAreaTable,
}

impl Default for BurnedAreasConfig {
    fn default() -> Self {
        Self {
            icnf: default_icnf(),
            effis: default_effis(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct BurnedAreaTable {
    pub asset: String,
    pub year_field: String,
}

fn default_icnf() -> BurnedAreaTable {
    BurnedAreaTable {
        asset: "users/joaofgo/severus_pt/AA_ICNF_2000_2021_PT_v2".to_string(),
        year_field: "Ano".to_string(),
    }
}
fn default_effis() -> BurnedAreaTable {
    BurnedAreaTable {
        asset: "users/joaofgo/severus_pt/effis_all".to_string(),
        year_field: "year".to_string(),
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    /// Base URL for the `openai` (OpenAI-compatible) and `ollama` providers.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_openai_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_input_chars")]
    pub max_input_chars: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            dims: None,
            url: None,
            api_key_env: default_openai_key_env(),
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
            max_input_chars: default_max_input_chars(),
        }
    }
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_openai_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}
fn default_batch_size() -> usize {
    64
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_max_input_chars() -> usize {
    512
}

#[derive(Debug, Deserialize, Clone)]
pub struct RagConfig {
    #[serde(default = "default_cache_path")]
    pub cache_path: PathBuf,
    #[serde(default = "default_docs_root")]
    pub docs_root: PathBuf,
    #[serde(default = "default_include_globs")]
    pub include_globs: Vec<String>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
    #[serde(default = "default_chunk_max_chars")]
    pub chunk_max_chars: usize,
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default = "default_min_similarity")]
    pub min_similarity: f32,
    #[serde(default = "default_source_label")]
    pub source_label: String,
    #[serde(default = "default_category")]
    pub category: String,
}

impl Default for RagConfig {
    fn default() -> Self {
        Self {
            cache_path: default_cache_path(),
            docs_root: default_docs_root(),
            include_globs: default_include_globs(),
            exclude_globs: Vec::new(),
            chunk_max_chars: default_chunk_max_chars(),
            top_k: default_top_k(),
            min_similarity: default_min_similarity(),
            source_label: default_source_label(),
            category: default_category(),
        }
    }
}

fn default_cache_path() -> PathBuf {
    PathBuf::from("./embeddings_cache.json")
}
fn default_docs_root() -> PathBuf {
    PathBuf::from("./static/docs")
}
fn default_include_globs() -> Vec<String> {
    ["**/*.pdf", "**/*.docx", "**/*.txt", "**/*.md"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}
fn default_chunk_max_chars() -> usize {
    800
}
fn default_top_k() -> usize {
    3
}
fn default_min_similarity() -> f32 {
    0.65
}
fn default_source_label() -> String {
    "Documentos SeverusPT".to_string()
}
fn default_category() -> String {
    "incendios_florestais".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChatConfig {
    #[serde(default = "default_chat_base_url")]
    pub base_url: String,
    #[serde(default = "default_chat_model")]
    pub model: String,
    #[serde(default = "default_chat_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_chat_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_chat_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_retrieval_timeout_secs")]
    pub retrieval_timeout_secs: u64,
    #[serde(default = "default_context_budget_chars")]
    pub context_budget_chars: usize,
    #[serde(default = "default_snippet_chars")]
    pub snippet_chars: usize,
    #[serde(default = "default_language")]
    pub language: String,
    #[serde(default = "default_referer")]
    pub referer: String,
    #[serde(default = "default_title")]
    pub title: String,
    #[serde(default = "default_fallback_reply")]
    pub fallback_reply: String,
    #[serde(default = "default_empty_reply")]
    pub empty_reply: String,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            base_url: default_chat_base_url(),
            model: default_chat_model(),
            api_key_env: default_chat_key_env(),
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            timeout_secs: default_chat_timeout_secs(),
            max_retries: default_chat_max_retries(),
            backoff_base_ms: default_backoff_base_ms(),
            retrieval_timeout_secs: default_retrieval_timeout_secs(),
            context_budget_chars: default_context_budget_chars(),
            snippet_chars: default_snippet_chars(),
            language: default_language(),
            referer: default_referer(),
            title: default_title(),
            fallback_reply: default_fallback_reply(),
            empty_reply: default_empty_reply(),
        }
    }
}

fn default_chat_base_url() -> String {
    "https://openrouter.ai/api/v1".to_string()
}
fn default_chat_model() -> String {
    "deepseek/deepseek-r1-0528:free".to_string()
}
fn default_chat_key_env() -> String {
    "OPENROUTER_API_KEY".to_string()
}
fn default_temperature() -> f32 {
    0.7
}
fn default_max_tokens() -> u32 {
    800
}
fn default_chat_timeout_secs() -> u64 {
    15
}
fn default_chat_max_retries() -> u32 {
    2
}
fn default_backoff_base_ms() -> u64 {
    1000
}
fn default_retrieval_timeout_secs() -> u64 {
    5
}
fn default_context_budget_chars() -> usize {
    1500
}
fn default_snippet_chars() -> usize {
    500
}
fn default_language() -> String {
    "português europeu".to_string()
}
fn default_referer() -> String {
    "https://severus.pt".to_string()
}
fn default_title() -> String {
    "SeverusBot".to_string()
}
fn default_fallback_reply() -> String {
    "Erro temporário no serviço. Por favor, tente novamente.".to_string()
}
fn default_empty_reply() -> String {
    "Não foi possível gerar uma resposta.".to_string()
}

impl Config {
    /// Configuration with every default and the given bind address.
    pub fn minimal(bind: &str) -> Self {
        Self {
            server: ServerConfig {
                bind: bind.to_string(),
            },
            earth_engine: EarthEngineConfig::default(),
            embedding: EmbeddingConfig::default(),
            rag: RagConfig::default(),
            chat: ChatConfig::default(),
        }
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    if config.server.bind.trim().is_empty() {
        anyhow::bail!("server.bind must not be empty");
    }

    // Earth Engine
    if config.earth_engine.timeout_secs == 0 {
        anyhow::bail!("earth_engine.timeout_secs must be > 0");
    }
    if config.earth_engine.region_of_interest.len() < 3 {
        anyhow::bail!("earth_engine.region_of_interest needs at least 3 positions");
    }

    // Embedding
    match config.embedding.provider.as_str() {
        "disabled" | "openai" | "ollama" | "local" => {}
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be disabled, openai, ollama, or local.",
            other
        ),
    }
    if config.embedding.is_enabled() {
        if config.embedding.dims.is_none() || config.embedding.dims == Some(0) {
            anyhow::bail!(
                "embedding.dims must be > 0 when provider is '{}'",
                config.embedding.provider
            );
        }
        if config.embedding.model.is_none() && config.embedding.provider != "local" {
            anyhow::bail!(
                "embedding.model must be specified when provider is '{}'",
                config.embedding.provider
            );
        }
    }
    if config.embedding.batch_size == 0 {
        anyhow::bail!("embedding.batch_size must be > 0");
    }
    if config.embedding.max_input_chars == 0 {
        anyhow::bail!("embedding.max_input_chars must be > 0");
    }

    // RAG
    if config.rag.chunk_max_chars == 0 {
        anyhow::bail!("rag.chunk_max_chars must be > 0");
    }
    if config.rag.top_k == 0 {
        anyhow::bail!("rag.top_k must be >= 1");
    }
    if !(-1.0..=1.0).contains(&config.rag.min_similarity) {
        anyhow::bail!("rag.min_similarity must be in [-1.0, 1.0]");
    }

    // Chat
    if config.chat.timeout_secs == 0 || config.chat.retrieval_timeout_secs == 0 {
        anyhow::bail!("chat.timeout_secs and chat.retrieval_timeout_secs must be > 0");
    }
    if !(0.0..=2.0).contains(&config.chat.temperature) {
        anyhow::bail!("chat.temperature must be in [0.0, 2.0]");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(toml_src: &str) -> Result<Config> {
        let config: Config = toml::from_str(toml_src)?;
        validate(&config)?;
        Ok(config)
    }

    #[test]
    fn test_minimal_file_uses_defaults() {
        let config = parse("[server]\nbind = \"127.0.0.1:7331\"\n").unwrap();
        assert_eq!(config.rag.top_k, 3);
        assert_eq!(config.rag.min_similarity, 0.65);
        assert_eq!(config.rag.chunk_max_chars, 800);
        assert_eq!(config.chat.max_retries, 2);
        assert_eq!(config.chat.context_budget_chars, 1500);
        assert_eq!(config.earth_engine.burned_areas.icnf.year_field, "Ano");
        assert_eq!(config.earth_engine.region_of_interest.len(), 4);
        assert!(!config.embedding.is_enabled());
    }

    #[test]
    fn test_enabled_provider_needs_dims() {
        let err = parse(
            "[server]\nbind = \"x:1\"\n[embedding]\nprovider = \"openai\"\nmodel = \"m\"\n",
        )
        .unwrap_err();
        assert!(err.to_string().contains("embedding.dims"));
    }

    #[test]
    fn test_unknown_provider_rejected() {
        let err = parse("[server]\nbind = \"x:1\"\n[embedding]\nprovider = \"magic\"\n").unwrap_err();
        assert!(err.to_string().contains("Unknown embedding provider"));
    }

    #[test]
    fn test_bad_similarity_rejected() {
        let err = parse("[server]\nbind = \"x:1\"\n[rag]\nmin_similarity = 3.0\n").unwrap_err();
        assert!(err.to_string().contains("rag.min_similarity"));
    }
}
