//! Configuration parsing and validation.
//!
//! Report Chat is configured by a TOML file (default
//! `./config/report-chat.toml`). Every section and field has a default, so
//! an empty file is a valid local configuration. Environment variables
//! listed in [`apply_env_overrides`] take precedence over the file.
//!
//! # Example
//!
//! ```toml
//! [vector_store]
//! provider = "weaviate"
//! index_name = "ReportChunks"
//!
//! [record_store]
//! url = "sqlite://./data/records.sqlite"
//!
//! [chunking]
//! max_tokens = 1000
//! overlap_tokens = 50
//!
//! [retrieval]
//! k = 8
//!
//! [embedding]
//! provider = "openai"
//! model = "text-embedding-ada-002"
//! dims = 1536
//!
//! [llm]
//! provider = "openai"
//! model = "gpt-3.5-turbo-16k"
//!
//! [server]
//! bind = "0.0.0.0:8080"
//! ```

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use report_chat_core::index::CleanupMode;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub vector_store: VectorStoreConfig,
    #[serde(default)]
    pub record_store: RecordStoreConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub reports: ReportsConfig,
    #[serde(default)]
    pub tracing: TracingConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct VectorStoreConfig {
    /// `"sqlite"` (local, brute-force cosine) or `"weaviate"`.
    #[serde(default = "default_vector_provider")]
    pub provider: String,
    #[serde(default = "default_index_name")]
    pub index_name: String,
    /// SQLite database file used when `provider = "sqlite"`.
    #[serde(default = "default_vector_path")]
    pub path: PathBuf,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for VectorStoreConfig {
    fn default() -> Self {
        Self {
            provider: default_vector_provider(),
            index_name: default_index_name(),
            path: default_vector_path(),
            url: None,
            api_key: None,
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl VectorStoreConfig {
    /// Record-store namespace for this index: `"{provider}/{index_name}"`.
    pub fn namespace(&self) -> String {
        format!("{}/{}", self.provider, self.index_name)
    }
}

fn default_vector_provider() -> String {
    "sqlite".to_string()
}
fn default_index_name() -> String {
    "ReportChunks".to_string()
}
fn default_vector_path() -> PathBuf {
    PathBuf::from("./data/vectors.sqlite")
}

#[derive(Debug, Deserialize, Clone)]
pub struct RecordStoreConfig {
    /// Connection string, e.g. `sqlite://./data/records.sqlite`.
    #[serde(default = "default_record_url")]
    pub url: String,
}

impl Default for RecordStoreConfig {
    fn default() -> Self {
        Self {
            url: default_record_url(),
        }
    }
}

fn default_record_url() -> String {
    "sqlite://./data/records.sqlite".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
    #[serde(default = "default_overlap")]
    pub overlap_tokens: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_tokens: default_max_tokens(),
            overlap_tokens: default_overlap(),
        }
    }
}

fn default_max_tokens() -> usize {
    1000
}
fn default_overlap() -> usize {
    50
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_k")]
    pub k: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self { k: default_k() }
    }
}

fn default_k() -> usize {
    8
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_openai_base_url")]
    pub base_url: String,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            dims: None,
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
            base_url: default_openai_base_url(),
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
fn default_batch_size() -> usize {
    200
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_openai_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct LlmConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_llm_model")]
    pub model: String,
    #[serde(default)]
    pub temperature: f32,
    #[serde(default = "default_llm_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_openai_base_url")]
    pub base_url: String,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: default_llm_model(),
            temperature: 0.0,
            timeout_secs: default_llm_timeout_secs(),
            base_url: default_openai_base_url(),
        }
    }
}

fn default_llm_model() -> String {
    "gpt-3.5-turbo-16k".to_string()
}
fn default_llm_timeout_secs() -> u64 {
    120
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "0.0.0.0:8080".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct IngestConfig {
    #[serde(default = "default_reports_dir")]
    pub reports_dir: PathBuf,
    #[serde(default = "default_include_globs")]
    pub include_globs: Vec<String>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
    #[serde(default)]
    pub follow_symlinks: bool,
    /// `"full"` or `"incremental"`.
    #[serde(default = "default_cleanup")]
    pub cleanup: String,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            reports_dir: default_reports_dir(),
            include_globs: default_include_globs(),
            exclude_globs: Vec::new(),
            follow_symlinks: false,
            cleanup: default_cleanup(),
        }
    }
}

impl IngestConfig {
    pub fn cleanup_mode(&self) -> Result<CleanupMode> {
        self.cleanup.parse()
    }
}

fn default_reports_dir() -> PathBuf {
    PathBuf::from("reports")
}
fn default_include_globs() -> Vec<String> {
    vec!["**/*.pdf".to_string()]
}
fn default_cleanup() -> String {
    "full".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct ReportsConfig {
    /// JSON array of `{file, name, author, date_published}` objects.
    #[serde(default = "default_metadata_path")]
    pub metadata_path: PathBuf,
    /// Removed from a document's file path before metadata lookup.
    #[serde(default = "default_strip_prefix")]
    pub strip_prefix: String,
}

impl Default for ReportsConfig {
    fn default() -> Self {
        Self {
            metadata_path: default_metadata_path(),
            strip_prefix: default_strip_prefix(),
        }
    }
}

fn default_metadata_path() -> PathBuf {
    PathBuf::from("reports_metadata.json")
}
fn default_strip_prefix() -> String {
    "reports/".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct TracingConfig {
    /// `"langsmith"` or `"disabled"`.
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_langsmith_endpoint")]
    pub endpoint: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_project")]
    pub project: String,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_retry_base_ms")]
    pub retry_base_ms: u64,
    #[serde(default = "default_retry_max_ms")]
    pub retry_max_ms: u64,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            endpoint: default_langsmith_endpoint(),
            api_key: None,
            project: default_project(),
            max_attempts: default_max_attempts(),
            retry_base_ms: default_retry_base_ms(),
            retry_max_ms: default_retry_max_ms(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_langsmith_endpoint() -> String {
    "https://api.smith.langchain.com".to_string()
}
fn default_project() -> String {
    "default".to_string()
}
fn default_max_attempts() -> u32 {
    5
}
fn default_retry_base_ms() -> u64 {
    1000
}
fn default_retry_max_ms() -> u64 {
    8000
}

/// Read, override from the process environment, and validate a config file.
///
/// A missing file yields the defaults, so a deployment can be configured
/// entirely through the environment.
pub fn load_config(path: &Path) -> Result<Config> {
    let mut config: Config = if path.exists() {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        toml::from_str(&content).with_context(|| "Failed to parse config file")?
    } else {
        tracing::warn!(path = %path.display(), "config file not found; using defaults");
        Config::default()
    };

    apply_env_overrides(&mut config, |key| std::env::var(key).ok());
    validate(&config)?;
    Ok(config)
}

/// Apply environment overrides using `lookup` to read variables.
///
/// | Variable | Field |
/// |----------|-------|
/// | `WEAVIATE_URL` | `vector_store.url` |
/// | `WEAVIATE_API_KEY` | `vector_store.api_key` |
/// | `RECORD_MANAGER_DB_URL` | `record_store.url` |
/// | `LANGCHAIN_API_KEY` | `tracing.api_key` (and enables LangSmith) |
/// | `LANGCHAIN_ENDPOINT` | `tracing.endpoint` |
/// | `LANGCHAIN_PROJECT` | `tracing.project` |
pub fn apply_env_overrides(config: &mut Config, lookup: impl Fn(&str) -> Option<String>) {
    let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

    if let Some(url) = get("WEAVIATE_URL") {
        config.vector_store.url = Some(url);
    }
    if let Some(key) = get("WEAVIATE_API_KEY") {
        config.vector_store.api_key = Some(key);
    }
    if let Some(url) = get("RECORD_MANAGER_DB_URL") {
        config.record_store.url = url;
    }
    if let Some(key) = get("LANGCHAIN_API_KEY") {
        config.tracing.api_key = Some(key);
        if config.tracing.provider == "disabled" {
            config.tracing.provider = "langsmith".to_string();
        }
    }
    if let Some(endpoint) = get("LANGCHAIN_ENDPOINT") {
        config.tracing.endpoint = endpoint;
    }
    if let Some(project) = get("LANGCHAIN_PROJECT") {
        config.tracing.project = project;
    }
}

pub fn validate(config: &Config) -> Result<()> {
    // Vector store
    match config.vector_store.provider.as_str() {
        "sqlite" => {}
        "weaviate" => {
            if config.vector_store.url.is_none() {
                bail!("vector_store.url (or WEAVIATE_URL) must be set when provider is 'weaviate'");
            }
            if config.vector_store.api_key.is_none() {
                bail!(
                    "vector_store.api_key (or WEAVIATE_API_KEY) must be set when provider is 'weaviate'"
                );
            }
        }
        other => bail!(
            "Unknown vector store provider: '{}'. Must be sqlite or weaviate.",
            other
        ),
    }
    if config.vector_store.index_name.trim().is_empty() {
        bail!("vector_store.index_name must not be empty");
    }

    if !config.record_store.url.starts_with("sqlite:") {
        bail!(
            "record_store.url must be a sqlite: connection string, got '{}'",
            config.record_store.url
        );
    }

    // Chunking
    if config.chunking.max_tokens == 0 {
        bail!("chunking.max_tokens must be > 0");
    }
    if config.chunking.overlap_tokens >= config.chunking.max_tokens {
        bail!("chunking.overlap_tokens must be < chunking.max_tokens");
    }

    // Retrieval
    if config.retrieval.k < 1 {
        bail!("retrieval.k must be >= 1");
    }

    // Embedding
    match config.embedding.provider.as_str() {
        "disabled" | "openai" => {}
        other => bail!(
            "Unknown embedding provider: '{}'. Must be disabled or openai.",
            other
        ),
    }
    if config.embedding.is_enabled() {
        if config.embedding.dims.is_none() || config.embedding.dims == Some(0) {
            bail!(
                "embedding.dims must be > 0 when provider is '{}'",
                config.embedding.provider
            );
        }
        if config.embedding.model.is_none() {
            bail!(
                "embedding.model must be specified when provider is '{}'",
                config.embedding.provider
            );
        }
    }
    if config.embedding.batch_size == 0 {
        bail!("embedding.batch_size must be > 0");
    }

    // LLM
    match config.llm.provider.as_str() {
        "disabled" | "openai" => {}
        other => bail!(
            "Unknown llm provider: '{}'. Must be disabled or openai.",
            other
        ),
    }
    if !(0.0..=2.0).contains(&config.llm.temperature) {
        bail!("llm.temperature must be in [0.0, 2.0]");
    }

    // Ingest
    config
        .ingest
        .cleanup_mode()
        .with_context(|| "Invalid ingest.cleanup")?;

    // Tracing
    match config.tracing.provider.as_str() {
        "disabled" => {}
        "langsmith" => {
            if config.tracing.api_key.is_none() {
                bail!("tracing.api_key (or LANGCHAIN_API_KEY) must be set when provider is 'langsmith'");
            }
        }
        other => bail!(
            "Unknown tracing provider: '{}'. Must be disabled or langsmith.",
            other
        ),
    }
    if config.tracing.max_attempts == 0 {
        bail!("tracing.max_attempts must be >= 1");
    }

    Ok(())
}
