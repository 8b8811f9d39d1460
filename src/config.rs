//! TOML configuration.
//!
//! Every section except `[db]` and `[server]` has defaults, so a minimal
//! config only needs a database path and a bind address. Secrets (OpenAI
//! and AWS keys) are never read from this file; they come from the
//! environment.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub splitter: SplitterConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub embedding_cache: EmbeddingCacheConfig,
    #[serde(default)]
    pub archive: ArchiveConfig,
    #[serde(default)]
    pub chat: ChatConfig,
    #[serde(default)]
    pub assistant: AssistantConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SplitterConfig {
    #[serde(default = "default_segment_token_limit")]
    pub segment_token_limit: usize,
    /// Only keep segments on these pages (documents with `--- PAGE n ---` markers).
    #[serde(default)]
    pub page_limit: Option<Vec<u32>>,
}

impl Default for SplitterConfig {
    fn default() -> Self {
        Self {
            segment_token_limit: default_segment_token_limit(),
            page_limit: None,
        }
    }
}

fn default_segment_token_limit() -> usize {
    1000
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_disabled")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
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
            provider: default_disabled(),
            model: None,
            dims: None,
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

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingCacheConfig {
    #[serde(default = "default_true")]
    pub use_cache: bool,
    #[serde(default)]
    pub cache_file: Option<PathBuf>,
}

impl Default for EmbeddingCacheConfig {
    fn default() -> Self {
        Self {
            use_cache: true,
            cache_file: None,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ArchiveConfig {
    #[serde(default = "default_archive_engine")]
    pub engine: String,
    #[serde(default = "default_archive_name")]
    pub name: String,
    #[serde(default)]
    pub pinecone: PineconeConfig,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            engine: default_archive_engine(),
            name: default_archive_name(),
            pinecone: PineconeConfig::default(),
        }
    }
}

/// `[archive.pinecone]`: used when `engine = "pinecone"`. The API key is
/// read from `PINECONE_API_KEY`.
#[derive(Debug, Deserialize, Clone)]
pub struct PineconeConfig {
    /// Index data-plane URL, e.g. `https://docs-abc123.svc.us-east-1.pinecone.io`.
    #[serde(default)]
    pub host: Option<String>,
    /// Empty selects the index's default namespace.
    #[serde(default)]
    pub namespace: String,
    /// Vectors requested per query before the similarity filter.
    #[serde(default = "default_pinecone_top_k")]
    pub top_k: usize,
    #[serde(default = "default_pinecone_max_concurrency")]
    pub max_concurrency: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for PineconeConfig {
    fn default() -> Self {
        Self {
            host: None,
            namespace: String::new(),
            top_k: default_pinecone_top_k(),
            max_concurrency: default_pinecone_max_concurrency(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_pinecone_top_k() -> usize {
    100
}
fn default_pinecone_max_concurrency() -> usize {
    4
}

fn default_archive_engine() -> String {
    "in-memory".to_string()
}
fn default_archive_name() -> String {
    "default".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChatConfig {
    #[serde(default = "default_disabled")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_chat_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_openai_base_url")]
    pub base_url: String,
    #[serde(default = "default_true")]
    pub use_cache: bool,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            provider: default_disabled(),
            model: None,
            temperature: None,
            max_retries: default_max_retries(),
            timeout_secs: default_chat_timeout_secs(),
            base_url: default_openai_base_url(),
            use_cache: true,
        }
    }
}

impl ChatConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

fn default_chat_timeout_secs() -> u64 {
    120
}

#[derive(Debug, Deserialize, Clone)]
pub struct AssistantConfig {
    #[serde(default = "default_min_similarity")]
    pub min_similarity: f32,
    #[serde(default = "default_cutoff_context_tokens")]
    pub cutoff_context_tokens: usize,
    #[serde(default)]
    pub max_chunks_per_ask: Option<usize>,
    #[serde(default = "default_cutoff_history_tokens")]
    pub cutoff_history_tokens: usize,
    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,
    #[serde(default)]
    pub contextualize_prompt: Option<String>,
    #[serde(default = "default_true")]
    pub sort_chunks: bool,
    #[serde(default)]
    pub top_document_limit: Option<usize>,
}

impl Default for AssistantConfig {
    fn default() -> Self {
        Self {
            min_similarity: default_min_similarity(),
            cutoff_context_tokens: default_cutoff_context_tokens(),
            max_chunks_per_ask: None,
            cutoff_history_tokens: default_cutoff_history_tokens(),
            system_prompt: default_system_prompt(),
            contextualize_prompt: None,
            sort_chunks: true,
            top_document_limit: None,
        }
    }
}

fn default_min_similarity() -> f32 {
    0.3
}
fn default_cutoff_context_tokens() -> usize {
    3000
}
fn default_cutoff_history_tokens() -> usize {
    2000
}
fn default_system_prompt() -> String {
    "You are a helpful assistant. Answer the question using only the supplied context. \
     If the context does not contain the answer, say so."
        .to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    #[serde(default = "default_storage_provider")]
    pub provider: String,
    #[serde(default = "default_storage_root")]
    pub root: PathBuf,
    #[serde(default)]
    pub bucket: Option<String>,
    #[serde(default = "default_region")]
    pub region: String,
    #[serde(default)]
    pub endpoint_url: Option<String>,
    #[serde(default = "default_presign_expiry_secs")]
    pub presign_expiry_secs: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            provider: default_storage_provider(),
            root: default_storage_root(),
            bucket: None,
            region: default_region(),
            endpoint_url: None,
            presign_expiry_secs: default_presign_expiry_secs(),
        }
    }
}

fn default_storage_provider() -> String {
    "disk".to_string()
}
fn default_storage_root() -> PathBuf {
    PathBuf::from("./data/files")
}
fn default_region() -> String {
    "us-east-1".to_string()
}
fn default_presign_expiry_secs() -> u64 {
    3600
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub bind: String,
}

fn default_disabled() -> String {
    "disabled".to_string()
}
fn default_true() -> bool {
    true
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

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

/// Checks cross-field constraints that serde defaults cannot express.
pub fn validate(config: &Config) -> Result<()> {
    if config.splitter.segment_token_limit == 0 {
        bail!("splitter.segment_token_limit must be > 0");
    }

    match config.embedding.provider.as_str() {
        "disabled" => {}
        "openai" => {
            if config.embedding.model.is_none() {
                bail!("embedding.model must be specified when provider is 'openai'");
            }
            if config.embedding.dims == Some(0) {
                bail!("embedding.dims must be > 0 when set");
            }
        }
        other => bail!(
            "Unknown embedding provider: '{}'. Must be disabled or openai.",
            other
        ),
    }

    match config.chat.provider.as_str() {
        "disabled" => {}
        "openai" => {
            if config.chat.model.is_none() {
                bail!("chat.model must be specified when provider is 'openai'");
            }
        }
        other => bail!(
            "Unknown chat provider: '{}'. Must be disabled or openai.",
            other
        ),
    }

    match config.archive.engine.as_str() {
        "in-memory" | "sqlite" => {}
        "pinecone" => {
            let p = &config.archive.pinecone;
            if p.host.as_deref().map_or(true, |h| h.trim().is_empty()) {
                bail!("archive.pinecone.host must be specified when engine is 'pinecone'");
            }
            if p.top_k == 0 {
                bail!("archive.pinecone.top_k must be > 0");
            }
            if p.max_concurrency == 0 {
                bail!("archive.pinecone.max_concurrency must be > 0");
            }
        }
        other => bail!(
            "Unknown archive engine: '{}'. Must be in-memory, sqlite or pinecone.",
            other
        ),
    }

    let a = &config.assistant;
    if !(0.0..=1.0).contains(&a.min_similarity) {
        bail!("assistant.min_similarity must be in [0.0, 1.0]");
    }
    if a.max_chunks_per_ask == Some(0) {
        bail!("assistant.max_chunks_per_ask must be unset (unlimited) or > 0");
    }
    if a.top_document_limit == Some(0) {
        bail!("assistant.top_document_limit must be unset or > 0");
    }

    match config.storage.provider.as_str() {
        "disk" => {}
        "s3" => {
            if config.storage.bucket.as_deref().unwrap_or("").is_empty() {
                bail!("storage.bucket must be specified when provider is 's3'");
            }
        }
        other => bail!(
            "Unknown storage provider: '{}'. Must be disk or s3.",
            other
        ),
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

    const MINIMAL: &str = r#"
[db]
path = "./data/cx.sqlite"

[server]
bind = "127.0.0.1:7340"
"#;

    #[test]
    fn minimal_config_uses_defaults() {
        let config = parse(MINIMAL).unwrap();
        assert_eq!(config.splitter.segment_token_limit, 1000);
        assert_eq!(config.archive.engine, "in-memory");
        assert!(!config.embedding.is_enabled());
        assert!(!config.chat.is_enabled());
        assert!(config.embedding_cache.use_cache);
        assert_eq!(config.storage.provider, "disk");
        assert!((config.assistant.min_similarity - 0.3).abs() < f32::EPSILON);
    }

    #[test]
    fn openai_embedding_requires_model() {
        let src = format!("{}\n[embedding]\nprovider = \"openai\"\n", MINIMAL);
        let err = parse(&src).unwrap_err();
        assert!(err.to_string().contains("embedding.model"));
    }

    #[test]
    fn rejects_unknown_archive_engine() {
        let src = format!("{}\n[archive]\nengine = \"qdrant\"\n", MINIMAL);
        let err = parse(&src).unwrap_err();
        assert!(err.to_string().contains("qdrant"));
    }

    #[test]
    fn pinecone_archive_requires_host() {
        let src = format!("{}\n[archive]\nengine = \"pinecone\"\n", MINIMAL);
        let err = parse(&src).unwrap_err();
        assert!(err.to_string().contains("archive.pinecone.host"));

        let src = format!(
            "{}\n[archive]\nengine = \"pinecone\"\n\n[archive.pinecone]\nhost = \"https://idx.svc.pinecone.io\"\nnamespace = \"docs\"\n",
            MINIMAL
        );
        let config = parse(&src).unwrap();
        assert_eq!(config.archive.pinecone.namespace, "docs");
        assert_eq!(config.archive.pinecone.top_k, 100);
    }

    #[test]
    fn rejects_out_of_range_similarity() {
        let src = format!("{}\n[assistant]\nmin_similarity = 1.5\n", MINIMAL);
        assert!(parse(&src).is_err());
    }

    #[test]
    fn s3_storage_requires_bucket() {
        let src = format!("{}\n[storage]\nprovider = \"s3\"\n", MINIMAL);
        let err = parse(&src).unwrap_err();
        assert!(err.to_string().contains("storage.bucket"));
    }
}
