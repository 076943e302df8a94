//! Configuration loading and validation.
//!
//! Configuration is read from a TOML file (default `./config/bookrag.toml`).
//! Every section except `[db]`, `[corpus]` and `[server]` has defaults, so a
//! minimal file only names the database, the corpus version and the bind
//! address. API keys are never stored in the file: providers name the
//! environment variable that holds the key (`api_key_env`).
//!
//! ```toml
//! [db]
//! path = "./data/bookrag.sqlite"
//!
//! [corpus]
//! version = "v1.0"
//!
//! [embedding]
//! provider = "openai"
//! model = "text-embedding-3-small"
//! dims = 1536
//!
//! [[generation.providers]]
//! kind = "openai"
//! model = "gpt-4o"
//!
//! [[generation.providers]]
//! kind = "openai"
//! model = "gpt-3.5-turbo"
//!
//! [server]
//! bind = "127.0.0.1:7331"
//! ```

use anyhow::{bail, Context, Result};
use book_rag_core::rank::{AugmentParams, TieBreak};
use book_rag_core::ratelimit::Rule;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    pub corpus: CorpusConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub vector_store: VectorStoreConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub ranking: RankingConfig,
    #[serde(default)]
    pub generation: GenerationConfig,
    #[serde(default)]
    pub selection: SelectionConfig,
    #[serde(default)]
    pub sessions: SessionsConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct CorpusConfig {
    /// Active corpus version; also the vector-store namespace.
    pub version: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_embedding_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    /// Base URL override (Ollama server, or an OpenAI-compatible proxy).
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_openai_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_embedding_retries")]
    pub max_retries: u32,
    #[serde(default = "default_fast_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_embedding_provider(),
            model: None,
            dims: None,
            url: None,
            api_key_env: default_openai_key_env(),
            max_retries: default_embedding_retries(),
            timeout_ms: default_fast_timeout_ms(),
        }
    }
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

fn default_embedding_provider() -> String {
    "disabled".to_string()
}
fn default_openai_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}
fn default_embedding_retries() -> u32 {
    0
}
fn default_fast_timeout_ms() -> u64 {
    1000
}

#[derive(Debug, Deserialize, Clone)]
pub struct VectorStoreConfig {
    /// `sqlite` (brute force, local) or `qdrant`.
    #[serde(default = "default_vector_backend")]
    pub backend: String,
    #[serde(default = "default_qdrant_url")]
    pub url: String,
    #[serde(default)]
    pub api_key_env: Option<String>,
    /// Collection name is `{collection_prefix}{corpus.version}`.
    #[serde(default = "default_collection_prefix")]
    pub collection_prefix: String,
    #[serde(default = "default_fast_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for VectorStoreConfig {
    fn default() -> Self {
        Self {
            backend: default_vector_backend(),
            url: default_qdrant_url(),
            api_key_env: None,
            collection_prefix: default_collection_prefix(),
            timeout_ms: default_fast_timeout_ms(),
        }
    }
}

impl VectorStoreConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

fn default_vector_backend() -> String {
    "sqlite".to_string()
}
fn default_qdrant_url() -> String {
    "http://localhost:6333".to_string()
}
fn default_collection_prefix() -> String {
    "book_".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_k")]
    pub default_k: usize,
    #[serde(default = "default_max_k")]
    pub max_k: usize,
    /// Similarity floor; candidates scoring lower never reach generation.
    #[serde(default = "default_min_similarity")]
    pub min_similarity: f64,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    #[serde(default = "default_max_query_chars")]
    pub max_query_chars: usize,
    /// Length of the excerpt stored with each citation.
    #[serde(default = "default_excerpt_chars")]
    pub excerpt_chars: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            default_k: default_k(),
            max_k: default_max_k(),
            min_similarity: default_min_similarity(),
            retry_backoff_ms: default_retry_backoff_ms(),
            max_query_chars: default_max_query_chars(),
            excerpt_chars: default_excerpt_chars(),
        }
    }
}

impl RetrievalConfig {
    /// Requested `k`, defaulted and clamped to `[1, max_k]`.
    pub fn effective_k(&self, requested: Option<usize>) -> usize {
        requested.unwrap_or(self.default_k).clamp(1, self.max_k)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

fn default_k() -> usize {
    5
}
fn default_max_k() -> usize {
    20
}
fn default_min_similarity() -> f64 {
    0.7
}
fn default_retry_backoff_ms() -> u64 {
    200
}
fn default_max_query_chars() -> usize {
    500
}
fn default_excerpt_chars() -> usize {
    200
}

#[derive(Debug, Deserialize, Clone)]
pub struct RankingConfig {
    #[serde(default = "default_budget_tokens")]
    pub budget_tokens: usize,
    #[serde(default)]
    pub tie_break: TieBreak,
}

impl Default for RankingConfig {
    fn default() -> Self {
        Self {
            budget_tokens: default_budget_tokens(),
            tie_break: TieBreak::default(),
        }
    }
}

fn default_budget_tokens() -> usize {
    3000
}

#[derive(Debug, Deserialize, Clone)]
pub struct GenerationConfig {
    /// Ordered list; the first entry is the primary, the rest are fallbacks.
    #[serde(default = "default_generation_providers")]
    pub providers: Vec<ProviderConfig>,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    /// Per-attempt timeout.
    #[serde(default = "default_generation_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            providers: default_generation_providers(),
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            timeout_ms: default_generation_timeout_ms(),
        }
    }
}

impl GenerationConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProviderConfig {
    /// `openai` (any OpenAI-compatible chat API) or `ollama`.
    pub kind: String,
    pub model: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_openai_key_env")]
    pub api_key_env: String,
}

fn default_generation_providers() -> Vec<ProviderConfig> {
    ["gpt-4o", "gpt-3.5-turbo"]
        .iter()
        .map(|model| ProviderConfig {
            kind: "openai".to_string(),
            model: model.to_string(),
            url: None,
            api_key_env: default_openai_key_env(),
        })
        .collect()
}
fn default_temperature() -> f32 {
    0.3
}
fn default_max_tokens() -> u32 {
    500
}
fn default_generation_timeout_ms() -> u64 {
    5000
}

#[derive(Debug, Deserialize, Clone)]
pub struct SelectionConfig {
    /// Selections are cut to this many tokens before use.
    #[serde(default = "default_selection_tokens")]
    pub max_tokens: usize,
    /// Selections longer than this are rejected as invalid input.
    #[serde(default = "default_selection_chars")]
    pub max_chars: usize,
    /// Minimum answer/selection cosine similarity.
    #[serde(default = "default_selection_threshold")]
    pub threshold: f32,
}

impl Default for SelectionConfig {
    fn default() -> Self {
        Self {
            max_tokens: default_selection_tokens(),
            max_chars: default_selection_chars(),
            threshold: default_selection_threshold(),
        }
    }
}

fn default_selection_tokens() -> usize {
    2000
}
fn default_selection_chars() -> usize {
    10_000
}
fn default_selection_threshold() -> f32 {
    0.75
}

#[derive(Debug, Deserialize, Clone)]
pub struct SessionsConfig {
    #[serde(default = "default_history_limit")]
    pub default_history_limit: usize,
    #[serde(default = "default_max_history_limit")]
    pub max_history_limit: usize,
}

impl Default for SessionsConfig {
    fn default() -> Self {
        Self {
            default_history_limit: default_history_limit(),
            max_history_limit: default_max_history_limit(),
        }
    }
}

fn default_history_limit() -> usize {
    50
}
fn default_max_history_limit() -> usize {
    200
}

#[derive(Debug, Deserialize, Clone)]
pub struct RateLimitConfig {
    #[serde(default = "default_session_limit")]
    pub session_limit: u64,
    #[serde(default = "default_session_window_secs")]
    pub session_window_secs: u64,
    #[serde(default = "default_client_limit")]
    pub client_limit: u64,
    #[serde(default = "default_client_window_secs")]
    pub client_window_secs: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            session_limit: default_session_limit(),
            session_window_secs: default_session_window_secs(),
            client_limit: default_client_limit(),
            client_window_secs: default_client_window_secs(),
        }
    }
}

impl RateLimitConfig {
    pub fn session_rule(&self) -> Rule {
        Rule {
            limit: self.session_limit,
            window: Duration::from_secs(self.session_window_secs),
        }
    }

    pub fn client_rule(&self) -> Rule {
        Rule {
            limit: self.client_limit,
            window: Duration::from_secs(self.client_window_secs),
        }
    }
}

fn default_session_limit() -> u64 {
    10
}
fn default_session_window_secs() -> u64 {
    60
}
fn default_client_limit() -> u64 {
    1000
}
fn default_client_window_secs() -> u64 {
    86_400
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub bind: String,
    /// Use the first `X-Forwarded-For` hop as the client address. Off by
    /// default: clients can set the header to anything, so turn it on only
    /// behind a proxy that overwrites it.
    #[serde(default)]
    pub trust_forwarded_for: bool,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    /// `tracing` filter directive; `RUST_LOG` takes precedence.
    #[serde(default = "default_log_filter")]
    pub filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
        }
    }
}

fn default_log_filter() -> String {
    "info".to_string()
}

impl Config {
    pub fn augment_params(&self) -> AugmentParams {
        AugmentParams {
            floor: self.retrieval.min_similarity,
            budget_tokens: self.ranking.budget_tokens,
            tie_break: self.ranking.tie_break,
        }
    }
}

/// Parse a config from TOML text and validate it.
pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    parse_config(&content)
}

fn validate(config: &Config) -> Result<()> {
    if config.corpus.version.trim().is_empty() {
        bail!("corpus.version must not be empty");
    }

    // Retrieval
    if config.retrieval.max_k == 0 || config.retrieval.default_k == 0 {
        bail!("retrieval.default_k and retrieval.max_k must be >= 1");
    }
    if !(-1.0..=1.0).contains(&config.retrieval.min_similarity) {
        bail!("retrieval.min_similarity must be in [-1.0, 1.0]");
    }
    if config.retrieval.max_query_chars == 0 {
        bail!("retrieval.max_query_chars must be > 0");
    }

    if config.ranking.budget_tokens == 0 {
        bail!("ranking.budget_tokens must be > 0");
    }

    // Generation
    if config.generation.providers.is_empty() {
        bail!("generation.providers must list at least one provider");
    }
    for p in &config.generation.providers {
        match p.kind.as_str() {
            "openai" | "ollama" => {}
            other => bail!(
                "Unknown generation provider kind: '{}'. Must be openai or ollama.",
                other
            ),
        }
    }
    if !(0.0..=2.0).contains(&config.generation.temperature) {
        bail!("generation.temperature must be in [0.0, 2.0]");
    }

    // Selection
    if !(0.0..=1.0).contains(&config.selection.threshold) {
        bail!("selection.threshold must be in [0.0, 1.0]");
    }
    if config.selection.max_tokens == 0 || config.selection.max_chars == 0 {
        bail!("selection.max_tokens and selection.max_chars must be > 0");
    }

    // Embedding
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
    match config.embedding.provider.as_str() {
        "disabled" | "openai" | "ollama" => {}
        other => bail!(
            "Unknown embedding provider: '{}'. Must be disabled, openai, or ollama.",
            other
        ),
    }

    match config.vector_store.backend.as_str() {
        "sqlite" | "qdrant" => {}
        other => bail!(
            "Unknown vector_store.backend: '{}'. Must be sqlite or qdrant.",
            other
        ),
    }

    if config.rate_limit.session_window_secs == 0 || config.rate_limit.client_window_secs == 0 {
        bail!("rate_limit windows must be > 0 seconds");
    }

    if config.sessions.max_history_limit == 0 {
        bail!("sessions.max_history_limit must be > 0");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
[db]
path = "./data/test.sqlite"

[corpus]
version = "v1.0"

[server]
bind = "127.0.0.1:0"
"#;

    #[test]
    fn test_minimal_config_defaults() {
        let config = parse_config(MINIMAL).unwrap();
        assert_eq!(config.retrieval.default_k, 5);
        assert_eq!(config.retrieval.max_k, 20);
        assert_eq!(config.retrieval.min_similarity, 0.7);
        assert_eq!(config.ranking.budget_tokens, 3000);
        assert_eq!(config.generation.providers.len(), 2);
        assert_eq!(config.generation.providers[0].model, "gpt-4o");
        assert_eq!(config.generation.timeout_ms, 5000);
        assert_eq!(config.selection.threshold, 0.75);
        assert_eq!(config.selection.max_tokens, 2000);
        assert_eq!(config.rate_limit.session_limit, 10);
        assert_eq!(config.rate_limit.client_window_secs, 86_400);
        assert_eq!(config.vector_store.backend, "sqlite");
        assert!(!config.embedding.is_enabled());
        assert!(!config.server.trust_forwarded_for);
    }

    #[test]
    fn test_forwarded_for_is_opt_in() {
        let toml = MINIMAL.replace("[server]\n", "[server]\ntrust_forwarded_for = true\n");
        let config = parse_config(&toml).unwrap();
        assert!(config.server.trust_forwarded_for);
    }

    #[test]
    fn test_effective_k_clamps() {
        let config = parse_config(MINIMAL).unwrap();
        assert_eq!(config.retrieval.effective_k(None), 5);
        assert_eq!(config.retrieval.effective_k(Some(50)), 20);
        assert_eq!(config.retrieval.effective_k(Some(0)), 1);
    }

    #[test]
    fn test_rejects_unknown_provider_kind() {
        let toml = format!(
            "{}\n[[generation.providers]]\nkind = \"bard\"\nmodel = \"x\"\n",
            MINIMAL
        );
        let err = parse_config(&toml).unwrap_err();
        assert!(err.to_string().contains("bard"));
    }

    #[test]
    fn test_enabled_embedding_requires_dims() {
        let toml = format!(
            "{}\n[embedding]\nprovider = \"openai\"\nmodel = \"text-embedding-3-small\"\n",
            MINIMAL
        );
        assert!(parse_config(&toml).is_err());
    }

    #[test]
    fn test_tie_break_parses() {
        let toml = format!("{}\n[ranking]\ntie_break = \"chunk_id\"\n", MINIMAL);
        let config = parse_config(&toml).unwrap();
        assert_eq!(config.ranking.tie_break, TieBreak::ChunkId);
    }

    #[test]
    fn test_missing_file_is_error() {
        let err = load_config(Path::new("/nonexistent/bookrag.toml")).unwrap_err();
        assert!(err.to_string().contains("Failed to read config file"));
    }
}
