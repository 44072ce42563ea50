use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::citations::{CitationPolicy, DEFAULT_FALLBACK_MIN_CHARS};
use crate::models::GenerationSettings;
use crate::source_map::DEFAULT_MAX_SOURCES;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    pub server: ServerConfig,
    pub generation: GenerationConfig,
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub history: HistoryConfig,
    #[serde(default)]
    pub citations: CitationsConfig,
    #[serde(default)]
    pub prompt: PromptConfig,
    #[serde(default)]
    pub sessions: SessionsConfig,
    #[serde(default)]
    pub turn_log: TurnLogConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub bind: String,
}

// ============ [generation] ============

#[derive(Debug, Deserialize, Clone)]
pub struct GenerationConfig {
    /// `"openai"` or `"azure"`.
    #[serde(default = "default_generation_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "default_openai_base_url")]
    pub base_url: String,
    /// Azure resource endpoint, e.g. `https://myres.openai.azure.com`.
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub deployment: Option<String>,
    #[serde(default = "default_openai_api_version")]
    pub api_version: String,
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_top_p")]
    pub top_p: f32,
    #[serde(default = "default_penalty")]
    pub presence_penalty: f32,
    #[serde(default = "default_penalty")]
    pub frequency_penalty: f32,
    #[serde(default = "default_generation_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
}

impl GenerationConfig {
    pub fn settings(&self) -> GenerationSettings {
        GenerationSettings {
            temperature: self.temperature,
            max_tokens: self.max_tokens,
            top_p: self.top_p,
            presence_penalty: self.presence_penalty,
            frequency_penalty: self.frequency_penalty,
        }
    }

    /// Name of the environment variable holding the API key.
    pub fn api_key_var(&self) -> &str {
        match (&self.api_key_env, self.provider.as_str()) {
            (Some(var), _) => var,
            (None, "azure") => "AZURE_OPENAI_API_KEY",
            (None, _) => "OPENAI_API_KEY",
        }
    }
}

fn default_generation_provider() -> String {
    "openai".to_string()
}
fn default_openai_base_url() -> String {
    "https://api.openai.com".to_string()
}
fn default_openai_api_version() -> String {
    "2024-06-01".to_string()
}
fn default_temperature() -> f32 {
    0.3
}
fn default_max_tokens() -> u32 {
    1000
}
fn default_top_p() -> f32 {
    1.0
}
fn default_penalty() -> f32 {
    0.6
}
fn default_generation_timeout_secs() -> u64 {
    60
}
fn default_max_retries() -> u32 {
    3
}
fn default_retry_backoff_ms() -> u64 {
    1000
}

// ============ [history] ============

#[derive(Debug, Deserialize, Clone)]
pub struct HistoryConfig {
    /// User/assistant pairs kept verbatim.
    #[serde(default = "default_max_turns")]
    pub max_turns: usize,
    #[serde(default)]
    pub summarization: SummarizationConfig,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            max_turns: default_max_turns(),
            summarization: SummarizationConfig::default(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct SummarizationConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_max_summary_tokens")]
    pub max_summary_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_summary_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for SummarizationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_summary_tokens: default_max_summary_tokens(),
            temperature: default_temperature(),
            timeout_secs: default_summary_timeout_secs(),
        }
    }
}

fn default_max_turns() -> usize {
    5
}
fn default_true() -> bool {
    true
}
fn default_max_summary_tokens() -> u32 {
    800
}
fn default_summary_timeout_secs() -> u64 {
    30
}

// ============ [retrieval] ============

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    /// `"azure"`, `"harness"`, or `"static"`.
    pub provider: String,
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default = "default_max_sources")]
    pub max_sources: usize,
    #[serde(default = "default_retrieval_timeout_secs")]
    pub timeout_secs: u64,

    // azure
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub index: Option<String>,
    #[serde(default = "default_search_api_version")]
    pub api_version: String,
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default = "default_text_field")]
    pub text_field: String,
    #[serde(default = "default_title_field")]
    pub title_field: String,
    #[serde(default = "default_parent_field")]
    pub parent_field: String,
    #[serde(default = "default_vector_field")]
    pub vector_field: String,

    // harness
    #[serde(default)]
    pub url: Option<String>,

    // static
    #[serde(default)]
    pub corpus: Option<PathBuf>,

    #[serde(default)]
    pub embedding: EmbeddingConfig,
}

impl RetrievalConfig {
    pub fn api_key_var(&self) -> &str {
        self.api_key_env
            .as_deref()
            .unwrap_or("AZURE_SEARCH_API_KEY")
    }
}

fn default_top_k() -> usize {
    10
}
fn default_max_sources() -> usize {
    DEFAULT_MAX_SOURCES
}
fn default_retrieval_timeout_secs() -> u64 {
    30
}
fn default_search_api_version() -> String {
    "2023-11-01".to_string()
}
fn default_text_field() -> String {
    "chunk".to_string()
}
fn default_title_field() -> String {
    "title".to_string()
}
fn default_parent_field() -> String {
    "parent_id".to_string()
}
fn default_vector_field() -> String {
    "text_vector".to_string()
}

/// Query embeddings for vector search. Only used by the Azure retriever.
#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    /// `"disabled"`, `"openai"`, or `"azure"`.
    #[serde(default = "default_embedding_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "default_openai_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub deployment: Option<String>,
    #[serde(default = "default_openai_api_version")]
    pub api_version: String,
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_embedding_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_embedding_provider(),
            model: None,
            base_url: default_openai_base_url(),
            endpoint: None,
            deployment: None,
            api_version: default_openai_api_version(),
            api_key_env: None,
            dims: None,
            max_retries: default_max_retries(),
            timeout_secs: default_embedding_timeout_secs(),
        }
    }
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }

    pub fn api_key_var(&self) -> &str {
        match (&self.api_key_env, self.provider.as_str()) {
            (Some(var), _) => var,
            (None, "azure") => "AZURE_OPENAI_API_KEY",
            (None, _) => "OPENAI_API_KEY",
        }
    }
}

fn default_embedding_provider() -> String {
    "disabled".to_string()
}
fn default_embedding_timeout_secs() -> u64 {
    30
}

// ============ [citations] ============

#[derive(Debug, Deserialize, Clone)]
pub struct CitationsConfig {
    /// Attribute sources by sentence overlap when the answer has no markers.
    #[serde(default = "default_true")]
    pub fallback: bool,
    #[serde(default = "default_min_sentence_chars")]
    pub min_sentence_chars: usize,
}

impl Default for CitationsConfig {
    fn default() -> Self {
        Self {
            fallback: true,
            min_sentence_chars: default_min_sentence_chars(),
        }
    }
}

impl CitationsConfig {
    pub fn policy(&self) -> CitationPolicy {
        if self.fallback {
            CitationPolicy::ExplicitThenSubstringFallback {
                min_len: self.min_sentence_chars,
            }
        } else {
            CitationPolicy::ExplicitOnly
        }
    }
}

fn default_min_sentence_chars() -> usize {
    DEFAULT_FALLBACK_MIN_CHARS
}

// ============ [prompt] ============

/// How a configured system prompt combines with the built-in one.
#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PromptMode {
    #[default]
    Append,
    Override,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct PromptConfig {
    #[serde(default)]
    pub system_prompt: Option<String>,
    #[serde(default)]
    pub mode: PromptMode,
    /// Instruction prepended to every user query.
    #[serde(default)]
    pub custom_prompt: Option<String>,
    /// Rewrite follow-up queries into standalone search queries.
    #[serde(default)]
    pub query_rewrite: bool,
}

// ============ [sessions] ============

/// What a turn does when its session already has one in flight.
#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BusyPolicy {
    #[default]
    Wait,
    Reject,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SessionsConfig {
    #[serde(default)]
    pub busy: BusyPolicy,
    /// Deadline for the generation call of one turn.
    #[serde(default)]
    pub turn_timeout_secs: Option<u64>,
    /// `rags serve` drops sessions unused for this long. `0` keeps them.
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: Option<u64>,
}

impl Default for SessionsConfig {
    fn default() -> Self {
        Self {
            busy: BusyPolicy::default(),
            turn_timeout_secs: None,
            idle_timeout_secs: default_idle_timeout_secs(),
        }
    }
}

fn default_idle_timeout_secs() -> Option<u64> {
    Some(3600)
}

// ============ [turn_log] ============

#[derive(Debug, Deserialize, Clone)]
pub struct TurnLogConfig {
    /// `"sqlite"`, `"tracing"`, or `"none"`.
    #[serde(default = "default_turn_log_backend")]
    pub backend: String,
}

impl Default for TurnLogConfig {
    fn default() -> Self {
        Self {
            backend: default_turn_log_backend(),
        }
    }
}

fn default_turn_log_backend() -> String {
    "sqlite".to_string()
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    parse_config(&content)
}

/// Parse and validate a configuration document.
pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).with_context(|| "Failed to parse config file")?;

    // Validate generation
    let gen = &config.generation;
    match gen.provider.as_str() {
        "openai" => {
            if gen.model.is_none() {
                anyhow::bail!("generation.model must be specified when provider is 'openai'");
            }
        }
        "azure" => {
            if gen.endpoint.is_none() || gen.deployment.is_none() {
                anyhow::bail!(
                    "generation.endpoint and generation.deployment must be specified when provider is 'azure'"
                );
            }
        }
        other => anyhow::bail!(
            "Unknown generation provider: '{}'. Must be openai or azure.",
            other
        ),
    }
    if !(0.0..=2.0).contains(&gen.temperature) {
        anyhow::bail!("generation.temperature must be in [0.0, 2.0]");
    }
    if !(gen.top_p > 0.0 && gen.top_p <= 1.0) {
        anyhow::bail!("generation.top_p must be in (0.0, 1.0]");
    }
    if gen.max_tokens == 0 {
        anyhow::bail!("generation.max_tokens must be > 0");
    }

    // Validate history
    if config.history.max_turns == 0 {
        anyhow::bail!("history.max_turns must be >= 1");
    }
    let summarization = &config.history.summarization;
    if !(0.0..=2.0).contains(&summarization.temperature) {
        anyhow::bail!("history.summarization.temperature must be in [0.0, 2.0]");
    }
    if summarization.max_summary_tokens == 0 {
        anyhow::bail!("history.summarization.max_summary_tokens must be > 0");
    }

    // Validate retrieval
    let retrieval = &config.retrieval;
    if retrieval.top_k == 0 {
        anyhow::bail!("retrieval.top_k must be >= 1");
    }
    if retrieval.max_sources == 0 || retrieval.max_sources > retrieval.top_k {
        anyhow::bail!(
            "retrieval.max_sources must be in [1, {}] (retrieval.top_k)",
            retrieval.top_k
        );
    }
    match retrieval.provider.as_str() {
        "azure" => {
            if retrieval.endpoint.is_none() || retrieval.index.is_none() {
                anyhow::bail!(
                    "retrieval.endpoint and retrieval.index must be specified when provider is 'azure'"
                );
            }
        }
        "harness" => {
            if retrieval.url.is_none() {
                anyhow::bail!("retrieval.url must be specified when provider is 'harness'");
            }
        }
        "static" => {
            if retrieval.corpus.is_none() {
                anyhow::bail!("retrieval.corpus must be specified when provider is 'static'");
            }
        }
        other => anyhow::bail!(
            "Unknown retrieval provider: '{}'. Must be azure, harness, or static.",
            other
        ),
    }

    // Validate embedding
    let embedding = &retrieval.embedding;
    match embedding.provider.as_str() {
        "disabled" => {}
        "openai" => {
            if embedding.model.is_none() {
                anyhow::bail!(
                    "retrieval.embedding.model must be specified when provider is 'openai'"
                );
            }
        }
        "azure" => {
            if embedding.endpoint.is_none() || embedding.deployment.is_none() {
                anyhow::bail!(
                    "retrieval.embedding.endpoint and retrieval.embedding.deployment must be specified when provider is 'azure'"
                );
            }
        }
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be disabled, openai, or azure.",
            other
        ),
    }
    if embedding.dims == Some(0) {
        anyhow::bail!("retrieval.embedding.dims must be > 0");
    }

    // Validate citations
    if config.citations.min_sentence_chars == 0 {
        anyhow::bail!("citations.min_sentence_chars must be >= 1");
    }

    match config.turn_log.backend.as_str() {
        "sqlite" | "tracing" | "none" => {}
        other => anyhow::bail!(
            "Unknown turn_log backend: '{}'. Must be sqlite, tracing, or none.",
            other
        ),
    }

    Ok(config)
}
