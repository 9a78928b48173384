//! Persisted config (services, chunking, retrieval) in the app data directory.
//!
//! API keys are never written here; they come from the environment.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::app_data;
use crate::catalog::DEFAULT_ID_COLUMN;
use crate::chunks::{DEFAULT_MAX_CHARS, DEFAULT_OVERLAP_CHARS};
use crate::store::{SearchMode, DEFAULT_LAMBDA};

const CONFIG_FILENAME: &str = "config.toml";

/// Environment variables checked, in order, for the service API key.
pub const API_KEY_VARS: [&str; 3] = ["GIFTBOT_API_KEY", "TOGETHER_API_KEY", "OPENAI_API_KEY"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Catalog column holding the product identifier.
    pub id_column: String,
    /// Optional file replacing the built-in prompt template.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt_template_path: Option<String>,
    /// Where the vector index lives. Defaults to `<data dir>/index`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub index_dir: Option<String>,
    pub chunking: ChunkingConfig,
    pub embedding: EmbeddingConfig,
    pub generation: GenerationConfig,
    pub retrieval: RetrievalConfig,
    pub memory: MemoryConfig,
    pub retry: RetryConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            id_column: DEFAULT_ID_COLUMN.to_string(),
            prompt_template_path: None,
            index_dir: None,
            chunking: ChunkingConfig::default(),
            embedding: EmbeddingConfig::default(),
            generation: GenerationConfig::default(),
            retrieval: RetrievalConfig::default(),
            memory: MemoryConfig::default(),
            retry: RetryConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkingConfig {
    pub max_size: usize,
    pub overlap: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_size: DEFAULT_MAX_CHARS,
            overlap: DEFAULT_OVERLAP_CHARS,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingProvider {
    /// Any OpenAI-compatible `/embeddings` endpoint (Together, OpenAI, ...).
    #[serde(rename = "openai")]
    OpenAi,
    Ollama,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    pub provider: EmbeddingProvider,
    pub base_url: String,
    pub model: String,
    /// Chunks sent per embedding request during a build.
    pub batch_size: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: EmbeddingProvider::OpenAi,
            base_url: "https://api.together.xyz/v1".to_string(),
            model: "togethercomputer/m2-bert-80M-2k-retrieval".to_string(),
            batch_size: 32,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    /// OpenAI-compatible base URL; `/chat/completions` is appended.
    pub base_url: String,
    pub model: String,
    pub temperature: f32,
    pub max_tokens: usize,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.together.xyz/v1".to_string(),
            model: "meta-llama/Llama-Vision-Free".to_string(),
            temperature: 0.7,
            max_tokens: 1024,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalConfig {
    pub k: usize,
    pub mode: SearchMode,
    /// Candidate pool size for diversity mode.
    pub fetch_k: usize,
    /// Relevance weight for diversity mode: 1.0 is plain similarity, 0.0 is maximum diversity.
    pub lambda: f32,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            k: 6,
            mode: SearchMode::Diversity,
            fetch_k: 20,
            lambda: DEFAULT_LAMBDA,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// Question/answer pairs kept per session. `0` keeps everything.
    pub max_exchanges: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self { max_exchanges: 20 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts per call, including the first. `1` disables retries.
    pub max_attempts: usize,
    pub base_delay_ms: u64,
    /// Per-attempt timeout. `0` disables it.
    pub timeout_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 500,
            timeout_secs: 60,
        }
    }
}

impl Config {
    /// Resolved index directory: the configured one, else the app data default.
    pub fn index_dir(&self) -> Option<PathBuf> {
        match self.index_dir.as_deref().filter(|s| !s.is_empty()) {
            Some(dir) => Some(PathBuf::from(dir)),
            None => app_data::default_index_dir(),
        }
    }

    /// API key for the hosted services, from the first set variable in [API_KEY_VARS].
    pub fn api_key(&self) -> Option<String> {
        API_KEY_VARS
            .iter()
            .filter_map(|var| std::env::var(var).ok())
            .map(|v| v.trim().to_string())
            .find(|v| !v.is_empty())
    }
}

/// Path of the config file in the app data directory.
pub fn config_path() -> Option<PathBuf> {
    app_data::app_data_dir().map(|d| d.join(CONFIG_FILENAME))
}

/// Load config from the app data directory. Returns default config if missing or invalid.
pub fn load_config() -> Config {
    let Some(path) = config_path() else {
        return Config::default();
    };
    if !path.exists() {
        return Config::default();
    }
    load_config_from(&path).unwrap_or_else(|e| {
        warn!("ignoring config at {}: {}", path.display(), e);
        Config::default()
    })
}

/// Load config from an explicit path. Missing keys take their defaults.
pub fn load_config_from(path: &Path) -> Result<Config, ConfigError> {
    let s = std::fs::read_to_string(path).map_err(ConfigError::Read)?;
    toml::from_str(&s).map_err(ConfigError::Parse)
}

/// Save config to the app data directory.
pub fn save_config(config: &Config) -> Result<PathBuf, ConfigError> {
    let path = config_path().ok_or(ConfigError::NoDataDir)?;
    save_config_to(config, &path)?;
    Ok(path)
}

/// Save config to an explicit path.
pub fn save_config_to(config: &Config, path: &Path) -> Result<(), ConfigError> {
    let s = toml::to_string_pretty(config).map_err(ConfigError::Serialize)?;
    std::fs::write(path, s).map_err(ConfigError::Write)
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("could not determine app data directory")]
    NoDataDir,
    #[error("failed to read config: {0}")]
    Read(std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(toml::de::Error),
    #[error("failed to serialize config: {0}")]
    Serialize(toml::ser::Error),
    #[error("failed to write config: {0}")]
    Write(std::io::Error),
}
