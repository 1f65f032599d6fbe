//! Configuration files
//!
//! `counsel.toml` carries everything the environment can set, grouped into
//! sections:
//!
//! ```toml
//! [server]
//! host = "127.0.0.1"
//! port = 3000
//!
//! [llm]
//! provider = "openai"
//! base_url = "https://api.openai.com/v1"
//! api_key_env = "OPENAI_API_KEY"
//! model = "gpt-4o-mini"
//!
//! [history]
//! backend = "json"
//! dir = "history"
//!
//! [session]
//! max_messages = 20
//! persona_file = "personas/counselor.toml"
//! ```
//!
//! The older `config.txt` format is plain `key=value` lines.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use super::HistoryBackend;

/// Root of `counsel.toml`; every section and key is optional
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub server: ServerSection,

    #[serde(default)]
    pub llm: LlmSection,

    #[serde(default)]
    pub history: HistorySection,

    #[serde(default)]
    pub session: SessionSection,
}

impl FileConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Load configuration from a TOML string
    pub fn from_str(content: &str) -> Result<Self, ConfigError> {
        let config: FileConfig = toml::from_str(content)?;
        Ok(config)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServerSection {
    #[serde(default)]
    pub host: Option<String>,

    #[serde(default)]
    pub port: Option<u16>,
}

/// LLM provider settings
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LlmSection {
    /// Provider name: "openai" or "ollama"
    #[serde(default)]
    pub provider: Option<String>,

    #[serde(default)]
    pub model: Option<String>,

    /// OpenAI-compatible endpoint
    #[serde(default)]
    pub base_url: Option<String>,

    #[serde(default)]
    pub ollama_url: Option<String>,

    /// Name of the environment variable holding the API key
    #[serde(default)]
    pub api_key_env: Option<String>,

    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct HistorySection {
    #[serde(default)]
    pub backend: Option<HistoryBackend>,

    #[serde(default)]
    pub dir: Option<PathBuf>,

    #[serde(default)]
    pub sqlite_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SessionSection {
    #[serde(default)]
    pub max_messages: Option<usize>,

    #[serde(default)]
    pub rejection_warning: Option<String>,

    #[serde(default)]
    pub persona_file: Option<PathBuf>,
}

/// Parse `key=value` lines. Blank lines and lines without `=` are skipped;
/// the value is everything after the first `=`.
pub fn parse_legacy(content: &str) -> HashMap<String, String> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| line.split_once('='))
        .map(|(key, value)| (key.trim().to_string(), value.trim().to_string()))
        .collect()
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Validation error: {0}")]
    Validation(String),
}
