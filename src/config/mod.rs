//! Application configuration
//!
//! Layered, later layers winning:
//! 1. built-in defaults
//! 2. TOML file (`COUNSEL_CONFIG`, or `counsel.toml` when present)
//! 3. legacy `config.txt` with `key=value` lines
//! 4. environment variables (a `.env` file is loaded first by `main`)

pub mod file;
pub mod prompts;

use std::env;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::Deserialize;

pub use file::{ConfigError, FileConfig};
pub use prompts::builtin as prompts_builtin;

pub const DEFAULT_CONFIG_FILE: &str = "counsel.toml";
pub const LEGACY_CONFIG_FILE: &str = "config.txt";

/// Where conversations are kept
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(try_from = "String")]
pub enum HistoryBackend {
    /// One JSON file per conversation in `history_dir`
    Json,
    /// One row per conversation in the database at `sqlite_path`
    Sqlite,
}

impl FromStr for HistoryBackend {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "json" | "files" => Ok(HistoryBackend::Json),
            "sqlite" => Ok(HistoryBackend::Sqlite),
            other => Err(ConfigError::Validation(format!(
                "unknown history backend: {other}"
            ))),
        }
    }
}

impl TryFrom<String> for HistoryBackend {
    type Error = ConfigError;

    fn try_from(raw: String) -> Result<Self, Self::Error> {
        raw.parse()
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    /// "openai" (any OpenAI-compatible endpoint) or "ollama"
    pub provider: String,
    pub openai_api_key: Option<String>,
    pub base_url: Option<String>,
    pub ollama_url: Option<String>,
    pub model: String,
    pub timeout_secs: u64,
    pub history_backend: HistoryBackend,
    pub history_dir: PathBuf,
    pub sqlite_path: PathBuf,
    /// Turns are refused once the session holds more messages than this
    pub max_messages: usize,
    pub rejection_warning: String,
    /// Persona template replacing the built-in instruction
    pub persona_file: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 3000,
            provider: "openai".into(),
            openai_api_key: None,
            base_url: None,
            ollama_url: None,
            model: "gpt-4o-mini".into(),
            timeout_secs: 300,
            history_backend: HistoryBackend::Json,
            history_dir: PathBuf::from("history"),
            sqlite_path: PathBuf::from("data/history.db"),
            max_messages: 20,
            rejection_warning: prompts_builtin::REJECTION_WARNING.into(),
            persona_file: None,
        }
    }
}

impl Config {
    /// Build the configuration from every layer.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        let lookup = |key: &str| env::var(key).ok();

        let config_file = lookup("COUNSEL_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));
        if config_file.exists() {
            config.apply_file(&FileConfig::from_file(&config_file)?, lookup);
        }

        let legacy = Path::new(LEGACY_CONFIG_FILE);
        if legacy.exists() {
            let content = std::fs::read_to_string(legacy)?;
            config.apply_legacy(&content);
        }

        config.apply_env(lookup)?;
        Ok(config)
    }

    /// Overlay values from a TOML config file. `api_key_env` is resolved
    /// through `lookup`.
    pub fn apply_file<F>(&mut self, file: &FileConfig, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let server = &file.server;
        set(&mut self.host, server.host.clone());
        set(&mut self.port, server.port);

        let llm = &file.llm;
        set(&mut self.provider, llm.provider.clone());
        set(&mut self.model, llm.model.clone());
        set(&mut self.timeout_secs, llm.timeout_secs);
        if llm.base_url.is_some() {
            self.base_url = llm.base_url.clone();
        }
        if llm.ollama_url.is_some() {
            self.ollama_url = llm.ollama_url.clone();
        }
        if let Some(key) = llm.api_key_env.as_deref().and_then(&lookup) {
            self.openai_api_key = Some(key);
        }

        let history = &file.history;
        set(&mut self.history_backend, history.backend);
        set(&mut self.history_dir, history.dir.clone());
        set(&mut self.sqlite_path, history.sqlite_path.clone());

        let session = &file.session;
        set(&mut self.max_messages, session.max_messages);
        set(&mut self.rejection_warning, session.rejection_warning.clone());
        if session.persona_file.is_some() {
            self.persona_file = session.persona_file.clone();
        }
    }

    /// Overlay the `openai_api_key`, `base_url` and `model` entries of a
    /// legacy `config.txt`.
    pub fn apply_legacy(&mut self, content: &str) {
        let values = file::parse_legacy(content);
        if let Some(key) = values.get("openai_api_key") {
            self.openai_api_key = Some(key.clone());
        }
        if let Some(url) = values.get("base_url") {
            self.base_url = Some(url.clone());
        }
        if let Some(model) = values.get("model") {
            self.model = model.clone();
        }
    }

    /// Overlay environment variables read through `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        set(&mut self.host, lookup("HOST"));
        set(&mut self.port, parse_var(&lookup, "PORT")?);
        set(&mut self.provider, lookup("COUNSEL_PROVIDER"));
        if let Some(key) = lookup("OPENAI_API_KEY") {
            self.openai_api_key = Some(key);
        }
        if let Some(url) = lookup("OPENAI_BASE_URL") {
            self.base_url = Some(url);
        }
        if let Some(url) = lookup("OLLAMA_URL") {
            self.ollama_url = Some(url);
        }
        set(&mut self.model, lookup("COUNSEL_MODEL"));
        set(&mut self.history_dir, lookup("COUNSEL_HISTORY_DIR").map(PathBuf::from));
        set(&mut self.history_backend, parse_var(&lookup, "COUNSEL_HISTORY_BACKEND")?);
        set(&mut self.max_messages, parse_var(&lookup, "COUNSEL_MAX_MESSAGES")?);
        if let Some(path) = lookup("COUNSEL_PERSONA_FILE") {
            self.persona_file = Some(PathBuf::from(path));
        }
        Ok(())
    }
}

fn set<T>(slot: &mut T, value: Option<T>) {
    if let Some(value) = value {
        *slot = value;
    }
}

fn parse_var<T, F>(lookup: &F, key: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    lookup(key)
        .map(|raw| {
            raw.trim()
                .parse()
                .map_err(|e| ConfigError::Validation(format!("{key}={raw}: {e}")))
        })
        .transpose()
}
