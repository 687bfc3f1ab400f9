use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

pub const MIN_CONTEXT_LIMIT: usize = 2;
pub const DEFAULT_FALLBACK_REPLY: &str = "Sorry, I couldn't generate a response.";

/// Which blob store backs the persisted conversation, memories and emotion.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StateBackend {
    #[default]
    Sqlite,
    JsonFiles,
    Memory,
}

impl StateBackend {
    fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "sqlite" | "db" => Some(StateBackend::Sqlite),
            "json_files" | "json" | "files" => Some(StateBackend::JsonFiles),
            "memory" | "in_memory" => Some(StateBackend::Memory),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    // Gateway (OpenAI-compatible: Ollama, LM Studio, vLLM, Groq, OpenAI, etc.)
    #[serde(default = "default_llm_url", alias = "gateway_endpoint")]
    pub llm_api_url: String,
    #[serde(default = "default_llm_model")]
    pub llm_model: String,
    #[serde(default)]
    pub llm_api_key: Option<String>,
    #[serde(default = "default_gateway_timeout_secs", alias = "gateway_timeout")]
    pub gateway_timeout_secs: u64,

    // Agent identity
    #[serde(default = "default_username", alias = "agent_name")]
    pub username: String,
    #[serde(default = "default_character_sheet_path")]
    pub character_sheet_path: String,

    // Conversation and memory shape
    #[serde(default = "default_context_limit")]
    pub context_limit: usize,
    #[serde(default = "default_memory_capacity")]
    pub memory_capacity: usize,
    #[serde(default = "default_consolidation_period")]
    pub consolidation_period: usize,

    // Sampling
    #[serde(default = "default_reply_temperature")]
    pub reply_temperature: f32,
    #[serde(default = "default_extraction_temperature")]
    pub extraction_temperature: f32,
    #[serde(default = "default_fallback_reply")]
    pub fallback_reply: String,

    // Persistence
    #[serde(default)]
    pub state_backend: StateBackend,
    #[serde(default = "default_database_path")]
    pub database_path: String,
    #[serde(default = "default_state_dir")]
    pub state_dir: String,
}

fn default_llm_url() -> String {
    "http://localhost:11434/v1".to_string()
}

fn default_llm_model() -> String {
    "llama3.2".to_string()
}

fn default_gateway_timeout_secs() -> u64 {
    60
}

fn default_username() -> String {
    "Mina".to_string()
}

fn default_character_sheet_path() -> String {
    "mina_prompt.txt".to_string()
}

fn default_context_limit() -> usize {
    16
}

fn default_memory_capacity() -> usize {
    crate::memory::DEFAULT_MEMORY_CAPACITY
}

fn default_consolidation_period() -> usize {
    4
}

fn default_reply_temperature() -> f32 {
    0.9
}

fn default_extraction_temperature() -> f32 {
    0.5
}

fn default_fallback_reply() -> String {
    DEFAULT_FALLBACK_REPLY.to_string()
}

fn default_database_path() -> String {
    "mina_state.db".to_string()
}

fn default_state_dir() -> String {
    ".".to_string()
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            llm_api_url: default_llm_url(),
            llm_model: default_llm_model(),
            llm_api_key: None,
            gateway_timeout_secs: default_gateway_timeout_secs(),
            username: default_username(),
            character_sheet_path: default_character_sheet_path(),
            context_limit: default_context_limit(),
            memory_capacity: default_memory_capacity(),
            consolidation_period: default_consolidation_period(),
            reply_temperature: default_reply_temperature(),
            extraction_temperature: default_extraction_temperature(),
            fallback_reply: default_fallback_reply(),
            state_backend: StateBackend::default(),
            database_path: default_database_path(),
            state_dir: default_state_dir(),
        }
    }
}

impl AgentConfig {
    /// Get the directory containing the executable
    fn get_base_dir() -> PathBuf {
        match std::env::current_exe() {
            Ok(exe_path) => exe_path
                .parent()
                .map(|p| p.to_path_buf())
                .unwrap_or_else(|| PathBuf::from(".")),
            Err(_) => PathBuf::from("."),
        }
    }

    /// Get the path to the config file (relative to executable)
    pub fn config_path() -> PathBuf {
        Self::get_base_dir().join("mina_config.toml")
    }

    /// Load config from mina_config.toml (next to executable), then apply env overrides
    pub fn load() -> Self {
        let path = Self::config_path();

        if let Ok(contents) = fs::read_to_string(&path) {
            match Self::from_toml_str(&contents) {
                Ok(config) => {
                    tracing::info!("Loaded config from {:?}", path);
                    return config.with_env_overrides();
                }
                Err(e) => {
                    tracing::error!("Failed to parse {:?}: {:#}", path, e);
                }
            }
        }

        tracing::warn!("No usable config file found, using defaults + env vars");
        Self::from_env()
    }

    pub fn from_toml_str(contents: &str) -> Result<Self> {
        toml::from_str::<AgentConfig>(contents).context("Invalid config TOML")
    }

    /// Save config to file (next to executable)
    pub fn save(&self) -> Result<()> {
        let path = Self::config_path();

        let toml_string = toml::to_string_pretty(self).context("Failed to serialize config")?;

        fs::write(&path, toml_string)
            .with_context(|| format!("Failed to write config to {:?}", path))?;

        tracing::info!("Saved config to {:?}", path);
        Ok(())
    }

    /// Defaults plus environment variables
    pub fn from_env() -> Self {
        Self::default().with_env_overrides()
    }

    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(url) = env::var("LLM_API_URL") {
            self.llm_api_url = url;
        }

        if let Ok(model) = env::var("LLM_MODEL") {
            self.llm_model = model;
        }

        if let Ok(key) = env::var("LLM_API_KEY") {
            if !key.trim().is_empty() {
                self.llm_api_key = Some(key);
            }
        }

        if let Ok(timeout) = env::var("MINA_GATEWAY_TIMEOUT_SECS") {
            if let Ok(seconds) = timeout.trim().parse() {
                self.gateway_timeout_secs = seconds;
            }
        }

        if let Ok(limit) = env::var("MINA_CONTEXT_LIMIT") {
            if let Ok(limit) = limit.trim().parse() {
                self.context_limit = limit;
            }
        }

        if let Ok(capacity) = env::var("MINA_MEMORY_CAPACITY") {
            if let Ok(capacity) = capacity.trim().parse() {
                self.memory_capacity = capacity;
            }
        }

        if let Ok(period) = env::var("MINA_CONSOLIDATION_PERIOD") {
            if let Ok(period) = period.trim().parse() {
                self.consolidation_period = period;
            }
        }

        if let Ok(name) = env::var("AGENT_NAME") {
            if !name.trim().is_empty() {
                self.username = name;
            }
        }

        if let Ok(path) = env::var("MINA_CHARACTER_SHEET") {
            if !path.trim().is_empty() {
                self.character_sheet_path = path;
            }
        }

        if let Ok(backend) = env::var("MINA_STATE_BACKEND") {
            match StateBackend::parse(&backend) {
                Some(backend) => self.state_backend = backend,
                None => tracing::warn!("Ignoring unknown MINA_STATE_BACKEND '{}'", backend),
            }
        }

        if let Ok(path) = env::var("MINA_DATABASE_PATH") {
            if !path.trim().is_empty() {
                self.database_path = path;
            }
        }

        self
    }
}

/// Validated knobs handed to the engine at construction.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub context_limit: usize,
    pub memory_capacity: usize,
    pub consolidation_period: usize,
    pub gateway_timeout: Duration,
    pub reply_temperature: f32,
    pub extraction_temperature: f32,
    pub fallback_reply: String,
    pub assistant_label: String,
}

impl EngineSettings {
    pub fn from_config(config: &AgentConfig) -> Self {
        let fallback_reply = if config.fallback_reply.trim().is_empty() {
            DEFAULT_FALLBACK_REPLY.to_string()
        } else {
            config.fallback_reply.clone()
        };
        let assistant_label = if config.username.trim().is_empty() {
            default_username()
        } else {
            config.username.trim().to_string()
        };

        Self {
            context_limit: config.context_limit.max(MIN_CONTEXT_LIMIT),
            memory_capacity: config.memory_capacity.max(1),
            consolidation_period: config.consolidation_period.max(1),
            gateway_timeout: Duration::from_secs(config.gateway_timeout_secs.max(1)),
            reply_temperature: config.reply_temperature.clamp(0.0, 2.0),
            extraction_temperature: config.extraction_temperature.clamp(0.0, 2.0),
            fallback_reply,
            assistant_label,
        }
    }
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self::from_config(&AgentConfig::default())
    }
}
