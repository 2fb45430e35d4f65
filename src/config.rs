use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub approval: ApprovalConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub retention: RetentionConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct LlmConfig {
    /// OpenAI-compatible base URL (`…/v1`).
    #[serde(default = "default_llm_url")]
    pub url: String,
    /// Model used for agent turns.
    #[serde(default = "default_model")]
    pub model: String,
    /// Fast auxiliary model used for classification and rule evaluation.
    #[serde(default = "default_model")]
    pub classifier_model: String,
    pub api_key: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AgentConfig {
    #[serde(default = "default_max_iters")]
    pub max_iters: usize,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ApprovalConfig {
    /// How long a pending approval waits before it is treated as cancelled.
    #[serde(default = "default_approval_timeout")]
    pub timeout_secs: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct LoggingConfig {
    pub level: Option<String>,
    pub directory: Option<String>,
    pub retention_days: Option<u64>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RetentionConfig {
    /// Sessions idle for more than this many days are swept at startup.
    /// 0 disables the sweep.
    #[serde(default = "default_retention_days")]
    pub days: u64,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8420
}

fn default_llm_url() -> String {
    "http://127.0.0.1:11434/v1".to_string()
}

fn default_model() -> String {
    "qwen3-coder".to_string()
}

fn default_max_iters() -> usize {
    10
}

fn default_approval_timeout() -> u64 {
    600
}

fn default_retention_days() -> u64 {
    30
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            url: default_llm_url(),
            model: default_model(),
            classifier_model: default_model(),
            api_key: None,
        }
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_iters: default_max_iters(),
        }
    }
}

impl Default for ApprovalConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_approval_timeout(),
        }
    }
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            days: default_retention_days(),
        }
    }
}

impl Config {
    /// Load `config.yaml` from the data root. A missing file yields defaults;
    /// a malformed file is an error (the caller exits with code 1).
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Config::default());
        }
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read config at {}", path.display()))?;
        let config: Config = serde_yml::from_str(&content)
            .with_context(|| format!("failed to parse config at {}", path.display()))?;
        Ok(config)
    }

    /// Effective LLM API key: config value, then `CARAPACE_LLM_API_KEY`.
    pub fn llm_api_key(&self) -> Option<String> {
        if let Some(key) = &self.llm.api_key {
            if !key.is_empty() {
                return Some(key.clone());
            }
        }
        match std::env::var("CARAPACE_LLM_API_KEY") {
            Ok(key) if !key.is_empty() => Some(key),
            _ => None,
        }
    }
}
