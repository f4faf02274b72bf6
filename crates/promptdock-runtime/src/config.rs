//! YAML configuration for the orchestrator process.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Read(String),
    #[error("failed to parse config: {0}")]
    Parse(String),
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    /// API key for the chat-completions endpoint.
    pub llm_api_key: String,
    /// Public listen port for the orchestrator.
    pub port: u16,
    /// Directory holding the `<id>.json` runtime records.
    pub executer_store: PathBuf,

    #[serde(default = "default_llm_api_url")]
    pub llm_api_url: String,
    #[serde(default = "default_llm_model")]
    pub llm_model: String,
    #[serde(default = "default_retry_limit")]
    pub retry_limit: u32,
    #[serde(default = "default_candidates")]
    pub candidates: usize,
    /// Interpreter command the sandbox hands generated programs to.
    #[serde(default = "default_interpreter_cmd")]
    pub interpreter_cmd: Vec<String>,
}

fn default_llm_api_url() -> String {
    "https://api.openai.com/v1/chat/completions".to_string()
}

fn default_llm_model() -> String {
    "o1-mini".to_string()
}

fn default_retry_limit() -> u32 {
    5
}

fn default_candidates() -> usize {
    5
}

fn default_interpreter_cmd() -> Vec<String> {
    vec!["yaegi".to_string(), "run".to_string()]
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text =
            std::fs::read_to_string(path.as_ref()).map_err(|e| ConfigError::Read(e.to_string()))?;
        Self::from_yaml(&text)
    }

    pub fn from_yaml(input: &str) -> Result<Self, ConfigError> {
        serde_yaml::from_str(input).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Base URL the health check and `/execute` responses use.
    pub fn public_base_url(&self) -> String {
        format!("http://localhost:{}", self.port)
    }
}
