pub mod chat;
use serde::{ Deserialize, Serialize };
use std::str::FromStr;
use std::fmt;
use thiserror::Error;

pub const DEFAULT_TEMPERATURE: f32 = 0.1;
pub const DEFAULT_MAX_NEW_TOKENS: u32 = 512;

/// The three inference services a session can talk to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub enum Backend {
    /// Self-hosted open-weight model behind a HuggingFace inference endpoint.
    #[serde(rename = "hf_hub")]
    HfHub,
    /// Vendor-hosted API.
    #[serde(rename = "openai")]
    OpenAI,
    /// Local inference server.
    #[serde(rename = "ollama")]
    Ollama,
}

impl Backend {
    pub fn default_model(&self) -> &'static str {
        match self {
            Backend::HfHub => "meta-llama/Meta-Llama-3-8B-Instruct",
            Backend::OpenAI => "gpt-4o-mini",
            Backend::Ollama => "llama3.2:1b",
        }
    }

    pub fn default_base_url(&self) -> &'static str {
        match self {
            Backend::HfHub => "https://api-inference.huggingface.co/models",
            Backend::OpenAI => "https://api.openai.com/v1",
            Backend::Ollama => "http://localhost:11434",
        }
    }

    /// Environment key holding the credential for this backend, if it needs one.
    pub fn api_key_env(&self) -> Option<&'static str> {
        match self {
            Backend::HfHub => Some("HUGGINGFACE_API_KEY"),
            Backend::OpenAI => Some("OPENAI_API_KEY"),
            Backend::Ollama => None,
        }
    }

    pub fn requires_api_key(&self) -> bool {
        self.api_key_env().is_some()
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self {
            Backend::HfHub => "hf_hub",
            Backend::OpenAI => "openai",
            Backend::Ollama => "ollama",
        };
        write!(f, "{}", tag)
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct ParseBackendError {
    message: String,
}

impl fmt::Display for ParseBackendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for ParseBackendError {}

impl FromStr for Backend {
    type Err = ParseBackendError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "hf_hub" | "hf" | "huggingface" | "self-hosted" => Ok(Backend::HfHub),
            "openai" | "vendor-api" => Ok(Backend::OpenAI),
            "ollama" | "local-server" => Ok(Backend::Ollama),
            _ =>
                Err(ParseBackendError {
                    message: format!("Invalid backend: '{}' (expected hf_hub, openai or ollama)", s),
                }),
        }
    }
}

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("{backend} requires an API key (set {env_key})")]
    MissingApiKey {
        backend: Backend,
        env_key: &'static str,
    },
    #[error("temperature {0} is outside 0.0..=1.0")]
    InvalidTemperature(f32),
    #[error("invalid API key format: {0}")]
    InvalidApiKey(String),
    #[error("backend returned HTTP {status}: {body}")]
    Http {
        status: u16,
        body: String,
    },
    #[error("backend reported an error: {0}")]
    Backend(String),
}

/// Everything needed to build a model handle: which backend, which model and
/// how much sampling randomness.
#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub backend: Backend,
    pub api_key: Option<String>,
    pub model: String,
    pub base_url: String,
    pub temperature: f32,
    pub max_new_tokens: u32,
}

impl LlmConfig {
    pub fn for_backend(backend: Backend) -> Self {
        Self {
            backend,
            api_key: None,
            model: backend.default_model().to_string(),
            base_url: backend.default_base_url().to_string(),
            temperature: DEFAULT_TEMPERATURE,
            max_new_tokens: DEFAULT_MAX_NEW_TOKENS,
        }
    }

    pub fn validate(&self) -> Result<(), LlmError> {
        if !(0.0..=1.0).contains(&self.temperature) {
            return Err(LlmError::InvalidTemperature(self.temperature));
        }
        Ok(())
    }
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self::for_backend(Backend::HfHub)
    }
}
