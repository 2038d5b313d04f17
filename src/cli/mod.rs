use clap::Parser;

use crate::llm::{ Backend, LlmConfig, DEFAULT_MAX_NEW_TOKENS, DEFAULT_TEMPERATURE };

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    // --- Chat LLM Provider Args ---
    /// Backend serving the chat model (hf_hub, openai, ollama)
    #[arg(long, env = "CHAT_BACKEND", default_value = "hf_hub")]
    pub backend: Backend,

    /// Model identifier (e.g., meta-llama/Meta-Llama-3-8B-Instruct, gpt-4o-mini, llama3.2:1b)
    #[arg(long, env = "CHAT_MODEL")] // No default, rely on backend defaults if None
    pub chat_model: Option<String>,

    /// Base URL for the backend API (e.g., http://localhost:11434 for Ollama)
    #[arg(long, env = "CHAT_BASE_URL")]
    pub chat_base_url: Option<String>,

    /// Sampling temperature between 0.0 and 1.0
    #[arg(long, env = "CHAT_TEMPERATURE", default_value_t = DEFAULT_TEMPERATURE)]
    pub temperature: f32,

    /// Generation cap for the self-hosted text-generation endpoint
    #[arg(long, env = "MAX_NEW_TOKENS", default_value_t = DEFAULT_MAX_NEW_TOKENS)]
    pub max_new_tokens: u32,

    /// API token for the HuggingFace inference endpoint
    #[arg(long, env = "HUGGINGFACE_API_KEY", hide_env_values = true)]
    pub huggingface_api_key: Option<String>,

    /// API key for the OpenAI API
    #[arg(long, env = "OPENAI_API_KEY", hide_env_values = true)]
    pub openai_api_key: Option<String>,

    // --- Prompt Args ---
    /// Optional JSON file overriding the system prompt, language, greeting and user templates
    #[arg(long, env = "PROMPTS_PATH")]
    pub prompts_path: Option<String>,

    // --- Server Args ---
    /// Serve chat sessions over WebSocket instead of the interactive terminal
    #[arg(long, env = "SERVE", default_value = "false")]
    pub serve: bool,

    /// Host address and port for the server to listen on.
    #[arg(long, env = "SERVER_ADDR", default_value = "127.0.0.1:4000")]
    pub server_addr: String,

    /// Optional shared secret. If set, clients must sign the connection with ts/sig query parameters.
    #[arg(long, env = "SERVER_API_KEY", hide_env_values = true)]
    pub server_api_key: Option<String>,
}

impl Args {
    pub fn llm_config(&self) -> LlmConfig {
        let mut config = LlmConfig::for_backend(self.backend);
        if let Some(model) = self.chat_model.as_ref().filter(|m| !m.trim().is_empty()) {
            config.model = model.clone();
        }
        if let Some(url) = self.chat_base_url.as_ref().filter(|u| !u.trim().is_empty()) {
            config.base_url = url.clone();
        }
        config.temperature = self.temperature;
        config.max_new_tokens = self.max_new_tokens;
        config.api_key = match self.backend {
            Backend::HfHub => self.huggingface_api_key.clone(),
            Backend::OpenAI => self.openai_api_key.clone(),
            Backend::Ollama => None,
        };
        config
    }
}
