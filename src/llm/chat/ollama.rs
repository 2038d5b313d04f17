use reqwest::Client as HttpClient;
use serde::{ Deserialize, Serialize };
use async_trait::async_trait;
use std::error::Error as StdError;
use super::{ http_stream_generate, ChatClient, FragmentStream };
use crate::config::prompt::Prompt;
use crate::llm::{ Backend, LlmConfig, LlmError };
use log::debug;

#[derive(Debug)]
pub struct OllamaChatClient {
    http: HttpClient,
    base_url: String,
    model: String,
    temperature: f32,
}

#[derive(Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<OllamaMessage>,
    stream: bool,
    options: ChatOptions,
}

#[derive(Serialize, Deserialize)]
struct OllamaMessage {
    role: String,
    content: String,
}

#[derive(Serialize)]
struct ChatOptions {
    temperature: f32,
}

#[derive(Deserialize)]
struct StreamResponse {
    message: Option<OllamaMessage>,
    #[serde(default)]
    error: Option<String>,
}

impl OllamaChatClient {
    pub fn new(base_url: String, model: String, temperature: f32) -> Self {
        Self {
            http: HttpClient::new(),
            base_url,
            model,
            temperature,
        }
    }

    pub fn from_config(config: &LlmConfig) -> Result<Self, Box<dyn StdError + Send + Sync>> {
        if config.backend != Backend::Ollama {
            return Err("Invalid config type for OllamaChatClient".into());
        }

        Ok(Self::new(config.base_url.clone(), config.model.clone(), config.temperature))
    }

    fn build_request(&self, prompt: &Prompt) -> ChatRequest {
        ChatRequest {
            model: self.model.clone(),
            messages: prompt
                .to_chat_messages()
                .into_iter()
                .map(|(role, content)| OllamaMessage {
                    role: role.to_string(),
                    content,
                })
                .collect(),
            stream: true,
            options: ChatOptions {
                temperature: self.temperature,
            },
        }
    }
}

/// Parses one newline-delimited JSON object from `/api/chat`.
fn parse_stream_line(line: &str) -> Result<Option<String>, LlmError> {
    match serde_json::from_str::<StreamResponse>(line) {
        Ok(stream_resp) => {
            if let Some(error) = stream_resp.error {
                return Err(LlmError::Backend(error));
            }
            Ok(
                stream_resp.message
                    .map(|message| message.content)
                    .filter(|content| !content.is_empty())
            )
        }
        Err(e) => {
            debug!("JSON parse error: {} for line: {}", e, line);
            Ok(None)
        }
    }
}

#[async_trait]
impl ChatClient for OllamaChatClient {
    async fn stream_chat(
        &self,
        prompt: &Prompt
    ) -> Result<FragmentStream, Box<dyn StdError + Send + Sync>> {
        let url = format!("{}/api/chat", self.base_url.trim_end_matches('/'));
        let req = self.build_request(prompt);
        http_stream_generate(self.http.clone(), url, req, parse_stream_line, Vec::new()).await
    }

    fn model(&self) -> &str {
        &self.model
    }

    fn backend(&self) -> Backend {
        Backend::Ollama
    }
}
