use async_trait::async_trait;
use log::debug;
use reqwest::{ Client as HttpClient, header::{ HeaderMap, HeaderValue, CONTENT_TYPE, AUTHORIZATION } };
use serde::{ Deserialize, Serialize };
use std::error::Error as StdError;

use super::{ http_stream_generate, require_api_key, ChatClient, FragmentStream };
use crate::config::prompt::Prompt;
use crate::llm::{ Backend, LlmConfig, LlmError };

pub struct OpenAIChatClient {
    http: HttpClient,
    model: String,
    base_url: String,
    temperature: f32,
}

#[derive(Serialize, Deserialize)]
struct OpenAIMessage {
    role: String,
    content: String,
}

#[derive(Serialize)]
struct OpenAIChatRequest {
    model: String,
    messages: Vec<OpenAIMessage>,
    temperature: f32,
    stream: bool,
}

#[derive(Deserialize)]
struct OpenAIStreamResponse {
    choices: Vec<OpenAIStreamChoice>,
}

#[derive(Deserialize)]
struct OpenAIStreamChoice {
    delta: OpenAIDelta,
}

#[derive(Deserialize)]
struct OpenAIDelta {
    content: Option<String>,
}

#[derive(Deserialize)]
struct OpenAIErrorEnvelope {
    error: OpenAIErrorBody,
}

#[derive(Deserialize)]
struct OpenAIErrorBody {
    message: String,
}

impl OpenAIChatClient {
    pub fn new(
        api_key: String,
        model: String,
        base_url: String,
        temperature: f32
    ) -> Result<Self, Box<dyn StdError + Send + Sync>> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", api_key)).map_err(|e|
                LlmError::InvalidApiKey(e.to_string())
            )?
        );

        let http = HttpClient::builder()
            .default_headers(headers)
            .build()
            .map_err(|e| Box::new(e) as Box<dyn StdError + Send + Sync>)?;

        Ok(Self {
            http,
            model,
            base_url,
            temperature,
        })
    }

    pub fn from_config(config: &LlmConfig) -> Result<Self, Box<dyn StdError + Send + Sync>> {
        let api_key = require_api_key(config)?;
        Self::new(api_key, config.model.clone(), config.base_url.clone(), config.temperature)
    }

    fn build_request(&self, prompt: &Prompt) -> OpenAIChatRequest {
        let messages = prompt
            .to_chat_messages()
            .into_iter()
            .map(|(role, content)| OpenAIMessage {
                role: role.to_string(),
                content,
            })
            .collect();

        OpenAIChatRequest {
            model: self.model.clone(),
            messages,
            temperature: self.temperature,
            stream: true,
        }
    }
}

/// Parses one server-sent-events line of a streamed chat completion.
fn parse_stream_line(line: &str) -> Result<Option<String>, LlmError> {
    let data = match line.strip_prefix("data:") {
        Some(data) => data.trim(),
        None => {
            return Ok(None);
        }
    };
    if data == "[DONE]" {
        return Ok(None);
    }

    match serde_json::from_str::<OpenAIStreamResponse>(data) {
        Ok(stream_resp) => {
            let content: String = stream_resp.choices
                .into_iter()
                .filter_map(|choice| choice.delta.content)
                .collect();
            Ok(Some(content).filter(|c| !c.is_empty()))
        }
        Err(e) => {
            if let Ok(envelope) = serde_json::from_str::<OpenAIErrorEnvelope>(data) {
                return Err(LlmError::Backend(envelope.error.message));
            }
            debug!("JSON parse error: {} for data: {}", e, data);
            Ok(None)
        }
    }
}

#[async_trait]
impl ChatClient for OpenAIChatClient {
    async fn stream_chat(
        &self,
        prompt: &Prompt
    ) -> Result<FragmentStream, Box<dyn StdError + Send + Sync>> {
        let url = format!("{}/chat/completions", self.base_url.trim_end_matches('/'));
        let req = self.build_request(prompt);
        http_stream_generate(self.http.clone(), url, req, parse_stream_line, Vec::new()).await
    }

    fn model(&self) -> &str {
        &self.model
    }

    fn backend(&self) -> Backend {
        Backend::OpenAI
    }
}
