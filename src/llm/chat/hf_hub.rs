use async_trait::async_trait;
use log::debug;
use reqwest::{ Client as HttpClient, header::{ HeaderMap, HeaderValue, CONTENT_TYPE, AUTHORIZATION } };
use serde::{ Deserialize, Serialize };
use std::error::Error as StdError;

use super::{ http_stream_generate, require_api_key, ChatClient, FragmentStream };
use crate::config::prompt::Prompt;
use crate::llm::{ Backend, LlmConfig, LlmError };

/// Text-generation client for an open-weight model served behind the
/// HuggingFace inference API. The prompt is flattened to plain text, so the
/// model-specific delimiter tokens travel inside the user turn.
pub struct HfHubChatClient {
    http: HttpClient,
    repo_id: String,
    base_url: String,
    temperature: f32,
    max_new_tokens: u32,
}

#[derive(Serialize)]
struct GenerateRequest {
    inputs: String,
    parameters: GenerateParameters,
    stream: bool,
}

#[derive(Serialize)]
struct GenerateParameters {
    temperature: f32,
    max_new_tokens: u32,
    return_full_text: bool,
}

#[derive(Deserialize)]
struct StreamEvent {
    token: Option<StreamToken>,
    error: Option<String>,
}

#[derive(Deserialize)]
struct StreamToken {
    text: String,
    #[serde(default)]
    special: bool,
}

impl HfHubChatClient {
    pub fn new(
        api_key: String,
        repo_id: String,
        base_url: String,
        temperature: f32,
        max_new_tokens: u32
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
            repo_id,
            base_url,
            temperature,
            max_new_tokens,
        })
    }

    pub fn from_config(config: &LlmConfig) -> Result<Self, Box<dyn StdError + Send + Sync>> {
        let api_key = require_api_key(config)?;
        Self::new(
            api_key,
            config.model.clone(),
            config.base_url.clone(),
            config.temperature,
            config.max_new_tokens
        )
    }

    fn build_request(&self, prompt: &Prompt) -> GenerateRequest {
        GenerateRequest {
            inputs: prompt.render_text(),
            parameters: GenerateParameters {
                temperature: self.temperature,
                max_new_tokens: self.max_new_tokens,
                return_full_text: false,
            },
            stream: true,
        }
    }
}

fn parse_stream_line(line: &str) -> Result<Option<String>, LlmError> {
    let data = match line.strip_prefix("data:") {
        Some(data) => data.trim(),
        None => {
            return Ok(None);
        }
    };

    match serde_json::from_str::<StreamEvent>(data) {
        Ok(event) => {
            if let Some(error) = event.error {
                return Err(LlmError::Backend(error));
            }
            Ok(
                event.token
                    .filter(|token| !token.special && !token.text.is_empty())
                    .map(|token| token.text)
            )
        }
        Err(e) => {
            debug!("JSON parse error: {} for data: {}", e, data);
            Ok(None)
        }
    }
}

#[async_trait]
impl ChatClient for HfHubChatClient {
    async fn stream_chat(
        &self,
        prompt: &Prompt
    ) -> Result<FragmentStream, Box<dyn StdError + Send + Sync>> {
        let url = format!("{}/{}", self.base_url.trim_end_matches('/'), self.repo_id);
        let req = self.build_request(prompt);
        http_stream_generate(self.http.clone(), url, req, parse_stream_line, Vec::new()).await
    }

    fn model(&self) -> &str {
        &self.repo_id
    }

    fn backend(&self) -> Backend {
        Backend::HfHub
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::prompt::{ assemble_prompt, PromptConfig };
    use crate::llm::chat::test_support::serve_once;
    use futures::TryStreamExt;

    fn client(base_url: String) -> HfHubChatClient {
        HfHubChatClient::new(
            "hf_test".into(),
            "meta-llama/Meta-Llama-3-8B-Instruct".into(),
            base_url,
            0.1,
            512
        ).unwrap()
    }

    #[test]
    fn test_parse_stream_line_skips_special_tokens() {
        let text = r#"data:{"index":1,"token":{"id":1,"text":"Ol","logprob":-0.1,"special":false},"generated_text":null,"details":null}"#;
        assert_eq!(parse_stream_line(text).unwrap(), Some("Ol".to_string()));

        let eot = r#"data:{"index":2,"token":{"id":2,"text":"<|eot_id|>","logprob":0.0,"special":true},"generated_text":"Ol","details":null}"#;
        assert_eq!(parse_stream_line(eot).unwrap(), None);
    }

    #[test]
    fn test_parse_stream_line_error_event() {
        let line = r#"data:{"error":"Model is overloaded","error_type":"overloaded"}"#;
        assert!(parse_stream_line(line).is_err());
    }

    #[test]
    fn test_request_uses_text_generation_parameters() {
        let prompt = assemble_prompt(&PromptConfig::default(), "Oi", &[], Backend::HfHub);
        let body = serde_json::to_value(client("http://localhost".into()).build_request(&prompt)).unwrap();

        assert_eq!(body["parameters"]["max_new_tokens"], 512);
        assert_eq!(body["parameters"]["return_full_text"], false);
        assert_eq!(body["stream"], true);
        let inputs = body["inputs"].as_str().unwrap();
        assert!(inputs.starts_with("System: "));
        assert!(inputs.contains("<|start_header_id|>user<|end_header_id|>\nOi<|eot_id|>"));
    }

    #[tokio::test]
    async fn test_stream_chat_against_local_server() {
        let body = [
            r#"data:{"token":{"id":1,"text":"Ol","special":false}}"#,
            r#"data:{"token":{"id":2,"text":"á","special":false}}"#,
            r#"data:{"token":{"id":3,"text":"<|eot_id|>","special":true},"generated_text":"Olá"}"#,
        ].join("\n\n");
        let (base, server) = serve_once("200 OK", "text/event-stream", body).await;

        let prompt = assemble_prompt(&PromptConfig::default(), "Oi", &[], Backend::HfHub);
        let fragments: Vec<String> = client(base).stream_chat(&prompt).await.unwrap().try_collect().await.unwrap();
        assert_eq!(fragments.concat(), "Olá");

        let request = server.await.unwrap();
        assert!(request.starts_with("POST /meta-llama/Meta-Llama-3-8B-Instruct"));
        assert!(request.contains("Bearer hf_test"));
    }

    #[tokio::test]
    async fn test_stream_chat_rejects_non_streamed_body() {
        let body = r#"[{"generated_text":"Olá"}]"#.to_string();
        let (base, _server) = serve_once("200 OK", "application/json", body).await;

        let prompt = assemble_prompt(&PromptConfig::default(), "Oi", &[], Backend::HfHub);
        let result: Result<Vec<String>, _> = client(base).stream_chat(&prompt).await.unwrap().try_collect().await;

        let err = result.unwrap_err();
        assert!(err.to_string().contains("unrecognised response body"));
        assert!(err.to_string().contains("generated_text"));
    }
}
