use serde::Deserialize;
use std::error::Error;
use std::fmt;
use std::fs;
use std::path::Path;
use log::info;

use crate::history::{ Message, Role };
use crate::llm::Backend;

const DEFAULT_SYSTEM_TEMPLATE: &str =
    "Você é um assistente e está respondendo perguntas gerais. Responda em {language}.";
const DEFAULT_LANGUAGE: &str = "português";
const DEFAULT_GREETING: &str = "Olá, sou o seu assistente virtual! Como posso ajudar você?";
const DEFAULT_HF_USER_TEMPLATE: &str =
    "<|begin_of_text|><|start_header_id|>user<|end_header_id|>\n{input}<|eot_id|><|start_header_id|>assistant<|end_header_id|>";
const DEFAULT_USER_TEMPLATE: &str = "{input}";

#[derive(Debug)]
pub enum PromptError {
    MissingPlaceholder { template: String, placeholder: String },
    IoError(std::io::Error),
    JsonError(serde_json::Error),
}

impl fmt::Display for PromptError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PromptError::MissingPlaceholder { template, placeholder } =>
                write!(f, "Prompt template '{}' is missing placeholder '{}'", template, placeholder),
            PromptError::IoError(e) => write!(f, "Prompt file IO error: {}", e),
            PromptError::JsonError(e) => write!(f, "Prompt JSON parsing error: {}", e),
        }
    }
}

impl Error for PromptError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            PromptError::IoError(e) => Some(e),
            PromptError::JsonError(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for PromptError {
    fn from(err: std::io::Error) -> Self {
        PromptError::IoError(err)
    }
}

impl From<serde_json::Error> for PromptError {
    fn from(err: serde_json::Error) -> Self {
        PromptError::JsonError(err)
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct PromptConfig {
    pub system_template: String,
    pub language: String,
    pub greeting: String,
    pub hf_user_template: String,
    pub user_template: String,
}

impl Default for PromptConfig {
    fn default() -> Self {
        Self {
            system_template: DEFAULT_SYSTEM_TEMPLATE.to_string(),
            language: DEFAULT_LANGUAGE.to_string(),
            greeting: DEFAULT_GREETING.to_string(),
            hf_user_template: DEFAULT_HF_USER_TEMPLATE.to_string(),
            user_template: DEFAULT_USER_TEMPLATE.to_string(),
        }
    }
}

impl PromptConfig {
    pub fn validate(&self) -> Result<(), PromptError> {
        for (name, template) in [
            ("hf_user_template", &self.hf_user_template),
            ("user_template", &self.user_template),
        ] {
            if !template.contains("{input}") {
                return Err(PromptError::MissingPlaceholder {
                    template: name.to_string(),
                    placeholder: "{input}".to_string(),
                });
            }
        }
        Ok(())
    }

    pub fn system_instruction(&self) -> String {
        self.system_template.replace("{language}", &self.language)
    }

    pub fn user_turn(&self, backend: Backend, query: &str) -> String {
        let template = match backend {
            Backend::HfHub => &self.hf_user_template,
            Backend::OpenAI | Backend::Ollama => &self.user_template,
        };
        template.replace("{input}", query)
    }
}

pub fn load_prompts<P: AsRef<Path>>(path: P) -> Result<PromptConfig, PromptError> {
    let file_content = fs::read_to_string(&path)?;
    let config: PromptConfig = serde_json::from_str(&file_content)?;
    config.validate()?;
    info!("Loaded prompt configuration from {}", path.as_ref().display());
    Ok(config)
}

/// A prompt ready for submission: system instruction, prior turns, then the
/// current user turn.
#[derive(Debug, Clone)]
pub struct Prompt {
    pub system: String,
    pub history: Vec<Message>,
    pub user: String,
}

impl Prompt {
    pub fn to_chat_messages(&self) -> Vec<(&'static str, String)> {
        let mut messages = Vec::with_capacity(self.history.len() + 2);
        messages.push(("system", self.system.clone()));
        for msg in &self.history {
            let role = match msg.role() {
                Role::Assistant => "assistant",
                Role::Human => "user",
            };
            messages.push((role, msg.content().to_string()));
        }
        messages.push(("user", self.user.clone()));
        messages
    }

    /// Flattens the prompt for completion-style endpoints.
    pub fn render_text(&self) -> String {
        let mut lines = Vec::with_capacity(self.history.len() + 2);
        lines.push(format!("System: {}", self.system));
        for msg in &self.history {
            lines.push(format!("{}: {}", msg.role().label(), msg.content()));
        }
        lines.push(format!("Human: {}", self.user));
        lines.join("\n")
    }
}

pub fn assemble_prompt(
    config: &PromptConfig,
    query: &str,
    history: &[Message],
    backend: Backend
) -> Prompt {
    Prompt {
        system: config.system_instruction(),
        history: history.to_vec(),
        user: config.user_turn(backend, query),
    }
}
