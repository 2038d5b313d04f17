use crate::config::prompt::{ assemble_prompt, Prompt, PromptConfig };
use crate::history::{ Conversation, Message };
use crate::llm::chat::{ ChatClient, ModelProvider };

use futures::StreamExt;
use log::{ debug, info };
use std::error::Error;
use std::sync::Arc;

/// Sends the prompt and drains the fragment stream into one reply. The first
/// failed fragment aborts the turn.
pub async fn execute_prompt(
    client: &dyn ChatClient,
    prompt: &Prompt
) -> Result<String, Box<dyn Error + Send + Sync>> {
    let mut stream = client.stream_chat(prompt).await?;
    let mut response = String::new();
    let mut fragments = 0usize;

    while let Some(fragment) = stream.next().await {
        response.push_str(&fragment?);
        fragments += 1;
    }

    debug!("Received {} fragment(s) from {} ({})", fragments, client.backend(), client.model());
    Ok(response)
}

/// Stateless turn processor shared by every session. The conversation is
/// owned by the caller and passed in on each turn.
#[derive(Clone)]
pub struct ChatAgent {
    provider: Arc<dyn ModelProvider>,
    prompt_config: Arc<PromptConfig>,
}

impl ChatAgent {
    pub fn new(provider: Arc<dyn ModelProvider>, prompt_config: PromptConfig) -> Self {
        Self {
            provider,
            prompt_config: Arc::new(prompt_config),
        }
    }

    pub fn prompt_config(&self) -> &PromptConfig {
        &self.prompt_config
    }

    pub fn new_conversation(&self) -> Conversation {
        Conversation::seeded(&self.prompt_config.greeting)
    }

    /// Runs one turn. An empty query is ignored: nothing is appended and the
    /// backend is never contacted. On backend failure the user message stays
    /// in the conversation and the error is returned.
    pub async fn process_message(
        &self,
        conversation: &mut Conversation,
        query: &str
    ) -> Result<Option<String>, Box<dyn Error + Send + Sync>> {
        if query.trim().is_empty() {
            return Ok(None);
        }

        let prior_len = conversation.len();
        conversation.append(Message::human(query));

        let prompt = assemble_prompt(
            &self.prompt_config,
            query,
            &conversation.messages()[..prior_len],
            self.provider.backend()
        );

        let client = self.provider.connect()?;
        info!(
            "Conversation {}: sending turn to {} ({}) with {} prior message(s)",
            conversation.id(),
            client.backend(),
            client.model(),
            prior_len
        );
        let response = execute_prompt(client.as_ref(), &prompt).await?;

        conversation.append(Message::assistant(response.clone()));
        Ok(Some(response))
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use super::test_support::*;
    use crate::history::Role;
    use crate::llm::Backend;

    fn agent_with(provider: Arc<ScriptedProvider>) -> ChatAgent {
        ChatAgent::new(provider, PromptConfig::default())
    }

    #[tokio::test]
    async fn test_execute_prompt_concatenates_fragments() {
        let provider = ScriptedProvider::new(Backend::OpenAI, &["Ol", "á"]);
        let client = provider.connect().unwrap();
        let prompt = assemble_prompt(&PromptConfig::default(), "Oi", &[], Backend::OpenAI);
        assert_eq!(execute_prompt(client.as_ref(), &prompt).await.unwrap(), "Olá");
    }

    #[tokio::test]
    async fn test_execute_prompt_empty_stream_yields_empty_reply() {
        let provider = ScriptedProvider::new(Backend::Ollama, &[]);
        let client = provider.connect().unwrap();
        let prompt = assemble_prompt(&PromptConfig::default(), "Oi", &[], Backend::Ollama);
        assert_eq!(execute_prompt(client.as_ref(), &prompt).await.unwrap(), "");
    }

    #[tokio::test]
    async fn test_execute_prompt_propagates_stream_error() {
        let provider = ScriptedProvider::failing(Backend::OpenAI, "backend down");
        let client = provider.connect().unwrap();
        let prompt = assemble_prompt(&PromptConfig::default(), "Oi", &[], Backend::OpenAI);
        let err = execute_prompt(client.as_ref(), &prompt).await.unwrap_err();
        assert_eq!(err.to_string(), "backend down");
    }

    #[tokio::test]
    async fn test_turn_appends_human_and_assistant() {
        let provider = Arc::new(ScriptedProvider::new(Backend::OpenAI, &["Ol", "á"]));
        let agent = agent_with(Arc::clone(&provider));
        let mut conversation = agent.new_conversation();

        let reply = agent.process_message(&mut conversation, "Oi").await.unwrap();
        assert_eq!(reply.as_deref(), Some("Olá"));

        let roles: Vec<Role> = conversation.messages().iter().map(|m| m.role()).collect();
        assert_eq!(roles, vec![Role::Assistant, Role::Human, Role::Assistant]);
        assert_eq!(conversation.messages()[1].content(), "Oi");
        assert_eq!(conversation.messages()[2].content(), "Olá");
        assert_eq!(provider.connect_count(), 1);
    }

    #[tokio::test]
    async fn test_empty_query_is_ignored() {
        let provider = Arc::new(ScriptedProvider::new(Backend::OpenAI, &["unused"]));
        let agent = agent_with(Arc::clone(&provider));
        let mut conversation = agent.new_conversation();

        assert!(agent.process_message(&mut conversation, "").await.unwrap().is_none());
        assert!(agent.process_message(&mut conversation, "   ").await.unwrap().is_none());

        assert_eq!(conversation.len(), 1);
        assert_eq!(provider.connect_count(), 0);
        assert!(provider.prompts.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_prompt_contains_prior_history_only() {
        let provider = Arc::new(ScriptedProvider::new(Backend::Ollama, &["ok"]));
        let agent = agent_with(Arc::clone(&provider));
        let mut conversation = agent.new_conversation();

        agent.process_message(&mut conversation, "primeira").await.unwrap();
        agent.process_message(&mut conversation, "segunda").await.unwrap();

        let prompts = provider.prompts.lock().unwrap();
        assert_eq!(prompts.len(), 2);
        assert_eq!(prompts[0].history.len(), 1);
        assert_eq!(prompts[1].history.len(), 3);
        assert_eq!(prompts[1].history[1].content(), "primeira");
        assert_eq!(prompts[1].user, "segunda");
        assert_eq!(provider.connect_count(), 2);
    }

    #[tokio::test]
    async fn test_hf_backend_wraps_user_turn() {
        let provider = Arc::new(ScriptedProvider::new(Backend::HfHub, &["ok"]));
        let agent = agent_with(Arc::clone(&provider));
        let mut conversation = agent.new_conversation();

        agent.process_message(&mut conversation, "Oi").await.unwrap();

        let prompts = provider.prompts.lock().unwrap();
        assert!(prompts[0].user.starts_with("<|begin_of_text|>"));
        assert!(prompts[0].user.ends_with("<|start_header_id|>assistant<|end_header_id|>"));
        assert_eq!(conversation.messages()[1].content(), "Oi");
    }

    #[tokio::test]
    async fn test_backend_error_keeps_user_message() {
        let provider = Arc::new(ScriptedProvider::failing(Backend::OpenAI, "timeout"));
        let agent = agent_with(Arc::clone(&provider));
        let mut conversation = agent.new_conversation();

        let result = agent.process_message(&mut conversation, "Oi").await;
        assert!(result.is_err());
        assert_eq!(conversation.len(), 2);
        assert_eq!(conversation.messages()[1].role(), Role::Human);
    }

    #[tokio::test]
    async fn test_sessions_are_independent() {
        let provider = Arc::new(ScriptedProvider::new(Backend::OpenAI, &["r"]));
        let agent = agent_with(provider);
        let mut first = agent.new_conversation();
        let mut second = agent.new_conversation();

        agent.process_message(&mut first, "a").await.unwrap();
        assert_eq!(first.len(), 3);
        assert_eq!(second.len(), 1);

        agent.process_message(&mut second, "b").await.unwrap();
        assert_eq!(second.messages()[1].content(), "b");
        assert_eq!(first.len(), 3);
    }

    #[tokio::test]
    async fn test_unrecognised_backend_body_is_not_stored_as_reply() {
        let body = r#"[{"generated_text":"Olá"}]"#.to_string();
        let (base, _server) = crate::llm::chat::test_support::serve_once("200 OK", "application/json", body).await;
        let mut config = crate::llm::LlmConfig::for_backend(Backend::HfHub);
        config.api_key = Some("hf_test".into());
        config.base_url = base;
        let agent = ChatAgent::new(Arc::new(config), PromptConfig::default());
        let mut conversation = agent.new_conversation();

        let result = agent.process_message(&mut conversation, "Oi").await;

        assert!(result.unwrap_err().to_string().contains("unrecognised response body"));
        assert_eq!(conversation.len(), 2);
        assert_eq!(conversation.messages()[1].role(), Role::Human);
    }
}
