use chrono::Utc;
use serde::{ Deserialize, Serialize };
use uuid::Uuid;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Assistant,
    Human,
}

impl Role {
    pub fn label(&self) -> &'static str {
        match self {
            Role::Assistant => "AI",
            Role::Human => "Human",
        }
    }
}

/// A single labeled chat message. Fields are private so a message cannot be
/// edited once it has been created.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Message {
    role: Role,
    content: String,
    timestamp: i64,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            timestamp: Utc::now().timestamp(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    pub fn human(content: impl Into<String>) -> Self {
        Self::new(Role::Human, content)
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }
}

/// In-memory, append-only message log for one interactive session.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Conversation {
    id: String,
    messages: Vec<Message>,
}

impl Conversation {
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            messages: Vec::new(),
        }
    }

    /// Starts a session with the assistant greeting already in place.
    pub fn seeded(greeting: &str) -> Self {
        let mut conversation = Self::new();
        conversation.append(Message::assistant(greeting));
        conversation
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn append(&mut self, message: Message) {
        self.messages.push(message);
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

impl Default for Conversation {
    fn default() -> Self {
        Self::new()
    }
}

pub fn format_transcript(conversation: &Conversation) -> String {
    let mut result = String::new();
    for msg in conversation.messages() {
        result.push_str(&format!("{}: {}\n", msg.role().label(), msg.content()));
    }
    result
}
