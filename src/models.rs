use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct ChatMessage {
    pub role: MessageRole,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(MessageRole::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(MessageRole::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(MessageRole::Assistant, content)
    }
}

pub type Conversation = Vec<ChatMessage>;

#[derive(Debug, Clone, Deserialize)]
pub struct CompletionRequest {
    #[serde(default)]
    pub model: String,
    #[serde(rename = "messages", alias = "conversation", default)]
    pub conversation: Conversation,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default)]
    pub stream: bool,
    #[serde(default)]
    pub context: Option<String>,
}

fn default_temperature() -> f32 {
    0.7
}

fn default_max_tokens() -> u32 {
    512
}

impl CompletionRequest {
    pub fn normalize(mut self, default_model: &str) -> Result<Self, String> {
        if self.model.trim().is_empty() {
            self.model = default_model.to_owned();
        }
        if !self.temperature.is_finite() || self.temperature < 0.0 {
            return Err("temperature must be a non-negative number".to_owned());
        }
        if self.max_tokens == 0 {
            return Err("max_tokens must be greater than zero".to_owned());
        }
        self.context = self
            .context
            .take()
            .filter(|context| !context.trim().is_empty());

        Ok(self)
    }
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FinishReason {
    Stop,
    Length,
    Error,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

impl Usage {
    pub fn new(prompt_tokens: u32, completion_tokens: u32) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens.saturating_add(completion_tokens),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CompletionResponse {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub model: String,
    pub choices: Vec<CompletionChoice>,
    pub usage: Usage,
}

#[derive(Debug, Clone, Serialize)]
pub struct CompletionChoice {
    pub index: usize,
    pub message: ChatMessage,
    pub finish_reason: FinishReason,
}

impl CompletionResponse {
    pub fn assistant(id: String, created: i64, model: String, content: String, usage: Usage) -> Self {
        Self {
            id,
            object: "chat.completion".to_owned(),
            created,
            model,
            choices: vec![CompletionChoice {
                index: 0,
                message: ChatMessage::assistant(content),
                finish_reason: FinishReason::Stop,
            }],
            usage,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    TokenDelta { content: String },
    Done,
    Error { message: String },
}

impl StreamEvent {
    pub fn delta(content: impl Into<String>) -> Self {
        StreamEvent::TokenDelta {
            content: content.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        StreamEvent::Error {
            message: message.into(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, StreamEvent::TokenDelta { .. })
    }
}

#[derive(Debug, Serialize)]
pub struct ChatCompletionsChunk {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub model: String,
    pub choices: Vec<ChunkChoice>,
}

#[derive(Debug, Serialize)]
pub struct ChunkChoice {
    pub index: usize,
    pub delta: DeltaMessage,
}

#[derive(Debug, Serialize)]
pub struct DeltaMessage {
    pub content: String,
}

impl ChatCompletionsChunk {
    pub fn delta(id: &str, created: i64, model: &str, content: String) -> Self {
        Self {
            id: id.to_owned(),
            object: "chat.completion.chunk".to_owned(),
            created,
            model: model.to_owned(),
            choices: vec![ChunkChoice {
                index: 0,
                delta: DeltaMessage { content },
            }],
        }
    }
}

pub fn word_tokens(text: &str) -> u32 {
    text.split_whitespace().count() as u32
}
