use std::{fmt, str::FromStr};

use serde_json::{json, Value};

use crate::{
    backend::BackendDialect,
    models::{word_tokens, ChatMessage, CompletionRequest, Conversation, MessageRole},
};

pub const DEFAULT_GREETING: &str = "Hello!";

const CONTEXT_PREAMBLE: &str = "Use the following context to answer the user.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptStyle {
    Llama3,
    Plain,
}

impl PromptStyle {
    pub fn as_str(&self) -> &'static str {
        match self {
            PromptStyle::Llama3 => "llama3",
            PromptStyle::Plain => "plain",
        }
    }

    pub fn supports_system(&self) -> bool {
        matches!(self, PromptStyle::Llama3)
    }

    pub fn stop_sequences(&self) -> &'static [&'static str] {
        match self {
            PromptStyle::Llama3 => &["<|eot_id|>", "<|start_header_id|>"],
            PromptStyle::Plain => &["\nUser:"],
        }
    }

    fn render_turn(&self, out: &mut String, message: &ChatMessage) {
        match self {
            PromptStyle::Llama3 => {
                out.push_str("<|start_header_id|>");
                out.push_str(llama3_role(message.role));
                out.push_str("<|end_header_id|>\n\n");
                out.push_str(message.content.trim());
                out.push_str("<|eot_id|>");
            }
            PromptStyle::Plain => {
                out.push_str(match message.role {
                    MessageRole::User | MessageRole::System => "User: ",
                    MessageRole::Assistant => "Assistant: ",
                });
                out.push_str(message.content.trim());
                out.push('\n');
            }
        }
    }

    fn assistant_opener(&self) -> &'static str {
        match self {
            PromptStyle::Llama3 => "<|start_header_id|>assistant<|end_header_id|>\n\n",
            PromptStyle::Plain => "Assistant:",
        }
    }
}

impl fmt::Display for PromptStyle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PromptStyle {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "llama3" | "llama-3" => Ok(PromptStyle::Llama3),
            "plain" => Ok(PromptStyle::Plain),
            other => Err(format!("unknown prompt style `{other}`")),
        }
    }
}

fn llama3_role(role: MessageRole) -> &'static str {
    match role {
        MessageRole::System => "system",
        MessageRole::User => "user",
        MessageRole::Assistant => "assistant",
    }
}

#[derive(Debug, Clone)]
pub struct FormattedPrompt {
    pub payload: Value,
    pub retained: Conversation,
    pub prompt_tokens: u32,
}

#[derive(Debug, Clone)]
pub struct PromptFormatter {
    dialect: BackendDialect,
    style: PromptStyle,
    retained_exchanges: usize,
}

impl PromptFormatter {
    pub fn new(dialect: BackendDialect, style: PromptStyle, retained_exchanges: usize) -> Self {
        Self {
            dialect,
            style,
            retained_exchanges: retained_exchanges.max(1),
        }
    }

    pub fn format(&self, request: &CompletionRequest) -> FormattedPrompt {
        let mut conversation = Vec::with_capacity(request.conversation.len() + 2);
        if let Some(context) = &request.context {
            conversation.push(ChatMessage::system(format!(
                "{CONTEXT_PREAMBLE}\n\n{}",
                context.trim()
            )));
        }
        conversation.extend(request.conversation.iter().cloned());
        if !conversation
            .iter()
            .any(|message| message.role == MessageRole::User)
        {
            conversation.push(ChatMessage::user(DEFAULT_GREETING));
        }

        let retained = truncate_conversation(&conversation, self.retained_exchanges);
        let prompt_tokens = retained
            .iter()
            .map(|message| word_tokens(&message.content))
            .sum();

        let payload = match self.dialect {
            BackendDialect::LlamaCpp => json!({
                "prompt": render_prompt(self.style, &retained),
                "n_predict": request.max_tokens,
                "temperature": request.temperature,
                "stream": request.stream,
                "stop": self.style.stop_sequences(),
            }),
            BackendDialect::Ollama => json!({
                "model": request.model,
                "prompt": render_prompt(self.style, &retained),
                "raw": true,
                "stream": request.stream,
                "options": {
                    "temperature": request.temperature,
                    "num_predict": request.max_tokens,
                    "stop": self.style.stop_sequences(),
                },
            }),
            BackendDialect::OpenAi => json!({
                "model": request.model,
                "messages": retained,
                "max_tokens": request.max_tokens,
                "temperature": request.temperature,
                "stream": request.stream,
            }),
        };

        FormattedPrompt {
            payload,
            retained,
            prompt_tokens,
        }
    }
}

pub fn truncate_conversation(conversation: &[ChatMessage], exchanges: usize) -> Conversation {
    let turns = conversation
        .iter()
        .enumerate()
        .filter(|(_, message)| message.role != MessageRole::System)
        .map(|(index, _)| index)
        .collect::<Vec<_>>();

    let window = exchanges.saturating_mul(2);
    let mut first_kept = turns.len().saturating_sub(window);
    if let Some(last_user) = turns
        .iter()
        .rposition(|index| conversation[*index].role == MessageRole::User)
    {
        first_kept = first_kept.min(last_user);
    }
    let cutoff = turns.get(first_kept).copied().unwrap_or(conversation.len());

    conversation
        .iter()
        .enumerate()
        .filter(|(index, message)| message.role == MessageRole::System || *index >= cutoff)
        .map(|(_, message)| message.clone())
        .collect()
}

pub fn render_prompt(style: PromptStyle, conversation: &[ChatMessage]) -> String {
    let mut prompt = String::new();

    if style.supports_system() {
        for message in conversation {
            style.render_turn(&mut prompt, message);
        }
    } else {
        let system = conversation
            .iter()
            .filter(|message| message.role == MessageRole::System)
            .map(|message| message.content.trim())
            .collect::<Vec<_>>()
            .join("\n\n");
        let mut pending_system = (!system.is_empty()).then_some(system);

        for message in conversation
            .iter()
            .filter(|message| message.role != MessageRole::System)
        {
            match (message.role, pending_system.take()) {
                (MessageRole::User, Some(system)) => {
                    let folded = ChatMessage::user(format!("{system}\n\n{}", message.content.trim()));
                    style.render_turn(&mut prompt, &folded);
                }
                (_, leftover) => {
                    pending_system = leftover;
                    style.render_turn(&mut prompt, message);
                }
            }
        }
    }

    prompt.push_str(style.assistant_opener());
    prompt
}
