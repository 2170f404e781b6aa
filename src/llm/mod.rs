//! Language model access for replies, assessments and pivot questions.
//!
//! Two seams:
//! - [`ReplyGenerator`] streams a spoken reply as [`ReplyEvent`]s.
//! - [`CompletionBackend`] returns one complete answer (used for the
//!   JSON-producing assessment and question calls).
//!
//! [`api::ApiLlm`] implements both against any OpenAI-compatible server.

pub mod api;
pub mod chunker;
pub mod events;
pub(crate) mod json;
pub mod sse;

pub use api::ApiLlm;
pub use chunker::SentenceChunker;
pub use events::{FinishReason, ReplyEvent};

use crate::error::Result;
use crate::session::state::{Message, Role};
use async_trait::async_trait;
use futures_util::Stream;
use serde::{Deserialize, Serialize};
use std::pin::Pin;

/// Role of a chat message sent to a provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

/// A provider-neutral chat message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
        }
    }
}

impl From<&Message> for ChatMessage {
    fn from(message: &Message) -> Self {
        let role = match message.role {
            Role::User => ChatRole::User,
            Role::Assistant => ChatRole::Assistant,
        };
        Self {
            role,
            content: message.content.clone(),
        }
    }
}

/// `{systemContext, messages}` request shared by every call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReplyRequest {
    pub system_context: String,
    pub messages: Vec<ChatMessage>,
}

impl ReplyRequest {
    pub fn new(system_context: impl Into<String>, messages: Vec<ChatMessage>) -> Self {
        Self {
            system_context: system_context.into(),
            messages,
        }
    }

    /// Build from conversation history.
    pub fn from_history(system_context: impl Into<String>, history: &[Message]) -> Self {
        Self::new(system_context, history.iter().map(ChatMessage::from).collect())
    }
}

/// A boxed stream of reply events.
pub type ReplyStream = Pin<Box<dyn Stream<Item = ReplyEvent> + Send>>;

/// Streams spoken replies.
#[async_trait]
pub trait ReplyGenerator: Send + Sync {
    /// Open a streamed reply.
    ///
    /// # Errors
    ///
    /// Returns [`TutorError::Generation`](crate::error::TutorError::Generation)
    /// when the stream cannot be opened. Failures after that arrive in-band
    /// as [`ReplyEvent::StreamError`].
    async fn stream_reply(&self, request: &ReplyRequest) -> Result<ReplyStream>;
}

/// Produces a single complete answer.
#[async_trait]
pub trait CompletionBackend: Send + Sync {
    /// Run one non-streaming completion and return the text.
    ///
    /// # Errors
    ///
    /// Returns an error when the call fails or the response has no content.
    async fn complete(&self, request: &ReplyRequest) -> Result<String>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn history_maps_roles() {
        let history = vec![
            Message {
                role: Role::User,
                content: "what is a loop".to_owned(),
                timestamp: Utc::now(),
            },
            Message {
                role: Role::Assistant,
                content: "It repeats code.".to_owned(),
                timestamp: Utc::now(),
            },
        ];
        let request = ReplyRequest::from_history("be brief", &history);
        assert_eq!(request.system_context, "be brief");
        assert_eq!(request.messages[0], ChatMessage::user("what is a loop"));
        assert_eq!(request.messages[1], ChatMessage::assistant("It repeats code."));
    }

    #[test]
    fn chat_role_serializes_lowercase() {
        let json = serde_json::to_string(&ChatRole::Assistant).unwrap_or_default();
        assert_eq!(json, "\"assistant\"");
    }
}
