//! Conversation state shared by the controller and the dialogue pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What the session is doing right now. Exactly one at a time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Listening; a finalized utterance may start a turn.
    #[default]
    Idle,
    /// Utterance finalized, reply and assessment under way.
    Processing,
    /// Reply audio is playing.
    Speaking,
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Processing => write!(f, "processing"),
            Self::Speaking => write!(f, "speaking"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// One entry of the conversation history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            timestamp: Utc::now(),
        }
    }
}

/// The task the student is working on, handed to assessments and replies.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskContext {
    /// Task description.
    pub task: String,
    /// The student's current code.
    pub code: String,
    /// Latest error output, if any.
    pub error: String,
}

impl TaskContext {
    pub fn is_empty(&self) -> bool {
        self.task.trim().is_empty() && self.code.trim().is_empty() && self.error.trim().is_empty()
    }

    /// Render as a prompt section. Empty fields are omitted.
    pub fn render(&self) -> String {
        let mut out = String::new();
        if !self.task.trim().is_empty() {
            out.push_str("Current task:\n");
            out.push_str(self.task.trim());
            out.push_str("\n\n");
        }
        if !self.code.trim().is_empty() {
            out.push_str("Student code:\n");
            out.push_str(self.code.trim_end());
            out.push_str("\n\n");
        }
        if !self.error.trim().is_empty() {
            out.push_str("Latest error:\n");
            out.push_str(self.error.trim());
            out.push_str("\n\n");
        }
        out.truncate(out.trim_end().len());
        out
    }
}

/// Observable conversation state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConversationState {
    pub status: SessionStatus,
    /// Live transcript (finalized text plus the current interim).
    pub transcript: String,
    /// Append-only history.
    pub history: Vec<Message>,
    /// Last transport error, if any.
    pub error: Option<String>,
}
