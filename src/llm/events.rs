//! Normalized streaming events for reply generation.
//!
//! Every reply provider decodes its wire format into [`ReplyEvent`], so the
//! dialogue layer never sees SSE frames or provider JSON.
//!
//! ```text
//! TextDelta* → StreamEnd
//! TextDelta* → StreamError
//! ```

/// A discrete event from a streamed reply.
#[derive(Debug, Clone, PartialEq)]
pub enum ReplyEvent {
    /// A fragment of reply text.
    TextDelta {
        /// The text fragment.
        text: String,
    },
    /// The stream ended normally.
    StreamEnd {
        /// Why the model stopped generating.
        finish_reason: FinishReason,
    },
    /// The stream failed part way.
    StreamError {
        /// Description of what went wrong.
        error: String,
    },
}

impl ReplyEvent {
    /// Convenience constructor for a text delta.
    pub fn delta(text: impl Into<String>) -> Self {
        Self::TextDelta { text: text.into() }
    }
}

/// The reason the model stopped generating output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    /// Natural stop (end of response).
    Stop,
    /// Hit the max token limit.
    Length,
    /// Content was filtered by safety systems.
    ContentFilter,
    /// Provider-specific or unknown reason.
    Other,
}

impl FinishReason {
    /// Map a provider's `finish_reason` string.
    pub fn from_wire(raw: &str) -> Self {
        match raw {
            "stop" => Self::Stop,
            "length" => Self::Length,
            "content_filter" => Self::ContentFilter,
            _ => Self::Other,
        }
    }
}

impl std::fmt::Display for FinishReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stop => write!(f, "stop"),
            Self::Length => write!(f, "length"),
            Self::ContentFilter => write!(f, "content_filter"),
            Self::Other => write!(f, "other"),
        }
    }
}
