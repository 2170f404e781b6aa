//! Runtime events emitted by a tutoring session for hosts and observability.
//!
//! Events go out on a `tokio::sync::broadcast` channel. Slow subscribers may
//! lag and miss events; the session never blocks on them.

use crate::knowledge::pivot::PivotQuestions;
use crate::knowledge::types::{ConceptMap, PivotEntry};
use crate::session::state::SessionStatus;
use chrono::{DateTime, Utc};
use serde::Serialize;

/// Events that describe what the session is doing "right now".
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RuntimeEvent {
    /// Live transcript changed (finalized text plus current interim).
    TranscriptUpdated { text: String },
    /// An utterance was finalized and a turn started.
    TranscriptFinalized {
        text: String,
        timestamp: DateTime<Utc>,
    },
    /// Session status transition.
    StateChanged { status: SessionStatus },
    /// The concept map changed after calibration or an utterance.
    ConceptMapUpdated { map: ConceptMap },
    /// Pivot queue recomputed (ascending by confidence).
    PivotQueueUpdated { queue: Vec<PivotEntry> },
    /// Short verbal questions for the weakest concept.
    PivotQuestionsUpdated { questions: PivotQuestions },
    /// Every category reached the confidence threshold. Emitted once.
    ConfidenceReached,
    /// A reply chunk was queued for synthesis, by sequence index.
    AssistantSentence { index: usize, text: String },
    /// The current turn ended early without speaking (generation or synthesis failure).
    TurnAborted { reason: String },
    /// User-visible error (transport failures).
    Error { message: String },
}
