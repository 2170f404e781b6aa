//! Turn-taking state machine.
//!
//! Every method is one atomic step taken under the session's mutex. Work
//! that must happen outside the lock (cancelling audio, spawning the turn)
//! is handed back to the caller as a value.

use super::state::{ConversationState, Message, SessionStatus, TaskContext};
use super::transcript::TranscriptAggregator;
use crate::config::SessionConfig;
use crate::runtime::RuntimeEvent;
use crate::stt::SttEvent;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// The turn currently owning the reply pipeline.
#[derive(Debug, Clone)]
pub struct ActiveTurn {
    pub id: u64,
    pub cancel: CancellationToken,
}

/// Everything the pipeline needs to run a new turn.
#[derive(Debug, Clone)]
pub struct TurnStart {
    pub turn: ActiveTurn,
    /// The finalized utterance.
    pub text: String,
    /// History including the new user message.
    pub history: Vec<Message>,
    pub task_context: TaskContext,
}

#[derive(Debug, Clone)]
pub enum SegmentOutcome {
    /// Blank segment.
    Ignored,
    /// Buffer and silence deadline updated.
    Updated,
    /// Speech while speaking: the interrupted turn must be cancelled.
    BargeIn(ActiveTurn),
}

pub struct SessionController {
    silence_threshold: Duration,
    barge_in_enabled: bool,
    state: ConversationState,
    aggregator: TranscriptAggregator,
    silence_deadline: Option<Instant>,
    last_turn_id: u64,
    active: Option<ActiveTurn>,
    task_context: TaskContext,
    events: broadcast::Sender<RuntimeEvent>,
}

impl SessionController {
    pub fn new(config: &SessionConfig, events: broadcast::Sender<RuntimeEvent>) -> Self {
        Self {
            silence_threshold: Duration::from_millis(config.silence_threshold_ms),
            barge_in_enabled: config.barge_in_enabled,
            state: ConversationState::default(),
            aggregator: TranscriptAggregator::new(),
            silence_deadline: None,
            last_turn_id: 0,
            active: None,
            task_context: TaskContext::default(),
            events,
        }
    }

    pub fn state(&self) -> &ConversationState {
        &self.state
    }

    pub fn status(&self) -> SessionStatus {
        self.state.status
    }

    pub fn silence_deadline(&self) -> Option<Instant> {
        self.silence_deadline
    }

    pub fn task_context(&self) -> &TaskContext {
        &self.task_context
    }

    pub fn set_task_context(&mut self, context: TaskContext) {
        self.task_context = context;
    }

    /// Seed history from a restored session. Only before the first turn.
    pub fn restore_history(&mut self, history: Vec<Message>) {
        if self.last_turn_id == 0 && self.state.history.is_empty() {
            self.state.history = history;
        }
    }

    /// Whether `turn` is the turn currently holding the pipeline.
    pub fn is_current(&self, turn: u64) -> bool {
        self.active.as_ref().is_some_and(|t| t.id == turn)
    }

    pub fn on_segment(&mut self, event: &SttEvent, now: Instant) -> SegmentOutcome {
        if event.transcript.trim().is_empty() {
            return SegmentOutcome::Ignored;
        }

        let mut interrupted = None;
        if self.state.status == SessionStatus::Speaking && self.barge_in_enabled {
            interrupted = self.active.take();
            self.silence_deadline = None;
            self.set_status(SessionStatus::Idle);
            info!(turn = ?interrupted.as_ref().map(|t| t.id), "barge-in");
        }

        if self.aggregator.apply(event) {
            self.state.transcript = self.aggregator.live_text();
            debug!(transcript = %self.state.transcript, "transcript updated");
            self.emit(RuntimeEvent::TranscriptUpdated {
                text: self.state.transcript.clone(),
            });
        }
        self.silence_deadline = Some(now + self.silence_threshold);

        match interrupted {
            Some(turn) => SegmentOutcome::BargeIn(turn),
            None => SegmentOutcome::Updated,
        }
    }

    /// Finalize the buffered utterance once the silence deadline has passed.
    pub fn on_silence_elapsed(&mut self, now: Instant) -> Option<TurnStart> {
        let deadline = self.silence_deadline?;
        if now < deadline {
            return None;
        }
        self.silence_deadline = None;
        if self.state.status != SessionStatus::Idle {
            return None;
        }
        let text = self.aggregator.take()?;

        self.state.transcript.clear();
        let message = Message::user(text.clone());
        let timestamp = message.timestamp;
        self.state.history.push(message);
        self.set_status(SessionStatus::Processing);

        self.last_turn_id += 1;
        let turn = ActiveTurn {
            id: self.last_turn_id,
            cancel: CancellationToken::new(),
        };
        self.active = Some(turn.clone());
        info!(turn = turn.id, chars = text.len(), "utterance finalized");
        self.emit(RuntimeEvent::TranscriptFinalized {
            text: text.clone(),
            timestamp,
        });

        Some(TurnStart {
            turn,
            text,
            history: self.state.history.clone(),
            task_context: self.task_context.clone(),
        })
    }

    /// First chunk is about to play.
    pub fn begin_speaking(&mut self, turn: u64) -> bool {
        if !self.is_current(turn) || self.state.status != SessionStatus::Processing {
            return false;
        }
        self.set_status(SessionStatus::Speaking);
        true
    }

    /// Append the assistant reply. Skipped for empty text or once a newer
    /// turn has started.
    pub fn record_reply(&mut self, turn: u64, text: &str) -> bool {
        let text = text.trim();
        if text.is_empty() || turn != self.last_turn_id {
            return false;
        }
        self.state.history.push(Message::assistant(text));
        true
    }

    /// Playback drained. Returns `true` if the silence timer was re-armed
    /// for words spoken during the turn.
    pub fn end_turn(&mut self, turn: u64, now: Instant) -> bool {
        if !self.is_current(turn) {
            return false;
        }
        self.active = None;
        self.set_status(SessionStatus::Idle);
        self.rearm_if_buffered(now)
    }

    /// Generation or synthesis failed. Returns the turn for cancellation.
    pub fn abort_turn(&mut self, turn: u64, reason: &str, now: Instant) -> Option<ActiveTurn> {
        if !self.is_current(turn) {
            return None;
        }
        let aborted = self.active.take();
        self.set_status(SessionStatus::Idle);
        info!(turn, %reason, "turn aborted");
        self.emit(RuntimeEvent::TurnAborted {
            reason: reason.to_owned(),
        });
        self.rearm_if_buffered(now);
        aborted
    }

    /// Explicit stop from any state.
    pub fn stop(&mut self) -> Option<ActiveTurn> {
        let aborted = self.active.take();
        self.aggregator.clear();
        self.silence_deadline = None;
        if !self.state.transcript.is_empty() {
            self.state.transcript.clear();
            self.emit(RuntimeEvent::TranscriptUpdated {
                text: String::new(),
            });
        }
        self.set_status(SessionStatus::Idle);
        aborted
    }

    /// Speech transport failed.
    pub fn fail_transport(&mut self, message: &str) -> Option<ActiveTurn> {
        error!(%message, "speech transport failed");
        self.state.error = Some(message.to_owned());
        self.emit(RuntimeEvent::Error {
            message: message.to_owned(),
        });
        let aborted = self.active.take();
        self.silence_deadline = None;
        self.set_status(SessionStatus::Idle);
        aborted
    }

    fn rearm_if_buffered(&mut self, now: Instant) -> bool {
        if self.aggregator.is_empty() {
            return false;
        }
        self.silence_deadline = Some(now + self.silence_threshold);
        true
    }

    fn set_status(&mut self, status: SessionStatus) {
        if self.state.status == status {
            return;
        }
        debug!(from = %self.state.status, to = %status, "status change");
        self.state.status = status;
        self.emit(RuntimeEvent::StateChanged { status });
    }

    fn emit(&self, event: RuntimeEvent) {
        let _ = self.events.send(event);
    }
}
