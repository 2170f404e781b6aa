//! Versioned host command/event envelopes for the stdio bridge.

use crate::runtime::RuntimeEvent;
use crate::session::state::TaskContext;
use crate::stt::SttEvent;
use crate::tts::SynthesizedAudio;
use base64::Engine as _;
use serde::{Deserialize, Serialize};

/// Contract version for host command/event envelopes.
pub const EVENT_VERSION: u32 = 1;

/// Event name used for synthesized audio chunks.
pub const AUDIO_EVENT: &str = "audio";

/// Event name telling the host to stop playing immediately.
pub const AUDIO_STOP_EVENT: &str = "audio_stop";

/// Event name for commands the bridge could not parse or accept.
pub const COMMAND_ERROR_EVENT: &str = "command_error";

/// Commands a host sends to the bridge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HostCommand {
    /// One speech-to-text segment.
    Transcript {
        text: String,
        #[serde(default)]
        is_final: bool,
        #[serde(default)]
        confidence: Option<f32>,
    },
    /// Capture denial or speech stream failure.
    TransportError { message: String },
    /// Replace the coding task context.
    TaskContext {
        #[serde(default)]
        task: String,
        #[serde(default)]
        code: String,
        #[serde(default)]
        error: String,
    },
    /// The host finished playing the audio chunk `index` of `turn`.
    PlaybackFinished { turn: u64, index: usize },
    /// Explicit user stop.
    Stop,
    /// Close the bridge.
    Shutdown,
}

impl HostCommand {
    /// Wire name of the command.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Transcript { .. } => "transcript",
            Self::TransportError { .. } => "transport_error",
            Self::TaskContext { .. } => "task_context",
            Self::PlaybackFinished { .. } => "playback_finished",
            Self::Stop => "stop",
            Self::Shutdown => "shutdown",
        }
    }

    /// Speech segment carried by a `transcript` command.
    #[must_use]
    pub fn stt_event(&self) -> Option<SttEvent> {
        match self {
            Self::Transcript {
                text,
                is_final,
                confidence,
            } => Some(SttEvent {
                transcript: text.clone(),
                is_final: *is_final,
                confidence: *confidence,
            }),
            _ => None,
        }
    }

    /// Task context carried by a `task_context` command.
    #[must_use]
    pub fn task_context(&self) -> Option<TaskContext> {
        match self {
            Self::TaskContext { task, code, error } => Some(TaskContext {
                task: task.clone(),
                code: code.clone(),
                error: error.clone(),
            }),
            _ => None,
        }
    }
}

/// A versioned command envelope from host -> bridge.
///
/// On the wire the command fields sit next to `v`:
/// `{"v":1,"type":"transcript","text":"hi","is_final":true}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandEnvelope {
    pub v: u32,
    #[serde(flatten)]
    pub command: HostCommand,
}

impl CommandEnvelope {
    /// Build a v1 command envelope.
    #[must_use]
    pub fn new(command: HostCommand) -> Self {
        Self {
            v: EVENT_VERSION,
            command,
        }
    }

    /// Parse and validate one JSON line.
    ///
    /// # Errors
    ///
    /// Returns a [`ContractError`] for malformed JSON or an unsupported version.
    pub fn parse(line: &str) -> Result<Self, ContractError> {
        let envelope: Self = serde_json::from_str(line).map_err(|e| {
            ContractError::new(
                ContractErrorKind::InvalidEnvelope,
                format!("failed to parse command envelope: {e}"),
            )
        })?;
        envelope.validate()?;
        Ok(envelope)
    }

    /// Validate envelope version.
    pub fn validate(&self) -> Result<(), ContractError> {
        if self.v != EVENT_VERSION {
            return Err(ContractError::new(
                ContractErrorKind::UnsupportedVersion,
                format!(
                    "unsupported contract version {}; expected {}",
                    self.v, EVENT_VERSION
                ),
            ));
        }
        Ok(())
    }
}

/// A versioned event envelope from bridge -> host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub v: u32,
    pub event_id: String,
    pub event: String,
    pub payload: serde_json::Value,
}

impl EventEnvelope {
    /// Build a v1 event envelope with a fresh id.
    #[must_use]
    pub fn new(event: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            v: EVENT_VERSION,
            event_id: uuid::Uuid::new_v4().to_string(),
            event: event.into(),
            payload,
        }
    }

    /// Wrap a runtime event: its tag becomes `event`, the rest `payload`.
    #[must_use]
    pub fn from_runtime(event: &RuntimeEvent) -> Self {
        let mut value = match serde_json::to_value(event) {
            Ok(value) => value,
            Err(e) => {
                return Self::new(
                    COMMAND_ERROR_EVENT,
                    serde_json::json!({ "message": format!("unserializable event: {e}") }),
                );
            }
        };
        let name = value
            .as_object_mut()
            .and_then(|fields| fields.remove("event"))
            .and_then(|tag| tag.as_str().map(str::to_owned))
            .unwrap_or_else(|| "unknown".to_owned());
        Self::new(name, value)
    }

    /// One synthesized chunk, base64 encoded.
    #[must_use]
    pub fn audio(audio: &SynthesizedAudio) -> Self {
        Self::new(
            AUDIO_EVENT,
            serde_json::json!({
                "turn": audio.turn,
                "index": audio.index,
                "text": audio.text,
                "data": base64::engine::general_purpose::STANDARD.encode(&audio.data),
            }),
        )
    }

    #[must_use]
    pub fn audio_stop() -> Self {
        Self::new(AUDIO_STOP_EVENT, serde_json::json!({}))
    }

    #[must_use]
    pub fn command_error(message: impl Into<String>) -> Self {
        Self::new(
            COMMAND_ERROR_EVENT,
            serde_json::json!({ "message": message.into() }),
        )
    }
}

/// Contract validation error categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContractErrorKind {
    UnsupportedVersion,
    InvalidEnvelope,
}

/// Contract validation error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContractError {
    pub kind: ContractErrorKind,
    pub message: String,
}

impl ContractError {
    #[must_use]
    pub fn new(kind: ContractErrorKind, message: String) -> Self {
        Self { kind, message }
    }
}

impl std::fmt::Display for ContractError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

impl std::error::Error for ContractError {}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;
    use crate::session::state::SessionStatus;
    use bytes::Bytes;

    #[test]
    fn parses_transcript_command() {
        let envelope =
            CommandEnvelope::parse(r#"{"v":1,"type":"transcript","text":"what is a loop","is_final":true}"#)
                .unwrap();
        assert_eq!(envelope.command.as_str(), "transcript");
        let event = envelope.command.stt_event().unwrap();
        assert_eq!(event.transcript, "what is a loop");
        assert!(event.is_final);
        assert_eq!(event.confidence, None);
    }

    #[test]
    fn transcript_defaults_to_interim() {
        let envelope = CommandEnvelope::parse(r#"{"v":1,"type":"transcript","text":"wha"}"#).unwrap();
        assert!(!envelope.command.stt_event().unwrap().is_final);
    }

    #[test]
    fn task_context_fields_are_optional() {
        let envelope =
            CommandEnvelope::parse(r#"{"v":1,"type":"task_context","task":"FizzBuzz"}"#).unwrap();
        let context = envelope.command.task_context().unwrap();
        assert_eq!(context.task, "FizzBuzz");
        assert!(context.code.is_empty());
    }

    #[test]
    fn unit_commands_parse() {
        assert_eq!(
            CommandEnvelope::parse(r#"{"v":1,"type":"stop"}"#).unwrap().command,
            HostCommand::Stop
        );
        assert_eq!(
            CommandEnvelope::parse(r#"{"v":1,"type":"shutdown"}"#)
                .unwrap()
                .command,
            HostCommand::Shutdown
        );
    }

    #[test]
    fn playback_ack_carries_turn_and_index() {
        let envelope =
            CommandEnvelope::parse(r#"{"v":1,"type":"playback_finished","turn":3,"index":0}"#).unwrap();
        assert_eq!(envelope.command, HostCommand::PlaybackFinished { turn: 3, index: 0 });
        assert!(CommandEnvelope::parse(r#"{"v":1,"type":"playback_finished","index":0}"#).is_err());
    }

    #[test]
    fn rejects_wrong_version() {
        let err = CommandEnvelope::parse(r#"{"v":2,"type":"stop"}"#).unwrap_err();
        assert_eq!(err.kind, ContractErrorKind::UnsupportedVersion);
    }

    #[test]
    fn rejects_unknown_command() {
        let err = CommandEnvelope::parse(r#"{"v":1,"type":"dance"}"#).unwrap_err();
        assert_eq!(err.kind, ContractErrorKind::InvalidEnvelope);
    }

    #[test]
    fn runtime_event_tag_becomes_event_name() {
        let envelope = EventEnvelope::from_runtime(&RuntimeEvent::StateChanged {
            status: SessionStatus::Speaking,
        });
        assert_eq!(envelope.v, EVENT_VERSION);
        assert_eq!(envelope.event, "state_changed");
        assert_eq!(envelope.payload, serde_json::json!({ "status": "speaking" }));
        assert!(!envelope.event_id.is_empty());
    }

    #[test]
    fn unit_runtime_event_has_empty_payload() {
        let envelope = EventEnvelope::from_runtime(&RuntimeEvent::ConfidenceReached);
        assert_eq!(envelope.event, "confidence_reached");
        assert_eq!(envelope.payload, serde_json::json!({}));
    }

    #[test]
    fn audio_payload_is_base64() {
        let envelope = EventEnvelope::audio(&SynthesizedAudio {
            turn: 7,
            index: 2,
            text: "Hi.".to_owned(),
            data: Bytes::from_static(b"abc"),
        });
        assert_eq!(envelope.event, AUDIO_EVENT);
        assert_eq!(envelope.payload["turn"], 7);
        assert_eq!(envelope.payload["index"], 2);
        assert_eq!(envelope.payload["data"], "YWJj");
    }
}
