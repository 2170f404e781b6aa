//! Scripted providers and recorders shared by unit tests.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use crate::error::{Result, TutorError};
use crate::llm::{CompletionBackend, FinishReason, ReplyEvent, ReplyGenerator, ReplyRequest, ReplyStream};
use crate::pipeline::orchestrator::TurnControl;
use crate::pipeline::playback::AudioSink;
use crate::runtime::RuntimeEvent;
use crate::tts::{SpeechSynthesizer, SynthesizedAudio};
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::broadcast;

type Responder = Box<dyn Fn(&ReplyRequest) -> Result<String> + Send + Sync>;

/// Completion backend answering from a closure and recording every request.
pub struct ScriptedCompletion {
    responder: Responder,
    delay: Option<Duration>,
    requests: Mutex<Vec<ReplyRequest>>,
}

impl ScriptedCompletion {
    pub fn from_fn(f: impl Fn(&ReplyRequest) -> Result<String> + Send + Sync + 'static) -> Self {
        Self {
            responder: Box::new(f),
            delay: None,
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn always(response: &str) -> Self {
        let response = response.to_owned();
        Self::from_fn(move |_| Ok(response.clone()))
    }

    pub fn failing(message: &str) -> Self {
        let message = message.to_owned();
        Self::from_fn(move |_| Err(TutorError::Assessment(message.clone())))
    }

    /// Answers in order; fails once the script runs out.
    pub fn sequence(responses: Vec<Result<String>>) -> Self {
        let queue = Mutex::new(VecDeque::from(responses));
        Self::from_fn(move |_| {
            queue
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(TutorError::Assessment("script exhausted".to_owned())))
        })
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn requests(&self) -> Vec<ReplyRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl CompletionBackend for ScriptedCompletion {
    async fn complete(&self, request: &ReplyRequest) -> Result<String> {
        self.requests.lock().unwrap().push(request.clone());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        (self.responder)(request)
    }
}

/// `{"subconcepts": {...}}` with the same levels for every name.
pub fn assessment_json(names: &[&str], understanding: f64, confidence: f64) -> String {
    let subconcepts: serde_json::Map<String, serde_json::Value> = names
        .iter()
        .map(|name| {
            (
                (*name).to_owned(),
                serde_json::json!({
                    "understanding_level": understanding,
                    "confidence_in_assessment": confidence,
                    "reasoning": "scripted",
                }),
            )
        })
        .collect();
    serde_json::json!({ "subconcepts": subconcepts }).to_string()
}

/// Everything currently buffered on a runtime event receiver.
pub fn drain_events(rx: &mut broadcast::Receiver<RuntimeEvent>) -> Vec<RuntimeEvent> {
    let mut events = Vec::new();
    loop {
        match rx.try_recv() {
            Ok(event) => events.push(event),
            Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
            Err(_) => break,
        }
    }
    events
}

/// Reply generator replaying a fixed event script.
pub struct ScriptedReply {
    events: Vec<ReplyEvent>,
    open_error: Option<String>,
    delay: Duration,
}

impl ScriptedReply {
    /// Deltas followed by a normal end.
    pub fn deltas(deltas: &[&str]) -> Self {
        let mut events: Vec<ReplyEvent> = deltas.iter().map(|d| ReplyEvent::delta(*d)).collect();
        events.push(ReplyEvent::StreamEnd {
            finish_reason: FinishReason::Stop,
        });
        Self {
            events,
            open_error: None,
            delay: Duration::ZERO,
        }
    }

    pub fn failing_after(deltas: &[&str], error: &str) -> Self {
        let mut events: Vec<ReplyEvent> = deltas.iter().map(|d| ReplyEvent::delta(*d)).collect();
        events.push(ReplyEvent::StreamError {
            error: error.to_owned(),
        });
        Self {
            events,
            open_error: None,
            delay: Duration::ZERO,
        }
    }

    pub fn unavailable(error: &str) -> Self {
        Self {
            events: Vec::new(),
            open_error: Some(error.to_owned()),
            delay: Duration::ZERO,
        }
    }

    /// Pause before every event.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

#[async_trait]
impl ReplyGenerator for ScriptedReply {
    async fn stream_reply(&self, _request: &ReplyRequest) -> Result<ReplyStream> {
        if let Some(error) = &self.open_error {
            return Err(TutorError::Generation(error.clone()));
        }
        let delay = self.delay;
        let stream = futures_util::stream::iter(self.events.clone()).then(move |event| async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            event
        });
        Ok(Box::pin(stream))
    }
}

type DelayFn = Box<dyn Fn(&str) -> Duration + Send + Sync>;

/// Synthesizer echoing the text bytes, with per-text delays and failures.
pub struct ScriptedSynth {
    delay: Option<DelayFn>,
    fail_on: Vec<String>,
}

impl ScriptedSynth {
    pub fn new() -> Self {
        Self {
            delay: None,
            fail_on: Vec::new(),
        }
    }

    pub fn with_delay_fn(mut self, f: impl Fn(&str) -> Duration + Send + Sync + 'static) -> Self {
        self.delay = Some(Box::new(f));
        self
    }

    pub fn failing_on(mut self, text: &str) -> Self {
        self.fail_on.push(text.to_owned());
        self
    }
}

#[async_trait]
impl SpeechSynthesizer for ScriptedSynth {
    async fn synthesize(&self, text: &str, _voice_id: &str) -> Result<Bytes> {
        if let Some(delay) = &self.delay {
            tokio::time::sleep(delay(text)).await;
        }
        if self.fail_on.iter().any(|t| t == text) {
            return Err(TutorError::Synthesis(format!("cannot voice {text:?}")));
        }
        Ok(Bytes::from(text.as_bytes().to_vec()))
    }
}

/// Sink recording what started playing.
pub struct RecordingSink {
    played: Mutex<Vec<SynthesizedAudio>>,
    stops: AtomicUsize,
    play_time: Duration,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::with_play_time(Duration::ZERO)
    }

    pub fn with_play_time(play_time: Duration) -> Self {
        Self {
            played: Mutex::new(Vec::new()),
            stops: AtomicUsize::new(0),
            play_time,
        }
    }

    pub fn played_texts(&self) -> Vec<String> {
        self.played
            .lock()
            .unwrap()
            .iter()
            .map(|a| a.text.clone())
            .collect()
    }

    pub fn stop_count(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AudioSink for RecordingSink {
    async fn play(&self, audio: &SynthesizedAudio) -> Result<()> {
        self.played.lock().unwrap().push(audio.clone());
        if !self.play_time.is_zero() {
            tokio::time::sleep(self.play_time).await;
        }
        Ok(())
    }

    fn stop(&self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ControlCall {
    BeginSpeaking(u64),
    RecordReply(u64, String),
    EndTurn(u64),
    AbortTurn(u64, String),
}

/// [`TurnControl`] that only records what the pipeline reported.
pub struct RecordingControl {
    calls: Mutex<Vec<ControlCall>>,
    events: Mutex<Vec<RuntimeEvent>>,
}

impl RecordingControl {
    pub fn new() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            events: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> Vec<ControlCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn events(&self) -> Vec<RuntimeEvent> {
        self.events.lock().unwrap().clone()
    }
}

impl TurnControl for RecordingControl {
    fn begin_speaking(&self, turn: u64) {
        self.calls.lock().unwrap().push(ControlCall::BeginSpeaking(turn));
    }

    fn record_reply(&self, turn: u64, text: &str) {
        self.calls
            .lock()
            .unwrap()
            .push(ControlCall::RecordReply(turn, text.to_owned()));
    }

    fn end_turn(&self, turn: u64) {
        self.calls.lock().unwrap().push(ControlCall::EndTurn(turn));
    }

    fn abort_turn(&self, turn: u64, reason: &str) {
        self.calls
            .lock()
            .unwrap()
            .push(ControlCall::AbortTurn(turn, reason.to_owned()));
    }

    fn emit(&self, event: RuntimeEvent) {
        self.events.lock().unwrap().push(event);
    }
}
