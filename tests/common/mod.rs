//! Fakes built on the public provider traits.

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use async_trait::async_trait;
use bytes::Bytes;
use mentor::config::TutorConfig;
use mentor::llm::{
    CompletionBackend, FinishReason, ReplyEvent, ReplyGenerator, ReplyRequest, ReplyStream,
};
use mentor::pipeline::AudioSink;
use mentor::runtime::RuntimeEvent;
use mentor::store::ConceptStore;
use mentor::tts::{SpeechSynthesizer, SynthesizedAudio};
use mentor::{Providers, TutorSession};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::broadcast;

/// Three single-concept categories: `basics`, `loops`, `functions`.
pub fn config() -> TutorConfig {
    let mut config = TutorConfig::default();
    config.knowledge.categories = BTreeMap::from([
        ("basics".to_owned(), vec!["variables".to_owned()]),
        (
            "loops".to_owned(),
            vec!["for_loops".to_owned(), "while_loops".to_owned()],
        ),
        ("functions".to_owned(), vec!["parameters".to_owned()]),
    ]);
    config
}

/// Assessment backend answering per category with fixed levels.
pub struct Assessor {
    levels: HashMap<String, (f64, f64)>,
    default: (f64, f64),
    delay: Duration,
    calls: AtomicUsize,
}

impl Assessor {
    pub fn uniform(understanding: f64, confidence: f64) -> Self {
        Self {
            levels: HashMap::new(),
            default: (understanding, confidence),
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
        }
    }

    /// Override one subconcept's levels.
    pub fn with(mut self, subconcept: &str, understanding: f64, confidence: f64) -> Self {
        self.levels
            .insert(subconcept.to_owned(), (understanding, confidence));
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CompletionBackend for Assessor {
    async fn complete(&self, request: &ReplyRequest) -> mentor::Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let body = request
            .messages
            .last()
            .map(|m| m.content.clone())
            .unwrap_or_default();
        // Subconcept lines look like "- name: understanding ..".
        let mut subconcepts = serde_json::Map::new();
        for line in body.lines() {
            let Some(rest) = line.strip_prefix("- ") else {
                continue;
            };
            let Some((name, _)) = rest.split_once(':') else {
                continue;
            };
            let (understanding, confidence) = self.levels.get(name).copied().unwrap_or(self.default);
            subconcepts.insert(
                name.to_owned(),
                serde_json::json!({
                    "understanding_level": understanding,
                    "confidence_in_assessment": confidence,
                    "reasoning": "fake assessment",
                }),
            );
        }
        Ok(serde_json::json!({ "subconcepts": subconcepts }).to_string())
    }
}

/// Reply generator streaming fixed deltas.
pub struct Reply {
    deltas: Vec<String>,
    delay: Duration,
}

impl Reply {
    pub fn new(deltas: &[&str]) -> Self {
        Self {
            deltas: deltas.iter().map(|d| (*d).to_owned()).collect(),
            delay: Duration::ZERO,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

#[async_trait]
impl ReplyGenerator for Reply {
    async fn stream_reply(&self, _request: &ReplyRequest) -> mentor::Result<ReplyStream> {
        let deltas = self.deltas.clone();
        let delay = self.delay;
        Ok(Box::pin(async_stream::stream! {
            for text in deltas {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                yield ReplyEvent::TextDelta { text };
            }
            yield ReplyEvent::StreamEnd { finish_reason: FinishReason::Stop };
        }))
    }
}

/// Synthesizer returning the text as bytes.
pub struct EchoSynth;

#[async_trait]
impl SpeechSynthesizer for EchoSynth {
    async fn synthesize(&self, text: &str, _voice_id: &str) -> mentor::Result<Bytes> {
        Ok(Bytes::from(text.as_bytes().to_vec()))
    }
}

/// Sink taking `play_time` per chunk and recording what it played.
pub struct Speaker {
    play_time: Duration,
    played: Mutex<Vec<String>>,
    stops: AtomicUsize,
}

impl Speaker {
    pub fn new(play_time: Duration) -> Self {
        Self {
            play_time,
            played: Mutex::new(Vec::new()),
            stops: AtomicUsize::new(0),
        }
    }

    pub fn played(&self) -> Vec<String> {
        self.played.lock().unwrap().clone()
    }

    pub fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AudioSink for Speaker {
    async fn play(&self, audio: &SynthesizedAudio) -> mentor::Result<()> {
        self.played.lock().unwrap().push(audio.text.clone());
        tokio::time::sleep(self.play_time).await;
        Ok(())
    }

    fn stop(&self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
    }
}

pub fn session(
    id: &str,
    config: &TutorConfig,
    reply: Reply,
    assessor: Arc<Assessor>,
    speaker: Arc<Speaker>,
    store: Arc<dyn ConceptStore>,
) -> TutorSession {
    TutorSession::new(
        id,
        config,
        Providers {
            reply: Arc::new(reply),
            completion: assessor,
            synthesizer: Arc::new(EchoSynth),
            sink: speaker,
            store,
        },
    )
}

pub fn drain(rx: &mut broadcast::Receiver<RuntimeEvent>) -> Vec<RuntimeEvent> {
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

/// Poll `check` every 10ms until it holds or `limit` elapses.
pub async fn wait_until(limit: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
