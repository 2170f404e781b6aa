//! Tutoring session: turn-taking, silence detection and barge-in.
//!
//! A [`TutorSession`] is a cheap clonable handle. Inputs (transcript
//! segments, transport errors, explicit stop) are applied synchronously to
//! the [`SessionController`](controller::SessionController); one background
//! task sleeps until the silence deadline and finalizes utterances.

pub mod controller;
pub mod state;
pub mod transcript;

use crate::config::TutorConfig;
use crate::error::Result;
use crate::knowledge::tracker::{InitOutcome, KnowledgeTracker};
use crate::llm::{CompletionBackend, ReplyGenerator};
use crate::pipeline::orchestrator::{DialogueOrchestrator, TurnControl};
use crate::pipeline::playback::AudioSink;
use crate::runtime::RuntimeEvent;
use crate::store::ConceptStore;
use crate::stt::{AudioFrame, SpeechToText, SttEvent, SttMessage};
use crate::tts::SpeechSynthesizer;
use controller::{ActiveTurn, SegmentOutcome, SessionController};
use state::{ConversationState, SessionStatus, TaskContext};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{Notify, broadcast, mpsc};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Default event broadcast channel capacity.
const EVENT_CAPACITY: usize = 256;

/// External collaborators a session talks to.
pub struct Providers {
    pub reply: Arc<dyn ReplyGenerator>,
    pub completion: Arc<dyn CompletionBackend>,
    pub synthesizer: Arc<dyn SpeechSynthesizer>,
    pub sink: Arc<dyn AudioSink>,
    pub store: Arc<dyn ConceptStore>,
}

struct SessionInner {
    id: String,
    controller: Mutex<SessionController>,
    events: broadcast::Sender<RuntimeEvent>,
    orchestrator: Arc<DialogueOrchestrator>,
    cancel_guard: Mutex<()>,
    wake: Notify,
    shutdown: CancellationToken,
}

/// Handle to one conversation.
#[derive(Clone)]
pub struct TutorSession {
    inner: Arc<SessionInner>,
}

impl std::fmt::Debug for TutorSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TutorSession")
            .field("id", &self.inner.id)
            .finish()
    }
}

impl TutorSession {
    pub fn new(id: impl Into<String>, config: &TutorConfig, providers: Providers) -> Self {
        let id = id.into();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let tracker = Arc::new(KnowledgeTracker::new(
            id.clone(),
            config.knowledge.clone(),
            providers.completion,
            providers.store,
            events.clone(),
        ));
        let orchestrator = Arc::new(DialogueOrchestrator::new(
            config,
            providers.reply,
            providers.synthesizer,
            providers.sink,
            tracker,
        ));
        Self {
            inner: Arc::new(SessionInner {
                id,
                controller: Mutex::new(SessionController::new(&config.session, events.clone())),
                events,
                orchestrator,
                cancel_guard: Mutex::new(()),
                wake: Notify::new(),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Subscribe to runtime events.
    pub fn subscribe(&self) -> broadcast::Receiver<RuntimeEvent> {
        self.inner.events.subscribe()
    }

    /// Load or calibrate the concept map, then start the silence timer.
    pub async fn start(&self) -> InitOutcome {
        let outcome = self.inner.orchestrator.tracker().initialize().await;
        if let InitOutcome::Restored { history } = &outcome {
            self.inner.controller().restore_history(history.clone());
        }
        tokio::spawn(run_silence_timer(Arc::clone(&self.inner)));
        info!(session = %self.inner.id, "session started");
        outcome
    }

    /// Apply one transcript segment.
    pub fn ingest(&self, event: SttEvent) {
        let outcome = self.inner.controller().on_segment(&event, Instant::now());
        match outcome {
            SegmentOutcome::Ignored => return,
            SegmentOutcome::BargeIn(turn) => self.inner.cancel_turn(turn),
            SegmentOutcome::Updated => {}
        }
        self.inner.wake.notify_one();
    }

    /// Open the speech stream and forward its segments into the session.
    ///
    /// Returns the sender the capture side pushes audio frames into.
    ///
    /// # Errors
    ///
    /// Returns the provider's error when the stream cannot be opened; the
    /// failure is also reported as a transport error.
    pub async fn start_recording(
        &self,
        provider: Arc<dyn SpeechToText>,
    ) -> Result<mpsc::Sender<AudioFrame>> {
        let stream = match provider.open().await {
            Ok(stream) => stream,
            Err(e) => {
                self.report_transport_error(&e.to_string());
                return Err(e);
            }
        };

        let session = self.clone();
        let mut events = stream.events;
        tokio::spawn(async move {
            let shutdown = session.inner.shutdown.clone();
            loop {
                let message = tokio::select! {
                    () = shutdown.cancelled() => break,
                    message = events.recv() => message,
                };
                match message {
                    Some(SttMessage::Transcript(event)) => session.ingest(event),
                    Some(SttMessage::Disconnected { reason }) => {
                        session.report_transport_error(&reason);
                        break;
                    }
                    None => {
                        session.report_transport_error("speech stream closed");
                        break;
                    }
                }
            }
            debug!("speech forwarder stopped");
        });
        Ok(stream.audio)
    }

    /// Capture denial, disconnect or stream error.
    pub fn report_transport_error(&self, message: &str) {
        let aborted = self.inner.controller().fail_transport(message);
        if let Some(turn) = aborted {
            self.inner.cancel_turn(turn);
        }
        self.inner.wake.notify_one();
    }

    /// Explicit stop: cancel any turn and clear the buffer.
    pub fn stop(&self) {
        let aborted = self.inner.controller().stop();
        if let Some(turn) = aborted {
            self.inner.cancel_turn(turn);
        }
        self.inner.wake.notify_one();
    }

    pub fn set_task_context(&self, context: TaskContext) {
        self.inner.controller().set_task_context(context);
    }

    /// Stop background tasks. The handle stays usable for inspection.
    pub fn shutdown(&self) {
        self.stop();
        self.inner.shutdown.cancel();
    }

    pub fn state(&self) -> ConversationState {
        self.inner.controller().state().clone()
    }

    pub fn status(&self) -> SessionStatus {
        self.inner.controller().status()
    }

    /// Reply chunks reserved but not yet played.
    pub fn playback_len(&self) -> usize {
        self.inner.orchestrator.playback().len()
    }

    pub fn tracker(&self) -> &Arc<KnowledgeTracker> {
        self.inner.orchestrator.tracker()
    }
}

impl SessionInner {
    fn controller(&self) -> MutexGuard<'_, SessionController> {
        self.controller
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Cancel a turn's tasks, drop queued audio and silence the sink.
    ///
    /// A cancellation already in progress makes this a no-op.
    fn cancel_turn(&self, turn: ActiveTurn) {
        let Ok(_guard) = self.cancel_guard.try_lock() else {
            debug!(turn = turn.id, "cancellation already in progress");
            return;
        };
        turn.cancel.cancel();
        self.orchestrator.playback().clear();
        self.orchestrator.sink().stop();
        debug!(turn = turn.id, "turn cancelled");
    }

    fn on_silence(self: &Arc<Self>) {
        let start = self.controller().on_silence_elapsed(Instant::now());
        if let Some(start) = start {
            let control: Arc<dyn TurnControl> = Arc::clone(self) as Arc<dyn TurnControl>;
            self.orchestrator.start_turn(control, start);
        }
    }
}

impl TurnControl for SessionInner {
    fn begin_speaking(&self, turn: u64) {
        self.controller().begin_speaking(turn);
    }

    fn record_reply(&self, turn: u64, text: &str) {
        self.controller().record_reply(turn, text);
    }

    fn end_turn(&self, turn: u64) {
        if self.controller().end_turn(turn, Instant::now()) {
            self.wake.notify_one();
        }
    }

    fn abort_turn(&self, turn: u64, reason: &str) {
        let aborted = self.controller().abort_turn(turn, reason, Instant::now());
        if let Some(active) = aborted {
            self.cancel_turn(active);
        }
        self.wake.notify_one();
    }

    fn emit(&self, event: RuntimeEvent) {
        let _ = self.events.send(event);
    }
}

/// Sleep until the silence deadline, re-reading it whenever it moves.
async fn run_silence_timer(inner: Arc<SessionInner>) {
    loop {
        let deadline = inner.controller().silence_deadline();
        let sleep = async {
            match deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::select! {
            () = inner.shutdown.cancelled() => break,
            () = inner.wake.notified() => {}
            () = sleep => inner.on_silence(),
        }
    }
    debug!(session = %inner.id, "silence timer stopped");
}
