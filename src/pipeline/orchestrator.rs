//! Runs one dialogue turn: knowledge update, streamed reply, chunked
//! synthesis and ordered playback.
//!
//! ```text
//! TurnStart ─┬─► KnowledgeTracker::process_utterance   (fire-and-forget)
//!            └─► reply stream ─► SentenceChunker ─► reserve slot i ─► synth task i
//!                                                                        │
//!                                     player: await slot 0, 1, 2 … ◄─────┘
//! ```

use super::playback::{AudioSink, NextChunk, PlaybackQueue, SlotState};
use crate::config::{ChunkingConfig, TutorConfig};
use crate::knowledge::tracker::{KnowledgeTracker, ProcessOutcome};
use crate::llm::{ReplyEvent, ReplyGenerator, ReplyRequest, SentenceChunker};
use crate::runtime::RuntimeEvent;
use crate::session::controller::TurnStart;
use crate::session::state::TaskContext;
use crate::tts::{SpeechSynthesizer, SynthesizedAudio};
use futures_util::StreamExt;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Session-side hooks the pipeline reports back to.
///
/// Every call names its turn; calls for a turn that is no longer current
/// are ignored by the implementor.
pub trait TurnControl: Send + Sync {
    /// The first chunk is about to play.
    fn begin_speaking(&self, turn: u64);
    /// The reply stream ended; `text` is the assembled reply.
    fn record_reply(&self, turn: u64, text: &str);
    /// Every queued chunk has played (or there were none).
    fn end_turn(&self, turn: u64);
    /// Generation, synthesis or playback failed.
    fn abort_turn(&self, turn: u64, reason: &str);
    fn emit(&self, event: RuntimeEvent);
}

/// Handles to the tasks of one turn.
pub struct TurnTasks {
    pub assessment: JoinHandle<ProcessOutcome>,
    pub reply: JoinHandle<()>,
    pub player: JoinHandle<()>,
}

pub struct DialogueOrchestrator {
    reply: Arc<dyn ReplyGenerator>,
    synthesizer: Arc<dyn SpeechSynthesizer>,
    sink: Arc<dyn AudioSink>,
    playback: Arc<PlaybackQueue>,
    tracker: Arc<KnowledgeTracker>,
    chunking: ChunkingConfig,
    system_prompt: String,
    voice_id: String,
}

impl DialogueOrchestrator {
    pub fn new(
        config: &TutorConfig,
        reply: Arc<dyn ReplyGenerator>,
        synthesizer: Arc<dyn SpeechSynthesizer>,
        sink: Arc<dyn AudioSink>,
        tracker: Arc<KnowledgeTracker>,
    ) -> Self {
        Self {
            reply,
            synthesizer,
            sink,
            playback: Arc::new(PlaybackQueue::new()),
            tracker,
            chunking: config.chunking.clone(),
            system_prompt: config.llm.system_prompt.clone(),
            voice_id: config.tts.voice_id.clone(),
        }
    }

    pub fn playback(&self) -> &Arc<PlaybackQueue> {
        &self.playback
    }

    pub fn sink(&self) -> &Arc<dyn AudioSink> {
        &self.sink
    }

    pub fn tracker(&self) -> &Arc<KnowledgeTracker> {
        &self.tracker
    }

    /// Base prompt, task context and the current pivot focus.
    pub fn system_context(&self, task: &TaskContext) -> String {
        let mut context = self.system_prompt.clone();
        if !task.is_empty() {
            context.push_str("\n\n");
            context.push_str(&task.render());
        }
        if let Some(focus) = self.tracker.pivot_queue().first() {
            context.push_str(&format!(
                "\n\nThe student's least certain concept is {} ({}). Steer toward it when it fits naturally.",
                focus.concept.replace('_', " "),
                focus.category.replace('_', " ")
            ));
            if let Some(questions) = self
                .tracker
                .pivot_questions()
                .filter(|q| q.concept == focus.concept)
            {
                context.push_str(" Questions you could ask: ");
                context.push_str(&questions.questions.join(" "));
            }
        }
        context
    }

    /// Spawn the tasks for a freshly finalized turn.
    pub fn start_turn(self: &Arc<Self>, control: Arc<dyn TurnControl>, start: TurnStart) -> TurnTasks {
        let turn = start.turn.id;
        let cancel = start.turn.cancel.clone();
        self.playback.begin_turn(turn);

        let assessment = {
            let tracker = Arc::clone(&self.tracker);
            let text = start.text.clone();
            let history = start.history.clone();
            let task = start.task_context.clone();
            tokio::spawn(async move { tracker.process_utterance(&text, &history, &task).await })
        };

        let request = ReplyRequest::from_history(
            self.system_context(&start.task_context),
            &start.history,
        );
        let reply = tokio::spawn(Arc::clone(self).run_reply(
            Arc::clone(&control),
            turn,
            cancel.clone(),
            request,
        ));
        let player = tokio::spawn(Arc::clone(self).run_player(control, turn, cancel));

        TurnTasks {
            assessment,
            reply,
            player,
        }
    }

    async fn run_reply(
        self: Arc<Self>,
        control: Arc<dyn TurnControl>,
        turn: u64,
        cancel: CancellationToken,
        request: ReplyRequest,
    ) {
        let opened = tokio::select! {
            () = cancel.cancelled() => return,
            opened = self.reply.stream_reply(&request) => opened,
        };
        let mut stream = match opened {
            Ok(stream) => stream,
            Err(e) => {
                warn!(turn, error = %e, "reply stream failed to open");
                control.abort_turn(turn, &e.to_string());
                return;
            }
        };

        let mut chunker = SentenceChunker::new(&self.chunking);
        let mut reply = String::new();
        loop {
            let event = tokio::select! {
                () = cancel.cancelled() => return,
                event = stream.next() => event,
            };
            match event {
                Some(ReplyEvent::TextDelta { text }) => {
                    reply.push_str(&text);
                    for chunk in chunker.push(&text) {
                        self.dispatch_chunk(control.as_ref(), turn, &cancel, chunk);
                    }
                }
                Some(ReplyEvent::StreamEnd { finish_reason }) => {
                    debug!(turn, %finish_reason, "reply stream ended");
                    break;
                }
                Some(ReplyEvent::StreamError { error }) => {
                    warn!(turn, %error, "reply stream failed");
                    control.record_reply(turn, &reply);
                    control.abort_turn(turn, &error);
                    return;
                }
                None => break,
            }
        }

        if let Some(rest) = chunker.finish() {
            self.dispatch_chunk(control.as_ref(), turn, &cancel, rest);
        }
        debug!(turn, chunks = chunker.chunks_emitted(), "reply complete");
        control.record_reply(turn, &reply);
        self.playback.close(turn);
    }

    fn dispatch_chunk(
        &self,
        control: &dyn TurnControl,
        turn: u64,
        cancel: &CancellationToken,
        text: String,
    ) {
        let Some(index) = self.playback.reserve(turn) else {
            return;
        };
        control.emit(RuntimeEvent::AssistantSentence {
            index,
            text: text.clone(),
        });

        let synthesizer = Arc::clone(&self.synthesizer);
        let playback = Arc::clone(&self.playback);
        let voice_id = self.voice_id.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let result = tokio::select! {
                () = cancel.cancelled() => return,
                result = synthesizer.synthesize(&text, &voice_id) => result,
            };
            let slot = match result {
                Ok(data) => SlotState::Ready(SynthesizedAudio {
                    turn,
                    index,
                    text,
                    data,
                }),
                Err(e) => {
                    warn!(turn, index, error = %e, "chunk synthesis failed");
                    SlotState::Failed(e.to_string())
                }
            };
            playback.fill(turn, index, slot);
        });
    }

    async fn run_player(self: Arc<Self>, control: Arc<dyn TurnControl>, turn: u64, cancel: CancellationToken) {
        let mut speaking = false;
        loop {
            let next = tokio::select! {
                () = cancel.cancelled() => return,
                next = self.playback.next(turn) => next,
            };
            match next {
                NextChunk::Ready(audio) => {
                    if !speaking {
                        control.begin_speaking(turn);
                        speaking = true;
                    }
                    let played = tokio::select! {
                        () = cancel.cancelled() => return,
                        played = self.sink.play(&audio) => played,
                    };
                    if let Err(e) = played {
                        warn!(turn, index = audio.index, error = %e, "playback failed");
                        control.abort_turn(turn, &e.to_string());
                        return;
                    }
                }
                NextChunk::Failed(reason) => {
                    control.abort_turn(turn, &reason);
                    return;
                }
                NextChunk::Exhausted => {
                    control.end_turn(turn);
                    return;
                }
                NextChunk::Cancelled => return,
            }
        }
    }
}
