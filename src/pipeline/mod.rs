//! Reply pipeline: streamed generation, chunked synthesis and ordered playback.

pub mod orchestrator;
pub mod playback;

pub use orchestrator::{DialogueOrchestrator, TurnControl};
pub use playback::{AudioSink, PlaybackQueue};
