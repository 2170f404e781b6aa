//! Mentor: a voice tutoring agent for programming students.
//!
//! A session listens to speech-to-text segments, decides when the student
//! has finished speaking, and answers with a streamed spoken reply while a
//! knowledge tracker estimates what the student understands:
//! Transcript → Silence detection → {Knowledge tracker, Reply LLM} → TTS → Playback
//!
//! # Architecture
//!
//! - **Session**: turn-taking state machine with silence timer and barge-in
//! - **Knowledge**: per-category assessment fan-out and the pivot queue
//! - **LLM**: OpenAI-compatible streaming client and sentence chunker
//! - **Pipeline**: out-of-order synthesis with strictly ordered playback
//! - **Store**: SQLite persistence of concept maps and history
//! - **Host**: newline-delimited JSON bridge over stdin/stdout

pub mod config;
pub mod error;
pub mod host;
pub mod knowledge;
pub mod llm;
pub mod pipeline;
pub mod runtime;
pub mod session;
pub mod store;
pub mod stt;
pub mod tts;

#[cfg(test)]
mod test_utils;

pub use config::TutorConfig;
pub use error::{Result, TutorError};
pub use runtime::RuntimeEvent;
pub use session::{Providers, TutorSession};
