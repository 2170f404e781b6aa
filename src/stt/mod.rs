//! Speech-to-text provider interface.
//!
//! A provider opens a duplex stream: the capture side pushes raw
//! [`AudioFrame`]s, the provider answers with interim and final transcript
//! segments. Codec handling is the provider's concern.

use crate::error::Result;
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// A transcript segment from the provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SttEvent {
    pub transcript: String,
    /// `false` for interim hypotheses that may still change.
    pub is_final: bool,
    #[serde(default)]
    pub confidence: Option<f32>,
}

impl SttEvent {
    pub fn interim(transcript: impl Into<String>) -> Self {
        Self {
            transcript: transcript.into(),
            is_final: false,
            confidence: None,
        }
    }

    pub fn final_text(transcript: impl Into<String>) -> Self {
        Self {
            transcript: transcript.into(),
            is_final: true,
            confidence: None,
        }
    }
}

/// One chunk of captured audio, encoded as the provider expects.
#[derive(Debug, Clone)]
pub struct AudioFrame {
    pub data: Bytes,
    pub sample_rate: u32,
}

/// Messages delivered by an open provider stream.
#[derive(Debug, Clone, PartialEq)]
pub enum SttMessage {
    Transcript(SttEvent),
    /// The provider connection went away. The stream yields nothing further.
    Disconnected { reason: String },
}

/// An open duplex stream.
#[derive(Debug)]
pub struct SttStream {
    /// Send captured audio here.
    pub audio: mpsc::Sender<AudioFrame>,
    /// Transcript segments and disconnect notices.
    pub events: mpsc::Receiver<SttMessage>,
}

/// A streaming speech-to-text provider.
#[async_trait]
pub trait SpeechToText: Send + Sync {
    /// Open a duplex stream.
    ///
    /// # Errors
    ///
    /// Returns [`TutorError::Transport`](crate::error::TutorError::Transport)
    /// when the capture device or provider connection cannot be opened.
    async fn open(&self) -> Result<SttStream>;
}
