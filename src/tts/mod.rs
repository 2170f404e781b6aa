//! Text-to-speech provider interface and an HTTP implementation.

use crate::config::TtsConfig;
use crate::error::{Result, TutorError};
use async_trait::async_trait;
use bytes::Bytes;
use std::time::Duration;
use tracing::debug;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Synthesized audio for one reply chunk.
#[derive(Debug, Clone, PartialEq)]
pub struct SynthesizedAudio {
    /// Turn the chunk belongs to.
    pub turn: u64,
    /// Sequence index of the chunk within its turn.
    pub index: usize,
    /// The text that was spoken.
    pub text: String,
    /// Encoded audio payload as returned by the provider.
    pub data: Bytes,
}

/// Turns text into an audio payload.
#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    /// Synthesize `text` with `voice_id`.
    ///
    /// # Errors
    ///
    /// Returns [`TutorError::Synthesis`] when the provider call fails.
    async fn synthesize(&self, text: &str, voice_id: &str) -> Result<Bytes>;
}

/// Posts `{text, voice_id}` to an HTTP endpoint and returns the response body.
pub struct HttpSynthesizer {
    client: reqwest::Client,
    url: String,
    api_key: String,
}

impl std::fmt::Debug for HttpSynthesizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpSynthesizer")
            .field("url", &self.url)
            .finish()
    }
}

impl HttpSynthesizer {
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be constructed.
    pub fn new(config: &TtsConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| TutorError::Config(format!("cannot build HTTP client: {e}")))?;
        Ok(Self {
            client,
            url: config.api_url.clone(),
            api_key: config.api_key.clone(),
        })
    }
}

#[async_trait]
impl SpeechSynthesizer for HttpSynthesizer {
    async fn synthesize(&self, text: &str, voice_id: &str) -> Result<Bytes> {
        let mut request = self.client.post(&self.url).json(&serde_json::json!({
            "text": text,
            "voice_id": voice_id,
        }));
        if !self.api_key.is_empty() {
            request = request.header("Authorization", format!("Bearer {}", self.api_key));
        }

        let response = request
            .send()
            .await
            .map_err(|e| TutorError::Synthesis(format!("synthesis request failed: {e}")))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TutorError::Synthesis(format!(
                "synthesis HTTP {}: {}",
                status.as_u16(),
                body.trim()
            )));
        }

        let data = response
            .bytes()
            .await
            .map_err(|e| TutorError::Synthesis(format!("synthesis body unreadable: {e}")))?;
        if data.is_empty() {
            return Err(TutorError::Synthesis("provider returned no audio".to_owned()));
        }
        debug!(chars = text.len(), bytes = data.len(), "synthesized chunk");
        Ok(data)
    }
}
