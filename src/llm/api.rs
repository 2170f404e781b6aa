//! OpenAI-compatible chat completions client.
//!
//! Works with Ollama, LM Studio, vLLM and hosted APIs that expose
//! `/v1/chat/completions`. Replies stream over SSE; assessment and question
//! calls use the non-streaming form.

use super::events::{FinishReason, ReplyEvent};
use super::sse::SseDecoder;
use super::{ChatMessage, CompletionBackend, ReplyGenerator, ReplyRequest, ReplyStream};
use crate::config::LlmConfig;
use crate::error::{Result, TutorError};
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use std::collections::VecDeque;
use std::pin::Pin;
use std::time::Duration;
use tracing::{debug, warn};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// HTTP client for an OpenAI-compatible server.
pub struct ApiLlm {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    reply_model: String,
    assessment_model: String,
    max_tokens: usize,
    temperature: f64,
    assessment_temperature: f64,
}

impl std::fmt::Debug for ApiLlm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiLlm")
            .field("base_url", &self.base_url)
            .field("reply_model", &self.reply_model)
            .field("assessment_model", &self.assessment_model)
            .finish()
    }
}

impl ApiLlm {
    /// Build a client from the LLM config.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be constructed.
    pub fn new(config: &LlmConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| TutorError::Config(format!("cannot build HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url: config.api_url.trim_end_matches('/').to_owned(),
            api_key: config.api_key.clone(),
            reply_model: config.api_model.clone(),
            assessment_model: config.effective_assessment_model().to_owned(),
            max_tokens: config.max_tokens,
            temperature: config.temperature,
            assessment_temperature: config.assessment_temperature,
        })
    }

    fn endpoint(&self) -> String {
        format!("{}/v1/chat/completions", self.base_url)
    }

    fn post(&self, body: &serde_json::Value) -> reqwest::RequestBuilder {
        let mut request = self
            .client
            .post(self.endpoint())
            .header("Content-Type", "application/json")
            .json(body);
        if !self.api_key.is_empty() {
            request = request.header("Authorization", format!("Bearer {}", self.api_key));
        }
        request
    }
}

fn wire_messages(request: &ReplyRequest) -> Vec<serde_json::Value> {
    let mut messages = Vec::with_capacity(request.messages.len() + 1);
    if !request.system_context.is_empty() {
        messages.push(serde_json::json!({
            "role": "system",
            "content": request.system_context,
        }));
    }
    messages.extend(request.messages.iter().map(|m: &ChatMessage| {
        serde_json::json!({
            "role": m.role,
            "content": m.content,
        })
    }));
    messages
}

/// Extract an error message from an error response body.
fn extract_error_message(body: &str) -> String {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| {
            v.get("error")
                .and_then(|e| e.get("message").or(Some(e)))
                .and_then(|m| m.as_str())
                .map(String::from)
        })
        .unwrap_or_else(|| body.to_owned())
}

#[async_trait]
impl ReplyGenerator for ApiLlm {
    async fn stream_reply(&self, request: &ReplyRequest) -> Result<ReplyStream> {
        let body = serde_json::json!({
            "model": self.reply_model,
            "messages": wire_messages(request),
            "max_tokens": self.max_tokens,
            "temperature": self.temperature,
            "stream": true,
        });

        let response = self
            .post(&body)
            .send()
            .await
            .map_err(|e| TutorError::Generation(format!("reply request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(TutorError::Generation(format!(
                "reply HTTP {}: {}",
                status.as_u16(),
                extract_error_message(&text)
            )));
        }

        debug!(model = %self.reply_model, "reply stream opened");
        Ok(Box::pin(reply_event_stream(response.bytes_stream())))
    }
}

#[async_trait]
impl CompletionBackend for ApiLlm {
    async fn complete(&self, request: &ReplyRequest) -> Result<String> {
        let body = serde_json::json!({
            "model": self.assessment_model,
            "messages": wire_messages(request),
            "temperature": self.assessment_temperature,
            "stream": false,
        });

        let response = self
            .post(&body)
            .send()
            .await
            .map_err(|e| TutorError::Assessment(format!("completion request failed: {e}")))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| TutorError::Assessment(format!("completion body unreadable: {e}")))?;
        if !status.is_success() {
            return Err(TutorError::Assessment(format!(
                "completion HTTP {}: {}",
                status.as_u16(),
                extract_error_message(&text)
            )));
        }

        let value: serde_json::Value = serde_json::from_str(&text)
            .map_err(|e| TutorError::Assessment(format!("completion is not JSON: {e}")))?;
        value
            .pointer("/choices/0/message/content")
            .and_then(|c| c.as_str())
            .map(str::to_owned)
            .ok_or_else(|| TutorError::Assessment("completion has no message content".to_owned()))
    }
}

struct StreamState {
    byte_stream: Pin<Box<dyn Stream<Item = std::result::Result<Bytes, reqwest::Error>> + Send>>,
    decoder: SseDecoder,
    pending: VecDeque<ReplyEvent>,
    finished: bool,
}

impl StreamState {
    /// Queue events for one SSE data payload. Returns `true` once the
    /// stream has reached a terminal event.
    fn handle_data(&mut self, data: &str) -> bool {
        let value: serde_json::Value = match serde_json::from_str(data) {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "skipping malformed stream chunk");
                return false;
            }
        };

        if let Some(error) = value.get("error") {
            let message = error
                .get("message")
                .and_then(|m| m.as_str())
                .map(str::to_owned)
                .unwrap_or_else(|| error.to_string());
            self.pending.push_back(ReplyEvent::StreamError { error: message });
            return true;
        }

        let Some(choice) = value.pointer("/choices/0") else {
            return false;
        };
        if let Some(text) = choice.pointer("/delta/content").and_then(|c| c.as_str())
            && !text.is_empty()
        {
            self.pending.push_back(ReplyEvent::delta(text));
        }
        if let Some(reason) = choice.get("finish_reason").and_then(|r| r.as_str()) {
            self.pending.push_back(ReplyEvent::StreamEnd {
                finish_reason: FinishReason::from_wire(reason),
            });
            return true;
        }
        false
    }
}

/// Decode an SSE byte stream into reply events.
///
/// Always terminates with exactly one `StreamEnd` or `StreamError`.
fn reply_event_stream(
    byte_stream: impl Stream<Item = std::result::Result<Bytes, reqwest::Error>> + Send + 'static,
) -> impl Stream<Item = ReplyEvent> + Send {
    futures_util::stream::unfold(
        StreamState {
            byte_stream: Box::pin(byte_stream),
            decoder: SseDecoder::new(),
            pending: VecDeque::new(),
            finished: false,
        },
        |mut state| async move {
            loop {
                if let Some(event) = state.pending.pop_front() {
                    return Some((event, state));
                }
                if state.finished {
                    return None;
                }

                match state.byte_stream.next().await {
                    Some(Ok(chunk)) => {
                        for frame in state.decoder.push(&chunk) {
                            if frame.is_done() {
                                state.pending.push_back(ReplyEvent::StreamEnd {
                                    finish_reason: FinishReason::Stop,
                                });
                                state.finished = true;
                                break;
                            }
                            if state.handle_data(&frame.data) {
                                state.finished = true;
                                break;
                            }
                        }
                    }
                    Some(Err(e)) => {
                        state.pending.push_back(ReplyEvent::StreamError {
                            error: format!("stream read error: {e}"),
                        });
                        state.finished = true;
                    }
                    None => {
                        let ended = state
                            .decoder
                            .finish()
                            .filter(|frame| !frame.is_done())
                            .is_some_and(|frame| state.handle_data(&frame.data));
                        if !ended {
                            state.pending.push_back(ReplyEvent::StreamEnd {
                                finish_reason: FinishReason::Stop,
                            });
                        }
                        state.finished = true;
                    }
                }
            }
        },
    )
}
