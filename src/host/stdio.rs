//! Stdin/stdout JSON bridge between a host application and a session.
//!
//! Reads newline-delimited JSON [`CommandEnvelope`] messages from stdin and
//! applies them to a [`TutorSession`]. Runtime events and synthesized audio
//! are written to stdout as newline-delimited [`EventEnvelope`] messages.
//!
//! Stdout is exclusively reserved for the JSON protocol; all diagnostic
//! output (tracing, logs) must be routed to stderr.

use crate::error::{Result, TutorError};
use crate::host::contract::{CommandEnvelope, EventEnvelope, HostCommand};
use crate::pipeline::playback::AudioSink;
use crate::session::TutorSession;
use crate::tts::SynthesizedAudio;
use async_trait::async_trait;
use std::pin::Pin;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{Mutex, broadcast, watch};
use tokio_util::sync::CancellationToken;

/// Serializes envelopes onto one output stream, one JSON object per line.
pub struct EnvelopeWriter {
    out: Mutex<Pin<Box<dyn AsyncWrite + Send>>>,
}

impl EnvelopeWriter {
    pub fn new(out: impl AsyncWrite + Send + 'static) -> Self {
        Self {
            out: Mutex::new(Box::pin(out)),
        }
    }

    pub fn stdout() -> Self {
        Self::new(tokio::io::BufWriter::new(tokio::io::stdout()))
    }

    /// Write one envelope and flush.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or the underlying write fails.
    pub async fn write(&self, envelope: &EventEnvelope) -> Result<()> {
        let json = serde_json::to_string(envelope)
            .map_err(|e| TutorError::Channel(format!("failed to serialize event envelope: {e}")))?;
        let mut out = self.out.lock().await;
        out.write_all(json.as_bytes())
            .await
            .map_err(|e| TutorError::Channel(format!("failed to write to stdout: {e}")))?;
        out.write_all(b"\n")
            .await
            .map_err(|e| TutorError::Channel(format!("failed to write newline to stdout: {e}")))?;
        out.flush()
            .await
            .map_err(|e| TutorError::Channel(format!("failed to flush stdout: {e}")))?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct PlaybackSignal {
    /// Last acknowledged `(turn, index)`.
    finished: Option<(u64, usize)>,
    stops: u64,
}

/// Audio sink that hands chunks to the host and waits for its
/// `playback_finished` acknowledgement.
pub struct HostAudioSink {
    writer: Arc<EnvelopeWriter>,
    signal: watch::Sender<PlaybackSignal>,
}

impl HostAudioSink {
    pub fn new(writer: Arc<EnvelopeWriter>) -> Self {
        let (signal, _) = watch::channel(PlaybackSignal::default());
        Self { writer, signal }
    }

    /// The host reports chunk `index` of `turn` as played.
    pub fn finished(&self, turn: u64, index: usize) {
        self.signal.send_modify(|s| s.finished = Some((turn, index)));
    }
}

#[async_trait]
impl AudioSink for HostAudioSink {
    async fn play(&self, audio: &SynthesizedAudio) -> Result<()> {
        let mut rx = self.signal.subscribe();
        let stops = self.signal.borrow().stops;
        self.signal.send_modify(|s| s.finished = None);

        self.writer.write(&EventEnvelope::audio(audio)).await?;

        let chunk = (audio.turn, audio.index);
        rx.wait_for(|s| s.finished == Some(chunk) || s.stops != stops)
            .await
            .map_err(|e| TutorError::Channel(format!("playback signal closed: {e}")))?;
        Ok(())
    }

    fn stop(&self) {
        self.signal.send_modify(|s| s.stops = s.stops.wrapping_add(1));
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let writer = Arc::clone(&self.writer);
            handle.spawn(async move {
                if let Err(e) = writer.write(&EventEnvelope::audio_stop()).await {
                    tracing::warn!(error = %e, "failed to send audio_stop");
                }
            });
        }
    }
}

/// Start `session` and run the bridge on the process's stdin until EOF or
/// `shutdown`.
///
/// # Errors
///
/// Returns an error if stdin cannot be read.
pub async fn run_stdio_bridge(
    session: TutorSession,
    sink: Arc<HostAudioSink>,
    writer: Arc<EnvelopeWriter>,
) -> Result<()> {
    let stdin = tokio::io::BufReader::new(tokio::io::stdin());
    run_bridge(session, sink, writer, stdin).await
}

/// Start `session` and run the bridge over arbitrary streams.
///
/// The event forwarder subscribes before the session starts, so the host
/// sees the initial concept map. Two tasks then operate in parallel:
///
/// 1. **Event forwarder** -- writes every runtime event as an envelope.
/// 2. **Reader** -- runs on the current task, parsing commands and applying
///    them to the session.
///
/// When the reader finishes the session is shut down and the forwarder
/// drains what is left before stopping.
///
/// # Errors
///
/// Returns an error if `input` cannot be read.
pub async fn run_bridge<R>(
    session: TutorSession,
    sink: Arc<HostAudioSink>,
    writer: Arc<EnvelopeWriter>,
    input: R,
) -> Result<()>
where
    R: AsyncBufRead + Unpin,
{
    let event_writer = Arc::clone(&writer);
    let mut event_rx = session.subscribe();
    let closing = CancellationToken::new();
    let forwarder_closing = closing.clone();
    let event_handle = tokio::spawn(async move {
        loop {
            let received = tokio::select! {
                biased;
                received = event_rx.recv() => received,
                () = forwarder_closing.cancelled() => {
                    while let Ok(event) = event_rx.try_recv() {
                        if event_writer.write(&EventEnvelope::from_runtime(&event)).await.is_err() {
                            break;
                        }
                    }
                    break;
                }
            };
            match received {
                Ok(event) => {
                    if let Err(e) = event_writer.write(&EventEnvelope::from_runtime(&event)).await {
                        tracing::warn!(
                            error = %e,
                            "failed to write event envelope; stopping event forwarder"
                        );
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!(lagged = n, "event forwarder lagged; some events were dropped");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    tracing::info!("event channel closed; stopping event forwarder");
                    break;
                }
            }
        }
    });

    let outcome = session.start().await;
    tracing::info!(session = %session.id(), ?outcome, "session ready");

    let reader_result = run_reader(&session, &sink, &writer, input).await;

    // Flush what the session emitted while stopping, then close the forwarder.
    session.shutdown();
    closing.cancel();
    let _ = event_handle.await;

    reader_result
}

async fn run_reader<R>(
    session: &TutorSession,
    sink: &HostAudioSink,
    writer: &EnvelopeWriter,
    mut input: R,
) -> Result<()>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = String::new();
    loop {
        line.clear();
        let bytes_read = input
            .read_line(&mut line)
            .await
            .map_err(|e| TutorError::Channel(format!("failed to read from stdin: {e}")))?;
        if bytes_read == 0 {
            tracing::info!("stdin closed (EOF); shutting down bridge");
            break;
        }

        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let envelope = match CommandEnvelope::parse(trimmed) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::warn!(error = %e, raw_line = %trimmed, "rejected host command");
                writer.write(&EventEnvelope::command_error(e.message)).await?;
                continue;
            }
        };

        tracing::debug!(command = envelope.command.as_str(), "host command");
        if !apply_command(session, sink, envelope.command) {
            tracing::info!("shutdown received; closing bridge");
            break;
        }
    }
    Ok(())
}

/// Apply one command. Returns `false` when the bridge should close.
fn apply_command(session: &TutorSession, sink: &HostAudioSink, command: HostCommand) -> bool {
    match command {
        HostCommand::Transcript { .. } => {
            if let Some(event) = command.stt_event() {
                session.ingest(event);
            }
        }
        HostCommand::TransportError { message } => session.report_transport_error(&message),
        HostCommand::TaskContext { .. } => {
            if let Some(context) = command.task_context() {
                session.set_task_context(context);
            }
        }
        HostCommand::PlaybackFinished { turn, index } => sink.finished(turn, index),
        HostCommand::Stop => session.stop(),
        HostCommand::Shutdown => return false,
    }
    true
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;
    use crate::config::TutorConfig;
    use crate::session::Providers;
    use crate::store::MemoryConceptStore;
    use crate::test_utils::{ScriptedCompletion, ScriptedReply, ScriptedSynth, assessment_json};
    use bytes::Bytes;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, BufReader};

    fn audio(turn: u64, index: usize) -> SynthesizedAudio {
        SynthesizedAudio {
            turn,
            index,
            text: format!("chunk {index}"),
            data: Bytes::from_static(b"pcm"),
        }
    }

    async fn read_envelopes(mut rx: tokio::io::DuplexStream) -> Vec<EventEnvelope> {
        let mut raw = String::new();
        rx.read_to_string(&mut raw).await.unwrap();
        raw.lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn play_waits_for_matching_ack() {
        let (out, _keep) = tokio::io::duplex(64 * 1024);
        let sink = Arc::new(HostAudioSink::new(Arc::new(EnvelopeWriter::new(out))));

        let player = {
            let sink = Arc::clone(&sink);
            tokio::spawn(async move { sink.play(&audio(1, 1)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        sink.finished(1, 0);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!player.is_finished());

        sink.finished(1, 1);
        player.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn late_ack_from_earlier_turn_is_ignored() {
        let (out, _keep) = tokio::io::duplex(64 * 1024);
        let sink = Arc::new(HostAudioSink::new(Arc::new(EnvelopeWriter::new(out))));

        let player = {
            let sink = Arc::clone(&sink);
            tokio::spawn(async move { sink.play(&audio(2, 0)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        sink.finished(1, 0);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!player.is_finished());

        sink.finished(2, 0);
        player.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn stop_releases_pending_play() {
        let (out, _keep) = tokio::io::duplex(64 * 1024);
        let sink = Arc::new(HostAudioSink::new(Arc::new(EnvelopeWriter::new(out))));

        let player = {
            let sink = Arc::clone(&sink);
            tokio::spawn(async move { sink.play(&audio(1, 0)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        sink.stop();
        player.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn bridge_reports_bad_commands_and_stops_on_shutdown() {
        let (out, out_rx) = tokio::io::duplex(64 * 1024);
        let writer = Arc::new(EnvelopeWriter::new(out));
        let sink = Arc::new(HostAudioSink::new(Arc::clone(&writer)));
        let session = TutorSession::new(
            "bridge",
            &TutorConfig::default(),
            Providers {
                reply: Arc::new(ScriptedReply::deltas(&[])),
                completion: Arc::new(ScriptedCompletion::always("{}")),
                synthesizer: Arc::new(ScriptedSynth::new()),
                sink: sink.clone(),
                store: Arc::new(MemoryConceptStore::new()),
            },
        );

        let input = concat!(
            "not json\n",
            "{\"v\":1,\"type\":\"task_context\",\"task\":\"Sum a list\"}\n",
            "{\"v\":1,\"type\":\"transcript\",\"text\":\"how do I start\",\"is_final\":true}\n",
            "{\"v\":1,\"type\":\"shutdown\"}\n",
            "{\"v\":1,\"type\":\"transcript\",\"text\":\"ignored\",\"is_final\":true}\n",
        );
        run_bridge(
            session.clone(),
            sink,
            writer,
            BufReader::new(input.as_bytes()),
        )
        .await
        .unwrap();

        drop(session);

        let envelopes = read_envelopes(out_rx).await;
        assert!(envelopes.iter().any(|e| e.event == "command_error"));
        assert!(
            envelopes
                .iter()
                .any(|e| e.event == "transcript_updated" && e.payload["text"] == "how do I start")
        );
        assert!(
            !envelopes
                .iter()
                .any(|e| e.event == "transcript_updated" && e.payload["text"] == "ignored")
        );
    }

    #[tokio::test]
    async fn host_receives_events_from_calibration() {
        let (out, out_rx) = tokio::io::duplex(64 * 1024);
        let writer = Arc::new(EnvelopeWriter::new(out));
        let sink = Arc::new(HostAudioSink::new(Arc::clone(&writer)));
        let confident = ScriptedCompletion::from_fn(|request| {
            let names: Vec<&str> = request.messages[0]
                .content
                .lines()
                .filter_map(|line| line.strip_prefix("- ")?.split_once(':').map(|(name, _)| name))
                .collect();
            Ok(assessment_json(&names, 0.9, 0.9))
        });
        let session = TutorSession::new(
            "calibrated",
            &TutorConfig::default(),
            Providers {
                reply: Arc::new(ScriptedReply::deltas(&[])),
                completion: Arc::new(confident),
                synthesizer: Arc::new(ScriptedSynth::new()),
                sink: sink.clone(),
                store: Arc::new(MemoryConceptStore::new()),
            },
        );

        run_bridge(session.clone(), sink, writer, BufReader::new(&b""[..]))
            .await
            .unwrap();
        assert!(session.tracker().confidence_reached());
        drop(session);

        let envelopes = read_envelopes(out_rx).await;
        assert!(envelopes.iter().any(|e| e.event == "concept_map_updated"));
        assert!(envelopes.iter().any(|e| e.event == "pivot_queue_updated"));
        assert!(envelopes.iter().any(|e| e.event == "confidence_reached"));
    }
}
