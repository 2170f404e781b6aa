//! Headless host bridge binary for stdin/stdout JSON communication.
//!
//! Reads host commands as newline-delimited JSON from stdin, drives one
//! tutoring session, and writes event envelopes (including base64 audio)
//! to stdout.
//!
//! All tracing/diagnostic output goes to stderr so that stdout remains a
//! clean JSON protocol channel. Set `MENTOR_LOG_DIR` to also write a daily
//! rolling log file.

use mentor::host::stdio::{EnvelopeWriter, HostAudioSink, run_stdio_bridge};
use mentor::llm::ApiLlm;
use mentor::store::{ConceptStore, MemoryConceptStore, SqliteConceptStore};
use mentor::tts::HttpSynthesizer;
use mentor::{Providers, TutorConfig, TutorSession};
use std::sync::Arc;
use tracing_subscriber::Layer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _log_guard = init_tracing();

    tracing::info!("mentor-host starting");

    let config = load_config()?;
    let session_id = std::env::var("MENTOR_SESSION_ID")
        .unwrap_or_else(|_| uuid::Uuid::new_v4().to_string());

    let llm = Arc::new(ApiLlm::new(&config.llm)?);
    let store: Arc<dyn ConceptStore> = if config.storage.enabled {
        Arc::new(SqliteConceptStore::open(&config.storage.root_dir)?)
    } else {
        Arc::new(MemoryConceptStore::new())
    };
    let writer = Arc::new(EnvelopeWriter::stdout());
    let sink = Arc::new(HostAudioSink::new(Arc::clone(&writer)));

    let session = TutorSession::new(
        session_id,
        &config,
        Providers {
            reply: llm.clone(),
            completion: llm,
            synthesizer: Arc::new(HttpSynthesizer::new(&config.tts)?),
            sink: sink.clone(),
            store,
        },
    );
    run_stdio_bridge(session, sink, writer).await.map_err(|e| {
        tracing::error!(error = %e, "mentor-host exited with error");
        anyhow::anyhow!("mentor-host failed: {e}")
    })?;

    tracing::info!("mentor-host shut down cleanly");
    Ok(())
}

/// Stderr logging, plus a daily rolling file under `MENTOR_LOG_DIR`.
fn init_tracing() -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = || EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("mentor=info"));
    let stderr_layer = fmt::layer().with_writer(std::io::stderr).with_filter(filter());

    match std::env::var_os("MENTOR_LOG_DIR") {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "mentor-host.log");
            let (file_writer, guard) = tracing_appender::non_blocking(appender);
            let file_layer = fmt::layer()
                .with_ansi(false)
                .with_writer(file_writer)
                .with_filter(filter());
            tracing_subscriber::registry()
                .with(stderr_layer)
                .with(file_layer)
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::registry().with(stderr_layer).init();
            None
        }
    }
}

/// Config from `MENTOR_CONFIG` or the default path; defaults when absent.
fn load_config() -> anyhow::Result<TutorConfig> {
    let path = std::env::var_os("MENTOR_CONFIG")
        .map(std::path::PathBuf::from)
        .unwrap_or_else(TutorConfig::default_config_path);
    let config = if path.exists() {
        tracing::info!(path = %path.display(), "loading config");
        TutorConfig::from_file(&path)?
    } else {
        tracing::info!(path = %path.display(), "no config file; using defaults");
        TutorConfig::default()
    };
    config.validate()?;
    Ok(config)
}
