//! Error types for the tutoring session.

/// Top-level error type for the tutoring agent.
#[derive(Debug, thiserror::Error)]
pub enum TutorError {
    /// Capture device denial, speech stream disconnect or stream error.
    #[error("transport error: {0}")]
    Transport(String),

    /// Category assessment call failed or produced unusable output.
    #[error("assessment error: {0}")]
    Assessment(String),

    /// Reply generation failed.
    #[error("generation error: {0}")]
    Generation(String),

    /// Speech synthesis failed.
    #[error("synthesis error: {0}")]
    Synthesis(String),

    /// Configuration error.
    #[error("config error: {0}")]
    Config(String),

    /// Concept map persistence error.
    #[error("storage error: {0}")]
    Storage(String),

    /// Channel send/receive error.
    #[error("channel error: {0}")]
    Channel(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, TutorError>;
