//! Configuration types for the tutoring session.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Top-level configuration for a tutoring session.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TutorConfig {
    /// Turn-taking settings (silence detection, barge-in).
    pub session: SessionConfig,
    /// Language model settings (reply generation and assessments).
    pub llm: LlmConfig,
    /// Knowledge tracking settings.
    pub knowledge: KnowledgeConfig,
    /// Reply chunking for streaming synthesis.
    pub chunking: ChunkingConfig,
    /// Text-to-speech settings.
    pub tts: TtsConfig,
    /// Concept map persistence settings.
    pub storage: StorageConfig,
}

/// Turn-taking configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Silence (ms) after the last transcript segment before the utterance is finalized.
    pub silence_threshold_ms: u64,
    /// Whether new speech while the assistant is speaking interrupts playback.
    pub barge_in_enabled: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            silence_threshold_ms: 2_500,
            barge_in_enabled: true,
        }
    }
}

/// Language model configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// Base URL for an OpenAI-compatible API server.
    pub api_url: String,
    /// Model name used for spoken replies.
    pub api_model: String,
    /// API key for the remote provider. Empty for local servers.
    pub api_key: String,
    /// Model used for category assessments. `None` reuses `api_model`.
    pub assessment_model: Option<String>,
    /// Maximum tokens to generate per reply.
    pub max_tokens: usize,
    /// Sampling temperature for replies.
    pub temperature: f64,
    /// Sampling temperature for assessments (kept low for stable JSON).
    pub assessment_temperature: f64,
    /// Base tutor prompt. The task context and pivot focus are appended per turn.
    pub system_prompt: String,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            // Ollama default endpoint.
            api_url: "http://localhost:11434".to_owned(),
            api_model: "llama3.1:8b".to_owned(),
            api_key: String::new(),
            assessment_model: None,
            max_tokens: 220,
            temperature: 0.7,
            assessment_temperature: 0.1,
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_owned(),
        }
    }
}

const DEFAULT_SYSTEM_PROMPT: &str = "You are a friendly programming tutor talking \
with a student by voice. Keep every reply short and conversational: two or three \
sentences, no markdown, no code blocks. Ask one question at a time and let the \
student explain their thinking in their own words.";

impl LlmConfig {
    /// Model name used for assessment and pivot-question calls.
    pub fn effective_assessment_model(&self) -> &str {
        self.assessment_model.as_deref().unwrap_or(&self.api_model)
    }
}

/// Knowledge tracking configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KnowledgeConfig {
    /// Confidence at or above which a subconcept is considered sufficiently assessed.
    pub confidence_threshold: f64,
    /// Understanding level below which assessment confidence is capped.
    pub low_understanding_level: f64,
    /// Maximum confidence for low-understanding states without explicit evidence.
    pub low_understanding_confidence_cap: f64,
    /// Number of entries kept in the pivot queue.
    pub pivot_queue_size: usize,
    /// Number of recent conversation messages handed to each assessment.
    pub history_window: usize,
    /// Whether to generate short verbal questions for the weakest concept.
    pub pivot_questions: bool,
    /// Curriculum: category name → subconcept names.
    pub categories: BTreeMap<String, Vec<String>>,
}

impl Default for KnowledgeConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.7,
            low_understanding_level: 0.4,
            low_understanding_confidence_cap: 0.6,
            pivot_queue_size: 5,
            history_window: 12,
            pivot_questions: false,
            categories: default_curriculum(),
        }
    }
}

fn default_curriculum() -> BTreeMap<String, Vec<String>> {
    let entries: [(&str, &[&str]); 5] = [
        (
            "variables_and_types",
            &["assignment", "data_types", "type_conversion"],
        ),
        ("control_flow", &["conditionals", "loops", "boolean_logic"]),
        ("functions", &["parameters", "return_values", "scope"]),
        ("data_structures", &["lists", "dictionaries", "indexing"]),
        ("debugging", &["reading_errors", "tracing_execution"]),
    ];
    entries
        .iter()
        .map(|(category, subs)| {
            (
                (*category).to_owned(),
                subs.iter().map(|s| (*s).to_owned()).collect(),
            )
        })
        .collect()
}

/// Reply chunking configuration for streaming synthesis.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkingConfig {
    /// Flush the first chunk at the first clause punctuation (`, ; :`).
    pub first_chunk_on_clause: bool,
    /// Flush the first chunk at a word boundary once it reaches this many bytes.
    ///
    /// Set to 0 to disable the length trigger.
    pub first_chunk_max_chars: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            first_chunk_on_clause: true,
            first_chunk_max_chars: 48,
        }
    }
}

/// Text-to-speech configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TtsConfig {
    /// Endpoint accepting `{text, voice_id}` and returning an audio payload.
    pub api_url: String,
    /// API key for the synthesis provider. Empty when not required.
    pub api_key: String,
    /// Voice identifier passed with every request.
    pub voice_id: String,
}

impl Default for TtsConfig {
    fn default() -> Self {
        Self {
            api_url: "http://localhost:8880/v1/synthesize".to_owned(),
            api_key: String::new(),
            voice_id: "tutor".to_owned(),
        }
    }
}

/// Concept map persistence configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Whether the SQLite store is used. When disabled, maps live in memory only.
    pub enabled: bool,
    /// Directory holding `mentor.db`.
    pub root_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            root_dir: default_data_dir(),
        }
    }
}

/// Application data directory. Override with `MENTOR_DATA_DIR`.
fn default_data_dir() -> PathBuf {
    if let Some(dir) = std::env::var_os("MENTOR_DATA_DIR") {
        return PathBuf::from(dir);
    }
    dirs::data_dir()
        .map(|d| d.join("mentor"))
        .unwrap_or_else(|| PathBuf::from("/tmp/mentor-data"))
}

impl TutorConfig {
    /// Load configuration from a TOML file, falling back to defaults for missing fields.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &std::path::Path) -> crate::error::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| crate::error::TutorError::Config(e.to_string()))
    }

    /// Save configuration to a TOML file, creating parent directories as needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written or the config cannot be serialized.
    pub fn save_to_file(&self, path: &std::path::Path) -> crate::error::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| crate::error::TutorError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Returns the default config file path: `<config dir>/mentor/config.toml`.
    ///
    /// Override the directory with `MENTOR_CONFIG_DIR`.
    #[must_use]
    pub fn default_config_path() -> PathBuf {
        if let Some(dir) = std::env::var_os("MENTOR_CONFIG_DIR") {
            return PathBuf::from(dir).join("config.toml");
        }
        dirs::config_dir()
            .map(|d| d.join("mentor"))
            .unwrap_or_else(|| PathBuf::from("/tmp/mentor-config"))
            .join("config.toml")
    }

    /// Check values that serde cannot express as types.
    ///
    /// # Errors
    ///
    /// Returns [`TutorError::Config`](crate::error::TutorError::Config) naming the
    /// first offending field.
    pub fn validate(&self) -> crate::error::Result<()> {
        let k = &self.knowledge;
        for (name, value) in [
            ("knowledge.confidence_threshold", k.confidence_threshold),
            ("knowledge.low_understanding_level", k.low_understanding_level),
            (
                "knowledge.low_understanding_confidence_cap",
                k.low_understanding_confidence_cap,
            ),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(crate::error::TutorError::Config(format!(
                    "{name} must be within [0, 1], got {value}"
                )));
            }
        }
        if k.categories.is_empty() {
            return Err(crate::error::TutorError::Config(
                "knowledge.categories must name at least one category".to_owned(),
            ));
        }
        if self.session.silence_threshold_ms == 0 {
            return Err(crate::error::TutorError::Config(
                "session.silence_threshold_ms must be positive".to_owned(),
            ));
        }
        Ok(())
    }
}
