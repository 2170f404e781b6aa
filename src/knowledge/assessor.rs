//! Per-category knowledge assessment.
//!
//! One assessor call covers one category: it sees the category's current
//! subconcept states, the recent conversation and the task context, and
//! returns updated states. The response is validated here, at the merge
//! boundary, so nothing downstream trusts raw model output.

use super::types::{CategoryConcepts, KnowledgeState};
use crate::config::KnowledgeConfig;
use crate::llm::json::find_json_object;
use crate::llm::{ChatMessage, CompletionBackend, ReplyRequest};
use crate::session::state::{Message, Role, TaskContext};
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, warn};

const FAILURE_MARKER: &str = "[assessment failed:";

const ASSESSMENT_PROMPT: &str = "You assess a programming student's knowledge from a \
spoken tutoring conversation. For each listed subconcept, estimate understanding_level \
(0 to 1, how well the student understands it) and confidence_in_assessment (0 to 1, how \
much evidence supports that estimate). Cite the evidence briefly in reasoning. Set \
explicit_evidence to true only when the student directly and verbally demonstrated the \
concept. Without evidence, keep confidence low. Respond with JSON only, in the form \
{\"subconcepts\": {\"<name>\": {\"understanding_level\": 0.0, \"confidence_in_assessment\": 0.0, \
\"reasoning\": \"...\", \"explicit_evidence\": false}}}";

/// How an assessment call ended.
#[derive(Debug, Clone, PartialEq)]
pub enum AssessmentOutcome {
    /// At least one subconcept was updated from the response.
    Assessed { updated: usize },
    /// Previous states kept, annotated with the reason.
    Failed(String),
}

/// Result for one category. `subconcepts` always covers the full category.
#[derive(Debug, Clone)]
pub struct CategoryAssessment {
    pub category: String,
    pub subconcepts: CategoryConcepts,
    pub outcome: AssessmentOutcome,
}

impl CategoryAssessment {
    pub fn is_failed(&self) -> bool {
        matches!(self.outcome, AssessmentOutcome::Failed(_))
    }
}

/// Runs category assessments against a completion backend.
pub struct CategoryAssessor {
    backend: Arc<dyn CompletionBackend>,
    history_window: usize,
    low_understanding_level: f64,
    confidence_cap: f64,
}

impl CategoryAssessor {
    pub fn new(backend: Arc<dyn CompletionBackend>, config: &KnowledgeConfig) -> Self {
        Self {
            backend,
            history_window: config.history_window,
            low_understanding_level: config.low_understanding_level,
            confidence_cap: config.low_understanding_confidence_cap,
        }
    }

    /// Assess one category. Never fails: on any error the previous states
    /// come back annotated.
    pub async fn assess(
        &self,
        category: &str,
        current: &CategoryConcepts,
        history: &[Message],
        task: &TaskContext,
    ) -> CategoryAssessment {
        let request = self.build_request(category, current, history, task);
        let parsed = match self.backend.complete(&request).await {
            Ok(raw) => parse_assessment(
                &raw,
                current,
                self.low_understanding_level,
                self.confidence_cap,
            ),
            Err(e) => Err(e.to_string()),
        };

        match parsed {
            Ok((subconcepts, updated)) => {
                debug!(category, updated, "category assessed");
                CategoryAssessment {
                    category: category.to_owned(),
                    subconcepts,
                    outcome: AssessmentOutcome::Assessed { updated },
                }
            }
            Err(reason) => {
                warn!(category, %reason, "assessment failed, keeping previous states");
                CategoryAssessment {
                    category: category.to_owned(),
                    subconcepts: annotate_failure(current, &reason),
                    outcome: AssessmentOutcome::Failed(reason),
                }
            }
        }
    }

    fn build_request(
        &self,
        category: &str,
        current: &CategoryConcepts,
        history: &[Message],
        task: &TaskContext,
    ) -> ReplyRequest {
        let mut body = format!("Category: {category}\n\nCurrent assessment:\n");
        for (name, sub) in current {
            let s = &sub.knowledge_state;
            body.push_str(&format!(
                "- {name}: understanding {:.2}, confidence {:.2} ({})\n",
                s.understanding_level, s.confidence_in_assessment, s.reasoning
            ));
        }

        let start = history.len().saturating_sub(self.history_window);
        body.push_str("\nRecent conversation:\n");
        for message in &history[start..] {
            let speaker = match message.role {
                Role::User => "Student",
                Role::Assistant => "Tutor",
            };
            body.push_str(&format!("{speaker}: {}\n", message.content));
        }

        if !task.is_empty() {
            body.push('\n');
            body.push_str(&task.render());
            body.push('\n');
        }

        ReplyRequest::new(ASSESSMENT_PROMPT, vec![ChatMessage::user(body)])
    }
}

#[derive(Debug, Deserialize)]
struct RawState {
    understanding_level: f64,
    confidence_in_assessment: f64,
    #[serde(default)]
    reasoning: String,
    #[serde(default)]
    explicit_evidence: bool,
}

/// Validate a raw response against the current category.
///
/// Unknown subconcepts are ignored, missing ones keep their state, entries
/// with non-finite numbers are rejected, values are clamped and the
/// low-understanding cap is applied. Returns the merged category and the
/// number of updated entries, or the reason nothing was usable.
pub(crate) fn parse_assessment(
    raw: &str,
    current: &CategoryConcepts,
    low_level: f64,
    cap: f64,
) -> Result<(CategoryConcepts, usize), String> {
    let json = find_json_object(raw).ok_or_else(|| "no JSON object in response".to_owned())?;
    let value: serde_json::Value =
        serde_json::from_str(&json).map_err(|e| format!("invalid JSON: {e}"))?;
    let entries = value
        .get("subconcepts")
        .and_then(|v| v.as_object())
        .ok_or_else(|| "missing \"subconcepts\" object".to_owned())?;

    let mut merged = current.clone();
    let mut updated = 0;
    for (name, entry) in entries {
        let Some(slot) = merged.get_mut(name) else {
            debug!(subconcept = %name, "ignoring unknown subconcept");
            continue;
        };
        let raw_state = match serde_json::from_value::<RawState>(entry.clone()) {
            Ok(s) => s,
            Err(e) => {
                debug!(subconcept = %name, error = %e, "skipping malformed entry");
                continue;
            }
        };
        if !raw_state.understanding_level.is_finite()
            || !raw_state.confidence_in_assessment.is_finite()
        {
            continue;
        }

        let mut state = KnowledgeState::new(
            raw_state.understanding_level,
            raw_state.confidence_in_assessment,
            raw_state.reasoning.trim(),
        )
        .with_explicit_evidence(raw_state.explicit_evidence);
        state.enforce_low_understanding_cap(low_level, cap);
        slot.knowledge_state = state;
        updated += 1;
    }

    if updated == 0 {
        return Err("no usable subconcepts in response".to_owned());
    }
    Ok((merged, updated))
}

/// Previous states with the failure noted in `reasoning`.
///
/// Replaces an earlier failure note instead of stacking them.
fn annotate_failure(current: &CategoryConcepts, reason: &str) -> CategoryConcepts {
    let mut out = current.clone();
    for sub in out.values_mut() {
        let reasoning = &mut sub.knowledge_state.reasoning;
        if let Some(pos) = reasoning.find(FAILURE_MARKER) {
            reasoning.truncate(pos);
        }
        let base = reasoning.trim_end().to_owned();
        *reasoning = if base.is_empty() {
            format!("{FAILURE_MARKER} {reason}]")
        } else {
            format!("{base} {FAILURE_MARKER} {reason}]")
        };
    }
    out
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;
    use crate::knowledge::types::Subconcept;
    use crate::test_utils::ScriptedCompletion;

    fn category() -> CategoryConcepts {
        let mut subs = CategoryConcepts::new();
        for name in ["loops", "conditionals"] {
            subs.insert(
                name.to_owned(),
                Subconcept::new(name, KnowledgeState::new(0.2, 0.3, "initial")),
            );
        }
        subs
    }

    fn assessor(backend: Arc<ScriptedCompletion>) -> CategoryAssessor {
        CategoryAssessor::new(backend, &KnowledgeConfig::default())
    }

    #[test]
    fn parse_updates_known_and_keeps_missing() {
        let raw = r#"Sure! {"subconcepts": {
            "loops": {"understanding_level": 0.8, "confidence_in_assessment": 0.75, "reasoning": "explained range()"},
            "recursion": {"understanding_level": 0.9, "confidence_in_assessment": 0.9}
        }}"#;
        let (merged, updated) = parse_assessment(raw, &category(), 0.4, 0.6).unwrap();
        assert_eq!(updated, 1);
        assert_eq!(merged.len(), 2);
        assert!(!merged.contains_key("recursion"));
        let loops = &merged["loops"].knowledge_state;
        assert_eq!(loops.understanding_level, 0.8);
        assert_eq!(loops.confidence_in_assessment, 0.75);
        assert_eq!(merged["conditionals"].knowledge_state.reasoning, "initial");
    }

    #[test]
    fn parse_clamps_and_caps() {
        let raw = r#"{"subconcepts": {
            "loops": {"understanding_level": 0.1, "confidence_in_assessment": 1.7},
            "conditionals": {"understanding_level": 0.2, "confidence_in_assessment": 0.95, "explicit_evidence": true}
        }}"#;
        let (merged, _) = parse_assessment(raw, &category(), 0.4, 0.6).unwrap();
        assert_eq!(merged["loops"].knowledge_state.confidence_in_assessment, 0.6);
        assert_eq!(
            merged["conditionals"].knowledge_state.confidence_in_assessment,
            0.95
        );
    }

    #[test]
    fn parse_rejects_malformed_entries() {
        let raw = r#"{"subconcepts": {"loops": {"understanding_level": "high", "confidence_in_assessment": 0.5}}}"#;
        assert!(parse_assessment(raw, &category(), 0.4, 0.6).is_err());
        assert!(parse_assessment("I cannot assess this.", &category(), 0.4, 0.6).is_err());
        assert!(parse_assessment(r#"{"loops": 1}"#, &category(), 0.4, 0.6).is_err());
    }

    #[tokio::test]
    async fn assess_returns_updated_states() {
        let backend = Arc::new(ScriptedCompletion::always(
            r#"```json
{"subconcepts": {"loops": {"understanding_level": 0.7, "confidence_in_assessment": 0.8, "reasoning": "ok"}}}
```"#,
        ));
        let history = vec![Message::user("a for loop walks a list")];
        let result = assessor(backend.clone())
            .assess("control_flow", &category(), &history, &TaskContext::default())
            .await;
        assert_eq!(result.outcome, AssessmentOutcome::Assessed { updated: 1 });
        assert_eq!(result.subconcepts["loops"].knowledge_state.confidence_in_assessment, 0.8);

        let prompt = &backend.requests()[0].messages[0].content;
        assert!(prompt.contains("Category: control_flow"));
        assert!(prompt.contains("Student: a for loop walks a list"));
    }

    #[tokio::test]
    async fn failure_keeps_states_with_single_annotation() {
        let backend = Arc::new(ScriptedCompletion::failing("connection refused"));
        let a = assessor(backend);
        let first = a
            .assess("control_flow", &category(), &[], &TaskContext::default())
            .await;
        assert!(first.is_failed());
        let second = a
            .assess("control_flow", &first.subconcepts, &[], &TaskContext::default())
            .await;

        let state = &second.subconcepts["loops"].knowledge_state;
        assert_eq!(state.confidence_in_assessment, 0.3);
        assert_eq!(state.reasoning.matches(FAILURE_MARKER).count(), 1);
        assert!(state.reasoning.starts_with("initial [assessment failed:"));
    }

    #[tokio::test]
    async fn history_is_windowed() {
        let backend = Arc::new(ScriptedCompletion::always("{}"));
        let config = KnowledgeConfig {
            history_window: 2,
            ..KnowledgeConfig::default()
        };
        let a = CategoryAssessor::new(backend.clone(), &config);
        let history = vec![
            Message::user("oldest"),
            Message::assistant("middle"),
            Message::user("newest"),
        ];
        a.assess("control_flow", &category(), &history, &TaskContext::default())
            .await;
        let prompt = &backend.requests()[0].messages[0].content;
        assert!(!prompt.contains("oldest"));
        assert!(prompt.contains("Tutor: middle"));
        assert!(prompt.contains("Student: newest"));
    }
}
