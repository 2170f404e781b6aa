//! Pivot queue ranking and optional verbal pivot questions.

use super::types::{ConceptMap, PivotEntry};
use crate::llm::json::find_json_object;
use crate::llm::{ChatMessage, CompletionBackend, ReplyRequest};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

/// Every subconcept below `threshold`, ascending by confidence, first `n`.
///
/// The sort is stable so ties keep category/subconcept order.
pub fn build_pivot_queue(map: &ConceptMap, threshold: f64, n: usize) -> Vec<PivotEntry> {
    let mut entries: Vec<PivotEntry> = map
        .categories()
        .flat_map(|(category, subs)| {
            subs.values().filter_map(move |sub| {
                let confidence = sub.knowledge_state.confidence_in_assessment;
                (confidence < threshold).then(|| PivotEntry {
                    concept: sub.name.clone(),
                    category: category.clone(),
                    confidence,
                })
            })
        })
        .collect();
    entries.sort_by(|a, b| a.confidence.total_cmp(&b.confidence));
    entries.truncate(n);
    entries
}

const MAX_QUESTIONS: usize = 3;
const MAX_QUESTION_WORDS: usize = 10;

/// Short conceptual questions aimed at one concept.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PivotQuestions {
    pub concept: String,
    pub category: String,
    pub questions: Vec<String>,
}

const QUESTION_PROMPT: &str = "You write spoken questions for a programming tutor. \
Given one concept, write one to three short questions that check whether the student \
understands it. Each question must be under ten words, answerable out loud, and purely \
conceptual: no code to write, complete or read. Reply with JSON only: \
{\"questions\": [\"...\"]}";

/// Asks the backend for verbal questions about the weakest concept.
pub struct PivotQuestionGenerator {
    backend: Arc<dyn CompletionBackend>,
}

impl PivotQuestionGenerator {
    pub fn new(backend: Arc<dyn CompletionBackend>) -> Self {
        Self { backend }
    }

    /// `None` when the call fails or no acceptable question comes back.
    pub async fn generate(&self, target: &PivotEntry) -> Option<PivotQuestions> {
        let request = ReplyRequest::new(
            QUESTION_PROMPT,
            vec![ChatMessage::user(format!(
                "Concept: {} (category: {})",
                target.concept.replace('_', " "),
                target.category.replace('_', " ")
            ))],
        );
        let raw = match self.backend.complete(&request).await {
            Ok(raw) => raw,
            Err(e) => {
                warn!(concept = %target.concept, error = %e, "pivot question generation failed");
                return None;
            }
        };
        let questions = parse_questions(&raw);
        if questions.is_empty() {
            debug!(concept = %target.concept, "no usable pivot questions");
            return None;
        }
        Some(PivotQuestions {
            concept: target.concept.clone(),
            category: target.category.clone(),
            questions,
        })
    }
}

#[derive(Deserialize)]
struct QuestionList {
    questions: Vec<String>,
}

/// Parse `{"questions": [...]}`, falling back to one question per line.
pub(crate) fn parse_questions(raw: &str) -> Vec<String> {
    let candidates: Vec<String> = find_json_object(raw)
        .and_then(|json| serde_json::from_str::<QuestionList>(&json).ok())
        .map(|list| list.questions)
        .unwrap_or_else(|| raw.lines().map(str::to_owned).collect());

    candidates
        .iter()
        .map(|q| clean_question(q))
        .filter(|q| is_acceptable(q))
        .take(MAX_QUESTIONS)
        .collect()
}

fn clean_question(raw: &str) -> String {
    raw.trim()
        .trim_start_matches(|c: char| c.is_ascii_digit() || matches!(c, '.' | ')' | '-' | '*'))
        .trim()
        .trim_matches('"')
        .trim()
        .to_owned()
}

fn is_acceptable(question: &str) -> bool {
    if !question.ends_with('?') {
        return false;
    }
    let words = question.split_whitespace().count();
    if words == 0 || words > MAX_QUESTION_WORDS {
        return false;
    }
    !looks_like_code_prompt(question)
}

fn looks_like_code_prompt(question: &str) -> bool {
    let lower = question.to_lowercase();
    question.contains(['`', '{', '}', ';', '='])
        || ["complete the", "fill in", "write a", "write the", "type the", "what does this code"]
            .iter()
            .any(|p| lower.contains(p))
}
