//! Concept map data model.
//!
//! The map is a strict three-level schema: category → subconcept →
//! [`KnowledgeState`]. Ordered maps keep iteration, persistence and pivot
//! tie-breaking deterministic.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Inferred mastery of a single subconcept.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnowledgeState {
    /// How well the student understands the concept, in `[0, 1]`.
    pub understanding_level: f64,
    /// How sure the assessment is about `understanding_level`, in `[0, 1]`.
    pub confidence_in_assessment: f64,
    /// Short evidence-citing explanation.
    pub reasoning: String,
    /// When this state was last written.
    pub last_updated: DateTime<Utc>,
    /// Set when the student gave explicit, direct verbal evidence.
    ///
    /// Lifts the low-understanding confidence cap.
    #[serde(default)]
    pub explicit_evidence: bool,
}

impl KnowledgeState {
    /// Build a state with both levels clamped to `[0, 1]`.
    ///
    /// Non-finite inputs collapse to `0.0`.
    pub fn new(understanding_level: f64, confidence_in_assessment: f64, reasoning: impl Into<String>) -> Self {
        Self {
            understanding_level: clamp_unit(understanding_level),
            confidence_in_assessment: clamp_unit(confidence_in_assessment),
            reasoning: reasoning.into(),
            last_updated: Utc::now(),
            explicit_evidence: false,
        }
    }

    /// State used before any assessment has happened.
    pub fn unassessed() -> Self {
        Self::new(0.0, 0.0, "not yet assessed")
    }

    /// Builder: mark explicit verbal evidence.
    pub fn with_explicit_evidence(mut self, explicit: bool) -> Self {
        self.explicit_evidence = explicit;
        self
    }

    /// Enforce the low-understanding rule: below `level`, confidence may not
    /// exceed `cap` unless explicit evidence was recorded.
    ///
    /// Returns `true` when the confidence was lowered.
    pub fn enforce_low_understanding_cap(&mut self, level: f64, cap: f64) -> bool {
        if self.understanding_level < level
            && self.confidence_in_assessment > cap
            && !self.explicit_evidence
        {
            self.confidence_in_assessment = cap;
            return true;
        }
        false
    }
}

/// Clamp to the unit interval; NaN and infinities become `0.0`.
pub(crate) fn clamp_unit(value: f64) -> f64 {
    if value.is_finite() {
        value.clamp(0.0, 1.0)
    } else {
        0.0
    }
}

/// A named subconcept inside a category.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subconcept {
    pub name: String,
    pub knowledge_state: KnowledgeState,
}

impl Subconcept {
    pub fn new(name: impl Into<String>, knowledge_state: KnowledgeState) -> Self {
        Self {
            name: name.into(),
            knowledge_state,
        }
    }
}

/// Subconcepts of one category, keyed by name.
pub type CategoryConcepts = BTreeMap<String, Subconcept>;

/// The per-session model of student mastery.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConceptMap {
    categories: BTreeMap<String, CategoryConcepts>,
}

impl ConceptMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a map from a curriculum with every subconcept unassessed.
    pub fn from_curriculum(curriculum: &BTreeMap<String, Vec<String>>) -> Self {
        let mut map = Self::new();
        for (category, subconcepts) in curriculum {
            map.seed_category(category, subconcepts);
        }
        map
    }

    /// Add a category with unassessed subconcepts, keeping any that already exist.
    pub fn seed_category(&mut self, category: &str, subconcepts: &[String]) {
        let entry = self.categories.entry(category.to_owned()).or_default();
        for name in subconcepts {
            entry
                .entry(name.clone())
                .or_insert_with(|| Subconcept::new(name.clone(), KnowledgeState::unassessed()));
        }
    }

    pub fn categories(&self) -> impl Iterator<Item = (&String, &CategoryConcepts)> {
        self.categories.iter()
    }

    pub fn category(&self, name: &str) -> Option<&CategoryConcepts> {
        self.categories.get(name)
    }

    pub fn subconcept(&self, category: &str, name: &str) -> Option<&Subconcept> {
        self.categories.get(category)?.get(name)
    }

    pub fn len(&self) -> usize {
        self.categories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.categories.is_empty()
    }

    /// Minimum assessment confidence across a category's subconcepts.
    ///
    /// `None` for an unknown or empty category.
    pub fn min_confidence(&self, category: &str) -> Option<f64> {
        self.categories
            .get(category)?
            .values()
            .map(|s| s.knowledge_state.confidence_in_assessment)
            .reduce(f64::min)
    }

    /// Whether every subconcept of `category` is at or above `threshold`.
    ///
    /// Empty categories are vacuously settled.
    pub fn is_category_settled(&self, category: &str, threshold: f64) -> bool {
        self.min_confidence(category).is_none_or(|min| min >= threshold)
    }

    /// Categories whose minimum confidence is still below `threshold`.
    pub fn categories_needing_assessment(&self, threshold: f64) -> Vec<String> {
        self.categories
            .keys()
            .filter(|name| !self.is_category_settled(name, threshold))
            .cloned()
            .collect()
    }

    /// Whether every category is settled at `threshold`.
    pub fn all_confident(&self, threshold: f64) -> bool {
        self.categories
            .keys()
            .all(|name| self.is_category_settled(name, threshold))
    }

    /// Replace one category wholesale. Other categories are untouched.
    pub fn replace_category(&mut self, category: &str, subconcepts: CategoryConcepts) {
        self.categories.insert(category.to_owned(), subconcepts);
    }

    /// Re-establish the numeric invariants on every state.
    ///
    /// Used at trust boundaries (loading a stored map). Returns the number of
    /// states that had to be adjusted.
    pub fn normalize(&mut self, low_level: f64, cap: f64) -> usize {
        let mut adjusted = 0;
        for subs in self.categories.values_mut() {
            for (name, sub) in subs.iter_mut() {
                let state = &mut sub.knowledge_state;
                let before = (state.understanding_level, state.confidence_in_assessment);
                state.understanding_level = clamp_unit(state.understanding_level);
                state.confidence_in_assessment = clamp_unit(state.confidence_in_assessment);
                state.enforce_low_understanding_cap(low_level, cap);
                if before != (state.understanding_level, state.confidence_in_assessment)
                    || sub.name != *name
                {
                    sub.name = name.clone();
                    adjusted += 1;
                }
            }
        }
        adjusted
    }
}

/// A ranked candidate for the next probing question.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PivotEntry {
    pub concept: String,
    pub category: String,
    pub confidence: f64,
}
