//! Knowledge tracking: per-concept understanding estimates, category
//! assessment and the pivot queue of least certain concepts.

pub mod assessor;
pub mod pivot;
pub mod tracker;
pub mod types;

pub use pivot::{PivotQuestions, build_pivot_queue};
pub use tracker::{InitOutcome, KnowledgeTracker, ProcessOutcome};
pub use types::{ConceptMap, KnowledgeState, PivotEntry, Subconcept};
