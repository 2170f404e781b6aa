//! Incremental knowledge tracking across a session.
//!
//! Each accepted utterance triggers one pass: every unsettled category is
//! reassessed concurrently, the results are merged, the pivot queue is
//! rebuilt and the snapshot is saved. At most one pass runs at a time.

use super::assessor::{CategoryAssessment, CategoryAssessor};
use super::pivot::{PivotQuestionGenerator, PivotQuestions, build_pivot_queue};
use super::types::{ConceptMap, PivotEntry};
use crate::config::KnowledgeConfig;
use crate::llm::CompletionBackend;
use crate::runtime::RuntimeEvent;
use crate::session::state::{Message, TaskContext};
use crate::store::{ConceptStore, SessionSnapshot};
use chrono::Utc;
use futures_util::future::join_all;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{Mutex as AsyncMutex, broadcast};
use tracing::{debug, info, warn};

/// Why an utterance was not processed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// Same text as the previously accepted utterance.
    Duplicate,
    /// Another pass is still running.
    InFlight,
}

/// Summary of a completed pass.
#[derive(Debug, Clone, PartialEq)]
pub struct PassSummary {
    /// Categories that were sent for assessment.
    pub assessed: Vec<String>,
    /// Subset of `assessed` whose call failed.
    pub failed: Vec<String>,
    pub confidence_reached: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ProcessOutcome {
    Applied(PassSummary),
    Dropped(DropReason),
}

/// How [`KnowledgeTracker::initialize`] obtained the concept map.
#[derive(Debug, Clone, PartialEq)]
pub enum InitOutcome {
    /// Loaded from the store, with the saved conversation history.
    Restored { history: Vec<Message> },
    Calibrated(PassSummary),
}

#[derive(Debug, Default)]
struct TrackerState {
    map: ConceptMap,
    pivot_queue: Vec<PivotEntry>,
    pivot_questions: Option<PivotQuestions>,
    confidence_reached: bool,
    reached_announced: bool,
    last_accepted: Option<String>,
}

/// Owns the session's concept map.
pub struct KnowledgeTracker {
    session_id: String,
    config: KnowledgeConfig,
    assessor: CategoryAssessor,
    questions: Option<PivotQuestionGenerator>,
    store: Arc<dyn ConceptStore>,
    events: broadcast::Sender<RuntimeEvent>,
    state: Mutex<TrackerState>,
    /// Held for the whole of a pass.
    in_flight: AsyncMutex<()>,
}

impl KnowledgeTracker {
    pub fn new(
        session_id: impl Into<String>,
        config: KnowledgeConfig,
        backend: Arc<dyn CompletionBackend>,
        store: Arc<dyn ConceptStore>,
        events: broadcast::Sender<RuntimeEvent>,
    ) -> Self {
        let assessor = CategoryAssessor::new(Arc::clone(&backend), &config);
        let questions = config
            .pivot_questions
            .then(|| PivotQuestionGenerator::new(backend));
        let state = TrackerState {
            map: ConceptMap::from_curriculum(&config.categories),
            ..TrackerState::default()
        };
        Self {
            session_id: session_id.into(),
            config,
            assessor,
            questions,
            store,
            events,
            state: Mutex::new(state),
            in_flight: AsyncMutex::new(()),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn concept_map(&self) -> ConceptMap {
        self.lock_state().map.clone()
    }

    pub fn pivot_queue(&self) -> Vec<PivotEntry> {
        self.lock_state().pivot_queue.clone()
    }

    pub fn pivot_questions(&self) -> Option<PivotQuestions> {
        self.lock_state().pivot_questions.clone()
    }

    pub fn confidence_reached(&self) -> bool {
        self.lock_state().confidence_reached
    }

    /// Load the saved map, or calibrate when there is none.
    ///
    /// Store failures are logged and fall through to calibration.
    pub async fn initialize(&self) -> InitOutcome {
        let store = Arc::clone(&self.store);
        let session_id = self.session_id.clone();
        let loaded = tokio::task::spawn_blocking(move || store.load(&session_id)).await;

        let snapshot = match loaded {
            Ok(Ok(snapshot)) => snapshot,
            Ok(Err(e)) => {
                warn!(session = %self.session_id, error = %e, "could not load concept map");
                None
            }
            Err(e) => {
                warn!(session = %self.session_id, error = %e, "concept map load task failed");
                None
            }
        };

        match snapshot {
            Some(snapshot) => {
                let history = snapshot.history.clone();
                self.restore(snapshot);
                InitOutcome::Restored { history }
            }
            None => InitOutcome::Calibrated(self.calibrate(&[], &TaskContext::default()).await),
        }
    }

    fn restore(&self, snapshot: SessionSnapshot) {
        let mut map = snapshot.concept_map;
        let adjusted = map.normalize(
            self.config.low_understanding_level,
            self.config.low_understanding_confidence_cap,
        );
        if adjusted > 0 {
            warn!(adjusted, "stored concept map needed normalization");
        }
        for (category, subconcepts) in &self.config.categories {
            map.seed_category(category, subconcepts);
        }

        let threshold = self.config.confidence_threshold;
        let queue = build_pivot_queue(&map, threshold, self.config.pivot_queue_size);
        let reached = !map.is_empty() && map.all_confident(threshold);
        {
            let mut state = self.lock_state();
            state.map = map.clone();
            state.pivot_queue = queue.clone();
            state.confidence_reached = reached;
            state.reached_announced = reached || snapshot.confidence_reached;
        }
        info!(
            session = %self.session_id,
            categories = map.len(),
            confidence_reached = reached,
            "concept map restored"
        );
        self.emit(RuntimeEvent::ConceptMapUpdated { map });
        self.emit(RuntimeEvent::PivotQueueUpdated { queue });
    }

    /// Assess every category from scratch.
    ///
    /// Waits for an in-flight pass rather than being dropped, since a
    /// session has no usable map until calibration completes.
    pub async fn calibrate(&self, history: &[Message], task: &TaskContext) -> PassSummary {
        let guard = self.in_flight.lock().await;

        let map = self.concept_map();
        let categories: Vec<String> = map.categories().map(|(name, _)| name.clone()).collect();
        info!(session = %self.session_id, categories = categories.len(), "calibrating");
        let summary = self.run_pass(map, categories, history, task).await;
        drop(guard);
        summary
    }

    /// Update the map from one finalized utterance.
    ///
    /// Dropped when `text` repeats the previously accepted utterance or
    /// another pass is still running.
    pub async fn process_utterance(
        &self,
        text: &str,
        history: &[Message],
        task: &TaskContext,
    ) -> ProcessOutcome {
        let text = text.trim();
        if self.lock_state().last_accepted.as_deref() == Some(text) {
            debug!("dropping duplicate utterance");
            return ProcessOutcome::Dropped(DropReason::Duplicate);
        }
        let Ok(guard) = self.in_flight.try_lock() else {
            debug!("dropping utterance, assessment pass in flight");
            return ProcessOutcome::Dropped(DropReason::InFlight);
        };
        self.lock_state().last_accepted = Some(text.to_owned());

        let map = self.concept_map();
        let pending = map.categories_needing_assessment(self.config.confidence_threshold);
        if pending.is_empty() {
            debug!("all categories settled, nothing to assess");
            let (pivot_queue, confidence_reached) = {
                let state = self.lock_state();
                (state.pivot_queue.clone(), state.confidence_reached)
            };
            self.save(SessionSnapshot {
                session_id: self.session_id.clone(),
                concept_map: map,
                history: history.to_vec(),
                pivot_queue,
                confidence_reached,
                saved_at: Utc::now(),
            })
            .await;
            drop(guard);
            return ProcessOutcome::Applied(PassSummary {
                assessed: Vec::new(),
                failed: Vec::new(),
                confidence_reached,
            });
        }

        let summary = self.run_pass(map, pending, history, task).await;
        drop(guard);
        ProcessOutcome::Applied(summary)
    }

    async fn run_pass(
        &self,
        mut map: ConceptMap,
        categories: Vec<String>,
        history: &[Message],
        task: &TaskContext,
    ) -> PassSummary {
        let calls = categories.iter().filter_map(|category| {
            let current = map.category(category)?.clone();
            Some(async move {
                self.assessor
                    .assess(category, &current, history, task)
                    .await
            })
        });
        let results: Vec<CategoryAssessment> = join_all(calls).await;

        let mut failed = Vec::new();
        for result in results {
            if result.is_failed() {
                failed.push(result.category.clone());
            }
            map.replace_category(&result.category, result.subconcepts);
        }

        let threshold = self.config.confidence_threshold;
        let reached = !map.is_empty() && map.all_confident(threshold);
        let queue = build_pivot_queue(&map, threshold, self.config.pivot_queue_size);

        let announce = {
            let mut state = self.lock_state();
            state.map = map.clone();
            state.pivot_queue = queue.clone();
            state.confidence_reached = reached;
            let announce = reached && !state.reached_announced;
            if announce {
                state.reached_announced = true;
            }
            announce
        };

        if announce {
            info!(session = %self.session_id, "confidence threshold reached in every category");
            self.emit(RuntimeEvent::ConfidenceReached);
        }
        self.emit(RuntimeEvent::ConceptMapUpdated { map: map.clone() });
        self.emit(RuntimeEvent::PivotQueueUpdated {
            queue: queue.clone(),
        });

        if let Some(generator) = &self.questions {
            let questions = match queue.first() {
                Some(target) => generator.generate(target).await,
                None => None,
            };
            self.lock_state().pivot_questions = questions.clone();
            if let Some(questions) = questions {
                self.emit(RuntimeEvent::PivotQuestionsUpdated { questions });
            }
        }

        self.save(SessionSnapshot {
            session_id: self.session_id.clone(),
            concept_map: map,
            history: history.to_vec(),
            pivot_queue: queue,
            confidence_reached: reached,
            saved_at: Utc::now(),
        })
        .await;

        debug!(
            assessed = categories.len(),
            failed = failed.len(),
            "assessment pass complete"
        );
        PassSummary {
            assessed: categories,
            failed,
            confidence_reached: reached,
        }
    }

    async fn save(&self, snapshot: SessionSnapshot) {
        let store = Arc::clone(&self.store);
        match tokio::task::spawn_blocking(move || store.save(&snapshot)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(session = %self.session_id, error = %e, "concept map save failed"),
            Err(e) => warn!(session = %self.session_id, error = %e, "concept map save task failed"),
        }
    }

    fn emit(&self, event: RuntimeEvent) {
        let _ = self.events.send(event);
    }

    fn lock_state(&self) -> MutexGuard<'_, TrackerState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
