// src/engine/session.rs

//! Session controller: the state machine that owns one attempt from load to
//! submission.
//!
//! `Loading -> Active -> Submitting -> Submitted`. The move out of `Active`
//! is guarded by a single latch, so whichever of learner request, deadline
//! expiry or violation breach fires first wins and the rest are no-ops.

use std::{collections::HashMap, sync::Arc};

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tokio::sync::broadcast;

use crate::{
    config::EngineConfig,
    engine::{
        clock::{Clock, DeadlineClock},
        error::EngineError,
        events::SessionEvent,
        ledger::{AnswerLedger, RecoveryReport},
        retry::{Backoff, with_retry},
        scorer,
        violation::{MonitorOutcome, Signal, ViolationMonitor, ViolationWarning},
    },
    models::{
        attempt::{Attempt, QuestionStatus, ViolationCounts},
        exam::ExamDefinition,
        exam_record::{ScoreResult, SubmissionCause},
        question::{Question, QuestionType},
    },
    store::{AnswerStore, Catalog, ShadowCache, StoreError},
};

const EVENT_BUFFER: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Loading,
    Active,
    Submitting,
    Submitted,
}

/// Client-side state that never affects scoring.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AdvisoryFlags {
    pub within_distraction_free_mode: bool,
    pub violation_warning_visible: bool,
}

/// UI affordances re-derived from the controller on every publish, so the
/// client never has to be trusted to keep them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Affordances {
    pub can_edit: bool,
    pub can_submit: bool,
    pub navigation_locked: bool,
    pub prompt_fullscreen: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub attempt_id: i64,
    pub exam_id: i64,
    pub phase: Phase,
    pub deadline: DateTime<Utc>,
    pub remaining_seconds: i64,
    pub question_status: HashMap<i64, QuestionStatus>,
    /// Last selection per question, including ones hidden by a review mark.
    pub selections: HashMap<i64, Vec<i64>>,
    pub violation_counts: ViolationCounts,
    pub violation_threshold: u32,
    pub flags: AdvisoryFlags,
    pub warning: Option<ViolationWarning>,
    /// Question whose last save was rolled back and should be retried.
    pub unsaved_question: Option<i64>,
    pub affordances: Affordances,
    pub cause: Option<SubmissionCause>,
    pub result: Option<ScoreResult>,
}

/// Collaborators a session is built from.
#[derive(Clone)]
pub struct SessionDeps {
    pub catalog: Arc<dyn Catalog>,
    pub store: Arc<dyn AnswerStore>,
    pub cache: Arc<dyn ShadowCache>,
    pub clock: Arc<dyn Clock>,
}

pub struct SessionController {
    attempt_id: i64,
    exam_id: i64,
    user_id: i64,
    exam: ExamDefinition,
    questions: Vec<Question>,
    question_index: HashMap<i64, usize>,

    phase: Phase,
    deadline: DeadlineClock,
    monitor: ViolationMonitor,
    ledger: AnswerLedger,

    store: Arc<dyn AnswerStore>,
    cache: Arc<dyn ShadowCache>,
    clock: Arc<dyn Clock>,
    config: EngineConfig,

    flags: AdvisoryFlags,
    warning: Option<ViolationWarning>,
    unsaved_question: Option<i64>,

    submission_latch: bool,
    cause: Option<SubmissionCause>,
    pending: Option<ScoreResult>,
    result: Option<ScoreResult>,
    finalize_failures: u32,

    events: broadcast::Sender<SessionEvent>,
}

impl SessionController {
    /// Loads the attempt and catalog, reconciles answers and activates.
    ///
    /// A session resumed after its deadline (or with a violation counter
    /// already at threshold) comes back in `Submitting`.
    pub async fn open(
        attempt_id: i64,
        user_id: i64,
        deps: &SessionDeps,
        config: EngineConfig,
    ) -> Result<Self, EngineError> {
        let backoff = Backoff::from_config(&config);
        let attempt = with_retry(
            "load attempt",
            config.save_retries,
            backoff,
            config.store_timeout,
            || deps.store.load_attempt(attempt_id),
        )
        .await?;

        if attempt.user_id != user_id {
            return Err(EngineError::Forbidden(format!(
                "attempt {} belongs to another learner",
                attempt_id
            )));
        }
        if attempt.is_submitted {
            return Err(EngineError::InvalidState(format!(
                "attempt {} is already submitted",
                attempt_id
            )));
        }

        let exam = deps.catalog.load_exam(attempt.exam_id).await?;
        let questions = deps.catalog.list_questions(attempt.exam_id).await?;
        tracing::info!(
            "Loading session for attempt {} (exam {}, {} questions)",
            attempt_id,
            exam.id,
            questions.len()
        );

        let question_index = questions
            .iter()
            .enumerate()
            .map(|(i, q)| (q.id, i))
            .collect();
        let orientation_grace = Duration::from_std(config.orientation_grace)
            .unwrap_or_else(|_| Duration::milliseconds(1500));
        let (events, _) = broadcast::channel(EVENT_BUFFER);

        let mut controller = Self {
            attempt_id,
            exam_id: attempt.exam_id,
            user_id,
            deadline: DeadlineClock::new(attempt.start_time, exam.duration_seconds),
            monitor: ViolationMonitor::new(
                attempt.violation_counts,
                config.violation_threshold,
                orientation_grace,
            ),
            ledger: AnswerLedger::new(
                attempt_id,
                Arc::clone(&deps.store),
                Arc::clone(&deps.cache),
                &config,
            ),
            exam,
            questions,
            question_index,
            phase: Phase::Loading,
            store: Arc::clone(&deps.store),
            cache: Arc::clone(&deps.cache),
            clock: Arc::clone(&deps.clock),
            config,
            flags: AdvisoryFlags::default(),
            warning: None,
            unsaved_question: None,
            submission_latch: false,
            cause: None,
            pending: None,
            result: None,
            finalize_failures: 0,
            events,
        };

        controller.activate(&attempt).await;
        Ok(controller)
    }

    async fn activate(&mut self, attempt: &Attempt) -> RecoveryReport {
        let index = &self.question_index;
        let report = self
            .ledger
            .recover(attempt, |q| index.contains_key(&q))
            .await;
        if report.cache_won {
            tracing::warn!(
                "Attempt {} recovered from local cache: {} replayed, {} failed",
                self.attempt_id,
                report.replayed,
                report.failed
            );
        }

        self.phase = Phase::Active;
        let now = self.clock.now();
        tracing::info!(
            "Session for attempt {} active, {}s remaining",
            self.attempt_id,
            self.deadline.remaining_seconds(now)
        );
        self.emit(SessionEvent::Activated {
            attempt_id: self.attempt_id,
            remaining_seconds: self.deadline.remaining_seconds(now),
        });

        if self.deadline.is_overdue(now) {
            tracing::warn!(
                "Attempt {} resumed {}s past its deadline; submitting",
                self.attempt_id,
                (now - self.deadline.deadline()).num_seconds()
            );
        }
        self.poll_deadline();

        if let Some(kind) = self.monitor.take_breach() {
            tracing::warn!(
                "Attempt {} resumed with {:?} violations at threshold; submitting",
                self.attempt_id,
                kind
            );
            self.emit(SessionEvent::ForceSubmit { kind });
            self.begin_submission(SubmissionCause::Violation { kind });
        }

        report
    }

    pub fn attempt_id(&self) -> i64 {
        self.attempt_id
    }

    pub fn exam_id(&self) -> i64 {
        self.exam_id
    }

    pub fn user_id(&self) -> i64 {
        self.user_id
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn exam(&self) -> &ExamDefinition {
        &self.exam
    }

    pub fn questions(&self) -> &[Question] {
        &self.questions
    }

    pub fn status(&self, question_id: i64) -> QuestionStatus {
        self.ledger.status(question_id)
    }

    pub fn stored_answer(&self, question_id: i64) -> &[i64] {
        self.ledger.stored_answer(question_id)
    }

    pub fn display_selection(&self, question_id: i64) -> Option<&[i64]> {
        self.ledger.display_selection(question_id)
    }

    pub fn violation_counts(&self) -> ViolationCounts {
        self.monitor.counts()
    }

    pub fn remaining_seconds(&self) -> i64 {
        self.deadline.remaining_seconds(self.clock.now())
    }

    pub fn finalize_failures(&self) -> u32 {
        self.finalize_failures
    }

    pub fn result(&self) -> Option<&ScoreResult> {
        self.result.as_ref()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub fn event_sender(&self) -> broadcast::Sender<SessionEvent> {
        self.events.clone()
    }

    pub async fn visit(&mut self, question_id: i64) -> Result<QuestionStatus, EngineError> {
        self.ensure_active()?;
        self.question(question_id)?;
        let result = self.ledger.visit(question_id).await;
        self.track_save(question_id, result)
    }

    pub async fn set_answer(
        &mut self,
        question_id: i64,
        mut selection: Vec<i64>,
    ) -> Result<QuestionStatus, EngineError> {
        self.ensure_active()?;
        let question = self.question(question_id)?;
        question
            .check_selection(&selection)
            .map_err(EngineError::BadRequest)?;
        if question.question_type == QuestionType::Multiple {
            selection.sort_unstable();
        }

        let result = self.ledger.set_answer(question_id, selection).await;
        self.track_save(question_id, result)
    }

    pub async fn reset_answer(&mut self, question_id: i64) -> Result<QuestionStatus, EngineError> {
        self.ensure_active()?;
        self.question(question_id)?;
        let result = self.ledger.reset_answer(question_id).await;
        self.track_save(question_id, result)
    }

    pub async fn toggle_review(&mut self, question_id: i64) -> Result<QuestionStatus, EngineError> {
        self.ensure_active()?;
        self.question(question_id)?;
        let result = self.ledger.toggle_review(question_id).await;
        self.track_save(question_id, result)
    }

    /// Feeds an environment signal to the violation monitor.
    pub async fn observe_signal(&mut self, signal: Signal) -> MonitorOutcome {
        self.poll_deadline();
        if self.phase != Phase::Active {
            self.monitor.disarm();
        }

        let outcome = self.monitor.observe(&signal, self.clock.now());

        if let Some(fullscreen) = outcome.fullscreen {
            self.flags.within_distraction_free_mode = fullscreen;
        }

        if let Some(warning) = outcome.warning {
            tracing::warn!(
                "Attempt {} violation {:?} ({}/{})",
                self.attempt_id,
                warning.kind,
                warning.count,
                warning.threshold
            );
            self.warning = Some(warning);
            self.flags.violation_warning_visible = true;
            self.emit(SessionEvent::Warning(warning));
            self.persist_violations().await;
        }

        if outcome.restore_distraction_free_mode {
            self.emit(SessionEvent::RestoreDistractionFreeMode);
        }

        if let Some(kind) = outcome.force_submit {
            self.emit(SessionEvent::ForceSubmit { kind });
            self.begin_submission(SubmissionCause::Violation { kind });
        }

        outcome
    }

    pub fn dismiss_warning(&mut self) {
        self.flags.violation_warning_visible = false;
    }

    /// Clock tick. Returns true on the tick that expired the deadline.
    pub fn tick(&mut self) -> bool {
        self.poll_deadline()
    }

    /// Re-asserts what the phase implies: the deadline is re-polled, and
    /// outside `Active` the ledger stays sealed and the monitor disarmed.
    /// Returns true when something had drifted and was put back.
    pub fn reconcile(&mut self) -> bool {
        let mut corrected = self.poll_deadline();
        if self.phase == Phase::Active {
            return corrected;
        }

        if !self.ledger.is_sealed() {
            tracing::warn!(
                "Ledger of attempt {} was writable in {:?}; sealing",
                self.attempt_id,
                self.phase
            );
            self.ledger.seal();
            corrected = true;
        }
        if self.monitor.is_armed() {
            tracing::warn!(
                "Monitor of attempt {} was armed in {:?}; disarming",
                self.attempt_id,
                self.phase
            );
            self.monitor.disarm();
            corrected = true;
        }
        if self.phase == Phase::Submitting && self.pending.is_none() {
            tracing::error!(
                "Attempt {} is submitting without a computed result",
                self.attempt_id
            );
        }
        corrected
    }

    /// Learner-confirmed submission. Returns false when another trigger
    /// already started the submission.
    pub fn request_submit(&mut self) -> Result<bool, EngineError> {
        self.poll_deadline();
        match self.phase {
            Phase::Loading => Err(EngineError::InvalidState(
                "session is still loading".to_string(),
            )),
            Phase::Active => Ok(self.begin_submission(SubmissionCause::Learner)),
            Phase::Submitting | Phase::Submitted => Ok(false),
        }
    }

    /// The submission latch. Scores the current answer sheet once and moves
    /// to `Submitting`. Every later call is a no-op.
    pub fn begin_submission(&mut self, cause: SubmissionCause) -> bool {
        if self.submission_latch || self.phase != Phase::Active {
            return false;
        }
        self.submission_latch = true;

        self.monitor.disarm();
        self.ledger.seal();
        self.phase = Phase::Submitting;
        self.cause = Some(cause);

        let result = scorer::score_attempt(
            &self.exam,
            &self.questions,
            &self.ledger.answers(),
            &self.ledger.statuses(),
            cause,
            self.clock.now(),
        );
        tracing::info!(
            "Attempt {} submitting ({:?}): {:.2}/{:.2} marks",
            self.attempt_id,
            cause,
            result.earned_marks,
            result.total_marks
        );
        self.pending = Some(result);
        self.emit(SessionEvent::SubmissionStarted { cause });
        true
    }

    /// Writes the computed result to the store. On failure the session stays
    /// in `Submitting` with the same result, ready for another try.
    pub async fn finalize(&mut self) -> Result<ScoreResult, EngineError> {
        match self.phase {
            Phase::Submitted => {
                return self.result.clone().ok_or_else(|| {
                    EngineError::InvalidState("submitted without a result".to_string())
                });
            }
            Phase::Submitting => {}
            Phase::Loading | Phase::Active => {
                return Err(EngineError::InvalidState(
                    "no submission in progress".to_string(),
                ));
            }
        }

        let pending = self.pending.clone().ok_or_else(|| {
            EngineError::InvalidState("submitting without a computed result".to_string())
        })?;

        let written = match tokio::time::timeout(
            self.config.store_timeout,
            self.store.finalize_attempt(self.attempt_id, &pending),
        )
        .await
        {
            Ok(written) => written,
            Err(_) => Err(StoreError::Unavailable("finalize timed out".to_string())),
        };

        match written {
            Ok(()) => Ok(self.complete(pending)),
            Err(StoreError::Conflict(msg)) => {
                // Finalized elsewhere with another payload; adopt what the store holds.
                tracing::warn!(
                    "Attempt {} was finalized concurrently: {}",
                    self.attempt_id,
                    msg
                );
                let stored = self.store.load_attempt(self.attempt_id).await?;
                match stored.result {
                    Some(result) if stored.is_submitted => Ok(self.complete(result)),
                    _ => Err(EngineError::InvalidState(msg)),
                }
            }
            Err(e) => {
                self.finalize_failures += 1;
                tracing::error!(
                    "Finalize failed for attempt {} (failure {}): {}",
                    self.attempt_id,
                    self.finalize_failures,
                    e
                );
                self.emit(SessionEvent::FinalizeFailed {
                    error: e.to_string(),
                });
                Err(e.into())
            }
        }
    }

    /// Stops timers and monitors. The controller accepts nothing afterwards.
    pub fn teardown(&mut self) {
        self.monitor.disarm();
        self.ledger.seal();
        self.emit(SessionEvent::TornDown);
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let now = self.clock.now();
        let active = self.phase == Phase::Active;

        SessionSnapshot {
            attempt_id: self.attempt_id,
            exam_id: self.exam_id,
            phase: self.phase,
            deadline: self.deadline.deadline(),
            remaining_seconds: if active {
                self.deadline.remaining_seconds(now)
            } else {
                0
            },
            question_status: self.ledger.statuses(),
            selections: self.ledger.display_selections(),
            violation_counts: self.monitor.counts(),
            violation_threshold: self.monitor.threshold(),
            flags: self.flags,
            warning: self.warning,
            unsaved_question: self.unsaved_question,
            affordances: Affordances {
                can_edit: active,
                can_submit: active,
                navigation_locked: active,
                prompt_fullscreen: active && !self.flags.within_distraction_free_mode,
            },
            cause: self.cause,
            result: self.result.clone(),
        }
    }

    fn complete(&mut self, result: ScoreResult) -> ScoreResult {
        self.phase = Phase::Submitted;
        self.pending = None;
        self.result = Some(result.clone());

        if let Err(e) = self.cache.clear_shadow(self.attempt_id) {
            tracing::warn!(
                "Could not purge shadow cache for attempt {}: {}",
                self.attempt_id,
                e
            );
        }

        tracing::info!(
            "Attempt {} submitted: score {:.2}%",
            self.attempt_id,
            result.score
        );
        self.emit(SessionEvent::Submitted {
            result: result.clone(),
        });
        result
    }

    /// Re-derives the deadline from the wall clock.
    fn poll_deadline(&mut self) -> bool {
        if self.phase != Phase::Active {
            return false;
        }
        if self.deadline.tick(self.clock.now()).is_none() {
            return false;
        }
        tracing::info!("Attempt {} reached its deadline", self.attempt_id);
        self.emit(SessionEvent::DeadlineExpired);
        self.begin_submission(SubmissionCause::Deadline);
        true
    }

    fn ensure_active(&mut self) -> Result<(), EngineError> {
        self.poll_deadline();
        match self.phase {
            Phase::Active => Ok(()),
            Phase::Loading => Err(EngineError::InvalidState(
                "session is still loading".to_string(),
            )),
            Phase::Submitting => Err(EngineError::InvalidState(
                "attempt is being submitted".to_string(),
            )),
            Phase::Submitted => Err(EngineError::InvalidState(
                "attempt is already submitted".to_string(),
            )),
        }
    }

    fn question(&self, question_id: i64) -> Result<&Question, EngineError> {
        self.question_index
            .get(&question_id)
            .map(|&i| &self.questions[i])
            .ok_or_else(|| {
                EngineError::NotFound(format!(
                    "question {} is not part of exam {}",
                    question_id, self.exam_id
                ))
            })
    }

    fn track_save(
        &mut self,
        question_id: i64,
        result: Result<QuestionStatus, EngineError>,
    ) -> Result<QuestionStatus, EngineError> {
        match &result {
            Ok(_) => {
                if self.unsaved_question == Some(question_id) {
                    self.unsaved_question = None;
                }
            }
            Err(EngineError::TransientStore(msg)) => {
                self.unsaved_question = Some(question_id);
                self.emit(SessionEvent::SaveFailed {
                    question_id,
                    error: msg.clone(),
                });
            }
            Err(_) => {}
        }
        result
    }

    async fn persist_violations(&self) {
        let counts = self.monitor.counts();
        let saved = tokio::time::timeout(
            self.config.store_timeout,
            self.store.save_violations(self.attempt_id, &counts),
        )
        .await;
        match saved {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!(
                "Could not persist violation counts for attempt {}: {}",
                self.attempt_id,
                e
            ),
            Err(_) => tracing::warn!(
                "Persisting violation counts for attempt {} timed out",
                self.attempt_id
            ),
        }
    }

    fn emit(&self, event: SessionEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}
