// src/store/memory.rs

//! In-process implementations of the store traits.
//!
//! Used by the test suites. The answer store can be told to fail the next
//! N writes so retry and rollback paths can be exercised.

use std::{
    collections::HashMap,
    sync::{
        Mutex,
        atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicUsize, Ordering},
    },
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::{
    models::{
        attempt::{Attempt, QuestionStatus, ViolationCounts},
        exam::{ExamDefinition, Subject},
        exam_record::{LeaderboardEntry, ScoreResult},
        question::Question,
    },
    store::{AnswerStore, Catalog, ShadowCache, ShadowEntry, ShadowRecord, StoreError},
};

#[derive(Debug, Default)]
pub struct MemoryCatalog {
    exams: Mutex<HashMap<i64, (ExamDefinition, Vec<Question>)>>,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_exam(&self, exam: ExamDefinition, questions: Vec<Question>) {
        let mut exams = self.exams.lock().unwrap_or_else(|e| e.into_inner());
        exams.insert(exam.id, (exam, questions));
    }
}

#[async_trait]
impl Catalog for MemoryCatalog {
    async fn load_exam(&self, exam_id: i64) -> Result<ExamDefinition, StoreError> {
        let exams = self.exams.lock().unwrap_or_else(|e| e.into_inner());
        exams
            .get(&exam_id)
            .map(|(exam, _)| exam.clone())
            .ok_or_else(|| StoreError::NotFound(format!("exam {}", exam_id)))
    }

    async fn list_subjects(&self, exam_id: i64) -> Result<Vec<Subject>, StoreError> {
        Ok(self.load_exam(exam_id).await?.subjects)
    }

    async fn list_questions(&self, exam_id: i64) -> Result<Vec<Question>, StoreError> {
        let exams = self.exams.lock().unwrap_or_else(|e| e.into_inner());
        let (exam, questions) = exams
            .get(&exam_id)
            .ok_or_else(|| StoreError::NotFound(format!("exam {}", exam_id)))?;

        let subject_rank = |subject_id: i64| {
            exam.subject(subject_id)
                .map(|s| s.position)
                .unwrap_or(i32::MAX)
        };
        let mut ordered = questions.clone();
        ordered.sort_by_key(|q| (subject_rank(q.subject_id), q.position, q.id));
        Ok(ordered)
    }
}

#[derive(Debug)]
pub struct MemoryAnswerStore {
    attempts: Mutex<HashMap<i64, Attempt>>,
    next_id: AtomicI64,
    failing_saves: AtomicU32,
    failing_finalizes: AtomicU32,
    save_calls: AtomicUsize,
    finalize_calls: AtomicUsize,
}

impl Default for MemoryAnswerStore {
    fn default() -> Self {
        Self {
            attempts: Mutex::new(HashMap::new()),
            next_id: AtomicI64::new(1),
            failing_saves: AtomicU32::new(0),
            failing_finalizes: AtomicU32::new(0),
            save_calls: AtomicUsize::new(0),
            finalize_calls: AtomicUsize::new(0),
        }
    }
}

impl MemoryAnswerStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds an attempt as if it had been persisted earlier.
    pub fn insert_attempt(&self, attempt: Attempt) {
        self.next_id.fetch_max(attempt.id + 1, Ordering::SeqCst);
        self.lock().insert(attempt.id, attempt);
    }

    /// The next `n` answer saves fail with `Unavailable`.
    pub fn fail_next_saves(&self, n: u32) {
        self.failing_saves.store(n, Ordering::SeqCst);
    }

    /// The next `n` finalize calls fail with `Unavailable`.
    pub fn fail_next_finalizes(&self, n: u32) {
        self.failing_finalizes.store(n, Ordering::SeqCst);
    }

    pub fn save_calls(&self) -> usize {
        self.save_calls.load(Ordering::SeqCst)
    }

    /// Number of finalize calls that reached the store, failed or not.
    pub fn finalize_calls(&self) -> usize {
        self.finalize_calls.load(Ordering::SeqCst)
    }

    pub fn attempt(&self, attempt_id: i64) -> Option<Attempt> {
        self.lock().get(&attempt_id).cloned()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<i64, Attempt>> {
        self.attempts.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn take_failure(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl AnswerStore for MemoryAnswerStore {
    async fn create_attempt(
        &self,
        exam_id: i64,
        user_id: i64,
        start_time: DateTime<Utc>,
    ) -> Result<Attempt, StoreError> {
        let mut attempts = self.lock();
        if let Some(existing) = attempts
            .values()
            .find(|a| a.exam_id == exam_id && a.user_id == user_id)
        {
            return Ok(existing.clone());
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let attempt = Attempt::new(id, exam_id, user_id, start_time);
        attempts.insert(id, attempt.clone());
        Ok(attempt)
    }

    async fn load_attempt(&self, attempt_id: i64) -> Result<Attempt, StoreError> {
        self.attempt(attempt_id)
            .ok_or_else(|| StoreError::NotFound(format!("attempt {}", attempt_id)))
    }

    async fn save_answer(
        &self,
        attempt_id: i64,
        question_id: i64,
        selection: &[i64],
        status: QuestionStatus,
    ) -> Result<(), StoreError> {
        self.save_calls.fetch_add(1, Ordering::SeqCst);
        if Self::take_failure(&self.failing_saves) {
            return Err(StoreError::Unavailable("injected save failure".to_string()));
        }

        let mut attempts = self.lock();
        let attempt = attempts
            .get_mut(&attempt_id)
            .ok_or_else(|| StoreError::NotFound(format!("attempt {}", attempt_id)))?;
        if attempt.is_submitted {
            return Err(StoreError::Conflict("attempt already submitted".to_string()));
        }

        attempt.answers.insert(question_id, selection.to_vec());
        attempt.question_status.insert(question_id, status);
        Ok(())
    }

    async fn save_violations(
        &self,
        attempt_id: i64,
        counts: &ViolationCounts,
    ) -> Result<(), StoreError> {
        let mut attempts = self.lock();
        let attempt = attempts
            .get_mut(&attempt_id)
            .ok_or_else(|| StoreError::NotFound(format!("attempt {}", attempt_id)))?;
        attempt.violation_counts = *counts;
        Ok(())
    }

    async fn finalize_attempt(
        &self,
        attempt_id: i64,
        result: &ScoreResult,
    ) -> Result<(), StoreError> {
        self.finalize_calls.fetch_add(1, Ordering::SeqCst);
        if Self::take_failure(&self.failing_finalizes) {
            return Err(StoreError::Unavailable(
                "injected finalize failure".to_string(),
            ));
        }

        let mut attempts = self.lock();
        let attempt = attempts
            .get_mut(&attempt_id)
            .ok_or_else(|| StoreError::NotFound(format!("attempt {}", attempt_id)))?;

        if attempt.is_submitted {
            return match &attempt.result {
                Some(existing) if existing == result => Ok(()),
                _ => Err(StoreError::Conflict(
                    "attempt finalized with a different result".to_string(),
                )),
            };
        }

        attempt.is_submitted = true;
        attempt.result = Some(result.clone());
        Ok(())
    }

    async fn ranked_results(
        &self,
        exam_id: i64,
        limit: i64,
    ) -> Result<Vec<LeaderboardEntry>, StoreError> {
        let attempts = self.lock();
        let mut entries: Vec<LeaderboardEntry> = attempts
            .values()
            .filter(|a| a.exam_id == exam_id && a.is_submitted)
            .filter_map(|a| {
                a.result.as_ref().map(|r| LeaderboardEntry {
                    attempt_id: a.id,
                    user_id: a.user_id,
                    score: r.score,
                    earned_marks: r.earned_marks,
                    submitted_at: Some(r.submitted_at),
                })
            })
            .collect();

        entries.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| a.submitted_at.cmp(&b.submitted_at))
        });
        entries.truncate(limit.max(0) as usize);
        Ok(entries)
    }
}

#[derive(Debug, Default)]
pub struct MemoryShadowCache {
    records: Mutex<HashMap<i64, ShadowRecord>>,
    broken: AtomicBool,
}

impl MemoryShadowCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulates an unavailable local cache (all calls fail).
    pub fn set_broken(&self, broken: bool) {
        self.broken.store(broken, Ordering::SeqCst);
    }

    /// Seeds a shadow record as if left behind by an earlier session.
    pub fn seed(&self, attempt_id: i64, record: ShadowRecord) {
        let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        records.insert(attempt_id, record);
    }

    pub fn record(&self, attempt_id: i64) -> Option<ShadowRecord> {
        let records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        records.get(&attempt_id).cloned()
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.broken.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("shadow cache unavailable".to_string()));
        }
        Ok(())
    }
}

impl ShadowCache for MemoryShadowCache {
    fn read_shadow(&self, attempt_id: i64) -> Result<ShadowRecord, StoreError> {
        self.check()?;
        let records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        Ok(records.get(&attempt_id).cloned().unwrap_or_default())
    }

    fn write_shadow(
        &self,
        attempt_id: i64,
        question_id: i64,
        entry: &ShadowEntry,
    ) -> Result<(), StoreError> {
        self.check()?;
        let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        records
            .entry(attempt_id)
            .or_default()
            .insert(question_id, entry.clone());
        Ok(())
    }

    fn clear_shadow(&self, attempt_id: i64) -> Result<(), StoreError> {
        self.check()?;
        let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        records.remove(&attempt_id);
        Ok(())
    }
}
