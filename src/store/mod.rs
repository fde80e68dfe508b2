// src/store/mod.rs

//! Collaborators the session engine talks to: the read-only catalog, the
//! durable answer store and the ephemeral shadow cache.

pub mod memory;
pub mod postgres;
pub mod shadow;

use std::{collections::HashMap, fmt};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{
    attempt::{Attempt, QuestionStatus, ViolationCounts},
    exam::{ExamDefinition, Subject},
    exam_record::{LeaderboardEntry, ScoreResult},
    question::Question,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Network or backend failure. Worth retrying.
    Unavailable(String),
    NotFound(String),
    /// The write contradicts the stored record (e.g. attempt already final).
    Conflict(String),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::Unavailable(msg) => write!(f, "store unavailable: {}", msg),
            StoreError::NotFound(msg) => write!(f, "not found: {}", msg),
            StoreError::Conflict(msg) => write!(f, "conflict: {}", msg),
        }
    }
}

impl std::error::Error for StoreError {}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => StoreError::NotFound("row not found".to_string()),
            other => StoreError::Unavailable(other.to_string()),
        }
    }
}

/// Read-only exam catalog. Queried once per session.
#[async_trait]
pub trait Catalog: Send + Sync {
    async fn load_exam(&self, exam_id: i64) -> Result<ExamDefinition, StoreError>;

    async fn list_subjects(&self, exam_id: i64) -> Result<Vec<Subject>, StoreError>;

    /// Questions ordered by subject position, then question position.
    async fn list_questions(&self, exam_id: i64) -> Result<Vec<Question>, StoreError>;
}

/// System of record for attempts.
#[async_trait]
pub trait AnswerStore: Send + Sync {
    /// Creates the learner's attempt, or returns the existing one.
    async fn create_attempt(
        &self,
        exam_id: i64,
        user_id: i64,
        start_time: DateTime<Utc>,
    ) -> Result<Attempt, StoreError>;

    async fn load_attempt(&self, attempt_id: i64) -> Result<Attempt, StoreError>;

    /// Writes one question's stored selection and status together.
    /// Rejected with `Conflict` once the attempt is submitted.
    async fn save_answer(
        &self,
        attempt_id: i64,
        question_id: i64,
        selection: &[i64],
        status: QuestionStatus,
    ) -> Result<(), StoreError>;

    async fn save_violations(
        &self,
        attempt_id: i64,
        counts: &ViolationCounts,
    ) -> Result<(), StoreError>;

    /// Flags the attempt submitted with its result attached.
    /// Repeating the call with the same result succeeds.
    async fn finalize_attempt(
        &self,
        attempt_id: i64,
        result: &ScoreResult,
    ) -> Result<(), StoreError>;

    /// Finalized attempts of one exam, best score first.
    async fn ranked_results(
        &self,
        exam_id: i64,
        limit: i64,
    ) -> Result<Vec<LeaderboardEntry>, StoreError>;
}

/// Shadow copy of one question, kept for crash recovery.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShadowEntry {
    /// The stored (score-bearing) selection.
    pub selection: Vec<i64>,
    #[serde(default)]
    pub visited: bool,
    #[serde(default)]
    pub review: bool,
    /// Selection hidden behind a review mark, for redisplay.
    #[serde(default)]
    pub retained: Option<Vec<i64>>,
}

pub type ShadowRecord = HashMap<i64, ShadowEntry>;

/// Number of shadowed questions carrying a counted answer.
pub fn shadow_answer_count(record: &ShadowRecord) -> usize {
    record.values().filter(|e| !e.selection.is_empty()).count()
}

/// Loss-tolerant local cache, scoped per attempt. Synchronous but fallible.
pub trait ShadowCache: Send + Sync {
    fn read_shadow(&self, attempt_id: i64) -> Result<ShadowRecord, StoreError>;

    fn write_shadow(
        &self,
        attempt_id: i64,
        question_id: i64,
        entry: &ShadowEntry,
    ) -> Result<(), StoreError>;

    fn clear_shadow(&self, attempt_id: i64) -> Result<(), StoreError>;
}
