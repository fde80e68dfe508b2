// src/models/exam_record.rs

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::attempt::ViolationKind;

/// Why an attempt left the active state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "by", rename_all = "snake_case")]
pub enum SubmissionCause {
    /// The learner confirmed submission.
    Learner,
    /// The exam duration ran out.
    Deadline,
    /// A violation counter reached its threshold.
    Violation { kind: ViolationKind },
}

/// Graded outcome of an attempt. Written once, at submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreResult {
    /// Percentage of total marks earned.
    pub score: f64,
    pub earned_marks: f64,
    pub total_marks: f64,
    pub subjects: Vec<SubjectScore>,
    pub cause: SubmissionCause,
    pub submitted_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubjectScore {
    pub subject_id: i64,
    pub name: String,
    pub score: f64,
    pub earned_marks: f64,
    pub total_marks: f64,
    pub correct: u32,
    pub incorrect: u32,
    pub partial: u32,
    /// Questions opened at least once.
    pub visited: u32,
    pub review: u32,
    pub unanswered: u32,
}

/// A finalized attempt on the per-exam ranking.
/// Consumed read-only by reward distribution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaderboardEntry {
    pub attempt_id: i64,
    pub user_id: i64,
    pub score: f64,
    pub earned_marks: f64,
    pub submitted_at: Option<DateTime<Utc>>,
}
