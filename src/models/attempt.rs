// src/models/attempt.rs

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::exam_record::ScoreResult;

/// Per-question progress as shown on the question palette.
///
/// Ordered by precedence: a stronger status always wins when several apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum QuestionStatus {
    NotVisited,
    Visited,
    Answered,
    MarkedReview,
}

impl QuestionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            QuestionStatus::NotVisited => "not-visited",
            QuestionStatus::Visited => "visited",
            QuestionStatus::Answered => "answered",
            QuestionStatus::MarkedReview => "marked-review",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "not-visited" => Some(QuestionStatus::NotVisited),
            "visited" => Some(QuestionStatus::Visited),
            "answered" => Some(QuestionStatus::Answered),
            "marked-review" => Some(QuestionStatus::MarkedReview),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationKind {
    TabSwitch,
    Navigation,
    Escape,
}

impl ViolationKind {
    pub const ALL: [ViolationKind; 3] = [
        ViolationKind::TabSwitch,
        ViolationKind::Navigation,
        ViolationKind::Escape,
    ];
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViolationCounts {
    pub tab_switch: u32,
    pub navigation: u32,
    pub escape: u32,
}

impl ViolationCounts {
    pub fn get(&self, kind: ViolationKind) -> u32 {
        match kind {
            ViolationKind::TabSwitch => self.tab_switch,
            ViolationKind::Navigation => self.navigation,
            ViolationKind::Escape => self.escape,
        }
    }

    /// Bumps one counter and returns its new value.
    pub fn increment(&mut self, kind: ViolationKind) -> u32 {
        let slot = match kind {
            ViolationKind::TabSwitch => &mut self.tab_switch,
            ViolationKind::Navigation => &mut self.navigation,
            ViolationKind::Escape => &mut self.escape,
        };
        *slot = slot.saturating_add(1);
        *slot
    }
}

/// One learner's run through one exam, as held by the durable store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attempt {
    pub id: i64,
    pub exam_id: i64,
    pub user_id: i64,

    /// Timer anchor. Never changes after creation.
    pub start_time: DateTime<Utc>,

    pub is_submitted: bool,

    /// Stored selections. An empty list counts as unanswered.
    pub answers: HashMap<i64, Vec<i64>>,

    pub question_status: HashMap<i64, QuestionStatus>,

    pub violation_counts: ViolationCounts,

    /// Present once the attempt is finalized.
    pub result: Option<ScoreResult>,
}

impl Attempt {
    pub fn new(id: i64, exam_id: i64, user_id: i64, start_time: DateTime<Utc>) -> Self {
        Self {
            id,
            exam_id,
            user_id,
            start_time,
            is_submitted: false,
            answers: HashMap::new(),
            question_status: HashMap::new(),
            violation_counts: ViolationCounts::default(),
            result: None,
        }
    }

    /// Number of questions holding a counted (non-empty) answer.
    pub fn answered_count(&self) -> usize {
        self.answers.values().filter(|s| !s.is_empty()).count()
    }
}

/// Read-only view of a finalized attempt for results pages.
#[derive(Debug, Serialize)]
pub struct AttemptResultResponse {
    pub attempt_id: i64,
    pub exam_id: i64,
    pub answers: HashMap<i64, Vec<i64>>,
    pub question_status: HashMap<i64, QuestionStatus>,
    pub violation_counts: ViolationCounts,
    pub result: ScoreResult,
}

/// DTO returned when an attempt is started.
#[derive(Debug, Serialize)]
pub struct StartAttemptResponse {
    pub attempt_id: i64,
    pub exam_id: i64,
    pub start_time: DateTime<Utc>,
    pub duration_seconds: i64,
    pub is_submitted: bool,
}
