// src/engine/events.rs

use serde::Serialize;

use crate::{
    engine::violation::ViolationWarning,
    models::{
        attempt::ViolationKind,
        exam_record::{ScoreResult, SubmissionCause},
    },
};

/// Notifications published by a session as it runs.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SessionEvent {
    Activated {
        attempt_id: i64,
        remaining_seconds: i64,
    },
    Warning(ViolationWarning),
    /// Ask the client to re-enter fullscreen. Best effort only.
    RestoreDistractionFreeMode,
    DeadlineExpired,
    ForceSubmit {
        kind: ViolationKind,
    },
    SubmissionStarted {
        cause: SubmissionCause,
    },
    SaveFailed {
        question_id: i64,
        error: String,
    },
    FinalizeFailed {
        error: String,
    },
    Submitted {
        result: ScoreResult,
    },
    TornDown,
}
