// tests/common/mod.rs

#![allow(dead_code)]

use std::{sync::Arc, time::Duration};

use chrono::{DateTime, TimeZone, Utc};
use exam_session::{
    config::EngineConfig,
    engine::{SessionDeps, clock::ManualClock},
    models::{
        attempt::Attempt,
        exam::{ExamDefinition, Subject},
        question::{Question, QuestionType},
    },
    store::memory::{MemoryAnswerStore, MemoryCatalog, MemoryShadowCache},
};

pub const EXAM_ID: i64 = 1;
pub const LEARNER: i64 = 7;

pub fn exam_start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 3, 1, 9, 0, 0).unwrap()
}

fn question(
    id: i64,
    subject_id: i64,
    question_type: QuestionType,
    correct_answer: Option<i64>,
    correct_answers: Vec<i64>,
) -> Question {
    let options = match question_type {
        QuestionType::Integer => Vec::new(),
        _ => vec!["A".into(), "B".into(), "C".into(), "D".into()],
    };
    Question {
        id,
        subject_id,
        question_type,
        content: format!("Question {}", id),
        translated_content: None,
        options,
        translated_options: None,
        correct_answer,
        correct_answers,
        marks: 4.0,
        negative_mark: 1.0,
        position: id as i32,
    }
}

/// Two subjects, five questions, one hour.
pub fn sample_exam() -> (ExamDefinition, Vec<Question>) {
    let exam = ExamDefinition {
        id: EXAM_ID,
        title: "Mock Test 1".to_string(),
        duration_seconds: 3600,
        subjects: vec![
            Subject {
                id: 1,
                name: "Physics".to_string(),
                supports_bilingual: true,
                position: 0,
            },
            Subject {
                id: 2,
                name: "Chemistry".to_string(),
                supports_bilingual: false,
                position: 1,
            },
        ],
    };

    let questions = vec![
        question(1, 1, QuestionType::Single, Some(2), vec![]),
        question(2, 1, QuestionType::Multiple, None, vec![0, 2]),
        question(3, 1, QuestionType::Integer, Some(42), vec![]),
        question(4, 2, QuestionType::Single, Some(1), vec![]),
        question(5, 2, QuestionType::Multiple, None, vec![1, 3]),
    ];

    (exam, questions)
}

pub fn engine_config() -> EngineConfig {
    EngineConfig {
        retry_base: Duration::from_millis(10),
        retry_max: Duration::from_millis(80),
        ..Default::default()
    }
}

pub struct Backends {
    pub catalog: Arc<MemoryCatalog>,
    pub store: Arc<MemoryAnswerStore>,
    pub cache: Arc<MemoryShadowCache>,
    pub clock: Arc<ManualClock>,
}

impl Backends {
    pub fn new() -> Self {
        let catalog = Arc::new(MemoryCatalog::new());
        let (exam, questions) = sample_exam();
        catalog.insert_exam(exam, questions);

        Self {
            catalog,
            store: Arc::new(MemoryAnswerStore::new()),
            cache: Arc::new(MemoryShadowCache::new()),
            clock: Arc::new(ManualClock::new(exam_start())),
        }
    }

    pub fn deps(&self) -> SessionDeps {
        SessionDeps {
            catalog: self.catalog.clone(),
            store: self.store.clone(),
            cache: self.cache.clone(),
            clock: self.clock.clone(),
        }
    }

    /// Seeds an attempt started at `exam_start()` and returns its id.
    pub fn seed_attempt(&self, id: i64, user_id: i64) -> i64 {
        self.store
            .insert_attempt(Attempt::new(id, EXAM_ID, user_id, exam_start()));
        id
    }

    pub fn advance_secs(&self, secs: i64) {
        self.clock.advance(chrono::Duration::seconds(secs));
    }
}
