// src/store/postgres.rs

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool, types::Json};

use crate::{
    models::{
        attempt::{Attempt, QuestionStatus, ViolationCounts},
        exam::{ExamDefinition, Subject},
        exam_record::{LeaderboardEntry, ScoreResult},
        question::{Question, QuestionType},
    },
    store::{AnswerStore, Catalog, StoreError},
};

/// Catalog and answer store over the Postgres schema in `migrations/`.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(FromRow)]
struct ExamRow {
    id: i64,
    title: String,
    duration_seconds: i64,
}

#[derive(FromRow)]
struct SubjectRow {
    id: i64,
    name: String,
    supports_bilingual: bool,
    position: i32,
}

impl From<SubjectRow> for Subject {
    fn from(row: SubjectRow) -> Self {
        Self {
            id: row.id,
            name: row.name,
            supports_bilingual: row.supports_bilingual,
            position: row.position,
        }
    }
}

/// Row shape of `questions`. `type` is kept as text in the database.
#[derive(FromRow)]
struct QuestionRow {
    id: i64,
    subject_id: i64,
    #[sqlx(rename = "type")]
    question_type: String,
    content: String,
    translated_content: Option<String>,
    options: Json<Vec<String>>,
    translated_options: Option<Json<Vec<String>>>,
    correct_answer: Option<i64>,
    correct_answers: Json<Vec<i64>>,
    marks: f64,
    negative_mark: f64,
    position: i32,
}

impl TryFrom<QuestionRow> for Question {
    type Error = StoreError;

    fn try_from(row: QuestionRow) -> Result<Self, Self::Error> {
        let question_type = QuestionType::parse(&row.question_type).ok_or_else(|| {
            StoreError::Unavailable(format!(
                "question {} has unknown type '{}'",
                row.id, row.question_type
            ))
        })?;

        Ok(Self {
            id: row.id,
            subject_id: row.subject_id,
            question_type,
            content: row.content,
            translated_content: row.translated_content,
            options: row.options.0,
            translated_options: row.translated_options.map(|o| o.0),
            correct_answer: row.correct_answer,
            correct_answers: row.correct_answers.0,
            marks: row.marks,
            negative_mark: row.negative_mark,
            position: row.position,
        })
    }
}

#[derive(FromRow)]
struct AttemptRow {
    id: i64,
    exam_id: i64,
    user_id: i64,
    start_time: DateTime<Utc>,
    is_submitted: bool,
    tab_switch_count: i32,
    navigation_count: i32,
    escape_count: i32,
    score_result: Option<Json<ScoreResult>>,
}

#[derive(FromRow)]
struct AnswerRow {
    question_id: i64,
    selection: Json<Vec<i64>>,
    status: String,
}

const ATTEMPT_COLUMNS: &str = "id, exam_id, user_id, start_time, is_submitted, \
     tab_switch_count, navigation_count, escape_count, score_result";

impl PgStore {
    async fn attempt_with_answers(&self, row: AttemptRow) -> Result<Attempt, StoreError> {
        let answer_rows = sqlx::query_as::<_, AnswerRow>(
            "SELECT question_id, selection, status FROM attempt_answers WHERE attempt_id = $1",
        )
        .bind(row.id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            tracing::error!("Failed to fetch answers for attempt {}: {:?}", row.id, e);
            StoreError::from(e)
        })?;

        let mut answers = HashMap::new();
        let mut question_status = HashMap::new();
        for answer in answer_rows {
            let status = QuestionStatus::parse(&answer.status).unwrap_or_else(|| {
                tracing::warn!(
                    "Attempt {} question {} has unknown status '{}'",
                    row.id,
                    answer.question_id,
                    answer.status
                );
                QuestionStatus::Visited
            });
            answers.insert(answer.question_id, answer.selection.0);
            question_status.insert(answer.question_id, status);
        }

        Ok(Attempt {
            id: row.id,
            exam_id: row.exam_id,
            user_id: row.user_id,
            start_time: row.start_time,
            is_submitted: row.is_submitted,
            answers,
            question_status,
            violation_counts: ViolationCounts {
                tab_switch: row.tab_switch_count.max(0) as u32,
                navigation: row.navigation_count.max(0) as u32,
                escape: row.escape_count.max(0) as u32,
            },
            result: row.score_result.map(|r| r.0),
        })
    }
}

#[async_trait]
impl Catalog for PgStore {
    async fn load_exam(&self, exam_id: i64) -> Result<ExamDefinition, StoreError> {
        let exam = sqlx::query_as::<_, ExamRow>(
            "SELECT id, title, duration_seconds FROM exams WHERE id = $1",
        )
        .bind(exam_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            tracing::error!("Failed to fetch exam {}: {:?}", exam_id, e);
            StoreError::from(e)
        })?
        .ok_or_else(|| StoreError::NotFound(format!("exam {}", exam_id)))?;

        let subjects = self.list_subjects(exam_id).await?;

        Ok(ExamDefinition {
            id: exam.id,
            title: exam.title,
            duration_seconds: exam.duration_seconds,
            subjects,
        })
    }

    async fn list_subjects(&self, exam_id: i64) -> Result<Vec<Subject>, StoreError> {
        let rows = sqlx::query_as::<_, SubjectRow>(
            r#"
            SELECT id, name, supports_bilingual, position
            FROM subjects
            WHERE exam_id = $1
            ORDER BY position, id
            "#,
        )
        .bind(exam_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            tracing::error!("Failed to fetch subjects for exam {}: {:?}", exam_id, e);
            StoreError::from(e)
        })?;

        Ok(rows.into_iter().map(Subject::from).collect())
    }

    async fn list_questions(&self, exam_id: i64) -> Result<Vec<Question>, StoreError> {
        let rows = sqlx::query_as::<_, QuestionRow>(
            r#"
            SELECT
                q.id,
                q.subject_id,
                q.type,
                q.content,
                q.translated_content,
                q.options,
                q.translated_options,
                q.correct_answer,
                q.correct_answers,
                q.marks,
                q.negative_mark,
                q.position
            FROM questions q
            JOIN subjects s ON s.id = q.subject_id
            WHERE q.exam_id = $1
            ORDER BY s.position, q.position, q.id
            "#,
        )
        .bind(exam_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            tracing::error!("Failed to fetch questions for exam {}: {:?}", exam_id, e);
            StoreError::from(e)
        })?;

        rows.into_iter().map(Question::try_from).collect()
    }
}

#[async_trait]
impl AnswerStore for PgStore {
    async fn create_attempt(
        &self,
        exam_id: i64,
        user_id: i64,
        start_time: DateTime<Utc>,
    ) -> Result<Attempt, StoreError> {
        // One attempt per learner per exam: a second start resumes the first.
        let inserted = sqlx::query_as::<_, AttemptRow>(&format!(
            r#"
            INSERT INTO attempts (exam_id, user_id, start_time)
            VALUES ($1, $2, $3)
            ON CONFLICT (exam_id, user_id) DO NOTHING
            RETURNING {}
            "#,
            ATTEMPT_COLUMNS
        ))
        .bind(exam_id)
        .bind(user_id)
        .bind(start_time)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            tracing::error!("Failed to create attempt: {:?}", e);
            StoreError::from(e)
        })?;

        let row = match inserted {
            Some(row) => row,
            None => sqlx::query_as::<_, AttemptRow>(&format!(
                "SELECT {} FROM attempts WHERE exam_id = $1 AND user_id = $2",
                ATTEMPT_COLUMNS
            ))
            .bind(exam_id)
            .bind(user_id)
            .fetch_one(&self.pool)
            .await?,
        };

        self.attempt_with_answers(row).await
    }

    async fn load_attempt(&self, attempt_id: i64) -> Result<Attempt, StoreError> {
        let row = sqlx::query_as::<_, AttemptRow>(&format!(
            "SELECT {} FROM attempts WHERE id = $1",
            ATTEMPT_COLUMNS
        ))
        .bind(attempt_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            tracing::error!("Failed to fetch attempt {}: {:?}", attempt_id, e);
            StoreError::from(e)
        })?
        .ok_or_else(|| StoreError::NotFound(format!("attempt {}", attempt_id)))?;

        self.attempt_with_answers(row).await
    }

    async fn save_answer(
        &self,
        attempt_id: i64,
        question_id: i64,
        selection: &[i64],
        status: QuestionStatus,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO attempt_answers (attempt_id, question_id, selection, status)
            SELECT $1, $2, $3, $4
            WHERE EXISTS (SELECT 1 FROM attempts WHERE id = $1 AND NOT is_submitted)
            ON CONFLICT (attempt_id, question_id) DO UPDATE SET
                selection = EXCLUDED.selection,
                status = EXCLUDED.status,
                updated_at = CURRENT_TIMESTAMP
            "#,
        )
        .bind(attempt_id)
        .bind(question_id)
        .bind(Json(selection))
        .bind(status.as_str())
        .execute(&self.pool)
        .await
        .map_err(|e| {
            tracing::warn!(
                "Failed to save answer {} for attempt {}: {:?}",
                question_id,
                attempt_id,
                e
            );
            StoreError::from(e)
        })?;

        if result.rows_affected() == 0 {
            return Err(StoreError::Conflict(format!(
                "attempt {} is submitted or missing",
                attempt_id
            )));
        }

        Ok(())
    }

    async fn save_violations(
        &self,
        attempt_id: i64,
        counts: &ViolationCounts,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE attempts
            SET tab_switch_count = $2, navigation_count = $3, escape_count = $4
            WHERE id = $1 AND NOT is_submitted
            "#,
        )
        .bind(attempt_id)
        .bind(counts.tab_switch as i32)
        .bind(counts.navigation as i32)
        .bind(counts.escape as i32)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn finalize_attempt(
        &self,
        attempt_id: i64,
        result: &ScoreResult,
    ) -> Result<(), StoreError> {
        let updated = sqlx::query(
            r#"
            UPDATE attempts
            SET is_submitted = TRUE,
                score_result = $2,
                score = $3,
                earned_marks = $4,
                submitted_at = $5
            WHERE id = $1 AND NOT is_submitted
            "#,
        )
        .bind(attempt_id)
        .bind(Json(result))
        .bind(result.score)
        .bind(result.earned_marks)
        .bind(result.submitted_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            tracing::error!("Failed to finalize attempt {}: {:?}", attempt_id, e);
            StoreError::from(e)
        })?;

        if updated.rows_affected() == 1 {
            return Ok(());
        }

        // Nothing updated: either a retry of a write that already landed, or a
        // genuinely different final record.
        let existing = sqlx::query_scalar::<_, Option<Json<ScoreResult>>>(
            "SELECT score_result FROM attempts WHERE id = $1",
        )
        .bind(attempt_id)
        .fetch_optional(&self.pool)
        .await?
        .flatten();

        match existing {
            Some(Json(stored)) if &stored == result => Ok(()),
            Some(_) => Err(StoreError::Conflict(format!(
                "attempt {} already finalized with a different result",
                attempt_id
            ))),
            None => Err(StoreError::NotFound(format!("attempt {}", attempt_id))),
        }
    }

    async fn ranked_results(
        &self,
        exam_id: i64,
        limit: i64,
    ) -> Result<Vec<LeaderboardEntry>, StoreError> {
        let entries = sqlx::query_as::<_, LeaderboardRow>(
            r#"
            SELECT
                id AS attempt_id,
                user_id,
                score,
                COALESCE(earned_marks, 0) AS earned_marks,
                submitted_at
            FROM attempts
            WHERE exam_id = $1 AND is_submitted AND score IS NOT NULL
            ORDER BY score DESC, submitted_at ASC
            LIMIT $2
            "#,
        )
        .bind(exam_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            tracing::error!("Failed to fetch leaderboard: {:?}", e);
            StoreError::from(e)
        })?;

        Ok(entries.into_iter().map(LeaderboardEntry::from).collect())
    }
}

#[derive(FromRow)]
struct LeaderboardRow {
    attempt_id: i64,
    user_id: i64,
    score: f64,
    earned_marks: f64,
    submitted_at: Option<DateTime<Utc>>,
}

impl From<LeaderboardRow> for LeaderboardEntry {
    fn from(row: LeaderboardRow) -> Self {
        Self {
            attempt_id: row.attempt_id,
            user_id: row.user_id,
            score: row.score,
            earned_marks: row.earned_marks,
            submitted_at: row.submitted_at,
        }
    }
}
