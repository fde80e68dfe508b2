// src/engine/scorer.rs

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};

use crate::models::{
    attempt::QuestionStatus,
    exam::ExamDefinition,
    exam_record::{ScoreResult, SubjectScore, SubmissionCause},
    question::{Question, QuestionType},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Correct,
    Partial,
    Incorrect,
    Unanswered,
}

/// Marks earned on one question.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Mark {
    pub earned: f64,
    pub outcome: Outcome,
}

impl Mark {
    fn correct(q: &Question) -> Self {
        Self {
            earned: q.marks,
            outcome: Outcome::Correct,
        }
    }

    fn incorrect(q: &Question) -> Self {
        Self {
            earned: -q.negative_mark,
            outcome: Outcome::Incorrect,
        }
    }

    fn unanswered() -> Self {
        Self {
            earned: 0.0,
            outcome: Outcome::Unanswered,
        }
    }
}

/// Scores a stored answer. An empty answer is always worth zero.
pub fn score_question(question: &Question, answer: &[i64]) -> Mark {
    if answer.is_empty() {
        return Mark::unanswered();
    }

    match question.question_type {
        QuestionType::Single | QuestionType::Integer => {
            if question.correct_answer == Some(answer[0]) {
                Mark::correct(question)
            } else {
                Mark::incorrect(question)
            }
        }
        QuestionType::Multiple => {
            let selected: HashSet<i64> = answer.iter().copied().collect();
            let correct: HashSet<i64> = question.correct_answers.iter().copied().collect();

            // Any wrong option forfeits partial credit.
            if !selected.is_subset(&correct) {
                return Mark::incorrect(question);
            }
            if selected.len() == correct.len() {
                return Mark::correct(question);
            }
            Mark {
                earned: question.marks * selected.len() as f64 / correct.len() as f64,
                outcome: Outcome::Partial,
            }
        }
    }
}

fn percentage(earned: f64, total: f64) -> f64 {
    if total <= 0.0 {
        return 0.0;
    }
    earned / total * 100.0
}

/// Aggregates per-question marks into the subject and overall result.
///
/// Questions marked for review hold an empty stored answer, so they score
/// zero here without any special case.
pub fn score_attempt(
    exam: &ExamDefinition,
    questions: &[Question],
    answers: &HashMap<i64, Vec<i64>>,
    statuses: &HashMap<i64, QuestionStatus>,
    cause: SubmissionCause,
    submitted_at: DateTime<Utc>,
) -> ScoreResult {
    let mut subjects: Vec<SubjectScore> = exam
        .subjects
        .iter()
        .map(|s| SubjectScore {
            subject_id: s.id,
            name: s.name.clone(),
            score: 0.0,
            earned_marks: 0.0,
            total_marks: 0.0,
            correct: 0,
            incorrect: 0,
            partial: 0,
            visited: 0,
            review: 0,
            unanswered: 0,
        })
        .collect();

    for question in questions {
        let slot = match subjects.iter().position(|s| s.subject_id == question.subject_id) {
            Some(slot) => slot,
            None => {
                tracing::warn!(
                    "Question {} references subject {} missing from exam {}",
                    question.id,
                    question.subject_id,
                    exam.id
                );
                subjects.push(SubjectScore {
                    subject_id: question.subject_id,
                    name: format!("Subject {}", question.subject_id),
                    score: 0.0,
                    earned_marks: 0.0,
                    total_marks: 0.0,
                    correct: 0,
                    incorrect: 0,
                    partial: 0,
                    visited: 0,
                    review: 0,
                    unanswered: 0,
                });
                subjects.len() - 1
            }
        };
        let subject = &mut subjects[slot];

        let answer = answers.get(&question.id).map(Vec::as_slice).unwrap_or(&[]);
        let mark = score_question(question, answer);

        subject.earned_marks += mark.earned;
        subject.total_marks += question.marks;
        match mark.outcome {
            Outcome::Correct => subject.correct += 1,
            Outcome::Partial => subject.partial += 1,
            Outcome::Incorrect => subject.incorrect += 1,
            Outcome::Unanswered => subject.unanswered += 1,
        }

        let status = statuses
            .get(&question.id)
            .copied()
            .unwrap_or(QuestionStatus::NotVisited);
        if status != QuestionStatus::NotVisited {
            subject.visited += 1;
        }
        if status == QuestionStatus::MarkedReview {
            subject.review += 1;
        }
    }

    let mut earned_marks = 0.0;
    let mut total_marks = 0.0;
    for subject in &mut subjects {
        subject.score = percentage(subject.earned_marks, subject.total_marks);
        earned_marks += subject.earned_marks;
        total_marks += subject.total_marks;
    }

    ScoreResult {
        score: percentage(earned_marks, total_marks),
        earned_marks,
        total_marks,
        subjects,
        cause,
        submitted_at,
    }
}
