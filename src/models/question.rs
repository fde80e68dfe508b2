// src/models/question.rs

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

/// How a question is answered and scored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QuestionType {
    /// Exactly one option index.
    Single,
    /// Any subset of option indices; partial credit is possible.
    Multiple,
    /// A free numeric value, no options.
    Integer,
}

impl QuestionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            QuestionType::Single => "single",
            QuestionType::Multiple => "multiple",
            QuestionType::Integer => "integer",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "single" => Some(QuestionType::Single),
            "multiple" => Some(QuestionType::Multiple),
            "integer" => Some(QuestionType::Integer),
            _ => None,
        }
    }
}

/// A catalog question, including its answer key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Question {
    pub id: i64,
    pub subject_id: i64,

    #[serde(rename = "type")]
    pub question_type: QuestionType,

    pub content: String,

    /// Second-language rendering for bilingual subjects.
    pub translated_content: Option<String>,

    /// Option labels. Empty for integer questions.
    pub options: Vec<String>,

    pub translated_options: Option<Vec<String>>,

    /// Correct option index (single) or value (integer).
    pub correct_answer: Option<i64>,

    /// Correct option indices for multiple-select questions.
    pub correct_answers: Vec<i64>,

    pub marks: f64,
    pub negative_mark: f64,

    /// Display order inside the subject.
    pub position: i32,
}

impl Question {
    /// Checks that a learner selection has the right shape for this question.
    ///
    /// An empty selection is always accepted and means "no answer".
    pub fn check_selection(&self, selection: &[i64]) -> Result<(), String> {
        if selection.is_empty() {
            return Ok(());
        }

        match self.question_type {
            QuestionType::Single | QuestionType::Integer if selection.len() > 1 => {
                return Err(format!(
                    "Question {} accepts a single value, got {}",
                    self.id,
                    selection.len()
                ));
            }
            QuestionType::Integer => return Ok(()),
            _ => {}
        }

        let mut seen = HashSet::new();
        for &index in selection {
            if index < 0 || index as usize >= self.options.len() {
                return Err(format!(
                    "Option {} is out of range for question {}",
                    index, self.id
                ));
            }
            if !seen.insert(index) {
                return Err(format!("Option {} selected twice", index));
            }
        }

        Ok(())
    }
}

/// DTO for sending a question to the learner (excludes the answer key).
#[derive(Debug, Serialize)]
pub struct PublicQuestion {
    pub id: i64,
    pub subject_id: i64,
    #[serde(rename = "type")]
    pub question_type: QuestionType,
    pub content: String,
    pub translated_content: Option<String>,
    pub options: Vec<String>,
    pub translated_options: Option<Vec<String>>,
    pub marks: f64,
    pub negative_mark: f64,
}

impl From<&Question> for PublicQuestion {
    fn from(q: &Question) -> Self {
        Self {
            id: q.id,
            subject_id: q.subject_id,
            question_type: q.question_type,
            content: q.content.clone(),
            translated_content: q.translated_content.clone(),
            options: q.options.clone(),
            translated_options: q.translated_options.clone(),
            marks: q.marks,
            negative_mark: q.negative_mark,
        }
    }
}
