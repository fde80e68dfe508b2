// src/models/exam.rs

use serde::{Deserialize, Serialize};

/// A timed exam as published by the catalog.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExamDefinition {
    pub id: i64,
    pub title: String,
    pub duration_seconds: i64,
    /// Subjects in display order.
    pub subjects: Vec<Subject>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subject {
    pub id: i64,
    pub name: String,
    /// Whether questions carry a translated rendering.
    pub supports_bilingual: bool,
    pub position: i32,
}

impl ExamDefinition {
    pub fn subject(&self, id: i64) -> Option<&Subject> {
        self.subjects.iter().find(|s| s.id == id)
    }
}
