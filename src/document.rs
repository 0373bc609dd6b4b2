//! Source documents held by the pipeline's intake.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

/// Processing state of one source document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingStatus {
    #[default]
    Pending,
    Processing,
    Completed,
    Failed,
}

/// What kind of material a document holds.
///
/// Only used for heuristics (part titles in the fallback document); the
/// engine itself treats every category the same.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentCategory {
    Lecture,
    Exercise,
    Exam,
    Summary,
    Formula,
    #[default]
    Other,
}

static RE_LECTURE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)(lecture|vorlesung|slides?|chapter|kapitel)").unwrap());
static RE_EXERCISE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)(exercise|übung|uebung|homework|assignment|sheet)").unwrap());
static RE_EXAM: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)(exam|klausur|midterm|final|quiz)").unwrap());
static RE_SUMMARY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)(summary|zusammenfassung|notes|cheat)").unwrap());
static RE_FORMULA: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)(formula|formel|equations?)").unwrap());

impl DocumentCategory {
    /// Guess a category from a file name.
    pub fn infer(file_name: &str) -> Self {
        // Order matters: "exam_exercises.pdf" is an exam, "formula_sheet.pdf" a formula collection.
        if RE_EXAM.is_match(file_name) {
            DocumentCategory::Exam
        } else if RE_FORMULA.is_match(file_name) {
            DocumentCategory::Formula
        } else if RE_EXERCISE.is_match(file_name) {
            DocumentCategory::Exercise
        } else if RE_SUMMARY.is_match(file_name) {
            DocumentCategory::Summary
        } else if RE_LECTURE.is_match(file_name) {
            DocumentCategory::Lecture
        } else {
            DocumentCategory::Other
        }
    }

    /// Human-readable label used as a part-title prefix, if the category has one.
    pub fn label(&self) -> Option<&'static str> {
        match self {
            DocumentCategory::Lecture => Some("Lecture"),
            DocumentCategory::Exercise => Some("Exercises"),
            DocumentCategory::Exam => Some("Exam Preparation"),
            DocumentCategory::Summary => Some("Summary"),
            DocumentCategory::Formula => Some("Formula Collection"),
            DocumentCategory::Other => None,
        }
    }
}

impl fmt::Display for DocumentCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DocumentCategory::Lecture => "lecture",
            DocumentCategory::Exercise => "exercise",
            DocumentCategory::Exam => "exam",
            DocumentCategory::Summary => "summary",
            DocumentCategory::Formula => "formula",
            DocumentCategory::Other => "other",
        };
        f.write_str(s)
    }
}

/// One input file plus its processing state.
///
/// The payload is reference-counted so stage inputs can snapshot the intake
/// without copying file contents.
#[derive(Debug, Clone, Serialize)]
pub struct SourceDocument {
    pub id: Uuid,
    pub name: String,
    #[serde(skip)]
    pub payload: Arc<[u8]>,
    pub category: DocumentCategory,
    pub status: ProcessingStatus,
    pub errors: Vec<String>,
    /// Content derived by a stage, if a collaborator chooses to attach it.
    pub extracted_content: Option<serde_json::Value>,
}

impl SourceDocument {
    pub fn new(name: impl Into<String>, payload: impl Into<Arc<[u8]>>, category: DocumentCategory) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            payload: payload.into(),
            category,
            status: ProcessingStatus::Pending,
            errors: Vec::new(),
            extracted_content: None,
        }
    }

    pub fn size(&self) -> usize {
        self.payload.len()
    }

    /// File name without its extension, with `_`/`-` turned into spaces.
    pub fn display_name(&self) -> String {
        static RE_EXT: Lazy<Regex> = Lazy::new(|| Regex::new(r"\.[A-Za-z0-9]{1,5}$").unwrap());
        static RE_SEP: Lazy<Regex> = Lazy::new(|| Regex::new(r"[_\-]+").unwrap());
        let stem = RE_EXT.replace(&self.name, "");
        RE_SEP.replace_all(&stem, " ").trim().to_string()
    }
}
