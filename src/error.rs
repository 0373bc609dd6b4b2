//! Error types for the edgequake-pipeline library.
//!
//! Three types cover three different situations:
//!
//! * [`PipelineError`]: **fatal**. The run cannot start (bad configuration,
//!   missing processor, dependency cycle) or the continuation policy decided
//!   to abort. Returned as `Err(PipelineError)` from
//!   [`crate::engine::ContentPipeline::execute`], and by the output writers
//!   in [`crate::output`].
//!
//! * [`ProcessingError`]: **non-fatal record**. One stage failed, but the run
//!   may continue. Records are appended to the stage and to the pipeline-wide
//!   error list and are never mutated afterwards.
//!
//! * [`ProcessorFailure`]: what a [`crate::processor::ContentProcessor`]
//!   returns when it cannot produce a result. The executor turns it into a
//!   [`ProcessingError`].

use crate::config::OutputFormat;
use crate::output::OutputDocument;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;
use uuid::Uuid;

/// All fatal errors returned by the edgequake-pipeline library.
#[derive(Debug, Error)]
pub enum PipelineError {
    // ── Configuration errors ──────────────────────────────────────────────
    /// `execute()` was called with an empty document intake.
    #[error("No source documents added to the pipeline.")]
    NoDocuments,

    /// `execute()` was called without any stage.
    #[error("No processing stages defined.")]
    NoStages,

    /// A stage references a processor that was never registered.
    #[error("Processor '{processor}' is not registered (stage '{stage_id}')")]
    ProcessorNotFound { stage_id: String, processor: String },

    /// Two stages share an id.
    #[error("Stage id '{stage_id}' is already in use")]
    DuplicateStage { stage_id: String },

    /// A stage depends on a stage id that does not exist.
    #[error("Stage '{stage_id}' depends on '{dependency}', but no such stage was found")]
    StageNotFound { stage_id: String, dependency: String },

    /// The dependency graph contains a cycle through `stage_id`.
    #[error("Circular dependency detected at stage '{stage_id}'")]
    CircularDependency { stage_id: String },

    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// A pipeline instance runs at most once.
    #[error("Pipeline has already been executed; create a new instance for another run")]
    AlreadyExecuted,

    // ── Run errors ────────────────────────────────────────────────────────
    /// The continuation policy stopped the run after `stage_id` failed.
    ///
    /// `fallback` holds the best-effort document synthesized from whatever
    /// completed before the abort, so callers still get something to show.
    #[error("Pipeline aborted after stage '{stage_id}' failed: {message}")]
    Aborted {
        stage_id: String,
        message: String,
        fallback: Box<OutputDocument>,
    },

    // ── Output errors ─────────────────────────────────────────────────────
    /// The format needs an external renderer (PDF, HTML).
    #[error("Output format '{0}' needs an external renderer")]
    UnsupportedFormat(OutputFormat),

    #[error("Failed to serialise output document: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Failed to write output to {path}: {source}")]
    OutputWriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl PipelineError {
    /// Configuration errors are raised before any stage runs.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            PipelineError::NoDocuments
                | PipelineError::NoStages
                | PipelineError::ProcessorNotFound { .. }
                | PipelineError::DuplicateStage { .. }
                | PipelineError::StageNotFound { .. }
                | PipelineError::CircularDependency { .. }
                | PipelineError::InvalidConfig(_)
                | PipelineError::AlreadyExecuted
        )
    }

    /// The best-effort document attached to an aborted run, if any.
    pub fn fallback(&self) -> Option<&OutputDocument> {
        match self {
            PipelineError::Aborted { fallback, .. } => Some(fallback),
            _ => None,
        }
    }
}

/// Failure category of a [`ProcessingError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Extraction,
    Validation,
    Transformation,
    Output,
    System,
}

/// How bad a [`ProcessingError`] is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

/// One failure record, attached to a stage and to the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingError {
    pub id: Uuid,
    /// Originating stage id, or [`PIPELINE_STAGE_ID`] for run-level errors.
    pub stage_id: String,
    pub kind: ErrorKind,
    pub severity: Severity,
    pub message: String,
    pub recoverable: bool,
    pub timestamp: DateTime<Utc>,
}

/// Stage id used on errors raised by the driver itself.
pub const PIPELINE_STAGE_ID: &str = "pipeline";

impl ProcessingError {
    pub fn new(
        stage_id: impl Into<String>,
        kind: ErrorKind,
        severity: Severity,
        message: impl Into<String>,
        recoverable: bool,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            stage_id: stage_id.into(),
            kind,
            severity,
            message: message.into(),
            recoverable,
            timestamp: Utc::now(),
        }
    }
}

impl fmt::Display for ProcessingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{:?}/{:?}] stage '{}': {}",
            self.kind, self.severity, self.stage_id, self.message
        )
    }
}

/// Error returned by a processor's `process` or `recover`.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct ProcessorFailure {
    pub message: String,
    pub kind: ErrorKind,
    /// `false` tells the continuation policy that retrying this stage is pointless.
    pub recoverable: bool,
}

impl ProcessorFailure {
    /// A recoverable transformation failure.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind: ErrorKind::Transformation,
            recoverable: true,
        }
    }

    /// A failure the processor knows cannot be recovered from.
    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            recoverable: false,
            ..Self::new(message)
        }
    }

    pub fn with_kind(mut self, kind: ErrorKind) -> Self {
        self.kind = kind;
        self
    }
}
