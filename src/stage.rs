//! Stages: the nodes of the processing DAG.

use crate::error::ProcessingError;
use crate::output::OutputDocument;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Lifecycle of a stage. Moves forward once per run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl StageStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StageStatus::Completed | StageStatus::Failed | StageStatus::Skipped
        )
    }
}

/// What a stage produced.
///
/// The producing processor decides the variant: a stage that already emits
/// the final document shape returns `Canonical`, everything else returns
/// `Raw` and is adapted during output synthesis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum StageOutput {
    Canonical(OutputDocument),
    Raw(Value),
}

impl StageOutput {
    /// `Raw(null)`, `Raw({})`, `Raw([])` and `Raw("")` carry nothing usable.
    pub fn is_empty(&self) -> bool {
        match self {
            StageOutput::Canonical(_) => false,
            StageOutput::Raw(v) => match v {
                Value::Null => true,
                Value::Object(m) => m.is_empty(),
                Value::Array(a) => a.is_empty(),
                Value::String(s) => s.is_empty(),
                _ => false,
            },
        }
    }

    pub fn as_raw(&self) -> Option<&Value> {
        match self {
            StageOutput::Raw(v) => Some(v),
            StageOutput::Canonical(_) => None,
        }
    }

    pub fn as_canonical(&self) -> Option<&OutputDocument> {
        match self {
            StageOutput::Canonical(d) => Some(d),
            StageOutput::Raw(_) => None,
        }
    }
}

impl From<Value> for StageOutput {
    fn from(v: Value) -> Self {
        StageOutput::Raw(v)
    }
}

impl From<OutputDocument> for StageOutput {
    fn from(d: OutputDocument) -> Self {
        StageOutput::Canonical(d)
    }
}

/// Declaration of a stage, passed to
/// [`crate::engine::ContentPipeline::add_stage`].
#[derive(Debug, Clone)]
pub struct StageSpec {
    pub id: String,
    pub name: String,
    pub processor: String,
    pub config: Value,
    pub dependencies: Vec<String>,
}

impl StageSpec {
    /// A stage whose display name equals its id, with no config and no dependencies.
    pub fn new(id: impl Into<String>, processor: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            processor: processor.into(),
            config: Value::Null,
            dependencies: Vec::new(),
        }
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn config(mut self, config: Value) -> Self {
        self.config = config;
        self
    }

    pub fn depends_on<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies.extend(deps.into_iter().map(Into::into));
        self
    }
}

/// One node of the DAG together with its run state.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessingStage {
    pub id: String,
    pub name: String,
    pub processor: String,
    pub config: Value,
    pub dependencies: Vec<String>,
    pub status: StageStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub errors: Vec<ProcessingError>,
    pub warnings: Vec<String>,
    pub output: Option<StageOutput>,
}

impl From<StageSpec> for ProcessingStage {
    fn from(spec: StageSpec) -> Self {
        Self {
            id: spec.id,
            name: spec.name,
            processor: spec.processor,
            config: spec.config,
            dependencies: spec.dependencies,
            status: StageStatus::Pending,
            started_at: None,
            completed_at: None,
            errors: Vec::new(),
            warnings: Vec::new(),
            output: None,
        }
    }
}

impl ProcessingStage {
    /// Output that a dependent stage may consume.
    pub fn usable_output(&self) -> Option<&StageOutput> {
        self.output.as_ref().filter(|o| !o.is_empty())
    }

    pub fn last_error(&self) -> Option<&ProcessingError> {
        self.errors.last()
    }

    pub fn duration_ms(&self) -> Option<i64> {
        match (self.started_at, self.completed_at) {
            (Some(s), Some(e)) => Some((e - s).num_milliseconds()),
            _ => None,
        }
    }
}
