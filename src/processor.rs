//! The processor contract and the per-pipeline registry.
//!
//! A [`ContentProcessor`] is the boundary to business logic: file extraction,
//! AI-backed topic detection, layout adaptation. The engine only knows this
//! trait. `validate` and `recover` are optional; their default
//! implementations return `None`, which the executor reads as "not exposed".
//!
//! Every call receives a [`ProcessorContext`]. Its cancellation token fires
//! when the stage times out or the pipeline is cancelled; long-running
//! processors should check it (or `select!` on `cancelled()`) and stop early.

use crate::error::{ProcessingError, ProcessorFailure};
use crate::document::SourceDocument;
use crate::stage::StageOutput;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Input assembled for one stage.
#[derive(Debug, Clone)]
pub enum StageInput {
    /// Root stage: a snapshot of the whole document intake.
    Documents(Vec<SourceDocument>),
    /// Exactly one dependency: its output, unwrapped.
    Single(StageOutput),
    /// Several dependencies: their outputs in declared order.
    Many(Vec<StageOutput>),
}

impl StageInput {
    pub fn documents(&self) -> Option<&[SourceDocument]> {
        match self {
            StageInput::Documents(d) => Some(d),
            _ => None,
        }
    }

    /// All upstream stage outputs, regardless of arity.
    pub fn outputs(&self) -> Vec<&StageOutput> {
        match self {
            StageInput::Documents(_) => Vec::new(),
            StageInput::Single(o) => vec![o],
            StageInput::Many(v) => v.iter().collect(),
        }
    }
}

/// Per-call context handed to every processor method.
#[derive(Debug, Clone)]
pub struct ProcessorContext {
    pub stage_id: String,
    pub cancellation: CancellationToken,
}

impl ProcessorContext {
    pub fn new(stage_id: impl Into<String>, cancellation: CancellationToken) -> Self {
        Self {
            stage_id: stage_id.into(),
            cancellation,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }
}

/// Metrics reported by one processor invocation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResultMetrics {
    pub duration_ms: u64,
    /// 0–1.
    pub quality_score: f64,
    /// 0–1.
    pub content_preserved: f64,
    pub items_processed: usize,
}

impl Default for ResultMetrics {
    fn default() -> Self {
        Self {
            duration_ms: 0,
            quality_score: 1.0,
            content_preserved: 1.0,
            items_processed: 0,
        }
    }
}

/// Outcome of one processor invocation.
#[derive(Debug, Clone, Default)]
pub struct ProcessingResult {
    pub success: bool,
    pub data: Option<StageOutput>,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub metrics: ResultMetrics,
}

impl ProcessingResult {
    /// A successful result carrying `data`.
    pub fn ok(data: impl Into<StageOutput>) -> Self {
        Self {
            success: true,
            data: Some(data.into()),
            ..Default::default()
        }
    }

    /// An unsuccessful result, optionally with partial data.
    pub fn failed(error: impl Into<String>, partial: Option<StageOutput>) -> Self {
        Self {
            success: false,
            data: partial,
            errors: vec![error.into()],
            ..Default::default()
        }
    }

    pub fn with_metrics(mut self, metrics: ResultMetrics) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn with_quality(mut self, quality: f64, preserved: f64) -> Self {
        self.metrics.quality_score = quality;
        self.metrics.content_preserved = preserved;
        self
    }

    pub fn with_warning(mut self, warning: impl Into<String>) -> Self {
        self.warnings.push(warning.into());
        self
    }
}

/// Outcome of a processor's optional pre-flight check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub passed: bool,
    pub details: String,
}

impl ValidationResult {
    pub fn pass() -> Self {
        Self {
            passed: true,
            details: String::new(),
        }
    }

    pub fn fail(details: impl Into<String>) -> Self {
        Self {
            passed: false,
            details: details.into(),
        }
    }
}

/// A reusable, named and versioned unit of work.
///
/// Processors hold no per-call state: the same instance may serve several
/// stages of one pipeline.
#[async_trait]
pub trait ContentProcessor: Send + Sync {
    fn name(&self) -> &str;

    fn version(&self) -> &str {
        "1.0.0"
    }

    async fn process(
        &self,
        input: &StageInput,
        config: &Value,
        ctx: &ProcessorContext,
    ) -> Result<ProcessingResult, ProcessorFailure>;

    /// `None` means the processor exposes no validation.
    async fn validate(
        &self,
        input: &StageInput,
        config: &Value,
        ctx: &ProcessorContext,
    ) -> Option<ValidationResult> {
        let _ = (input, config, ctx);
        None
    }

    /// `None` means the processor exposes no recovery path.
    async fn recover(
        &self,
        error: &ProcessingError,
        input: &StageInput,
        config: &Value,
        ctx: &ProcessorContext,
    ) -> Option<Result<ProcessingResult, ProcessorFailure>> {
        let _ = (error, input, config, ctx);
        None
    }
}

/// Name → processor map owned by one pipeline instance.
#[derive(Default, Clone)]
pub struct ProcessorRegistry {
    processors: HashMap<String, Arc<dyn ContentProcessor>>,
}

impl ProcessorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `processor` under its name. Returns the entry it replaced, if any.
    pub fn register(
        &mut self,
        processor: Arc<dyn ContentProcessor>,
    ) -> Option<Arc<dyn ContentProcessor>> {
        self.processors
            .insert(processor.name().to_string(), processor)
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ContentProcessor>> {
        self.processors.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.processors.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.processors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.processors.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.processors.keys().map(String::as_str)
    }
}

impl std::fmt::Debug for ProcessorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<&str> = self.names().collect();
        names.sort_unstable();
        f.debug_struct("ProcessorRegistry")
            .field("processors", &names)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Named(&'static str, &'static str);

    #[async_trait]
    impl ContentProcessor for Named {
        fn name(&self) -> &str {
            self.0
        }

        fn version(&self) -> &str {
            self.1
        }

        async fn process(
            &self,
            _input: &StageInput,
            _config: &Value,
            _ctx: &ProcessorContext,
        ) -> Result<ProcessingResult, ProcessorFailure> {
            Ok(ProcessingResult::ok(Value::from(self.1)))
        }
    }

    #[test]
    fn register_overwrites_same_name() {
        let mut reg = ProcessorRegistry::new();
        assert!(reg.register(Arc::new(Named("extract", "1"))).is_none());
        let old = reg.register(Arc::new(Named("extract", "2")));
        assert_eq!(old.map(|p| p.version().to_string()), Some("1".into()));
        assert_eq!(reg.len(), 1);
        assert_eq!(reg.get("extract").unwrap().version(), "2");
    }

    #[test]
    fn optional_methods_default_to_none() {
        let p = Named("x", "1");
        let input = StageInput::Documents(Vec::new());
        let ctx = ProcessorContext::new("s", CancellationToken::new());
        let err = ProcessingError::new(
            "s",
            crate::error::ErrorKind::System,
            crate::error::Severity::High,
            "e",
            true,
        );
        tokio_test::block_on(async {
            assert!(p.validate(&input, &Value::Null, &ctx).await.is_none());
            assert!(p.recover(&err, &input, &Value::Null, &ctx).await.is_none());
            let r = p.process(&input, &Value::Null, &ctx).await.unwrap();
            assert!(r.success);
        });
    }

    #[test]
    fn input_outputs_by_arity() {
        let single = StageInput::Single(StageOutput::Raw(Value::from(1)));
        assert_eq!(single.outputs().len(), 1);
        let many = StageInput::Many(vec![
            StageOutput::Raw(Value::from(1)),
            StageOutput::Raw(Value::from(2)),
        ]);
        assert_eq!(many.outputs().len(), 2);
        assert!(many.documents().is_none());
    }
}
