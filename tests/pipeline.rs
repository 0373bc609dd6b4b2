//! Integration tests for the pipeline driver.
//!
//! Each test wires small in-process processors into a fresh
//! [`ContentPipeline`] and checks the run through its public surface:
//! the returned document, status, metrics, stage records and events.

use async_trait::async_trait;
use edgequake_pipeline::{
    processors, ContentPipeline, ContentProcessor, DocumentCategory, ErrorKind, EventKind,
    OutputFormat, OutputDocument, PipelineConfig, PipelineError, PipelineEvent, PipelinePhase,
    ProcessingError, ProcessingResult, ProcessingStatus, ProcessorContext, ProcessorFailure,
    ResultMetrics, StageInput, StageOutput, StageSpec, StageStatus, ValidationResult,
};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

// ── Test processors ──────────────────────────────────────────────────────────

/// Succeeds with a fixed payload and quality score.
struct Fixed {
    name: &'static str,
    output: Value,
    quality: f64,
}

impl Fixed {
    fn new(name: &'static str, output: Value) -> Arc<Self> {
        Arc::new(Self {
            name,
            output,
            quality: 1.0,
        })
    }

    fn with_quality(name: &'static str, quality: f64) -> Arc<Self> {
        Arc::new(Self {
            name,
            output: json!({ "from": name }),
            quality,
        })
    }
}

#[async_trait]
impl ContentProcessor for Fixed {
    fn name(&self) -> &str {
        self.name
    }

    async fn process(
        &self,
        _input: &StageInput,
        _config: &Value,
        _ctx: &ProcessorContext,
    ) -> Result<ProcessingResult, ProcessorFailure> {
        Ok(ProcessingResult::ok(self.output.clone()).with_quality(self.quality, 1.0))
    }
}

/// Reports the shape of the input it received.
struct Inspect;

#[async_trait]
impl ContentProcessor for Inspect {
    fn name(&self) -> &str {
        "inspect"
    }

    async fn process(
        &self,
        input: &StageInput,
        _config: &Value,
        _ctx: &ProcessorContext,
    ) -> Result<ProcessingResult, ProcessorFailure> {
        let shape = match input {
            StageInput::Documents(d) => json!({ "arity": "documents", "count": d.len() }),
            StageInput::Single(StageOutput::Raw(v)) => json!({ "arity": "single", "value": v }),
            StageInput::Single(StageOutput::Canonical(_)) => json!({ "arity": "single" }),
            StageInput::Many(outs) => json!({
                "arity": "many",
                "values": outs.iter().filter_map(StageOutput::as_raw).collect::<Vec<_>>(),
            }),
        };
        Ok(ProcessingResult::ok(shape))
    }
}

/// Always fails; `fatal` makes the failure non-recoverable, `partial`
/// leaves data behind.
struct Failing {
    name: &'static str,
    fatal: bool,
    partial: Option<Value>,
}

impl Failing {
    fn recoverable(name: &'static str) -> Arc<Self> {
        Arc::new(Self {
            name,
            fatal: false,
            partial: None,
        })
    }

    fn fatal(name: &'static str) -> Arc<Self> {
        Arc::new(Self {
            name,
            fatal: true,
            partial: None,
        })
    }

    fn partial(name: &'static str, data: Value) -> Arc<Self> {
        Arc::new(Self {
            name,
            fatal: true,
            partial: Some(data),
        })
    }
}

#[async_trait]
impl ContentProcessor for Failing {
    fn name(&self) -> &str {
        self.name
    }

    async fn process(
        &self,
        _input: &StageInput,
        _config: &Value,
        _ctx: &ProcessorContext,
    ) -> Result<ProcessingResult, ProcessorFailure> {
        if let Some(data) = &self.partial {
            return Ok(ProcessingResult::failed(
                "ran out of input halfway",
                Some(StageOutput::Raw(data.clone())),
            ));
        }
        if self.fatal {
            Err(ProcessorFailure::fatal(format!("{} cannot continue", self.name)))
        } else {
            Err(ProcessorFailure::new(format!("{} hiccup", self.name)))
        }
    }
}

/// Sleeps past any reasonable timeout; flags when its token fires.
struct Slow {
    token_fired: Arc<AtomicBool>,
}

#[async_trait]
impl ContentProcessor for Slow {
    fn name(&self) -> &str {
        "slow"
    }

    async fn process(
        &self,
        _input: &StageInput,
        _config: &Value,
        ctx: &ProcessorContext,
    ) -> Result<ProcessingResult, ProcessorFailure> {
        let token = ctx.cancellation.clone();
        let fired = self.token_fired.clone();
        tokio::spawn(async move {
            token.cancelled().await;
            fired.store(true, Ordering::SeqCst);
        });
        tokio::time::sleep(Duration::from_secs(30)).await;
        Ok(ProcessingResult::ok(json!({ "late": true })))
    }
}

/// Fails in `process`; `recover` succeeds or fails depending on `heals`.
struct Recovering {
    heals: bool,
}

#[async_trait]
impl ContentProcessor for Recovering {
    fn name(&self) -> &str {
        "recovering"
    }

    async fn process(
        &self,
        _input: &StageInput,
        _config: &Value,
        _ctx: &ProcessorContext,
    ) -> Result<ProcessingResult, ProcessorFailure> {
        Err(ProcessorFailure::new("first attempt failed"))
    }

    async fn recover(
        &self,
        _error: &ProcessingError,
        _input: &StageInput,
        _config: &Value,
        _ctx: &ProcessorContext,
    ) -> Option<Result<ProcessingResult, ProcessorFailure>> {
        Some(if self.heals {
            Ok(ProcessingResult::ok(json!({ "recovered": true })).with_quality(0.5, 0.5))
        } else {
            Err(ProcessorFailure::new("second attempt failed too"))
        })
    }
}

/// Fails fatally; records whether `recover` was consulted anyway.
struct Doomed {
    recover_called: Arc<AtomicBool>,
}

#[async_trait]
impl ContentProcessor for Doomed {
    fn name(&self) -> &str {
        "doomed"
    }

    async fn process(
        &self,
        _input: &StageInput,
        _config: &Value,
        _ctx: &ProcessorContext,
    ) -> Result<ProcessingResult, ProcessorFailure> {
        Err(ProcessorFailure::fatal("source is corrupt"))
    }

    async fn recover(
        &self,
        _error: &ProcessingError,
        _input: &StageInput,
        _config: &Value,
        _ctx: &ProcessorContext,
    ) -> Option<Result<ProcessingResult, ProcessorFailure>> {
        self.recover_called.store(true, Ordering::SeqCst);
        Some(Ok(ProcessingResult::ok(json!({ "recovered": true }))))
    }
}

/// Rejects every input in `validate`; records whether `process` ran.
struct Rejecting {
    processed: Arc<AtomicBool>,
}

#[async_trait]
impl ContentProcessor for Rejecting {
    fn name(&self) -> &str {
        "rejecting"
    }

    async fn validate(
        &self,
        _input: &StageInput,
        _config: &Value,
        _ctx: &ProcessorContext,
    ) -> Option<ValidationResult> {
        Some(ValidationResult::fail("input is not a course document"))
    }

    async fn process(
        &self,
        _input: &StageInput,
        _config: &Value,
        _ctx: &ProcessorContext,
    ) -> Result<ProcessingResult, ProcessorFailure> {
        self.processed.store(true, Ordering::SeqCst);
        Ok(ProcessingResult::ok(json!({})))
    }
}

struct Panicking;

#[async_trait]
impl ContentProcessor for Panicking {
    fn name(&self) -> &str {
        "panicking"
    }

    async fn process(
        &self,
        _input: &StageInput,
        _config: &Value,
        _ctx: &ProcessorContext,
    ) -> Result<ProcessingResult, ProcessorFailure> {
        panic!("index out of bounds");
    }
}

/// Emits a canonical document, as a final layout stage would.
struct Canonical;

#[async_trait]
impl ContentProcessor for Canonical {
    fn name(&self) -> &str {
        "canonical"
    }

    async fn process(
        &self,
        _input: &StageInput,
        _config: &Value,
        _ctx: &ProcessorContext,
    ) -> Result<ProcessingResult, ProcessorFailure> {
        let mut doc: OutputDocument = serde_json::from_value(json!({
            "title": "Final",
            "parts": [{"id": "p1", "title": "Only part"}]
        }))
        .map_err(|e| ProcessorFailure::fatal(e.to_string()))?;
        doc.metadata.preservation_score = 0.95;
        Ok(ProcessingResult::ok(doc).with_metrics(ResultMetrics {
            items_processed: 1,
            ..Default::default()
        }))
    }
}

// ── Helpers ──────────────────────────────────────────────────────────────────

fn pipeline_with(config: PipelineConfig) -> ContentPipeline {
    let mut p = ContentPipeline::new(config);
    p.add_source_document("lecture_01.md", b"# Limits".to_vec(), DocumentCategory::Lecture);
    p.add_source_document("exercises_01.md", b"Exercise 1".to_vec(), DocumentCategory::Exercise);
    p.add_source_document("exam_2023.md", b"Question 1".to_vec(), DocumentCategory::Exam);
    p
}

fn pipeline() -> ContentPipeline {
    pipeline_with(PipelineConfig::default())
}

fn record_events(p: &mut ContentPipeline) -> Arc<Mutex<Vec<PipelineEvent>>> {
    let log = Arc::new(Mutex::new(Vec::new()));
    let sink = log.clone();
    p.on_any(move |e| {
        sink.lock().unwrap().push(e.clone());
        Ok(())
    });
    log
}

fn count(events: &Mutex<Vec<PipelineEvent>>, kind: EventKind) -> usize {
    events.lock().unwrap().iter().filter(|e| e.kind() == kind).count()
}

// ── Configuration errors ─────────────────────────────────────────────────────

#[tokio::test]
async fn no_stages_is_rejected_with_message() {
    let mut p = pipeline();
    let err = p.execute().await.unwrap_err();
    assert!(matches!(err, PipelineError::NoStages));
    assert_eq!(err.to_string(), "No processing stages defined.");
    assert_eq!(p.status().phase, PipelinePhase::Failed);
}

#[tokio::test]
async fn no_documents_is_rejected() {
    let mut p = ContentPipeline::default();
    p.register_processor(Fixed::new("a", json!({})));
    p.add_stage(StageSpec::new("a", "a")).unwrap();
    assert!(matches!(p.execute().await, Err(PipelineError::NoDocuments)));
}

#[tokio::test]
async fn unknown_processor_is_rejected_at_add_time() {
    let mut p = pipeline();
    let err = p.add_stage(StageSpec::new("a", "missing")).unwrap_err();
    assert!(matches!(err, PipelineError::ProcessorNotFound { .. }));
    assert!(p.stages().is_empty());
}

#[tokio::test]
async fn duplicate_stage_id_is_rejected_at_add_time() {
    let mut p = pipeline();
    for name in ["a", "b", "x"] {
        p.register_processor(Fixed::new(name, json!({ "parts": [{"title": name}] })));
    }
    p.add_stage(StageSpec::new("b", "b").depends_on(["a"])).unwrap();
    p.add_stage(StageSpec::new("a", "a").depends_on(["x"])).unwrap();
    p.add_stage(StageSpec::new("x", "x")).unwrap();

    let err = p.add_stage(StageSpec::new("a", "x")).unwrap_err();
    assert!(matches!(err, PipelineError::DuplicateStage { ref stage_id } if stage_id == "a"));
    assert!(err.is_configuration());
    assert_eq!(p.stages().len(), 3);

    p.execute().await.unwrap();
    for id in ["x", "a", "b"] {
        assert_eq!(p.stage(id).unwrap().status, StageStatus::Completed, "stage {id}");
    }
    assert!(p.errors().is_empty());
}

#[tokio::test]
async fn missing_dependency_is_detected_only_at_execute() {
    let mut p = pipeline();
    let events = record_events(&mut p);
    p.register_processor(Fixed::new("a", json!({})));
    p.add_stage(StageSpec::new("a", "a").depends_on(["ghost"]))
        .expect("dependencies are not checked when adding");

    let err = p.execute().await.unwrap_err();
    match err {
        PipelineError::StageNotFound {
            stage_id,
            dependency,
        } => {
            assert_eq!(stage_id, "a");
            assert_eq!(dependency, "ghost");
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(count(&events, EventKind::StageStarted), 0);
    assert_eq!(p.stage("a").unwrap().status, StageStatus::Pending);
}

#[tokio::test]
async fn cycle_is_rejected_before_any_stage_runs() {
    let mut p = pipeline();
    let events = record_events(&mut p);
    p.register_processor(Fixed::new("a", json!({})));
    p.add_stage(StageSpec::new("x", "a").depends_on(["y"])).unwrap();
    p.add_stage(StageSpec::new("y", "a").depends_on(["x"])).unwrap();

    let err = p.execute().await.unwrap_err();
    assert!(matches!(err, PipelineError::CircularDependency { .. }));
    assert!(err.is_configuration());
    assert_eq!(count(&events, EventKind::StageStarted), 0);
    assert_eq!(count(&events, EventKind::PipelineStarted), 0);
    assert!(p.stages().iter().all(|s| s.status == StageStatus::Pending));
}

#[tokio::test]
async fn second_execute_is_rejected() {
    let mut p = pipeline();
    p.register_processor(Fixed::new("a", json!({ "parts": [{"title": "P"}] })));
    p.add_stage(StageSpec::new("a", "a")).unwrap();
    p.execute().await.unwrap();
    assert!(matches!(
        p.execute().await,
        Err(PipelineError::AlreadyExecuted)
    ));
}

// ── Input assembly ───────────────────────────────────────────────────────────

#[tokio::test]
async fn root_stage_receives_documents() {
    let mut p = pipeline();
    p.register_processor(Arc::new(Inspect));
    p.add_stage(StageSpec::new("root", "inspect")).unwrap();
    p.execute().await.unwrap();

    let out = p.stage("root").unwrap().output.clone().unwrap();
    assert_eq!(out.as_raw().unwrap()["arity"], "documents");
    assert_eq!(out.as_raw().unwrap()["count"], 3);
    assert!(p
        .documents()
        .iter()
        .all(|d| d.status == ProcessingStatus::Completed));
}

#[tokio::test]
async fn single_dependency_output_is_passed_unwrapped() {
    let mut p = pipeline();
    p.register_processor(Fixed::new("a", json!({ "v": 1 })));
    p.register_processor(Arc::new(Inspect));
    p.add_stage(StageSpec::new("a", "a")).unwrap();
    p.add_stage(StageSpec::new("b", "inspect").depends_on(["a"])).unwrap();
    p.execute().await.unwrap();

    let out = p.stage("b").unwrap().output.clone().unwrap();
    let raw = out.as_raw().unwrap();
    assert_eq!(raw["arity"], "single");
    assert_eq!(raw["value"], json!({ "v": 1 }));
}

#[tokio::test]
async fn several_dependencies_arrive_in_declared_order() {
    let mut p = pipeline();
    p.register_processor(Fixed::new("a", json!("from a")));
    p.register_processor(Fixed::new("b", json!("from b")));
    p.register_processor(Arc::new(Inspect));
    p.add_stage(StageSpec::new("a", "a")).unwrap();
    p.add_stage(StageSpec::new("b", "b")).unwrap();
    p.add_stage(StageSpec::new("join", "inspect").depends_on(["b", "a"])).unwrap();
    p.execute().await.unwrap();

    let out = p.stage("join").unwrap().output.clone().unwrap();
    let raw = out.as_raw().unwrap();
    assert_eq!(raw["arity"], "many");
    assert_eq!(raw["values"], json!(["from b", "from a"]));
}

#[tokio::test]
async fn dependent_of_failed_stage_without_output_is_skipped() {
    let mut p = pipeline();
    let events = record_events(&mut p);
    p.register_processor(Failing::recoverable("broken"));
    p.register_processor(Arc::new(Inspect));
    p.add_stage(StageSpec::new("a", "broken")).unwrap();
    p.add_stage(StageSpec::new("b", "inspect").depends_on(["a"])).unwrap();

    p.execute().await.unwrap();
    assert_eq!(p.stage("b").unwrap().status, StageStatus::Skipped);
    assert_eq!(p.metrics().stages_skipped, 1);
    assert_eq!(p.metrics().stages_failed, 1);
    assert_eq!(count(&events, EventKind::StageSkipped), 1);
    assert_eq!(p.status().phase, PipelinePhase::Completed);
}

#[tokio::test]
async fn partial_output_of_failed_stage_feeds_dependents() {
    let config = PipelineConfig::builder().failure_threshold(0).build().unwrap();
    let mut p = pipeline_with(config);
    p.register_processor(Failing::partial("half", json!({ "pages": 5 })));
    p.register_processor(Arc::new(Inspect));
    p.add_stage(StageSpec::new("a", "half")).unwrap();
    p.add_stage(StageSpec::new("b", "inspect").depends_on(["a"])).unwrap();

    p.execute().await.expect("partial output keeps the run going");
    let a = p.stage("a").unwrap();
    assert_eq!(a.status, StageStatus::Failed);
    assert_eq!(a.output, Some(StageOutput::Raw(json!({ "pages": 5 }))));

    let b = p.stage("b").unwrap();
    assert_eq!(b.status, StageStatus::Completed);
    assert_eq!(b.output.as_ref().unwrap().as_raw().unwrap()["value"]["pages"], 5);
    assert!(b.warnings.iter().any(|w| w.contains("partial output")));
}

// ── Progress and metrics ─────────────────────────────────────────────────────

#[tokio::test]
async fn progress_is_rounded_and_monotonic() {
    let mut p = pipeline();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    p.on(EventKind::ProgressUpdated, move |e| {
        if let PipelineEvent::ProgressUpdated { progress, .. } = e {
            sink.lock().unwrap().push(*progress);
        }
        Ok(())
    });
    for name in ["a", "b", "c"] {
        p.register_processor(Fixed::new(name, json!({ "parts": [{"title": name}] })));
    }
    p.add_stage(StageSpec::new("a", "a")).unwrap();
    p.add_stage(StageSpec::new("b", "b").depends_on(["a"])).unwrap();
    p.add_stage(StageSpec::new("c", "c").depends_on(["b"])).unwrap();

    p.execute().await.unwrap();
    assert_eq!(*seen.lock().unwrap(), vec![33, 67, 100]);
    assert_eq!(p.status().progress, 100);
    assert_eq!(p.status().phase, PipelinePhase::Completed);
}

#[tokio::test]
async fn quality_scores_are_averaged() {
    let mut p = pipeline();
    for (name, q) in [("a", 0.6), ("b", 0.8), ("c", 1.0)] {
        p.register_processor(Fixed::with_quality(name, q));
        p.add_stage(StageSpec::new(name, name)).unwrap();
    }
    p.execute().await.unwrap();
    let m = p.metrics();
    assert_eq!(m.stages_completed, 3);
    assert!((m.average_quality_score - 0.8).abs() < 1e-9, "got {}", m.average_quality_score);
    assert_eq!(m.total_documents, 3);
    assert_eq!(m.documents_processed, 3);
}

// ── Failure handling ─────────────────────────────────────────────────────────

#[tokio::test]
async fn threshold_one_aborts_on_second_fatal_failure() {
    let config = PipelineConfig::builder().failure_threshold(1).build().unwrap();
    let mut p = pipeline_with(config);
    let events = record_events(&mut p);
    p.register_processor(Failing::fatal("f1"));
    p.register_processor(Failing::fatal("f2"));
    p.register_processor(Fixed::new("ok", json!({})));
    p.add_stage(StageSpec::new("first", "f1")).unwrap();
    p.add_stage(StageSpec::new("second", "f2")).unwrap();
    p.add_stage(StageSpec::new("third", "ok")).unwrap();

    let err = p.execute().await.unwrap_err();
    match &err {
        PipelineError::Aborted { stage_id, .. } => assert_eq!(stage_id, "second"),
        other => panic!("unexpected error: {other}"),
    }
    let fallback = err.fallback().expect("aborted runs carry a document");
    assert_eq!(fallback.parts.len(), 3);

    assert_eq!(p.status().phase, PipelinePhase::Failed);
    assert_eq!(p.metrics().stages_failed, 2);
    assert_eq!(p.stage("third").unwrap().status, StageStatus::Pending);
    assert_eq!(count(&events, EventKind::PipelineFailed), 1);
    assert_eq!(count(&events, EventKind::PipelineCompleted), 0);
    assert!(p
        .errors()
        .iter()
        .any(|e| e.stage_id == "pipeline" && e.message.contains("second")));
}

#[tokio::test]
async fn critical_stage_failure_aborts_immediately() {
    let config = PipelineConfig::builder()
        .critical_stage("extract")
        .build()
        .unwrap();
    let mut p = pipeline_with(config);
    p.register_processor(Failing::recoverable("extractor"));
    p.add_stage(StageSpec::new("extract", "extractor")).unwrap();

    let err = p.execute().await.unwrap_err();
    assert!(matches!(err, PipelineError::Aborted { ref stage_id, .. } if stage_id == "extract"));
    assert!(!err.is_configuration());
}

#[tokio::test]
async fn all_stages_failing_yields_fallback_document() {
    let mut p = pipeline();
    p.register_processor(Failing::recoverable("f1"));
    p.register_processor(Failing::recoverable("f2"));
    p.add_stage(StageSpec::new("a", "f1")).unwrap();
    p.add_stage(StageSpec::new("b", "f2")).unwrap();

    let doc = p.execute().await.expect("recoverable failures keep the run going");
    assert_eq!(doc.parts.len(), 3);
    assert_eq!(doc.parts[0].title, "Lecture: lecture 01");
    assert_eq!(doc.metadata.preservation_score, 0.5);
    assert_eq!(doc.metadata.source_files.len(), 3);
    assert_eq!(p.status().phase, PipelinePhase::Completed);
    assert_eq!(p.metrics().stages_failed, 2);
    assert_eq!(p.metrics().documents_failed, 3);
    assert!(p.warnings().iter().any(|w| w.contains("synthesised")));
    assert!(p.warnings().iter().any(|w| w.contains("below the configured threshold")));
}

#[tokio::test]
async fn timeout_fails_stage_and_cancels_its_token() {
    let config = PipelineConfig::builder().timeout_ms(50).build().unwrap();
    let mut p = pipeline_with(config);
    let fired = Arc::new(AtomicBool::new(false));
    p.register_processor(Arc::new(Slow {
        token_fired: fired.clone(),
    }));
    p.add_stage(StageSpec::new("slow", "slow")).unwrap();

    let started = std::time::Instant::now();
    p.execute().await.expect("one recoverable failure is tolerated");
    assert!(started.elapsed() < Duration::from_secs(5));

    let stage = p.stage("slow").unwrap();
    assert_eq!(stage.status, StageStatus::Failed);
    let err = stage.last_error().unwrap();
    assert_eq!(err.kind, ErrorKind::System);
    assert!(err.recoverable);
    assert!(err.message.contains("timed out after 50ms"), "got: {}", err.message);

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(fired.load(Ordering::SeqCst));
}

#[tokio::test]
async fn successful_recovery_completes_the_stage() {
    let mut p = pipeline();
    let events = record_events(&mut p);
    p.register_processor(Arc::new(Recovering { heals: true }));
    p.add_stage(StageSpec::new("r", "recovering")).unwrap();

    p.execute().await.unwrap();
    let stage = p.stage("r").unwrap();
    assert_eq!(stage.status, StageStatus::Completed);
    assert_eq!(stage.output, Some(StageOutput::Raw(json!({ "recovered": true }))));
    assert_eq!(stage.errors.len(), 1);
    assert_eq!(p.metrics().stages_completed, 1);
    assert_eq!(p.metrics().stages_failed, 0);
    assert!((p.metrics().average_quality_score - 0.5).abs() < 1e-9);
    assert_eq!(count(&events, EventKind::StageRecovered), 1);
    assert_eq!(count(&events, EventKind::StageError), 1);
    assert_eq!(count(&events, EventKind::StageCompleted), 0);
}

#[tokio::test]
async fn failed_recovery_appends_a_second_error() {
    let mut p = pipeline();
    p.register_processor(Arc::new(Recovering { heals: false }));
    p.add_stage(StageSpec::new("r", "recovering")).unwrap();

    p.execute().await.unwrap();
    let stage = p.stage("r").unwrap();
    assert_eq!(stage.status, StageStatus::Failed);
    assert_eq!(stage.errors.len(), 2);
    assert!(stage.errors[1].message.starts_with("Recovery failed"));
    assert!(!stage.errors[1].recoverable);
    assert_eq!(p.metrics().stages_failed, 1);
}

#[tokio::test]
async fn recovery_is_not_attempted_when_disabled() {
    let config = PipelineConfig::builder().enable_recovery(false).build().unwrap();
    let mut p = pipeline_with(config);
    p.register_processor(Arc::new(Recovering { heals: true }));
    p.add_stage(StageSpec::new("r", "recovering")).unwrap();

    p.execute().await.unwrap();
    let stage = p.stage("r").unwrap();
    assert_eq!(stage.status, StageStatus::Failed);
    assert_eq!(stage.errors.len(), 1);
}

#[tokio::test]
async fn fatal_failure_is_not_recovered() {
    let mut p = pipeline();
    let events = record_events(&mut p);
    let recover_called = Arc::new(AtomicBool::new(false));
    p.register_processor(Arc::new(Doomed {
        recover_called: recover_called.clone(),
    }));
    p.add_stage(StageSpec::new("d", "doomed")).unwrap();

    p.execute().await.unwrap();
    assert!(!recover_called.load(Ordering::SeqCst));
    let stage = p.stage("d").unwrap();
    assert_eq!(stage.status, StageStatus::Failed);
    assert_eq!(stage.errors.len(), 1);
    assert!(!stage.errors[0].recoverable);
    assert_eq!(p.metrics().stages_failed, 1);
    assert_eq!(count(&events, EventKind::StageRecovered), 0);
}

#[tokio::test]
async fn validation_failure_skips_processing_and_recovery() {
    let mut p = pipeline();
    let processed = Arc::new(AtomicBool::new(false));
    p.register_processor(Arc::new(Rejecting {
        processed: processed.clone(),
    }));
    p.add_stage(StageSpec::new("v", "rejecting")).unwrap();

    p.execute().await.unwrap();
    assert!(!processed.load(Ordering::SeqCst));
    let stage = p.stage("v").unwrap();
    assert_eq!(stage.status, StageStatus::Failed);
    let err = stage.last_error().unwrap();
    assert_eq!(err.kind, ErrorKind::Validation);
    assert!(err.message.contains("not a course document"));
}

#[tokio::test]
async fn panicking_processor_is_contained() {
    let mut p = pipeline();
    p.register_processor(Arc::new(Panicking));
    p.register_processor(Fixed::new("after", json!({ "parts": [{"title": "Still here"}] })));
    p.add_stage(StageSpec::new("boom", "panicking")).unwrap();
    p.add_stage(StageSpec::new("after", "after")).unwrap();

    let doc = p.execute().await.unwrap();
    let err = p.stage("boom").unwrap().last_error().unwrap().clone();
    assert!(err.message.contains("panicked"), "got: {}", err.message);
    assert_eq!(p.stage("after").unwrap().status, StageStatus::Completed);
    assert_eq!(doc.parts[0].title, "Still here");
}

#[tokio::test]
async fn misbehaving_listeners_do_not_break_the_run() {
    let mut p = pipeline();
    p.on(EventKind::StageCompleted, |_| Err("listener is broken".into()));
    p.on_any(|e| {
        if e.kind() == EventKind::ProgressUpdated {
            panic!("listener panicked");
        }
        Ok(())
    });
    p.register_processor(Fixed::new("a", json!({ "parts": [{"title": "P"}] })));
    p.add_stage(StageSpec::new("a", "a")).unwrap();

    p.execute().await.unwrap();
    assert_eq!(p.status().phase, PipelinePhase::Completed);
}

// ── Cancellation ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn cancel_between_stages_skips_the_rest() {
    let mut p = pipeline();
    let events = record_events(&mut p);
    let handle = p.cancel_handle();
    p.on(EventKind::StageCompleted, move |e| {
        if let PipelineEvent::StageCompleted { stage_id, .. } = e {
            if stage_id == "a" {
                handle.cancel();
            }
        }
        Ok(())
    });
    for name in ["a", "b", "c"] {
        p.register_processor(Fixed::new(name, json!({ "parts": [{"title": name}] })));
    }
    p.add_stage(StageSpec::new("a", "a")).unwrap();
    p.add_stage(StageSpec::new("b", "b").depends_on(["a"])).unwrap();
    p.add_stage(StageSpec::new("c", "c").depends_on(["b"])).unwrap();

    let doc = p.execute().await.expect("cancelled runs still return a document");
    assert_eq!(doc.parts[0].title, "a");
    assert_eq!(p.status().phase, PipelinePhase::Cancelled);
    assert_eq!(p.stage("b").unwrap().status, StageStatus::Skipped);
    assert_eq!(p.stage("c").unwrap().status, StageStatus::Skipped);
    assert_eq!(count(&events, EventKind::PipelineCancelled), 1);
    assert_eq!(count(&events, EventKind::PipelineCompleted), 0);

    // A later cancel is a no-op.
    p.cancel();
    assert_eq!(count(&events, EventKind::PipelineCancelled), 1);
}

#[tokio::test]
async fn cancel_during_last_stage_is_reported() {
    let mut p = pipeline();
    let events = record_events(&mut p);
    let handle = p.cancel_handle();
    p.on(EventKind::StageStarted, move |_| {
        handle.cancel();
        Ok(())
    });
    p.register_processor(Fixed::new("only", json!({ "parts": [{"title": "Only"}] })));
    p.add_stage(StageSpec::new("only", "only")).unwrap();

    let doc = p.execute().await.expect("cancelled runs still return a document");
    assert_eq!(doc.parts[0].title, "Only");
    assert_eq!(p.status().phase, PipelinePhase::Cancelled);
    assert_eq!(count(&events, EventKind::PipelineCancelled), 1);
    assert_eq!(count(&events, EventKind::PipelineCompleted), 0);
}

#[tokio::test]
async fn cancel_after_completion_is_ignored() {
    let mut p = pipeline();
    let events = record_events(&mut p);
    p.register_processor(Fixed::new("a", json!({ "parts": [{"title": "P"}] })));
    p.add_stage(StageSpec::new("a", "a")).unwrap();
    p.execute().await.unwrap();

    p.cancel();
    assert_eq!(p.status().phase, PipelinePhase::Completed);
    assert_eq!(count(&events, EventKind::PipelineCancelled), 0);
}

// ── Synthesis ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn canonical_final_output_is_returned() {
    let mut p = pipeline();
    p.register_processor(Fixed::new("a", json!({})));
    p.register_processor(Arc::new(Canonical));
    p.add_stage(StageSpec::new("a", "a")).unwrap();
    p.add_stage(StageSpec::new("layout", "canonical").depends_on(["a"])).unwrap();

    let doc = p.execute().await.unwrap();
    assert_eq!(doc.title, "Final");
    assert_eq!(doc.metadata.preservation_score, 0.95);
    assert_eq!(doc.table_of_contents.len(), 1);
    assert!(p.warnings().is_empty());
}

// ── Built-in chain ───────────────────────────────────────────────────────────

const LECTURE: &str = "# Limits\n\
    Limits describe behaviour near a point.\n\
    \n\
    ## Definition\n\
    $$\\lim_{x \\to a} f(x) = L$$\n\
    \n\
    Example 1: The limit of x as x approaches 2 is 2.\n\
    \n\
    ## Continuity\n\
    A function is continuous when the definition above holds with L = f(a).\n";

const EXERCISES: &str = "Exercise sheet\n\
    \n\
    1 Warm-up\n\
    Compute the following limits.\n";

#[tokio::test]
async fn builtin_chain_assembles_documents() {
    let mut p = ContentPipeline::default();
    let events = record_events(&mut p);
    for (name, body) in [("lecture_01.md", LECTURE), ("exercises_01.md", EXERCISES)] {
        p.add_source_document(name, body.as_bytes().to_vec(), DocumentCategory::infer(name));
    }
    processors::install_default_chain(&mut p).unwrap();

    let doc = p.execute().await.unwrap();
    assert!(p.stages().iter().all(|s| s.status == StageStatus::Completed));
    assert_eq!(count(&events, EventKind::PipelineCompleted), 1);

    assert_eq!(doc.parts.len(), 2);
    assert_eq!(doc.parts[0].title, "Limits");
    assert_eq!(doc.metadata.total_formulas, 1);
    assert_eq!(doc.metadata.total_examples, 1);
    assert_eq!(doc.metadata.source_files, vec!["lecture_01.md", "exercises_01.md"]);
    assert!(doc
        .cross_references
        .iter()
        .any(|r| r.label == "Definition"));
    assert!(doc.to_markdown().contains("### Continuity"));
}

#[tokio::test]
async fn builtin_chain_output_is_written_to_disk() {
    let mut p = ContentPipeline::default();
    p.add_source_document("summary.md", LECTURE.as_bytes().to_vec(), DocumentCategory::Summary);
    processors::install_default_chain(&mut p).unwrap();
    let doc = p.execute().await.unwrap();

    let dir = tempfile::tempdir().unwrap();
    let base = dir.path().join("course");
    for format in [OutputFormat::Markdown, OutputFormat::Json] {
        doc.write_to(base.with_extension(format.extension()), format)
            .await
            .unwrap();
    }
    let md = std::fs::read_to_string(base.with_extension("md")).unwrap();
    assert!(md.starts_with("# Limits"));
    let json = std::fs::read_to_string(base.with_extension("json")).unwrap();
    let back: OutputDocument = serde_json::from_str(&json).unwrap();
    assert_eq!(back.parts.len(), 1);

    let err = doc
        .write_to(base.with_extension("pdf"), OutputFormat::Pdf)
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::UnsupportedFormat(OutputFormat::Pdf)));
}
