//! The pipeline driver.
//!
//! [`ContentPipeline`] owns everything one run needs: the processor
//! registry, the document intake, the stage list, the event bus, status and
//! metrics. Nothing is global, so independent pipelines can run side by side
//! in one process.
//!
//! ## Run lifecycle
//!
//! ```text
//! add_source_document / register_processor / add_stage / on
//!          │
//!          ▼
//! execute() ── preconditions ── topological sort ── stages in order ── synthesis
//!                                                        │
//!                                    failure ──▶ continuation policy ──▶ abort?
//! ```
//!
//! A pipeline instance runs once; build a new one for the next batch.

use crate::config::PipelineConfig;
use crate::document::{DocumentCategory, SourceDocument};
use crate::error::{ErrorKind, PipelineError, ProcessingError, Severity, PIPELINE_STAGE_ID};
use crate::events::{EventBus, EventKind, ListenerError, PipelineEvent};
use crate::metrics::{PipelineMetrics, PipelinePhase, PipelineStatus};
use crate::output::OutputDocument;
use crate::pipeline::executor::StageRun;
use crate::pipeline::graph;
use crate::pipeline::policy::{self, Decision};
use crate::pipeline::synthesis::{self, SynthesisSource};
use crate::processor::{ContentProcessor, ProcessorRegistry};
use crate::stage::{ProcessingStage, StageSpec, StageStatus};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Cloneable handle that requests cancellation of a running pipeline.
///
/// Cancellation is cooperative: the driver stops scheduling stages, and
/// in-flight processors see their [`crate::processor::ProcessorContext`]
/// token fire.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    token: CancellationToken,
}

impl CancelHandle {
    /// Request cancellation. Idempotent and infallible.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// A DAG of processing stages over a batch of documents.
pub struct ContentPipeline {
    pub(crate) config: PipelineConfig,
    pub(crate) registry: ProcessorRegistry,
    pub(crate) documents: Vec<SourceDocument>,
    pub(crate) stages: Vec<ProcessingStage>,
    pub(crate) bus: EventBus,
    pub(crate) status: PipelineStatus,
    pub(crate) metrics: PipelineMetrics,
    pub(crate) errors: Vec<ProcessingError>,
    pub(crate) warnings: Vec<String>,
    pub(crate) cancel: CancellationToken,
    cancel_reported: bool,
    executed: bool,
}

impl Default for ContentPipeline {
    fn default() -> Self {
        Self::new(PipelineConfig::default())
    }
}

impl ContentPipeline {
    pub fn new(config: PipelineConfig) -> Self {
        Self {
            config,
            registry: ProcessorRegistry::new(),
            documents: Vec::new(),
            stages: Vec::new(),
            bus: EventBus::new(),
            status: PipelineStatus::default(),
            metrics: PipelineMetrics::default(),
            errors: Vec::new(),
            warnings: Vec::new(),
            cancel: CancellationToken::new(),
            cancel_reported: false,
            executed: false,
        }
    }

    // ── Assembly ─────────────────────────────────────────────────────────

    /// Add a document to the intake and return its generated id.
    pub fn add_source_document(
        &mut self,
        name: impl Into<String>,
        payload: impl Into<Arc<[u8]>>,
        category: DocumentCategory,
    ) -> Uuid {
        let doc = SourceDocument::new(name, payload, category);
        let id = doc.id;
        debug!("Document added: {} ({} bytes, {})", doc.name, doc.size(), doc.category);
        self.bus.emit(&PipelineEvent::DocumentAdded {
            document_id: id,
            name: doc.name.clone(),
            category: doc.category,
        });
        self.documents.push(doc);
        id
    }

    /// Register a processor under its name, replacing any previous one.
    pub fn register_processor(&mut self, processor: Arc<dyn ContentProcessor>) {
        let name = processor.name().to_string();
        let version = processor.version().to_string();
        if self.registry.register(processor).is_some() {
            debug!("Processor '{}' replaced by v{}", name, version);
        }
        self.bus
            .emit(&PipelineEvent::ProcessorRegistered { name, version });
    }

    /// Add a stage. The processor must already be registered and the id
    /// unused; dependencies are checked only when the pipeline executes.
    pub fn add_stage(&mut self, spec: StageSpec) -> Result<(), PipelineError> {
        if self.stages.iter().any(|s| s.id == spec.id) {
            return Err(PipelineError::DuplicateStage { stage_id: spec.id });
        }
        if !self.registry.contains(&spec.processor) {
            return Err(PipelineError::ProcessorNotFound {
                stage_id: spec.id,
                processor: spec.processor,
            });
        }
        self.bus.emit(&PipelineEvent::StageAdded {
            stage_id: spec.id.clone(),
            processor: spec.processor.clone(),
        });
        self.stages.push(spec.into());
        Ok(())
    }

    /// Subscribe to one event kind.
    pub fn on<F>(&mut self, kind: EventKind, listener: F)
    where
        F: Fn(&PipelineEvent) -> Result<(), ListenerError> + Send + Sync + 'static,
    {
        self.bus.on(kind, listener);
    }

    /// Subscribe to every event.
    pub fn on_any<F>(&mut self, listener: F)
    where
        F: Fn(&PipelineEvent) -> Result<(), ListenerError> + Send + Sync + 'static,
    {
        self.bus.on_any(listener);
    }

    pub fn events_mut(&mut self) -> &mut EventBus {
        &mut self.bus
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle {
            token: self.cancel.clone(),
        }
    }

    /// Cancel the run. Emits `pipeline_cancelled` once; a finished run is
    /// left untouched.
    pub fn cancel(&mut self) {
        if matches!(
            self.status.phase,
            PipelinePhase::Completed | PipelinePhase::Failed
        ) {
            return;
        }
        self.cancel.cancel();
        self.report_cancelled();
    }

    // ── Accessors ────────────────────────────────────────────────────────

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn status(&self) -> &PipelineStatus {
        &self.status
    }

    pub fn metrics(&self) -> &PipelineMetrics {
        &self.metrics
    }

    pub fn errors(&self) -> &[ProcessingError] {
        &self.errors
    }

    /// Pipeline-level warnings (stage warnings live on each stage).
    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    pub fn stages(&self) -> &[ProcessingStage] {
        &self.stages
    }

    pub fn stage(&self, id: &str) -> Option<&ProcessingStage> {
        self.stages.iter().find(|s| s.id == id)
    }

    pub fn documents(&self) -> &[SourceDocument] {
        &self.documents
    }

    pub fn registry(&self) -> &ProcessorRegistry {
        &self.registry
    }

    // ── Execution ────────────────────────────────────────────────────────

    /// Run every stage in dependency order and return the final document.
    ///
    /// # Errors
    /// - Configuration errors (no documents, no stages, unknown dependency,
    ///   cycle, second run), raised before any stage runs.
    /// - [`PipelineError::Aborted`] when the continuation policy stops the
    ///   run; the error still carries a best-effort document.
    pub async fn execute(&mut self) -> Result<OutputDocument, PipelineError> {
        if self.executed {
            return Err(PipelineError::AlreadyExecuted);
        }
        self.executed = true;

        let order = match self.check_preconditions() {
            Ok(order) => order,
            Err(e) => {
                warn!("Pipeline configuration rejected: {}", e);
                self.status.phase = PipelinePhase::Failed;
                return Err(e);
            }
        };

        let started = Utc::now();
        let total = order.len();
        self.status.started_at = Some(started);
        if self.status.phase != PipelinePhase::Cancelled {
            self.status.phase = PipelinePhase::Processing;
        }
        self.metrics.total_stages = total;
        self.metrics.total_documents = self.documents.len();
        info!(
            "Starting pipeline: {} stages over {} documents",
            total,
            self.documents.len()
        );
        self.bus.emit(&PipelineEvent::PipelineStarted {
            total_stages: total,
            total_documents: self.documents.len(),
        });

        let mut processed = 0;
        for (pos, &idx) in order.iter().enumerate() {
            if self.cancel.is_cancelled() {
                self.report_cancelled();
                self.skip_remaining(&order[pos..]);
                break;
            }

            let stage_id = self.stages[idx].id.clone();
            self.status.current_stage = Some(stage_id.clone());
            self.bus.emit(&PipelineEvent::StageStarted {
                stage_id: stage_id.clone(),
                index: pos + 1,
                total,
            });

            match self.run_stage(idx).await {
                StageRun::Completed | StageRun::Recovered => {}
                StageRun::Skipped(reason) => {
                    self.metrics.stages_skipped += 1;
                    self.bus
                        .emit(&PipelineEvent::StageSkipped { stage_id, reason });
                }
                StageRun::Failed(error) => {
                    let prior_failures = self.metrics.stages_failed;
                    self.metrics.stages_failed += 1;
                    self.bus.emit(&PipelineEvent::StageFailed {
                        stage_id: stage_id.clone(),
                        error: error.clone(),
                    });
                    match policy::decide(&self.config, &self.stages[idx], prior_failures) {
                        Decision::Continue(reason) => {
                            debug!("Continuing after '{}' failed ({:?})", stage_id, reason);
                        }
                        Decision::Abort(reason) => {
                            warn!("Aborting after '{}' failed ({:?})", stage_id, reason);
                            return Err(self.abort(&order, &stage_id, error, started));
                        }
                    }
                }
            }

            processed += 1;
            let progress = self.status.advance(processed, total);
            self.bus.emit(&PipelineEvent::ProgressUpdated {
                progress,
                processed,
                total,
            });
        }

        // A cancel that lands while the last stage runs is only visible here.
        if self.cancel.is_cancelled() {
            self.report_cancelled();
        }

        Ok(self.finish(&order, started))
    }

    fn check_preconditions(&self) -> Result<Vec<usize>, PipelineError> {
        if self.documents.is_empty() {
            return Err(PipelineError::NoDocuments);
        }
        if self.stages.is_empty() {
            return Err(PipelineError::NoStages);
        }
        graph::validate_dependencies(&self.stages)?;
        graph::topological_order(&self.stages)
    }

    fn synthesize(&mut self, order: &[usize]) -> OutputDocument {
        let (doc, source) = synthesis::synthesize(&self.stages, order, &self.documents);
        if source == SynthesisSource::Fallback {
            self.warnings
                .push("No stage produced usable output; document synthesised from sources".into());
        }
        let score = doc.metadata.preservation_score;
        if score < self.config.preservation_threshold {
            let msg = format!(
                "Preservation score {:.2} is below the configured threshold {:.2}",
                score, self.config.preservation_threshold
            );
            warn!("{}", msg);
            self.warnings.push(msg);
        }
        doc
    }

    fn finish(&mut self, order: &[usize], started: DateTime<Utc>) -> OutputDocument {
        let doc = self.synthesize(order);
        let ended = Utc::now();
        self.status.current_stage = None;
        self.status.completed_at = Some(ended);
        self.metrics
            .finalize(started, ended, &self.documents, self.errors.len());
        self.metrics.total_warnings = self.warnings_count();

        if self.status.phase == PipelinePhase::Cancelled {
            info!(
                "Pipeline cancelled after {}/{} stages",
                self.metrics.stages_completed, self.metrics.total_stages
            );
            return doc;
        }

        self.status.phase = PipelinePhase::Completed;
        self.status.progress = 100;
        info!(
            "Pipeline complete: {}/{} stages succeeded, {} failed, {}ms",
            self.metrics.stages_completed,
            self.metrics.total_stages,
            self.metrics.stages_failed,
            self.metrics.processing_time_ms
        );
        self.bus.emit(&PipelineEvent::PipelineCompleted {
            metrics: self.metrics.clone(),
        });
        doc
    }

    fn abort(
        &mut self,
        order: &[usize],
        stage_id: &str,
        error: ProcessingError,
        started: DateTime<Utc>,
    ) -> PipelineError {
        let fatal = ProcessingError::new(
            PIPELINE_STAGE_ID,
            ErrorKind::System,
            Severity::Critical,
            format!("Pipeline stopped after stage '{}' failed: {}", stage_id, error.message),
            false,
        );
        self.errors.push(fatal);

        let fallback = self.synthesize(order);
        let ended = Utc::now();
        self.status.phase = PipelinePhase::Failed;
        self.status.completed_at = Some(ended);
        self.metrics
            .finalize(started, ended, &self.documents, self.errors.len());
        self.metrics.total_warnings = self.warnings_count();

        self.bus.emit(&PipelineEvent::PipelineFailed {
            stage_id: stage_id.to_string(),
            message: error.message.clone(),
        });
        PipelineError::Aborted {
            stage_id: stage_id.to_string(),
            message: error.message,
            fallback: Box::new(fallback),
        }
    }

    fn skip_remaining(&mut self, remaining: &[usize]) {
        for &idx in remaining {
            let stage = &mut self.stages[idx];
            stage.status = StageStatus::Skipped;
            stage.warnings.push("Pipeline cancelled before this stage ran".into());
            self.metrics.stages_skipped += 1;
        }
    }

    fn report_cancelled(&mut self) {
        if self.cancel_reported {
            return;
        }
        self.cancel_reported = true;
        self.status.phase = PipelinePhase::Cancelled;
        warn!("Pipeline cancelled");
        self.bus.emit(&PipelineEvent::PipelineCancelled {
            current_stage: self.status.current_stage.clone(),
        });
    }
}

impl std::fmt::Debug for ContentPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContentPipeline")
            .field("config", &self.config)
            .field("registry", &self.registry)
            .field("documents", &self.documents.len())
            .field("stages", &self.stages.iter().map(|s| &s.id).collect::<Vec<_>>())
            .field("status", &self.status)
            .finish()
    }
}
