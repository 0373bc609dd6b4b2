//! Stage executor: drive one stage from input assembly to a terminal status.
//!
//! ```text
//! assemble input ──▶ validate? ──▶ process (timed) ──▶ Completed
//!                        │               │
//!                        ▼               ▼
//!                     Failed ◀── recover? ──▶ Completed (recovered)
//! ```
//!
//! The executor records everything on the stage and the pipeline (status,
//! timestamps, errors, warnings, running averages) and emits the stage-level
//! events. What happens to the run after a failure is the driver's call.

use crate::document::ProcessingStatus;
use crate::engine::ContentPipeline;
use crate::error::{ErrorKind, ProcessingError, ProcessorFailure, Severity};
use crate::events::{panic_message, PipelineEvent};
use crate::processor::{ContentProcessor, ProcessingResult, ProcessorContext, StageInput};
use crate::stage::StageStatus;
use chrono::Utc;
use futures::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Terminal outcome of one stage.
#[derive(Debug)]
pub(crate) enum StageRun {
    Completed,
    Recovered,
    Skipped(String),
    /// Carries the original failure; recovery was unavailable or failed too.
    Failed(ProcessingError),
}

/// Why input assembly did not yield an input.
enum InputIssue {
    /// A dependency ended without usable output.
    Skip(String),
    /// A dependency has not reached a terminal state.
    NotReady(String),
}

impl ContentPipeline {
    pub(crate) async fn run_stage(&mut self, idx: usize) -> StageRun {
        let stage_id = self.stages[idx].id.clone();
        {
            let stage = &mut self.stages[idx];
            stage.status = StageStatus::Running;
            stage.started_at = Some(Utc::now());
        }

        // ── Step 1: Input assembly ───────────────────────────────────────
        let input = match self.assemble_input(idx) {
            Ok(input) => input,
            Err(InputIssue::Skip(reason)) => {
                info!("Stage '{}' skipped: {}", stage_id, reason);
                let stage = &mut self.stages[idx];
                stage.status = StageStatus::Skipped;
                stage.completed_at = Some(Utc::now());
                stage.warnings.push(reason.clone());
                return StageRun::Skipped(reason);
            }
            Err(InputIssue::NotReady(dep)) => {
                let err = ProcessingError::new(
                    &stage_id,
                    ErrorKind::System,
                    Severity::High,
                    format!("Dependency '{dep}' is not ready"),
                    false,
                );
                self.record_error(idx, err.clone());
                self.mark_failed(idx, &err);
                return StageRun::Failed(err);
            }
        };
        let is_root = matches!(input, StageInput::Documents(_));
        if is_root {
            self.set_pending_documents(ProcessingStatus::Processing);
        }

        let Some(processor) = self.registry.get(&self.stages[idx].processor) else {
            let err = ProcessingError::new(
                &stage_id,
                ErrorKind::System,
                Severity::Critical,
                format!("Processor '{}' is not registered", self.stages[idx].processor),
                false,
            );
            self.record_error(idx, err.clone());
            self.mark_failed(idx, &err);
            self.settle_documents(is_root, false, &err.message);
            return StageRun::Failed(err);
        };
        let config = self.stages[idx].config.clone();
        let timeout = Duration::from_millis(self.config.timeout_ms);
        let ctx = ProcessorContext::new(&stage_id, self.cancel.child_token());

        debug!(
            "Stage '{}' → processor '{}' v{}",
            stage_id,
            processor.name(),
            processor.version()
        );

        // ── Step 2: Validation ───────────────────────────────────────────
        let validation = run_guarded(timeout, &ctx, processor.validate(&input, &config, &ctx)).await;
        let validation_failure = match validation {
            Ok(Some(v)) if !v.passed => Some(format!("Validation failed: {}", v.details)),
            Ok(_) => None,
            Err(reason) => Some(format!("Validation did not complete: {reason}")),
        };
        if let Some(message) = validation_failure {
            warn!("Stage '{}': {}", stage_id, message);
            let err = ProcessingError::new(
                &stage_id,
                ErrorKind::Validation,
                Severity::High,
                message,
                false,
            );
            self.record_error(idx, err.clone());
            self.mark_failed(idx, &err);
            self.settle_documents(is_root, false, &err.message);
            return StageRun::Failed(err);
        }

        // ── Step 3: Timed execution ──────────────────────────────────────
        let start = Instant::now();
        let outcome = run_guarded(timeout, &ctx, processor.process(&input, &config, &ctx)).await;
        let elapsed_ms = start.elapsed().as_millis() as u64;

        let failure = match outcome {
            Ok(Ok(result)) if result.success => {
                // ── Step 4: Success ──────────────────────────────────────
                self.complete(idx, result, elapsed_ms);
                self.settle_documents(is_root, true, "");
                return StageRun::Completed;
            }
            Ok(Ok(result)) => {
                let message = if result.errors.is_empty() {
                    "Processor reported failure".to_string()
                } else {
                    result.errors.join("; ")
                };
                let stage = &mut self.stages[idx];
                stage.warnings.extend(result.warnings);
                self.metrics.total_warnings = self.warnings_count();
                // Partial data stays on the failed stage for dependents.
                self.stages[idx].output = result.data;
                ProcessorFailure::new(message)
            }
            Ok(Err(failure)) => failure,
            Err(reason) => ProcessorFailure::new(reason).with_kind(ErrorKind::System),
        };

        // ── Step 5: Failure & recovery ───────────────────────────────────
        warn!("Stage '{}' failed: {}", stage_id, failure.message);
        let err = ProcessingError::new(
            &stage_id,
            failure.kind,
            Severity::High,
            failure.message,
            failure.recoverable,
        );
        self.record_error(idx, err.clone());
        self.mark_failed(idx, &err);

        if self.config.enable_recovery && err.recoverable {
            if let Some(run) = self
                .attempt_recovery(idx, &processor, &err, &input, &config, timeout)
                .await
            {
                self.settle_documents(is_root, matches!(run, StageRun::Recovered), &err.message);
                return run;
            }
        }

        self.settle_documents(is_root, false, &err.message);
        StageRun::Failed(err)
    }

    /// `None` when the processor exposes no recovery path.
    async fn attempt_recovery(
        &mut self,
        idx: usize,
        processor: &Arc<dyn ContentProcessor>,
        err: &ProcessingError,
        input: &StageInput,
        config: &serde_json::Value,
        timeout: Duration,
    ) -> Option<StageRun> {
        let stage_id = self.stages[idx].id.clone();
        // The primary token may already be cancelled by a timeout.
        let ctx = ProcessorContext::new(&stage_id, self.cancel.child_token());
        let start = Instant::now();
        let outcome = match run_guarded(timeout, &ctx, processor.recover(err, input, config, &ctx)).await {
            Ok(None) => return None,
            Ok(Some(Ok(result))) if result.success => Ok(result),
            Ok(Some(Ok(result))) => Err(if result.errors.is_empty() {
                "recovery reported failure".to_string()
            } else {
                result.errors.join("; ")
            }),
            Ok(Some(Err(failure))) => Err(failure.message),
            Err(reason) => Err(reason),
        };

        match outcome {
            Ok(result) => {
                info!("Stage '{}' recovered", stage_id);
                self.complete_quietly(idx, result);
                self.bus.emit(&PipelineEvent::StageRecovered {
                    stage_id: stage_id.clone(),
                });
                debug!(
                    "Stage '{}' recovery took {}ms",
                    stage_id,
                    start.elapsed().as_millis()
                );
                Some(StageRun::Recovered)
            }
            Err(reason) => {
                warn!("Stage '{}' recovery failed: {}", stage_id, reason);
                let recovery_err = ProcessingError::new(
                    &stage_id,
                    ErrorKind::Transformation,
                    Severity::High,
                    format!("Recovery failed: {reason}"),
                    false,
                );
                self.record_error(idx, recovery_err);
                Some(StageRun::Failed(err.clone()))
            }
        }
    }

    fn assemble_input(&mut self, idx: usize) -> Result<StageInput, InputIssue> {
        let deps = self.stages[idx].dependencies.clone();
        if deps.is_empty() {
            return Ok(StageInput::Documents(self.documents.clone()));
        }

        let mut outputs = Vec::with_capacity(deps.len());
        let mut degraded = Vec::new();
        for dep_id in &deps {
            let Some(dep) = self.stages.iter().find(|s| &s.id == dep_id) else {
                return Err(InputIssue::NotReady(dep_id.clone()));
            };
            match dep.status {
                StageStatus::Completed => match &dep.output {
                    Some(out) => outputs.push(out.clone()),
                    None => {
                        return Err(InputIssue::Skip(format!(
                            "dependency '{dep_id}' completed without output"
                        )))
                    }
                },
                StageStatus::Failed => match dep.usable_output() {
                    Some(out) => {
                        outputs.push(out.clone());
                        degraded.push(dep_id.clone());
                    }
                    None => {
                        return Err(InputIssue::Skip(format!(
                            "dependency '{dep_id}' failed without output"
                        )))
                    }
                },
                StageStatus::Skipped => {
                    return Err(InputIssue::Skip(format!("dependency '{dep_id}' was skipped")))
                }
                StageStatus::Pending | StageStatus::Running => {
                    return Err(InputIssue::NotReady(dep_id.clone()))
                }
            }
        }

        for dep_id in degraded {
            let msg = format!("Using partial output of failed dependency '{dep_id}'");
            warn!("Stage '{}': {}", self.stages[idx].id, msg);
            self.stages[idx].warnings.push(msg);
        }

        Ok(if outputs.len() == 1 {
            StageInput::Single(outputs.remove(0))
        } else {
            StageInput::Many(outputs)
        })
    }

    fn complete(&mut self, idx: usize, result: ProcessingResult, elapsed_ms: u64) {
        let quality = result.metrics.quality_score;
        let duration_ms = if result.metrics.duration_ms > 0 {
            result.metrics.duration_ms
        } else {
            elapsed_ms
        };
        self.complete_quietly(idx, result);
        let stage_id = self.stages[idx].id.clone();
        info!("Stage '{}' completed in {}ms", stage_id, duration_ms);
        self.bus.emit(&PipelineEvent::StageCompleted {
            stage_id,
            duration_ms,
            quality_score: quality,
        });
    }

    fn complete_quietly(&mut self, idx: usize, result: ProcessingResult) {
        self.metrics.record_success(&result.metrics);
        let stage = &mut self.stages[idx];
        stage.output = result.data;
        stage.warnings.extend(result.warnings);
        stage.status = StageStatus::Completed;
        stage.completed_at = Some(Utc::now());
        self.metrics.total_warnings = self.warnings_count();
    }

    fn mark_failed(&mut self, idx: usize, err: &ProcessingError) {
        let stage = &mut self.stages[idx];
        stage.status = StageStatus::Failed;
        stage.completed_at = Some(Utc::now());
        debug!("Stage '{}' marked failed ({})", stage.id, err.message);
    }

    /// Append to the stage and pipeline error lists and emit `stage_error`.
    fn record_error(&mut self, idx: usize, err: ProcessingError) {
        self.stages[idx].errors.push(err.clone());
        self.errors.push(err.clone());
        self.metrics.total_errors = self.errors.len();
        self.bus.emit(&PipelineEvent::StageError {
            stage_id: self.stages[idx].id.clone(),
            error: err,
        });
    }

    fn set_pending_documents(&mut self, status: ProcessingStatus) {
        for doc in &mut self.documents {
            if doc.status == ProcessingStatus::Pending {
                doc.status = status;
            }
        }
    }

    /// Root stages own the document status: success completes every document,
    /// failure fails the ones still in flight.
    fn settle_documents(&mut self, is_root: bool, success: bool, message: &str) {
        if !is_root {
            return;
        }
        for doc in &mut self.documents {
            if success {
                doc.status = ProcessingStatus::Completed;
            } else if doc.status == ProcessingStatus::Processing {
                doc.status = ProcessingStatus::Failed;
                doc.errors.push(message.to_string());
            }
        }
    }

    pub(crate) fn warnings_count(&self) -> usize {
        self.warnings.len() + self.stages.iter().map(|s| s.warnings.len()).sum::<usize>()
    }
}

/// Await `fut` under the stage timeout, turning panics and timeouts into
/// error strings. The context token is cancelled when the timer wins so the
/// processor can stop any work it spawned.
async fn run_guarded<T>(
    timeout: Duration,
    ctx: &ProcessorContext,
    fut: impl Future<Output = T>,
) -> Result<T, String> {
    match tokio::time::timeout(timeout, AssertUnwindSafe(fut).catch_unwind()).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(panic)) => Err(format!(
            "processor panicked: {}",
            panic_message(panic.as_ref())
        )),
        Err(_) => {
            ctx.cancellation.cancel();
            Err(format!(
                "Stage '{}' timed out after {}ms",
                ctx.stage_id,
                timeout.as_millis()
            ))
        }
    }
}
