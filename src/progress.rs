//! Progress-callback trait for stage-level pipeline events.
//!
//! The [`crate::events::EventBus`] is the general observer mechanism; this
//! module offers a typed convenience on top of it. Implement
//! [`PipelineProgressCallback`], override only the hooks you care about, and
//! wire it in with [`attach_progress`]. The CLI drives its terminal progress
//! bar this way.
//!
//! # Example
//!
//! ```rust
//! use edgequake_pipeline::{attach_progress, ContentPipeline, PipelineProgressCallback};
//! use std::sync::{Arc, atomic::{AtomicUsize, Ordering}};
//!
//! struct CountingCallback {
//!     completed: AtomicUsize,
//! }
//!
//! impl PipelineProgressCallback for CountingCallback {
//!     fn on_stage_complete(&self, stage_id: &str, _duration_ms: u64) {
//!         let done = self.completed.fetch_add(1, Ordering::SeqCst) + 1;
//!         eprintln!("{stage_id} done ({done} so far)");
//!     }
//! }
//!
//! let mut pipeline = ContentPipeline::default();
//! attach_progress(
//!     pipeline.events_mut(),
//!     Arc::new(CountingCallback { completed: AtomicUsize::new(0) }),
//! );
//! ```

use crate::events::{EventBus, PipelineEvent};
use std::sync::Arc;

/// Called by the pipeline driver as it moves through the stages.
///
/// All methods default to no-ops. Implementations must be `Send + Sync`
/// because the event bus stores listeners behind `Arc`.
pub trait PipelineProgressCallback: Send + Sync {
    /// Called once before the first stage runs.
    fn on_pipeline_start(&self, total_stages: usize, total_documents: usize) {
        let _ = (total_stages, total_documents);
    }

    /// Called just before a stage's input is assembled.
    ///
    /// # Arguments
    /// * `index`: 1-indexed position in execution order
    fn on_stage_start(&self, stage_id: &str, index: usize, total: usize) {
        let _ = (stage_id, index, total);
    }

    fn on_stage_complete(&self, stage_id: &str, duration_ms: u64) {
        let _ = (stage_id, duration_ms);
    }

    fn on_stage_recovered(&self, stage_id: &str) {
        let _ = stage_id;
    }

    /// Called when a stage fails for good (recovery unavailable or failed).
    fn on_stage_failed(&self, stage_id: &str, error: &str) {
        let _ = (stage_id, error);
    }

    fn on_stage_skipped(&self, stage_id: &str, reason: &str) {
        let _ = (stage_id, reason);
    }

    /// Called after every stage with the overall percentage (0–100).
    fn on_progress(&self, progress: u8) {
        let _ = progress;
    }

    /// Called once when the run ends, whatever the outcome.
    fn on_pipeline_finished(&self, outcome: RunOutcome) {
        let _ = outcome;
    }
}

/// How a run ended, as reported to [`PipelineProgressCallback::on_pipeline_finished`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Completed { stages_completed: usize, stages_failed: usize },
    Failed,
    Cancelled,
}

/// A no-op implementation for callers that don't need progress events.
pub struct NoopProgressCallback;

impl PipelineProgressCallback for NoopProgressCallback {}

/// Convenience alias for a shared callback.
pub type ProgressCallback = Arc<dyn PipelineProgressCallback>;

/// Forward bus events to `callback`.
pub fn attach_progress(bus: &mut EventBus, callback: ProgressCallback) {
    bus.on_any(move |event| {
        dispatch(callback.as_ref(), event);
        Ok(())
    });
}

fn dispatch(cb: &dyn PipelineProgressCallback, event: &PipelineEvent) {
    match event {
        PipelineEvent::PipelineStarted {
            total_stages,
            total_documents,
        } => cb.on_pipeline_start(*total_stages, *total_documents),
        PipelineEvent::StageStarted {
            stage_id,
            index,
            total,
        } => cb.on_stage_start(stage_id, *index, *total),
        PipelineEvent::StageCompleted {
            stage_id,
            duration_ms,
            ..
        } => cb.on_stage_complete(stage_id, *duration_ms),
        PipelineEvent::StageRecovered { stage_id } => cb.on_stage_recovered(stage_id),
        PipelineEvent::StageFailed { stage_id, error } => {
            cb.on_stage_failed(stage_id, &error.message)
        }
        PipelineEvent::StageSkipped { stage_id, reason } => cb.on_stage_skipped(stage_id, reason),
        PipelineEvent::ProgressUpdated { progress, .. } => cb.on_progress(*progress),
        PipelineEvent::PipelineCompleted { metrics } => cb.on_pipeline_finished(RunOutcome::Completed {
            stages_completed: metrics.stages_completed,
            stages_failed: metrics.stages_failed,
        }),
        PipelineEvent::PipelineFailed { .. } => cb.on_pipeline_finished(RunOutcome::Failed),
        PipelineEvent::PipelineCancelled { .. } => cb.on_pipeline_finished(RunOutcome::Cancelled),
        PipelineEvent::DocumentAdded { .. }
        | PipelineEvent::ProcessorRegistered { .. }
        | PipelineEvent::StageAdded { .. }
        | PipelineEvent::StageError { .. } => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ErrorKind, ProcessingError, Severity};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct TrackingCallback {
        starts: AtomicUsize,
        completes: AtomicUsize,
        failures: AtomicUsize,
        last_progress: AtomicUsize,
        outcome: Mutex<Option<RunOutcome>>,
    }

    impl PipelineProgressCallback for TrackingCallback {
        fn on_stage_start(&self, _stage_id: &str, _index: usize, _total: usize) {
            self.starts.fetch_add(1, Ordering::SeqCst);
        }

        fn on_stage_complete(&self, _stage_id: &str, _duration_ms: u64) {
            self.completes.fetch_add(1, Ordering::SeqCst);
        }

        fn on_stage_failed(&self, _stage_id: &str, _error: &str) {
            self.failures.fetch_add(1, Ordering::SeqCst);
        }

        fn on_progress(&self, progress: u8) {
            self.last_progress.store(progress as usize, Ordering::SeqCst);
        }

        fn on_pipeline_finished(&self, outcome: RunOutcome) {
            *self.outcome.lock().unwrap() = Some(outcome);
        }
    }

    #[test]
    fn noop_callback_does_not_panic() {
        let cb = NoopProgressCallback;
        cb.on_pipeline_start(3, 2);
        cb.on_stage_start("a", 1, 3);
        cb.on_stage_complete("a", 10);
        cb.on_stage_failed("b", "boom");
        cb.on_progress(67);
        cb.on_pipeline_finished(RunOutcome::Cancelled);
    }

    #[test]
    fn bus_events_reach_callback() {
        let tracker = Arc::new(TrackingCallback::default());
        let mut bus = EventBus::new();
        attach_progress(&mut bus, tracker.clone());

        bus.emit(&PipelineEvent::StageStarted {
            stage_id: "a".into(),
            index: 1,
            total: 2,
        });
        bus.emit(&PipelineEvent::StageCompleted {
            stage_id: "a".into(),
            duration_ms: 5,
            quality_score: 1.0,
        });
        bus.emit(&PipelineEvent::StageFailed {
            stage_id: "b".into(),
            error: ProcessingError::new("b", ErrorKind::System, Severity::High, "x", true),
        });
        bus.emit(&PipelineEvent::ProgressUpdated {
            progress: 50,
            processed: 1,
            total: 2,
        });
        bus.emit(&PipelineEvent::PipelineFailed {
            stage_id: "b".into(),
            message: "x".into(),
        });

        assert_eq!(tracker.starts.load(Ordering::SeqCst), 1);
        assert_eq!(tracker.completes.load(Ordering::SeqCst), 1);
        assert_eq!(tracker.failures.load(Ordering::SeqCst), 1);
        assert_eq!(tracker.last_progress.load(Ordering::SeqCst), 50);
        assert_eq!(*tracker.outcome.lock().unwrap(), Some(RunOutcome::Failed));
    }
}
