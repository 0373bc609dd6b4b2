//! Synchronous publish/subscribe for pipeline observers.
//!
//! [`EventBus::emit`] calls every listener registered for the event's kind,
//! in registration order, on the caller's thread. A listener that returns
//! `Err` or panics is logged and skipped; delivery to the remaining
//! listeners and the driver's own control flow carry on unaffected.
//!
//! Payloads are passed by shared reference: listeners observe snapshots and
//! cannot mutate pipeline state.

use crate::document::DocumentCategory;
use crate::error::ProcessingError;
use crate::metrics::PipelineMetrics;
use serde::Serialize;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tracing::warn;
use uuid::Uuid;

/// Event names, stable across releases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    DocumentAdded,
    ProcessorRegistered,
    StageAdded,
    PipelineStarted,
    StageStarted,
    StageCompleted,
    StageRecovered,
    StageFailed,
    StageError,
    StageSkipped,
    ProgressUpdated,
    PipelineCompleted,
    PipelineFailed,
    PipelineCancelled,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::DocumentAdded => "document_added",
            EventKind::ProcessorRegistered => "processor_registered",
            EventKind::StageAdded => "stage_added",
            EventKind::PipelineStarted => "pipeline_started",
            EventKind::StageStarted => "stage_started",
            EventKind::StageCompleted => "stage_completed",
            EventKind::StageRecovered => "stage_recovered",
            EventKind::StageFailed => "stage_failed",
            EventKind::StageError => "stage_error",
            EventKind::StageSkipped => "stage_skipped",
            EventKind::ProgressUpdated => "progress_updated",
            EventKind::PipelineCompleted => "pipeline_completed",
            EventKind::PipelineFailed => "pipeline_failed",
            EventKind::PipelineCancelled => "pipeline_cancelled",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An event together with its payload.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PipelineEvent {
    DocumentAdded {
        document_id: Uuid,
        name: String,
        category: DocumentCategory,
    },
    ProcessorRegistered {
        name: String,
        version: String,
    },
    StageAdded {
        stage_id: String,
        processor: String,
    },
    PipelineStarted {
        total_stages: usize,
        total_documents: usize,
    },
    StageStarted {
        stage_id: String,
        /// 1-indexed position in execution order.
        index: usize,
        total: usize,
    },
    StageCompleted {
        stage_id: String,
        duration_ms: u64,
        quality_score: f64,
    },
    StageRecovered {
        stage_id: String,
    },
    StageFailed {
        stage_id: String,
        error: ProcessingError,
    },
    StageError {
        stage_id: String,
        error: ProcessingError,
    },
    StageSkipped {
        stage_id: String,
        reason: String,
    },
    ProgressUpdated {
        progress: u8,
        processed: usize,
        total: usize,
    },
    PipelineCompleted {
        metrics: PipelineMetrics,
    },
    PipelineFailed {
        stage_id: String,
        message: String,
    },
    PipelineCancelled {
        current_stage: Option<String>,
    },
}

impl PipelineEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            PipelineEvent::DocumentAdded { .. } => EventKind::DocumentAdded,
            PipelineEvent::ProcessorRegistered { .. } => EventKind::ProcessorRegistered,
            PipelineEvent::StageAdded { .. } => EventKind::StageAdded,
            PipelineEvent::PipelineStarted { .. } => EventKind::PipelineStarted,
            PipelineEvent::StageStarted { .. } => EventKind::StageStarted,
            PipelineEvent::StageCompleted { .. } => EventKind::StageCompleted,
            PipelineEvent::StageRecovered { .. } => EventKind::StageRecovered,
            PipelineEvent::StageFailed { .. } => EventKind::StageFailed,
            PipelineEvent::StageError { .. } => EventKind::StageError,
            PipelineEvent::StageSkipped { .. } => EventKind::StageSkipped,
            PipelineEvent::ProgressUpdated { .. } => EventKind::ProgressUpdated,
            PipelineEvent::PipelineCompleted { .. } => EventKind::PipelineCompleted,
            PipelineEvent::PipelineFailed { .. } => EventKind::PipelineFailed,
            PipelineEvent::PipelineCancelled { .. } => EventKind::PipelineCancelled,
        }
    }
}

/// Error type listeners may return; it is logged and otherwise ignored.
pub type ListenerError = Box<dyn std::error::Error + Send + Sync>;

/// A registered observer.
pub type Listener = Arc<dyn Fn(&PipelineEvent) -> Result<(), ListenerError> + Send + Sync>;

/// Synchronous publish/subscribe. Listeners are kept in one list so that
/// kind-specific and catch-all listeners interleave in registration order.
#[derive(Default, Clone)]
pub struct EventBus {
    /// `None` subscribes to every kind.
    listeners: Vec<(Option<EventKind>, Listener)>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `listener` for one event kind.
    pub fn on<F>(&mut self, kind: EventKind, listener: F)
    where
        F: Fn(&PipelineEvent) -> Result<(), ListenerError> + Send + Sync + 'static,
    {
        self.listeners.push((Some(kind), Arc::new(listener)));
    }

    /// Register `listener` for every event kind.
    pub fn on_any<F>(&mut self, listener: F)
    where
        F: Fn(&PipelineEvent) -> Result<(), ListenerError> + Send + Sync + 'static,
    {
        self.listeners.push((None, Arc::new(listener)));
    }

    pub fn listener_count(&self, kind: EventKind) -> usize {
        self.listeners
            .iter()
            .filter(|(k, _)| k.is_none_or(|k| k == kind))
            .count()
    }

    /// Deliver `event` to every matching listener in registration order.
    pub fn emit(&self, event: &PipelineEvent) {
        let kind = event.kind();
        let matching = self
            .listeners
            .iter()
            .filter(|(k, _)| k.is_none_or(|k| k == kind))
            .map(|(_, listener)| listener);
        for listener in matching {
            match catch_unwind(AssertUnwindSafe(|| listener(event))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("Listener for '{}' failed: {}", kind, e),
                Err(panic) => warn!(
                    "Listener for '{}' panicked: {}",
                    kind,
                    panic_message(panic.as_ref())
                ),
            }
        }
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
