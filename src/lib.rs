//! # edgequake-pipeline
//!
//! A dependency-ordered document processing pipeline.
//!
//! ## Why this crate?
//!
//! Turning a folder of lecture notes, exercise sheets and exam papers into
//! one structured document is a chain of independent steps: extraction,
//! structure detection, assembly, layout. Each step can fail on its own
//! input, and one bad file should not lose the whole batch. This crate runs
//! those steps as a DAG of stages over a batch of source documents, keeps
//! going where it sensibly can, and always hands back the best document it
//! could build.
//!
//! ## Pipeline Overview
//!
//! ```text
//! source documents
//!  │
//!  ├─ 1. Intake     add_source_document / register_processor / add_stage
//!  ├─ 2. Validate   unknown dependencies, cycles (before any stage runs)
//!  ├─ 3. Order      topological sort, ties broken by insertion order
//!  ├─ 4. Run        validate → process → recover?, with timeout per call
//!  ├─ 5. Decide     continuation policy: carry on or abort
//!  └─ 6. Synthesise final stage output → earlier stage → fallback
//! ```
//!
//! Every transition is published on the [`EventBus`]; listeners can watch,
//! and a [`CancelHandle`] can stop the run between stages.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use edgequake_pipeline::{processors, ContentPipeline, DocumentCategory, PipelineConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = PipelineConfig::builder().timeout_ms(30_000).build()?;
//!     let mut pipeline = ContentPipeline::new(config);
//!
//!     let notes = std::fs::read("lecture_01.md")?;
//!     pipeline.add_source_document("lecture_01.md", notes, DocumentCategory::infer("lecture_01.md"));
//!     processors::install_default_chain(&mut pipeline)?;
//!
//!     let doc = pipeline.execute().await?;
//!     println!("{}", doc.to_markdown());
//!     eprintln!("quality: {:.2}", pipeline.metrics().average_quality_score);
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `docpipe` binary (clap + anyhow + indicatif + tracing-subscriber) |
//!
//! Disable `cli` when using only the library:
//! ```toml
//! edgequake-pipeline = { version = "0.1", default-features = false }
//! ```

// ── Modules ──────────────────────────────────────────────────────────────

pub mod config;
pub mod document;
pub mod engine;
pub mod error;
pub mod events;
pub mod metrics;
pub mod output;
pub mod pipeline;
pub mod processor;
pub mod processors;
pub mod progress;
pub mod stage;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use config::{OutputFormat, PipelineConfig, PipelineConfigBuilder};
pub use document::{DocumentCategory, ProcessingStatus, SourceDocument};
pub use engine::{CancelHandle, ContentPipeline};
pub use error::{ErrorKind, PipelineError, ProcessingError, ProcessorFailure, Severity};
pub use events::{EventBus, EventKind, ListenerError, PipelineEvent};
pub use metrics::{PipelineMetrics, PipelinePhase, PipelineStatus};
pub use output::{
    Appendix, CrossReference, DocumentMetadata, Example, Formula, OutputDocument, Part, Section,
    TocEntry,
};
pub use processor::{
    ContentProcessor, ProcessingResult, ProcessorContext, ProcessorRegistry, ResultMetrics,
    StageInput, ValidationResult,
};
pub use progress::{
    attach_progress, NoopProgressCallback, PipelineProgressCallback, ProgressCallback, RunOutcome,
};
pub use stage::{ProcessingStage, StageOutput, StageSpec, StageStatus};
