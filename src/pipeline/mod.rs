//! Execution internals of [`crate::engine::ContentPipeline`].
//!
//! Each submodule owns one step of a run, so each is testable without a
//! full pipeline.
//!
//! ## Data Flow
//!
//! ```text
//! graph ──▶ executor ──▶ policy ──▶ synthesis
//! (order)   (per stage)  (go on?)   (final document)
//! ```
//!
//! 1. [`graph`]: dependency validation and topological order
//! 2. `executor`: input assembly, guarded processor calls, recovery
//! 3. [`policy`]: whether a failed stage stops the run
//! 4. [`synthesis`]: degrade from final output to a source-only fallback

pub(crate) mod executor;
pub mod graph;
pub mod policy;
pub mod synthesis;
