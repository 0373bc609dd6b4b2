//! Built-in processors.
//!
//! ```text
//! text-extract ──▶ structure ──▶ assemble
//!   (decode)       (headings,     (merge, TOC,
//!                   formulas,      cross refs)
//!                   examples)
//! ```
//!
//! They cover text-like inputs (Markdown, plain text, LaTeX snippets).
//! Binary formats need an extractor registered under another name; the
//! rest of the chain works unchanged as long as it emits the same
//! `{"documents": [{"name", "title", "text"}]}` shape.

pub mod assemble;
pub mod extract;
pub mod structure;

pub use assemble::DocumentAssembler;
pub use extract::TextExtractor;
pub use structure::StructureBuilder;

use crate::engine::ContentPipeline;
use crate::error::PipelineError;
use crate::stage::StageSpec;
use std::sync::Arc;

/// Register the three built-in processors.
pub fn register_builtin(pipeline: &mut ContentPipeline) {
    pipeline.register_processor(Arc::new(TextExtractor));
    pipeline.register_processor(Arc::new(StructureBuilder));
    pipeline.register_processor(Arc::new(DocumentAssembler));
}

/// The default `extract → structure → assemble` chain.
pub fn default_stages() -> Vec<StageSpec> {
    vec![
        StageSpec::new("extract", extract::NAME).name("Text extraction"),
        StageSpec::new("structure", structure::NAME)
            .name("Structure detection")
            .depends_on(["extract"]),
        StageSpec::new("assemble", assemble::NAME)
            .name("Document assembly")
            .depends_on(["structure"]),
    ]
}

/// Register the built-ins and add [`default_stages`].
pub fn install_default_chain(pipeline: &mut ContentPipeline) -> Result<(), PipelineError> {
    register_builtin(pipeline);
    for spec in default_stages() {
        pipeline.add_stage(spec)?;
    }
    Ok(())
}
