//! Output synthesis: turn whatever the stages produced into one
//! [`OutputDocument`], degrading step by step.
//!
//! 1. Final stage output, already canonical.
//! 2. Final stage output, raw, adapted to the canonical shape.
//! 3. Most recent completed stage with any output, adapted.
//! 4. Fallback built from the source documents alone.

use crate::document::SourceDocument;
use crate::output::{OutputDocument, Part, Section};
use crate::stage::{ProcessingStage, StageOutput, StageStatus};
use serde_json::Value;
use tracing::{debug, warn};

/// Preservation score stamped on the fallback document.
pub const FALLBACK_PRESERVATION_SCORE: f64 = 0.5;

const DEFAULT_TITLE: &str = "Processed Document";

/// Which step of the chain produced the document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SynthesisSource {
    FinalStage,
    AdaptedFinalStage,
    EarlierStage(String),
    Fallback,
}

/// Run the degradation chain over `stages` visited in `order`.
pub fn synthesize(
    stages: &[ProcessingStage],
    order: &[usize],
    documents: &[SourceDocument],
) -> (OutputDocument, SynthesisSource) {
    if let Some(last) = order.last().map(|&i| &stages[i]) {
        match last.usable_output() {
            Some(StageOutput::Canonical(doc)) => {
                debug!("Using canonical output of final stage '{}'", last.id);
                return (finish(doc.clone(), documents), SynthesisSource::FinalStage);
            }
            Some(StageOutput::Raw(raw)) => {
                if let Some(doc) = adapt_raw(raw, documents) {
                    debug!("Adapted raw output of final stage '{}'", last.id);
                    return (doc, SynthesisSource::AdaptedFinalStage);
                }
            }
            None => {}
        }
    }

    for stage in order.iter().rev().map(|&i| &stages[i]) {
        if stage.status != StageStatus::Completed {
            continue;
        }
        let doc = match stage.usable_output() {
            Some(StageOutput::Canonical(doc)) => Some(finish(doc.clone(), documents)),
            Some(StageOutput::Raw(raw)) => adapt_raw(raw, documents),
            None => None,
        };
        if let Some(doc) = doc {
            warn!("Final stage output unusable; falling back to stage '{}'", stage.id);
            return (doc, SynthesisSource::EarlierStage(stage.id.clone()));
        }
    }

    warn!(
        "No stage produced usable output; synthesising fallback from {} source documents",
        documents.len()
    );
    (fallback_document(documents), SynthesisSource::Fallback)
}

/// Adapt a raw stage payload to the canonical shape.
///
/// Accepts an object with a `parts` array, or an object with a `sections`
/// array (wrapped into a single part). Anything else, or an empty result,
/// yields `None`.
pub fn adapt_raw(raw: &Value, documents: &[SourceDocument]) -> Option<OutputDocument> {
    let obj = raw.as_object()?;

    let doc = if obj.get("parts").is_some_and(Value::is_array) {
        serde_json::from_value::<OutputDocument>(raw.clone()).ok()?
    } else if let Some(sections) = obj.get("sections").filter(|v| v.is_array()) {
        let sections: Vec<Section> = serde_json::from_value(sections.clone()).ok()?;
        let title = obj
            .get("title")
            .and_then(Value::as_str)
            .unwrap_or(DEFAULT_TITLE)
            .to_string();
        let mut doc = OutputDocument::empty(title.clone());
        doc.parts.push(Part {
            id: "part-1".into(),
            title,
            sections,
        });
        doc
    } else {
        return None;
    };

    if doc.parts.is_empty() {
        return None;
    }
    Some(finish(doc, documents))
}

fn finish(mut doc: OutputDocument, documents: &[SourceDocument]) -> OutputDocument {
    if doc.title.trim().is_empty() {
        doc.title = DEFAULT_TITLE.to_string();
    }
    if doc.metadata.source_files.is_empty() {
        doc.metadata.source_files = documents.iter().map(|d| d.name.clone()).collect();
    }
    if doc.table_of_contents.is_empty() {
        doc.build_toc();
    }
    doc.derive_totals();
    doc
}

/// Minimal canonical document built straight from the source documents.
pub fn fallback_document(documents: &[SourceDocument]) -> OutputDocument {
    let mut doc = OutputDocument::empty(DEFAULT_TITLE);
    for (i, source) in documents.iter().enumerate() {
        let n = i + 1;
        let name = source.display_name();
        let title = match source.category.label() {
            Some(label) if !name.is_empty() => format!("{label}: {name}"),
            _ => format!("Part {n}"),
        };
        doc.parts.push(Part {
            id: format!("part-{n}"),
            title,
            sections: vec![Section {
                id: format!("part-{n}-overview"),
                title: "Overview".into(),
                content: format!(
                    "Source file '{}' ({} bytes). Its content could not be processed and is not included.",
                    source.name,
                    source.size()
                ),
                ..Default::default()
            }],
        });
    }
    doc.metadata.source_files = documents.iter().map(|d| d.name.clone()).collect();
    doc.metadata.preservation_score = FALLBACK_PRESERVATION_SCORE;
    doc.build_toc();
    doc.derive_totals();
    doc
}
