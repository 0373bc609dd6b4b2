//! `assemble`: merge structured parts into the canonical document.

use crate::error::{ErrorKind, ProcessorFailure};
use crate::output::{CrossReference, OutputDocument, Part, Section};
use crate::processor::{
    ContentProcessor, ProcessingResult, ProcessorContext, ResultMetrics, StageInput,
    ValidationResult,
};
use crate::stage::StageOutput;
use async_trait::async_trait;
use serde_json::Value;
use std::time::Instant;
use tracing::debug;

pub const NAME: &str = "assemble";

/// Titles shorter than this are too generic to link on.
const MIN_LINK_TITLE_CHARS: usize = 4;

/// Merges the parts of every upstream output, renumbers them, builds the
/// table of contents and links sections that mention each other by title.
///
/// Stage config keys: `title` (string), `crossReferences` (bool, default true).
#[derive(Debug, Default, Clone, Copy)]
pub struct DocumentAssembler;

#[async_trait]
impl ContentProcessor for DocumentAssembler {
    fn name(&self) -> &str {
        NAME
    }

    fn version(&self) -> &str {
        env!("CARGO_PKG_VERSION")
    }

    async fn validate(
        &self,
        input: &StageInput,
        _config: &Value,
        _ctx: &ProcessorContext,
    ) -> Option<ValidationResult> {
        Some(if input.outputs().is_empty() {
            ValidationResult::fail("assemble needs at least one upstream stage")
        } else {
            ValidationResult::pass()
        })
    }

    async fn process(
        &self,
        input: &StageInput,
        config: &Value,
        _ctx: &ProcessorContext,
    ) -> Result<ProcessingResult, ProcessorFailure> {
        let start = Instant::now();
        let mut titles = Vec::new();
        let mut parts = Vec::new();
        let mut skipped = 0usize;

        for output in input.outputs() {
            match output {
                StageOutput::Canonical(doc) => {
                    titles.push(doc.title.clone());
                    parts.extend(doc.parts.iter().cloned());
                }
                StageOutput::Raw(raw) => match raw.get("parts").and_then(Value::as_array) {
                    Some(items) => {
                        if let Some(t) = raw.get("title").and_then(Value::as_str) {
                            titles.push(t.to_string());
                        }
                        let decoded: Vec<Part> = serde_json::from_value(Value::Array(items.clone()))
                            .map_err(|e| {
                                ProcessorFailure::new(format!("malformed parts: {e}"))
                                    .with_kind(ErrorKind::Transformation)
                            })?;
                        parts.extend(decoded);
                    }
                    None => skipped += 1,
                },
            }
        }

        if parts.is_empty() {
            return Ok(ProcessingResult::failed("no parts to assemble", None));
        }

        let title = config
            .get("title")
            .and_then(Value::as_str)
            .map(str::to_string)
            .or_else(|| (titles.len() == 1).then(|| titles[0].clone()))
            .unwrap_or_else(|| OutputDocument::default().title);

        let mut doc = OutputDocument::empty(title);
        doc.parts = parts;
        renumber(&mut doc.parts);
        doc.build_toc();
        if config.get("crossReferences").and_then(Value::as_bool).unwrap_or(true) {
            doc.cross_references = link_sections(&doc.parts);
        }
        doc.derive_totals();
        debug!(
            "Assembled '{}': {} parts, {} sections, {} cross references",
            doc.title,
            doc.parts.len(),
            doc.metadata.total_sections,
            doc.cross_references.len()
        );

        let n_parts = doc.parts.len();
        let mut result = ProcessingResult::ok(doc).with_metrics(ResultMetrics {
            duration_ms: start.elapsed().as_millis() as u64,
            items_processed: n_parts,
            ..Default::default()
        });
        if skipped > 0 {
            result.metrics.quality_score = n_parts as f64 / (n_parts + skipped) as f64;
            result = result.with_warning(format!("{skipped} upstream output(s) had no parts"));
        }
        Ok(result)
    }
}

/// Give parts ids `part-1..n` and sections ids scoped below them, so ids
/// stay unique after merging several upstream outputs.
fn renumber(parts: &mut [Part]) {
    fn walk(prefix: &str, sections: &mut [Section]) {
        for (i, s) in sections.iter_mut().enumerate() {
            s.id = format!("{prefix}-{}", i + 1);
            for (j, f) in s.formulas.iter_mut().enumerate() {
                f.id = format!("{}-f{}", s.id, j + 1);
            }
            for (j, e) in s.examples.iter_mut().enumerate() {
                e.id = format!("{}-e{}", s.id, j + 1);
            }
            let id = s.id.clone();
            walk(&id, &mut s.subsections);
        }
    }

    for (i, part) in parts.iter_mut().enumerate() {
        part.id = format!("part-{}", i + 1);
        let id = part.id.clone();
        walk(&id, &mut part.sections);
    }
}

/// One reference per (section, other section) pair where the first
/// section's content mentions the second's title.
fn link_sections(parts: &[Part]) -> Vec<CrossReference> {
    fn flatten<'a>(sections: &'a [Section], out: &mut Vec<&'a Section>) {
        for s in sections {
            out.push(s);
            flatten(&s.subsections, out);
        }
    }

    let mut all = Vec::new();
    for part in parts {
        flatten(&part.sections, &mut all);
    }

    let lowered: Vec<String> = all.iter().map(|s| s.content.to_lowercase()).collect();
    let mut refs = Vec::new();
    for (i, from) in all.iter().enumerate() {
        for to in &all {
            if from.id == to.id || to.title.chars().count() < MIN_LINK_TITLE_CHARS {
                continue;
            }
            if lowered[i].contains(&to.title.to_lowercase()) {
                refs.push(CrossReference {
                    from: from.id.clone(),
                    to: to.id.clone(),
                    label: to.title.clone(),
                });
            }
        }
    }
    refs
}
