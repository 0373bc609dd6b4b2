//! `text-extract`: decode document payloads into normalised plain text.
//!
//! Binary formats (PDF, images) need a real extractor plugged in as another
//! processor; this one handles text-like payloads and measures how much of
//! each payload decoded cleanly.

use crate::document::SourceDocument;
use crate::error::{ErrorKind, ProcessingError, ProcessorFailure};
use crate::processor::{
    ContentProcessor, ProcessingResult, ProcessorContext, ResultMetrics, StageInput,
    ValidationResult,
};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::time::Instant;
use tracing::debug;

pub const NAME: &str = "text-extract";

/// Decodes each source document as UTF-8 (lossily) and cleans the result.
#[derive(Debug, Default, Clone, Copy)]
pub struct TextExtractor;

#[async_trait]
impl ContentProcessor for TextExtractor {
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
        Some(match input.documents() {
            Some([]) => ValidationResult::fail("no documents to extract"),
            Some(_) => ValidationResult::pass(),
            None => ValidationResult::fail("text-extract must be a root stage"),
        })
    }

    async fn process(
        &self,
        input: &StageInput,
        _config: &Value,
        ctx: &ProcessorContext,
    ) -> Result<ProcessingResult, ProcessorFailure> {
        let start = Instant::now();
        let docs = input
            .documents()
            .ok_or_else(|| ProcessorFailure::fatal("expected source documents").with_kind(ErrorKind::Extraction))?;

        let mut entries = Vec::with_capacity(docs.len());
        let mut warnings = Vec::new();
        let mut preserved_sum = 0.0;
        let mut non_empty = 0usize;

        for doc in docs {
            if ctx.is_cancelled() {
                return Err(ProcessorFailure::new("extraction cancelled").with_kind(ErrorKind::Extraction));
            }
            let CleanText { text, preserved } = decode(doc);
            if text.trim().is_empty() {
                warnings.push(format!("'{}' produced no text", doc.name));
            } else {
                non_empty += 1;
            }
            preserved_sum += preserved;
            debug!("Extracted {} chars from '{}' (preserved {:.2})", text.len(), doc.name, preserved);
            entries.push(entry(doc, &text));
        }

        if non_empty == 0 {
            let mut result = ProcessingResult::failed("no text could be extracted from any document", None);
            result.warnings = warnings;
            return Ok(result);
        }

        let total = docs.len() as f64;
        let mut result = ProcessingResult::ok(json!({ "documents": entries })).with_metrics(ResultMetrics {
            duration_ms: start.elapsed().as_millis() as u64,
            quality_score: non_empty as f64 / total,
            content_preserved: preserved_sum / total,
            items_processed: docs.len(),
        });
        result.warnings = warnings;
        Ok(result)
    }

    /// Fall back to name-only entries so later stages still see every document.
    async fn recover(
        &self,
        _error: &ProcessingError,
        input: &StageInput,
        _config: &Value,
        _ctx: &ProcessorContext,
    ) -> Option<Result<ProcessingResult, ProcessorFailure>> {
        let docs = input.documents()?;
        let entries: Vec<Value> = docs.iter().map(|d| entry(d, "")).collect();
        Some(Ok(ProcessingResult::ok(json!({ "documents": entries }))
            .with_quality(0.2, 0.0)
            .with_warning("text extraction recovered with placeholders only")))
    }
}

fn entry(doc: &SourceDocument, text: &str) -> Value {
    json!({
        "id": doc.id,
        "name": doc.name,
        "title": doc.display_name(),
        "category": doc.category,
        "text": text,
    })
}

/// Text recovered from one payload.
#[derive(Debug, Clone, PartialEq)]
pub struct CleanText {
    pub text: String,
    /// Share of decoded characters that were not U+FFFD; 0 for an empty payload.
    pub preserved: f64,
}

/// Blank lines kept between two lines of text.
const MAX_BLANK_LINES: usize = 2;

fn decode(doc: &SourceDocument) -> CleanText {
    clean(&String::from_utf8_lossy(&doc.payload))
}

/// Cleaned text only; see [`clean`].
pub fn normalise_text(input: &str) -> String {
    clean(input).text
}

/// One pass over the decoded characters:
/// - `\r\n` and lone `\r` end a line like `\n`
/// - U+FFFD is dropped and counted against `preserved`
/// - zero-width, soft-hyphen, BOM and NUL characters are dropped
/// - lines lose trailing whitespace; leading and trailing blank lines go,
///   and runs of blank lines shrink to [`MAX_BLANK_LINES`]
pub fn clean(decoded: &str) -> CleanText {
    let mut lines = LineSink::with_capacity(decoded.len());
    let mut total = 0usize;
    let mut replaced = 0usize;

    let mut chars = decoded.chars().peekable();
    while let Some(c) = chars.next() {
        total += 1;
        match c {
            '\r' => {
                if chars.next_if_eq(&'\n').is_some() {
                    total += 1;
                }
                lines.end_line();
            }
            '\n' => lines.end_line(),
            char::REPLACEMENT_CHARACTER => replaced += 1,
            '\u{200B}' | '\u{200C}' | '\u{200D}' | '\u{2060}' | '\u{FEFF}' | '\u{00AD}' | '\0' => {}
            c => lines.line.push(c),
        }
    }
    lines.end_line();

    let preserved = if total == 0 {
        0.0
    } else {
        1.0 - replaced as f64 / total as f64
    };
    CleanText {
        text: lines.out,
        preserved,
    }
}

struct LineSink {
    out: String,
    line: String,
    pending_blanks: usize,
}

impl LineSink {
    fn with_capacity(n: usize) -> Self {
        Self {
            out: String::with_capacity(n),
            line: String::new(),
            pending_blanks: 0,
        }
    }

    fn end_line(&mut self) {
        let kept = self.line.trim_end();
        if kept.is_empty() {
            self.pending_blanks += 1;
        } else {
            if !self.out.is_empty() {
                let blanks = self.pending_blanks.min(MAX_BLANK_LINES);
                self.out.extend(std::iter::repeat('\n').take(blanks + 1));
            }
            self.out.push_str(kept);
            self.pending_blanks = 0;
        }
        self.line.clear();
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────
