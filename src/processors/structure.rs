//! `structure`: turn extracted plain text into parts and sections.
//!
//! Each extracted document becomes one [`Part`]. Headings open sections,
//! display formulas and worked examples are lifted out of the prose into
//! their own lists. The output is a raw `{"title", "parts"}` object, which
//! the synthesiser can adapt directly if no assembly stage follows.
//!
//! Rules, applied in order:
//! 1. Markdown headings (`#`, `##`, `###`)
//! 2. Numbered headings (`2 Limits`, `2.1 One-sided limits`)
//! 3. Display formulas (`$$…$$`, `\[…\]`)
//! 4. Example paragraphs (`Example 3: …`)

use crate::error::{ErrorKind, ProcessorFailure};
use crate::output::{Example, Formula, Part, Section};
use crate::processor::{
    ContentProcessor, ProcessingResult, ProcessorContext, ResultMetrics, StageInput,
    ValidationResult,
};
use crate::stage::StageOutput;
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{json, Map, Value};
use std::time::Instant;
use tracing::debug;

pub const NAME: &str = "structure";

#[derive(Debug, Default, Clone, Copy)]
pub struct StructureBuilder;

#[async_trait]
impl ContentProcessor for StructureBuilder {
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
        Some(if extracted_documents(input).is_empty() {
            ValidationResult::fail("no extracted documents in upstream output")
        } else {
            ValidationResult::pass()
        })
    }

    async fn process(
        &self,
        input: &StageInput,
        config: &Value,
        ctx: &ProcessorContext,
    ) -> Result<ProcessingResult, ProcessorFailure> {
        let start = Instant::now();
        let entries = extracted_documents(input);
        if entries.is_empty() {
            return Err(ProcessorFailure::new("no extracted documents").with_kind(ErrorKind::Validation));
        }

        let mut parts = Vec::with_capacity(entries.len());
        let mut structured = 0usize;
        let mut chars_in = 0usize;
        let mut chars_out = 0usize;

        for (i, entry) in entries.iter().enumerate() {
            if ctx.is_cancelled() {
                return Err(ProcessorFailure::new("structuring cancelled"));
            }
            let text = entry.get("text").and_then(Value::as_str).unwrap_or_default();
            let fallback = entry
                .get("title")
                .or_else(|| entry.get("name"))
                .and_then(Value::as_str)
                .unwrap_or_default();

            let (part, headed) = structure_text(i + 1, fallback, text);
            if headed {
                structured += 1;
            }
            chars_in += visible_chars(text);
            chars_out += part_chars(&part);
            debug!("Structured '{}' into {} sections", part.title, part.sections.len());
            parts.push(part);
        }

        let mut out = Map::new();
        if let Some(title) = config.get("title").and_then(Value::as_str) {
            out.insert("title".into(), json!(title));
        } else if let [only] = parts.as_slice() {
            out.insert("title".into(), json!(only.title));
        }
        let parts_json =
            serde_json::to_value(&parts).map_err(|e| ProcessorFailure::fatal(e.to_string()))?;
        out.insert("parts".into(), parts_json);

        let preserved = if chars_in == 0 {
            1.0
        } else {
            (chars_out as f64 / chars_in as f64).min(1.0)
        };
        let mut result = ProcessingResult::ok(Value::Object(out)).with_metrics(ResultMetrics {
            duration_ms: start.elapsed().as_millis() as u64,
            quality_score: structured as f64 / parts.len() as f64,
            content_preserved: preserved,
            items_processed: parts.len(),
        });
        for part in parts.iter().filter(|p| p.sections.is_empty()) {
            result.warnings.push(format!("'{}' has no content", part.title));
        }
        Ok(result)
    }
}

/// Collect `documents` entries from every raw upstream output.
fn extracted_documents(input: &StageInput) -> Vec<&Value> {
    input
        .outputs()
        .into_iter()
        .filter_map(StageOutput::as_raw)
        .filter_map(|raw| raw.get("documents").and_then(Value::as_array))
        .flatten()
        .collect()
}

enum Target {
    Preamble,
    Section,
    Subsection,
}

/// Build one part from a document's text. The flag reports whether any
/// heading was found.
fn structure_text(n: usize, fallback_title: &str, text: &str) -> (Part, bool) {
    let id = format!("part-{n}");
    let mut title = if fallback_title.trim().is_empty() {
        format!("Part {n}")
    } else {
        fallback_title.trim().to_string()
    };
    let mut titled = false;
    let mut headed = false;
    let mut preamble = String::new();
    let mut sections: Vec<Section> = Vec::new();
    let mut target = Target::Preamble;

    for line in text.lines() {
        let Some((level, heading)) = detect_heading(line) else {
            let body = match target {
                Target::Preamble => &mut preamble,
                Target::Section => match sections.last_mut() {
                    Some(s) => &mut s.content,
                    None => &mut preamble,
                },
                Target::Subsection => match sections.last_mut().and_then(|s| s.subsections.last_mut()) {
                    Some(s) => &mut s.content,
                    None => &mut preamble,
                },
            };
            body.push_str(line);
            body.push('\n');
            continue;
        };

        headed = true;
        match level {
            1 if !titled && sections.is_empty() => {
                title = heading;
                titled = true;
                target = Target::Preamble;
            }
            1 | 2 => {
                sections.push(new_section(format!("{id}-s{}", sections.len() + 1), heading));
                target = Target::Section;
            }
            _ => {
                if sections.is_empty() {
                    sections.push(new_section(format!("{id}-s1"), "Overview".to_string()));
                }
                if let Some(parent) = sections.last_mut() {
                    let sub_id = format!("{}-{}", parent.id, parent.subsections.len() + 1);
                    parent.subsections.push(new_section(sub_id, heading));
                }
                target = Target::Subsection;
            }
        }
    }

    if !preamble.trim().is_empty() {
        let mut intro = new_section(format!("{id}-intro"), "Introduction".to_string());
        intro.content = preamble;
        sections.insert(0, intro);
    }
    for section in &mut sections {
        finish_section(section);
    }

    (Part { id, title, sections }, headed)
}

fn new_section(id: String, title: String) -> Section {
    Section {
        id,
        title,
        ..Default::default()
    }
}

fn finish_section(section: &mut Section) {
    let (content, formulas) = extract_formulas(&section.id, &section.content);
    let (content, examples) = extract_examples(&section.id, &content);
    section.content = content.trim().to_string();
    section.formulas = formulas;
    section.examples = examples;
    for sub in &mut section.subsections {
        finish_section(sub);
    }
}

// ── Rule 1: Markdown headings ────────────────────────────────────────────────

static RE_MD_HEADING: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(#{1,6})\s+(.+?)\s*#*\s*$").unwrap());

// ── Rule 2: Numbered headings ────────────────────────────────────────────────
//
// `3 Derivatives` and `3.2 Chain rule` are headings; `3. item` is a list item.

static RE_NUMBERED_HEADING: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\d{1,2}(?:\.\d{1,2})*)\s+(\p{Lu}[^.:;!?]{1,78})$").unwrap());

/// Returns the heading level (1 = document title) and its text.
fn detect_heading(line: &str) -> Option<(usize, String)> {
    let line = line.trim();
    if let Some(caps) = RE_MD_HEADING.captures(line) {
        let level = caps[1].len().min(3);
        return Some((level, caps[2].to_string()));
    }
    if let Some(caps) = RE_NUMBERED_HEADING.captures(line) {
        let depth = caps[1].split('.').count();
        let level = if depth == 1 { 2 } else { 3 };
        return Some((level, format!("{} {}", &caps[1], caps[2].trim())));
    }
    None
}

// ── Rule 3: Display formulas ─────────────────────────────────────────────────

static RE_DISPLAY_MATH: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)\$\$(.+?)\$\$|\\\[(.+?)\\\]").unwrap());

fn extract_formulas(section_id: &str, content: &str) -> (String, Vec<Formula>) {
    let mut formulas = Vec::new();
    for caps in RE_DISPLAY_MATH.captures_iter(content) {
        let latex = caps.get(1).or_else(|| caps.get(2)).map_or("", |m| m.as_str()).trim();
        if latex.is_empty() {
            continue;
        }
        formulas.push(Formula {
            id: format!("{section_id}-f{}", formulas.len() + 1),
            latex: latex.to_string(),
            description: None,
        });
    }
    let rest = RE_DISPLAY_MATH.replace_all(content, "").to_string();
    (rest, formulas)
}

// ── Rule 4: Example paragraphs ───────────────────────────────────────────────

static RE_EXAMPLE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?i)((?:example|beispiel)(?:\s+\d+(?:\.\d+)*)?)(?:\s*[:.]\s*|\s+|$)(.*)$").unwrap()
});

static RE_PARAGRAPH_BREAK: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n\s*\n").unwrap());

fn extract_examples(section_id: &str, content: &str) -> (String, Vec<Example>) {
    let mut examples = Vec::new();
    let mut kept = Vec::new();

    for para in RE_PARAGRAPH_BREAK.split(content) {
        let trimmed = para.trim();
        let (first, rest) = trimmed.split_once('\n').unwrap_or((trimmed, ""));
        match RE_EXAMPLE.captures(first) {
            Some(caps) => {
                let body = [caps[2].trim(), rest.trim()]
                    .into_iter()
                    .filter(|s| !s.is_empty())
                    .collect::<Vec<_>>()
                    .join("\n");
                examples.push(Example {
                    id: format!("{section_id}-e{}", examples.len() + 1),
                    title: caps[1].to_string(),
                    content: body,
                });
            }
            None if !trimmed.is_empty() => kept.push(trimmed),
            None => {}
        }
    }
    (kept.join("\n\n"), examples)
}

// ── Preservation accounting ──────────────────────────────────────────────────

fn visible_chars(s: &str) -> usize {
    s.chars().filter(|c| !c.is_whitespace() && *c != '#' && *c != '$').count()
}

fn section_chars(s: &Section) -> usize {
    visible_chars(&s.title)
        + visible_chars(&s.content)
        + s.formulas.iter().map(|f| visible_chars(&f.latex)).sum::<usize>()
        + s.examples
            .iter()
            .map(|e| visible_chars(&e.title) + visible_chars(&e.content))
            .sum::<usize>()
        + s.subsections.iter().map(section_chars).sum::<usize>()
}

fn part_chars(p: &Part) -> usize {
    visible_chars(&p.title) + p.sections.iter().map(section_chars).sum::<usize>()
}

// ── Tests ────────────────────────────────────────────────────────────────────
