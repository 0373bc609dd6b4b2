//! Canonical output document consumed by downstream renderers.
//!
//! Every successful run ends in an [`OutputDocument`], whether it came
//! straight from a stage ([`crate::stage::StageOutput::Canonical`]), was
//! adapted from a raw stage payload, or was synthesised from the source
//! documents as a fallback. All structs use `#[serde(default)]` so partial
//! JSON produced by a stage can be adapted without hand-written parsing.

use crate::config::OutputFormat;
use crate::error::PipelineError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::path::Path;

/// The final, renderer-ready document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputDocument {
    pub title: String,
    pub table_of_contents: Vec<TocEntry>,
    pub parts: Vec<Part>,
    pub cross_references: Vec<CrossReference>,
    pub appendices: Vec<Appendix>,
    pub metadata: DocumentMetadata,
}

impl Default for OutputDocument {
    fn default() -> Self {
        Self::empty("Processed Document")
    }
}

/// One entry of the table of contents.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TocEntry {
    pub title: String,
    /// 1 for parts, 2 for sections, 3+ for subsections.
    pub level: u8,
    pub anchor: String,
}

/// A top-level part, usually one per source document or topic.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Part {
    pub id: String,
    pub title: String,
    pub sections: Vec<Section>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Section {
    pub id: String,
    pub title: String,
    pub content: String,
    pub formulas: Vec<Formula>,
    pub examples: Vec<Example>,
    pub subsections: Vec<Section>,
}

impl Section {
    fn count(&self, f: &impl Fn(&Section) -> usize) -> usize {
        f(self) + self.subsections.iter().map(|s| s.count(f)).sum::<usize>()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Formula {
    pub id: String,
    /// LaTeX source without delimiters.
    pub latex: String,
    pub description: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Example {
    pub id: String,
    pub title: String,
    pub content: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CrossReference {
    pub from: String,
    pub to: String,
    pub label: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Appendix {
    pub title: String,
    pub content: String,
}

/// Document-level metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DocumentMetadata {
    pub generated_at: DateTime<Utc>,
    pub source_files: Vec<String>,
    pub total_sections: usize,
    pub total_formulas: usize,
    pub total_examples: usize,
    /// Estimate (0–1) of how much source content survived processing.
    pub preservation_score: f64,
}

impl Default for DocumentMetadata {
    fn default() -> Self {
        Self {
            generated_at: Utc::now(),
            source_files: Vec::new(),
            total_sections: 0,
            total_formulas: 0,
            total_examples: 0,
            preservation_score: 1.0,
        }
    }
}

impl OutputDocument {
    /// A document with a title and nothing else.
    pub fn empty(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            table_of_contents: Vec::new(),
            parts: Vec::new(),
            cross_references: Vec::new(),
            appendices: Vec::new(),
            metadata: DocumentMetadata::default(),
        }
    }

    /// Number of sections, including nested subsections.
    pub fn count_sections(&self) -> usize {
        self.fold_sections(|_| 1)
    }

    pub fn count_formulas(&self) -> usize {
        self.fold_sections(|s| s.formulas.len())
    }

    pub fn count_examples(&self) -> usize {
        self.fold_sections(|s| s.examples.len())
    }

    fn fold_sections(&self, f: impl Fn(&Section) -> usize) -> usize {
        self.parts
            .iter()
            .flat_map(|p| p.sections.iter())
            .map(|s| s.count(&f))
            .sum()
    }

    /// Fill any zero aggregate counts from the nested structure.
    pub fn derive_totals(&mut self) {
        if self.metadata.total_sections == 0 {
            self.metadata.total_sections = self.count_sections();
        }
        if self.metadata.total_formulas == 0 {
            self.metadata.total_formulas = self.count_formulas();
        }
        if self.metadata.total_examples == 0 {
            self.metadata.total_examples = self.count_examples();
        }
    }

    /// Rebuild the table of contents from parts and sections.
    pub fn build_toc(&mut self) {
        fn push_sections(toc: &mut Vec<TocEntry>, sections: &[Section], level: u8) {
            for s in sections {
                toc.push(TocEntry {
                    title: s.title.clone(),
                    level,
                    anchor: s.id.clone(),
                });
                push_sections(toc, &s.subsections, level.saturating_add(1));
            }
        }

        let mut toc = Vec::new();
        for part in &self.parts {
            toc.push(TocEntry {
                title: part.title.clone(),
                level: 1,
                anchor: part.id.clone(),
            });
            push_sections(&mut toc, &part.sections, 2);
        }
        self.table_of_contents = toc;
    }

    /// Render as Markdown.
    pub fn to_markdown(&self) -> String {
        let mut md = String::with_capacity(4096);
        let _ = writeln!(md, "# {}\n", self.title);

        if !self.table_of_contents.is_empty() {
            md.push_str("## Contents\n\n");
            for entry in &self.table_of_contents {
                let indent = "  ".repeat(entry.level.saturating_sub(1) as usize);
                let _ = writeln!(md, "{indent}- [{}](#{})", entry.title, entry.anchor);
            }
            md.push('\n');
        }

        for part in &self.parts {
            let _ = writeln!(md, "## {}\n", part.title);
            for section in &part.sections {
                render_section(&mut md, section, 3);
            }
        }

        if !self.cross_references.is_empty() {
            md.push_str("## Cross references\n\n");
            for r in &self.cross_references {
                let _ = writeln!(md, "- {} → {} ({})", r.from, r.to, r.label);
            }
            md.push('\n');
        }

        for appendix in &self.appendices {
            let _ = writeln!(md, "## Appendix: {}\n\n{}\n", appendix.title, appendix.content);
        }

        let _ = writeln!(
            md,
            "---\n\n*Generated {} from {} file(s); preservation score {:.2}.*",
            self.metadata.generated_at.format("%Y-%m-%d %H:%M UTC"),
            self.metadata.source_files.len(),
            self.metadata.preservation_score
        );
        md
    }

    /// Render in one of the text formats this crate produces itself.
    ///
    /// # Errors
    /// [`PipelineError::UnsupportedFormat`] for PDF and HTML, which belong to
    /// an external renderer fed with the JSON form.
    pub fn render(&self, format: OutputFormat) -> Result<String, PipelineError> {
        match format {
            OutputFormat::Markdown => Ok(self.to_markdown()),
            OutputFormat::Json => Ok(serde_json::to_string_pretty(self)?),
            OutputFormat::Pdf | OutputFormat::Html => Err(PipelineError::UnsupportedFormat(format)),
        }
    }

    /// Render and write to `path` atomically (temp file, then rename).
    pub async fn write_to(
        &self,
        path: impl AsRef<Path>,
        format: OutputFormat,
    ) -> Result<(), PipelineError> {
        let body = self.render(format)?;
        let path = path.as_ref();
        let write_err = |source: std::io::Error| PipelineError::OutputWriteFailed {
            path: path.to_path_buf(),
            source,
        };

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await.map_err(write_err)?;
        }
        let tmp_path = path.with_extension(format!("{}.tmp", format.extension()));
        tokio::fs::write(&tmp_path, body).await.map_err(write_err)?;
        tokio::fs::rename(&tmp_path, path).await.map_err(write_err)?;
        Ok(())
    }
}

fn render_section(md: &mut String, section: &Section, depth: usize) {
    let hashes = "#".repeat(depth.min(6));
    let _ = writeln!(md, "{hashes} {}\n", section.title);
    if !section.content.trim().is_empty() {
        let _ = writeln!(md, "{}\n", section.content.trim());
    }
    for f in &section.formulas {
        let _ = writeln!(md, "$$\n{}\n$$\n", f.latex);
        if let Some(desc) = &f.description {
            let _ = writeln!(md, "{desc}\n");
        }
    }
    for ex in &section.examples {
        let _ = writeln!(md, "**{}**\n\n{}\n", ex.title, ex.content.trim());
    }
    for sub in &section.subsections {
        render_section(md, sub, depth + 1);
    }
}
