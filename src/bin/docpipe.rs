//! CLI binary for edgequake-pipeline.
//!
//! Runs the built-in `extract → structure → assemble` chain over a set of
//! files and writes the result in the requested formats.

use anyhow::{Context, Result};
use clap::Parser;
use edgequake_pipeline::{
    attach_progress, processors, ContentPipeline, DocumentCategory, OutputDocument, OutputFormat,
    PipelineConfig, PipelineError, PipelineProgressCallback, RunOutcome,
};
use indicatif::{ProgressBar, ProgressStyle};
use std::collections::HashMap;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

// ── ANSI colour helpers (no extra deps) ──────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn red(s: &str) -> String {
    format!("\x1b[31m{s}\x1b[0m")
}
fn yellow(s: &str) -> String {
    format!("\x1b[33m{s}\x1b[0m")
}
fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}
fn bold(s: &str) -> String {
    format!("\x1b[1m{s}\x1b[0m")
}
fn cyan(s: &str) -> String {
    format!("\x1b[36m{s}\x1b[0m")
}

const TICKS: &[&str] = &["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"];

// ── CLI progress callback using indicatif ────────────────────────────────────

/// Renders one bar over the stages plus a log line per finished stage.
struct CliProgressCallback {
    bar: ProgressBar,
    start_times: Mutex<HashMap<String, Instant>>,
}

impl CliProgressCallback {
    fn new() -> Arc<Self> {
        let bar = ProgressBar::new(0);
        let spinner_style = ProgressStyle::with_template("{spinner:.cyan} {prefix:.bold}  {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_strings(TICKS);
        bar.set_style(spinner_style);
        bar.set_prefix("Preparing");
        bar.set_message("Loading documents…");
        bar.enable_steady_tick(Duration::from_millis(80));

        Arc::new(Self {
            bar,
            start_times: Mutex::new(HashMap::new()),
        })
    }

    fn elapsed_secs(&self, stage_id: &str) -> f64 {
        self.start_times
            .lock()
            .ok()
            .and_then(|mut m| m.remove(stage_id))
            .map(|t| t.elapsed().as_secs_f64())
            .unwrap_or(0.0)
    }
}

impl PipelineProgressCallback for CliProgressCallback {
    fn on_pipeline_start(&self, total_stages: usize, total_documents: usize) {
        let style = ProgressStyle::with_template(
            "{spinner:.cyan} {prefix:.bold}  \
             [{bar:42.green/238}] {pos:>2}/{len} stages  \
             ⏱ {elapsed_precise}  {msg}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▉▊▋▌▍▎▏  ")
        .tick_strings(TICKS);

        self.bar.set_length(total_stages as u64);
        self.bar.set_style(style);
        self.bar.set_prefix("Processing");
        self.bar.println(format!(
            "{} {}",
            cyan("◆"),
            bold(&format!(
                "Running {total_stages} stages over {total_documents} documents…"
            ))
        ));
    }

    fn on_stage_start(&self, stage_id: &str, _index: usize, _total: usize) {
        if let Ok(mut m) = self.start_times.lock() {
            m.insert(stage_id.to_string(), Instant::now());
        }
        self.bar.set_message(stage_id.to_string());
    }

    fn on_stage_complete(&self, stage_id: &str, _duration_ms: u64) {
        let secs = self.elapsed_secs(stage_id);
        self.bar.println(format!(
            "  {} {:<24} {}",
            green("✓"),
            stage_id,
            dim(&format!("{secs:.1}s"))
        ));
        self.bar.inc(1);
    }

    fn on_stage_recovered(&self, stage_id: &str) {
        let secs = self.elapsed_secs(stage_id);
        self.bar.println(format!(
            "  {} {:<24} {}  {}",
            yellow("↺"),
            stage_id,
            yellow("recovered"),
            dim(&format!("{secs:.1}s"))
        ));
        self.bar.inc(1);
    }

    fn on_stage_failed(&self, stage_id: &str, error: &str) {
        let secs = self.elapsed_secs(stage_id);
        // Keep the log line on one row.
        let msg = if error.chars().count() > 80 {
            format!("{}\u{2026}", error.chars().take(79).collect::<String>())
        } else {
            error.to_string()
        };
        self.bar.println(format!(
            "  {} {:<24} {}  {}",
            red("✗"),
            stage_id,
            red(&msg),
            dim(&format!("{secs:.1}s"))
        ));
        self.bar.inc(1);
    }

    fn on_stage_skipped(&self, stage_id: &str, reason: &str) {
        self.bar.println(format!(
            "  {} {:<24} {}",
            dim("–"),
            stage_id,
            dim(reason)
        ));
        self.bar.inc(1);
    }

    fn on_pipeline_finished(&self, outcome: RunOutcome) {
        self.bar.finish_and_clear();
        match outcome {
            RunOutcome::Completed {
                stages_completed,
                stages_failed: 0,
            } => eprintln!(
                "{} {} stages completed",
                green("✔"),
                bold(&stages_completed.to_string())
            ),
            RunOutcome::Completed {
                stages_completed,
                stages_failed,
            } => eprintln!(
                "{} {} stages completed  ({} failed)",
                cyan("⚠"),
                bold(&stages_completed.to_string()),
                red(&stages_failed.to_string())
            ),
            RunOutcome::Failed => eprintln!("{} pipeline aborted", red("✘")),
            RunOutcome::Cancelled => eprintln!("{} pipeline cancelled", yellow("■")),
        }
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Markdown to stdout
  docpipe notes/lecture_01.md notes/exercises_01.md

  # Markdown and JSON files next to each other
  docpipe notes/*.md -f markdown -f json -o build/course

  # Stop after the first failed stage, 30s per stage
  docpipe --failure-threshold 1 --timeout-ms 30000 notes/*.md

  # Full config from a JSON file (camelCase keys)
  docpipe --config pipeline.json notes/*.md

CONFIG FILE:
  {
    "enableRecovery": true,
    "failureThreshold": 3,
    "timeoutMs": 300000,
    "preservationThreshold": 0.8,
    "outputFormats": ["markdown", "json"],
    "criticalStages": ["extract"]
  }

  Flags given on the command line override the file.

OUTPUT FORMATS:
  markdown, json   written by docpipe
  pdf, html        need an external renderer; feed it the JSON output
"#;

/// Assemble a set of course documents into one structured document.
#[derive(Parser, Debug)]
#[command(
    name = "docpipe",
    version,
    about = "Assemble course documents into one structured document",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    /// Source files (Markdown, plain text).
    #[arg(required = true)]
    inputs: Vec<PathBuf>,

    /// Pipeline config as JSON (camelCase keys).
    #[arg(short, long, env = "DOCPIPE_CONFIG")]
    config: Option<PathBuf>,

    /// Output path without extension; one file per format. Stdout if omitted.
    #[arg(short, long, env = "DOCPIPE_OUTPUT")]
    output: Option<PathBuf>,

    /// Output format, repeatable: markdown, json, pdf, html.
    #[arg(short, long = "format", env = "DOCPIPE_FORMAT", value_delimiter = ',')]
    formats: Vec<OutputFormat>,

    /// Per-stage timeout in milliseconds.
    #[arg(long, env = "DOCPIPE_TIMEOUT_MS")]
    timeout_ms: Option<u64>,

    /// Earlier stage failures tolerated before recoverable errors stop the run.
    #[arg(long, env = "DOCPIPE_FAILURE_THRESHOLD")]
    failure_threshold: Option<usize>,

    /// Never call a processor's recovery path.
    #[arg(long)]
    no_recovery: bool,

    /// Document title.
    #[arg(long)]
    title: Option<String>,

    /// Disable progress bar.
    #[arg(long, env = "DOCPIPE_NO_PROGRESS")]
    no_progress: bool,

    /// -v for info logs, -vv for debug.
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress all output except errors.
    #[arg(short, long)]
    quiet: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    // The progress bar replaces INFO logs unless -v is given.
    let show_progress = !cli.quiet && !cli.no_progress && cli.output.is_some();
    let filter = match (cli.quiet, cli.verbose) {
        (true, _) => "error",
        (false, 0) => "warn",
        (false, 1) => "info",
        _ => "debug",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(io::stderr)
        .init();

    // ── Build pipeline ───────────────────────────────────────────────────
    let config = build_config(&cli).await?;
    let formats = if cli.formats.is_empty() {
        vec![OutputFormat::Markdown]
    } else {
        cli.formats.clone()
    };

    let mut pipeline = ContentPipeline::new(config);
    for path in &cli.inputs {
        let bytes = tokio::fs::read(path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        let category = DocumentCategory::infer(&name);
        pipeline.add_source_document(name, bytes, category);
    }
    processors::register_builtin(&mut pipeline);
    for mut spec in processors::default_stages() {
        let is_assembly = spec.processor == processors::assemble::NAME;
        if let (Some(title), true) = (&cli.title, is_assembly) {
            spec = spec.config(serde_json::json!({ "title": title }));
        }
        pipeline.add_stage(spec).context("Invalid stage setup")?;
    }

    if show_progress {
        attach_progress(pipeline.events_mut(), CliProgressCallback::new());
    }

    let cancel = pipeline.cancel_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel.cancel();
        }
    });

    // ── Run ──────────────────────────────────────────────────────────────
    let doc = match pipeline.execute().await {
        Ok(doc) => doc,
        Err(PipelineError::Aborted {
            stage_id,
            message,
            fallback,
        }) => {
            eprintln!(
                "{} aborted at '{}': {}; writing fallback document",
                red("✘"),
                stage_id,
                message
            );
            *fallback
        }
        Err(e) => return Err(e).context("Pipeline failed"),
    };

    // ── Output ───────────────────────────────────────────────────────────
    match &cli.output {
        Some(base) => {
            for format in &formats {
                let path = output_path(base, *format);
                match doc.write_to(&path, *format).await {
                    Ok(()) if !cli.quiet => {
                        eprintln!("{}  {}", green("→"), bold(&path.display().to_string()))
                    }
                    Ok(()) => {}
                    Err(PipelineError::UnsupportedFormat(f)) => {
                        eprintln!("{} skipping {f}: needs an external renderer", yellow("⚠"))
                    }
                    Err(e) => return Err(e).context("Failed to write output"),
                }
            }
        }
        None => write_stdout(&doc, &formats)?,
    }

    if !cli.quiet {
        print_summary(&pipeline, &doc);
    }
    Ok(())
}

/// Load `--config` (if any) and apply flag overrides.
async fn build_config(cli: &Cli) -> Result<PipelineConfig> {
    let base = match &cli.config {
        Some(path) => {
            let json = tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("Failed to read config from {}", path.display()))?;
            PipelineConfig::from_json(&json).context("Invalid config file")?
        }
        None => PipelineConfig::default(),
    };

    let mut builder = PipelineConfig::builder()
        .max_concurrent_stages(base.max_concurrent_stages)
        .enable_recovery(base.enable_recovery && !cli.no_recovery)
        .failure_threshold(cli.failure_threshold.unwrap_or(base.failure_threshold))
        .timeout_ms(cli.timeout_ms.unwrap_or(base.timeout_ms))
        .preservation_threshold(base.preservation_threshold)
        .output_formats(if cli.formats.is_empty() {
            base.output_formats
        } else {
            cli.formats.clone()
        })
        .layout_config(base.layout_config);
    for stage in base.critical_stages {
        builder = builder.critical_stage(stage);
    }
    builder.build().context("Invalid configuration")
}

fn output_path(base: &Path, format: OutputFormat) -> PathBuf {
    base.with_extension(format.extension())
}

fn write_stdout(doc: &OutputDocument, formats: &[OutputFormat]) -> Result<()> {
    let stdout = io::stdout();
    let mut handle = stdout.lock();
    for format in formats {
        match doc.render(*format) {
            Ok(body) => {
                handle
                    .write_all(body.as_bytes())
                    .context("Failed to write to stdout")?;
                if !body.ends_with('\n') {
                    handle.write_all(b"\n").ok();
                }
            }
            Err(PipelineError::UnsupportedFormat(f)) => {
                eprintln!("{} skipping {f}: needs an external renderer", yellow("⚠"))
            }
            Err(e) => return Err(e).context("Failed to render output"),
        }
    }
    Ok(())
}

fn print_summary(pipeline: &ContentPipeline, doc: &OutputDocument) {
    let m = pipeline.metrics();
    eprintln!(
        "   {} parts  /  {} sections  /  {} formulas  /  {} examples",
        doc.parts.len(),
        doc.metadata.total_sections,
        doc.metadata.total_formulas,
        doc.metadata.total_examples,
    );
    eprintln!(
        "   quality {}  /  preserved {}  —  {}ms total",
        dim(&format!("{:.2}", m.average_quality_score)),
        dim(&format!("{:.2}", m.average_preservation_score)),
        m.processing_time_ms,
    );
    for w in pipeline.warnings() {
        eprintln!("   {} {}", yellow("⚠"), w);
    }
}
