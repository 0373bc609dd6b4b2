//! Run-wide configuration for a [`crate::engine::ContentPipeline`].
//!
//! All engine policy is controlled through [`PipelineConfig`], built via its
//! [`PipelineConfigBuilder`] or deserialised from JSON (camelCase keys) by the
//! CLI. The config is handed to the pipeline at construction time and never
//! changes during a run.

use crate::error::PipelineError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Configuration for one pipeline run.
///
/// # Example
/// ```rust
/// use edgequake_pipeline::PipelineConfig;
///
/// let config = PipelineConfig::builder()
///     .timeout_ms(30_000)
///     .failure_threshold(1)
///     .critical_stage("extract")
///     .build()
///     .unwrap();
/// assert!(config.is_critical("extract"));
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PipelineConfig {
    /// Advisory capacity hint. Default: 3.
    ///
    /// Stages currently run strictly one after another; the value is kept so
    /// configs written for a parallel scheduler stay valid.
    pub max_concurrent_stages: usize,

    /// Invoke a processor's `recover` when its stage fails. Default: true.
    pub enable_recovery: bool,

    /// Number of earlier stage failures tolerated before the continuation
    /// policy stops relying on the threshold rule. Default: 3.
    pub failure_threshold: usize,

    /// Per-stage timeout in milliseconds. Default: 300 000 (5 min).
    pub timeout_ms: u64,

    /// Minimum acceptable preservation score (0–1). Default: 0.8.
    ///
    /// Advisory: a lower final score adds a pipeline warning but never fails
    /// the run.
    pub preservation_threshold: f64,

    /// Renderer targets requested by the caller. Default: PDF and HTML.
    pub output_formats: Vec<OutputFormat>,

    /// Opaque layout settings passed through to rendering collaborators.
    pub layout_config: serde_json::Value,

    /// Stages whose failure always aborts the run.
    pub critical_stages: Vec<String>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_stages: 3,
            enable_recovery: true,
            failure_threshold: 3,
            timeout_ms: 300_000,
            preservation_threshold: 0.8,
            output_formats: vec![OutputFormat::Pdf, OutputFormat::Html],
            layout_config: serde_json::Value::Null,
            critical_stages: Vec::new(),
        }
    }
}

impl PipelineConfig {
    /// Create a new builder for `PipelineConfig`.
    pub fn builder() -> PipelineConfigBuilder {
        PipelineConfigBuilder {
            config: Self::default(),
        }
    }

    /// Parse a JSON config document, then validate it.
    pub fn from_json(json: &str) -> Result<Self, PipelineError> {
        let config: PipelineConfig = serde_json::from_str(json)
            .map_err(|e| PipelineError::InvalidConfig(format!("malformed JSON: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Whether the given stage is marked critical.
    pub fn is_critical(&self, stage_id: &str) -> bool {
        self.critical_stages.iter().any(|s| s == stage_id)
    }

    pub(crate) fn validate(&self) -> Result<(), PipelineError> {
        if self.max_concurrent_stages == 0 {
            return Err(PipelineError::InvalidConfig(
                "maxConcurrentStages must be ≥ 1".into(),
            ));
        }
        if self.timeout_ms == 0 {
            return Err(PipelineError::InvalidConfig("timeoutMs must be > 0".into()));
        }
        if !(0.0..=1.0).contains(&self.preservation_threshold) {
            return Err(PipelineError::InvalidConfig(format!(
                "preservationThreshold must be 0–1, got {}",
                self.preservation_threshold
            )));
        }
        Ok(())
    }
}

/// Builder for [`PipelineConfig`].
#[derive(Debug)]
pub struct PipelineConfigBuilder {
    config: PipelineConfig,
}

impl PipelineConfigBuilder {
    pub fn max_concurrent_stages(mut self, n: usize) -> Self {
        self.config.max_concurrent_stages = n.max(1);
        self
    }

    pub fn enable_recovery(mut self, v: bool) -> Self {
        self.config.enable_recovery = v;
        self
    }

    pub fn failure_threshold(mut self, n: usize) -> Self {
        self.config.failure_threshold = n;
        self
    }

    pub fn timeout_ms(mut self, ms: u64) -> Self {
        self.config.timeout_ms = ms;
        self
    }

    pub fn preservation_threshold(mut self, t: f64) -> Self {
        self.config.preservation_threshold = t.clamp(0.0, 1.0);
        self
    }

    pub fn output_formats(mut self, formats: Vec<OutputFormat>) -> Self {
        self.config.output_formats = formats;
        self
    }

    pub fn layout_config(mut self, layout: serde_json::Value) -> Self {
        self.config.layout_config = layout;
        self
    }

    pub fn critical_stage(mut self, stage_id: impl Into<String>) -> Self {
        self.config.critical_stages.push(stage_id.into());
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<PipelineConfig, PipelineError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

// ── Enums ────────────────────────────────────────────────────────────────

/// Renderer target requested for the final document.
///
/// The engine only records the request. `Json` and `Markdown` are rendered by
/// this crate; `Pdf` and `Html` belong to downstream rendering collaborators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    Pdf,
    Html,
    Markdown,
    Json,
}

impl OutputFormat {
    /// File extension for this format.
    pub fn extension(&self) -> &'static str {
        match self {
            OutputFormat::Pdf => "pdf",
            OutputFormat::Html => "html",
            OutputFormat::Markdown => "md",
            OutputFormat::Json => "json",
        }
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

impl FromStr for OutputFormat {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pdf" => Ok(OutputFormat::Pdf),
            "html" => Ok(OutputFormat::Html),
            "md" | "markdown" => Ok(OutputFormat::Markdown),
            "json" => Ok(OutputFormat::Json),
            other => Err(PipelineError::InvalidConfig(format!(
                "unknown output format '{other}'"
            ))),
        }
    }
}
