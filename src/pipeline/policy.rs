//! Continuation policy: after a stage fails, keep going or abort the run?

use crate::config::PipelineConfig;
use crate::stage::ProcessingStage;

/// Verdict of [`decide`], with the rule that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Continue(ContinueReason),
    Abort(AbortReason),
}

impl Decision {
    pub fn should_continue(&self) -> bool {
        matches!(self, Decision::Continue(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContinueReason {
    /// The failed stage still holds usable (partial) output.
    PartialOutput,
    /// Fewer earlier failures than `failure_threshold`.
    BelowThreshold,
    /// The stage's most recent error is marked recoverable.
    RecoverableError,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason {
    CriticalStage,
    ThresholdReached,
}

/// Decide whether the run continues after `stage` failed.
///
/// `prior_failures` counts the stages that failed before this one. A stage
/// listed in [`PipelineConfig::critical_stages`] aborts unconditionally;
/// otherwise any of the continue rules is enough.
pub fn decide(config: &PipelineConfig, stage: &ProcessingStage, prior_failures: usize) -> Decision {
    if config.is_critical(&stage.id) {
        return Decision::Abort(AbortReason::CriticalStage);
    }
    if stage.usable_output().is_some() {
        return Decision::Continue(ContinueReason::PartialOutput);
    }
    if prior_failures < config.failure_threshold {
        return Decision::Continue(ContinueReason::BelowThreshold);
    }
    if stage.last_error().is_some_and(|e| e.recoverable) {
        return Decision::Continue(ContinueReason::RecoverableError);
    }
    Decision::Abort(AbortReason::ThresholdReached)
}
