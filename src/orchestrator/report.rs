//! Run reports
//!
//! The orchestrator's only externally observable artifact besides cluster
//! mutations: a structured enumeration of what happened to each resource
//! in the plan, in plan order.

use std::fmt;
use std::time::Duration;

use crate::graph::ResourceKey;

/// Terminal result of one apply step
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// Applied (and, where required, readiness confirmed)
    Success,
    /// No action taken; the reason says why (`unchanged`, `run aborted`,
    /// `dependency ... failed`, `run cancelled`)
    Skipped(String),
    /// Render rejected, apply rejected, or retries exhausted
    Failed(String),
    /// Apply accepted but the required readiness never arrived in budget
    TimedOut,
}

impl Outcome {
    /// True for `Success`
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success)
    }

    /// True for `Failed` or `TimedOut` — the outcomes that trip FailFast
    /// and block dependents
    pub fn is_failure(&self) -> bool {
        matches!(self, Outcome::Failed(_) | Outcome::TimedOut)
    }

    /// True when this step left the resource usable by its dependents:
    /// a fresh success, or an unchanged skip (already converged)
    pub fn satisfies_dependents(&self) -> bool {
        match self {
            Outcome::Success => true,
            Outcome::Skipped(reason) => reason == "unchanged",
            _ => false,
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Success => write!(f, "Success"),
            Outcome::Skipped(reason) => write!(f, "Skipped({})", reason),
            Outcome::Failed(err) => write!(f, "Failed({})", err),
            Outcome::TimedOut => write!(f, "TimedOut"),
        }
    }
}

/// Outcome and timing for one resource in the plan
#[derive(Clone, Debug)]
pub struct StepReport {
    /// The resource the step was for
    pub key: ResourceKey,
    /// What happened
    pub outcome: Outcome,
    /// Wall time the step took, including retries and readiness polling
    pub duration: Duration,
}

/// Per-resource outcomes for one orchestrator run, in plan order.
#[derive(Clone, Debug, Default)]
pub struct RunReport {
    steps: Vec<StepReport>,
}

impl RunReport {
    /// Build a report from steps already in plan order
    pub fn new(steps: Vec<StepReport>) -> Self {
        Self { steps }
    }

    /// All steps, in plan order
    pub fn steps(&self) -> &[StepReport] {
        &self.steps
    }

    /// Outcome for a specific resource, if it was in the plan
    pub fn outcome_for(&self, key: &ResourceKey) -> Option<&Outcome> {
        self.steps.iter().find(|s| &s.key == key).map(|s| &s.outcome)
    }

    /// Number of `Success` steps
    pub fn succeeded(&self) -> usize {
        self.steps.iter().filter(|s| s.outcome.is_success()).count()
    }

    /// Number of `Failed`/`TimedOut` steps
    pub fn failed(&self) -> usize {
        self.steps.iter().filter(|s| s.outcome.is_failure()).count()
    }

    /// Number of `Skipped` steps
    pub fn skipped(&self) -> usize {
        self.steps
            .iter()
            .filter(|s| matches!(s.outcome, Outcome::Skipped(_)))
            .count()
    }

    /// True when no step failed or timed out
    pub fn is_success(&self) -> bool {
        self.failed() == 0
    }

    /// The first failing step in plan order, if any — the fatal cause
    /// a FailFast run propagates to the caller
    pub fn first_failure(&self) -> Option<&StepReport> {
        self.steps.iter().find(|s| s.outcome.is_failure())
    }
}
