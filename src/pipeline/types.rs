//! Shared types for the poll cycle.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::policy::PolicyKind;

// ── Steps ───────────────────────────────────────────────────────────

/// The four steps of a poll cycle, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepName {
    BlockIntake,
    TransactionalOnlyIntake,
    BlockEnforcement,
    TransactionalOnlyEnforcement,
}

impl StepName {
    pub const ALL: [StepName; 4] = [
        StepName::BlockIntake,
        StepName::TransactionalOnlyIntake,
        StepName::BlockEnforcement,
        StepName::TransactionalOnlyEnforcement,
    ];

    pub fn intake(kind: PolicyKind) -> Self {
        match kind {
            PolicyKind::Block => StepName::BlockIntake,
            PolicyKind::TransactionalOnly => StepName::TransactionalOnlyIntake,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StepName::BlockIntake => "block intake",
            StepName::TransactionalOnlyIntake => "transactional-only intake",
            StepName::BlockEnforcement => "block enforcement",
            StepName::TransactionalOnlyEnforcement => "transactional-only enforcement",
        }
    }
}

impl fmt::Display for StepName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a single step ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StepOutcome {
    /// The step ran. `processed` counts messages examined, `deleted` those
    /// queued for deletion.
    Completed { processed: usize, deleted: usize },
    /// Nothing to do: intake folder absent or no senders under policy.
    Skipped { reason: String },
    /// The step aborted; the cycle moved on to the next step.
    Failed { error: String },
}

impl StepOutcome {
    pub fn skipped(reason: impl Into<String>) -> Self {
        StepOutcome::Skipped {
            reason: reason.into(),
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, StepOutcome::Failed { .. })
    }

    pub fn deleted(&self) -> usize {
        match self {
            StepOutcome::Completed { deleted, .. } => *deleted,
            _ => 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StepReport {
    pub step: StepName,
    pub outcome: StepOutcome,
}

// ── Cycle report ────────────────────────────────────────────────────

/// Result of one full poll cycle.
#[derive(Debug, Clone, Serialize)]
pub struct CycleReport {
    pub started_at: DateTime<Utc>,
    pub duration: Duration,
    pub steps: Vec<StepReport>,
}

impl CycleReport {
    pub fn new(started_at: DateTime<Utc>) -> Self {
        Self {
            started_at,
            duration: Duration::ZERO,
            steps: Vec::with_capacity(StepName::ALL.len()),
        }
    }

    pub fn push(&mut self, step: StepName, outcome: StepOutcome) {
        self.steps.push(StepReport { step, outcome });
    }

    pub fn outcome(&self, step: StepName) -> Option<&StepOutcome> {
        self.steps.iter().find(|r| r.step == step).map(|r| &r.outcome)
    }

    pub fn failures(&self) -> usize {
        self.steps.iter().filter(|r| r.outcome.is_failed()).count()
    }

    pub fn total_deleted(&self) -> usize {
        self.steps.iter().map(|r| r.outcome.deleted()).sum()
    }
}
