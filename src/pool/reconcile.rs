//! Pure reconciliation planning.
//!
//! Separated from the manager so the gap computation is testable without
//! any cluster or concurrency machinery: observed workspaces in, a plan
//! out.

use serde::Serialize;

use crate::health::HealthState;
use crate::workspace::{UsageStatus, Workspace};

/// Workspace counts by health state and usage.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct StateCounts {
    pub total: usize,
    pub running: usize,
    pub pending: usize,
    pub failed: usize,
    pub used: usize,
    pub unused: usize,
}

impl StateCounts {
    pub fn tally(workspaces: &[Workspace]) -> Self {
        let mut counts = Self {
            total: workspaces.len(),
            ..Self::default()
        };
        for ws in workspaces {
            match ws.health {
                // Unstable is alive and may settle; it holds capacity.
                HealthState::Running | HealthState::Unstable => counts.running += 1,
                HealthState::Pending | HealthState::Creating | HealthState::Starting => {
                    counts.pending += 1
                }
                HealthState::Failed | HealthState::Crashing => counts.failed += 1,
                HealthState::Other(_) => {}
            }
            if ws.health == HealthState::Running {
                match ws.usage.status {
                    UsageStatus::Used => counts.used += 1,
                    UsageStatus::Unused => counts.unused += 1,
                }
            }
        }
        counts
    }
}

/// One reconciliation decision: how many workspaces to request.
///
/// `needed = max(0, minimum - (running + pending) - failed)`. Failed
/// workspaces count against the gap rather than being replaced blindly, so
/// a persistently failing build does not spawn an unbounded stream of
/// doomed members. There is no scale-down: shrinking the minimum only
/// stops future growth.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct ReconcilePlan {
    pub minimum: u32,
    pub active: usize,
    pub failed: usize,
    pub needed: usize,
}

impl ReconcilePlan {
    pub fn compute(minimum: u32, counts: &StateCounts) -> Self {
        let active = counts.running + counts.pending;
        let needed = (minimum as usize).saturating_sub(active + counts.failed);
        Self {
            minimum,
            active,
            failed: counts.failed,
            needed,
        }
    }
}

/// Aggregate result of one reconciliation pass. Individual create failures
/// are logged, never raised; callers see them only as `created < requested`.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct ReconcileOutcome {
    pub requested: usize,
    pub created: usize,
}
