//! Workspace health classification.
//!
//! A pure function over observed pod facts plus the supervisor probe result.
//! The restart-count and recent-crash rules exist because a single good
//! probe right after a crash is not evidence of stability; the probe's
//! all-processes-online requirement keeps a workspace out of rotation until
//! its supervisor has finished bringing user services up.

use chrono::{DateTime, Duration, Utc};
use serde::{Serialize, Serializer};

use crate::cluster::{PodFacts, Termination};

/// Restart count at or above which a workspace is considered crashing.
pub const MAX_RESTARTS: u32 = 3;

/// A non-zero exit within this window marks the workspace unstable.
const CRASH_WINDOW_SECS: i64 = 300;

/// Any termination within this window blocks hand-out eligibility.
const ELIGIBLE_QUIET_SECS: i64 = 600;

/// Derived health state of a workspace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthState {
    /// No compute unit observed yet.
    Creating,
    Pending,
    Starting,
    Running,
    Unstable,
    Crashing,
    Failed,
    /// Lower-cased raw phase for anything the ladder does not map.
    Other(String),
}

impl HealthState {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Creating => "creating",
            Self::Pending => "pending",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Unstable => "unstable",
            Self::Crashing => "crashing",
            Self::Failed => "failed",
            Self::Other(s) => s,
        }
    }
}

impl std::fmt::Display for HealthState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for HealthState {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

fn terminated_within(t: Option<&Termination>, now: DateTime<Utc>, window_secs: i64) -> bool {
    match t.and_then(|t| t.finished_at) {
        Some(at) => now.signed_duration_since(at) < Duration::seconds(window_secs),
        None => false,
    }
}

fn all_ready(facts: &PodFacts) -> bool {
    !facts.containers.is_empty() && facts.containers.iter().all(|c| c.ready)
}

/// Classify a workspace's compute unit. First match wins.
pub fn classify_pod(facts: &PodFacts, probe_ok: bool, now: DateTime<Utc>) -> HealthState {
    if matches!(facts.phase.as_str(), "Failed" | "Unknown") {
        return HealthState::Failed;
    }
    if facts
        .containers
        .iter()
        .any(|c| c.restart_count >= MAX_RESTARTS)
    {
        return HealthState::Crashing;
    }
    if facts.containers.iter().any(|c| {
        c.waiting_reason
            .as_deref()
            .is_some_and(|r| r.ends_with("BackOff"))
    }) {
        return HealthState::Crashing;
    }
    if facts
        .containers
        .iter()
        .any(|c| c.terminated.as_ref().is_some_and(|t| t.exit_code != 0))
    {
        return HealthState::Failed;
    }
    if facts.containers.iter().any(|c| {
        c.last_termination
            .as_ref()
            .is_some_and(|t| t.exit_code != 0)
            && terminated_within(c.last_termination.as_ref(), now, CRASH_WINDOW_SECS)
    }) {
        return HealthState::Unstable;
    }
    if facts.phase == "Running" {
        if !all_ready(facts) {
            return HealthState::Starting;
        }
        return if probe_ok {
            HealthState::Running
        } else {
            HealthState::Starting
        };
    }
    if facts.phase == "Pending" {
        return HealthState::Pending;
    }
    HealthState::Other(facts.phase.to_lowercase())
}

/// True when classification hinges on the supervisor probe, so callers can
/// skip probing pods that would not classify as running anyway.
pub fn needs_probe(facts: &PodFacts, now: DateTime<Utc>) -> bool {
    classify_pod(facts, false, now) == HealthState::Starting && all_ready(facts)
}

/// Strict hand-out predicate: eligibility-for-use is tighter than merely
/// non-crashing. Requires a running phase, every container ready, no
/// crash-looping restarts, a 600-second quiet window since any termination,
/// and a positive supervisor probe.
pub fn is_eligible(facts: &PodFacts, probe_ok: bool, now: DateTime<Utc>) -> bool {
    facts.phase == "Running"
        && all_ready(facts)
        && !facts
            .containers
            .iter()
            .any(|c| c.restart_count >= MAX_RESTARTS)
        && !facts.containers.iter().any(|c| {
            c.terminated.is_some()
                || terminated_within(c.last_termination.as_ref(), now, ELIGIBLE_QUIET_SECS)
        })
        && probe_ok
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::ContainerFacts;

    fn ready_container() -> ContainerFacts {
        ContainerFacts {
            name: "workspace".into(),
            ready: true,
            ..ContainerFacts::default()
        }
    }

    fn running_pod() -> PodFacts {
        PodFacts {
            phase: "Running".into(),
            ip: Some("10.0.0.1".into()),
            containers: vec![ready_container()],
        }
    }

    fn terminated(exit_code: i32, secs_ago: i64, now: DateTime<Utc>) -> Termination {
        Termination {
            exit_code,
            finished_at: Some(now - Duration::seconds(secs_ago)),
        }
    }

    #[test]
    fn failed_phase_wins() {
        let now = Utc::now();
        let mut pod = running_pod();
        pod.phase = "Failed".into();
        assert_eq!(classify_pod(&pod, true, now), HealthState::Failed);
        pod.phase = "Unknown".into();
        assert_eq!(classify_pod(&pod, true, now), HealthState::Failed);
    }

    #[test]
    fn restart_count_three_is_crashing_regardless_of_phase() {
        let now = Utc::now();
        for phase in ["Running", "Pending", "Succeeded"] {
            let mut pod = running_pod();
            pod.phase = phase.into();
            pod.containers[0].restart_count = 3;
            assert_eq!(
                classify_pod(&pod, true, now),
                HealthState::Crashing,
                "phase {}",
                phase
            );
        }
    }

    #[test]
    fn restart_count_two_with_good_probe_is_running() {
        let now = Utc::now();
        let mut pod = running_pod();
        pod.containers[0].restart_count = 2;
        assert_eq!(classify_pod(&pod, true, now), HealthState::Running);
    }

    #[test]
    fn backoff_waiting_reason_is_crashing() {
        let now = Utc::now();
        for reason in ["CrashLoopBackOff", "ImagePullBackOff"] {
            let mut pod = running_pod();
            pod.containers[0].ready = false;
            pod.containers[0].waiting_reason = Some(reason.into());
            assert_eq!(classify_pod(&pod, true, now), HealthState::Crashing);
        }
    }

    #[test]
    fn current_nonzero_termination_is_failed() {
        let now = Utc::now();
        let mut pod = running_pod();
        pod.containers[0].terminated = Some(terminated(1, 0, now));
        assert_eq!(classify_pod(&pod, true, now), HealthState::Failed);
    }

    #[test]
    fn recent_nonzero_last_termination_is_unstable() {
        let now = Utc::now();
        let mut pod = running_pod();
        pod.containers[0].last_termination = Some(terminated(137, 100, now));
        assert_eq!(classify_pod(&pod, true, now), HealthState::Unstable);
    }

    #[test]
    fn old_last_termination_does_not_mark_unstable() {
        let now = Utc::now();
        let mut pod = running_pod();
        pod.containers[0].last_termination = Some(terminated(137, 400, now));
        assert_eq!(classify_pod(&pod, true, now), HealthState::Running);
    }

    #[test]
    fn zero_exit_last_termination_is_not_unstable() {
        let now = Utc::now();
        let mut pod = running_pod();
        pod.containers[0].last_termination = Some(terminated(0, 10, now));
        assert_eq!(classify_pod(&pod, true, now), HealthState::Running);
    }

    #[test]
    fn not_all_ready_is_starting() {
        let now = Utc::now();
        let mut pod = running_pod();
        pod.containers.push(ContainerFacts {
            name: "sidecar".into(),
            ready: false,
            ..ContainerFacts::default()
        });
        assert_eq!(classify_pod(&pod, true, now), HealthState::Starting);
    }

    #[test]
    fn no_containers_is_starting() {
        let now = Utc::now();
        let mut pod = running_pod();
        pod.containers.clear();
        assert_eq!(classify_pod(&pod, true, now), HealthState::Starting);
    }

    #[test]
    fn failed_probe_is_starting() {
        let now = Utc::now();
        let pod = running_pod();
        assert_eq!(classify_pod(&pod, false, now), HealthState::Starting);
    }

    #[test]
    fn pending_phase() {
        let now = Utc::now();
        let mut pod = running_pod();
        pod.phase = "Pending".into();
        pod.containers.clear();
        assert_eq!(classify_pod(&pod, false, now), HealthState::Pending);
    }

    #[test]
    fn unmapped_phase_lowercased() {
        let now = Utc::now();
        let mut pod = running_pod();
        pod.phase = "Succeeded".into();
        assert_eq!(
            classify_pod(&pod, false, now),
            HealthState::Other("succeeded".into())
        );
    }

    #[test]
    fn needs_probe_only_when_probe_would_decide() {
        let now = Utc::now();
        assert!(needs_probe(&running_pod(), now));

        let mut crashing = running_pod();
        crashing.containers[0].restart_count = 5;
        assert!(!needs_probe(&crashing, now));

        let mut not_ready = running_pod();
        not_ready.containers[0].ready = false;
        assert!(!needs_probe(&not_ready, now));

        let mut pending = running_pod();
        pending.phase = "Pending".into();
        assert!(!needs_probe(&pending, now));
    }

    #[test]
    fn eligibility_requires_probe() {
        let now = Utc::now();
        let pod = running_pod();
        assert!(is_eligible(&pod, true, now));
        assert!(!is_eligible(&pod, false, now));
    }

    #[test]
    fn eligibility_quiet_window_is_stricter_than_unstable_window() {
        let now = Utc::now();
        let mut pod = running_pod();
        // 400s ago: outside the 300s unstable window but inside the 600s
        // quiet window, so it classifies running yet is not handed out.
        pod.containers[0].last_termination = Some(terminated(137, 400, now));
        assert_eq!(classify_pod(&pod, true, now), HealthState::Running);
        assert!(!is_eligible(&pod, true, now));

        pod.containers[0].last_termination = Some(terminated(137, 700, now));
        assert!(is_eligible(&pod, true, now));
    }

    #[test]
    fn eligibility_blocks_on_any_recent_termination_even_clean() {
        let now = Utc::now();
        let mut pod = running_pod();
        pod.containers[0].last_termination = Some(terminated(0, 100, now));
        assert!(!is_eligible(&pod, true, now));
    }

    #[test]
    fn eligibility_blocks_on_restarts() {
        let now = Utc::now();
        let mut pod = running_pod();
        pod.containers[0].restart_count = 3;
        assert!(!is_eligible(&pod, true, now));
    }

    #[test]
    fn health_state_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&HealthState::Running).unwrap(),
            "\"running\""
        );
        assert_eq!(
            serde_json::to_string(&HealthState::Other("succeeded".into())).unwrap(),
            "\"succeeded\""
        );
    }
}
