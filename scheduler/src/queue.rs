//! Queue-Sort ordering for the scheduling queue (§4.2.1, §9 "Gang waiting set").
//!
//! `GangCoordinator` is the one plugin allowed to own `QueueSortPlugin`; this module
//! holds the pure `Less` comparison plus the `QueuedPodInfo` wrapper a `BinaryHeap`-backed
//! active queue would order by, grounded on the teacher's `BackOffPod`/`PodNameWithPriority`
//! ordering pattern (reverse comparison so a max-heap behaves like the earliest-first
//! queue the framework expects).

use std::cmp::Ordering;

use chrono::{DateTime, Utc};

use crate::gang::PodGroupInfo;

/// Minimal queue-ordering view of a pod: enough to implement `Less` without needing
/// the full `Pod`/`SchedulingProfile`.
#[derive(Clone, Debug)]
pub struct QueuedPodInfo {
    pub namespace: String,
    pub pod_name: String,
    pub gang_name: Option<String>,
    pub priority: i64,
    pub first_seen_at: DateTime<Utc>,
}

impl QueuedPodInfo {
    fn tie_break_key(&self) -> String {
        match &self.gang_name {
            Some(g) => format!("{}/{}", self.namespace, g),
            None => format!("{}/{}", self.namespace, self.pod_name),
        }
    }
}

/// `Less(a, b) -> bool` (§4.2.1). `starving(pod)` should report whether the pod's
/// gang has been waiting longer than `StarvationThreshold`; callers derive this from
/// `PodGroupInfo::first_seen_at` vs `now`.
pub fn less(a: &QueuedPodInfo, b: &QueuedPodInfo, a_starving: bool, b_starving: bool) -> bool {
    compare(a, b, a_starving, b_starving) == Ordering::Less
}

/// Full ordering used to sort/compare two queue entries. A strict weak ordering:
/// when both pods are starving (or neither is), falls through to priority, then age,
/// then the stable lexicographic tie-break.
pub fn compare(a: &QueuedPodInfo, b: &QueuedPodInfo, a_starving: bool, b_starving: bool) -> Ordering {
    if a_starving != b_starving {
        return if a_starving { Ordering::Less } else { Ordering::Greater };
    }
    // Higher priority first.
    if a.priority != b.priority {
        return b.priority.cmp(&a.priority);
    }
    // Older first-seen first (FIFO).
    if a.first_seen_at != b.first_seen_at {
        return a.first_seen_at.cmp(&b.first_seen_at);
    }
    a.tie_break_key().cmp(&b.tie_break_key())
}

/// Whether a gang (or synthetic single-pod group) has aged past the starvation
/// threshold as of `now`.
pub fn is_starving(info: &PodGroupInfo, now: DateTime<Utc>, threshold: std::time::Duration) -> bool {
    let age = now.signed_duration_since(info.first_seen_at);
    age.to_std().map(|d| d >= threshold).unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pod(ns: &str, name: &str, gang: Option<&str>, priority: i64, seen_secs_ago: i64) -> QueuedPodInfo {
        QueuedPodInfo {
            namespace: ns.to_string(),
            pod_name: name.to_string(),
            gang_name: gang.map(str::to_string),
            priority,
            first_seen_at: Utc::now() - chrono::Duration::seconds(seen_secs_ago),
        }
    }

    #[test]
    fn starving_pod_goes_first_when_only_one_is_starving() {
        let a = pod("ns", "a", Some("g1"), 0, 100);
        let b = pod("ns", "b", Some("g2"), 100, 1);
        assert!(less(&a, &b, true, false));
        assert!(!less(&b, &a, false, true));
    }

    #[test]
    fn both_starving_falls_through_to_priority() {
        let a = pod("ns", "a", Some("g1"), 10, 100);
        let b = pod("ns", "b", Some("g2"), 20, 100);
        // b has higher priority, so b should sort first even though both starve.
        assert!(less(&b, &a, true, true));
        assert!(!less(&a, &b, true, true));
    }

    #[test]
    fn equal_priority_falls_through_to_age() {
        let a = pod("ns", "a", Some("g1"), 10, 200);
        let b = pod("ns", "b", Some("g2"), 10, 5);
        assert!(less(&a, &b, false, false));
    }

    #[test]
    fn equal_priority_and_age_uses_stable_tiebreak() {
        let now = Utc::now();
        let a = QueuedPodInfo {
            namespace: "ns".to_string(),
            pod_name: "p".to_string(),
            gang_name: Some("a-gang".to_string()),
            priority: 10,
            first_seen_at: now,
        };
        let b = QueuedPodInfo {
            namespace: "ns".to_string(),
            pod_name: "p".to_string(),
            gang_name: Some("b-gang".to_string()),
            priority: 10,
            first_seen_at: now,
        };
        assert!(less(&a, &b, false, false));
    }

    #[test]
    fn non_gang_pod_uses_pod_name_as_tiebreak() {
        let a = pod("ns", "alpha", None, 0, 0);
        let b = pod("ns", "beta", None, 0, 0);
        assert!(less(&a, &b, false, false));
    }
}
