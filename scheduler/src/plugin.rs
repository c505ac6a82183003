//! Plugin extension points (§2, §9).
//!
//! This mirrors the generic scheduling-framework pipeline the core hooks into —
//! Queue-Sort, Pre-Filter, Filter, Post-Filter, Score, Reserve, Permit, and the
//! PostBind hook gang cleanup needs — narrowed to the extension points KubeNexus's
//! own plugins actually implement. Bind itself and the rest of the pipeline (informer
//! caches, the node-info snapshot, PreBind, admission) belong to the host framework
//! and are out of scope here.

use std::cmp::Ordering;
use std::time::Duration;

use kubenexus_common::{Node, Pod};

use crate::cycle_state::CycleState;

pub trait Plugin {
    fn name(&self) -> &str;
}

/// Status returned from every extension point, mirroring the framework's own
/// `Status`/`Code` result type (§7): plugins never return `Result` for expected
/// scheduling outcomes, only for truly exceptional internal errors via `Code::Error`.
#[derive(Clone, Debug, Default)]
pub struct Status {
    pub code: Code,
    pub reasons: Vec<String>,
    pub err: String,
    pub plugin: String,
}

impl Status {
    pub fn success() -> Self {
        Self::default()
    }

    pub fn unschedulable(reason: impl Into<String>) -> Self {
        Self {
            code: Code::Unschedulable,
            reasons: vec![reason.into()],
            ..Default::default()
        }
    }

    pub fn unschedulable_and_unresolvable(reason: impl Into<String>) -> Self {
        Self {
            code: Code::UnschedulableAndUnresolvable,
            reasons: vec![reason.into()],
            ..Default::default()
        }
    }

    pub fn error(err: impl std::fmt::Display) -> Self {
        Self {
            code: Code::Error,
            err: err.to_string(),
            ..Default::default()
        }
    }

    pub fn is_success(&self) -> bool {
        self.code == Code::Success
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum Code {
    #[default]
    Success,
    Error,
    Unschedulable,
    UnschedulableAndUnresolvable,
}

/// Outcome of a Permit call (§4.2.3): either the pod proceeds immediately, is parked
/// for up to the given timeout, or is rejected outright.
pub enum PermitOutcome {
    Allow,
    Wait(Duration),
    Reject(String),
}

/// Queue-Sort (§4.2.1). Must be a strict weak ordering across the whole active
/// queue — implementations are expected to fall through cleanly when tie-break
/// branches don't discriminate, never to return `Ordering::Equal` by omission.
pub trait QueueSortPlugin: Plugin + Send + Sync {
    fn less(&self, a: &Pod, b: &Pod) -> Ordering;
}

/// Pre-Filter (§4.1, §4.2.2): runs once per pod per cycle before any Filter plugin.
/// A non-success status here skips Filter/Score entirely for this pod.
pub trait PreFilterPlugin: Plugin + Send + Sync {
    fn pre_filter(&self, state: &mut CycleState, pod: &Pod, nodes: &[Node]) -> Status;
}

/// Filter (§4.3.2, §4.4.3): evaluated independently against every surviving
/// candidate node.
pub trait FilterPlugin: Plugin + Send + Sync {
    fn filter(&self, state: &CycleState, pod: &Pod, node: &Node) -> Status;
}

/// Post-Filter (§4.5): invoked only once Filter has rejected every node for a pod.
pub trait PostFilterPlugin: Plugin + Send + Sync {
    fn post_filter(&self, state: &CycleState, pod: &Pod, rejected_nodes: &[Node]) -> Status;
}

/// Score (§4.3.3, §4.4.4): runs per surviving node, returns `[0, 100]`.
pub trait ScorePlugin: Plugin + Send + Sync {
    fn score(&self, state: &mut CycleState, pod: &Pod, node: &Node) -> (i64, Status);
}

/// Reserve/Unreserve (§4.2.4, §4.6): commits or rolls back the resources a pod
/// claims on its assigned node.
pub trait ReservePlugin: Plugin + Send + Sync {
    fn reserve(&self, state: &CycleState, pod: &Pod, node_name: &str) -> Status;
    fn unreserve(&self, state: &CycleState, pod: &Pod, node_name: &str);
}

/// Permit (§4.2.3): the sole point at which a pod may block indefinitely (bounded by
/// the returned timeout).
pub trait PermitPlugin: Plugin + Send + Sync {
    fn permit(&self, state: &CycleState, pod: &Pod, node_name: &str) -> PermitOutcome;
}

/// PostBind (§3, §4.4.4, §5): notifies a plugin that a pod was successfully bound,
/// after Bind itself (out of scope here) has already committed. This is the only
/// point at which a gang's per-member completion state is known, so it is where
/// `PodGroupInfo`/`GangNUMAState` entries get retired once every member is bound
/// rather than leaking until a future gang reuses the same name.
pub trait PostBindPlugin: Plugin + Send + Sync {
    fn post_bind(&self, state: &CycleState, pod: &Pod, node_name: &str);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_helpers_set_expected_codes() {
        assert!(Status::success().is_success());
        assert_eq!(Status::unschedulable("x").code, Code::Unschedulable);
        assert_eq!(
            Status::unschedulable_and_unresolvable("x").code,
            Code::UnschedulableAndUnresolvable
        );
        assert_eq!(Status::error("boom").code, Code::Error);
        assert_eq!(Status::error("boom").err, "boom");
    }
}
