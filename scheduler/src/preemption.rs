//! `GangPreemption` Post-Filter plugin (§4.5).
//!
//! Victim selection itself is a pure function, `select_victims`, over plain
//! snapshot types (§9 "expose preemption as a pure function ... so it is testable;
//! the imperative eviction step is a thin adapter"). `GangPreemption` is that thin
//! adapter: it gathers the snapshot through `ClusterPodLister`, calls the pure
//! function, and stashes the resulting plan for the framework to actually carry out
//! (the `PostFilterPlugin` trait only returns a `Status`, so the plan itself is
//! handed off through `take_victim_plan` rather than the return value).

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use kubenexus_common::{Node, Pod, PodId, ResourceList};
use log::debug;

use crate::config::KubeNexusConfig;
use crate::cycle_state::CycleState;
use crate::plugin::{Plugin, PostFilterPlugin, Status};
use crate::profile::{self, TenantTier};

/// A pod already bound to a candidate node, as seen by the pod lister.
#[derive(Clone, Debug)]
pub struct PlacedPod {
    pub pod_name: String,
    pub tier: String,
    pub priority: i64,
    pub creation_timestamp: DateTime<Utc>,
    pub resources: ResourceList,
}

impl PlacedPod {
    fn tier_priority(&self) -> u8 {
        TenantTier::from_str(&self.tier.to_ascii_lowercase()).priority()
    }
}

#[derive(Clone, Debug)]
pub struct NodeCandidate {
    pub node_name: String,
    pub placed_pods: Vec<PlacedPod>,
}

#[derive(Clone, Debug)]
pub struct VictimPlan {
    /// Per-node victim set, in commit order. Every node here individually frees
    /// at least one gang member's worth of resources (invariant 7, §8).
    pub per_node: Vec<(String, Vec<String>)>,
}

fn covers(have: &ResourceList, need: &ResourceList) -> bool {
    have.cpu_millis >= need.cpu_millis
        && have.memory_bytes >= need.memory_bytes
        && need.extra.iter().all(|(k, v)| have.extended(k) >= *v)
}

fn scale(need: &ResourceList, n: u32) -> ResourceList {
    let n = n as u64;
    ResourceList {
        cpu_millis: need.cpu_millis * n,
        memory_bytes: need.memory_bytes * n,
        extra: need.extra.iter().map(|(k, v)| (k.clone(), v * n)).collect(),
    }
}

/// Greedy per-node victim selection, then cross-node aggregation (§4.5 steps 2-4).
/// Returns `None` when no combination of eligible victims frees enough to satisfy
/// the gang ("no preemption candidates").
pub fn select_victims(
    per_pod_need: &ResourceList,
    min_available: u32,
    gang_tier_priority: u8,
    gang_priority: i64,
    candidates: &[NodeCandidate],
) -> Option<VictimPlan> {
    let total_need = scale(per_pod_need, min_available);

    struct NodePlan {
        node_name: String,
        victims: Vec<String>,
        freed: ResourceList,
    }

    let mut contributing = Vec::new();
    for node in candidates {
        let mut eligible: Vec<&PlacedPod> = node
            .placed_pods
            .iter()
            .filter(|p| (p.tier_priority(), p.priority) < (gang_tier_priority, gang_priority))
            .collect();
        eligible.sort_by(|a, b| {
            a.tier_priority()
                .cmp(&b.tier_priority())
                .then(a.priority.cmp(&b.priority))
                .then(a.creation_timestamp.cmp(&b.creation_timestamp))
        });

        let mut freed = ResourceList::default();
        let mut victims = Vec::new();
        for p in eligible {
            if covers(&freed, per_pod_need) {
                break;
            }
            freed.add(&p.resources);
            victims.push(p.pod_name.clone());
        }
        if covers(&freed, per_pod_need) {
            contributing.push(NodePlan { node_name: node.node_name.clone(), victims, freed });
        }
    }

    // Fewest evictions first: prefer cheap nodes while accumulating toward totalNeed.
    contributing.sort_by_key(|n| n.victims.len());

    let mut aggregate = ResourceList::default();
    let mut chosen = Vec::new();
    for plan in contributing {
        if covers(&aggregate, &total_need) {
            break;
        }
        aggregate.add(&plan.freed);
        chosen.push((plan.node_name, plan.victims));
    }

    if covers(&aggregate, &total_need) {
        Some(VictimPlan { per_node: chosen })
    } else {
        None
    }
}

/// Seam into the pods currently placed on a candidate node (§2, out of scope to own
/// the underlying node-info cache here).
pub trait ClusterPodLister: Send + Sync {
    fn pods_on_node(&self, node_name: &str) -> Vec<PlacedPod>;
}

pub type SharedClusterPodLister = Arc<dyn ClusterPodLister>;

pub struct GangPreemption {
    pub pod_lister: SharedClusterPodLister,
    pub config: Arc<KubeNexusConfig>,
    plans: Mutex<HashMap<PodId, VictimPlan>>,
}

impl GangPreemption {
    pub fn new(pod_lister: SharedClusterPodLister, config: Arc<KubeNexusConfig>) -> Self {
        Self { pod_lister, config, plans: Mutex::new(HashMap::new()) }
    }

    /// One-shot handoff of the plan computed by the last successful `post_filter`
    /// call for this pod, for the eviction adapter to actually carry out.
    pub fn take_victim_plan(&self, pod_id: &PodId) -> Option<VictimPlan> {
        self.plans.lock().unwrap().remove(pod_id)
    }
}

impl Plugin for GangPreemption {
    fn name(&self) -> &str {
        "GangPreemption"
    }
}

impl PostFilterPlugin for GangPreemption {
    fn post_filter(&self, state: &CycleState, pod: &Pod, rejected_nodes: &[Node]) -> Status {
        let Some(sched_profile) = profile::get_profile(state) else {
            return Status::error(crate::error::ScheduleError::InvariantViolation(
                "GangPreemption.post_filter ran before ProfileClassifier".to_string(),
            ));
        };
        let min_available = sched_profile.gang_min_available.unwrap_or(1);
        let per_pod_need = pod.total_requests();
        let gang_tier_priority = sched_profile.tenant_tier.priority();
        let gang_priority = pod.priority.unwrap_or(0);

        let candidates: Vec<NodeCandidate> = rejected_nodes
            .iter()
            .map(|n| NodeCandidate { node_name: n.name.clone(), placed_pods: self.pod_lister.pods_on_node(&n.name) })
            .collect();

        match select_victims(&per_pod_need, min_available, gang_tier_priority, gang_priority, &candidates) {
            Some(plan) => {
                let victim_count: usize = plan.per_node.iter().map(|(_, v)| v.len()).sum();
                debug!(
                    "gang {}/{}: committing {victim_count} preemption victim(s) across {} node(s)",
                    pod.id.namespace,
                    sched_profile.gang_name.as_deref().unwrap_or(&pod.id.name),
                    plan.per_node.len()
                );
                self.plans.lock().unwrap().insert(pod.id.clone(), plan);
                Status::success()
            }
            None => Status::unschedulable_and_unresolvable("no preemption candidates"),
        }
    }
}
