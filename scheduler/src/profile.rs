//! `SchedulingProfile` and the `ProfileClassifier` Pre-Filter plugin (§4.1).
//!
//! Every other plugin reads the profile back out of `CycleState` rather than
//! re-deriving it — it is computed exactly once, in Pre-Filter, and never mutated
//! afterwards (invariant 3, §8).

use kubenexus_common::{Node, Pod, GPU_RESOURCE_NAME};
use log::warn;

use crate::cycle_state::CycleState;
use crate::labels;
use crate::plugin::{Plugin, PreFilterPlugin, Status};

pub const PROFILE_STATE_KEY: &str = "kubenexus.io/scheduling-profile";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TenantTier {
    Gold,
    Silver,
    Bronze,
}

impl TenantTier {
    pub fn from_str(s: &str) -> Self {
        match s {
            "gold" => TenantTier::Gold,
            "silver" => TenantTier::Silver,
            _ => TenantTier::Bronze,
        }
    }

    /// Tier priority used by preemption ordering (§4.5 step 2): gold=3, silver=2,
    /// bronze=1, unknown maps to bronze.
    pub fn priority(self) -> u8 {
        match self {
            TenantTier::Gold => 3,
            TenantTier::Silver => 2,
            TenantTier::Bronze => 1,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkloadType {
    Service,
    Batch,
    Training,
    Inference,
}

const BATCH_OPERATOR_LABELS: &[&str] = &[
    "spark-role",
    "pytorch-replica-type",
    "tf-replica-type",
    "mpi-job-name",
    "ray.io/node-type",
];

/// Derived once per pod per scheduling cycle (§3 "SchedulingProfile"). Never
/// reconstructed or patched after Pre-Filter.
#[derive(Clone, Debug, PartialEq)]
pub struct SchedulingProfile {
    pub tenant_tier: TenantTier,
    pub workload_type: WorkloadType,
    pub is_gang: bool,
    pub gang_name: Option<String>,
    pub gang_min_available: Option<u32>,
    pub is_preemptible: bool,
    pub is_memory_intensive: bool,
}

impl SchedulingProfile {
    pub fn classify(pod: &Pod, namespace_tier_label: Option<&str>, preemptible_priority_cutoff: i64) -> Self {
        let tenant_tier = TenantTier::from_str(labels::tenant_tier_str(pod, namespace_tier_label));
        let is_gang = labels::is_gang(pod);
        let gang_name = labels::gang_name(pod).map(str::to_string);
        let gang_min_available = labels::gang_min_available(pod);

        let workload_type = classify_workload_type(pod, is_gang);

        let is_memory_intensive = pod
            .annotation(labels::ANNOTATION_MEMORY_INTENSIVE)
            .map(|v| v.eq_ignore_ascii_case("true"))
            .unwrap_or_else(|| heuristic_memory_intensive(pod));

        let explicit_preemptible = pod.annotation(labels::ANNOTATION_PREEMPTIBLE).and_then(|v| {
            if v.eq_ignore_ascii_case("true") {
                Some(true)
            } else if v.eq_ignore_ascii_case("false") {
                Some(false)
            } else {
                warn!(
                    "pod {}/{}: invalid {} annotation value {:?}, treating as absent",
                    pod.id.namespace, pod.id.name, labels::ANNOTATION_PREEMPTIBLE, v
                );
                None
            }
        });
        let is_preemptible = explicit_preemptible.unwrap_or_else(|| {
            workload_type == WorkloadType::Batch
                && pod.priority.unwrap_or(0) <= preemptible_priority_cutoff
        });

        Self {
            tenant_tier,
            workload_type,
            is_gang,
            gang_name,
            gang_min_available,
            is_preemptible,
            is_memory_intensive,
        }
    }
}

fn classify_workload_type(pod: &Pod, is_gang: bool) -> WorkloadType {
    if is_gang {
        return WorkloadType::Batch;
    }
    if BATCH_OPERATOR_LABELS.iter().any(|k| pod.labels.contains_key(*k)) {
        return if pod.gpu_count() > 0 {
            WorkloadType::Training
        } else {
            WorkloadType::Batch
        };
    }
    if pod
        .owner_references
        .iter()
        .any(|o| o.kind == "Job" || o.kind == "CronJob")
    {
        return WorkloadType::Batch;
    }
    if pod.has_readiness_probe() {
        return WorkloadType::Service;
    }
    WorkloadType::Service
}

/// Memory request > 16 GiB and memory-per-core > 4 GiB (§3 "isMemoryIntensive").
fn heuristic_memory_intensive(pod: &Pod) -> bool {
    const GIB: u64 = 1024 * 1024 * 1024;
    let total = pod.total_requests();
    if total.memory_bytes <= 16 * GIB {
        return false;
    }
    let cores = (total.cpu_millis as f64 / 1000.0).max(1.0);
    let mem_per_core = total.memory_bytes as f64 / cores;
    mem_per_core > 4.0 * GIB as f64
}

/// Read back the profile a prior Pre-Filter call wrote into `CycleState`.
pub fn get_profile(state: &CycleState) -> Option<&SchedulingProfile> {
    state.read(PROFILE_STATE_KEY)
}

pub struct ProfileClassifier {
    pub preemptible_priority_cutoff: i64,
}

impl Plugin for ProfileClassifier {
    fn name(&self) -> &str {
        "ProfileClassifier"
    }
}

impl PreFilterPlugin for ProfileClassifier {
    fn pre_filter(&self, state: &mut CycleState, pod: &Pod, _nodes: &[Node]) -> Status {
        let namespace_tier_label = pod.label(labels::TENANT_TIER_NS_LABEL);
        let profile = SchedulingProfile::classify(pod, namespace_tier_label, self.preemptible_priority_cutoff);
        state.write(PROFILE_STATE_KEY, profile);
        Status::success()
    }
}
