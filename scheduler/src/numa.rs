//! `NUMATopology` Filter/Score plugin (§4.4).
//!
//! Node NUMA layout is parsed straight out of node labels — there is no richer
//! topology object in `kubenexus-common` to read it from — tolerating missing or
//! malformed labels by falling back to a single whole-node domain, per §9's rule
//! that per-device attribute parsing must never abort on unexpected input.

use std::collections::HashMap;
use std::sync::Mutex;

use kubenexus_common::{Node, Pod};
use log::{trace, warn};

use crate::config::KubeNexusConfig;
use crate::cycle_state::CycleState;
use crate::labels;
use crate::plugin::{FilterPlugin, Plugin, ScorePlugin, Status};
use crate::profile::{self, WorkloadType};

const NODE_COUNT_LABEL: &str = "numa.kubenexus.io/node-count";
/// Score returned when no NUMA domain fits under a non-strict policy (§4.4.4).
const NO_FIT_FALLBACK_SCORE: i64 = 25;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NumaPolicy {
    SingleNumaNode,
    BestEffort,
    None,
}

impl NumaPolicy {
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "single-numa-node" => Some(NumaPolicy::SingleNumaNode),
            "best-effort" => Some(NumaPolicy::BestEffort),
            "none" => Some(NumaPolicy::None),
            _ => None,
        }
    }
}

/// Policy selection (§4.4.1): explicit annotation wins; otherwise derived from
/// workload type, with `defaultNumaPolicyForBatch` controlling the batch case.
pub fn policy_for(pod: &Pod, workload_type: WorkloadType, default_for_batch: &str) -> NumaPolicy {
    if let Some(v) = pod.annotation(labels::ANNOTATION_NUMA_POLICY) {
        if let Some(p) = NumaPolicy::from_str(v) {
            return p;
        }
        warn!(
            "pod {}/{}: invalid {} annotation value {:?}, deriving from workload type",
            pod.id.namespace, pod.id.name, labels::ANNOTATION_NUMA_POLICY, v
        );
    }
    match workload_type {
        WorkloadType::Batch => NumaPolicy::from_str(default_for_batch).unwrap_or(NumaPolicy::SingleNumaNode),
        WorkloadType::Service => NumaPolicy::None,
        WorkloadType::Training | WorkloadType::Inference => NumaPolicy::BestEffort,
    }
}

#[derive(Clone, Debug)]
pub struct NumaDomain {
    pub id: u32,
    pub cpu_cores: u64,
    pub memory_bytes: u64,
    pub bandwidth: Option<u64>,
    pub distances: HashMap<u32, u32>,
}

#[derive(Clone, Debug)]
pub struct NodeNumaLayout {
    pub domains: Vec<NumaDomain>,
}

impl NodeNumaLayout {
    fn single_domain(node: &Node) -> Self {
        Self {
            domains: vec![NumaDomain {
                id: 0,
                cpu_cores: node.allocatable.cpu_millis / 1000,
                memory_bytes: node.allocatable.memory_bytes,
                bandwidth: None,
                distances: HashMap::new(),
            }],
        }
    }

    pub fn fitting_domains(&self, cpu_cores: u64, memory_bytes: u64) -> Vec<&NumaDomain> {
        self.domains
            .iter()
            .filter(|d| d.cpu_cores >= cpu_cores && d.memory_bytes >= memory_bytes)
            .collect()
    }
}

/// CPU ranges like `"0-15,32-47"` into a CPU count.
fn parse_cpu_range_count(s: &str) -> Option<u64> {
    let mut total = 0u64;
    for part in s.split(',') {
        let part = part.trim();
        if part.is_empty() {
            return None;
        }
        if let Some((lo, hi)) = part.split_once('-') {
            let lo: u64 = lo.trim().parse().ok()?;
            let hi: u64 = hi.trim().parse().ok()?;
            if hi < lo {
                return None;
            }
            total += hi - lo + 1;
        } else {
            part.trim().parse::<u64>().ok()?;
            total += 1;
        }
    }
    Some(total)
}

/// Parse `node`'s NUMA layout (§4.4.2). Any missing or malformed label for any
/// domain falls back to treating the whole node as one domain.
pub fn parse_node_layout(node: &Node) -> NodeNumaLayout {
    let Some(count) = node.label(NODE_COUNT_LABEL).and_then(|v| v.parse::<u32>().ok()) else {
        return NodeNumaLayout::single_domain(node);
    };
    if count == 0 {
        return NodeNumaLayout::single_domain(node);
    }

    let mut domains = Vec::with_capacity(count as usize);
    for i in 0..count {
        let cpus_label = format!("numa.kubenexus.io/node-{i}-cpus");
        let memory_label = format!("numa.kubenexus.io/node-{i}-memory");
        let bandwidth_label = format!("numa.kubenexus.io/node-{i}-bandwidth");

        let Some(cpu_cores) = node.label(&cpus_label).and_then(parse_cpu_range_count) else {
            warn!("node {}: malformed or missing {cpus_label}, falling back to single NUMA domain", node.name);
            return NodeNumaLayout::single_domain(node);
        };
        let Some(memory_bytes) = node.label(&memory_label).map(kubenexus_common::quantity::parse_memory_bytes) else {
            warn!("node {}: malformed or missing {memory_label}, falling back to single NUMA domain", node.name);
            return NodeNumaLayout::single_domain(node);
        };
        let bandwidth = node.label(&bandwidth_label).map(kubenexus_common::quantity::parse_memory_bytes);

        let mut distances = HashMap::new();
        for j in 0..count {
            if j == i {
                continue;
            }
            let distance_label = format!("numa.kubenexus.io/node-{i}-distance-{j}");
            if let Some(d) = node.label(&distance_label).and_then(|v| v.parse::<u32>().ok()) {
                distances.insert(j, d);
            }
        }

        domains.push(NumaDomain { id: i, cpu_cores, memory_bytes, bandwidth, distances });
    }
    NodeNumaLayout { domains }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GangNumaSpread {
    Packed,
    Balanced,
    Isolated,
}

impl GangNumaSpread {
    fn from_pod(pod: &Pod) -> Self {
        match pod.annotation(labels::ANNOTATION_GANG_NUMA_SPREAD) {
            Some("balanced") => GangNumaSpread::Balanced,
            Some("isolated") => GangNumaSpread::Isolated,
            _ => GangNumaSpread::Packed,
        }
    }
}

/// `(namespace, gangName) -> (domainId -> siblingCount)`, written in Score and read
/// in Score for gang-affinity weighting (§4.4.4, §5). Guarded by a plain
/// `std::sync::Mutex` for the same reason `PodGroupRegistry` is (§5 "protected by a
/// sync-map or single lock", Score is a synchronous extension point).
#[derive(Default)]
pub struct GangNumaState {
    inner: Mutex<HashMap<(String, String), HashMap<u32, u32>>>,
}

impl GangNumaState {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn siblings_on(&self, key: &(String, String), domain_id: u32) -> u32 {
        self.inner
            .lock()
            .unwrap()
            .get(key)
            .and_then(|domains| domains.get(&domain_id))
            .copied()
            .unwrap_or(0)
    }

    pub(crate) fn record(&self, key: (String, String), domain_id: u32) {
        *self.inner.lock().unwrap().entry(key).or_default().entry(domain_id).or_insert(0) += 1;
    }

    /// Dropped once the gang completes or is unreserved (§5).
    pub fn clear(&self, key: &(String, String)) {
        self.inner.lock().unwrap().remove(key);
    }
}

fn gang_affinity_score(state: &GangNumaState, pod: &Pod, domain_id: u32) -> f64 {
    let Some(gang_name) = labels::gang_name(pod).filter(|_| labels::is_gang(pod)) else {
        return 50.0;
    };
    let key = (pod.id.namespace.clone(), gang_name.to_string());
    let siblings = state.siblings_on(&key, domain_id);
    match GangNumaSpread::from_pod(pod) {
        GangNumaSpread::Packed => if siblings > 0 { 100.0 } else { 20.0 },
        GangNumaSpread::Balanced => (100.0 - 20.0 * siblings as f64).max(0.0),
        GangNumaSpread::Isolated => if siblings > 0 { 0.0 } else { 100.0 },
    }
}

fn fit_score(domain: &NumaDomain, cpu_cores: u64, memory_bytes: u64, affinity: &[u32]) -> f64 {
    let cpu_util = (cpu_cores as f64 / domain.cpu_cores.max(1) as f64) * 100.0;
    let mem_util = (memory_bytes as f64 / domain.memory_bytes.max(1) as f64) * 100.0;
    let base = (100.0 - (0.6 * cpu_util + 0.4 * mem_util - 60.0).abs()).max(0.0);
    if affinity.contains(&domain.id) {
        (base * 1.2).min(100.0)
    } else {
        base
    }
}

fn bandwidth_score(domain: &NumaDomain, memory_bytes: u64, is_memory_intensive: bool) -> f64 {
    match (is_memory_intensive, domain.bandwidth) {
        (true, Some(_)) => {
            let mem_util = (memory_bytes as f64 / domain.memory_bytes.max(1) as f64) * 100.0;
            (100.0 - mem_util).max(0.0)
        }
        _ => 50.0,
    }
}

fn distance_score(domain: &NumaDomain, distance_weight: f64) -> f64 {
    if domain.distances.is_empty() {
        return 50.0;
    }
    let avg = domain.distances.values().copied().sum::<u32>() as f64 / domain.distances.len() as f64;
    100.0 - (avg - 10.0) * 5.0 * distance_weight
}

fn distance_weight(pod: &Pod) -> f64 {
    pod.annotation(labels::ANNOTATION_NUMA_DISTANCE_WEIGHT)
        .and_then(|v| v.parse::<f64>().ok())
        .map(|pct| (pct / 100.0).clamp(0.0, 1.0))
        .unwrap_or(1.0)
}

fn pod_cpu_cores(pod: &Pod) -> u64 {
    let millis = pod.total_requests().cpu_millis;
    millis.div_ceil(1000)
}

pub struct NumaTopology {
    pub gang_state: std::sync::Arc<GangNumaState>,
    pub config: std::sync::Arc<KubeNexusConfig>,
}

impl Plugin for NumaTopology {
    fn name(&self) -> &str {
        "NUMATopology"
    }
}

impl FilterPlugin for NumaTopology {
    fn filter(&self, state: &CycleState, pod: &Pod, node: &Node) -> Status {
        let Some(sched_profile) = profile::get_profile(state) else {
            return Status::error(crate::error::ScheduleError::InvariantViolation(
                "NUMATopology.filter ran before ProfileClassifier".to_string(),
            ));
        };
        let policy = policy_for(pod, sched_profile.workload_type, &self.config.default_numa_policy_for_batch);
        if policy != NumaPolicy::SingleNumaNode {
            return Status::success();
        }
        let cpu_cores = pod_cpu_cores(pod);
        let memory_bytes = pod.total_requests().memory_bytes;
        let layout = parse_node_layout(node);
        if layout.fitting_domains(cpu_cores, memory_bytes).is_empty() {
            return Status::unschedulable(format!(
                "pod requires {cpu_cores} CPUs and {} memory, but no single NUMA node has sufficient capacity",
                format_bytes_gib(memory_bytes)
            ));
        }
        Status::success()
    }
}

fn format_bytes_gib(bytes: u64) -> String {
    format!("{} GiB", bytes / (1024 * 1024 * 1024))
}

impl ScorePlugin for NumaTopology {
    fn score(&self, state: &mut CycleState, pod: &Pod, node: &Node) -> (i64, Status) {
        let Some(sched_profile) = profile::get_profile(state) else {
            return (
                0,
                Status::error(crate::error::ScheduleError::InvariantViolation(
                    "NUMATopology.score ran before ProfileClassifier".to_string(),
                )),
            );
        };
        let cpu_cores = pod_cpu_cores(pod);
        let memory_bytes = pod.total_requests().memory_bytes;
        let layout = parse_node_layout(node);

        let affinity = labels::parse_numa_id_list(pod.annotation(labels::ANNOTATION_NUMA_AFFINITY));
        let anti_affinity = labels::parse_numa_id_list(pod.annotation(labels::ANNOTATION_NUMA_ANTI_AFFINITY));
        let weights = &self.config.numa_scoring_weights;
        let dist_weight = distance_weight(pod);

        let mut best: Option<(u32, f64)> = None;
        for domain in layout.fitting_domains(cpu_cores, memory_bytes) {
            if anti_affinity.contains(&domain.id) {
                continue;
            }
            let fit = fit_score(domain, cpu_cores, memory_bytes, &affinity);
            let bandwidth = bandwidth_score(domain, memory_bytes, sched_profile.is_memory_intensive);
            let distance = distance_score(domain, dist_weight);
            let gang_affinity = gang_affinity_score(&self.gang_state, pod, domain.id);
            let weighted = fit * weights.fit
                + bandwidth * weights.bandwidth
                + distance * weights.distance
                + gang_affinity * weights.gang_affinity;
            trace!(
                "node {} domain {}: fit={fit:.1} bandwidth={bandwidth:.1} distance={distance:.1} gang={gang_affinity:.1} -> {weighted:.1}",
                node.name, domain.id
            );
            if best.as_ref().is_none_or(|(_, s)| weighted > *s) {
                best = Some((domain.id, weighted));
            }
        }

        let Some((domain_id, weighted)) = best else {
            return (NO_FIT_FALLBACK_SCORE, Status::success());
        };

        if labels::is_gang(pod) {
            let key = labels::gang_key(pod);
            self.gang_state.record(key, domain_id);
        }

        (weighted.round().clamp(0.0, 100.0) as i64, Status::success())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap as Map;
    use std::sync::Arc;

    use kubenexus_common::{ContainerSpec, PodId, ResourceList};

    use super::*;
    use crate::profile::ProfileClassifier;

    fn node_with_two_domains() -> Node {
        Node {
            name: "n1".to_string(),
            labels: Map::from([
                (NODE_COUNT_LABEL.to_string(), "2".to_string()),
                ("numa.kubenexus.io/node-0-cpus".to_string(), "0-15".to_string()),
                ("numa.kubenexus.io/node-0-memory".to_string(), "64Gi".to_string()),
                ("numa.kubenexus.io/node-1-cpus".to_string(), "16-31".to_string()),
                ("numa.kubenexus.io/node-1-memory".to_string(), "64Gi".to_string()),
            ]),
            allocatable: ResourceList { cpu_millis: 32000, memory_bytes: 128 * 1024 * 1024 * 1024, extra: Map::new() },
        }
    }

    fn pod_requesting(cpu_millis: u64, memory_bytes: u64) -> Pod {
        Pod {
            id: PodId::new("ns", "p", "uid"),
            containers: vec![ContainerSpec {
                name: "c".to_string(),
                requests: ResourceList { cpu_millis, memory_bytes, extra: Map::new() },
                ..Default::default()
            }],
            ..Default::default()
        }
    }

    fn with_profile(pod: &Pod) -> CycleState {
        let classifier = ProfileClassifier { preemptible_priority_cutoff: i64::MAX };
        let mut state = CycleState::new();
        crate::plugin::PreFilterPlugin::pre_filter(&classifier, &mut state, pod, &[]);
        state
    }

    #[test]
    fn cpu_range_count_handles_multiple_ranges() {
        assert_eq!(parse_cpu_range_count("0-15,32-47"), Some(32));
        assert_eq!(parse_cpu_range_count("0"), Some(1));
        assert_eq!(parse_cpu_range_count("bogus"), None);
    }

    #[test]
    fn missing_layout_falls_back_to_single_domain() {
        let node = Node {
            name: "n".to_string(),
            allocatable: ResourceList { cpu_millis: 8000, memory_bytes: 16 * 1024 * 1024 * 1024, extra: Map::new() },
            ..Default::default()
        };
        let layout = parse_node_layout(&node);
        assert_eq!(layout.domains.len(), 1);
        assert_eq!(layout.domains[0].cpu_cores, 8);
    }

    #[test]
    fn filter_rejects_oversize_pod_under_single_numa_node() {
        let numa = NumaTopology {
            gang_state: Arc::new(GangNumaState::new()),
            config: Arc::new(KubeNexusConfig::default()),
        };
        let node = node_with_two_domains();
        let mut pod = pod_requesting(20_000, 80 * 1024 * 1024 * 1024);
        pod.annotations.insert(labels::ANNOTATION_NUMA_POLICY.to_string(), "single-numa-node".to_string());
        let state = with_profile(&pod);
        let status = numa.filter(&state, &pod, &node);
        assert!(!status.is_success());
        assert!(status.reasons[0].contains("20 CPUs"));
    }

    #[test]
    fn best_effort_admits_oversize_pod_with_fallback_score() {
        let numa = NumaTopology {
            gang_state: Arc::new(GangNumaState::new()),
            config: Arc::new(KubeNexusConfig::default()),
        };
        let node = node_with_two_domains();
        let mut pod = pod_requesting(20_000, 80 * 1024 * 1024 * 1024);
        pod.annotations.insert(labels::ANNOTATION_NUMA_POLICY.to_string(), "best-effort".to_string());
        let mut state = with_profile(&pod);
        assert!(numa.filter(&state, &pod, &node).is_success());
        let (score, status) = numa.score(&mut state, &pod, &node);
        assert!(status.is_success());
        assert_eq!(score, NO_FIT_FALLBACK_SCORE);
    }

    #[test]
    fn gang_affinity_packed_prefers_domain_with_siblings() {
        let gang_state = Arc::new(GangNumaState::new());
        let numa = NumaTopology { gang_state: gang_state.clone(), config: Arc::new(KubeNexusConfig::default()) };
        let node = node_with_two_domains();

        let mut sibling = pod_requesting(4000, 8 * 1024 * 1024 * 1024);
        sibling.labels.insert(labels::GANG_NAME_KEY.to_string(), "g".to_string());
        sibling.labels.insert(labels::GANG_MIN_AVAILABLE_KEY.to_string(), "2".to_string());
        let mut sibling_state = with_profile(&sibling);
        numa.score(&mut sibling_state, &sibling, &node);

        assert_eq!(gang_state.siblings_on(&("ns".to_string(), "g".to_string()), 0), 1);
    }
}
