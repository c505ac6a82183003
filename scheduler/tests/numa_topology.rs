//! NUMA-aware filter/score scenarios (spec §8 S4).

use std::collections::HashMap;
use std::sync::Arc;

use kubenexus_common::{ContainerSpec, Node, Pod, PodId, ResourceList};
use kubenexus_scheduler::config::KubeNexusConfig;
use kubenexus_scheduler::cycle_state::CycleState;
use kubenexus_scheduler::numa::{GangNumaState, NumaTopology};
use kubenexus_scheduler::plugin::{FilterPlugin, PreFilterPlugin, ScorePlugin};
use kubenexus_scheduler::profile::ProfileClassifier;

fn two_domain_node() -> Node {
    Node {
        name: "n1".to_string(),
        labels: HashMap::from([
            ("numa.kubenexus.io/node-count".to_string(), "2".to_string()),
            ("numa.kubenexus.io/node-0-cpus".to_string(), "0-15".to_string()),
            ("numa.kubenexus.io/node-0-memory".to_string(), "64Gi".to_string()),
            ("numa.kubenexus.io/node-1-cpus".to_string(), "16-31".to_string()),
            ("numa.kubenexus.io/node-1-memory".to_string(), "64Gi".to_string()),
        ]),
        allocatable: ResourceList { cpu_millis: 32_000, memory_bytes: 128 * 1024 * 1024 * 1024, extra: HashMap::new() },
    }
}

fn oversize_pod(policy: &str) -> Pod {
    Pod {
        id: PodId::new("ns", "p", "uid"),
        annotations: HashMap::from([("scheduling.kubenexus.io/numa-policy".to_string(), policy.to_string())]),
        containers: vec![ContainerSpec {
            name: "c".to_string(),
            requests: ResourceList { cpu_millis: 20_000, memory_bytes: 80 * 1024 * 1024 * 1024, extra: HashMap::new() },
            ..Default::default()
        }],
        ..Default::default()
    }
}

fn with_profile(pod: &Pod) -> CycleState {
    let classifier = ProfileClassifier { preemptible_priority_cutoff: i64::MAX };
    let mut state = CycleState::new();
    classifier.pre_filter(&mut state, pod, &[]);
    state
}

fn numa() -> NumaTopology {
    NumaTopology { gang_state: Arc::new(GangNumaState::new()), config: Arc::new(KubeNexusConfig::default()) }
}

/// S4: a pod needing 20 CPU / 80 GiB is rejected under `single-numa-node` (no
/// single domain fits), but admitted under `best-effort` with the neutral
/// no-fit fallback score of 25.
#[tokio::test]
async fn single_numa_node_rejects_oversize_pod_best_effort_admits_with_fallback() {
    let topology = numa();
    let node = two_domain_node();

    let strict_pod = oversize_pod("single-numa-node");
    let strict_state = with_profile(&strict_pod);
    let status = topology.filter(&strict_state, &strict_pod, &node);
    assert!(!status.is_success());
    assert_eq!(
        status.reasons[0],
        "pod requires 20 CPUs and 80 GiB memory, but no single NUMA node has sufficient capacity"
    );

    let relaxed_pod = oversize_pod("best-effort");
    let mut relaxed_state = with_profile(&relaxed_pod);
    assert!(topology.filter(&relaxed_state, &relaxed_pod, &node).is_success());
    let (score, status) = topology.score(&mut relaxed_state, &relaxed_pod, &node);
    assert!(status.is_success());
    assert_eq!(score, 25);
}
