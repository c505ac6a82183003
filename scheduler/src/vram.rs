//! `VRAMScheduler` Filter/Score plugin (§4.3).
//!
//! Per-GPU VRAM capacity is read from the node's `ResourceSlice`s when available
//! (§6 "Filter slices by driver prefix match"), falling back to the
//! `gpu.kubenexus.io/{model,vram,count}` node labels when no slice data is present —
//! the same preferred-source-then-label-fallback shape the teacher's
//! `node_resources_fit` plugin uses for allocatable resources.

use std::collections::HashMap;
use std::sync::Arc;

use kubenexus_common::{AttributeValue, Device, Node, Pod, ResourceSlice, GPU_RESOURCE_NAME};
use log::trace;

use crate::config::{KubeNexusConfig, HIGH_END_GPU_MODELS};
use crate::cycle_state::CycleState;
use crate::labels;
use crate::plugin::{FilterPlugin, Plugin, ScorePlugin, Status};
use crate::profile;

const GIB: f64 = 1024.0 * 1024.0 * 1024.0;

/// One GPU as seen by the scorer, derived either from a `ResourceSlice` device or
/// synthesized from node labels (§4.3.1).
#[derive(Debug, Clone, Default)]
pub struct GpuDevice {
    pub vram_bytes: u64,
    pub model: Option<String>,
    pub numa_node: Option<i64>,
    pub nvlink_domain: Option<i64>,
    pub nvlink_peer_count: usize,
    pub pcie_switch: Option<String>,
}

/// Supplies the `ResourceSlice`s a node currently advertises. Out of scope for this
/// core to own the informer cache that backs it (§5 "informer callbacks").
pub trait ResourceSliceLister: Send + Sync {
    fn slices_for_node(&self, node_name: &str) -> Vec<ResourceSlice>;
}

pub type SharedResourceSliceLister = Arc<dyn ResourceSliceLister>;

fn device_vram(device: &Device, vram_table: &HashMap<String, u64>) -> u64 {
    if let Some(bytes) = device.capacity.get("memory") {
        return *bytes;
    }
    device
        .attribute("model")
        .and_then(AttributeValue::as_str)
        .and_then(|model| vram_table.get(model))
        .copied()
        .unwrap_or(0)
}

fn gpu_device_from_slice(device: &Device, vram_table: &HashMap<String, u64>) -> GpuDevice {
    GpuDevice {
        vram_bytes: device_vram(device, vram_table),
        model: device.attribute("model").and_then(AttributeValue::as_str).map(str::to_string),
        numa_node: device.attribute("numa-node").and_then(AttributeValue::as_int),
        nvlink_domain: device.attribute("nvlink-domain").and_then(AttributeValue::as_int),
        nvlink_peer_count: device
            .attribute("nvlink-peers")
            .and_then(AttributeValue::as_str)
            .map(|v| v.split(',').filter(|s| !s.trim().is_empty()).count())
            .unwrap_or(0),
        pcie_switch: device.attribute("pcie-switch").and_then(AttributeValue::as_str).map(str::to_string),
    }
}

/// Derive the node's GPU inventory, preferring resource-slice data over node labels.
pub fn gpu_devices_for_node(
    node: &Node,
    slices: &[ResourceSlice],
    vram_table: &HashMap<String, u64>,
) -> Vec<GpuDevice> {
    let from_slices: Vec<GpuDevice> = slices
        .iter()
        .filter(|s| s.node_name == node.name && kubenexus_common::is_gpu_driver(&s.driver))
        .flat_map(|s| s.devices.iter())
        .map(|d| gpu_device_from_slice(d, vram_table))
        .collect();
    if !from_slices.is_empty() {
        return from_slices;
    }

    let model = node.label("gpu.kubenexus.io/model");
    let count: usize = node
        .label("gpu.kubenexus.io/count")
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);
    if count == 0 {
        return Vec::new();
    }
    let vram_bytes = node
        .label("gpu.kubenexus.io/vram")
        .map(kubenexus_common::quantity::parse_memory_bytes)
        .or_else(|| model.and_then(|m| vram_table.get(m).copied()))
        .unwrap_or(0);
    (0..count)
        .map(|_| GpuDevice {
            vram_bytes,
            model: model.map(str::to_string),
            ..Default::default()
        })
        .collect()
}

/// Explicit `vram-request` annotation, else inferred from the device-claim name
/// against the model table (§4.3.1, §9 "fixed to a single resource quantity").
pub fn need_per_gpu_vram(pod: &Pod, vram_table: &HashMap<String, u64>) -> u64 {
    if let Some(v) = pod.annotation(labels::ANNOTATION_VRAM_REQUEST) {
        return kubenexus_common::quantity::parse_memory_bytes(v);
    }
    let claim_name = pod.containers.iter().find_map(|c| c.device_claim_name.as_deref());
    let Some(claim_name) = claim_name else {
        return 0;
    };
    vram_table
        .iter()
        .find(|(model, _)| claim_name.contains(model.as_str()))
        .map(|(_, bytes)| *bytes)
        .unwrap_or(0)
}

fn format_gib(bytes: u64) -> String {
    format!("{:.0} GiB", bytes as f64 / GIB)
}

/// Count of devices sharing the most populous value of a key, used for every
/// topology-bonus check (§4.3.3).
fn max_shared<T: Eq + std::hash::Hash + Clone>(devices: &[GpuDevice], key: impl Fn(&GpuDevice) -> Option<T>) -> usize {
    let mut counts: HashMap<T, usize> = HashMap::new();
    for d in devices {
        if let Some(k) = key(d) {
            *counts.entry(k).or_insert(0) += 1;
        }
    }
    counts.into_values().max().unwrap_or(0)
}

pub struct VramScheduler {
    pub slices: SharedResourceSliceLister,
    pub config: Arc<KubeNexusConfig>,
}

impl Plugin for VramScheduler {
    fn name(&self) -> &str {
        "VRAMScheduler"
    }
}

impl FilterPlugin for VramScheduler {
    fn filter(&self, _state: &CycleState, pod: &Pod, node: &Node) -> Status {
        let gpus_requested = pod.gpu_count();
        if gpus_requested == 0 {
            return Status::success();
        }
        let slices = self.slices.slices_for_node(&node.name);
        let devices = gpu_devices_for_node(node, &slices, &self.config.gpu_model_vram_table);
        trace!("node {}: {} GPU(s), pod requests {gpus_requested}", node.name, devices.len());
        if (devices.len() as u64) < gpus_requested {
            return Status::unschedulable(format!(
                "node has {} GPUs, pod requests {gpus_requested}",
                devices.len()
            ));
        }
        let need = need_per_gpu_vram(pod, &self.config.gpu_model_vram_table);
        if need > 0 {
            let eligible = devices.iter().filter(|d| d.vram_bytes >= need).count() as u64;
            if eligible < gpus_requested {
                return Status::unschedulable(format!("no GPU has \u{2265} {} VRAM", format_gib(need)));
            }
        }
        Status::success()
    }
}

impl ScorePlugin for VramScheduler {
    fn score(&self, state: &mut CycleState, pod: &Pod, node: &Node) -> (i64, Status) {
        let gpus_requested = pod.gpu_count();
        if gpus_requested == 0 {
            return (0, Status::success());
        }
        let Some(sched_profile) = profile::get_profile(state) else {
            return (
                0,
                Status::error(crate::error::ScheduleError::InvariantViolation(
                    "VRAMScheduler.score ran before ProfileClassifier".to_string(),
                )),
            );
        };

        let slices = self.slices.slices_for_node(&node.name);
        let devices = gpu_devices_for_node(node, &slices, &self.config.gpu_model_vram_table);
        let need = need_per_gpu_vram(pod, &self.config.gpu_model_vram_table);
        let eligible: Vec<&GpuDevice> = devices.iter().filter(|d| d.vram_bytes >= need).collect();
        let max_vram = devices.iter().map(|d| d.vram_bytes).max().unwrap_or(0).max(1);
        let utilization = need as f64 / max_vram as f64;

        let tier = sched_profile.tenant_tier;
        let mut score = utilization_bucket_score(utilization, tier);

        if eligible.iter().any(|d| {
            d.model
                .as_deref()
                .is_some_and(|m| HIGH_END_GPU_MODELS.contains(&m))
        }) {
            score += 10;
        }

        if gpus_requested > 1 {
            let gpus_requested = gpus_requested as usize;
            if max_shared(&devices, |d| d.numa_node) >= gpus_requested {
                score += 15;
            }
            let shared_nvlink = max_shared(&devices, |d| d.nvlink_domain) >= gpus_requested;
            let nvlink_peer_fallback = devices.iter().any(|d| d.nvlink_peer_count >= gpus_requested - 1);
            if shared_nvlink || nvlink_peer_fallback {
                score += 25;
            }
            if max_shared(&devices, |d| d.pcie_switch.clone()) >= gpus_requested {
                score += 10;
            }
        }

        let clamped = score.clamp(0, 100);
        trace!("node {}: utilization {utilization:.2}, score {clamped}", node.name);
        (clamped, Status::success())
    }
}

fn utilization_bucket_score(utilization: f64, tier: profile::TenantTier) -> i64 {
    use profile::TenantTier::*;
    if utilization >= 0.95 {
        100
    } else if utilization >= 0.70 {
        match tier {
            Gold => 80,
            Silver => 85,
            Bronze => 90,
        }
    } else if utilization >= 0.50 {
        match tier {
            Gold => 50,
            Silver => 60,
            Bronze => 70,
        }
    } else if utilization >= 0.30 {
        match tier {
            Gold => 20,
            Silver => 30,
            Bronze => 40,
        }
    } else {
        match tier {
            Gold | Silver => 0,
            Bronze => 10,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap as Map;

    use kubenexus_common::{ContainerSpec, PodId, ResourceList};

    use super::*;
    use crate::profile::ProfileClassifier;

    struct FakeSlices(Vec<ResourceSlice>);
    impl ResourceSliceLister for FakeSlices {
        fn slices_for_node(&self, node_name: &str) -> Vec<ResourceSlice> {
            self.0.iter().filter(|s| s.node_name == node_name).cloned().collect()
        }
    }

    fn gpu_pod(count: u64, vram_request: Option<&str>) -> Pod {
        let mut pod = Pod {
            id: PodId::new("ns", "p", "uid"),
            containers: vec![ContainerSpec {
                name: "c".to_string(),
                requests: ResourceList {
                    extra: Map::from([(GPU_RESOURCE_NAME.to_string(), count)]),
                    ..Default::default()
                },
                ..Default::default()
            }],
            ..Default::default()
        };
        if let Some(v) = vram_request {
            pod.annotations.insert(labels::ANNOTATION_VRAM_REQUEST.to_string(), v.to_string());
        }
        pod
    }

    fn node_with_gpus(name: &str, devices: Vec<Device>) -> (Node, ResourceSlice) {
        (
            Node { name: name.to_string(), ..Default::default() },
            ResourceSlice { node_name: name.to_string(), driver: "nvidia.com".to_string(), devices },
        )
    }

    fn h100_device(numa: i64, nvlink_domain: i64, pcie: &str) -> Device {
        Device {
            name: "gpu0".to_string(),
            capacity: Map::from([("memory".to_string(), 80u64 * 1024 * 1024 * 1024)]),
            attributes: Map::from([
                ("model".to_string(), AttributeValue::Str("H100".to_string())),
                ("numa-node".to_string(), AttributeValue::Int(numa)),
                ("nvlink-domain".to_string(), AttributeValue::Int(nvlink_domain)),
                ("pcie-switch".to_string(), AttributeValue::Str(pcie.to_string())),
            ]),
        }
    }

    fn with_profile(pod: &Pod) -> CycleState {
        let classifier = ProfileClassifier { preemptible_priority_cutoff: i64::MAX };
        let mut state = CycleState::new();
        crate::plugin::PreFilterPlugin::pre_filter(&classifier, &mut state, pod, &[]);
        state
    }

    #[test]
    fn filter_admits_only_sufficient_vram_node() {
        let (h100_node, h100_slice) = node_with_gpus("h100", vec![h100_device(0, 0, "s0"); 8]);
        let (t4_node, t4_slice) = node_with_gpus(
            "t4",
            vec![Device {
                name: "gpu0".to_string(),
                capacity: Map::from([("memory".to_string(), 16u64 * 1024 * 1024 * 1024)]),
                attributes: Map::new(),
            }; 4],
        );
        let scheduler = VramScheduler {
            slices: Arc::new(FakeSlices(vec![h100_slice, t4_slice])),
            config: Arc::new(KubeNexusConfig::default()),
        };
        let pod = gpu_pod(1, Some("80Gi"));
        let state = CycleState::new();

        assert!(scheduler.filter(&state, &pod, &h100_node).is_success());
        assert!(!scheduler.filter(&state, &pod, &t4_node).is_success());
    }

    #[test]
    fn score_caps_at_100_with_perfect_fit_and_high_end_bonus() {
        let (node, slice) = node_with_gpus("h100", vec![h100_device(0, 0, "s0")]);
        let scheduler = VramScheduler {
            slices: Arc::new(FakeSlices(vec![slice])),
            config: Arc::new(KubeNexusConfig::default()),
        };
        let pod = gpu_pod(1, Some("80Gi"));
        let mut state = with_profile(&pod);
        let (score, status) = scheduler.score(&mut state, &pod, &node);
        assert!(status.is_success());
        assert_eq!(score, 100);
    }

    #[test]
    fn multi_gpu_topology_bonus_favors_colocated_node() {
        let (node_a, slice_a) = node_with_gpus("a", vec![h100_device(0, 0, "s0"); 8]);
        let mut scattered = Vec::new();
        for i in 0..8 {
            scattered.push(Device {
                name: format!("gpu{i}"),
                capacity: Map::from([("memory".to_string(), 80u64 * 1024 * 1024 * 1024)]),
                attributes: Map::from([("model".to_string(), AttributeValue::Str("H100".to_string()))]),
            });
        }
        let (node_b, slice_b) = node_with_gpus("b", scattered);
        let scheduler = VramScheduler {
            slices: Arc::new(FakeSlices(vec![slice_a, slice_b])),
            config: Arc::new(KubeNexusConfig::default()),
        };
        // 48Gi against an 80Gi device holds utilization at exactly 0.60, leaving
        // enough headroom below the clamp that the topology bonus (not the
        // high-end-model bonus, which applies to both nodes alike) is what
        // separates the two scores.
        let pod = gpu_pod(4, Some("48Gi"));
        let mut state_a = with_profile(&pod);
        let mut state_b = with_profile(&pod);
        let (score_a, _) = scheduler.score(&mut state_a, &pod, &node_a);
        let (score_b, _) = scheduler.score(&mut state_b, &pod, &node_b);
        assert_eq!(score_a, 100);
        assert_eq!(score_b, 80);
        assert!(score_a > score_b);
    }

    #[test]
    fn zero_gpu_request_always_succeeds() {
        let (node, _slice) = node_with_gpus("n", vec![]);
        let scheduler = VramScheduler {
            slices: Arc::new(FakeSlices(vec![])),
            config: Arc::new(KubeNexusConfig::default()),
        };
        let pod = gpu_pod(0, None);
        let state = CycleState::new();
        assert!(scheduler.filter(&state, &pod, &node).is_success());
    }
}
