//! Pod, Node and ResourceSlice wire definitions.
//!
//! These mirror the subset of the Kubernetes API surface the KubeNexus scheduling
//! core reads. They are intentionally read-only, plain-data mirrors of externally
//! owned objects (§3 of the design): the scheduler never constructs a `Pod` or `Node`
//! for submission back to the cluster, it only observes them.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

pub mod quantity;

/// Opaque identity of a pod: `(namespace, name, uid)`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct PodId {
    pub namespace: String,
    pub name: String,
    pub uid: String,
}

impl PodId {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>, uid: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            uid: uid.into(),
        }
    }
}

/// CPU (millicores) and memory (bytes) resource vector, plus a catch-all for
/// extended resources such as `nvidia.com/gpu`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ResourceList {
    pub cpu_millis: u64,
    pub memory_bytes: u64,
    pub extra: HashMap<String, u64>,
}

impl ResourceList {
    pub fn extended(&self, name: &str) -> u64 {
        self.extra.get(name).copied().unwrap_or(0)
    }

    pub fn add(&mut self, other: &ResourceList) {
        self.cpu_millis += other.cpu_millis;
        self.memory_bytes += other.memory_bytes;
        for (k, v) in &other.extra {
            *self.extra.entry(k.clone()).or_insert(0) += v;
        }
    }
}

impl std::ops::Add for ResourceList {
    type Output = ResourceList;
    fn add(mut self, rhs: ResourceList) -> ResourceList {
        self.add(&rhs);
        self
    }
}

pub const GPU_RESOURCE_NAME: &str = "nvidia.com/gpu";

/// Resource requests/limits for a single container, plus the handful of shape hints
/// (readiness probe, opaque device claim name) the profile classifier and VRAM
/// scorer read.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContainerSpec {
    pub name: String,
    pub requests: ResourceList,
    pub limits: ResourceList,
    pub has_readiness_probe: bool,
    pub device_claim_name: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OwnerReference {
    pub kind: String,
    pub name: String,
    pub controller: bool,
}

/// A pod as observed by the scheduler: labels/annotations, per-container resource
/// requests, optional priority, and owner references. Mirrors the fields kube-scheduler
/// plugins actually read off `v1.Pod`; it carries nothing about scheduling status,
/// which lives in the core's own `SchedulingProfile`/`PodGroupInfo`/`Reservation` types.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Pod {
    pub id: PodId,
    pub labels: HashMap<String, String>,
    pub annotations: HashMap<String, String>,
    pub containers: Vec<ContainerSpec>,
    pub priority: Option<i64>,
    pub owner_references: Vec<OwnerReference>,
    pub creation_timestamp: chrono::DateTime<chrono::Utc>,
}

impl Pod {
    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels.get(key).map(String::as_str)
    }

    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.annotations.get(key).map(String::as_str)
    }

    /// Sum of every container's resource requests (init containers are not modeled
    /// here: the profile classifier only needs steady-state totals).
    pub fn total_requests(&self) -> ResourceList {
        let mut total = ResourceList::default();
        for c in &self.containers {
            total.add(&c.requests);
        }
        total
    }

    pub fn gpu_count(&self) -> u64 {
        self.total_requests().extended(GPU_RESOURCE_NAME)
    }

    pub fn has_readiness_probe(&self) -> bool {
        self.containers.iter().any(|c| c.has_readiness_probe)
    }
}

/// A node as observed by the scheduler: labels (including NUMA/GPU/tenant-tier
/// hints, §6) and its allocatable resource vector.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Node {
    pub name: String,
    pub labels: HashMap<String, String>,
    pub allocatable: ResourceList,
}

impl Node {
    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels.get(key).map(String::as_str)
    }
}

/// Sum-type attribute value for a `ResourceSlice` device, per §9: parsing must
/// tolerate unknown keys and wrong types without aborting.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttributeValue {
    Int(i64),
    Str(String),
    Bool(bool),
}

impl AttributeValue {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            AttributeValue::Int(v) => Some(*v),
            AttributeValue::Str(s) => s.parse().ok(),
            AttributeValue::Bool(_) => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            AttributeValue::Str(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            AttributeValue::Bool(b) => Some(*b),
            AttributeValue::Str(s) => s.parse().ok(),
            AttributeValue::Int(_) => None,
        }
    }
}

/// One device exposed by a driver's `ResourceSlice` on a node: a stable name, a typed
/// capacity map (e.g. `memory` in bytes), and an attribute map (`numa-node`,
/// `nvlink-peers`, `nvlink-domain`, `pcie-switch`, `pcie-bus-id`, `model`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Device {
    pub name: String,
    pub capacity: HashMap<String, u64>,
    pub attributes: HashMap<String, AttributeValue>,
}

impl Device {
    pub fn attribute(&self, key: &str) -> Option<&AttributeValue> {
        self.attributes.get(key)
    }
}

/// `(nodeName, driver, devices[])` — one per device-driver per node, per §3.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResourceSlice {
    pub node_name: String,
    pub driver: String,
    pub devices: Vec<Device>,
}

/// Known GPU-device driver prefixes, used to filter `ResourceSlice`s by §6
/// "Filter slices by driver prefix match".
pub const GPU_DRIVER_PREFIXES: &[&str] = &["nvidia.", "amd.", "intel.", "gpu."];

pub fn is_gpu_driver(driver: &str) -> bool {
    GPU_DRIVER_PREFIXES.iter().any(|p| driver.starts_with(p))
}
