//! Tunables for the KubeNexus core (§6 "Tunables").
//!
//! A single `KubeNexusConfig` is built once at scheduler startup (typically from a
//! YAML scheduler-configuration fragment via `serde_yaml`) and shared read-only
//! across every plugin instance. Nothing here is mutated after construction.

use std::collections::HashMap;
use std::time::Duration;

use serde::Deserialize;

/// Per-model VRAM fallback table (§4.3.1), keyed by the exact node-label / annotation
/// model string. Capacities are in bytes.
pub fn default_gpu_model_vram_table() -> HashMap<String, u64> {
    const GIB: u64 = 1024 * 1024 * 1024;
    [
        ("H200", 141 * GIB),
        ("H100", 80 * GIB),
        ("A100-80GB", 80 * GIB),
        ("A100", 40 * GIB),
        ("L40S", 48 * GIB),
        ("L40", 48 * GIB),
        ("A40", 48 * GIB),
        ("L4", 24 * GIB),
        ("T4", 16 * GIB),
        ("V100", 32 * GIB),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v))
    .collect()
}

/// High-end GPU models eligible for the +10 score bonus (§4.3.3).
pub const HIGH_END_GPU_MODELS: &[&str] = &["H100", "H200", "A100-80GB", "MI300"];

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NumaScoringWeights {
    pub fit: f64,
    pub bandwidth: f64,
    pub distance: f64,
    pub gang_affinity: f64,
}

impl Default for NumaScoringWeights {
    fn default() -> Self {
        Self {
            fit: 0.40,
            bandwidth: 0.25,
            distance: 0.20,
            gang_affinity: 0.15,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct KubeNexusConfig {
    #[serde(with = "duration_secs")]
    pub permit_waiting_time: Duration,
    #[serde(with = "duration_secs")]
    pub starvation_threshold: Duration,
    pub tier_weights: HashMap<String, u32>,
    pub numa_scoring_weights: NumaScoringWeights,
    pub default_numa_policy_for_batch: String,
    pub gpu_model_vram_table: HashMap<String, u64>,
    pub preemption_priority_cutoff: i64,
}

impl Default for KubeNexusConfig {
    fn default() -> Self {
        Self {
            permit_waiting_time: Duration::from_secs(10),
            starvation_threshold: Duration::from_secs(60),
            tier_weights: [("gold", 3u32), ("silver", 2), ("bronze", 1)]
                .into_iter()
                .map(|(k, v)| (k.to_string(), v))
                .collect(),
            numa_scoring_weights: NumaScoringWeights::default(),
            default_numa_policy_for_batch: "single-numa-node".to_string(),
            gpu_model_vram_table: default_gpu_model_vram_table(),
            preemption_priority_cutoff: i64::MAX,
        }
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let cfg = KubeNexusConfig::default();
        assert_eq!(cfg.permit_waiting_time, Duration::from_secs(10));
        assert_eq!(cfg.starvation_threshold, Duration::from_secs(60));
        assert_eq!(cfg.tier_weights.get("gold"), Some(&3));
        assert_eq!(
            cfg.gpu_model_vram_table.get("H100"),
            Some(&(80 * 1024 * 1024 * 1024))
        );
    }

    #[test]
    fn numa_weights_sum_to_one() {
        let w = NumaScoringWeights::default();
        let sum = w.fit + w.bandwidth + w.distance + w.gang_affinity;
        assert!((sum - 1.0).abs() < 1e-9);
    }
}
