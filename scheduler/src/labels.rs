//! Shared label/annotation parsing helpers (§2 "Shared helpers", ~11% of core).
//!
//! Every other module reads pod-group identity and tenant tier through these
//! functions rather than indexing `pod.labels`/`pod.annotations` directly, so the
//! new-key-then-legacy-key fallback rule (§9 Open Questions) is applied uniformly.

use kubenexus_common::Pod;

pub const GANG_NAME_KEY: &str = "pod-group.scheduling.kubenexus.io/name";
pub const GANG_MIN_AVAILABLE_KEY: &str = "pod-group.scheduling.kubenexus.io/min-available";
pub const GANG_NAME_KEY_LEGACY: &str = "pod-group.scheduling.sigs.k8s.io/name";
pub const GANG_MIN_AVAILABLE_KEY_LEGACY: &str = "pod-group.scheduling.sigs.k8s.io/min-member";

pub const TENANT_TIER_NS_LABEL: &str = "tenant.kubenexus.io/tier";
pub const QUEUE_NAME_LABEL: &str = "kueue.x-k8s.io/queue-name";

pub const ANNOTATION_PREEMPTIBLE: &str = "scheduling.kubenexus.io/preemptible";
pub const ANNOTATION_MEMORY_INTENSIVE: &str = "scheduling.kubenexus.io/memory-intensive";
pub const ANNOTATION_VRAM_REQUEST: &str = "scheduling.kubenexus.io/vram-request";
pub const ANNOTATION_NUMA_POLICY: &str = "scheduling.kubenexus.io/numa-policy";
pub const ANNOTATION_NUMA_AFFINITY: &str = "scheduling.kubenexus.io/numa-affinity-node-id";
pub const ANNOTATION_NUMA_ANTI_AFFINITY: &str = "scheduling.kubenexus.io/numa-anti-affinity-node-id";
pub const ANNOTATION_NUMA_DISTANCE_WEIGHT: &str = "scheduling.kubenexus.io/numa-distance-weight";
pub const ANNOTATION_GANG_NUMA_SPREAD: &str = "scheduling.kubenexus.io/gang-numa-spread";

/// Read a label under the new key, falling back to the legacy key. Per §9, never mix
/// keys within a single logical read: if the new key is present (even if empty/invalid)
/// it wins outright.
pub fn label_new_then_legacy<'a>(pod: &'a Pod, new_key: &str, legacy_key: &str) -> Option<&'a str> {
    pod.label(new_key).or_else(|| pod.label(legacy_key))
}

/// The gang name, if any, applying the new-key-then-legacy-key rule.
pub fn gang_name(pod: &Pod) -> Option<&str> {
    label_new_then_legacy(pod, GANG_NAME_KEY, GANG_NAME_KEY_LEGACY).filter(|s| !s.is_empty())
}

/// The gang's minimum-available quorum, if the label is present and parses to a
/// positive integer. Malformed values are logged by the caller and treated as absent
/// (§4.1 "Failure").
pub fn gang_min_available(pod: &Pod) -> Option<u32> {
    label_new_then_legacy(pod, GANG_MIN_AVAILABLE_KEY, GANG_MIN_AVAILABLE_KEY_LEGACY)
        .and_then(|v| v.parse::<u32>().ok())
}

/// `true` iff both a non-empty gang name and a `minAvailable > 1` are present (§4.1).
pub fn is_gang(pod: &Pod) -> bool {
    gang_name(pod).is_some() && gang_min_available(pod).is_some_and(|m| m > 1)
}

/// `(namespace, gangName)` key used throughout the gang/reservation/NUMA stores.
/// Non-gang pods fall back to `(namespace, podName)` per §4.2.1.
pub fn gang_key(pod: &Pod) -> (String, String) {
    let name = gang_name(pod)
        .map(str::to_string)
        .unwrap_or_else(|| pod.id.name.clone());
    (pod.id.namespace.clone(), name)
}

/// Case-insensitive tenant tier extraction from the queue-name label, namespace tier
/// label, or namespace-name affix, defaulting to bronze (§4.1).
pub fn tenant_tier_str(pod: &Pod, namespace_tier_label: Option<&str>) -> &'static str {
    let candidates = [
        pod.label(QUEUE_NAME_LABEL),
        namespace_tier_label,
        Some(pod.id.namespace.as_str()),
    ];
    for candidate in candidates.into_iter().flatten() {
        let lower = candidate.to_ascii_lowercase();
        if lower.contains("gold") {
            return "gold";
        }
        if lower.contains("silver") {
            return "silver";
        }
        if lower.contains("bronze") {
            return "bronze";
        }
    }
    "bronze"
}

/// Parse a comma-separated list of NUMA ids from an annotation value.
pub fn parse_numa_id_list(value: Option<&str>) -> Vec<u32> {
    value
        .map(|v| v.split(',').filter_map(|s| s.trim().parse().ok()).collect())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use kubenexus_common::PodId;

    use super::*;

    fn pod_with_labels(labels: &[(&str, &str)]) -> Pod {
        Pod {
            id: PodId::new("ns", "p", "uid"),
            labels: labels.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
            ..Default::default()
        }
    }

    #[test]
    fn gang_name_prefers_new_key() {
        let pod = pod_with_labels(&[
            (GANG_NAME_KEY, "a"),
            (GANG_NAME_KEY_LEGACY, "b"),
        ]);
        assert_eq!(gang_name(&pod), Some("a"));
    }

    #[test]
    fn gang_name_falls_back_to_legacy() {
        let pod = pod_with_labels(&[(GANG_NAME_KEY_LEGACY, "b")]);
        assert_eq!(gang_name(&pod), Some("b"));
    }

    #[test]
    fn min_available_of_one_is_not_gang() {
        let pod = pod_with_labels(&[(GANG_NAME_KEY, "a"), (GANG_MIN_AVAILABLE_KEY, "1")]);
        assert!(!is_gang(&pod));
    }

    #[test]
    fn min_available_malformed_is_absent() {
        let pod = pod_with_labels(&[(GANG_NAME_KEY, "a"), (GANG_MIN_AVAILABLE_KEY, "not-a-number")]);
        assert_eq!(gang_min_available(&pod), None);
        assert!(!is_gang(&pod));
    }

    #[test]
    fn gang_key_falls_back_to_pod_name() {
        let pod = pod_with_labels(&[]);
        assert_eq!(gang_key(&pod), ("ns".to_string(), "p".to_string()));
    }

    #[test]
    fn tenant_tier_is_case_insensitive() {
        let pod = pod_with_labels(&[(QUEUE_NAME_LABEL, "team-GOLD-queue")]);
        assert_eq!(tenant_tier_str(&pod, None), "gold");
    }

    #[test]
    fn tenant_tier_defaults_to_bronze() {
        let pod = pod_with_labels(&[]);
        assert_eq!(tenant_tier_str(&pod, None), "bronze");
    }
}
