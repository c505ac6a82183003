//! `PodGroupInfo`, the cooperative wait/release registry, and the `GangCoordinator`
//! plugin itself (§3 "PodGroupInfo", §4.2, §9 "Gang waiting set").
//!
//! The framework is expected to supply a parked-pod waiting set with Allow/Reject
//! primitives (§2); since no such primitive is assumed to exist underneath this
//! core, `WaitingRegistry` models it directly as a per-gang set of `tokio::sync::watch`
//! channels, per the redesign note in §9. Any gang member's Permit call may act as the
//! releaser. `PodGroupRegistry` and `WaitingRegistry` are guarded by plain `std::sync::Mutex`
//! (§5 "protected by a sync-map or single lock") rather than an async lock: every plugin
//! extension point in `crate::plugin` is a synchronous call, so the maps it touches must
//! be lock-and-release quickly without an executor underneath them.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use log::debug;
use tokio::sync::watch;

use kubenexus_common::{Node, Pod};

use crate::config::KubeNexusConfig;
use crate::cycle_state::CycleState;
use crate::error::ScheduleError;
use crate::labels;
use crate::numa::GangNumaState;
use crate::plugin::{
    PermitOutcome, PermitPlugin, Plugin, PostBindPlugin, PreFilterPlugin, QueueSortPlugin, ReservePlugin,
    Status,
};
use crate::profile;
use crate::queue::{self, QueuedPodInfo};
use crate::reservation::ResourceReservationStore;

pub type GangKey = (String, String);

/// `(namespace, gangName) -> { minAvailable, firstSeenAt, lastUpdatedAt }` (§3).
/// Only stored for real gangs (`minAvailable > 1`); non-gang pods are tracked with a
/// synthetic, never-persisted entry by the caller.
#[derive(Clone, Debug)]
pub struct PodGroupInfo {
    pub min_available: u32,
    pub first_seen_at: DateTime<Utc>,
    pub last_updated_at: DateTime<Utc>,
}

#[derive(Default)]
pub struct PodGroupRegistry {
    inner: Mutex<HashMap<GangKey, PodGroupInfo>>,
}

impl PodGroupRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the existing entry's `first_seen_at`, or records `now` as the
    /// first-sighting time and returns that.
    pub fn observe(&self, key: GangKey, min_available: u32, now: DateTime<Utc>) -> DateTime<Utc> {
        let mut guard = self.inner.lock().unwrap();
        let entry = guard.entry(key).or_insert_with(|| PodGroupInfo {
            min_available,
            first_seen_at: now,
            last_updated_at: now,
        });
        entry.last_updated_at = now;
        entry.first_seen_at
    }

    pub fn get(&self, key: &GangKey) -> Option<PodGroupInfo> {
        self.inner.lock().unwrap().get(key).cloned()
    }

    /// Removed once the gang completes (all members bound) or times out (§3 lifetime).
    pub fn remove(&self, key: &GangKey) {
        self.inner.lock().unwrap().remove(key);
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PermitSignal {
    Allow,
    Reject,
}

struct ParkedPod {
    pod_name: String,
    sender: watch::Sender<Option<PermitSignal>>,
}

/// Per-gang set of parked Permit callers (§4.2.3, §9). `park` registers the caller
/// and returns a receiver it can await with its own deadline; `allow_all`/`reject_all`
/// broadcast a decision to every currently parked member of the gang and are
/// idempotent (invariant ii, §4.2.3).
#[derive(Default)]
pub struct WaitingRegistry {
    inner: Mutex<HashMap<GangKey, Vec<ParkedPod>>>,
}

impl WaitingRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn park(&self, key: GangKey, pod_name: &str) -> watch::Receiver<Option<PermitSignal>> {
        let (sender, receiver) = watch::channel(None);
        let mut guard = self.inner.lock().unwrap();
        guard.entry(key).or_default().push(ParkedPod {
            pod_name: pod_name.to_string(),
            sender,
        });
        receiver
    }

    pub fn waiting_count(&self, key: &GangKey) -> u32 {
        self.inner.lock().unwrap().get(key).map(|v| v.len() as u32).unwrap_or(0)
    }

    /// Allow every currently parked member of this gang. Sending to a channel with no
    /// receiver left (pod already gone) is a no-op, so repeated sweeps are harmless.
    pub fn allow_all(&self, key: &GangKey) {
        if let Some(parked) = self.inner.lock().unwrap().remove(key) {
            for p in parked {
                let _ = p.sender.send(Some(PermitSignal::Allow));
            }
        }
    }

    /// Reject every currently parked member (§4.2.4 Unreserve: `"gang member failed"`).
    pub fn reject_all(&self, key: &GangKey) -> Vec<String> {
        match self.inner.lock().unwrap().remove(key) {
            Some(parked) => {
                let names = parked.iter().map(|p| p.pod_name.clone()).collect();
                for p in parked {
                    let _ = p.sender.send(Some(PermitSignal::Reject));
                }
                names
            }
            None => Vec::new(),
        }
    }
}

/// Minimal seam into the host framework's shared pod lister (§2), out of scope for
/// this core beyond the two counts gang admission needs.
pub trait PodLister: Send + Sync {
    /// Pods visible in the lister carrying this `(namespace, gangName)`, regardless
    /// of scheduling state (§4.2.2 Pre-Filter sibling count).
    fn gang_sibling_count(&self, namespace: &str, gang_name: &str) -> u32;
    /// Already-running (bound) members of this gang (§4.2.3 Permit `current` count).
    fn running_gang_member_count(&self, namespace: &str, gang_name: &str) -> u32;
}

pub type SharedPodLister = Arc<dyn PodLister>;

/// Per-gang count of members that have reached PostBind, independent of and never
/// derived from `PodLister`'s eventually-consistent informer-backed counts: a pod
/// that just bound may not show up in `running_gang_member_count` yet, so completion
/// detection here is driven purely by the coordinator's own PostBind calls (§3, §5).
#[derive(Default)]
pub struct BoundMemberCounter {
    inner: Mutex<HashMap<GangKey, u32>>,
}

impl BoundMemberCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one more bound member for `key` and returns the new count.
    fn record(&self, key: GangKey) -> u32 {
        let mut guard = self.inner.lock().unwrap();
        let count = guard.entry(key).or_insert(0);
        *count += 1;
        *count
    }

    fn clear(&self, key: &GangKey) {
        self.inner.lock().unwrap().remove(key);
    }
}

/// Queue-Sort, Pre-Filter, Permit, Reserve/Unreserve, PostBind for gang admission
/// (§4.2, §4.4.4, §5).
pub struct GangCoordinator {
    pub registry: Arc<PodGroupRegistry>,
    pub waiting: Arc<WaitingRegistry>,
    pub reservations: Arc<ResourceReservationStore>,
    pub gang_numa_state: Arc<GangNumaState>,
    pub bound_members: Arc<BoundMemberCounter>,
    pub pod_lister: SharedPodLister,
    pub config: Arc<KubeNexusConfig>,
}

impl GangCoordinator {
    /// Upserts `PodGroupInfo` for gang pods; non-gang pods get a synthetic, never
    /// stored first-seen timestamp equal to their own creation time (§4.2.1).
    fn first_seen_at(&self, pod: &Pod) -> DateTime<Utc> {
        let min_available = labels::gang_min_available(pod).unwrap_or(1);
        if labels::is_gang(pod) {
            let key = labels::gang_key(pod);
            self.registry.observe(key, min_available, pod.creation_timestamp)
        } else {
            pod.creation_timestamp
        }
    }

    fn is_starving(&self, pod: &Pod) -> bool {
        if !labels::is_gang(pod) {
            return false;
        }
        let key = labels::gang_key(pod);
        match self.registry.get(&key) {
            Some(info) => queue::is_starving(&info, Utc::now(), self.config.starvation_threshold),
            None => false,
        }
    }

    fn queued_info(&self, pod: &Pod) -> QueuedPodInfo {
        QueuedPodInfo {
            namespace: pod.id.namespace.clone(),
            pod_name: pod.id.name.clone(),
            gang_name: labels::gang_name(pod).map(str::to_string),
            priority: pod.priority.unwrap_or(0),
            first_seen_at: self.first_seen_at(pod),
        }
    }

    /// Retires every piece of process-wide state this coordinator keeps for `key`:
    /// the first-sighting record, the NUMA sibling counts it contributed, and its own
    /// bound-member tally. Called once a gang completes (every member bound, §3
    /// "eagerly removed after successful bind of all members") or is unreserved
    /// (§4.2.4, member failed or Permit timed out) — both are terminal for the gang.
    fn complete(&self, key: &GangKey) {
        self.registry.remove(key);
        self.gang_numa_state.clear(key);
        self.bound_members.clear(key);
    }
}

impl Plugin for GangCoordinator {
    fn name(&self) -> &str {
        "GangCoordinator"
    }
}

impl QueueSortPlugin for GangCoordinator {
    fn less(&self, a: &Pod, b: &Pod) -> std::cmp::Ordering {
        let a_info = self.queued_info(a);
        let b_info = self.queued_info(b);
        let a_starving = self.is_starving(a);
        let b_starving = self.is_starving(b);
        queue::compare(&a_info, &b_info, a_starving, b_starving)
    }
}

impl PreFilterPlugin for GangCoordinator {
    fn pre_filter(&self, state: &mut CycleState, pod: &Pod, _nodes: &[Node]) -> Status {
        let Some(sched_profile) = profile::get_profile(state) else {
            return Status::error(ScheduleError::InvariantViolation(
                "GangCoordinator.pre_filter ran before ProfileClassifier".to_string(),
            ));
        };
        if !sched_profile.is_gang {
            return Status::success();
        }
        let gang_name = sched_profile.gang_name.clone().unwrap_or_default();
        let min_available = sched_profile.gang_min_available.unwrap_or(1);
        let key: GangKey = (pod.id.namespace.clone(), gang_name.clone());
        self.registry.observe(key, min_available, pod.creation_timestamp);
        let sibling_count = self.pod_lister.gang_sibling_count(&pod.id.namespace, &gang_name);
        if sibling_count < min_available {
            return Status::unschedulable(format!(
                "gang has {sibling_count} pods, needs {min_available}"
            ));
        }
        Status::success()
    }
}

impl PermitPlugin for GangCoordinator {
    fn permit(&self, state: &CycleState, pod: &Pod, _node_name: &str) -> PermitOutcome {
        let Some(sched_profile) = profile::get_profile(state) else {
            return PermitOutcome::Reject("profile missing at permit".to_string());
        };
        if !sched_profile.is_gang {
            return PermitOutcome::Allow;
        }
        let gang_name = sched_profile.gang_name.clone().unwrap_or_default();
        let min_available = sched_profile.gang_min_available.unwrap_or(1);
        let key: GangKey = (pod.id.namespace.clone(), gang_name.clone());

        let running = self
            .pod_lister
            .running_gang_member_count(&pod.id.namespace, &gang_name);
        let waiting = self.waiting.waiting_count(&key);
        let current = running + waiting + 1;

        if current < min_available {
            // Register as parked; the host framework's waiting-pod set (out of
            // scope) is expected to actually await release up to this timeout.
            let _ = self.waiting.park(key, &pod.id.name);
            debug!(
                "gang {}/{gang_name}: {current}/{min_available} ready, parking {}",
                pod.id.namespace, pod.id.name
            );
            return PermitOutcome::Wait(self.config.permit_waiting_time);
        }

        debug!("gang {}/{gang_name}: quorum reached, releasing waiters", pod.id.namespace);
        self.waiting.allow_all(&key);
        PermitOutcome::Allow
    }
}

impl ReservePlugin for GangCoordinator {
    fn reserve(&self, state: &CycleState, pod: &Pod, node_name: &str) -> Status {
        let _ = state;
        let (namespace, gang_name) = labels::gang_key(pod);
        let contribution = pod.total_requests();
        match self.reservations.reserve(&namespace, &gang_name, &pod.id.name, node_name, contribution) {
            Ok(_) => Status::success(),
            Err(e) => Status::error(e),
        }
    }

    /// Called by the framework on Permit timeout or Reserve failure (§4.2.4):
    /// rejects every parked sibling and tears down the gang's reservation and every
    /// other piece of process-wide state tied to this gang (§3, §5), giving
    /// remaining members a clean retry rather than holding resources — or a stale
    /// sibling count a future reuse of the same gang name would inherit — indefinitely.
    fn unreserve(&self, state: &CycleState, pod: &Pod, _node_name: &str) {
        let _ = state;
        let (namespace, gang_name) = labels::gang_key(pod);
        let key: GangKey = (namespace.clone(), gang_name.clone());
        let rejected = self.waiting.reject_all(&key);
        for name in &rejected {
            debug!("gang {namespace}/{gang_name} member {name} rejected: pod group member failed");
        }
        if let Err(e) = self.reservations.release(&namespace, &gang_name, &pod.id.name) {
            debug!("gang {namespace}/{gang_name} release failed: {e}");
        }
        self.complete(&key);
    }
}

impl PostBindPlugin for GangCoordinator {
    /// Once every gang member has bound, retires the gang's state so a later gang
    /// reusing the same name starts from a clean slate rather than inheriting stale
    /// NUMA sibling counts or a stale `first_seen_at` (§3, §4.4.4, §5). Non-gang pods
    /// are a trivially complete "gang of one" and are retired on their own PostBind.
    fn post_bind(&self, state: &CycleState, pod: &Pod, _node_name: &str) {
        let _ = state;
        let key = labels::gang_key(pod);
        let min_available = labels::gang_min_available(pod).unwrap_or(1);
        let bound = self.bound_members.record(key.clone());
        if bound >= min_available {
            debug!("gang {}/{} complete: {bound}/{min_available} members bound", key.0, key.1);
            self.complete(&key);
        }
    }
}
