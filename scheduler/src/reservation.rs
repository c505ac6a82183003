//! `ResourceReservation` store (§4.6, §6 "Persistent state layout").
//!
//! Mirrors each `(namespace, gangName)` reservation into an etcd-style key-value
//! backend under `/registry/reservations/<namespace>/<gangName>`, the same prefixed
//! YAML-object convention the production integration uses for pods and nodes. The
//! in-memory map is the source of truth for the hot Reserve/Release path (§5: every
//! extension point that touches it — `ReservePlugin::reserve`/`unreserve` — is a
//! synchronous call with no executor underneath it), so it is guarded by a plain
//! `std::sync::Mutex` rather than an async lock. The etcd mirror is genuinely async
//! I/O; persisting it inline would mean either blocking the sync hot path on network
//! round trips or driving a nested runtime from inside one (which panics either way
//! `Handle::current().block_on` is called — from a bare sync context there is no
//! ambient runtime, and from an async context Tokio refuses to start one runtime
//! inside another). Instead, `reserve`/`release` enqueue a `PersistOp` onto an
//! unbounded channel and a single background task (spawned once, at construction,
//! the one place this store needs an ambient runtime) drains it and talks to etcd.
//! A full channel send failure — the background task is gone — is the one persist
//! failure that *is* surfaced synchronously, since it means the mirror is
//! permanently broken rather than merely slow.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use etcd_client::Client;
use kubenexus_common::ResourceList;
use log::{debug, error, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::ScheduleError;

const RESERVATION_PREFIX: &str = "/registry/reservations";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerPodContribution {
    pub pod_name: String,
    pub node_name: String,
    pub contribution: ResourceList,
}

/// `(namespace, gangName, resourceTotals, perPod[], createdAt, ttl)` per §3.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reservation {
    pub namespace: String,
    pub gang_name: String,
    pub resource_totals: ResourceList,
    pub per_pod: Vec<PerPodContribution>,
    pub created_at: DateTime<Utc>,
    pub ttl_seconds: u64,
}

impl Reservation {
    fn new(namespace: &str, gang_name: &str, ttl_seconds: u64) -> Self {
        Self {
            namespace: namespace.to_string(),
            gang_name: gang_name.to_string(),
            resource_totals: ResourceList::default(),
            per_pod: Vec::new(),
            created_at: Utc::now(),
            ttl_seconds,
        }
    }

    fn key(namespace: &str, gang_name: &str) -> String {
        format!("{RESERVATION_PREFIX}/{namespace}/{gang_name}")
    }

    /// Invariant (ii), §4.6: `resourceTotals = Σ perPod.contribution`.
    fn recompute_totals(&mut self) {
        self.resource_totals = ResourceList::default();
        for p in &self.per_pod {
            self.resource_totals.add(&p.contribution);
        }
    }
}

enum PersistOp {
    Put(Reservation),
    Delete { namespace: String, gang_name: String },
}

/// Owns the authoritative in-memory reservation map; optionally mirrors every
/// mutation to an etcd-compatible backend through a background task.
pub struct ResourceReservationStore {
    inner: Mutex<HashMap<(String, String), Reservation>>,
    persist_tx: Option<mpsc::UnboundedSender<PersistOp>>,
    default_ttl_seconds: u64,
}

impl ResourceReservationStore {
    /// Spawns the background persistence task when `client` is given — this is the
    /// one place construction needs an ambient Tokio runtime (`tokio::spawn`), which
    /// holds for the out-of-scope integration binary's `#[tokio::main]` entry point.
    pub fn new(client: Option<Client>, default_ttl_seconds: u64) -> Self {
        let persist_tx = client.map(|client| {
            let (tx, rx) = mpsc::unbounded_channel();
            tokio::spawn(persist_worker(client, rx));
            tx
        });
        Self {
            inner: Mutex::new(HashMap::new()),
            persist_tx,
            default_ttl_seconds,
        }
    }

    pub fn without_backend(default_ttl_seconds: u64) -> Self {
        Self::new(None, default_ttl_seconds)
    }

    /// `Reserve(gangKey, pod, node)` (§4.6): upsert the record, add this pod's
    /// contribution, create the backing object if this is the first member.
    pub fn reserve(
        &self,
        namespace: &str,
        gang_name: &str,
        pod_name: &str,
        node_name: &str,
        contribution: ResourceList,
    ) -> Result<Reservation, ScheduleError> {
        let mut guard = self.inner.lock().unwrap();
        let key = (namespace.to_string(), gang_name.to_string());
        let reservation = guard
            .entry(key)
            .or_insert_with(|| Reservation::new(namespace, gang_name, self.default_ttl_seconds));

        if let Some(existing) = reservation.per_pod.iter_mut().find(|p| p.pod_name == pod_name) {
            existing.node_name = node_name.to_string();
            existing.contribution = contribution;
        } else {
            reservation.per_pod.push(PerPodContribution {
                pod_name: pod_name.to_string(),
                node_name: node_name.to_string(),
                contribution,
            });
        }
        reservation.recompute_totals();
        let snapshot = reservation.clone();
        debug!(
            "reservation {namespace}/{gang_name}: {} member(s), totals {:?}",
            snapshot.per_pod.len(),
            snapshot.resource_totals
        );
        drop(guard);

        self.enqueue_persist(namespace, gang_name, PersistOp::Put(snapshot.clone()))?;
        Ok(snapshot)
    }

    /// `Release(gangKey, podUID)` (§4.6): remove the pod's contribution; delete the
    /// backing object once `perPod` is empty.
    pub fn release(&self, namespace: &str, gang_name: &str, pod_name: &str) -> Result<(), ScheduleError> {
        let mut guard = self.inner.lock().unwrap();
        let key = (namespace.to_string(), gang_name.to_string());
        let Some(reservation) = guard.get_mut(&key) else {
            return Ok(());
        };
        reservation.per_pod.retain(|p| p.pod_name != pod_name);
        reservation.recompute_totals();
        let now_empty = reservation.per_pod.is_empty();
        if now_empty {
            guard.remove(&key);
            drop(guard);
            self.enqueue_persist(
                namespace,
                gang_name,
                PersistOp::Delete { namespace: namespace.to_string(), gang_name: gang_name.to_string() },
            )
        } else {
            let snapshot = reservation.clone();
            drop(guard);
            self.enqueue_persist(namespace, gang_name, PersistOp::Put(snapshot))
        }
    }

    /// `Get(gangKey)`: snapshot read.
    pub fn get(&self, namespace: &str, gang_name: &str) -> Option<Reservation> {
        self.inner
            .lock()
            .unwrap()
            .get(&(namespace.to_string(), gang_name.to_string()))
            .cloned()
    }

    /// TTL-based cleanup sweep: removes reservations whose `ttl` has elapsed since
    /// `createdAt` (§4.6 "optional TTL... store attempts cleanup and logs").
    pub fn sweep_expired(&self) {
        let mut guard = self.inner.lock().unwrap();
        let now = Utc::now();
        let expired: Vec<(String, String)> = guard
            .iter()
            .filter(|(_, r)| {
                r.ttl_seconds > 0
                    && now.signed_duration_since(r.created_at).num_seconds() as u64 > r.ttl_seconds
            })
            .map(|(k, _)| k.clone())
            .collect();
        for key in &expired {
            guard.remove(key);
        }
        drop(guard);
        for (namespace, gang_name) in expired {
            warn!("reservation {namespace}/{gang_name} expired and was cleaned up");
            let _ = self.enqueue_persist(
                &namespace,
                &gang_name,
                PersistOp::Delete { namespace: namespace.clone(), gang_name: gang_name.clone() },
            );
        }
    }

    /// Non-blocking handoff to the background persistence task. The only failure
    /// surfaced here is the channel being closed (the task has stopped) — individual
    /// etcd errors are logged by the task itself and never block the caller (§5: the
    /// in-memory map is the hot path's source of truth).
    fn enqueue_persist(&self, namespace: &str, gang_name: &str, op: PersistOp) -> Result<(), ScheduleError> {
        let Some(tx) = &self.persist_tx else {
            return Ok(());
        };
        tx.send(op).map_err(|_| ScheduleError::ReservationWriteFailed {
            gang_key: Reservation::key(namespace, gang_name),
            source: anyhow::anyhow!("reservation persistence worker is no longer running"),
        })
    }
}

async fn persist_worker(mut client: Client, mut rx: mpsc::UnboundedReceiver<PersistOp>) {
    while let Some(op) = rx.recv().await {
        let result = match op {
            PersistOp::Put(reservation) => put(&mut client, &reservation).await,
            PersistOp::Delete { namespace, gang_name } => delete(&mut client, &namespace, &gang_name).await,
        };
        if let Err(e) = result {
            error!("{e}");
        }
    }
}

async fn put(client: &mut Client, reservation: &Reservation) -> Result<(), ScheduleError> {
    let key = Reservation::key(&reservation.namespace, &reservation.gang_name);
    let value = serde_yaml::to_string(reservation).map_err(|e| ScheduleError::ReservationWriteFailed {
        gang_key: key.clone(),
        source: e.into(),
    })?;
    client
        .put(key.clone(), value, None)
        .await
        .map_err(|e| ScheduleError::ReservationWriteFailed { gang_key: key, source: e.into() })?;
    Ok(())
}

async fn delete(client: &mut Client, namespace: &str, gang_name: &str) -> Result<(), ScheduleError> {
    let key = Reservation::key(namespace, gang_name);
    client
        .delete(key.clone(), None)
        .await
        .map_err(|e| ScheduleError::ReservationWriteFailed { gang_key: key, source: e.into() })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserve_then_release_restores_empty_store() {
        let store = ResourceReservationStore::without_backend(0);
        store
            .reserve("ns", "g", "p1", "n1", ResourceList {
                cpu_millis: 4000,
                memory_bytes: 8_000_000_000,
                extra: Default::default(),
            })
            .unwrap();
        assert!(store.get("ns", "g").is_some());

        store.release("ns", "g", "p1").unwrap();
        assert!(store.get("ns", "g").is_none());
    }

    #[test]
    fn totals_equal_sum_of_contributions() {
        let store = ResourceReservationStore::without_backend(0);
        store
            .reserve("ns", "g", "p1", "n1", ResourceList { cpu_millis: 4000, ..Default::default() })
            .unwrap();
        store
            .reserve("ns", "g", "p2", "n2", ResourceList { cpu_millis: 2000, ..Default::default() })
            .unwrap();
        let r = store.get("ns", "g").unwrap();
        assert_eq!(r.resource_totals.cpu_millis, 6000);
        assert_eq!(r.per_pod.len(), 2);
    }

    #[test]
    fn release_of_one_member_keeps_others() {
        let store = ResourceReservationStore::without_backend(0);
        store.reserve("ns", "g", "p1", "n1", ResourceList::default()).unwrap();
        store.reserve("ns", "g", "p2", "n2", ResourceList::default()).unwrap();
        store.release("ns", "g", "p1").unwrap();
        let r = store.get("ns", "g").unwrap();
        assert_eq!(r.per_pod.len(), 1);
        assert_eq!(r.per_pod[0].pod_name, "p2");
    }

    #[test]
    fn reserve_and_release_without_backend_never_touch_persistence() {
        // No client configured: enqueue_persist is a no-op Ok(()), so reserve/release
        // succeed purely off the in-memory map with no ambient runtime required.
        let store = ResourceReservationStore::without_backend(60);
        assert!(store.reserve("ns", "g", "p1", "n1", ResourceList::default()).is_ok());
        assert!(store.release("ns", "g", "p1").is_ok());
    }
}
