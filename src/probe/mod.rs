//! Busy-probe engine
//!
//! Maintains one busy-state table per HotStandbyDeployment and hands the
//! reconciler a consistent point-in-time [`BusySnapshot`]. Two strategies
//! share the table:
//!
//! - **Annotation mode**: busy state is read from a pod annotation. Pod
//!   watch events drive reconciles, so the table is refreshed from the
//!   selected-pod set each time a snapshot is taken; probing is free.
//! - **HTTP mode**: a per-resource poller task (see [`http`]) periodically
//!   probes pod IPs and records results into the table; snapshots read the
//!   last known state.
//!
//! The engine never returns an error to the reconciler: a snapshot is always
//! available, possibly stale, and the reconciler decides whether to requeue
//! early based on [`BusySnapshot::is_stale`].
//!
//! Entries for pods that are no longer selected, deleted, or in a terminal
//! phase are pruned while the snapshot is built; whole tables are dropped
//! when the owning resource disappears.

pub mod http;

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::Pod;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

pub use http::{HttpProber, PodLister, PollerRegistry, ReqwestProber};

/// Identity of a pod in a busy table
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct PodKey {
    /// Pod namespace
    pub namespace: String,
    /// Pod name
    pub name: String,
    /// Pod UID; distinguishes a recreated pod from its predecessor
    pub uid: String,
}

/// Busy state recorded for one pod
#[derive(Clone, Debug, PartialEq)]
pub struct PodBusyState {
    /// Whether the pod was busy at the last observation
    pub busy: bool,
    /// When the busy value was last observed
    pub last_observed: DateTime<Utc>,
    /// Error from the most recent probe attempt, if it failed
    pub last_probe_error: Option<String>,
}

/// One resource's busy table plus its poll bookkeeping
#[derive(Default)]
struct BusyTable {
    entries: HashMap<PodKey, PodBusyState>,
    last_poll: Option<DateTime<Utc>>,
}

/// Consistent point-in-time view of one resource's busy table
#[derive(Clone, Debug)]
pub struct BusySnapshot {
    /// Busy flag per selected pod name
    pub busy: HashMap<String, bool>,
    /// When the underlying observations were made
    pub as_of: DateTime<Utc>,
    /// Number of selected pods whose most recent probe attempt failed
    pub probe_errors: usize,
}

impl BusySnapshot {
    /// Whether the named pod is busy; unknown pods count as idle
    pub fn is_busy(&self, pod_name: &str) -> bool {
        self.busy.get(pod_name).copied().unwrap_or(false)
    }

    /// Number of busy pods in the snapshot
    pub fn busy_count(&self) -> i32 {
        self.busy.values().filter(|b| **b).count() as i32
    }

    /// Whether the snapshot is older than `max_age`
    pub fn is_stale(&self, max_age: chrono::Duration) -> bool {
        Utc::now() - self.as_of > max_age
    }
}

/// Busy-state engine holding one table per HotStandbyDeployment
///
/// Tables are keyed by `namespace/name` (see [`hsd_key`]). All mutation
/// happens under a single mutex with short critical sections; snapshots are
/// owned copies.
#[derive(Default)]
pub struct ProbeEngine {
    tables: Mutex<HashMap<String, BusyTable>>,
}

impl ProbeEngine {
    /// Create an empty engine
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a snapshot in annotation mode
    ///
    /// The table is rebuilt from the selected-pod set: busy iff the pod
    /// carries `annotation_key: "true"` (case-sensitive). Entries for pods
    /// outside the set are pruned as a side effect.
    pub fn snapshot_annotation(
        &self,
        key: &str,
        annotation_key: &str,
        pods: &[Pod],
    ) -> BusySnapshot {
        let now = Utc::now();
        let mut entries = HashMap::new();
        let mut busy_map = HashMap::new();

        for pod in pods {
            let Some(pod_key) = pod_key(pod) else { continue };
            let busy = pod
                .metadata
                .annotations
                .as_ref()
                .and_then(|a| a.get(annotation_key))
                .map(|v| v == "true")
                .unwrap_or(false);
            busy_map.insert(pod_key.name.clone(), busy);
            entries.insert(
                pod_key,
                PodBusyState {
                    busy,
                    last_observed: now,
                    last_probe_error: None,
                },
            );
        }

        let mut tables = self.tables.lock().expect("probe table lock poisoned");
        let table = tables.entry(key.to_string()).or_default();
        table.entries = entries;
        table.last_poll = Some(now);

        BusySnapshot {
            busy: busy_map,
            as_of: now,
            probe_errors: 0,
        }
    }

    /// Build a snapshot in http mode
    ///
    /// Reads the last polled state for each selected pod; pods without an
    /// entry (never successfully probed) count as idle. Entries for pods
    /// outside the set are pruned. `as_of` is the time of the last completed
    /// poll, or the epoch when no poll has run yet so the reconciler sees
    /// the snapshot as stale and requeues at the probe period.
    pub fn snapshot_http(&self, key: &str, pods: &[Pod]) -> BusySnapshot {
        let mut tables = self.tables.lock().expect("probe table lock poisoned");
        let table = tables.entry(key.to_string()).or_default();

        let selected: HashSet<PodKey> = pods.iter().filter_map(pod_key).collect();
        table.entries.retain(|k, _| selected.contains(k));

        let mut busy_map = HashMap::new();
        let mut probe_errors = 0;
        for pod_key in &selected {
            match table.entries.get(pod_key) {
                Some(state) => {
                    busy_map.insert(pod_key.name.clone(), state.busy);
                    if state.last_probe_error.is_some() {
                        probe_errors += 1;
                    }
                }
                None => {
                    busy_map.insert(pod_key.name.clone(), false);
                }
            }
        }

        BusySnapshot {
            busy: busy_map,
            as_of: table.last_poll.unwrap_or(DateTime::<Utc>::UNIX_EPOCH),
            probe_errors,
        }
    }

    /// Record the outcome of one HTTP poll round
    ///
    /// `Ok(busy)` replaces the entry; `Err` preserves the previous busy
    /// value and records the error. A pod whose first probe fails is
    /// recorded as idle.
    pub fn record_http_results(
        &self,
        key: &str,
        results: Vec<(PodKey, std::result::Result<bool, String>)>,
    ) {
        let now = Utc::now();
        let mut tables = self.tables.lock().expect("probe table lock poisoned");
        let table = tables.entry(key.to_string()).or_default();

        for (pod_key, result) in results {
            match result {
                Ok(busy) => {
                    table.entries.insert(
                        pod_key,
                        PodBusyState {
                            busy,
                            last_observed: now,
                            last_probe_error: None,
                        },
                    );
                }
                Err(error) => match table.entries.get_mut(&pod_key) {
                    Some(state) => {
                        state.last_probe_error = Some(error);
                    }
                    None => {
                        table.entries.insert(
                            pod_key,
                            PodBusyState {
                                busy: false,
                                last_observed: now,
                                last_probe_error: Some(error),
                            },
                        );
                    }
                },
            }
        }
        table.last_poll = Some(now);
    }

    /// Drop the table for a resource that no longer exists
    pub fn drop_table(&self, key: &str) {
        self.tables
            .lock()
            .expect("probe table lock poisoned")
            .remove(key);
    }

    /// Drop every table whose key is not in `live`
    ///
    /// Called by the periodic sweep so tables cannot leak under churn.
    pub fn retain_tables(&self, live: &HashSet<String>) {
        self.tables
            .lock()
            .expect("probe table lock poisoned")
            .retain(|k, _| live.contains(k));
    }

    #[cfg(test)]
    fn table_len(&self, key: &str) -> usize {
        self.tables
            .lock()
            .unwrap()
            .get(key)
            .map(|t| t.entries.len())
            .unwrap_or(0)
    }

    #[cfg(test)]
    fn entry(&self, key: &str, pod_key: &PodKey) -> Option<PodBusyState> {
        self.tables
            .lock()
            .unwrap()
            .get(key)
            .and_then(|t| t.entries.get(pod_key))
            .cloned()
    }
}

/// Busy-table key for a HotStandbyDeployment
pub fn hsd_key(namespace: &str, name: &str) -> String {
    format!("{namespace}/{name}")
}

/// Extract the table identity of a pod; `None` when metadata is incomplete
pub fn pod_key(pod: &Pod) -> Option<PodKey> {
    Some(PodKey {
        namespace: pod.metadata.namespace.clone()?,
        name: pod.metadata.name.clone()?,
        uid: pod.metadata.uid.clone()?,
    })
}

/// Whether a pod participates in busy/idle counts: not terminal
/// (Succeeded/Failed) and not marked for deletion
pub fn is_active_pod(pod: &Pod) -> bool {
    if pod.metadata.deletion_timestamp.is_some() {
        return false;
    }
    let phase = pod
        .status
        .as_ref()
        .and_then(|s| s.phase.as_deref())
        .unwrap_or("");
    !matches!(phase, "Succeeded" | "Failed")
}
