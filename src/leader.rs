//! Leader election using Kubernetes Leases
//!
//! With `--leader-elect`, exactly one controller instance is active; the
//! rest stand by. The active instance holds a `coordination.k8s.io/v1`
//! Lease and renews it periodically. `lease_duration` (30 s) is three times
//! `renew_interval` (10 s), so a leader that loses the API detects the loss
//! and stops well before a standby can take over the expired lease.
//!
//! Loss of the lease is surfaced through [`LeaderGuard::lost`]; the caller
//! is expected to stop gracefully and exit with code 2.

use chrono::Utc;
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta};
use kube::api::{Api, Patch, PatchParams, PostParams};
use kube::Client;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::{Result, FIELD_MANAGER};

/// Lease name used by the operator
pub const LEADER_LEASE_NAME: &str = "hotstandby-operator-leader";

const LEASE_DURATION: Duration = Duration::from_secs(30);
const RENEW_INTERVAL: Duration = Duration::from_secs(10);
const RETRY_INTERVAL: Duration = Duration::from_secs(5);

/// Outcome of one attempt against the lease
enum LeaseAttempt {
    Held,
    HeldByOther,
}

/// Leader elector using Kubernetes Leases
pub struct LeaderElector {
    client: Client,
    lease_name: String,
    namespace: String,
    identity: String,
}

impl LeaderElector {
    /// Create an elector for the given lease and identity
    pub fn new(client: Client, namespace: &str, identity: &str) -> Self {
        Self {
            client,
            lease_name: LEADER_LEASE_NAME.to_string(),
            namespace: namespace.to_string(),
            identity: identity.to_string(),
        }
    }

    /// Block until leadership is acquired, then return a guard
    ///
    /// The guard renews the lease in the background; [`LeaderGuard::lost`]
    /// resolves when renewal fails or another holder takes over.
    pub async fn acquire(self: Arc<Self>) -> LeaderGuard {
        info!(
            identity = %self.identity,
            lease = %self.lease_name,
            "waiting for leadership"
        );
        loop {
            match self.try_lease().await {
                Ok(LeaseAttempt::Held) => {
                    info!(identity = %self.identity, "leadership acquired");
                    break;
                }
                Ok(LeaseAttempt::HeldByOther) => {
                    debug!(identity = %self.identity, "lease held by another instance");
                }
                Err(e) => {
                    warn!(identity = %self.identity, error = %e, "lease attempt failed");
                }
            }
            tokio::time::sleep(RETRY_INTERVAL).await;
        }

        let (lost_tx, lost_rx) = oneshot::channel();
        let elector = Arc::clone(&self);
        let renewal = tokio::spawn(async move {
            loop {
                tokio::time::sleep(RENEW_INTERVAL).await;
                match elector.try_lease().await {
                    Ok(LeaseAttempt::Held) => {}
                    Ok(LeaseAttempt::HeldByOther) | Err(_) => {
                        warn!(identity = %elector.identity, "leadership lost");
                        let _ = lost_tx.send(());
                        return;
                    }
                }
            }
        });

        LeaderGuard {
            renewal,
            lost_rx: Some(lost_rx),
        }
    }

    /// Acquire, renew, or take over the lease, depending on its state
    async fn try_lease(&self) -> Result<LeaseAttempt> {
        let api: Api<Lease> = Api::namespaced(self.client.clone(), &self.namespace);
        let now = Utc::now();

        let lease = match api.get(&self.lease_name).await {
            Ok(lease) => lease,
            Err(kube::Error::Api(ae)) if ae.code == 404 => {
                return self.create_lease(&api, now).await;
            }
            Err(e) => return Err(e.into()),
        };

        let spec = lease.spec.as_ref();
        if spec.and_then(|s| s.holder_identity.as_deref()) == Some(self.identity.as_str()) {
            return self.write_lease(&api, now, 0, false).await;
        }

        let expired = match (
            spec.and_then(|s| s.renew_time.as_ref()),
            spec.and_then(|s| s.lease_duration_seconds),
        ) {
            (Some(renewed), Some(duration)) => {
                now > renewed.0 + chrono::Duration::seconds(duration.into())
            }
            _ => true,
        };
        if !expired {
            return Ok(LeaseAttempt::HeldByOther);
        }

        let transitions = spec.and_then(|s| s.lease_transitions).unwrap_or(0);
        self.write_lease(&api, now, transitions + 1, true).await
    }

    async fn create_lease(
        &self,
        api: &Api<Lease>,
        now: chrono::DateTime<Utc>,
    ) -> Result<LeaseAttempt> {
        let lease = Lease {
            metadata: ObjectMeta {
                name: Some(self.lease_name.clone()),
                namespace: Some(self.namespace.clone()),
                ..Default::default()
            },
            spec: Some(LeaseSpec {
                holder_identity: Some(self.identity.clone()),
                lease_duration_seconds: Some(LEASE_DURATION.as_secs() as i32),
                acquire_time: Some(MicroTime(now)),
                renew_time: Some(MicroTime(now)),
                lease_transitions: Some(0),
                ..Default::default()
            }),
        };
        match api.create(&PostParams::default(), &lease).await {
            Ok(_) => {
                info!(identity = %self.identity, "created leader lease");
                Ok(LeaseAttempt::Held)
            }
            Err(kube::Error::Api(ae)) if ae.code == 409 => Ok(LeaseAttempt::HeldByOther),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_lease(
        &self,
        api: &Api<Lease>,
        now: chrono::DateTime<Utc>,
        transitions: i32,
        takeover: bool,
    ) -> Result<LeaseAttempt> {
        let mut spec = serde_json::json!({
            "renewTime": MicroTime(now),
        });
        if takeover {
            spec = serde_json::json!({
                "holderIdentity": self.identity,
                "acquireTime": MicroTime(now),
                "renewTime": MicroTime(now),
                "leaseDurationSeconds": LEASE_DURATION.as_secs(),
                "leaseTransitions": transitions,
            });
        }
        let patch = serde_json::json!({
            "apiVersion": "coordination.k8s.io/v1",
            "kind": "Lease",
            "metadata": {
                "name": self.lease_name,
                "namespace": self.namespace,
            },
            "spec": spec,
        });

        match api
            .patch(
                &self.lease_name,
                &PatchParams::apply(FIELD_MANAGER).force(),
                &Patch::Apply(&patch),
            )
            .await
        {
            Ok(_) => {
                if takeover {
                    info!(identity = %self.identity, transitions, "took over expired lease");
                } else {
                    debug!(identity = %self.identity, "lease renewed");
                }
                Ok(LeaseAttempt::Held)
            }
            Err(kube::Error::Api(ae)) if ae.code == 409 => Ok(LeaseAttempt::HeldByOther),
            Err(e) => Err(e.into()),
        }
    }
}

/// Guard that maintains leadership
///
/// Renewal runs in the background while the guard exists; dropping the
/// guard aborts renewal and releases leadership at the next expiry.
pub struct LeaderGuard {
    renewal: JoinHandle<()>,
    lost_rx: Option<oneshot::Receiver<()>>,
}

impl LeaderGuard {
    /// Wait until leadership is lost
    pub async fn lost(&mut self) {
        if let Some(rx) = self.lost_rx.take() {
            let _ = rx.await;
        }
    }
}

impl Drop for LeaderGuard {
    fn drop(&mut self) {
        self.renewal.abort();
        info!("leadership released");
    }
}
