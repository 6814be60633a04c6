//! Reconciliation logic for HotStandbyDeployment resources
//!
//! This module implements the Kubernetes controller pattern: observe current
//! state, determine desired state, calculate the diff, and apply changes.
//! One pass over a resource:
//!
//! 1. Re-read the resource (a 404 drops its probe state).
//! 2. Validate the spec; invalid specs emit an event and wait.
//! 3. List the selected pods, dropping terminal and deleting ones.
//! 4. Take a busy snapshot from the probe engine and count.
//! 5. Compute `desired = clamp(busy + idleTarget, min, max)`.
//! 6. Converge the child Deployment (create / scale / template patch),
//!    refusing to touch a child this resource does not own.
//! 7. Write status idempotently, retrying conflicts inline.
//! 8. Requeue: 30 s steady state, or the probe period when the http
//!    snapshot is stale.
//!
//! Given the same observed state the pass is deterministic and a settled
//! resource produces no API writes.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, ListParams, Patch, PatchParams, PostParams};
use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::{Client, Resource, ResourceExt};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn};

#[cfg(test)]
use mockall::automock;

use crate::controller::child;
use crate::crd::{HotStandbyDeployment, HotStandbyDeploymentStatus, ProbeMode};
use crate::error::Error;
use crate::events::{actions, reasons, EventPublisher};
use crate::limits::RateLimiter;
use crate::probe::{self, HttpProber, PodLister, PollerRegistry, ProbeEngine};
use crate::{Result, FIELD_MANAGER};

/// Steady-state requeue interval closing the loop against missed events
pub const DEFAULT_REQUEUE: Duration = Duration::from_secs(30);

/// Requeue interval for conditions that need a user to act
pub const LONG_REQUEUE: Duration = Duration::from_secs(300);

/// Wall-clock budget for one reconcile pass
const RECONCILE_DEADLINE: Duration = Duration::from_secs(30);

/// Attempts for a conflicted status write, fresh read between each
const STATUS_CONFLICT_RETRIES: u32 = 3;

/// Trait abstracting Kubernetes operations for the reconciler
///
/// This allows mocking the Kubernetes client in tests while using the real
/// client in production.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait WorkloadClient: Send + Sync {
    /// Fetch a HotStandbyDeployment, `None` on 404
    async fn get_hsd(&self, namespace: &str, name: &str)
        -> Result<Option<HotStandbyDeployment>>;

    /// Fetch a Deployment, `None` on 404
    async fn get_deployment(&self, namespace: &str, name: &str) -> Result<Option<Deployment>>;

    /// Create a Deployment
    async fn create_deployment(&self, namespace: &str, deployment: &Deployment) -> Result<()>;

    /// Merge-patch a Deployment
    async fn patch_deployment(
        &self,
        namespace: &str,
        name: &str,
        patch: &serde_json::Value,
    ) -> Result<()>;

    /// List pods matching every given label
    async fn list_selected_pods(
        &self,
        namespace: &str,
        match_labels: &BTreeMap<String, String>,
    ) -> Result<Vec<Pod>>;

    /// Patch a HotStandbyDeployment's status subresource
    async fn patch_status(
        &self,
        namespace: &str,
        name: &str,
        status: &HotStandbyDeploymentStatus,
    ) -> Result<()>;
}

/// Real Kubernetes client implementation
///
/// Writes pass through a shared token bucket (20 QPS, burst 40).
pub struct KubeWorkloadClient {
    client: Client,
    write_limiter: RateLimiter,
}

impl KubeWorkloadClient {
    /// Create a new client wrapping the given kube Client
    pub fn new(client: Client) -> Self {
        Self {
            client,
            write_limiter: RateLimiter::for_writes(),
        }
    }

    async fn pods_matching(
        &self,
        namespace: &str,
        match_labels: &BTreeMap<String, String>,
    ) -> Result<Vec<Pod>> {
        let selector = match_labels
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(",");
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let params = ListParams::default().labels(&selector);
        Ok(api.list(&params).await?.items)
    }
}

#[async_trait]
impl WorkloadClient for KubeWorkloadClient {
    async fn get_hsd(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<HotStandbyDeployment>> {
        let api: Api<HotStandbyDeployment> = Api::namespaced(self.client.clone(), namespace);
        match api.get(name).await {
            Ok(hsd) => Ok(Some(hsd)),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn get_deployment(&self, namespace: &str, name: &str) -> Result<Option<Deployment>> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        match api.get(name).await {
            Ok(deployment) => Ok(Some(deployment)),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn create_deployment(&self, namespace: &str, deployment: &Deployment) -> Result<()> {
        self.write_limiter.acquire().await;
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        api.create(&PostParams::default(), deployment).await?;
        Ok(())
    }

    async fn patch_deployment(
        &self,
        namespace: &str,
        name: &str,
        patch: &serde_json::Value,
    ) -> Result<()> {
        self.write_limiter.acquire().await;
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        api.patch(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(patch))
            .await?;
        Ok(())
    }

    async fn list_selected_pods(
        &self,
        namespace: &str,
        match_labels: &BTreeMap<String, String>,
    ) -> Result<Vec<Pod>> {
        self.pods_matching(namespace, match_labels).await
    }

    async fn patch_status(
        &self,
        namespace: &str,
        name: &str,
        status: &HotStandbyDeploymentStatus,
    ) -> Result<()> {
        self.write_limiter.acquire().await;
        let api: Api<HotStandbyDeployment> = Api::namespaced(self.client.clone(), namespace);
        let patch = serde_json::json!({ "status": status });
        api.patch_status(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }
}

#[async_trait]
impl PodLister for KubeWorkloadClient {
    async fn list_pods(
        &self,
        namespace: &str,
        match_labels: &BTreeMap<String, String>,
    ) -> Result<Vec<Pod>> {
        self.pods_matching(namespace, match_labels).await
    }
}

/// Controller context containing shared state and clients
///
/// Built once at startup and shared across all reconciliation calls; there
/// is no package-level state.
pub struct Context {
    /// Kubernetes operations (trait object for testability)
    pub ops: Arc<dyn WorkloadClient>,
    /// Pod listing for http-mode poller tasks
    pub pod_lister: Arc<dyn PodLister>,
    /// Event publishing (already rate-limited in production)
    pub events: Arc<dyn EventPublisher>,
    /// Busy-state tables
    pub probes: Arc<ProbeEngine>,
    /// Per-resource http poller tasks
    pub pollers: Arc<PollerRegistry>,
    /// HTTP transport for busy probes
    pub prober: Arc<dyn HttpProber>,
    /// Maximum in-flight probes per resource
    pub probe_concurrency: usize,
    /// First instant each resource's desired dropped below current, for the
    /// scale-down grace window
    scale_down_since: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl Context {
    /// Create a production context from a Kubernetes client
    pub fn new(client: Client, events: Arc<dyn EventPublisher>, probe_concurrency: usize) -> Self {
        let kube = Arc::new(KubeWorkloadClient::new(client));
        Self {
            ops: kube.clone(),
            pod_lister: kube,
            events,
            probes: Arc::new(ProbeEngine::new()),
            pollers: Arc::new(PollerRegistry::new()),
            prober: Arc::new(probe::ReqwestProber::new()),
            probe_concurrency,
            scale_down_since: Mutex::new(HashMap::new()),
        }
    }

    /// Create a context with custom implementations
    ///
    /// This is primarily used for testing with mock clients.
    pub fn with_clients(
        ops: Arc<dyn WorkloadClient>,
        pod_lister: Arc<dyn PodLister>,
        events: Arc<dyn EventPublisher>,
        prober: Arc<dyn HttpProber>,
        probe_concurrency: usize,
    ) -> Self {
        Self {
            ops,
            pod_lister,
            events,
            probes: Arc::new(ProbeEngine::new()),
            pollers: Arc::new(PollerRegistry::new()),
            prober,
            probe_concurrency,
            scale_down_since: Mutex::new(HashMap::new()),
        }
    }

    /// Replica count to actually set, honoring the scale-down grace window
    ///
    /// Scale-ups apply immediately and clear any pending window. A
    /// scale-down is deferred until `desired` has stayed below the current
    /// count for `grace_seconds`.
    fn effective_replicas(
        &self,
        key: &str,
        grace_seconds: i64,
        current: i32,
        desired: i32,
        now: DateTime<Utc>,
    ) -> i32 {
        let mut since = self
            .scale_down_since
            .lock()
            .expect("scale-down lock poisoned");
        if desired >= current {
            since.remove(key);
            return desired;
        }
        if grace_seconds <= 0 {
            since.remove(key);
            return desired;
        }
        let started = *since.entry(key.to_string()).or_insert(now);
        if now - started >= chrono::Duration::seconds(grace_seconds) {
            since.remove(key);
            desired
        } else {
            debug!(key, current, desired, "deferring scale-down within grace window");
            current
        }
    }

    fn clear_scale_down(&self, key: &str) {
        self.scale_down_since
            .lock()
            .expect("scale-down lock poisoned")
            .remove(key);
    }
}

/// Outcome of converging the child Deployment
enum ChildState {
    /// The child exists, is owned, and matches the desired state
    Converged,
    /// The child exists but is not ours; nothing was mutated
    Conflict(String),
}

/// Reconcile a HotStandbyDeployment resource
///
/// Runs one pass under the reconcile deadline and returns the requeue
/// action, or an error for the controller's error policy.
#[instrument(skip(hsd, ctx), fields(
    namespace = %hsd.namespace().unwrap_or_default(),
    name = %hsd.name_any(),
    generation = hsd.metadata.generation.unwrap_or_default(),
))]
pub async fn reconcile(hsd: Arc<HotStandbyDeployment>, ctx: Arc<Context>) -> Result<Action> {
    match tokio::time::timeout(RECONCILE_DEADLINE, reconcile_inner(&hsd, &ctx)).await {
        Ok(result) => result,
        Err(_) => Err(Error::internal_with_context(
            "reconciler",
            "reconcile deadline exceeded",
        )),
    }
}

async fn reconcile_inner(
    cached: &HotStandbyDeployment,
    ctx: &Context,
) -> Result<Action> {
    let namespace = cached
        .namespace()
        .ok_or_else(|| Error::internal_with_context("reconciler", "resource has no namespace"))?;
    let name = cached.name_any();
    let key = probe::hsd_key(&namespace, &name);

    // Step 1: load through the API; the cached object may lag a deletion.
    let Some(hsd) = ctx.ops.get_hsd(&namespace, &name).await? else {
        debug!("resource is gone, dropping probe state");
        ctx.probes.drop_table(&key);
        ctx.pollers.remove(&key);
        ctx.clear_scale_down(&key);
        return Ok(Action::await_change());
    };

    let obj_ref = hsd.object_ref(&());
    let generation = hsd.metadata.generation.unwrap_or_default();

    if let Err(e) = hsd.spec.validate() {
        warn!(error = %e, "spec validation failed");
        ctx.events
            .publish(
                &obj_ref,
                EventType::Warning,
                reasons::INVALID_SPEC,
                actions::RECONCILE,
                Some(e.to_string()),
            )
            .await;
        return Ok(Action::requeue(LONG_REQUEUE));
    }

    // Probe lifecycle: http mode keeps a poller task alive, annotation mode
    // must not.
    match hsd.spec.busy_probe.mode {
        ProbeMode::Http => ctx.pollers.ensure(
            &key,
            &hsd,
            &namespace,
            ctx.probes.clone(),
            ctx.pod_lister.clone(),
            ctx.prober.clone(),
            ctx.probe_concurrency,
        ),
        ProbeMode::Annotation => ctx.pollers.remove(&key),
    }

    // Step 3: selected pods, minus terminal and deleting ones.
    let match_labels = hsd.spec.match_labels();
    let selected: Vec<Pod> = ctx
        .ops
        .list_selected_pods(&namespace, &match_labels)
        .await?
        .into_iter()
        .filter(probe::is_active_pod)
        .collect();

    // Step 4: busy snapshot.
    let snapshot = match hsd.spec.busy_probe.mode {
        ProbeMode::Annotation => ctx.probes.snapshot_annotation(
            &key,
            &hsd.spec.busy_probe.annotation_key,
            &selected,
        ),
        ProbeMode::Http => ctx.probes.snapshot_http(&key, &selected),
    };
    let busy_count = selected
        .iter()
        .filter(|pod| {
            pod.metadata
                .name
                .as_deref()
                .map(|n| snapshot.is_busy(n))
                .unwrap_or(false)
        })
        .count() as i32;
    let idle_count = selected.len() as i32 - busy_count;

    if snapshot.probe_errors > 0 {
        ctx.events
            .publish(
                &obj_ref,
                EventType::Warning,
                reasons::PROBE_ERRORS,
                actions::PROBE,
                Some(format!(
                    "{} of {} busy probes failing",
                    snapshot.probe_errors,
                    selected.len()
                )),
            )
            .await;
    }

    // Step 5: the contract.
    let desired = hsd.spec.desired_replicas(busy_count);
    debug!(busy_count, idle_count, desired, "computed desired replicas");

    // Step 6: converge the child.
    let state = converge_child(ctx, &hsd, &obj_ref, &namespace, &name, &key, desired).await?;

    // Step 7: status, including for ownership conflicts.
    let status = HotStandbyDeploymentStatus {
        observed_generation: generation,
        busy_count,
        idle_count,
        desired_replicas: desired,
    };
    write_status(ctx, &hsd, &namespace, &name, status).await?;

    match state {
        ChildState::Conflict(message) => {
            warn!(message = %message, "child Deployment is not owned by this resource");
            ctx.events
                .publish(
                    &obj_ref,
                    EventType::Warning,
                    reasons::OWNERSHIP_CONFLICT,
                    actions::RECONCILE,
                    Some(message),
                )
                .await;
            Ok(Action::requeue(LONG_REQUEUE))
        }
        ChildState::Converged => {
            ctx.events
                .publish(
                    &obj_ref,
                    EventType::Normal,
                    reasons::RECONCILED,
                    actions::RECONCILE,
                    Some(format!("busy={busy_count} idle={idle_count} desired={desired}")),
                )
                .await;

            // Step 8: close the loop; chase stale http snapshots at the
            // probe period.
            if hsd.spec.busy_probe.mode == ProbeMode::Http {
                let period = hsd.spec.busy_probe.http.period();
                let stale_after = chrono::Duration::from_std(period * 2)
                    .unwrap_or_else(|_| chrono::Duration::seconds(60));
                if snapshot.is_stale(stale_after) {
                    return Ok(Action::requeue(period));
                }
            }
            Ok(Action::requeue(DEFAULT_REQUEUE))
        }
    }
}

async fn converge_child(
    ctx: &Context,
    hsd: &HotStandbyDeployment,
    obj_ref: &k8s_openapi::api::core::v1::ObjectReference,
    namespace: &str,
    name: &str,
    key: &str,
    desired: i32,
) -> Result<ChildState> {
    let child_name = child::child_name(name);

    match ctx.ops.get_deployment(namespace, &child_name).await? {
        None => {
            let built = child::build_child(hsd, desired)?;
            match ctx.ops.create_deployment(namespace, &built).await {
                Ok(()) => {
                    info!(child = %child_name, replicas = desired, "created child Deployment");
                    ctx.clear_scale_down(key);
                    ctx.events
                        .publish(
                            obj_ref,
                            EventType::Normal,
                            reasons::CHILD_CREATED,
                            actions::CREATE,
                            Some(format!("created {child_name} with {desired} replicas")),
                        )
                        .await;
                    Ok(ChildState::Converged)
                }
                Err(e) if e.is_conflict() => {
                    // Lost a create race or the cache lagged; look again.
                    match ctx.ops.get_deployment(namespace, &child_name).await? {
                        Some(existing) if child::is_controlled_by(&existing, hsd) => {
                            converge_existing(
                                ctx, hsd, obj_ref, namespace, &child_name, &existing, key,
                                desired,
                            )
                            .await
                        }
                        _ => Ok(ChildState::Conflict(format!(
                            "{child_name} already exists and is not controlled by this resource"
                        ))),
                    }
                }
                Err(e) => Err(e),
            }
        }
        Some(existing) if !child::is_controlled_by(&existing, hsd) => {
            Ok(ChildState::Conflict(format!(
                "{child_name} exists without a controller owner reference to this resource"
            )))
        }
        Some(existing) => {
            converge_existing(ctx, hsd, obj_ref, namespace, &child_name, &existing, key, desired)
                .await
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn converge_existing(
    ctx: &Context,
    hsd: &HotStandbyDeployment,
    obj_ref: &k8s_openapi::api::core::v1::ObjectReference,
    namespace: &str,
    child_name: &str,
    existing: &Deployment,
    key: &str,
    desired: i32,
) -> Result<ChildState> {
    let template = child::materialized_template(hsd);
    let hash = child::template_hash(&template)?;
    if child::recorded_hash(existing) != Some(hash.as_str()) {
        info!(child = %child_name, hash = %hash, "pod template diverged, patching");
        ctx.ops
            .patch_deployment(namespace, child_name, &child::template_patch(&template, &hash))
            .await?;
        ctx.events
            .publish(
                obj_ref,
                EventType::Normal,
                reasons::TEMPLATE_UPDATED,
                actions::UPDATE_TEMPLATE,
                Some(format!("updated pod template of {child_name}")),
            )
            .await;
    }

    let current = child::current_replicas(existing);
    let target = ctx.effective_replicas(
        key,
        hsd.spec.scale_down_grace_seconds,
        current,
        desired,
        Utc::now(),
    );
    if target != current {
        info!(child = %child_name, from = current, to = target, "scaling child Deployment");
        ctx.ops
            .patch_deployment(namespace, child_name, &child::scale_patch(target))
            .await?;
        ctx.events
            .publish(
                obj_ref,
                EventType::Normal,
                reasons::CHILD_SCALED,
                actions::SCALE,
                Some(format!("scaled {child_name} from {current} to {target}")),
            )
            .await;
    }
    Ok(ChildState::Converged)
}

/// Write status idempotently, retrying conflicts with fresh reads
///
/// No API call is made when the computed status equals the last observed
/// one. A 409 re-reads the resource, refreshes `observedGeneration`, and
/// retries up to three attempts in total.
async fn write_status(
    ctx: &Context,
    hsd: &HotStandbyDeployment,
    namespace: &str,
    name: &str,
    status: HotStandbyDeploymentStatus,
) -> Result<()> {
    if hsd.status.as_ref() == Some(&status) {
        debug!("status unchanged, skipping write");
        return Ok(());
    }

    let mut status = status;
    let mut attempt = 0;
    loop {
        attempt += 1;
        match ctx.ops.patch_status(namespace, name, &status).await {
            Ok(()) => return Ok(()),
            Err(e) if e.is_conflict() && attempt < STATUS_CONFLICT_RETRIES => {
                debug!(attempt, "status write conflicted, re-reading");
                match ctx.ops.get_hsd(namespace, name).await? {
                    Some(fresh) => {
                        status.observed_generation = fresh
                            .metadata
                            .generation
                            .unwrap_or(status.observed_generation);
                        if fresh.status.as_ref() == Some(&status) {
                            return Ok(());
                        }
                    }
                    // Deleted mid-flight; nothing left to report on.
                    None => return Ok(()),
                }
            }
            Err(e) => return Err(e),
        }
    }
}

/// Error policy for the controller
///
/// Retryable errors requeue quickly; everything else waits for the user at
/// the long interval.
pub fn error_policy(hsd: Arc<HotStandbyDeployment>, error: &Error, _ctx: Arc<Context>) -> Action {
    error!(
        error = %error,
        resource = %hsd.name_any(),
        "reconciliation failed"
    );
    if error.is_retryable() {
        Action::requeue(Duration::from_secs(5))
    } else {
        Action::requeue(LONG_REQUEUE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::HotStandbyDeploymentSpec;
    use crate::probe::http::{MockHttpProber, MockPodLister};
    use k8s_openapi::api::core::v1::ObjectReference;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use std::sync::atomic::{AtomicUsize, Ordering};

    // =========================================================================
    // Fixtures
    // =========================================================================

    fn sample_hsd(name: &str) -> HotStandbyDeployment {
        let spec: HotStandbyDeploymentSpec = serde_json::from_value(serde_json::json!({
            "idleTarget": 3,
            "minReplicas": 0,
            "maxReplicas": 50,
            "selector": { "matchLabels": { "app": "game-ws" } },
            "podTemplate": {
                "spec": {
                    "containers": [ { "name": "game", "image": "game:v1" } ]
                }
            }
        }))
        .unwrap();

        let mut hsd = HotStandbyDeployment::new(name, spec);
        hsd.metadata.namespace = Some("default".to_string());
        hsd.metadata.uid = Some(format!("uid-{name}"));
        hsd.metadata.generation = Some(1);
        hsd
    }

    fn selected_pod(name: &str, busy: bool) -> Pod {
        let mut annotations = BTreeMap::new();
        if busy {
            annotations.insert("paia.tech/busy".to_string(), "true".to_string());
        }
        Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("default".to_string()),
                uid: Some(format!("uid-{name}")),
                labels: Some(BTreeMap::from([(
                    "app".to_string(),
                    "game-ws".to_string(),
                )])),
                annotations: Some(annotations),
                ..Default::default()
            },
            status: Some(k8s_openapi::api::core::v1::PodStatus {
                phase: Some("Running".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn owned_child(hsd: &HotStandbyDeployment, replicas: i32) -> Deployment {
        child::build_child(hsd, replicas).unwrap()
    }

    /// Captured event for verification without coupling to mock internals
    #[derive(Clone, Debug)]
    struct RecordedEvent {
        warning: bool,
        reason: String,
        note: Option<String>,
    }

    /// Event publisher that records everything it is asked to emit
    #[derive(Default)]
    struct RecordingPublisher {
        records: Mutex<Vec<RecordedEvent>>,
    }

    #[async_trait]
    impl EventPublisher for RecordingPublisher {
        async fn publish(
            &self,
            _resource_ref: &ObjectReference,
            type_: EventType,
            reason: &str,
            _action: &str,
            note: Option<String>,
        ) {
            self.records.lock().unwrap().push(RecordedEvent {
                warning: matches!(type_, EventType::Warning),
                reason: reason.to_string(),
                note,
            });
        }
    }

    impl RecordingPublisher {
        fn find(&self, reason: &str) -> Option<RecordedEvent> {
            self.records
                .lock()
                .unwrap()
                .iter()
                .find(|r| r.reason == reason)
                .cloned()
        }
    }

    /// Captured status writes: verify WHAT was written, not HOW.
    #[derive(Clone, Default)]
    struct StatusCapture {
        writes: Arc<Mutex<Vec<HotStandbyDeploymentStatus>>>,
    }

    impl StatusCapture {
        fn last(&self) -> Option<HotStandbyDeploymentStatus> {
            self.writes.lock().unwrap().last().cloned()
        }

        fn count(&self) -> usize {
            self.writes.lock().unwrap().len()
        }
    }

    /// Captured deployment patches
    #[derive(Clone, Default)]
    struct PatchCapture {
        patches: Arc<Mutex<Vec<serde_json::Value>>>,
    }

    impl PatchCapture {
        fn all(&self) -> Vec<serde_json::Value> {
            self.patches.lock().unwrap().clone()
        }
    }

    fn conflict_error() -> Error {
        Error::Kube {
            source: kube::Error::Api(kube::core::ErrorResponse {
                status: "Failure".to_string(),
                message: "the object has been modified".to_string(),
                reason: "Conflict".to_string(),
                code: 409,
            }),
        }
    }

    fn test_context(
        ops: MockWorkloadClient,
    ) -> (Arc<Context>, Arc<RecordingPublisher>) {
        let events = Arc::new(RecordingPublisher::default());
        let ctx = Arc::new(Context::with_clients(
            Arc::new(ops),
            Arc::new(MockPodLister::new()),
            events.clone(),
            Arc::new(MockHttpProber::new()),
            16,
        ));
        (ctx, events)
    }

    /// Mock returning the given resource from get_hsd and capturing status
    /// writes; the rest of the expectations are left to each story.
    fn base_mock(hsd: &HotStandbyDeployment) -> (MockWorkloadClient, StatusCapture) {
        let mut mock = MockWorkloadClient::new();
        let returned = hsd.clone();
        mock.expect_get_hsd()
            .returning(move |_, _| Ok(Some(returned.clone())));

        let capture = StatusCapture::default();
        let writes = capture.writes.clone();
        mock.expect_patch_status().returning(move |_, _, status| {
            writes.lock().unwrap().push(status.clone());
            Ok(())
        });
        (mock, capture)
    }

    // =========================================================================
    // Lifecycle Flow Stories
    // =========================================================================
    //
    // Each story drives one end-to-end reconcile pass and verifies the
    // observable outcomes: API writes issued, status reported, events
    // emitted, and the requeue action.

    /// Story: cold start
    ///
    /// A fresh resource with idleTarget=3, no child and no pods. The
    /// controller creates the child at 3 replicas and reports
    /// busy=0/idle=0/desired=3.
    #[tokio::test]
    async fn story_cold_start_creates_child_at_idle_target() {
        let hsd = sample_hsd("game-ws");
        let (mut mock, status) = base_mock(&hsd);
        mock.expect_list_selected_pods().returning(|_, _| Ok(vec![]));
        mock.expect_get_deployment().returning(|_, _| Ok(None));

        let created: Arc<Mutex<Vec<Deployment>>> = Arc::default();
        let created_clone = created.clone();
        mock.expect_create_deployment()
            .returning(move |_, deployment| {
                created_clone.lock().unwrap().push(deployment.clone());
                Ok(())
            });

        let (ctx, events) = test_context(mock);
        let action = reconcile(Arc::new(hsd), ctx).await.expect("reconcile");

        let created = created.lock().unwrap();
        assert_eq!(created.len(), 1);
        assert_eq!(created[0].metadata.name.as_deref(), Some("game-ws-workload"));
        assert_eq!(created[0].spec.as_ref().unwrap().replicas, Some(3));

        let written = status.last().expect("status written");
        assert_eq!(written.busy_count, 0);
        assert_eq!(written.idle_count, 0);
        assert_eq!(written.desired_replicas, 3);
        assert_eq!(written.observed_generation, 1);

        assert!(events.find(reasons::CHILD_CREATED).is_some());
        assert!(events.find(reasons::RECONCILED).is_some());
        assert_eq!(action, Action::requeue(DEFAULT_REQUEUE));
    }

    /// Story: two busy pods shift the target
    ///
    /// Five pods exist, two annotated busy. The child sits at 3 replicas
    /// and must be patched to 5 (2 busy + 3 idle target).
    #[tokio::test]
    async fn story_two_busy_pods_scale_child_to_five() {
        let hsd = sample_hsd("game-ws");
        let (mut mock, status) = base_mock(&hsd);

        let pods: Vec<Pod> = (0..5).map(|i| selected_pod(&format!("p{i}"), i < 2)).collect();
        mock.expect_list_selected_pods()
            .returning(move |_, _| Ok(pods.clone()));

        let existing = owned_child(&hsd, 3);
        mock.expect_get_deployment()
            .returning(move |_, _| Ok(Some(existing.clone())));

        let patches = PatchCapture::default();
        let sink = patches.patches.clone();
        mock.expect_patch_deployment().returning(move |_, _, patch| {
            sink.lock().unwrap().push(patch.clone());
            Ok(())
        });

        let (ctx, events) = test_context(mock);
        reconcile(Arc::new(hsd), ctx).await.expect("reconcile");

        let all = patches.all();
        assert_eq!(all.len(), 1, "exactly one patch: the scale");
        assert_eq!(all[0], serde_json::json!({ "spec": { "replicas": 5 } }));

        let written = status.last().unwrap();
        assert_eq!(written.busy_count, 2);
        assert_eq!(written.idle_count, 3);
        assert_eq!(written.desired_replicas, 5);

        assert!(events.find(reasons::CHILD_SCALED).is_some());
    }

    /// Story: demand clamps to maxReplicas
    ///
    /// idleTarget=10 with max=4 and no pods: the child stays at 4 and the
    /// pass makes no writes beyond status.
    #[tokio::test]
    async fn story_clamp_to_max_makes_no_child_writes() {
        let mut hsd = sample_hsd("game-ws");
        hsd.spec.idle_target = 10;
        hsd.spec.max_replicas = 4;

        let (mut mock, status) = base_mock(&hsd);
        mock.expect_list_selected_pods().returning(|_, _| Ok(vec![]));

        let existing = owned_child(&hsd, 4);
        mock.expect_get_deployment()
            .returning(move |_, _| Ok(Some(existing.clone())));
        // No create/patch expectations: any child mutation panics the mock.

        let (ctx, events) = test_context(mock);
        let action = reconcile(Arc::new(hsd), ctx).await.expect("reconcile");

        let written = status.last().unwrap();
        assert_eq!(written.desired_replicas, 4);
        assert_eq!(written.busy_count, 0);
        assert!(events.find(reasons::RECONCILED).is_some());
        assert_eq!(action, Action::requeue(DEFAULT_REQUEUE));
    }

    /// Story: selector matches no pods
    #[tokio::test]
    async fn story_no_selected_pods_clamps_idle_target() {
        let hsd = sample_hsd("game-ws");
        let (mut mock, status) = base_mock(&hsd);
        mock.expect_list_selected_pods().returning(|_, _| Ok(vec![]));
        let existing = owned_child(&hsd, 3);
        mock.expect_get_deployment()
            .returning(move |_, _| Ok(Some(existing.clone())));

        let (ctx, _) = test_context(mock);
        reconcile(Arc::new(hsd), ctx).await.expect("reconcile");

        let written = status.last().unwrap();
        assert_eq!(written.busy_count, 0);
        assert_eq!(written.idle_count, 0);
        assert_eq!(written.desired_replicas, 3);
    }

    /// Story: terminal and deleting pods do not count
    #[tokio::test]
    async fn story_terminal_pods_are_excluded_from_counts() {
        let hsd = sample_hsd("game-ws");
        let (mut mock, status) = base_mock(&hsd);

        let mut succeeded = selected_pod("done", true);
        succeeded.status.as_mut().unwrap().phase = Some("Succeeded".to_string());
        let mut deleting = selected_pod("going", true);
        deleting.metadata.deletion_timestamp =
            Some(k8s_openapi::apimachinery::pkg::apis::meta::v1::Time(Utc::now()));
        let pods = vec![selected_pod("live", true), succeeded, deleting];
        mock.expect_list_selected_pods()
            .returning(move |_, _| Ok(pods.clone()));

        let existing = owned_child(&hsd, 4);
        mock.expect_get_deployment()
            .returning(move |_, _| Ok(Some(existing.clone())));

        let (ctx, _) = test_context(mock);
        reconcile(Arc::new(hsd), ctx).await.expect("reconcile");

        let written = status.last().unwrap();
        assert_eq!(written.busy_count, 1);
        assert_eq!(written.idle_count, 0);
        assert_eq!(written.desired_replicas, 4);
    }

    /// Story: ownership conflict
    ///
    /// A Deployment named `game-ws-workload` exists with no controller
    /// owner. The controller must not mutate it, must emit a Warning, and
    /// must still advance observedGeneration in status.
    #[tokio::test]
    async fn story_ownership_conflict_mutates_nothing() {
        let hsd = sample_hsd("game-ws");
        let (mut mock, status) = base_mock(&hsd);
        mock.expect_list_selected_pods().returning(|_, _| Ok(vec![]));

        let foreign = Deployment {
            metadata: ObjectMeta {
                name: Some("game-ws-workload".to_string()),
                namespace: Some("default".to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        mock.expect_get_deployment()
            .returning(move |_, _| Ok(Some(foreign.clone())));
        // No create/patch expectations: mutation would panic the mock.

        let (ctx, events) = test_context(mock);
        let action = reconcile(Arc::new(hsd), ctx).await.expect("reconcile");

        let conflict = events.find(reasons::OWNERSHIP_CONFLICT).expect("warning event");
        assert!(conflict.warning);

        let written = status.last().expect("status still written");
        assert_eq!(written.observed_generation, 1);
        assert_eq!(written.desired_replicas, 3);

        assert_eq!(action, Action::requeue(LONG_REQUEUE));
    }

    /// Story: template change
    ///
    /// The image moves from v1 to v2. The child gets a template patch with
    /// the new hash; replicas stay untouched.
    #[tokio::test]
    async fn story_template_change_patches_template_only() {
        let old = sample_hsd("game-ws");
        let existing = owned_child(&old, 3);

        let mut updated = old.clone();
        updated.spec.pod_template.spec.as_mut().unwrap().containers[0].image =
            Some("game:v2".to_string());

        let (mut mock, _status) = base_mock(&updated);
        mock.expect_list_selected_pods().returning(|_, _| Ok(vec![]));
        mock.expect_get_deployment()
            .returning(move |_, _| Ok(Some(existing.clone())));

        let patches = PatchCapture::default();
        let sink = patches.patches.clone();
        mock.expect_patch_deployment().returning(move |_, _, patch| {
            sink.lock().unwrap().push(patch.clone());
            Ok(())
        });

        let (ctx, events) = test_context(mock);
        reconcile(Arc::new(updated.clone()), ctx).await.expect("reconcile");

        let all = patches.all();
        assert_eq!(all.len(), 1, "exactly one patch: the template");
        let expected_hash =
            child::template_hash(&child::materialized_template(&updated)).unwrap();
        assert_eq!(
            all[0]["metadata"]["annotations"][crate::TEMPLATE_HASH_ANNOTATION],
            serde_json::json!(expected_hash)
        );
        assert!(all[0]["spec"]["template"].is_object());
        assert!(all[0]["spec"].get("replicas").is_none());

        assert!(events.find(reasons::TEMPLATE_UPDATED).is_some());
    }

    /// Story: a settled resource produces no writes at all
    ///
    /// Status equals the computed status and the child matches: the pass
    /// must be a pure read.
    #[tokio::test]
    async fn story_settled_resource_is_read_only() {
        let mut hsd = sample_hsd("game-ws");
        hsd.status = Some(HotStandbyDeploymentStatus {
            observed_generation: 1,
            busy_count: 0,
            idle_count: 0,
            desired_replicas: 3,
        });

        let mut mock = MockWorkloadClient::new();
        let returned = hsd.clone();
        mock.expect_get_hsd()
            .returning(move |_, _| Ok(Some(returned.clone())));
        mock.expect_list_selected_pods().returning(|_, _| Ok(vec![]));
        let existing = owned_child(&hsd, 3);
        mock.expect_get_deployment()
            .returning(move |_, _| Ok(Some(existing.clone())));
        // No patch_status, create, or patch expectations: any write panics.

        let (ctx, _) = test_context(mock);
        reconcile(Arc::new(hsd), ctx).await.expect("reconcile");
    }

    /// Story: consecutive identical reconciles write status exactly once
    #[tokio::test]
    async fn story_status_writes_are_idempotent_across_passes() {
        let hsd = sample_hsd("game-ws");
        let (mut mock, status) = base_mock(&hsd);
        mock.expect_list_selected_pods().returning(|_, _| Ok(vec![]));
        let existing = owned_child(&hsd, 3);
        mock.expect_get_deployment()
            .returning(move |_, _| Ok(Some(existing.clone())));

        let (ctx, _) = test_context(mock);
        reconcile(Arc::new(hsd.clone()), ctx.clone()).await.unwrap();
        assert_eq!(status.count(), 1);

        // Second pass with the status the first pass just wrote.
        let mut settled = hsd;
        settled.status = status.last();
        // base_mock's get_hsd still returns the status-less resource, so
        // rebuild the mock world for the second pass.
        let mut mock2 = MockWorkloadClient::new();
        let returned = settled.clone();
        mock2
            .expect_get_hsd()
            .returning(move |_, _| Ok(Some(returned.clone())));
        mock2.expect_list_selected_pods().returning(|_, _| Ok(vec![]));
        let existing2 = owned_child(&settled, 3);
        mock2
            .expect_get_deployment()
            .returning(move |_, _| Ok(Some(existing2.clone())));

        let (ctx2, _) = test_context(mock2);
        reconcile(Arc::new(settled), ctx2).await.unwrap();
        // mock2 has no patch_status expectation; reaching here proves no
        // second write happened.
    }

    /// Story: a conflicted status write retries with fresh reads
    #[tokio::test]
    async fn story_status_conflict_retries_inline() {
        let hsd = sample_hsd("game-ws");

        let mut mock = MockWorkloadClient::new();
        let returned = hsd.clone();
        mock.expect_get_hsd()
            .returning(move |_, _| Ok(Some(returned.clone())));
        mock.expect_list_selected_pods().returning(|_, _| Ok(vec![]));
        let existing = owned_child(&hsd, 3);
        mock.expect_get_deployment()
            .returning(move |_, _| Ok(Some(existing.clone())));

        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = attempts.clone();
        mock.expect_patch_status().returning(move |_, _, _| {
            if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(conflict_error())
            } else {
                Ok(())
            }
        });

        let (ctx, _) = test_context(mock);
        reconcile(Arc::new(hsd), ctx).await.expect("reconcile");
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    /// Story: invalid spec is rejected without touching anything
    #[tokio::test]
    async fn story_invalid_spec_skips_mutation() {
        let mut hsd = sample_hsd("game-ws");
        hsd.spec.min_replicas = 5;
        hsd.spec.max_replicas = 2;

        let mut mock = MockWorkloadClient::new();
        let returned = hsd.clone();
        mock.expect_get_hsd()
            .returning(move |_, _| Ok(Some(returned.clone())));
        // No list/get/create/patch/status expectations: any call panics.

        let (ctx, events) = test_context(mock);
        let action = reconcile(Arc::new(hsd), ctx).await.expect("reconcile");

        let event = events.find(reasons::INVALID_SPEC).expect("warning event");
        assert!(event.warning);
        assert!(event.note.unwrap().contains("minReplicas"));
        assert_eq!(action, Action::requeue(LONG_REQUEUE));
    }

    /// Story: a deleted resource drops its probe state
    #[tokio::test]
    async fn story_deleted_resource_drops_probe_state() {
        let hsd = sample_hsd("game-ws");

        let mut mock = MockWorkloadClient::new();
        mock.expect_get_hsd().returning(|_, _| Ok(None));

        let (ctx, _) = test_context(mock);
        // Pre-seed a table as if the resource had been reconciled before.
        ctx.probes
            .snapshot_annotation("default/game-ws", "paia.tech/busy", &[selected_pod("p", true)]);

        let action = reconcile(Arc::new(hsd), ctx.clone()).await.expect("reconcile");
        assert_eq!(action, Action::await_change());

        let snap = ctx.probes.snapshot_http("default/game-ws", &[]);
        assert_eq!(snap.busy_count(), 0);
    }

    /// Story: transient API errors propagate for the error policy
    #[tokio::test]
    async fn story_api_errors_propagate() {
        let hsd = sample_hsd("game-ws");
        let mut mock = MockWorkloadClient::new();
        let returned = hsd.clone();
        mock.expect_get_hsd()
            .returning(move |_, _| Ok(Some(returned.clone())));
        mock.expect_list_selected_pods()
            .returning(|_, _| Err(Error::internal_with_context("test", "api unavailable")));

        let (ctx, _) = test_context(mock);
        let result = reconcile(Arc::new(hsd), ctx).await;
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("api unavailable"));
    }

    // =========================================================================
    // Scale-Down Grace Window
    // =========================================================================

    /// Story: within the grace window a scale-down is deferred
    #[tokio::test]
    async fn story_scale_down_grace_defers_shrink() {
        let mut hsd = sample_hsd("game-ws");
        hsd.spec.scale_down_grace_seconds = 300;

        let (mut mock, status) = base_mock(&hsd);
        mock.expect_list_selected_pods().returning(|_, _| Ok(vec![]));
        let existing = owned_child(&hsd, 5);
        mock.expect_get_deployment()
            .returning(move |_, _| Ok(Some(existing.clone())));
        // No patch_deployment expectation: scaling now would panic.

        let (ctx, _) = test_context(mock);
        reconcile(Arc::new(hsd), ctx).await.expect("reconcile");

        // Desired is still reported even while the scale is deferred.
        assert_eq!(status.last().unwrap().desired_replicas, 3);
    }

    /// The grace window arithmetic, with injected clocks
    #[test]
    fn effective_replicas_grace_window() {
        let mock = MockWorkloadClient::new();
        let (ctx, _) = test_context(mock);
        let t0 = Utc::now();
        let key = "default/game-ws";

        // Immediate when grace is zero
        assert_eq!(ctx.effective_replicas(key, 0, 5, 3, t0), 3);

        // Deferred at first sight of a shrink
        assert_eq!(ctx.effective_replicas(key, 300, 5, 3, t0), 5);
        // Still deferred inside the window
        assert_eq!(
            ctx.effective_replicas(key, 300, 5, 3, t0 + chrono::Duration::seconds(299)),
            5
        );
        // Fires once the window has elapsed
        assert_eq!(
            ctx.effective_replicas(key, 300, 5, 3, t0 + chrono::Duration::seconds(300)),
            3
        );

        // A scale-up resets any pending window
        assert_eq!(ctx.effective_replicas(key, 300, 5, 3, t0), 5);
        assert_eq!(ctx.effective_replicas(key, 300, 5, 7, t0), 7);
        assert_eq!(ctx.effective_replicas(key, 300, 5, 3, t0), 5);
    }

    // =========================================================================
    // Error Policy
    // =========================================================================

    /// Retryable errors requeue fast, user errors wait
    #[test]
    fn error_policy_matches_retryability() {
        let hsd = Arc::new(sample_hsd("game-ws"));
        let mock = MockWorkloadClient::new();
        let (ctx, _) = test_context(mock);

        let transient = Error::internal("timeout");
        assert_eq!(
            error_policy(hsd.clone(), &transient, ctx.clone()),
            Action::requeue(Duration::from_secs(5))
        );

        let user = Error::invalid_spec("bad");
        assert_eq!(
            error_policy(hsd, &user, ctx),
            Action::requeue(LONG_REQUEUE)
        );
    }

    // =========================================================================
    // HTTP Mode Requeue
    // =========================================================================

    /// Story: before the first poll, an http-mode resource requeues at the
    /// probe period instead of the steady-state interval
    #[tokio::test]
    async fn story_stale_http_snapshot_requeues_at_period() {
        let mut hsd = sample_hsd("game-ws");
        hsd.spec.busy_probe.mode = ProbeMode::Http;

        let (mut mock, _status) = base_mock(&hsd);
        mock.expect_list_selected_pods().returning(|_, _| Ok(vec![]));
        let existing = owned_child(&hsd, 3);
        mock.expect_get_deployment()
            .returning(move |_, _| Ok(Some(existing.clone())));

        let (ctx, _) = test_context(mock);
        let action = reconcile(Arc::new(hsd), ctx.clone()).await.expect("reconcile");

        assert_eq!(action, Action::requeue(Duration::from_secs(10)));
        // The poller task was registered for this resource.
        assert_eq!(ctx.pollers.len(), 1);
    }
}
