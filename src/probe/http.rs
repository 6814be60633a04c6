//! Periodic HTTP busy probing
//!
//! In http mode each HotStandbyDeployment gets its own poller task. Every
//! period (jittered by up to 10% to avoid a thundering herd across
//! resources) the task lists the selected pods and issues
//! `GET http://<podIP>:<port><path>` with the configured timeout, at most
//! `concurrency` requests in flight.
//!
//! Result interpretation: a 2xx response is "success", any other status is
//! "failure", and `busy = (success == successIsBusy)`. A transport error or
//! timeout is a probe failure: the previous busy value is preserved and the
//! error recorded (see [`super::ProbeEngine::record_http_results`]).

use async_trait::async_trait;
use futures::{stream, StreamExt};
use k8s_openapi::api::core::v1::Pod;
use rand::Rng;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

#[cfg(test)]
use mockall::automock;

use crate::crd::{HotStandbyDeployment, HttpProbeSpec};
use crate::probe::{is_active_pod, pod_key, PodKey, ProbeEngine};
use crate::Result;

/// Trait abstracting the HTTP transport used for busy probes
///
/// The real implementation is [`ReqwestProber`]; tests substitute a mock to
/// script response sequences.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait HttpProber: Send + Sync {
    /// Issue a GET and return the HTTP status code, or a transport error
    /// (connection failure, timeout) as a string
    async fn probe(&self, url: &str, timeout: Duration) -> std::result::Result<u16, String>;
}

/// Production prober backed by a pooled reqwest client
pub struct ReqwestProber {
    client: reqwest::Client,
}

impl ReqwestProber {
    /// Create a prober with a fresh connection pool
    ///
    /// Per-request timeouts come from the probe spec, so the client itself
    /// carries none.
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for ReqwestProber {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HttpProber for ReqwestProber {
    async fn probe(&self, url: &str, timeout: Duration) -> std::result::Result<u16, String> {
        match self.client.get(url).timeout(timeout).send().await {
            Ok(response) => Ok(response.status().as_u16()),
            Err(e) => Err(e.to_string()),
        }
    }
}

/// Trait abstracting pod listing for the poller task
///
/// The production implementation lives on the controller's Kubernetes
/// client; tests substitute a mock.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait PodLister: Send + Sync {
    /// List pods in `namespace` matching every label in `match_labels`
    async fn list_pods(
        &self,
        namespace: &str,
        match_labels: &BTreeMap<String, String>,
    ) -> Result<Vec<Pod>>;
}

/// Interpret a probe outcome as a busy observation
///
/// `Ok(code)` is an observation (2xx means "success", then XNOR with
/// `success_is_busy`); `Err` is a probe failure and passes through so the
/// engine can preserve the previous busy value.
fn interpret(
    outcome: std::result::Result<u16, String>,
    success_is_busy: bool,
) -> std::result::Result<bool, String> {
    outcome.map(|code| {
        let success = (200..300).contains(&code);
        success == success_is_busy
    })
}

/// Whether a pod is eligible for an HTTP probe this round: active, has a
/// pod IP, and its Ready condition is not "False"
fn probe_eligible(pod: &Pod) -> Option<String> {
    if !is_active_pod(pod) {
        return None;
    }
    let status = pod.status.as_ref()?;
    let ip = status.pod_ip.clone()?;
    let ready_false = status
        .conditions
        .as_ref()
        .and_then(|cs| cs.iter().find(|c| c.type_ == "Ready"))
        .map(|c| c.status == "False")
        .unwrap_or(false);
    if ready_false {
        return None;
    }
    Some(ip)
}

/// Probe every eligible pod once and record the results into the engine
///
/// At most `concurrency` requests are in flight at a time.
pub async fn poll_selected(
    engine: &ProbeEngine,
    key: &str,
    spec: &HttpProbeSpec,
    pods: &[Pod],
    prober: &dyn HttpProber,
    concurrency: usize,
) {
    let timeout = spec.timeout();
    let targets: Vec<(PodKey, String)> = pods
        .iter()
        .filter_map(|pod| {
            let ip = probe_eligible(pod)?;
            let pk = pod_key(pod)?;
            Some((pk, format!("http://{}:{}{}", ip, spec.port, spec.path)))
        })
        .collect();

    let results: Vec<(PodKey, std::result::Result<bool, String>)> = stream::iter(targets)
        .map(|(pk, url)| async move {
            let outcome = prober.probe(&url, timeout).await;
            (pk, interpret(outcome, spec.success_is_busy))
        })
        .buffer_unordered(concurrency.max(1))
        .collect()
        .await;

    let failures = results.iter().filter(|(_, r)| r.is_err()).count();
    if failures > 0 {
        debug!(key, failures, "busy probe round had failures");
    }
    engine.record_http_results(key, results);
}

/// Fingerprint of the poller-relevant parts of a spec
///
/// When it changes (probe settings or selector edited) the poller task is
/// rebuilt with the new configuration.
fn config_fingerprint(namespace: &str, hsd: &HotStandbyDeployment) -> u64 {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    namespace.hash(&mut hasher);
    hsd.spec.busy_probe.http.port.hash(&mut hasher);
    hsd.spec.busy_probe.http.path.hash(&mut hasher);
    hsd.spec.busy_probe.http.success_is_busy.hash(&mut hasher);
    hsd.spec.busy_probe.http.timeout_seconds.hash(&mut hasher);
    hsd.spec.busy_probe.http.period_seconds.hash(&mut hasher);
    for (k, v) in hsd.spec.match_labels() {
        k.hash(&mut hasher);
        v.hash(&mut hasher);
    }
    hasher.finish()
}

struct PollerHandle {
    fingerprint: u64,
    task: JoinHandle<()>,
}

impl Drop for PollerHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Registry of per-resource poller tasks
///
/// The reconciler calls [`PollerRegistry::ensure`] on every pass of an
/// http-mode resource and [`PollerRegistry::remove`] when the resource is
/// gone or switched to annotation mode; the periodic sweep calls
/// [`PollerRegistry::retain`].
#[derive(Default)]
pub struct PollerRegistry {
    pollers: Mutex<HashMap<String, PollerHandle>>,
}

impl PollerRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Ensure a poller task is running for this resource with the current
    /// configuration, rebuilding it when the configuration changed
    #[allow(clippy::too_many_arguments)]
    pub fn ensure(
        &self,
        key: &str,
        hsd: &HotStandbyDeployment,
        namespace: &str,
        engine: Arc<ProbeEngine>,
        pods: Arc<dyn PodLister>,
        prober: Arc<dyn HttpProber>,
        concurrency: usize,
    ) {
        let fingerprint = config_fingerprint(namespace, hsd);
        let mut pollers = self.pollers.lock().expect("poller registry lock poisoned");
        if let Some(existing) = pollers.get(key) {
            if existing.fingerprint == fingerprint {
                return;
            }
            debug!(key, "probe configuration changed, rebuilding poller");
        }

        let spec = hsd.spec.busy_probe.http.clone();
        let match_labels = hsd.spec.match_labels();
        let task_key = key.to_string();
        let task_namespace = namespace.to_string();

        let task = tokio::spawn(async move {
            loop {
                tokio::time::sleep(jittered(spec.period())).await;
                let pods = match pods.list_pods(&task_namespace, &match_labels).await {
                    Ok(pods) => pods,
                    Err(e) => {
                        warn!(key = %task_key, error = %e, "failed to list pods for busy probe");
                        continue;
                    }
                };
                poll_selected(
                    &engine,
                    &task_key,
                    &spec,
                    &pods,
                    prober.as_ref(),
                    concurrency,
                )
                .await;
            }
        });

        pollers.insert(key.to_string(), PollerHandle { fingerprint, task });
    }

    /// Stop and drop the poller for this resource
    pub fn remove(&self, key: &str) {
        self.pollers
            .lock()
            .expect("poller registry lock poisoned")
            .remove(key);
    }

    /// Stop every poller whose key is not in `live`
    pub fn retain(&self, live: &HashSet<String>) {
        self.pollers
            .lock()
            .expect("poller registry lock poisoned")
            .retain(|k, _| live.contains(k));
    }

    /// Number of running pollers
    pub fn len(&self) -> usize {
        self.pollers
            .lock()
            .expect("poller registry lock poisoned")
            .len()
    }

    /// Whether no pollers are running
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Period stretched by up to 10% so pollers for different resources drift
/// apart instead of firing together
fn jittered(period: Duration) -> Duration {
    let factor = rand::thread_rng().gen_range(1.0..1.10);
    Duration::from_secs_f64(period.as_secs_f64() * factor)
}
