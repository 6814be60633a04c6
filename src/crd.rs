//! HotStandbyDeployment Custom Resource Definition
//!
//! The HotStandbyDeployment CRD declares a workload that keeps a constant
//! buffer of idle replicas on top of however many pods are currently busy:
//!
//! > desiredReplicas = clamp(busyCount + idleTarget, minReplicas, maxReplicas)
//!
//! The pod template is an opaque passthrough into the child Deployment; the
//! busy predicate is configured under `busyProbe`.

use k8s_openapi::api::core::v1::PodTemplateSpec;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

use crate::error::Error;
use crate::DEFAULT_BUSY_ANNOTATION;

/// Sentinel used when maxReplicas is left unset: effectively unbounded while
/// still giving the clamp a concrete upper edge.
pub const UNBOUNDED_MAX_REPLICAS: i32 = 1_000_000;

/// Specification for a HotStandbyDeployment
///
/// The controller sizes the child Deployment so that `idleTarget` idle pods
/// stay available next to whatever is busy, within `[minReplicas,
/// maxReplicas]`.
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "apps.paia.tech",
    version = "v1alpha1",
    kind = "HotStandbyDeployment",
    plural = "hotstandbydeployments",
    shortname = "hsd",
    status = "HotStandbyDeploymentStatus",
    namespaced,
    printcolumn = r#"{"name":"Busy","type":"integer","jsonPath":".status.busyCount"}"#,
    printcolumn = r#"{"name":"Idle","type":"integer","jsonPath":".status.idleCount"}"#,
    printcolumn = r#"{"name":"Desired","type":"integer","jsonPath":".status.desiredReplicas"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct HotStandbyDeploymentSpec {
    /// Number of idle replicas to keep available on top of the busy count
    pub idle_target: i32,

    /// Lower bound on the child Deployment's replica count
    #[serde(default)]
    pub min_replicas: i32,

    /// Upper bound on the child Deployment's replica count
    #[serde(default = "default_max_replicas")]
    pub max_replicas: i32,

    /// Label selector identifying the pods owned conceptually by this
    /// resource; also becomes the child Deployment's selector
    pub selector: LabelSelector,

    /// Pod template copied verbatim into the child Deployment (selector
    /// labels are merged into its metadata)
    pub pod_template: PodTemplateSpec,

    /// How to decide whether a selected pod is busy
    #[serde(default)]
    pub busy_probe: BusyProbeSpec,

    /// Defer scale-down until desired has stayed at or below the current
    /// replica count for this many seconds (0 = immediate)
    #[serde(default)]
    pub scale_down_grace_seconds: i64,
}

/// Busy-probe configuration
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BusyProbeSpec {
    /// Probe strategy
    #[serde(default)]
    pub mode: ProbeMode,

    /// Annotation key consulted in annotation mode; value `"true"` means busy
    #[serde(default = "default_annotation_key")]
    pub annotation_key: String,

    /// HTTP probe settings, used in http mode
    #[serde(default)]
    pub http: HttpProbeSpec,
}

impl Default for BusyProbeSpec {
    fn default() -> Self {
        Self {
            mode: ProbeMode::default(),
            annotation_key: default_annotation_key(),
            http: HttpProbeSpec::default(),
        }
    }
}

/// Busy-probe strategy selector
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ProbeMode {
    /// Busy state is read from a pod annotation, driven by watch events
    #[default]
    Annotation,
    /// Busy state is polled periodically over HTTP against the pod IP
    Http,
}

/// HTTP probe settings
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HttpProbeSpec {
    /// Port probed on the pod IP
    #[serde(default = "default_http_port")]
    pub port: i32,

    /// Path probed on the pod IP
    #[serde(default = "default_http_path")]
    pub path: String,

    /// If true a 2xx response means busy; if false it means idle
    #[serde(default = "default_success_is_busy")]
    pub success_is_busy: bool,

    /// Per-request timeout in seconds
    #[serde(default = "default_http_timeout_seconds")]
    pub timeout_seconds: i64,

    /// Poll period in seconds
    #[serde(default = "default_http_period_seconds")]
    pub period_seconds: i64,
}

impl Default for HttpProbeSpec {
    fn default() -> Self {
        Self {
            port: default_http_port(),
            path: default_http_path(),
            success_is_busy: default_success_is_busy(),
            timeout_seconds: default_http_timeout_seconds(),
            period_seconds: default_http_period_seconds(),
        }
    }
}

impl HttpProbeSpec {
    /// Per-request timeout as a [`Duration`]
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds.max(1) as u64)
    }

    /// Poll period as a [`Duration`]
    pub fn period(&self) -> Duration {
        Duration::from_secs(self.period_seconds.max(1) as u64)
    }
}

/// Status for a HotStandbyDeployment, written only by the controller
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HotStandbyDeploymentStatus {
    /// Spec generation the controller last acted on
    #[serde(default)]
    pub observed_generation: i64,

    /// Selected pods whose busy predicate held at the last reconcile
    #[serde(default)]
    pub busy_count: i32,

    /// Selected pods counted as idle at the last reconcile
    #[serde(default)]
    pub idle_count: i32,

    /// Replica count the controller is converging the child Deployment to
    #[serde(default)]
    pub desired_replicas: i32,
}

impl HotStandbyDeploymentSpec {
    /// The selector's matchLabels, or an empty map when unset
    pub fn match_labels(&self) -> BTreeMap<String, String> {
        self.selector.match_labels.clone().unwrap_or_default()
    }

    /// Validate the spec
    ///
    /// Violations are user errors; the reconciler surfaces them as an
    /// `InvalidSpec` event and does not mutate the child workload.
    pub fn validate(&self) -> Result<(), Error> {
        if self.idle_target < 0 {
            return Err(Error::invalid_spec("idleTarget must be >= 0"));
        }
        if self.min_replicas < 0 {
            return Err(Error::invalid_spec("minReplicas must be >= 0"));
        }
        if self.max_replicas < 1 {
            return Err(Error::invalid_spec("maxReplicas must be >= 1"));
        }
        if self.min_replicas > self.max_replicas {
            return Err(Error::invalid_spec(format!(
                "minReplicas ({}) exceeds maxReplicas ({})",
                self.min_replicas, self.max_replicas
            )));
        }
        if self.selector.match_labels.as_ref().map_or(true, BTreeMap::is_empty) {
            return Err(Error::invalid_spec("selector.matchLabels must not be empty"));
        }
        if self.scale_down_grace_seconds < 0 {
            return Err(Error::invalid_spec("scaleDownGraceSeconds must be >= 0"));
        }
        if self.busy_probe.mode == ProbeMode::Http {
            if self.busy_probe.http.timeout_seconds < 1 {
                return Err(Error::invalid_spec("busyProbe.http.timeoutSeconds must be >= 1"));
            }
            if self.busy_probe.http.period_seconds < 1 {
                return Err(Error::invalid_spec("busyProbe.http.periodSeconds must be >= 1"));
            }
        }
        Ok(())
    }

    /// Replica count for the given busy count:
    /// `clamp(busy + idleTarget, minReplicas, maxReplicas)`
    ///
    /// Assumes `validate()` passed, i.e. `minReplicas <= maxReplicas`.
    pub fn desired_replicas(&self, busy: i32) -> i32 {
        let raw = busy.saturating_add(self.idle_target);
        raw.min(self.max_replicas).max(self.min_replicas)
    }
}

fn default_max_replicas() -> i32 {
    UNBOUNDED_MAX_REPLICAS
}

fn default_annotation_key() -> String {
    DEFAULT_BUSY_ANNOTATION.to_string()
}

fn default_http_port() -> i32 {
    8080
}

fn default_http_path() -> String {
    "/busy".to_string()
}

fn default_success_is_busy() -> bool {
    true
}

fn default_http_timeout_seconds() -> i64 {
    1
}

fn default_http_period_seconds() -> i64 {
    10
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_spec_json() -> serde_json::Value {
        serde_json::json!({
            "idleTarget": 3,
            "selector": { "matchLabels": { "app": "game-ws" } },
            "podTemplate": {
                "spec": {
                    "containers": [ { "name": "game", "image": "game:v1" } ]
                }
            }
        })
    }

    fn sample_spec() -> HotStandbyDeploymentSpec {
        serde_json::from_value(minimal_spec_json()).expect("minimal spec should parse")
    }

    // =========================================================================
    // Defaulting Stories
    // =========================================================================
    //
    // Users typically set idleTarget, the selector, and the pod template and
    // nothing else; everything under busyProbe must come out with the
    // documented defaults.

    /// Story: a minimal spec parses with the documented defaults
    #[test]
    fn story_minimal_spec_gets_documented_defaults() {
        let spec = sample_spec();

        assert_eq!(spec.idle_target, 3);
        assert_eq!(spec.min_replicas, 0);
        assert_eq!(spec.max_replicas, UNBOUNDED_MAX_REPLICAS);
        assert_eq!(spec.scale_down_grace_seconds, 0);

        assert_eq!(spec.busy_probe.mode, ProbeMode::Annotation);
        assert_eq!(spec.busy_probe.annotation_key, "paia.tech/busy");
        assert_eq!(spec.busy_probe.http.port, 8080);
        assert_eq!(spec.busy_probe.http.path, "/busy");
        assert!(spec.busy_probe.http.success_is_busy);
        assert_eq!(spec.busy_probe.http.timeout_seconds, 1);
        assert_eq!(spec.busy_probe.http.period_seconds, 10);
    }

    /// Story: probe mode round-trips through its lowercase wire form
    #[test]
    fn story_probe_mode_serializes_lowercase() {
        let mut json = minimal_spec_json();
        json["busyProbe"] = serde_json::json!({ "mode": "http" });
        let spec: HotStandbyDeploymentSpec = serde_json::from_value(json).unwrap();
        assert_eq!(spec.busy_probe.mode, ProbeMode::Http);

        let out = serde_json::to_value(&spec.busy_probe.mode).unwrap();
        assert_eq!(out, serde_json::json!("http"));
    }

    // =========================================================================
    // Validation Stories
    // =========================================================================

    /// Story: a well-formed spec passes validation
    #[test]
    fn story_valid_spec_passes() {
        assert!(sample_spec().validate().is_ok());
    }

    /// Story: minReplicas above maxReplicas is rejected before any mutation
    #[test]
    fn story_inverted_replica_bounds_are_rejected() {
        let mut spec = sample_spec();
        spec.min_replicas = 5;
        spec.max_replicas = 2;
        let err = spec.validate().unwrap_err();
        assert!(err.to_string().contains("minReplicas"));
        assert!(!err.is_retryable());
    }

    /// Story: an empty selector would match nothing meaningful and is rejected
    #[test]
    fn story_empty_selector_is_rejected() {
        let mut spec = sample_spec();
        spec.selector = LabelSelector::default();
        assert!(spec.validate().is_err());

        spec.selector.match_labels = Some(BTreeMap::new());
        assert!(spec.validate().is_err());
    }

    /// Story: negative idleTarget is rejected
    #[test]
    fn story_negative_idle_target_is_rejected() {
        let mut spec = sample_spec();
        spec.idle_target = -1;
        assert!(spec.validate().is_err());
    }

    /// Story: http mode requires sane timing
    #[test]
    fn story_http_mode_requires_positive_timing() {
        let mut spec = sample_spec();
        spec.busy_probe.mode = ProbeMode::Http;
        spec.busy_probe.http.period_seconds = 0;
        assert!(spec.validate().is_err());

        spec.busy_probe.http.period_seconds = 10;
        spec.busy_probe.http.timeout_seconds = 0;
        assert!(spec.validate().is_err());
    }

    // =========================================================================
    // Replica Math Stories (boundary behaviors)
    // =========================================================================

    /// Story: no busy pods and no idle buffer means the floor wins
    #[test]
    fn story_zero_busy_zero_target_lands_on_min() {
        let mut spec = sample_spec();
        spec.idle_target = 0;
        assert_eq!(spec.desired_replicas(0), 0);

        spec.min_replicas = 2;
        assert_eq!(spec.desired_replicas(0), 2);
    }

    /// Story: demand above the ceiling clamps to maxReplicas
    #[test]
    fn story_demand_clamps_to_max() {
        let mut spec = sample_spec();
        spec.idle_target = 10;
        spec.max_replicas = 4;
        assert_eq!(spec.desired_replicas(0), 4);
        assert_eq!(spec.desired_replicas(100), 4);
    }

    /// Story: every busy pod shifts the target up until the ceiling
    #[test]
    fn story_busy_pods_shift_the_target() {
        let mut spec = sample_spec();
        spec.idle_target = 3;
        spec.max_replicas = 50;
        assert_eq!(spec.desired_replicas(0), 3);
        assert_eq!(spec.desired_replicas(2), 5);
        assert_eq!(spec.desired_replicas(47), 50);
        assert_eq!(spec.desired_replicas(48), 50);
    }

    /// Story: a floor above the idle buffer is accepted as-is
    ///
    /// The math allows minReplicas > idleTarget; the floor simply dominates
    /// while demand is low.
    #[test]
    fn story_floor_above_idle_target_is_honored() {
        let mut spec = sample_spec();
        spec.idle_target = 1;
        spec.min_replicas = 5;
        spec.max_replicas = 50;
        assert!(spec.validate().is_ok());
        assert_eq!(spec.desired_replicas(0), 5);
        assert_eq!(spec.desired_replicas(10), 11);
    }

    /// Story: the unbounded sentinel never clamps realistic demand
    #[test]
    fn story_default_max_is_effectively_unbounded() {
        let spec = sample_spec();
        assert_eq!(spec.desired_replicas(10_000), 10_003);
    }

    // =========================================================================
    // CRD Manifest
    // =========================================================================

    /// The generated CRD carries the wire identity kubectl and RBAC rely on
    #[test]
    fn crd_manifest_identity() {
        use kube::CustomResourceExt;

        let crd = HotStandbyDeployment::crd();
        assert_eq!(crd.spec.group, crate::API_GROUP);
        assert_eq!(crd.spec.names.plural, "hotstandbydeployments");
        assert_eq!(crd.spec.names.kind, "HotStandbyDeployment");
        assert_eq!(crd.spec.scope, "Namespaced");

        let version = &crd.spec.versions[0];
        assert_eq!(version.name, "v1alpha1");
        assert!(
            version
                .subresources
                .as_ref()
                .and_then(|s| s.status.as_ref())
                .is_some(),
            "status subresource must be enabled"
        );
    }
}
