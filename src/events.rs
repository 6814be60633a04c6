//! Kubernetes Event recording for the hotstandby controller.
//!
//! Provides a trait-based abstraction over `kube::runtime::events::Recorder`
//! so the reconciler can emit standard Kubernetes Events visible via
//! `kubectl describe` and `kubectl get events`.
//!
//! Events are **fire-and-forget**: failures are logged as warnings and never
//! propagate errors. A failed event must never break reconciliation.
//!
//! [`RateLimitedPublisher`] caps emission at one event per reason per
//! resource per minute so steady-state reconciles and repeated probe
//! failures do not flood the event stream.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{EventType, Recorder, Reporter};
use kube::Client;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::warn;

/// Minimum spacing between two events with the same reason on one resource
pub const EVENT_RATE_LIMIT: Duration = Duration::from_secs(60);

/// Trait for publishing Kubernetes Events.
///
/// Implementations are expected to be fire-and-forget: `publish()` logs a
/// warning on failure but never returns an error.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish a Kubernetes Event on the given resource.
    ///
    /// # Arguments
    ///
    /// * `resource_ref` - The Kubernetes object this event is about
    /// * `type_` - Normal or Warning
    /// * `reason` - Machine-readable reason string (e.g. "ChildScaled")
    /// * `action` - What action was taken (e.g. "Scale")
    /// * `note` - Optional human-readable message
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    );
}

/// Production implementation wrapping `kube::runtime::events::Recorder`.
pub struct KubeEventPublisher {
    recorder: Recorder,
}

impl KubeEventPublisher {
    /// Create a new publisher for the given controller name.
    ///
    /// The controller name appears as the "reportingComponent" on Events.
    pub fn new(client: Client, controller_name: &str) -> Self {
        let reporter = Reporter {
            controller: controller_name.to_string(),
            instance: None,
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl EventPublisher for KubeEventPublisher {
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        let event = kube::runtime::events::Event {
            type_,
            reason: reason.to_string(),
            note,
            action: action.to_string(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&event, resource_ref).await {
            warn!(
                reason,
                action,
                error = %e,
                "failed to publish Kubernetes event"
            );
        }
    }
}

/// Rate-limiting wrapper: at most one event per reason per resource per
/// [`EVENT_RATE_LIMIT`].
///
/// Excess events are silently dropped; the underlying condition is still
/// visible in logs and status.
pub struct RateLimitedPublisher<P> {
    inner: P,
    last_emitted: Mutex<HashMap<(String, String), Instant>>,
    min_interval: Duration,
}

impl<P: EventPublisher> RateLimitedPublisher<P> {
    /// Wrap a publisher with the default 60 s per-reason rate limit
    pub fn new(inner: P) -> Self {
        Self::with_interval(inner, EVENT_RATE_LIMIT)
    }

    /// Wrap a publisher with a custom rate-limit interval
    pub fn with_interval(inner: P, min_interval: Duration) -> Self {
        Self {
            inner,
            last_emitted: Mutex::new(HashMap::new()),
            min_interval,
        }
    }

    fn should_emit(&self, resource_ref: &ObjectReference, reason: &str) -> bool {
        let key = (
            format!(
                "{}/{}",
                resource_ref.namespace.as_deref().unwrap_or_default(),
                resource_ref.name.as_deref().unwrap_or_default()
            ),
            reason.to_string(),
        );
        let now = Instant::now();
        let mut last = self.last_emitted.lock().expect("event limiter lock poisoned");
        match last.get(&key) {
            Some(prev) if now.duration_since(*prev) < self.min_interval => false,
            _ => {
                last.insert(key, now);
                true
            }
        }
    }
}

#[async_trait]
impl<P: EventPublisher> EventPublisher for RateLimitedPublisher<P> {
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        if self.should_emit(resource_ref, reason) {
            self.inner
                .publish(resource_ref, type_, reason, action, note)
                .await;
        }
    }
}

/// No-op implementation for tests.
///
/// All calls are silently ignored, no Kubernetes API interaction.
pub struct NoopEventPublisher;

#[async_trait]
impl EventPublisher for NoopEventPublisher {
    async fn publish(
        &self,
        _resource_ref: &ObjectReference,
        _type_: EventType,
        _reason: &str,
        _action: &str,
        _note: Option<String>,
    ) {
        // intentionally empty
    }
}

/// Well-known event reason strings.
///
/// These appear in `kubectl get events` under the REASON column.
pub mod reasons {
    /// A reconcile pass completed and the child matches the desired state
    pub const RECONCILED: &str = "Reconciled";
    /// The child Deployment was created
    pub const CHILD_CREATED: &str = "ChildCreated";
    /// The child Deployment's replica count was changed
    pub const CHILD_SCALED: &str = "ChildScaled";
    /// The child Deployment's pod template was replaced
    pub const TEMPLATE_UPDATED: &str = "TemplateUpdated";
    /// The spec failed validation; no mutation was performed
    pub const INVALID_SPEC: &str = "InvalidSpec";
    /// The child Deployment exists but is owned by someone else
    pub const OWNERSHIP_CONFLICT: &str = "OwnershipConflict";
    /// One or more busy probes failed in the last polling round
    pub const PROBE_ERRORS: &str = "ProbeErrors";
}

/// Well-known event action strings.
///
/// These appear in `kubectl get events` under the ACTION column.
pub mod actions {
    /// Standard reconciliation loop
    pub const RECONCILE: &str = "Reconcile";
    /// Creating the child workload
    pub const CREATE: &str = "Create";
    /// Scaling the child workload
    pub const SCALE: &str = "Scale";
    /// Replacing the child's pod template
    pub const UPDATE_TEMPLATE: &str = "UpdateTemplate";
    /// Probing pod busy state
    pub const PROBE: &str = "Probe";
}
