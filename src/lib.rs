//! Hotstandby - Kubernetes controller maintaining a constant buffer of idle replicas
//!
//! The controller reconciles a namespaced custom resource, the
//! [`crd::HotStandbyDeployment`], whose contract is:
//!
//! > desiredReplicas = clamp(busyPods + idleTarget, minReplicas, maxReplicas)
//!
//! A pod is "busy" when the configured probe says so (a pod annotation, or a
//! periodic HTTP poll against the pod IP). The controller owns a child
//! Deployment named `<name>-workload` that executes the pod template; it
//! never manages pods directly.
//!
//! # Architecture
//!
//! Watch streams (the custom resource, the owned child Deployment, and pods
//! mapped through the selector) feed the controller runtime's deduplicating
//! work queue. Workers pull requests and call [`controller::reconcile`],
//! which counts busy pods from a [`probe::ProbeEngine`] snapshot, converges
//! the child Deployment, and writes status.
//!
//! # Modules
//!
//! - [`crd`] - The HotStandbyDeployment custom resource definition
//! - [`controller`] - Reconciliation logic and the Kubernetes client surface
//! - [`probe`] - Busy-probe engine (annotation snapshot and HTTP poll modes)
//! - [`events`] - Kubernetes Event publishing with per-resource rate limiting
//! - [`leader`] - Lease-based leader election
//! - [`limits`] - Token-bucket rate limiting for API writes
//! - [`error`] - Error types for the operator

#![deny(missing_docs)]

pub mod controller;
pub mod crd;
pub mod error;
pub mod events;
pub mod leader;
pub mod limits;
pub mod probe;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Default Configuration Constants
// =============================================================================
// Centralizing these here keeps CRD defaults, the reconciler, and test
// fixtures consistent.

/// API group of the HotStandbyDeployment resource
pub const API_GROUP: &str = "apps.paia.tech";

/// Pod annotation consulted by the default (annotation) busy probe
pub const DEFAULT_BUSY_ANNOTATION: &str = "paia.tech/busy";

/// Annotation on the child Deployment recording the hash of the pod template
/// last applied by this controller
pub const TEMPLATE_HASH_ANNOTATION: &str = "apps.paia.tech/template-hash";

/// Suffix appended to the resource name to form the child Deployment name
pub const CHILD_NAME_SUFFIX: &str = "-workload";

/// Field manager used for all patches issued by this controller
pub const FIELD_MANAGER: &str = "hotstandby-controller";
