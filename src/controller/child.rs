//! Child Deployment construction and diffing
//!
//! The controller realizes a HotStandbyDeployment through a single child
//! Deployment named `<name>-workload` in the same namespace. This module
//! builds that Deployment (selector, merged pod template, controller owner
//! reference), computes the template hash used to detect template drift,
//! and produces the minimal patches the reconciler issues: a replicas-only
//! scale patch and a template+hash patch.

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::PodTemplateSpec;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::{Resource, ResourceExt};
use std::collections::BTreeMap;

use crate::crd::HotStandbyDeployment;
use crate::error::Error;
use crate::{Result, CHILD_NAME_SUFFIX, TEMPLATE_HASH_ANNOTATION};

/// Label on the child Deployment pointing back at the owning resource
pub const OWNER_NAME_LABEL: &str = "hsd.paia.tech/name";

/// Name of the child Deployment for a resource name
pub fn child_name(hsd_name: &str) -> String {
    format!("{hsd_name}{CHILD_NAME_SUFFIX}")
}

/// Materialize the pod template for the child Deployment
///
/// The template is the resource's `podTemplate` verbatim, with every
/// selector label merged into the template's metadata labels so the child's
/// selector always matches its own pods.
pub fn materialized_template(hsd: &HotStandbyDeployment) -> PodTemplateSpec {
    let mut template = hsd.spec.pod_template.clone();
    let metadata = template.metadata.get_or_insert_with(Default::default);
    let labels = metadata.labels.get_or_insert_with(BTreeMap::new);
    for (k, v) in hsd.spec.match_labels() {
        labels.insert(k, v);
    }
    template
}

/// FNV-1a 64-bit hash
///
/// The hash algorithm is part of the child annotation contract, so it is
/// spelled out here rather than delegated to the standard hasher.
fn fnv1a64(bytes: &[u8]) -> u64 {
    const OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;
    let mut hash = OFFSET_BASIS;
    for byte in bytes {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(PRIME);
    }
    hash
}

/// Hash of the canonical JSON encoding of a pod template
///
/// Used to detect template drift: the controller patches the child's
/// template iff this differs from the hash recorded in the child's
/// annotation.
pub fn template_hash(template: &PodTemplateSpec) -> Result<String> {
    let canonical = serde_json::to_vec(template)
        .map_err(|e| Error::serialization_for_kind("PodTemplateSpec", e.to_string()))?;
    Ok(format!("{:016x}", fnv1a64(&canonical)))
}

/// Hash annotation currently recorded on a child Deployment, if any
pub fn recorded_hash(child: &Deployment) -> Option<&str> {
    child
        .metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(TEMPLATE_HASH_ANNOTATION))
        .map(String::as_str)
}

/// Whether the Deployment's controller owner reference points at this
/// resource
///
/// The controller never mutates a child it does not own.
pub fn is_controlled_by(child: &Deployment, hsd: &HotStandbyDeployment) -> bool {
    let Some(uid) = hsd.metadata.uid.as_deref() else {
        return false;
    };
    child
        .metadata
        .owner_references
        .as_ref()
        .map(|refs| {
            refs.iter()
                .any(|r| r.controller == Some(true) && r.uid == uid)
        })
        .unwrap_or(false)
}

/// Build the child Deployment for a resource at the given replica count
///
/// The owner reference carries `controller=true` and
/// `blockOwnerDeletion=true` so deletion of the resource cascades and the
/// ownership check above can identify the child.
pub fn build_child(hsd: &HotStandbyDeployment, replicas: i32) -> Result<Deployment> {
    let name = hsd.name_any();
    let namespace = hsd
        .namespace()
        .ok_or_else(|| Error::internal_with_context("child", "resource has no namespace"))?;
    let owner_ref = hsd.controller_owner_ref(&()).ok_or_else(|| {
        Error::internal_with_context("child", "resource has no name for an owner reference")
    })?;

    let template = materialized_template(hsd);
    let hash = template_hash(&template)?;

    let labels = BTreeMap::from([
        (OWNER_NAME_LABEL.to_string(), name.clone()),
        (
            "app.kubernetes.io/managed-by".to_string(),
            "hotstandby".to_string(),
        ),
    ]);
    let annotations = BTreeMap::from([(TEMPLATE_HASH_ANNOTATION.to_string(), hash)]);

    Ok(Deployment {
        metadata: ObjectMeta {
            name: Some(child_name(&name)),
            namespace: Some(namespace),
            labels: Some(labels),
            annotations: Some(annotations),
            owner_references: Some(vec![owner_ref]),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            replicas: Some(replicas),
            selector: hsd.spec.selector.clone(),
            template,
            ..Default::default()
        }),
        status: None,
    })
}

/// Merge patch setting only the child's replica count
pub fn scale_patch(replicas: i32) -> serde_json::Value {
    serde_json::json!({ "spec": { "replicas": replicas } })
}

/// Merge patch replacing the child's pod template and recording its hash
pub fn template_patch(template: &PodTemplateSpec, hash: &str) -> serde_json::Value {
    serde_json::json!({
        "metadata": { "annotations": { TEMPLATE_HASH_ANNOTATION: hash } },
        "spec": { "template": template }
    })
}

/// Replica count currently set on a child Deployment
pub fn current_replicas(child: &Deployment) -> i32 {
    child
        .spec
        .as_ref()
        .and_then(|s| s.replicas)
        .unwrap_or_default()
}
