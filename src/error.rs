//! Error types for the hotstandby operator
//!
//! Errors are structured with fields to aid debugging in production. Each
//! variant carries the context a reconcile log line needs, and
//! [`Error::is_retryable`] classifies variants for the controller's error
//! policy.

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for hotstandby operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// The resource spec is invalid (e.g. minReplicas > maxReplicas)
    #[error("invalid spec for {name}: {message}")]
    InvalidSpec {
        /// Name of the resource with the invalid configuration
        name: String,
        /// Description of what's invalid
        message: String,
    },

    /// The child workload exists but is not controlled by this resource
    #[error("ownership conflict on {child} for {name}: {message}")]
    OwnershipConflict {
        /// Name of the resource whose child is contested
        name: String,
        /// Name of the contested child Deployment
        child: String,
        /// Description of the conflict
        message: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
        /// The resource kind being serialized (if known)
        kind: Option<String>,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g., "reconciler", "probe")
        context: String,
    },
}

impl Error {
    /// Create an invalid-spec error without resource context
    pub fn invalid_spec(msg: impl Into<String>) -> Self {
        Self::InvalidSpec {
            name: UNKNOWN_CONTEXT.to_string(),
            message: msg.into(),
        }
    }

    /// Create an invalid-spec error for a named resource
    pub fn invalid_spec_for(name: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::InvalidSpec {
            name: name.into(),
            message: msg.into(),
        }
    }

    /// Create an ownership-conflict error for a named resource and child
    pub fn ownership_conflict(
        name: impl Into<String>,
        child: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::OwnershipConflict {
            name: name.into(),
            child: child.into(),
            message: msg.into(),
        }
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: None,
        }
    }

    /// Create a serialization error with resource kind context
    pub fn serialization_for_kind(kind: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: Some(kind.into()),
        }
    }

    /// Create an internal error with the given message
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: UNKNOWN_CONTEXT.to_string(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Check if this error is retryable
    ///
    /// Invalid specs and ownership conflicts are not retryable on the error
    /// path (the reconciler handles them with a long requeue instead).
    /// Kubernetes 4xx responses other than conflicts and rate limits are
    /// user or client bugs and not retryable either.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => !matches!(
                source,
                kube::Error::Api(ae) if (400..500).contains(&ae.code) && ae.code != 409 && ae.code != 429
            ),
            Error::InvalidSpec { .. } => false,
            Error::OwnershipConflict { .. } => false,
            Error::Serialization { .. } => false,
            Error::Internal { .. } => true,
        }
    }

    /// Check if this error is a Kubernetes 409 Conflict
    ///
    /// Used both for the inline status-write retry and to detect
    /// create races on the child Deployment.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Kube { source: kube::Error::Api(ae) } if ae.code == 409)
    }

    /// Get the resource name if this error is associated with one
    pub fn resource(&self) -> Option<&str> {
        match self {
            Error::InvalidSpec { name, .. } => Some(name),
            Error::OwnershipConflict { name, .. } => Some(name),
            _ => None,
        }
    }
}
