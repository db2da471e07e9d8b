//! Error types for the orchestration core
//!
//! One crate-level taxonomy: components recover only from transient
//! failures (bounded retry, see [`crate::retry`]); every other kind is
//! propagated to the invocation boundary with the original cause chained.

use std::time::Duration;

use thiserror::Error;

use crate::api::ObjectReference;

/// Main error type for trellis operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Kubernetes API error from the underlying client
    #[error("kubernetes error: {0}")]
    Api(#[from] kube::Error),

    /// Object not found; expected on the delete path, surfaced elsewhere
    #[error("{kind} {namespace}/{name} not found")]
    NotFound {
        /// Kubernetes kind
        kind: String,
        /// Namespace (empty for cluster-scoped)
        namespace: String,
        /// Object name
        name: String,
    },

    /// Object already exists at the target of a create
    #[error("{kind} {namespace}/{name} already exists")]
    AlreadyExists {
        /// Kubernetes kind
        kind: String,
        /// Namespace (empty for cluster-scoped)
        namespace: String,
        /// Object name
        name: String,
    },

    /// A concurrent writer owns a conflicting object at the move destination
    #[error("conflict at destination for {kind} {namespace}/{name}: {reason}")]
    ConflictAtDestination {
        /// Kubernetes kind
        kind: String,
        /// Namespace
        namespace: String,
        /// Object name
        name: String,
        /// What differed between the desired and the existing object
        reason: String,
    },

    /// The target version of a provider supports a different contract than
    /// the one the management group is being upgraded to
    #[error(
        "the target version for provider {provider} supports the {found} contract, \
         while the management group is moving to {expected}"
    )]
    ContractMismatch {
        /// Provider instance name
        provider: String,
        /// Contract the group is moving to
        expected: String,
        /// Contract the provider's target version supports
        found: String,
    },

    /// A provider left out of a custom upgrade lags behind the target contract
    #[error(
        "provider {provider} supports the {found} contract, while the management group \
         is being updated to {expected}; include {provider} in the upgrade"
    )]
    ContractLagging {
        /// Provider instance name
        provider: String,
        /// Contract the group is moving to
        expected: String,
        /// Contract the provider's current version supports
        found: String,
    },

    /// The ownership graph is inconsistent (UID mismatch or a cycle)
    #[error("owner identity mismatch: {0}")]
    OwnerIdentityMismatch(String),

    /// The move destination has no provider installed for a kind in the batch
    #[error("destination cannot host {api_version}, Kind={kind}: no provider installed")]
    TargetMissingProvider {
        /// API version of the unhosted kind
        api_version: String,
        /// Kind
        kind: String,
    },

    /// A shared node is owned by a tenant cluster outside the move batch
    #[error("{node} is shared with cluster {tenant}, which is not part of the move")]
    SharedNodeAcrossBatches {
        /// Display name of the shared node
        node: String,
        /// Display name of the tenant cluster outside the batch
        tenant: String,
    },

    /// A non-core provider cannot be assigned to a single management group
    #[error("provider {provider} cannot be assigned to a single management group")]
    AmbiguousGroup {
        /// Provider instance name
        provider: String,
    },

    /// A non-core provider has no core provider to form a management group with
    #[error("provider {provider} has no core provider for its management group")]
    MissingCore {
        /// Provider instance name
        provider: String,
    },

    /// Release metadata does not cover a version it is expected to cover
    #[error("invalid release metadata for provider {provider}: {message}")]
    InvalidMetadata {
        /// Provider instance name
        provider: String,
        /// What the metadata is missing
        message: String,
    },

    /// Discovery failed; the graph is not returned half-built
    #[error("discovery failed: {0}")]
    Discovery(String),

    /// Precondition on user input or cluster state failed
    #[error("validation error: {0}")]
    Validation(String),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// The invocation was cancelled through its cancellation token
    #[error("operation cancelled")]
    Cancelled,

    /// A remote call exceeded its per-call timeout
    #[error("deadline exceeded after {0:?}")]
    DeadlineExceeded(Duration),
}

impl Error {
    /// Create a discovery error with the given message
    pub fn discovery(msg: impl Into<String>) -> Self {
        Self::Discovery(msg.into())
    }

    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    /// Not-found error for the given reference
    pub fn not_found(reference: &ObjectReference) -> Self {
        Self::NotFound {
            kind: reference.kind.clone(),
            namespace: reference.namespace.clone(),
            name: reference.name.clone(),
        }
    }

    /// Already-exists error for the given reference
    pub fn already_exists(reference: &ObjectReference) -> Self {
        Self::AlreadyExists {
            kind: reference.kind.clone(),
            namespace: reference.namespace.clone(),
            name: reference.name.clone(),
        }
    }

    /// Whether the failure may recover on its own (connection resets,
    /// 5xx responses, API throttling). Only these are retried.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Api(kube::Error::Api(resp)) => resp.code == 429 || resp.code >= 500,
            Error::Api(kube::Error::HyperError(_)) => true,
            Error::Api(kube::Error::Service(_)) => true,
            _ => false,
        }
    }
}

/// Map a kube client error to the crate taxonomy, folding 404 into
/// [`Error::NotFound`] and 409 into [`Error::AlreadyExists`] for the
/// given reference.
pub(crate) fn classify_kube(err: kube::Error, reference: &ObjectReference) -> Error {
    match err {
        kube::Error::Api(resp) if resp.code == 404 => Error::not_found(reference),
        kube::Error::Api(resp) if resp.code == 409 => Error::already_exists(reference),
        other => Error::Api(other),
    }
}
