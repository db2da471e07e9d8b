//! Object identities, references, and API group predicates
//!
//! The orchestration core works on dynamic objects; this module carries the
//! small amount of typing it needs: identities (with UID), references
//! (without), and the predicates that classify kinds into the lifecycle
//! domain (clusters, machines, secrets, global hierarchy hubs).

use kube::api::DynamicObject;
use kube::discovery::ApiResource;
use serde::{Deserialize, Serialize};

/// API group of the core lifecycle types (Cluster, Machine, MachineSet, ...)
pub const CORE_GROUP: &str = "cluster-lifecycle.x-k8s.io";

/// API group of infrastructure provider types
pub const INFRASTRUCTURE_GROUP: &str = "infrastructure.cluster-lifecycle.x-k8s.io";

/// API group of bootstrap provider types
pub const BOOTSTRAP_GROUP: &str = "bootstrap.cluster-lifecycle.x-k8s.io";

/// API group of control-plane provider types
pub const CONTROL_PLANE_GROUP: &str = "controlplane.cluster-lifecycle.x-k8s.io";

/// API group of the provider inventory records
pub const INVENTORY_GROUP: &str = "inventory.cluster-lifecycle.x-k8s.io";

/// API version of the provider inventory records
pub const INVENTORY_VERSION: &str = "v1alpha1";

/// Identity of a discovered object: reference plus the server-assigned UID
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectIdentity {
    /// API version (e.g. "cluster-lifecycle.x-k8s.io/v1alpha4")
    pub api_version: String,
    /// Kind (e.g. "Cluster")
    pub kind: String,
    /// Namespace (empty for cluster-scoped)
    pub namespace: String,
    /// Name
    pub name: String,
    /// Server-assigned opaque unique identifier
    pub uid: String,
}

impl ObjectIdentity {
    /// Create a new identity
    pub fn new(api_version: &str, kind: &str, namespace: &str, name: &str, uid: &str) -> Self {
        Self {
            api_version: api_version.to_string(),
            kind: kind.to_string(),
            namespace: namespace.to_string(),
            name: name.to_string(),
            uid: uid.to_string(),
        }
    }

    /// The identity without its UID; may be used across clusters
    pub fn reference(&self) -> ObjectReference {
        ObjectReference {
            api_version: self.api_version.clone(),
            kind: self.kind.clone(),
            namespace: self.namespace.clone(),
            name: self.name.clone(),
        }
    }

    /// Display string for logging
    pub fn display(&self) -> String {
        if self.namespace.is_empty() {
            format!("{}, Kind={}, {}", self.api_version, self.kind, self.name)
        } else {
            format!(
                "{}, Kind={}, {}/{}",
                self.api_version, self.kind, self.namespace, self.name
            )
        }
    }
}

/// Reference to an object by type and name; may be dangling
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectReference {
    /// API version
    pub api_version: String,
    /// Kind
    pub kind: String,
    /// Namespace (empty for cluster-scoped)
    pub namespace: String,
    /// Name
    pub name: String,
}

impl ObjectReference {
    /// Create a new reference
    pub fn new(api_version: &str, kind: &str, namespace: &str, name: &str) -> Self {
        Self {
            api_version: api_version.to_string(),
            kind: kind.to_string(),
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }

    /// Reference to the object a DynamicObject describes
    ///
    /// The type meta must be present; list responses strip it, so callers
    /// holding listed objects should build references from a
    /// [`ResourceKind`](crate::proxy::ResourceKind) instead.
    pub fn from_object(obj: &DynamicObject) -> Option<Self> {
        let types = obj.types.as_ref()?;
        Some(Self {
            api_version: types.api_version.clone(),
            kind: types.kind.clone(),
            namespace: obj.metadata.namespace.clone().unwrap_or_default(),
            name: obj.metadata.name.clone()?,
        })
    }

    /// Display string for logging
    pub fn display(&self) -> String {
        if self.namespace.is_empty() {
            format!("{}, Kind={}, {}", self.api_version, self.kind, self.name)
        } else {
            format!(
                "{}, Kind={}, {}/{}",
                self.api_version, self.kind, self.namespace, self.name
            )
        }
    }

    /// ApiResource for dynamic API access to this reference's type
    pub fn api_resource(&self) -> ApiResource {
        api_resource(&self.api_version, &self.kind)
    }
}

/// Parse an apiVersion into (group, version); core types have no group
pub fn parse_api_version(api_version: &str) -> (String, String) {
    if let Some((group, version)) = api_version.split_once('/') {
        (group.to_string(), version.to_string())
    } else {
        (String::new(), api_version.to_string())
    }
}

/// Simple pluralization for Kubernetes kinds
pub fn pluralize_kind(kind: &str) -> String {
    let lower = kind.to_lowercase();
    if lower.ends_with("ss") {
        format!("{}es", lower)
    } else if lower.ends_with('s') {
        lower
    } else {
        format!("{}s", lower)
    }
}

/// Build an ApiResource from apiVersion and kind
pub fn api_resource(api_version: &str, kind: &str) -> ApiResource {
    let (group, version) = parse_api_version(api_version);
    ApiResource {
        group,
        version,
        kind: kind.to_string(),
        api_version: api_version.to_string(),
        plural: pluralize_kind(kind),
    }
}

/// Whether the group belongs to the lifecycle domain (core or any
/// provider group)
pub fn is_lifecycle_group(group: &str) -> bool {
    group == CORE_GROUP || group.ends_with(&format!(".{}", CORE_GROUP))
}

/// Whether (apiVersion, kind) is the core Cluster type
pub fn is_cluster(api_version: &str, kind: &str) -> bool {
    let (group, _) = parse_api_version(api_version);
    group == CORE_GROUP && kind == "Cluster"
}

/// Whether (apiVersion, kind) is the core Machine type
pub fn is_machine(api_version: &str, kind: &str) -> bool {
    let (group, _) = parse_api_version(api_version);
    group == CORE_GROUP && kind == "Machine"
}

/// Whether (apiVersion, kind) is a core v1 Secret
pub fn is_secret(api_version: &str, kind: &str) -> bool {
    api_version == "v1" && kind == "Secret"
}

/// Whether (apiVersion, kind) is a core v1 ConfigMap
pub fn is_config_map(api_version: &str, kind: &str) -> bool {
    api_version == "v1" && kind == "ConfigMap"
}

/// Whether (apiVersion, kind) is a CustomResourceDefinition
pub fn is_crd(api_version: &str, kind: &str) -> bool {
    let (group, _) = parse_api_version(api_version);
    group == "apiextensions.k8s.io" && kind == "CustomResourceDefinition"
}

/// Whether discovery traverses a kind: every lifecycle-domain kind except
/// the inventory records, plus the fixed pair {v1 Secret, v1 ConfigMap}
pub fn is_traversable(api_version: &str, kind: &str) -> bool {
    if is_secret(api_version, kind) || is_config_map(api_version, kind) {
        return true;
    }
    let (group, _) = parse_api_version(api_version);
    is_lifecycle_group(&group) && group != INVENTORY_GROUP
}

/// Whether an object is a hub for cluster-to-cluster shared infrastructure:
/// cluster-scoped and defined by one of the lifecycle provider groups
/// (e.g. an infrastructure principal referenced by several clusters).
pub fn is_global_hierarchy(api_version: &str, kind: &str, namespace: &str) -> bool {
    if !namespace.is_empty() || is_crd(api_version, kind) {
        return false;
    }
    let (group, _) = parse_api_version(api_version);
    is_lifecycle_group(&group) && group != CORE_GROUP
}
