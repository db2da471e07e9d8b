//! Uniform typed access to one remote API surface
//!
//! Every component of the core talks to a cluster through the [`Proxy`]
//! trait: enumerate resource kinds, list objects by namespace and label,
//! and read/write/delete individual objects. The production implementation
//! is [`KubeProxy`]; tests use the in-memory [`fake::FakeProxy`].
//!
//! Failure semantics: transient failures are retried with exponential
//! backoff up to a configured cap, not-found is surfaced verbatim, and
//! every call carries a per-call timeout.

use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{Api, DeleteParams, DynamicObject, ListParams, Patch, PatchParams, PostParams};
use kube::api::PropagationPolicy;
use kube::Client;
use tracing::debug;

use crate::api::{self, ObjectReference};
use crate::error::classify_kube;
use crate::retry::{retry_transient, RetryConfig};
use crate::{Error, Result};

#[cfg(test)]
pub mod fake;

/// Scope of a resource kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceScope {
    /// Objects live in a namespace
    Namespaced,
    /// Objects are cluster-wide
    Cluster,
}

/// One traversable resource kind on a remote API surface
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceKind {
    /// API version (e.g. "cluster-lifecycle.x-k8s.io/v1alpha4")
    pub api_version: String,
    /// Kind
    pub kind: String,
    /// Plural name used for API paths
    pub plural: String,
    /// Scope
    pub scope: ResourceScope,
}

impl ResourceKind {
    /// Create a new resource kind
    pub fn new(api_version: &str, kind: &str, plural: &str, scope: ResourceScope) -> Self {
        Self {
            api_version: api_version.to_string(),
            kind: kind.to_string(),
            plural: plural.to_string(),
            scope,
        }
    }

    /// The fixed v1 Secret kind, always traversable
    pub fn secret() -> Self {
        Self::new("v1", "Secret", "secrets", ResourceScope::Namespaced)
    }

    /// The fixed v1 ConfigMap kind, always traversable
    pub fn config_map() -> Self {
        Self::new("v1", "ConfigMap", "configmaps", ResourceScope::Namespaced)
    }

    /// The CustomResourceDefinition kind itself
    pub fn custom_resource_definition() -> Self {
        Self::new(
            "apiextensions.k8s.io/v1",
            "CustomResourceDefinition",
            "customresourcedefinitions",
            ResourceScope::Cluster,
        )
    }

    /// ApiResource for dynamic API access
    pub fn api_resource(&self) -> kube::discovery::ApiResource {
        let (group, version) = api::parse_api_version(&self.api_version);
        kube::discovery::ApiResource {
            group,
            version,
            kind: self.kind.clone(),
            api_version: self.api_version.clone(),
            plural: self.plural.clone(),
        }
    }
}

/// Deletion propagation towards dependents
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Propagation {
    /// Dependents are deleted before the owner
    Foreground,
    /// The owner is deleted immediately, dependents afterwards
    Background,
    /// Dependents are left in place
    Orphan,
}

impl Propagation {
    fn policy(self) -> PropagationPolicy {
        match self {
            Propagation::Foreground => PropagationPolicy::Foreground,
            Propagation::Background => PropagationPolicy::Background,
            Propagation::Orphan => PropagationPolicy::Orphan,
        }
    }
}

/// Uniform access to one remote API surface
#[async_trait]
pub trait Proxy: Send + Sync {
    /// Namespace of the proxy's credential context; empty means all
    fn current_namespace(&self) -> String;

    /// Resource kinds traversable on this surface: the storage version of
    /// every installed CRD plus the fixed pair {v1 Secret, v1 ConfigMap}
    async fn list_resource_kinds(&self) -> Result<Vec<ResourceKind>>;

    /// List objects of a kind; empty namespace means all, labels are
    /// AND-combined
    async fn list(
        &self,
        kind: &ResourceKind,
        namespace: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<Vec<DynamicObject>>;

    /// Get a single object; not-found is an error the caller may expect
    async fn get(&self, reference: &ObjectReference) -> Result<DynamicObject>;

    /// Create an object; the returned object carries the server-assigned
    /// UID. The object's type meta must be set.
    async fn create(&self, obj: &DynamicObject) -> Result<DynamicObject>;

    /// Delete an object with the given propagation
    async fn delete(&self, reference: &ObjectReference, propagation: Propagation) -> Result<()>;

    /// Apply a JSON merge patch to an object
    async fn patch(&self, reference: &ObjectReference, patch: &serde_json::Value) -> Result<()>;
}

/// Proxy backed by a kube [`Client`]
#[derive(Clone)]
pub struct KubeProxy {
    client: Client,
    retry: RetryConfig,
    call_timeout: Duration,
}

impl KubeProxy {
    /// Wrap a client with the default retry policy and per-call timeout
    pub fn new(client: Client) -> Self {
        Self {
            client,
            retry: RetryConfig::default(),
            call_timeout: crate::config::DEFAULT_PER_CALL_TIMEOUT,
        }
    }

    /// Override the retry policy
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Override the per-call timeout
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    /// Run one remote call with the per-call timeout and transient retry
    async fn run<T, F, Fut>(&self, operation: &str, f: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let timeout = self.call_timeout;
        retry_transient(&self.retry, operation, || {
            let fut = f();
            async move {
                match tokio::time::timeout(timeout, fut).await {
                    Ok(result) => result,
                    Err(_) => Err(Error::DeadlineExceeded(timeout)),
                }
            }
        })
        .await
    }

    fn dynamic_api(&self, reference: &ObjectReference) -> Api<DynamicObject> {
        let ar = reference.api_resource();
        if reference.namespace.is_empty() {
            Api::all_with(self.client.clone(), &ar)
        } else {
            Api::namespaced_with(self.client.clone(), &reference.namespace, &ar)
        }
    }
}

#[async_trait]
impl Proxy for KubeProxy {
    fn current_namespace(&self) -> String {
        self.client.default_namespace().to_string()
    }

    async fn list_resource_kinds(&self) -> Result<Vec<ResourceKind>> {
        let crd_api: Api<CustomResourceDefinition> = Api::all(self.client.clone());
        let crds = self
            .run("list resource kinds", || {
                let api = crd_api.clone();
                async move { api.list(&ListParams::default()).await.map_err(Error::Api) }
            })
            .await?;

        let mut kinds = Vec::new();
        for crd in crds.items {
            // Only the storage version of each CRD is traversed.
            let Some(version) = crd.spec.versions.iter().find(|v| v.storage) else {
                continue;
            };
            let scope = if crd.spec.scope == "Namespaced" {
                ResourceScope::Namespaced
            } else {
                ResourceScope::Cluster
            };
            kinds.push(ResourceKind::new(
                &format!("{}/{}", crd.spec.group, version.name),
                &crd.spec.names.kind,
                &crd.spec.names.plural,
                scope,
            ));
        }

        kinds.push(ResourceKind::secret());
        kinds.push(ResourceKind::config_map());

        debug!(kinds = kinds.len(), "Enumerated resource kinds");
        Ok(kinds)
    }

    async fn list(
        &self,
        kind: &ResourceKind,
        namespace: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<Vec<DynamicObject>> {
        let ar = kind.api_resource();
        let api: Api<DynamicObject> =
            if namespace.is_empty() || kind.scope == ResourceScope::Cluster {
                Api::all_with(self.client.clone(), &ar)
            } else {
                Api::namespaced_with(self.client.clone(), namespace, &ar)
            };

        let mut params = ListParams::default();
        if !labels.is_empty() {
            let selector = labels
                .iter()
                .map(|(k, v)| format!("{}={}", k, v))
                .collect::<Vec<_>>()
                .join(",");
            params = params.labels(&selector);
        }

        let list = self
            .run(&format!("list {}", kind.kind), || {
                let api = api.clone();
                let params = params.clone();
                async move { api.list(&params).await.map_err(Error::Api) }
            })
            .await?;

        Ok(list.items)
    }

    async fn get(&self, reference: &ObjectReference) -> Result<DynamicObject> {
        let api = self.dynamic_api(reference);
        self.run(&format!("get {}", reference.display()), || {
            let api = api.clone();
            let name = reference.name.clone();
            let reference = reference.clone();
            async move {
                api.get(&name)
                    .await
                    .map_err(|e| classify_kube(e, &reference))
            }
        })
        .await
    }

    async fn create(&self, obj: &DynamicObject) -> Result<DynamicObject> {
        let reference = ObjectReference::from_object(obj)
            .ok_or_else(|| Error::serialization("object is missing type meta or name"))?;
        let api = self.dynamic_api(&reference);
        self.run(&format!("create {}", reference.display()), || {
            let api = api.clone();
            let obj = obj.clone();
            let reference = reference.clone();
            async move {
                api.create(&PostParams::default(), &obj)
                    .await
                    .map_err(|e| classify_kube(e, &reference))
            }
        })
        .await
    }

    async fn delete(&self, reference: &ObjectReference, propagation: Propagation) -> Result<()> {
        let api = self.dynamic_api(reference);
        let params = DeleteParams {
            propagation_policy: Some(propagation.policy()),
            ..Default::default()
        };
        self.run(&format!("delete {}", reference.display()), || {
            let api = api.clone();
            let params = params.clone();
            let name = reference.name.clone();
            let reference = reference.clone();
            async move {
                api.delete(&name, &params)
                    .await
                    .map(|_| ())
                    .map_err(|e| classify_kube(e, &reference))
            }
        })
        .await
    }

    async fn patch(&self, reference: &ObjectReference, patch: &serde_json::Value) -> Result<()> {
        let api = self.dynamic_api(reference);
        self.run(&format!("patch {}", reference.display()), || {
            let api = api.clone();
            let name = reference.name.clone();
            let patch = patch.clone();
            let reference = reference.clone();
            async move {
                api.patch(&name, &PatchParams::default(), &Patch::Merge(&patch))
                    .await
                    .map(|_| ())
                    .map_err(|e| classify_kube(e, &reference))
            }
        })
        .await
    }
}
