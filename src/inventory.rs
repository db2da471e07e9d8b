//! Installed-provider registry and management groups
//!
//! The inventory is persisted on the management cluster itself as
//! declarative `Provider` records. A management group is the set of
//! providers sharing one core provider; all members of a group are expected
//! to support the same API contract at any given time.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use kube::api::DynamicObject;
use kube::core::{ObjectMeta, TypeMeta};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::api::{INVENTORY_GROUP, INVENTORY_VERSION};
use crate::proxy::{Propagation, Proxy, ResourceKind, ResourceScope};
use crate::{Error, Result, PROVIDER_LABEL};

/// Role of a provider within a management group
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProviderType {
    /// The core provider driving the group's contract
    Core,
    /// Bootstrap provider
    Bootstrap,
    /// Control-plane provider
    ControlPlane,
    /// Infrastructure provider
    Infrastructure,
}

impl ProviderType {
    /// Stable string form used in record payloads and instance names
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderType::Core => "core",
            ProviderType::Bootstrap => "bootstrap",
            ProviderType::ControlPlane => "control-plane",
            ProviderType::Infrastructure => "infrastructure",
        }
    }

    /// Upgrade ordering: the core provider goes first, infrastructure last
    pub fn upgrade_order(&self) -> u8 {
        match self {
            ProviderType::Core => 0,
            ProviderType::Bootstrap => 1,
            ProviderType::ControlPlane => 2,
            ProviderType::Infrastructure => 3,
        }
    }
}

impl fmt::Display for ProviderType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One installed provider record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Provider {
    /// Provider name (e.g. "cluster-lifecycle", "dummy")
    #[serde(rename = "providerName")]
    pub name: String,
    /// Role in the management group
    #[serde(rename = "type")]
    pub provider_type: ProviderType,
    /// Namespace the provider is installed in
    #[serde(skip)]
    pub namespace: String,
    /// Installed version (semver with a leading "v")
    pub version: String,
    /// Namespace the provider's controllers watch; empty means all
    #[serde(default)]
    pub watched_namespace: String,
    /// API contract the installed version supports
    pub contract: String,
}

impl Provider {
    /// Instance name: the unique key `(type, namespace, name)`
    pub fn instance_name(&self) -> String {
        format!("{}/{}/{}", self.provider_type, self.namespace, self.name)
    }

    /// Object name of the persisted record
    pub fn record_name(&self) -> String {
        format!("{}-{}", self.provider_type, self.name)
    }

    /// Whether this is a core provider
    pub fn is_core(&self) -> bool {
        self.provider_type == ProviderType::Core
    }

    /// Whether the watched namespaces of two providers overlap; an empty
    /// watched namespace means all namespaces
    pub fn watches_overlap(&self, other: &Provider) -> bool {
        self.watched_namespace.is_empty()
            || other.watched_namespace.is_empty()
            || self.watched_namespace == other.watched_namespace
    }
}

/// A core provider plus its co-installed non-core providers
#[derive(Debug, Clone)]
pub struct ManagementGroup {
    /// The core provider driving the group
    pub core: Provider,
    /// All members, core included
    pub providers: Vec<Provider>,
    /// Set when members disagree on the contract; a move over an
    /// inconsistent group fails, an upgrade is expected to repair it
    pub inconsistent: bool,
}

impl ManagementGroup {
    /// Find a member by instance name
    pub fn provider(&self, instance_name: &str) -> Option<&Provider> {
        self.providers
            .iter()
            .find(|p| p.instance_name() == instance_name)
    }
}

/// Resource kind of the persisted inventory records
pub fn provider_kind() -> ResourceKind {
    ResourceKind::new(
        &format!("{}/{}", INVENTORY_GROUP, INVENTORY_VERSION),
        "Provider",
        "providers",
        ResourceScope::Namespaced,
    )
}

/// Partition providers into management groups
///
/// A non-core provider is assigned to the single core provider whose
/// watched namespaces overlap its own; zero candidates is
/// [`Error::MissingCore`], more than one is [`Error::AmbiguousGroup`].
pub(crate) fn group_providers(providers: Vec<Provider>) -> Result<Vec<ManagementGroup>> {
    let cores: Vec<&Provider> = providers.iter().filter(|p| p.is_core()).collect();

    let mut members: BTreeMap<String, Vec<Provider>> = BTreeMap::new();
    for core in &cores {
        members.insert(core.instance_name(), vec![(*core).clone()]);
    }

    for provider in providers.iter().filter(|p| !p.is_core()) {
        let candidates: Vec<&&Provider> = cores
            .iter()
            .filter(|core| core.watches_overlap(provider))
            .collect();
        match candidates.as_slice() {
            [] => {
                return Err(Error::MissingCore {
                    provider: provider.instance_name(),
                })
            }
            [core] => {
                if let Some(list) = members.get_mut(&core.instance_name()) {
                    list.push(provider.clone());
                }
            }
            _ => {
                return Err(Error::AmbiguousGroup {
                    provider: provider.instance_name(),
                })
            }
        }
    }

    let groups = cores
        .iter()
        .map(|core| {
            let providers = members.remove(&core.instance_name()).unwrap_or_default();
            let inconsistent = providers.iter().any(|p| p.contract != core.contract);
            ManagementGroup {
                core: (*core).clone(),
                providers,
                inconsistent,
            }
        })
        .collect();

    Ok(groups)
}

/// Inventory client over one management cluster
#[derive(Clone)]
pub struct Inventory {
    proxy: Arc<dyn Proxy>,
}

impl Inventory {
    /// Create an inventory client
    pub fn new(proxy: Arc<dyn Proxy>) -> Self {
        Self { proxy }
    }

    /// Create the CRD backing the inventory records if absent; idempotent
    pub async fn ensure_custom_resource_definitions(&self) -> Result<()> {
        let crd = inventory_crd();
        match self.proxy.create(&crd).await {
            Ok(_) => {
                info!("Created inventory CustomResourceDefinition");
                Ok(())
            }
            Err(Error::AlreadyExists { .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// All provider records on the cluster
    pub async fn list(&self) -> Result<Vec<Provider>> {
        let objs = match self
            .proxy
            .list(&provider_kind(), "", &BTreeMap::new())
            .await
        {
            Ok(objs) => objs,
            // The inventory CRD may not be installed yet.
            Err(Error::Api(kube::Error::Api(resp))) if resp.code == 404 => Vec::new(),
            Err(e) => return Err(e),
        };

        objs.iter().map(provider_from_object).collect()
    }

    /// Insert or replace a record, keyed by instance name
    pub async fn upsert(&self, provider: &Provider) -> Result<()> {
        let obj = provider_to_object(provider);
        match self.proxy.create(&obj).await {
            Ok(_) => {
                debug!(provider = %provider.instance_name(), "Recorded provider");
                Ok(())
            }
            Err(Error::AlreadyExists { .. }) => {
                let reference = crate::api::ObjectReference::new(
                    &format!("{}/{}", INVENTORY_GROUP, INVENTORY_VERSION),
                    "Provider",
                    &provider.namespace,
                    &provider.record_name(),
                );
                let patch = serde_json::to_value(provider)
                    .map_err(|e| Error::serialization(e.to_string()))?;
                self.proxy.patch(&reference, &patch).await?;
                debug!(provider = %provider.instance_name(), "Replaced provider record");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Remove a record; absent records are not an error
    pub async fn remove(&self, provider: &Provider) -> Result<()> {
        let reference = crate::api::ObjectReference::new(
            &format!("{}/{}", INVENTORY_GROUP, INVENTORY_VERSION),
            "Provider",
            &provider.namespace,
            &provider.record_name(),
        );
        match self.proxy.delete(&reference, Propagation::Background).await {
            Ok(()) | Err(Error::NotFound { .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Partition the installed providers into management groups
    pub async fn management_groups(&self) -> Result<Vec<ManagementGroup>> {
        group_providers(self.list().await?)
    }
}

fn provider_to_object(provider: &Provider) -> DynamicObject {
    let data = serde_json::to_value(provider).unwrap_or_default();
    DynamicObject {
        types: Some(TypeMeta {
            api_version: format!("{}/{}", INVENTORY_GROUP, INVENTORY_VERSION),
            kind: "Provider".to_string(),
        }),
        metadata: ObjectMeta {
            name: Some(provider.record_name()),
            namespace: Some(provider.namespace.clone()),
            labels: Some(
                [(PROVIDER_LABEL.to_string(), provider.name.clone())]
                    .into_iter()
                    .collect(),
            ),
            ..Default::default()
        },
        data,
    }
}

fn provider_from_object(obj: &DynamicObject) -> Result<Provider> {
    let mut provider: Provider = serde_json::from_value(obj.data.clone()).map_err(|e| {
        Error::serialization(format!(
            "malformed provider record {}: {}",
            obj.metadata.name.as_deref().unwrap_or("<unnamed>"),
            e
        ))
    })?;
    provider.namespace = obj.metadata.namespace.clone().unwrap_or_default();
    Ok(provider)
}

fn inventory_crd() -> DynamicObject {
    let name = format!("providers.{}", INVENTORY_GROUP);
    DynamicObject {
        types: Some(TypeMeta {
            api_version: "apiextensions.k8s.io/v1".to_string(),
            kind: "CustomResourceDefinition".to_string(),
        }),
        metadata: ObjectMeta {
            name: Some(name),
            ..Default::default()
        },
        data: serde_json::json!({
            "spec": {
                "group": INVENTORY_GROUP,
                "names": { "kind": "Provider", "plural": "providers", "singular": "provider" },
                "scope": "Namespaced",
                "versions": [{
                    "name": INVENTORY_VERSION,
                    "served": true,
                    "storage": true,
                    "schema": {
                        "openAPIV3Schema": {
                            "type": "object",
                            "x-kubernetes-preserve-unknown-fields": true,
                        }
                    }
                }],
            }
        }),
    }
}
