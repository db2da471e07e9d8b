//! Component bundle apply/delete against a proxy
//!
//! Installs are transactional per provider: a partial apply rolls back the
//! objects created in the same call before surfacing the error. Deletes
//! select by the provider label and preserve CRDs and the namespace unless
//! explicitly included.

use std::collections::BTreeMap;
use std::sync::Arc;

use kube::api::DynamicObject;
use tracing::{debug, info, warn};

use crate::api::ObjectReference;
use crate::inventory::{Inventory, Provider};
use crate::proxy::{Propagation, Proxy, ResourceKind};
use crate::repository::Components;
use crate::{Error, Result, PROVIDER_LABEL};

/// Scope flags for a provider delete
#[derive(Debug, Clone, Copy, Default)]
pub struct DeleteOptions {
    /// Also delete the provider's namespace
    pub include_namespace: bool,
    /// Also delete the provider's CRDs
    pub include_crds: bool,
}

/// Applies rendered component bundles to one management cluster
#[derive(Clone)]
pub struct ComponentsInstaller {
    proxy: Arc<dyn Proxy>,
}

impl ComponentsInstaller {
    /// Create an installer over a proxy
    pub fn new(proxy: Arc<dyn Proxy>) -> Self {
        Self { proxy }
    }

    /// Apply a component bundle
    ///
    /// Namespaces and CRDs are created first. Per object the action is
    /// create-if-absent, otherwise patch to the desired state. A failed
    /// apply deletes the objects created by this call, in reverse order,
    /// before returning the error.
    pub async fn install(&self, components: &Components) -> Result<()> {
        info!(
            provider = %components.provider.instance_name(),
            version = %components.version,
            objects = components.objects.len(),
            "Installing provider components"
        );

        let mut objects: Vec<&DynamicObject> = components.objects.iter().collect();
        objects.sort_by_key(|obj| install_rank(obj));

        let mut created: Vec<ObjectReference> = Vec::new();
        for obj in objects {
            match self.apply_object(obj).await {
                Ok(Some(reference)) => created.push(reference),
                Ok(None) => {}
                Err(e) => {
                    warn!(
                        provider = %components.provider.instance_name(),
                        error = %e,
                        "Install failed, rolling back created objects"
                    );
                    self.rollback(&created).await;
                    return Err(e);
                }
            }
        }

        Ok(())
    }

    /// Create an object, or patch it to the desired state when it already
    /// exists; returns the reference when this call created it
    async fn apply_object(&self, obj: &DynamicObject) -> Result<Option<ObjectReference>> {
        let reference = ObjectReference::from_object(obj)
            .ok_or_else(|| Error::serialization("component object is missing type meta or name"))?;

        match self.proxy.create(obj).await {
            Ok(_) => {
                debug!(object = %reference.display(), "Created component object");
                Ok(Some(reference))
            }
            Err(Error::AlreadyExists { .. }) => {
                let desired = serde_json::to_value(obj)
                    .map_err(|e| Error::serialization(e.to_string()))?;
                self.proxy.patch(&reference, &desired).await?;
                debug!(object = %reference.display(), "Patched component object to desired state");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    async fn rollback(&self, created: &[ObjectReference]) {
        for reference in created.iter().rev() {
            if let Err(e) = self.proxy.delete(reference, Propagation::Foreground).await {
                warn!(
                    object = %reference.display(),
                    error = %e,
                    "Rollback delete failed"
                );
            }
        }
    }

    /// Delete a provider's objects, selected by the provider label
    ///
    /// Foreground deletion throughout. CRDs and the namespace are shared
    /// resources and are preserved unless the options include them.
    pub async fn delete(&self, provider: &Provider, options: &DeleteOptions) -> Result<()> {
        info!(
            provider = %provider.instance_name(),
            include_namespace = options.include_namespace,
            include_crds = options.include_crds,
            "Deleting provider components"
        );

        let labels: BTreeMap<String, String> =
            [(PROVIDER_LABEL.to_string(), provider.name.clone())]
                .into_iter()
                .collect();

        let mut kinds = self.proxy.list_resource_kinds().await?;
        if options.include_crds {
            kinds.push(ResourceKind::custom_resource_definition());
        }

        for kind in &kinds {
            let objs = self.proxy.list(kind, "", &labels).await?;
            for obj in objs {
                let reference = ObjectReference::new(
                    &kind.api_version,
                    &kind.kind,
                    obj.metadata.namespace.as_deref().unwrap_or(""),
                    obj.metadata.name.as_deref().unwrap_or(""),
                );
                match self.proxy.delete(&reference, Propagation::Foreground).await {
                    Ok(()) | Err(Error::NotFound { .. }) => {
                        debug!(object = %reference.display(), "Deleted provider object");
                    }
                    Err(e) => return Err(e),
                }
            }
        }

        if options.include_namespace {
            let reference = ObjectReference::new("v1", "Namespace", "", &provider.namespace);
            match self.proxy.delete(&reference, Propagation::Foreground).await {
                Ok(()) | Err(Error::NotFound { .. }) => {}
                Err(e) => return Err(e),
            }
        }

        Ok(())
    }
}

/// Install a bundle and record the resulting provider state in the
/// inventory
pub async fn install_and_record(
    installer: &ComponentsInstaller,
    inventory: &Inventory,
    components: &Components,
    record: &Provider,
) -> Result<()> {
    installer.install(components).await?;
    inventory.upsert(record).await
}

fn install_rank(obj: &DynamicObject) -> u8 {
    match obj.types.as_ref().map(|t| t.kind.as_str()) {
        Some("CustomResourceDefinition") => 0,
        Some("Namespace") => 1,
        _ => 2,
    }
}
