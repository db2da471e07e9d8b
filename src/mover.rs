//! Cluster partition migration between management clusters
//!
//! A move transfers the full object graph of one or more tenant clusters
//! from a source to a destination management cluster, preserving ownership:
//! parents are created before their children with owner references rewritten
//! to the destination UIDs, and the source is emptied in reverse order with
//! orphan propagation.
//!
//! The paused annotation on every Cluster in the batch acts as a scoped
//! lock: it is taken before the first mutation and released on every exit
//! path, at the destination on success and best-effort at the source on
//! failure.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::Utc;
use kube::api::DynamicObject;
use kube::core::TypeMeta;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::api::ObjectReference;
use crate::config::DEFAULT_FAN_OUT;
use crate::graph::{DiscoveryOptions, GraphNode, ObjectGraph};
use crate::inventory::Inventory;
use crate::proxy::{Propagation, Proxy};
use crate::{
    Error, Result, DELETE_FOR_MOVE_ANNOTATION, PAUSED_ANNOTATION, SOURCE_UID_ANNOTATION,
};

/// Options for one move invocation
#[derive(Debug, Clone)]
pub struct MoveOptions {
    /// Namespace scope for discovery; empty means all namespaces
    pub namespace: String,
    /// Cluster names to move; empty means every discovered cluster
    pub clusters: Vec<String>,
    /// Bounded fan-out for discovery list calls
    pub fan_out: usize,
}

impl Default for MoveOptions {
    fn default() -> Self {
        Self {
            namespace: String::new(),
            clusters: Vec::new(),
            fan_out: DEFAULT_FAN_OUT,
        }
    }
}

impl MoveOptions {
    /// Options from the recognised configuration keys
    pub fn from_config(config: &crate::config::Config) -> Self {
        Self {
            namespace: config.move_namespace(),
            clusters: Vec::new(),
            fan_out: config.fan_out(),
        }
    }
}

/// Result of a completed move
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MoveReport {
    /// Objects present at the destination when the move finished
    pub moved: u32,
    /// Objects deleted from the source
    pub deleted: u32,
}

/// Moves tenant cluster partitions between management clusters
pub struct ObjectMover {
    from: Arc<dyn Proxy>,
    to: Arc<dyn Proxy>,
}

impl ObjectMover {
    /// Create a mover between two proxies
    pub fn new(from: Arc<dyn Proxy>, to: Arc<dyn Proxy>) -> Self {
        Self { from, to }
    }

    /// Move the selected clusters and everything they own
    ///
    /// The batch is atomic: a shared node whose tenants are not all part of
    /// the batch aborts the move before anything is mutated. A re-run after
    /// a crash converges: objects already at the destination are recognised
    /// by their source-uid annotation and skipped, and not-found on the
    /// source delete path counts as success.
    pub async fn move_objects(
        &self,
        options: &MoveOptions,
        cancel: &CancellationToken,
    ) -> Result<MoveReport> {
        let graph = ObjectGraph::discover(
            self.from.as_ref(),
            &DiscoveryOptions {
                namespace: options.namespace.clone(),
                fan_out: options.fan_out,
            },
            cancel,
        )
        .await?;

        let batch = select_batch(&graph, &options.clusters)?;
        if batch.is_empty() {
            return Err(Error::discovery("no clusters to move"));
        }

        let move_set = collect_move_set(&graph, &batch)?;
        self.validate_destination(&move_set).await?;

        info!(
            clusters = batch.len(),
            objects = move_set.len(),
            "Moving cluster partition"
        );

        if let Err(err) = self.pause_clusters(&graph, &batch).await {
            self.unpause_source_best_effort(&graph, &batch).await;
            return Err(err);
        }

        match self.run(&graph, &batch, &move_set, cancel).await {
            Ok(report) => Ok(report),
            Err(err) => {
                self.unpause_source_best_effort(&graph, &batch).await;
                Err(err)
            }
        }
    }

    async fn run(
        &self,
        graph: &ObjectGraph,
        batch: &BTreeSet<String>,
        move_set: &[&GraphNode],
        cancel: &CancellationToken,
    ) -> Result<MoveReport> {
        self.ensure_namespaces(move_set).await?;
        let uid_map = self.create_at_destination(move_set, cancel).await?;
        let deleted = self.delete_from_source(move_set, cancel).await?;
        self.unpause_destination(graph, batch).await?;

        let report = MoveReport {
            moved: uid_map.len() as u32,
            deleted,
        };
        info!(
            moved = report.moved,
            deleted = report.deleted,
            "Move complete"
        );
        Ok(report)
    }

    /// The destination must recognise every kind the batch uses and its
    /// inventory must not hold an inconsistent management group
    async fn validate_destination(&self, move_set: &[&GraphNode]) -> Result<()> {
        let hosted: BTreeSet<(String, String)> = self
            .to
            .list_resource_kinds()
            .await?
            .into_iter()
            .map(|k| (k.api_version, k.kind))
            .collect();

        for node in move_set {
            let key = (
                node.identity.api_version.clone(),
                node.identity.kind.clone(),
            );
            if !hosted.contains(&key) {
                return Err(Error::TargetMissingProvider {
                    api_version: node.identity.api_version.clone(),
                    kind: node.identity.kind.clone(),
                });
            }
        }

        let groups = Inventory::new(self.to.clone()).management_groups().await?;
        for group in groups {
            if group.inconsistent {
                return Err(Error::validation(format!(
                    "management group {} at the destination mixes contracts; upgrade it before moving",
                    group.core.instance_name()
                )));
            }
        }

        Ok(())
    }

    async fn pause_clusters(&self, graph: &ObjectGraph, batch: &BTreeSet<String>) -> Result<()> {
        for uid in batch {
            let Some(node) = graph.get(uid) else { continue };
            let reference = node.identity.reference();
            let patch = serde_json::json!({
                "metadata": { "annotations": { PAUSED_ANNOTATION: "true" } }
            });
            self.from.patch(&reference, &patch).await?;
            log_mutation("pause", &reference, "");
        }
        Ok(())
    }

    async fn unpause_destination(
        &self,
        graph: &ObjectGraph,
        batch: &BTreeSet<String>,
    ) -> Result<()> {
        for uid in batch {
            let Some(node) = graph.get(uid) else { continue };
            let reference = node.identity.reference();
            let patch = serde_json::json!({
                "metadata": { "annotations": { PAUSED_ANNOTATION: null } }
            });
            self.to.patch(&reference, &patch).await?;
            log_mutation("unpause", &reference, "");
        }
        Ok(())
    }

    async fn unpause_source_best_effort(&self, graph: &ObjectGraph, batch: &BTreeSet<String>) {
        for uid in batch {
            let Some(node) = graph.get(uid) else { continue };
            let reference = node.identity.reference();
            let patch = serde_json::json!({
                "metadata": { "annotations": { PAUSED_ANNOTATION: null } }
            });
            match self.from.patch(&reference, &patch).await {
                Ok(()) | Err(Error::NotFound { .. }) => {}
                Err(e) => {
                    warn!(cluster = %reference.display(), error = %e, "Failed to unpause source cluster");
                }
            }
        }
    }

    /// Create every namespace the batch uses on the destination
    async fn ensure_namespaces(&self, move_set: &[&GraphNode]) -> Result<()> {
        let namespaces: BTreeSet<&str> = move_set
            .iter()
            .map(|n| n.identity.namespace.as_str())
            .filter(|ns| !ns.is_empty())
            .collect();

        for namespace in namespaces {
            let ns_obj = DynamicObject {
                types: Some(TypeMeta {
                    api_version: "v1".to_string(),
                    kind: "Namespace".to_string(),
                }),
                metadata: kube::core::ObjectMeta {
                    name: Some(namespace.to_string()),
                    ..Default::default()
                },
                data: serde_json::json!({}),
            };
            match self.to.create(&ns_obj).await {
                Ok(_) | Err(Error::AlreadyExists { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Apply the batch to the destination in topological owner order
    async fn create_at_destination(
        &self,
        move_set: &[&GraphNode],
        cancel: &CancellationToken,
    ) -> Result<BTreeMap<String, String>> {
        let mut uid_map: BTreeMap<String, String> = BTreeMap::new();

        for node in move_set {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }

            let reference = node.identity.reference();
            // Fetch fresh: the graph holds identities only, and virtual
            // nodes were never fetched at all.
            let source_obj = self.from.get(&reference).await?;
            let desired = prepare_for_destination(&source_obj, node, &uid_map)?;

            match self.to.create(&desired).await {
                Ok(created) => {
                    let new_uid = created.metadata.uid.clone().ok_or_else(|| {
                        Error::serialization("created object has no uid")
                    })?;
                    log_mutation("create", &reference, &new_uid);
                    uid_map.insert(node.identity.uid.clone(), new_uid);
                }
                Err(Error::AlreadyExists { .. }) => {
                    let existing = self.to.get(&reference).await?;
                    let new_uid = reconcile_existing(node, &desired, &existing)?;
                    debug!(object = %reference.display(), "Already at destination, skipping");
                    uid_map.insert(node.identity.uid.clone(), new_uid);
                }
                Err(e) => return Err(e),
            }
        }

        Ok(uid_map)
    }

    /// Delete the batch from the source in reverse topological order
    ///
    /// Children were already moved out, so every delete orphans its
    /// dependents. Objects are relocated, not torn down: finalizers are
    /// cleared and the delete-for-move annotation stamped first.
    async fn delete_from_source(
        &self,
        move_set: &[&GraphNode],
        cancel: &CancellationToken,
    ) -> Result<u32> {
        let mut deleted = 0u32;

        for node in move_set.iter().rev() {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }

            let reference = node.identity.reference();
            let patch = serde_json::json!({
                "metadata": {
                    "annotations": { DELETE_FOR_MOVE_ANNOTATION: "" },
                    "finalizers": null,
                }
            });
            match self.from.patch(&reference, &patch).await {
                Ok(()) => {}
                Err(Error::NotFound { .. }) => continue,
                Err(e) => {
                    warn!(object = %reference.display(), error = %e, "Failed to prepare object for deletion");
                }
            }

            match self.from.delete(&reference, Propagation::Orphan).await {
                Ok(()) => {
                    log_mutation("delete", &reference, "");
                    deleted += 1;
                }
                // A previous run already deleted it.
                Err(Error::NotFound { .. }) => {}
                Err(e) => return Err(e),
            }
        }

        Ok(deleted)
    }
}

/// Resolve which clusters form the move batch
fn select_batch(graph: &ObjectGraph, clusters: &[String]) -> Result<BTreeSet<String>> {
    if clusters.is_empty() {
        return Ok(graph
            .clusters()
            .iter()
            .map(|n| n.identity.uid.clone())
            .collect());
    }

    let all_clusters = graph.clusters();
    let mut batch = BTreeSet::new();
    for name in clusters {
        let matches: Vec<&&GraphNode> = all_clusters
            .iter()
            .filter(|n| n.identity.name == *name)
            .collect();
        match matches.as_slice() {
            [] => {
                return Err(Error::validation(format!(
                    "cluster {} not found on the source",
                    name
                )))
            }
            [node] => {
                batch.insert(node.identity.uid.clone());
            }
            _ => {
                return Err(Error::validation(format!(
                    "cluster name {} is ambiguous across namespaces; scope the move to one namespace",
                    name
                )))
            }
        }
    }
    Ok(batch)
}

/// The nodes belonging to the batch, in topological owner order
///
/// A node carrying a tenant outside the batch is shared infrastructure
/// that would be orphaned or duplicated; the move aborts.
fn collect_move_set<'a>(
    graph: &'a ObjectGraph,
    batch: &BTreeSet<String>,
) -> Result<Vec<&'a GraphNode>> {
    let order = graph.nodes_in_topological_owner_order()?;
    let mut move_set = Vec::new();

    for node in order {
        if node.tenant_clusters.iter().all(|t| !batch.contains(t)) {
            continue;
        }
        for tenant in &node.tenant_clusters {
            if !batch.contains(tenant) {
                let tenant_name = graph
                    .get(tenant)
                    .map(|t| t.identity.display())
                    .unwrap_or_else(|| tenant.clone());
                return Err(Error::SharedNodeAcrossBatches {
                    node: node.identity.display(),
                    tenant: tenant_name,
                });
            }
        }
        move_set.push(node);
    }

    Ok(move_set)
}

/// Shape a source object for creation at the destination: server
/// bookkeeping stripped, owner references rewritten to destination UIDs,
/// source UID recorded for crash recovery
fn prepare_for_destination(
    source_obj: &DynamicObject,
    node: &GraphNode,
    uid_map: &BTreeMap<String, String>,
) -> Result<DynamicObject> {
    let mut desired = source_obj.clone();

    desired.types = Some(TypeMeta {
        api_version: node.identity.api_version.clone(),
        kind: node.identity.kind.clone(),
    });
    desired.metadata.uid = None;
    desired.metadata.resource_version = None;
    desired.metadata.generation = None;
    desired.metadata.creation_timestamp = None;
    desired.metadata.deletion_timestamp = None;
    desired.metadata.managed_fields = None;
    desired.metadata.finalizers = None;
    if let Some(data) = desired.data.as_object_mut() {
        data.remove("status");
    }

    let annotations = desired.metadata.annotations.get_or_insert_with(Default::default);
    // A crashed previous run may have stamped the source object for
    // deletion already; the destination copy is not being deleted.
    annotations.remove(DELETE_FOR_MOVE_ANNOTATION);
    annotations.insert(
        SOURCE_UID_ANNOTATION.to_string(),
        node.identity.uid.clone(),
    );

    // Owner references carry the destination UID of the already-moved
    // parent; references to owners outside the move set are dropped.
    let rewritten: Vec<_> = source_obj
        .metadata
        .owner_references
        .iter()
        .flatten()
        .filter_map(|r| {
            match uid_map.get(&r.uid) {
                Some(new_uid) => {
                    let mut reference = r.clone();
                    reference.uid = new_uid.clone();
                    Some(reference)
                }
                None => {
                    debug!(
                        object = %node.identity.display(),
                        owner = %r.name,
                        "Dropping owner reference outside the move set"
                    );
                    None
                }
            }
        })
        .collect();
    desired.metadata.owner_references = if rewritten.is_empty() {
        None
    } else {
        Some(rewritten)
    };

    Ok(desired)
}

/// Decide whether an object already at the destination is ours
///
/// Ours means it carries our source UID (a previous run created it) or its
/// spec equals the desired one; anything else is a concurrent writer.
fn reconcile_existing(
    node: &GraphNode,
    desired: &DynamicObject,
    existing: &DynamicObject,
) -> Result<String> {
    let existing_uid = existing
        .metadata
        .uid
        .clone()
        .ok_or_else(|| Error::serialization("destination object has no uid"))?;

    let source_uid_matches = existing
        .metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(SOURCE_UID_ANNOTATION))
        .is_some_and(|uid| *uid == node.identity.uid);
    let spec_matches = existing.data.get("spec") == desired.data.get("spec");

    if source_uid_matches || spec_matches {
        return Ok(existing_uid);
    }

    Err(Error::ConflictAtDestination {
        kind: node.identity.kind.clone(),
        namespace: node.identity.namespace.clone(),
        name: node.identity.name.clone(),
        reason: "an object with the same name but a different spec already exists".to_string(),
    })
}

/// One line per mutation for post-hoc reconciliation
fn log_mutation(action: &str, reference: &ObjectReference, destination_uid: &str) {
    info!(
        action = action,
        kind = %reference.kind,
        namespace = %reference.namespace,
        name = %reference.name,
        destination_uid = destination_uid,
        timestamp = %Utc::now().to_rfc3339(),
        "Move mutation"
    );
}
