//! Ownership graph discovery and tenancy
//!
//! The graph ingests a stream of discovered objects, reconstructs the
//! directed ownership graph from their owner references, attaches soft
//! (naming-convention) edges where explicit ones were historically never
//! set, and partitions nodes by the tenant cluster they belong to. Later
//! phases (move, upgrade validation) treat the completed graph as
//! immutable.
//!
//! Nodes are kept in an arena keyed by UID; `owners`/`softOwners` are sets
//! of UIDs resolved through the arena, so no cyclic shared-ownership
//! constructs are needed.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use futures::stream::{self, StreamExt};
use kube::api::DynamicObject;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::api::{self, ObjectIdentity};
use crate::config::DEFAULT_FAN_OUT;
use crate::proxy::{Proxy, ResourceKind, ResourceScope};
use crate::{Error, Result};

/// Secret-name suffixes that attach a secret to a cluster by naming
/// convention when no owner reference is set
pub const DEFAULT_SOFT_OWNER_SUFFIXES: [&str; 4] = ["ca", "etcd-ca", "proxy-ca", "sa"];

/// A node in the object graph: one discovered (or referenced) object
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GraphNode {
    /// Identity of the object
    pub identity: ObjectIdentity,
    /// UIDs of the parents referenced through owner references
    pub owners: BTreeSet<String>,
    /// UIDs of the parents attached by naming convention
    pub soft_owners: BTreeSet<String>,
    /// UIDs of the cluster nodes this node belongs to
    pub tenant_clusters: BTreeSet<String>,
    /// True while the node has only been seen as the target of an owner
    /// reference and never fetched directly
    pub is_virtual: bool,
    /// Cluster-scoped resource not tied to a single tenant
    pub is_global: bool,
}

impl GraphNode {
    fn observed(identity: ObjectIdentity) -> Self {
        Self {
            identity,
            owners: BTreeSet::new(),
            soft_owners: BTreeSet::new(),
            tenant_clusters: BTreeSet::new(),
            is_virtual: false,
            is_global: false,
        }
    }

    fn placeholder(identity: ObjectIdentity) -> Self {
        Self {
            is_virtual: true,
            ..Self::observed(identity)
        }
    }

    /// Both explicit and soft owners
    pub fn all_owners(&self) -> BTreeSet<String> {
        self.owners.union(&self.soft_owners).cloned().collect()
    }

    /// Whether this is the core Cluster type
    pub fn is_cluster(&self) -> bool {
        api::is_cluster(&self.identity.api_version, &self.identity.kind)
    }

    /// Whether this is the core Machine type
    pub fn is_machine(&self) -> bool {
        api::is_machine(&self.identity.api_version, &self.identity.kind)
    }

    /// Whether this is a v1 Secret
    pub fn is_secret(&self) -> bool {
        api::is_secret(&self.identity.api_version, &self.identity.kind)
    }

    /// Whether this is a v1 ConfigMap
    pub fn is_config_map(&self) -> bool {
        api::is_config_map(&self.identity.api_version, &self.identity.kind)
    }

    /// Whether this is a CustomResourceDefinition
    pub fn is_crd(&self) -> bool {
        api::is_crd(&self.identity.api_version, &self.identity.kind)
    }

    /// Whether this node is a hub for cluster-to-cluster shared
    /// infrastructure
    pub fn is_global_hierarchy(&self) -> bool {
        api::is_global_hierarchy(
            &self.identity.api_version,
            &self.identity.kind,
            &self.identity.namespace,
        )
    }

    /// Whether more than one tenant cluster references this node
    pub fn is_shared(&self) -> bool {
        self.tenant_clusters.len() > 1
    }
}

/// Options for one discovery sweep
#[derive(Debug, Clone)]
pub struct DiscoveryOptions {
    /// Namespace scope; empty means all namespaces
    pub namespace: String,
    /// Bounded fan-out for the per-kind list calls
    pub fan_out: usize,
}

impl Default for DiscoveryOptions {
    fn default() -> Self {
        Self {
            namespace: String::new(),
            fan_out: DEFAULT_FAN_OUT,
        }
    }
}

impl DiscoveryOptions {
    /// Options from the recognised configuration keys
    pub fn from_config(config: &crate::config::Config) -> Self {
        Self {
            namespace: config.discovery_namespace(),
            fan_out: config.fan_out(),
        }
    }
}

/// The ownership graph of one discovery sweep
#[derive(Debug, Clone)]
pub struct ObjectGraph {
    nodes: BTreeMap<String, GraphNode>,
    soft_owner_suffixes: Vec<String>,
}

impl Default for ObjectGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl ObjectGraph {
    /// Empty graph with the default soft-ownership suffix table
    pub fn new() -> Self {
        Self {
            nodes: BTreeMap::new(),
            soft_owner_suffixes: DEFAULT_SOFT_OWNER_SUFFIXES
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }

    /// Replace the soft-ownership suffix table
    pub fn with_soft_owner_suffixes(mut self, suffixes: Vec<String>) -> Self {
        self.soft_owner_suffixes = suffixes;
        self
    }

    /// Run one full discovery sweep against a proxy and return the
    /// completed graph
    ///
    /// Lists every traversable kind with a bounded fan-out; results are
    /// reduced into the graph in kind order, so the graph is deterministic
    /// with respect to the kind list rather than the wall-clock order of
    /// replies. A failed list aborts the sweep; no half-built graph is
    /// returned.
    pub async fn discover(
        proxy: &dyn Proxy,
        options: &DiscoveryOptions,
        cancel: &CancellationToken,
    ) -> Result<Self> {
        let kinds: Vec<ResourceKind> = proxy
            .list_resource_kinds()
            .await?
            .into_iter()
            .filter(|k| api::is_traversable(&k.api_version, &k.kind))
            .collect();

        let namespace = options.namespace.clone();
        let fan_out = options.fan_out.max(1);

        let mut results = stream::iter(kinds.into_iter().map(|kind| {
            let namespace = namespace.clone();
            async move {
                let objs = proxy.list(&kind, &namespace, &BTreeMap::new()).await;
                (kind, objs)
            }
        }))
        .buffered(fan_out);

        let mut graph = Self::new();
        while let Some((kind, objs)) = results.next().await {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            let objs = objs.map_err(|e| {
                Error::discovery(format!("failed to list {}: {}", kind.kind, e))
            })?;
            debug!(kind = %kind.kind, objects = objs.len(), "Discovered objects");
            for obj in &objs {
                graph.add_object(obj, &kind)?;
            }
        }

        graph.set_soft_ownership();
        graph.set_cluster_tenants();
        graph.set_cluster_principal_tenants();

        info!(objects = graph.len(), "Object graph discovery complete");
        Ok(graph)
    }

    /// Ingest one discovered object
    ///
    /// Promotes a matching virtual placeholder, otherwise inserts a new
    /// node, then records one owner edge per owner reference, creating
    /// virtual placeholders for owners not yet observed.
    pub fn add_object(&mut self, obj: &DynamicObject, kind: &ResourceKind) -> Result<()> {
        let name = obj
            .metadata
            .name
            .clone()
            .ok_or_else(|| Error::discovery(format!("unnamed {} object", kind.kind)))?;
        let uid = obj
            .metadata
            .uid
            .clone()
            .ok_or_else(|| Error::discovery(format!("{} {} has no uid", kind.kind, name)))?;
        let namespace = if kind.scope == ResourceScope::Cluster {
            String::new()
        } else {
            obj.metadata.namespace.clone().unwrap_or_default()
        };
        let identity =
            ObjectIdentity::new(&kind.api_version, &kind.kind, &namespace, &name, &uid);

        // A placeholder with this reference but another UID means some owner
        // reference points at an object the server no longer knows.
        for (existing_uid, node) in &self.nodes {
            if *existing_uid != uid
                && node.is_virtual
                && node.identity.kind == identity.kind
                && node.identity.namespace == identity.namespace
                && node.identity.name == identity.name
            {
                return Err(Error::OwnerIdentityMismatch(format!(
                    "{} observed with UID {} but referenced with UID {}",
                    identity.display(),
                    uid,
                    existing_uid
                )));
            }
        }

        let owner_refs: Vec<_> = obj
            .metadata
            .owner_references
            .clone()
            .unwrap_or_default();

        // An owner reference whose kind/name disagree with the node already
        // recorded under its UID breaks the graph invariant.
        for reference in &owner_refs {
            if let Some(owner) = self.nodes.get(&reference.uid) {
                if owner.identity.kind != reference.kind || owner.identity.name != reference.name {
                    return Err(Error::OwnerIdentityMismatch(format!(
                        "owner reference of {} names {} {} under UID {}, which belongs to {}",
                        identity.display(),
                        reference.kind,
                        reference.name,
                        reference.uid,
                        owner.identity.display()
                    )));
                }
            }
        }

        match self.nodes.get_mut(&uid) {
            Some(node) => {
                // Promotion: the node was first seen through an owner
                // reference; reconcile its attributes with the observation.
                node.identity = identity;
                node.is_virtual = false;
            }
            None => {
                self.nodes.insert(uid.clone(), GraphNode::observed(identity));
            }
        }

        for reference in &owner_refs {
            self.nodes
                .entry(reference.uid.clone())
                .or_insert_with(|| {
                    // Owner references carry no namespace; assume the
                    // child's, reconciled if the owner is observed later.
                    GraphNode::placeholder(ObjectIdentity::new(
                        &reference.api_version,
                        &reference.kind,
                        &namespace,
                        &reference.name,
                        &reference.uid,
                    ))
                });
            if let Some(node) = self.nodes.get_mut(&uid) {
                node.owners.insert(reference.uid.clone());
            }
        }

        Ok(())
    }

    /// Attach soft owner edges by naming convention
    ///
    /// A secret named `<clusterName>-<suffix>` with no explicit owner is
    /// soft-owned by the cluster of that name in the same namespace.
    /// Matching is greedy on the longest cluster name.
    pub fn set_soft_ownership(&mut self) {
        let mut clusters: Vec<(String, String, String)> = self
            .nodes
            .values()
            .filter(|n| n.is_cluster())
            .map(|n| {
                (
                    n.identity.uid.clone(),
                    n.identity.namespace.clone(),
                    n.identity.name.clone(),
                )
            })
            .collect();
        // Longest cluster name first, so `foo-bar` claims `foo-bar-ca`
        // before `foo` can.
        clusters.sort_by(|a, b| b.2.len().cmp(&a.2.len()).then_with(|| a.2.cmp(&b.2)));

        let mut additions: Vec<(String, String)> = Vec::new();
        for secret in self.nodes.values().filter(|n| n.is_secret()) {
            if !secret.owners.is_empty() {
                continue;
            }
            for (cluster_uid, cluster_ns, cluster_name) in &clusters {
                if *cluster_ns != secret.identity.namespace {
                    continue;
                }
                let matched = self
                    .soft_owner_suffixes
                    .iter()
                    .any(|suffix| secret.identity.name == format!("{}-{}", cluster_name, suffix));
                if matched {
                    additions.push((secret.identity.uid.clone(), cluster_uid.clone()));
                    break;
                }
            }
        }

        for (secret_uid, cluster_uid) in additions {
            if let Some(node) = self.nodes.get_mut(&secret_uid) {
                node.soft_owners.insert(cluster_uid);
            }
        }
    }

    /// Propagate each cluster to its descendants as a tenant
    ///
    /// Breadth-first over the reverse edges (children through owners and
    /// soft owners). A descendant reached from several clusters keeps them
    /// all: it is a shared node. Orphans keep an empty tenant set.
    pub fn set_cluster_tenants(&mut self) {
        let children = self.reverse_adjacency();
        let cluster_uids: Vec<String> = self
            .nodes
            .values()
            .filter(|n| n.is_cluster())
            .map(|n| n.identity.uid.clone())
            .collect();

        for cluster_uid in cluster_uids {
            let mut queue = VecDeque::from([cluster_uid.clone()]);
            let mut visited: BTreeSet<String> = BTreeSet::new();
            while let Some(uid) = queue.pop_front() {
                if !visited.insert(uid.clone()) {
                    continue;
                }
                if let Some(node) = self.nodes.get_mut(&uid) {
                    node.tenant_clusters.insert(cluster_uid.clone());
                }
                if let Some(next) = children.get(&uid) {
                    queue.extend(next.iter().cloned());
                }
            }
        }
    }

    /// Tag global-hierarchy hubs with the union of their direct
    /// dependents' tenants
    pub fn set_cluster_principal_tenants(&mut self) {
        let children = self.reverse_adjacency();
        let hub_uids: Vec<String> = self
            .nodes
            .values()
            .filter(|n| n.is_global_hierarchy())
            .map(|n| n.identity.uid.clone())
            .collect();

        for hub_uid in hub_uids {
            let mut tenants: BTreeSet<String> = BTreeSet::new();
            for dependent in children.get(&hub_uid).into_iter().flatten() {
                if let Some(node) = self.nodes.get(dependent) {
                    tenants.extend(node.tenant_clusters.iter().cloned());
                }
            }
            if let Some(node) = self.nodes.get_mut(&hub_uid) {
                node.is_global = tenants.len() != 1;
                node.tenant_clusters = tenants;
            }
        }
    }

    /// All cluster nodes
    pub fn clusters(&self) -> Vec<&GraphNode> {
        self.nodes.values().filter(|n| n.is_cluster()).collect()
    }

    /// All secret nodes
    pub fn secrets(&self) -> Vec<&GraphNode> {
        self.nodes.values().filter(|n| n.is_secret()).collect()
    }

    /// Node by UID
    pub fn get(&self, uid: &str) -> Option<&GraphNode> {
        self.nodes.get(uid)
    }

    /// All nodes, keyed by UID
    pub fn nodes(&self) -> &BTreeMap<String, GraphNode> {
        &self.nodes
    }

    /// Number of nodes
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the graph is empty
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Group clusters that share at least one node; every set must move
    /// atomically
    pub fn clusters_by_tenant_set(&self) -> Vec<BTreeSet<String>> {
        let mut partition: BTreeMap<String, String> = self
            .nodes
            .values()
            .filter(|n| n.is_cluster())
            .map(|n| (n.identity.uid.clone(), n.identity.uid.clone()))
            .collect();

        fn root(partition: &BTreeMap<String, String>, uid: &str) -> String {
            let mut current = uid.to_string();
            while let Some(parent) = partition.get(&current) {
                if *parent == current {
                    break;
                }
                current = parent.clone();
            }
            current
        }

        for node in self.nodes.values() {
            let tenants: Vec<&String> = node.tenant_clusters.iter().collect();
            for pair in tenants.windows(2) {
                let a = root(&partition, pair[0]);
                let b = root(&partition, pair[1]);
                if a != b {
                    partition.insert(a, b);
                }
            }
        }

        let mut sets: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for uid in partition.keys().cloned().collect::<Vec<_>>() {
            let r = root(&partition, &uid);
            sets.entry(r).or_default().insert(uid);
        }
        sets.into_values().collect()
    }

    /// Stable total order where every parent precedes its children, both
    /// explicit and soft edges considered; equal depth is broken by
    /// `(namespace, kind, name)` for reproducibility
    ///
    /// Ownership cycles are forbidden in the source domain; detecting one
    /// aborts rather than looping.
    pub fn nodes_in_topological_owner_order(&self) -> Result<Vec<&GraphNode>> {
        let mut placed: BTreeSet<String> = BTreeSet::new();
        let mut order: Vec<String> = Vec::new();

        while placed.len() < self.nodes.len() {
            let mut round: Vec<&GraphNode> = self
                .nodes
                .values()
                .filter(|n| !placed.contains(&n.identity.uid))
                .filter(|n| {
                    n.all_owners()
                        .iter()
                        .all(|owner| placed.contains(owner) || !self.nodes.contains_key(owner))
                })
                .collect();

            if round.is_empty() {
                let stuck: Vec<String> = self
                    .nodes
                    .values()
                    .filter(|n| !placed.contains(&n.identity.uid))
                    .map(|n| n.identity.display())
                    .collect();
                return Err(Error::OwnerIdentityMismatch(format!(
                    "ownership cycle among: {}",
                    stuck.join(", ")
                )));
            }

            round.sort_by(|a, b| {
                (&a.identity.namespace, &a.identity.kind, &a.identity.name).cmp(&(
                    &b.identity.namespace,
                    &b.identity.kind,
                    &b.identity.name,
                ))
            });
            for node in round {
                placed.insert(node.identity.uid.clone());
                order.push(node.identity.uid.clone());
            }
        }

        Ok(order.iter().filter_map(|uid| self.nodes.get(uid)).collect())
    }

    /// Parent UID -> children UIDs over owners and soft owners
    fn reverse_adjacency(&self) -> BTreeMap<String, Vec<String>> {
        let mut children: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for node in self.nodes.values() {
            for owner in node.all_owners() {
                children
                    .entry(owner)
                    .or_default()
                    .push(node.identity.uid.clone());
            }
        }
        children
    }
}
