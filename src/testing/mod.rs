//! Fake objects for tests
//!
//! Builders that assemble the declarative object sets a management cluster
//! would hold for a workload cluster: the cluster itself, its infrastructure
//! backing, control plane, machine sets, machines, bootstrap configs and
//! secrets, all wired with the owner references the controllers would set.
//!
//! UIDs are deterministic (`<Kind>/<namespace>/<name>`) so owner references
//! and discovered objects line up without bookkeeping.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::DynamicObject;
use kube::core::{ObjectMeta, TypeMeta};

use crate::api::{BOOTSTRAP_GROUP, CONTROL_PLANE_GROUP, CORE_GROUP, INFRASTRUCTURE_GROUP};
use crate::inventory::{Provider, ProviderType};

/// Deterministic UID for a fixture object
pub fn uid_for(kind: &str, namespace: &str, name: &str) -> String {
    format!("{}/{}/{}", kind, namespace, name)
}

/// Bare dynamic object with type meta set
pub fn dynamic_object(
    api_version: &str,
    kind: &str,
    namespace: &str,
    name: &str,
    uid: Option<&str>,
) -> DynamicObject {
    DynamicObject {
        types: Some(TypeMeta {
            api_version: api_version.to_string(),
            kind: kind.to_string(),
        }),
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: if namespace.is_empty() {
                None
            } else {
                Some(namespace.to_string())
            },
            uid: uid.map(str::to_string),
            ..Default::default()
        },
        data: serde_json::json!({ "spec": {} }),
    }
}

/// Fixture object with the deterministic UID
pub fn object(api_version: &str, kind: &str, namespace: &str, name: &str) -> DynamicObject {
    let uid = uid_for(kind, namespace, name);
    dynamic_object(api_version, kind, namespace, name, Some(&uid))
}

/// Append an owner reference pointing at `owner`
pub fn owned_by(mut obj: DynamicObject, owner: &DynamicObject) -> DynamicObject {
    let types = owner.types.as_ref().expect("owner has type meta");
    let reference = OwnerReference {
        api_version: types.api_version.clone(),
        kind: types.kind.clone(),
        name: owner.metadata.name.clone().expect("owner has a name"),
        uid: owner.metadata.uid.clone().expect("owner has a uid"),
        ..Default::default()
    };
    obj.metadata
        .owner_references
        .get_or_insert_with(Vec::new)
        .push(reference);
    obj
}

/// CustomResourceDefinition fixture; `versions` pairs a version name with
/// its storage flag
pub fn crd(group: &str, kind: &str, scope: &str, versions: &[(&str, bool)]) -> DynamicObject {
    let plural = crate::api::pluralize_kind(kind);
    let name = format!("{}.{}", plural, group);
    let versions: Vec<serde_json::Value> = versions
        .iter()
        .map(|(version, storage)| {
            serde_json::json!({ "name": version, "served": true, "storage": storage })
        })
        .collect();

    DynamicObject {
        types: Some(TypeMeta {
            api_version: "apiextensions.k8s.io/v1".to_string(),
            kind: "CustomResourceDefinition".to_string(),
        }),
        metadata: ObjectMeta {
            name: Some(name.clone()),
            uid: Some(uid_for("CustomResourceDefinition", "", &name)),
            ..Default::default()
        },
        data: serde_json::json!({
            "spec": {
                "group": group,
                "names": { "kind": kind, "plural": plural },
                "scope": scope,
                "versions": versions,
            }
        }),
    }
}

fn core_api(version: &str) -> String {
    format!("{}/{}", CORE_GROUP, version)
}

fn infra_api(version: &str) -> String {
    format!("{}/{}", INFRASTRUCTURE_GROUP, version)
}

fn bootstrap_api(version: &str) -> String {
    format!("{}/{}", BOOTSTRAP_GROUP, version)
}

fn control_plane_api(version: &str) -> String {
    format!("{}/{}", CONTROL_PLANE_GROUP, version)
}

/// The CRDs a fully installed management cluster carries for the fixture
/// kinds, storage version v1alpha4
pub fn lifecycle_crds() -> Vec<DynamicObject> {
    vec![
        crd(CORE_GROUP, "Cluster", "Namespaced", &[("v1alpha4", true)]),
        crd(CORE_GROUP, "Machine", "Namespaced", &[("v1alpha4", true)]),
        crd(CORE_GROUP, "MachineSet", "Namespaced", &[("v1alpha4", true)]),
        crd(
            CORE_GROUP,
            "MachineDeployment",
            "Namespaced",
            &[("v1alpha4", true)],
        ),
        crd(
            INFRASTRUCTURE_GROUP,
            "DummyInfrastructureCluster",
            "Namespaced",
            &[("v1alpha4", true)],
        ),
        crd(
            INFRASTRUCTURE_GROUP,
            "DummyInfrastructureMachine",
            "Namespaced",
            &[("v1alpha4", true)],
        ),
        crd(
            INFRASTRUCTURE_GROUP,
            "DummyInfrastructureMachineTemplate",
            "Namespaced",
            &[("v1alpha4", true)],
        ),
        crd(
            INFRASTRUCTURE_GROUP,
            "DummyInfrastructurePrincipal",
            "Cluster",
            &[("v1alpha4", true)],
        ),
        crd(
            BOOTSTRAP_GROUP,
            "DummyBootstrapConfig",
            "Namespaced",
            &[("v1alpha4", true)],
        ),
        crd(
            BOOTSTRAP_GROUP,
            "DummyBootstrapConfigTemplate",
            "Namespaced",
            &[("v1alpha4", true)],
        ),
        crd(
            CONTROL_PLANE_GROUP,
            "DummyControlPlane",
            "Namespaced",
            &[("v1alpha4", true)],
        ),
    ]
}

/// Inventory record fixture
pub fn provider(
    name: &str,
    provider_type: ProviderType,
    namespace: &str,
    version: &str,
    contract: &str,
) -> Provider {
    Provider {
        name: name.to_string(),
        provider_type,
        namespace: namespace.to_string(),
        version: version.to_string(),
        watched_namespace: String::new(),
        contract: contract.to_string(),
    }
}

/// Machine fixture under a cluster, machine set or control plane
#[derive(Debug, Clone)]
pub struct FakeMachine {
    name: String,
}

impl FakeMachine {
    /// Machine with the given name
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
        }
    }

    fn objs(&self, namespace: &str, owner: &DynamicObject) -> Vec<DynamicObject> {
        let machine = owned_by(
            object(&core_api("v1alpha4"), "Machine", namespace, &self.name),
            owner,
        );
        let infra = owned_by(
            object(
                &infra_api("v1alpha4"),
                "DummyInfrastructureMachine",
                namespace,
                &self.name,
            ),
            &machine,
        );
        let bootstrap = owned_by(
            object(
                &bootstrap_api("v1alpha4"),
                "DummyBootstrapConfig",
                namespace,
                &self.name,
            ),
            &machine,
        );
        // Bootstrap data secret, owner-ref'd by the bootstrap config.
        let data_secret = owned_by(object("v1", "Secret", namespace, &self.name), &bootstrap);
        vec![machine, infra, bootstrap, data_secret]
    }
}

/// Machine set fixture under a cluster
#[derive(Debug, Clone)]
pub struct FakeMachineSet {
    name: String,
    machines: Vec<FakeMachine>,
    shared_template: Option<String>,
}

impl FakeMachineSet {
    /// Machine set with the given name
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            machines: Vec::new(),
            shared_template: None,
        }
    }

    /// Add machines owned by this machine set
    pub fn with_machines(mut self, machines: Vec<FakeMachine>) -> Self {
        self.machines = machines;
        self
    }

    /// Reference a pre-existing shared infrastructure machine template
    /// instead of a per-set one; the template gains this machine set as an
    /// additional owner.
    pub fn with_shared_template(mut self, name: &str) -> Self {
        self.shared_template = Some(name.to_string());
        self
    }

    fn objs(&self, namespace: &str, cluster: &DynamicObject) -> Vec<DynamicObject> {
        let machine_set = owned_by(
            object(&core_api("v1alpha4"), "MachineSet", namespace, &self.name),
            cluster,
        );

        let mut objs = Vec::new();
        match &self.shared_template {
            // A shared template is emitted once by the caller; the extra
            // ownership edge is merged in FakeCluster::objs.
            Some(_) => {}
            None => {
                objs.push(owned_by(
                    object(
                        &infra_api("v1alpha4"),
                        "DummyInfrastructureMachineTemplate",
                        namespace,
                        &self.name,
                    ),
                    cluster,
                ));
                objs.push(owned_by(
                    object(
                        &bootstrap_api("v1alpha4"),
                        "DummyBootstrapConfigTemplate",
                        namespace,
                        &self.name,
                    ),
                    cluster,
                ));
            }
        }

        for machine in &self.machines {
            objs.extend(machine.objs(namespace, &machine_set));
        }
        objs.insert(0, machine_set);
        objs
    }
}

/// Workload-cluster fixture: the cluster object plus the declarative
/// record the controllers build around it
#[derive(Debug, Clone)]
pub struct FakeCluster {
    namespace: String,
    name: String,
    machines: Vec<FakeMachine>,
    machine_sets: Vec<FakeMachineSet>,
    control_plane: bool,
    principal: Option<String>,
}

impl FakeCluster {
    /// Cluster in the given namespace
    pub fn new(namespace: &str, name: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            name: name.to_string(),
            machines: Vec::new(),
            machine_sets: Vec::new(),
            control_plane: false,
            principal: None,
        }
    }

    /// Add machines owned directly by the cluster
    pub fn with_machines(mut self, machines: Vec<FakeMachine>) -> Self {
        self.machines = machines;
        self
    }

    /// Add machine sets
    pub fn with_machine_sets(mut self, machine_sets: Vec<FakeMachineSet>) -> Self {
        self.machine_sets = machine_sets;
        self
    }

    /// Add a control plane (and its service-account secret)
    pub fn with_control_plane(mut self) -> Self {
        self.control_plane = true;
        self
    }

    /// Name of a cluster-scoped infrastructure principal the cluster's
    /// infrastructure hangs off; shared when several clusters use the same
    /// principal name
    pub fn with_principal(mut self, name: &str) -> Self {
        self.principal = Some(name.to_string());
        self
    }

    /// Materialise the object set
    pub fn objs(&self) -> Vec<DynamicObject> {
        let ns = &self.namespace;
        let cluster = object(&core_api("v1alpha4"), "Cluster", ns, &self.name);

        let mut infra = owned_by(
            object(
                &infra_api("v1alpha4"),
                "DummyInfrastructureCluster",
                ns,
                &self.name,
            ),
            &cluster,
        );
        let mut objs = Vec::new();

        if let Some(principal_name) = &self.principal {
            let principal = object(
                &infra_api("v1alpha4"),
                "DummyInfrastructurePrincipal",
                "",
                principal_name,
            );
            infra = owned_by(infra, &principal);
            objs.push(principal);
        }

        // The certificate-authority secret historically carries no owner
        // reference; it is attached to the cluster by naming convention.
        let ca_secret = object("v1", "Secret", ns, &format!("{}-ca", self.name));
        let kubeconfig_secret = owned_by(
            object("v1", "Secret", ns, &format!("{}-kubeconfig", self.name)),
            &cluster,
        );

        objs.push(cluster.clone());
        objs.push(infra);
        objs.push(ca_secret);
        objs.push(kubeconfig_secret);

        if self.control_plane {
            let cp_name = format!("{}-cp", self.name);
            let control_plane = owned_by(
                object(&control_plane_api("v1alpha4"), "DummyControlPlane", ns, &cp_name),
                &cluster,
            );
            let sa_secret = owned_by(
                object("v1", "Secret", ns, &format!("{}-sa", self.name)),
                &control_plane,
            );
            objs.push(control_plane);
            objs.push(sa_secret);
        }

        for machine in &self.machines {
            objs.extend(machine.objs(ns, &cluster));
        }
        for machine_set in &self.machine_sets {
            objs.extend(machine_set.objs(ns, &cluster));
        }

        objs
    }
}

/// Shared infrastructure machine template owned by objects from several
/// clusters; pass the owning objects (e.g. machine sets)
pub fn shared_machine_template(
    namespace: &str,
    name: &str,
    owners: &[&DynamicObject],
) -> DynamicObject {
    let mut template = object(
        &infra_api("v1alpha4"),
        "DummyInfrastructureMachineTemplate",
        namespace,
        name,
    );
    for owner in owners {
        template = owned_by(template, owner);
    }
    template
}

/// Deterministic fixture UID of a kind/namespace/name triple, for
/// assertions
pub fn expect_uid(kind: &str, namespace: &str, name: &str) -> String {
    uid_for(kind, namespace, name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fake_cluster_produces_wired_object_set() {
        let objs = FakeCluster::new("ns1", "c1")
            .with_machines(vec![FakeMachine::new("m1")])
            .objs();

        // cluster, infra, ca, kubeconfig + machine, infra machine,
        // bootstrap config, data secret
        assert_eq!(objs.len(), 8);

        let kubeconfig = objs
            .iter()
            .find(|o| o.metadata.name.as_deref() == Some("c1-kubeconfig"))
            .unwrap();
        let owners = kubeconfig.metadata.owner_references.as_ref().unwrap();
        assert_eq!(owners[0].uid, uid_for("Cluster", "ns1", "c1"));

        let ca = objs
            .iter()
            .find(|o| o.metadata.name.as_deref() == Some("c1-ca"))
            .unwrap();
        assert!(ca.metadata.owner_references.is_none());
    }

    #[test]
    fn test_principal_owns_the_infrastructure_cluster() {
        let objs = FakeCluster::new("ns1", "c1").with_principal("p1").objs();

        let infra = objs
            .iter()
            .find(|o| {
                o.types.as_ref().map(|t| t.kind.as_str()) == Some("DummyInfrastructureCluster")
            })
            .unwrap();
        let owners = infra.metadata.owner_references.as_ref().unwrap();
        assert!(owners
            .iter()
            .any(|r| r.uid == uid_for("DummyInfrastructurePrincipal", "", "p1")));

        let principal = objs
            .iter()
            .find(|o| {
                o.types.as_ref().map(|t| t.kind.as_str()) == Some("DummyInfrastructurePrincipal")
            })
            .unwrap();
        assert!(principal.metadata.namespace.is_none());
    }

    #[test]
    fn test_machine_set_machines_are_owned_by_the_set() {
        let objs = FakeCluster::new("ns1", "c1")
            .with_machine_sets(vec![
                FakeMachineSet::new("ms1").with_machines(vec![FakeMachine::new("m1")])
            ])
            .objs();

        let machine = objs
            .iter()
            .find(|o| {
                o.types.as_ref().map(|t| t.kind.as_str()) == Some("Machine")
                    && o.metadata.name.as_deref() == Some("m1")
            })
            .unwrap();
        let owners = machine.metadata.owner_references.as_ref().unwrap();
        assert_eq!(owners[0].uid, uid_for("MachineSet", "ns1", "ms1"));
    }
}
