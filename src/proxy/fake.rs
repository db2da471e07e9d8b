//! In-memory proxy for tests
//!
//! Replays the contract of the real proxy against a vector of objects:
//! kinds are derived from stored CustomResourceDefinition objects the same
//! way the kube-backed proxy derives them, creates assign fake UIDs, and
//! patches apply JSON merge semantics.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use kube::api::DynamicObject;
use serde_json::Value;

use crate::api::ObjectReference;
use crate::proxy::{Propagation, Proxy, ResourceKind, ResourceScope};
use crate::{Error, Result};

/// In-memory implementation of [`Proxy`]
#[derive(Default)]
pub struct FakeProxy {
    namespace: String,
    objects: Mutex<Vec<DynamicObject>>,
    uid_counter: AtomicU64,
}

impl FakeProxy {
    /// Create an empty proxy whose credential context has no namespace
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the credential-context namespace
    pub fn with_namespace(mut self, namespace: &str) -> Self {
        self.namespace = namespace.to_string();
        self
    }

    /// Seed objects, assigning fake UIDs where missing
    pub fn with_objs(self, objs: Vec<DynamicObject>) -> Self {
        {
            let mut store = self.objects.lock().unwrap();
            for mut obj in objs {
                if obj.metadata.uid.is_none() {
                    obj.metadata.uid = Some(self.next_uid());
                }
                store.push(obj);
            }
        }
        self
    }

    /// Snapshot of all stored objects
    pub fn objects(&self) -> Vec<DynamicObject> {
        self.objects.lock().unwrap().clone()
    }

    /// Find a stored object by kind, namespace and name
    pub fn find(&self, kind: &str, namespace: &str, name: &str) -> Option<DynamicObject> {
        self.objects
            .lock()
            .unwrap()
            .iter()
            .find(|o| matches_reference(o, kind, namespace, name))
            .cloned()
    }

    /// Number of stored objects
    pub fn len(&self) -> usize {
        self.objects.lock().unwrap().len()
    }

    /// Whether the store is empty
    pub fn is_empty(&self) -> bool {
        self.objects.lock().unwrap().is_empty()
    }

    fn next_uid(&self) -> String {
        format!("fake-uid-{}", self.uid_counter.fetch_add(1, Ordering::SeqCst) + 1)
    }
}

fn matches_reference(obj: &DynamicObject, kind: &str, namespace: &str, name: &str) -> bool {
    let obj_kind = obj.types.as_ref().map(|t| t.kind.as_str()).unwrap_or("");
    let obj_ns = obj.metadata.namespace.as_deref().unwrap_or("");
    let obj_name = obj.metadata.name.as_deref().unwrap_or("");
    obj_kind == kind && obj_ns == namespace && obj_name == name
}

/// Apply an RFC 7386 JSON merge patch in place
pub fn json_merge_patch(target: &mut Value, patch: &Value) {
    match patch {
        Value::Object(patch_map) => {
            if !target.is_object() {
                *target = Value::Object(serde_json::Map::new());
            }
            let target_map = target.as_object_mut().unwrap();
            for (key, value) in patch_map {
                if value.is_null() {
                    target_map.remove(key);
                } else {
                    json_merge_patch(target_map.entry(key.clone()).or_insert(Value::Null), value);
                }
            }
        }
        other => *target = other.clone(),
    }
}

#[async_trait]
impl Proxy for FakeProxy {
    fn current_namespace(&self) -> String {
        self.namespace.clone()
    }

    async fn list_resource_kinds(&self) -> Result<Vec<ResourceKind>> {
        let store = self.objects.lock().unwrap();
        let mut kinds = Vec::new();

        for obj in store.iter() {
            let is_crd = obj
                .types
                .as_ref()
                .is_some_and(|t| t.kind == "CustomResourceDefinition");
            if !is_crd {
                continue;
            }

            let spec = &obj.data["spec"];
            let group = spec["group"].as_str().unwrap_or_default();
            let kind = spec["names"]["kind"].as_str().unwrap_or_default();
            let plural = spec["names"]["plural"].as_str().unwrap_or_default();
            let scope = if spec["scope"].as_str() == Some("Cluster") {
                ResourceScope::Cluster
            } else {
                ResourceScope::Namespaced
            };

            let storage_version = spec["versions"]
                .as_array()
                .and_then(|versions| {
                    versions
                        .iter()
                        .find(|v| v["storage"].as_bool() == Some(true))
                })
                .and_then(|v| v["name"].as_str());
            let Some(version) = storage_version else {
                continue;
            };

            kinds.push(ResourceKind::new(
                &format!("{}/{}", group, version),
                kind,
                plural,
                scope,
            ));
        }

        kinds.push(ResourceKind::secret());
        kinds.push(ResourceKind::config_map());
        Ok(kinds)
    }

    async fn list(
        &self,
        kind: &ResourceKind,
        namespace: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<Vec<DynamicObject>> {
        let store = self.objects.lock().unwrap();
        let items = store
            .iter()
            .filter(|o| {
                o.types.as_ref().is_some_and(|t| {
                    t.kind == kind.kind && t.api_version == kind.api_version
                })
            })
            .filter(|o| {
                namespace.is_empty()
                    || kind.scope == ResourceScope::Cluster
                    || o.metadata.namespace.as_deref() == Some(namespace)
            })
            .filter(|o| {
                labels.iter().all(|(k, v)| {
                    o.metadata
                        .labels
                        .as_ref()
                        .is_some_and(|l| l.get(k) == Some(v))
                })
            })
            .cloned()
            .collect();
        Ok(items)
    }

    async fn get(&self, reference: &ObjectReference) -> Result<DynamicObject> {
        self.find(&reference.kind, &reference.namespace, &reference.name)
            .ok_or_else(|| Error::not_found(reference))
    }

    async fn create(&self, obj: &DynamicObject) -> Result<DynamicObject> {
        let reference = ObjectReference::from_object(obj)
            .ok_or_else(|| Error::serialization("object is missing type meta or name"))?;

        let mut store = self.objects.lock().unwrap();
        if store
            .iter()
            .any(|o| matches_reference(o, &reference.kind, &reference.namespace, &reference.name))
        {
            return Err(Error::already_exists(&reference));
        }

        let mut created = obj.clone();
        created.metadata.uid = Some(self.next_uid());
        created.metadata.resource_version = Some("1".to_string());
        store.push(created.clone());
        Ok(created)
    }

    async fn delete(&self, reference: &ObjectReference, _propagation: Propagation) -> Result<()> {
        let mut store = self.objects.lock().unwrap();
        let before = store.len();
        store.retain(|o| {
            !matches_reference(o, &reference.kind, &reference.namespace, &reference.name)
        });
        if store.len() == before {
            return Err(Error::not_found(reference));
        }
        Ok(())
    }

    async fn patch(&self, reference: &ObjectReference, patch: &Value) -> Result<()> {
        let mut store = self.objects.lock().unwrap();
        let obj = store
            .iter_mut()
            .find(|o| matches_reference(o, &reference.kind, &reference.namespace, &reference.name))
            .ok_or_else(|| Error::not_found(reference))?;

        let mut value = serde_json::to_value(&*obj)
            .map_err(|e| Error::serialization(format!("failed to serialize object: {}", e)))?;
        json_merge_patch(&mut value, patch);
        *obj = serde_json::from_value(value)
            .map_err(|e| Error::serialization(format!("failed to apply patch: {}", e)))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;

    #[tokio::test]
    async fn test_create_assigns_uid_and_rejects_duplicates() {
        let proxy = FakeProxy::new();
        let obj = testing::dynamic_object("v1", "Secret", "ns1", "s1", None);

        let created = proxy.create(&obj).await.unwrap();
        assert!(created.metadata.uid.is_some());

        let err = proxy.create(&obj).await.unwrap_err();
        assert!(matches!(err, Error::AlreadyExists { .. }));
    }

    #[tokio::test]
    async fn test_get_and_delete_surface_not_found() {
        let proxy = FakeProxy::new();
        let reference = ObjectReference::new("v1", "Secret", "ns1", "missing");

        assert!(matches!(
            proxy.get(&reference).await,
            Err(Error::NotFound { .. })
        ));
        assert!(matches!(
            proxy.delete(&reference, Propagation::Foreground).await,
            Err(Error::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_list_filters_by_namespace_and_labels() {
        let mut labelled = testing::dynamic_object("v1", "Secret", "ns1", "s1", Some("u1"));
        labelled.metadata.labels = Some(
            [("app".to_string(), "trellis".to_string())]
                .into_iter()
                .collect(),
        );
        let proxy = FakeProxy::new().with_objs(vec![
            labelled,
            testing::dynamic_object("v1", "Secret", "ns1", "s2", Some("u2")),
            testing::dynamic_object("v1", "Secret", "ns2", "s3", Some("u3")),
        ]);

        let all = proxy
            .list(&ResourceKind::secret(), "", &BTreeMap::new())
            .await
            .unwrap();
        assert_eq!(all.len(), 3);

        let ns1 = proxy
            .list(&ResourceKind::secret(), "ns1", &BTreeMap::new())
            .await
            .unwrap();
        assert_eq!(ns1.len(), 2);

        let labels: BTreeMap<_, _> = [("app".to_string(), "trellis".to_string())]
            .into_iter()
            .collect();
        let selected = proxy
            .list(&ResourceKind::secret(), "", &labels)
            .await
            .unwrap();
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].metadata.name.as_deref(), Some("s1"));
    }

    #[tokio::test]
    async fn test_resource_kinds_use_storage_version_only() {
        let proxy = FakeProxy::new().with_objs(vec![
            // v2 is storage, v1 is served only; v1 must not be reported.
            testing::crd("foo", "Bar", "Namespaced", &[("v2", true), ("v1", false)]),
            testing::crd("foo", "Qux", "Cluster", &[("v1", true)]),
        ]);

        let kinds = proxy.list_resource_kinds().await.unwrap();
        let names: Vec<String> = kinds
            .iter()
            .map(|k| format!("{}/{}", k.api_version, k.kind))
            .collect();

        assert!(names.contains(&"foo/v2/Bar".to_string()));
        assert!(!names.contains(&"foo/v1/Bar".to_string()));
        assert!(names.contains(&"foo/v1/Qux".to_string()));
        assert!(names.contains(&"v1/Secret".to_string()));
        assert!(names.contains(&"v1/ConfigMap".to_string()));

        let qux = kinds.iter().find(|k| k.kind == "Qux").unwrap();
        assert_eq!(qux.scope, ResourceScope::Cluster);
    }

    #[tokio::test]
    async fn test_patch_applies_merge_semantics() {
        let proxy = FakeProxy::new().with_objs(vec![testing::dynamic_object(
            "v1", "Secret", "ns1", "s1", Some("u1"),
        )]);
        let reference = ObjectReference::new("v1", "Secret", "ns1", "s1");

        proxy
            .patch(
                &reference,
                &serde_json::json!({ "metadata": { "annotations": { "a": "1" } } }),
            )
            .await
            .unwrap();
        let obj = proxy.find("Secret", "ns1", "s1").unwrap();
        assert_eq!(
            obj.metadata.annotations.as_ref().unwrap().get("a"),
            Some(&"1".to_string())
        );

        // null removes a key
        proxy
            .patch(
                &reference,
                &serde_json::json!({ "metadata": { "annotations": { "a": null } } }),
            )
            .await
            .unwrap();
        let obj = proxy.find("Secret", "ns1", "s1").unwrap();
        assert!(obj
            .metadata
            .annotations
            .as_ref()
            .map_or(true, |a| !a.contains_key("a")));
    }

    #[test]
    fn test_json_merge_patch_replaces_scalars_and_arrays() {
        let mut target = serde_json::json!({ "spec": { "replicas": 1, "list": [1, 2] } });
        json_merge_patch(
            &mut target,
            &serde_json::json!({ "spec": { "replicas": 3, "list": [9] } }),
        );
        assert_eq!(target["spec"]["replicas"], 3);
        assert_eq!(target["spec"]["list"], serde_json::json!([9]));
    }
}
