use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use kube::core::DynamicObject;
use serde::Serialize;
use serde_json::Value as JsonValue;
use tokio::sync::RwLock;
use warden_pki::{SecretStore, StoreError, StoreResult, StoredSecret};

use super::merge::{empty_object, fix_owner_references, merge_into, remove_dropped};
use super::{ClusterApi, ClusterError, object_id, to_dynamic};
use crate::render::ResourceId;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Verb {
    Get,
    List,
    Create,
    Apply,
    Delete,
    PatchStatus,
}

/// Writes performed through [`ClusterApi`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Mutations {
    pub creates: usize,
    pub applies: usize,
    pub deletes: usize,
    pub status_patches: usize,
}

impl Mutations {
    pub fn total(&self) -> usize {
        self.creates + self.applies + self.deletes + self.status_patches
    }
}

#[derive(Default)]
struct State {
    objects: BTreeMap<ResourceId, DynamicObject>,
    /// Last configuration written through create/apply, per object.
    last_applied: BTreeMap<ResourceId, JsonValue>,
    failures: BTreeSet<(Verb, ResourceId)>,
    mutations: Mutations,
    next_uid: u64,
    version: u64,
}

impl State {
    fn check(&self, verb: Verb, id: &ResourceId) -> Result<(), ClusterError> {
        if self.failures.contains(&(verb, id.clone())) {
            return Err(ClusterError::Api {
                code: 500,
                message: format!("injected {verb:?} failure for {id}"),
            });
        }
        Ok(())
    }

    fn stamp_new(&mut self, obj: &mut DynamicObject) {
        self.next_uid += 1;
        self.version += 1;
        if obj.metadata.uid.is_none() {
            obj.metadata.uid = Some(format!("uid-{}", self.next_uid));
        }
        obj.metadata.resource_version = Some(self.version.to_string());
    }

    fn bump(&mut self, obj: &mut DynamicObject) {
        self.version += 1;
        obj.metadata.resource_version = Some(self.version.to_string());
    }
}

/// In-process cluster with mutation counters and failure injection.
///
/// Also serves as the certificate layer's secret store, so key material
/// written by the apply engine is what the next pass reads back.
#[derive(Clone, Default)]
pub struct MemoryCluster {
    state: Arc<RwLock<State>>,
}

impl MemoryCluster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store an object as if someone else had created it. Not counted.
    pub async fn insert<K: Serialize>(&self, obj: &K) -> Result<DynamicObject, ClusterError> {
        let mut obj = to_dynamic(serde_json::to_value(obj)?)?;
        let id = object_id(&obj)
            .ok_or_else(|| ClusterError::Invalid("object without name".into()))?;
        let mut state = self.state.write().await;
        state.stamp_new(&mut obj);
        state.objects.insert(id, obj.clone());
        Ok(obj)
    }

    /// Remove an object behind the operator's back. Not counted.
    pub async fn remove(&self, id: &ResourceId) -> Option<DynamicObject> {
        let mut state = self.state.write().await;
        state.last_applied.remove(id);
        state.objects.remove(id)
    }

    pub async fn object(&self, id: &ResourceId) -> Option<DynamicObject> {
        self.state.read().await.objects.get(id).cloned()
    }

    pub async fn ids(&self) -> Vec<ResourceId> {
        self.state.read().await.objects.keys().cloned().collect()
    }

    pub async fn mutations(&self) -> Mutations {
        self.state.read().await.mutations.clone()
    }

    pub async fn reset_mutations(&self) {
        self.state.write().await.mutations = Mutations::default();
    }

    /// Make every `verb` on `id` fail until cleared.
    pub async fn fail(&self, verb: Verb, id: ResourceId) {
        self.state.write().await.failures.insert((verb, id));
    }

    pub async fn clear_failures(&self) {
        self.state.write().await.failures.clear();
    }
}

fn labels_match(obj: &DynamicObject, labels: &BTreeMap<String, String>) -> bool {
    let have = obj.metadata.labels.as_ref();
    labels
        .iter()
        .all(|(k, v)| have.and_then(|l| l.get(k)) == Some(v))
}

fn require_id(obj: &DynamicObject) -> Result<ResourceId, ClusterError> {
    object_id(obj).ok_or_else(|| ClusterError::Invalid("object without identity".into()))
}

#[async_trait]
impl ClusterApi for MemoryCluster {
    async fn get(&self, id: &ResourceId) -> Result<Option<DynamicObject>, ClusterError> {
        let state = self.state.read().await;
        state.check(Verb::Get, id)?;
        Ok(state.objects.get(id).cloned())
    }

    async fn list(
        &self,
        api_version: &str,
        kind: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<Vec<DynamicObject>, ClusterError> {
        let state = self.state.read().await;
        let probe = ResourceId::new(api_version, kind, None, "");
        state.check(Verb::List, &probe)?;
        Ok(state
            .objects
            .iter()
            .filter(|(id, _)| id.api_version == api_version && id.kind == kind)
            .filter(|(_, obj)| labels_match(obj, labels))
            .map(|(_, obj)| obj.clone())
            .collect())
    }

    async fn create(&self, obj: &DynamicObject) -> Result<DynamicObject, ClusterError> {
        let id = require_id(obj)?;
        let mut state = self.state.write().await;
        state.check(Verb::Create, &id)?;
        if state.objects.contains_key(&id) {
            return Err(ClusterError::Conflict(id));
        }
        let mut obj = obj.clone();
        state.last_applied.insert(id.clone(), serde_json::to_value(&obj)?);
        state.stamp_new(&mut obj);
        state.objects.insert(id, obj.clone());
        state.mutations.creates += 1;
        Ok(obj)
    }

    async fn apply(&self, obj: &DynamicObject) -> Result<DynamicObject, ClusterError> {
        let id = require_id(obj)?;
        let mut state = self.state.write().await;
        state.check(Verb::Apply, &id)?;
        state.mutations.applies += 1;
        let desired = serde_json::to_value(obj)?;
        let last = state.last_applied.insert(id.clone(), desired.clone());

        let Some(live) = state.objects.get(&id).cloned() else {
            let mut obj = obj.clone();
            state.stamp_new(&mut obj);
            state.objects.insert(id, obj.clone());
            return Ok(obj);
        };
        let live = serde_json::to_value(&live)?;
        let mut merged = live.clone();
        if let Some(last) = &last {
            remove_dropped(&mut merged, last, &desired);
        }
        merge_into(&mut merged, &desired);
        fix_owner_references(&mut merged, &live, &desired);
        let mut merged: DynamicObject = serde_json::from_value(merged)?;
        state.bump(&mut merged);
        state.objects.insert(id, merged.clone());
        Ok(merged)
    }

    async fn delete(&self, id: &ResourceId) -> Result<(), ClusterError> {
        let mut state = self.state.write().await;
        state.check(Verb::Delete, id)?;
        state.last_applied.remove(id);
        if state.objects.remove(id).is_some() {
            state.mutations.deletes += 1;
        }
        Ok(())
    }

    async fn patch_status(&self, id: &ResourceId, status: &JsonValue) -> Result<(), ClusterError> {
        let mut state = self.state.write().await;
        state.check(Verb::PatchStatus, id)?;
        let Some(obj) = state.objects.get(id).cloned() else {
            return Err(ClusterError::NotFound(id.clone()));
        };
        let mut value = serde_json::to_value(&obj)?;
        if let Some(map) = value.as_object_mut() {
            let current = map.entry("status").or_insert_with(empty_object);
            merge_into(current, status);
        }
        let mut patched: DynamicObject = serde_json::from_value(value)?;
        state.bump(&mut patched);
        state.objects.insert(id.clone(), patched);
        state.mutations.status_patches += 1;
        Ok(())
    }
}

fn into_store(e: ClusterError) -> StoreError {
    StoreError::Backend(e.to_string())
}

#[async_trait]
impl SecretStore for MemoryCluster {
    async fn get(&self, name: &str, namespace: &str) -> StoreResult<Option<StoredSecret>> {
        let id = ResourceId::of::<Secret>(Some(namespace), name);
        let Some(obj) = self.object(&id).await else {
            return Ok(None);
        };
        let secret: Secret = serde_json::from_value(serde_json::to_value(obj)?)?;
        Ok(Some(StoredSecret::from_secret(&secret)))
    }

    async fn create(&self, secret: &StoredSecret) -> StoreResult<()> {
        let obj = to_dynamic(serde_json::to_value(secret.to_secret())?).map_err(into_store)?;
        match ClusterApi::create(self, &obj).await {
            Ok(_) => Ok(()),
            Err(ClusterError::Conflict(id)) => Err(StoreError::AlreadyExists(id.to_string())),
            Err(e) => Err(into_store(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::ConfigMap;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn config_map(data: &[(&str, &str)]) -> ConfigMap {
        ConfigMap {
            metadata: ObjectMeta {
                name: Some("cm".into()),
                namespace: Some("ns".into()),
                ..Default::default()
            },
            data: Some(
                data.iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
            ),
            ..Default::default()
        }
    }

    fn dynamic(cm: &ConfigMap) -> DynamicObject {
        to_dynamic(serde_json::to_value(cm).unwrap()).unwrap()
    }

    #[tokio::test]
    async fn create_is_exclusive_and_counted() {
        let cluster = MemoryCluster::new();
        let obj = dynamic(&config_map(&[("a", "1")]));
        let created = ClusterApi::create(&cluster, &obj).await.unwrap();
        assert!(created.metadata.uid.is_some());
        let err = ClusterApi::create(&cluster, &obj).await.unwrap_err();
        assert!(matches!(err, ClusterError::Conflict(_)));
        assert_eq!(cluster.mutations().await.creates, 1);
    }

    #[tokio::test]
    async fn apply_preserves_live_fields() {
        let cluster = MemoryCluster::new();
        let live = cluster.insert(&config_map(&[("a", "1"), ("b", "2")])).await.unwrap();
        let uid = live.metadata.uid.clone();
        let merged = cluster.apply(&dynamic(&config_map(&[("a", "3")]))).await.unwrap();
        assert_eq!(merged.metadata.uid, uid);
        assert_eq!(merged.data["data"]["a"], "3");
        assert_eq!(merged.data["data"]["b"], "2");
    }

    #[tokio::test]
    async fn injected_failures_surface_until_cleared() {
        let cluster = MemoryCluster::new();
        let id = ResourceId::of::<ConfigMap>(Some("ns"), "cm");
        cluster.fail(Verb::Create, id.clone()).await;
        let obj = dynamic(&config_map(&[]));
        assert!(ClusterApi::create(&cluster, &obj).await.is_err());
        cluster.clear_failures().await;
        assert!(ClusterApi::create(&cluster, &obj).await.is_ok());
    }

    #[tokio::test]
    async fn delete_of_absent_object_is_not_a_mutation() {
        let cluster = MemoryCluster::new();
        let id = ResourceId::of::<ConfigMap>(Some("ns"), "cm");
        cluster.delete(&id).await.unwrap();
        assert_eq!(cluster.mutations().await.total(), 0);
    }

    #[tokio::test]
    async fn secret_store_is_create_once() {
        let cluster = MemoryCluster::new();
        let secret = StoredSecret::new("ca", "ops").with_data("tls.crt", "A");
        SecretStore::create(&cluster, &secret).await.unwrap();
        let err = SecretStore::create(&cluster, &secret).await.unwrap_err();
        assert!(matches!(err, StoreError::AlreadyExists(_)));
        let got = SecretStore::get(&cluster, "ca", "ops").await.unwrap().unwrap();
        assert_eq!(got.get_str("tls.crt"), Some("A"));
    }
}
