use std::collections::BTreeMap;

use async_trait::async_trait;
use kube::Client;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::core::{DynamicObject, GroupVersionKind};
use kube::discovery::ApiResource;
use serde_json::Value as JsonValue;
use tracing::debug;

use super::{ClusterApi, ClusterError, object_id};
use crate::render::ResourceId;

/// Cluster access through the API server.
///
/// Updates use server-side apply under a fixed field manager, so fields
/// owned by other managers are left untouched.
#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
    field_manager: String,
}

impl KubeCluster {
    pub fn new(client: Client, field_manager: impl Into<String>) -> Self {
        Self {
            client,
            field_manager: field_manager.into(),
        }
    }

    fn api(&self, api_version: &str, kind: &str, namespace: Option<&str>) -> Api<DynamicObject> {
        let (group, version) = match api_version.split_once('/') {
            Some((g, v)) => (g, v),
            None => ("", api_version),
        };
        let gvk = GroupVersionKind::gvk(group, version, kind);
        let ar = ApiResource::from_gvk(&gvk);
        match namespace {
            Some(ns) => Api::namespaced_with(self.client.clone(), ns, &ar),
            None => Api::all_with(self.client.clone(), &ar),
        }
    }

    fn api_for(&self, id: &ResourceId) -> Api<DynamicObject> {
        self.api(&id.api_version, &id.kind, id.namespace.as_deref())
    }
}

fn selector(labels: &BTreeMap<String, String>) -> String {
    labels
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",")
}

#[async_trait]
impl ClusterApi for KubeCluster {
    async fn get(&self, id: &ResourceId) -> Result<Option<DynamicObject>, ClusterError> {
        Ok(self.api_for(id).get_opt(&id.name).await?)
    }

    async fn list(
        &self,
        api_version: &str,
        kind: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<Vec<DynamicObject>, ClusterError> {
        let mut lp = ListParams::default();
        if !labels.is_empty() {
            lp = lp.labels(&selector(labels));
        }
        let list = self.api(api_version, kind, None).list(&lp).await?;
        // The list response carries types only on the envelope.
        let types = kube::core::TypeMeta {
            api_version: api_version.to_string(),
            kind: kind.to_string(),
        };
        Ok(list
            .items
            .into_iter()
            .map(|mut obj| {
                obj.types.get_or_insert_with(|| types.clone());
                obj
            })
            .collect())
    }

    async fn create(&self, obj: &DynamicObject) -> Result<DynamicObject, ClusterError> {
        let id = object_id(obj)
            .ok_or_else(|| ClusterError::Invalid("object without identity".into()))?;
        let pp = PostParams {
            field_manager: Some(self.field_manager.clone()),
            ..Default::default()
        };
        match self.api_for(&id).create(&pp, obj).await {
            Ok(created) => Ok(created),
            Err(kube::Error::Api(ae)) if ae.code == 409 => Err(ClusterError::Conflict(id)),
            Err(e) => Err(e.into()),
        }
    }

    async fn apply(&self, obj: &DynamicObject) -> Result<DynamicObject, ClusterError> {
        let id = object_id(obj)
            .ok_or_else(|| ClusterError::Invalid("object without identity".into()))?;
        let pp = PatchParams::apply(&self.field_manager).force();
        Ok(self.api_for(&id).patch(&id.name, &pp, &Patch::Apply(obj)).await?)
    }

    async fn delete(&self, id: &ResourceId) -> Result<(), ClusterError> {
        match self.api_for(id).delete(&id.name, &DeleteParams::background()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => {
                debug!(%id, "already gone");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn patch_status(&self, id: &ResourceId, status: &JsonValue) -> Result<(), ClusterError> {
        let patch = serde_json::json!({ "status": status });
        self.api_for(id)
            .patch_status(&id.name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }
}
