//! The slice of the cluster API the operator needs.
//!
//! Objects travel as [`DynamicObject`]s so the apply engine handles every
//! kind the same way. [`KubeCluster`] talks to a real API server;
//! [`MemoryCluster`] backs the tests.

mod kube_api;
mod memory;
mod merge;

pub use kube_api::KubeCluster;
pub use merge::covers;
pub use memory::{MemoryCluster, Mutations, Verb};

use std::collections::BTreeMap;

use async_trait::async_trait;
use kube::core::{DynamicObject, TypeMeta};
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;

use crate::render::ResourceId;

#[derive(Debug, thiserror::Error)]
pub enum ClusterError {
    #[error("api error {code}: {message}")]
    Api { code: u16, message: String },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("{0} already exists")]
    Conflict(ResourceId),

    #[error("{0} not found")]
    NotFound(ResourceId),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid object: {0}")]
    Invalid(String),
}

impl From<kube::Error> for ClusterError {
    fn from(e: kube::Error) -> Self {
        match e {
            kube::Error::Api(ae) => ClusterError::Api {
                code: ae.code,
                message: ae.message,
            },
            other => ClusterError::Transport(other.to_string()),
        }
    }
}

#[async_trait]
pub trait ClusterApi: Send + Sync {
    async fn get(
        &self,
        id: &ResourceId,
    ) -> Result<Option<DynamicObject>, ClusterError>;

    /// Every object of a kind, across namespaces, carrying all `labels`.
    async fn list(
        &self,
        api_version: &str,
        kind: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<Vec<DynamicObject>, ClusterError>;

    /// Create; fails with [`ClusterError::Conflict`] if it already exists.
    async fn create(
        &self,
        obj: &DynamicObject,
    ) -> Result<DynamicObject, ClusterError>;

    /// Merge the fields of `obj` into the live object, leaving fields it
    /// does not mention alone.
    async fn apply(
        &self,
        obj: &DynamicObject,
    ) -> Result<DynamicObject, ClusterError>;

    /// Delete; an already absent object is not an error.
    async fn delete(&self, id: &ResourceId) -> Result<(), ClusterError>;

    async fn patch_status(
        &self,
        id: &ResourceId,
        status: &JsonValue,
    ) -> Result<(), ClusterError>;
}

/// Identity of a dynamic object, if it carries enough metadata.
pub fn object_id(obj: &DynamicObject) -> Option<ResourceId> {
    let types = obj.types.as_ref()?;
    Some(ResourceId::new(
        types.api_version.clone(),
        types.kind.clone(),
        obj.metadata.namespace.as_deref(),
        obj.metadata.name.clone()?,
    ))
}

/// Build a dynamic object from a full JSON manifest.
pub fn to_dynamic(manifest: JsonValue) -> Result<DynamicObject, ClusterError> {
    let obj: DynamicObject = serde_json::from_value(manifest)?;
    match &obj.types {
        Some(TypeMeta { api_version, kind })
            if !api_version.is_empty() && !kind.is_empty() =>
        {
            Ok(obj)
        }
        _ => Err(ClusterError::Invalid("manifest without apiVersion/kind".into())),
    }
}

/// Typed read of a single object.
pub async fn fetch<K>(
    cluster: &dyn ClusterApi,
    namespace: Option<&str>,
    name: &str,
) -> Result<Option<K>, ClusterError>
where
    K: kube::Resource<DynamicType = ()> + DeserializeOwned,
{
    let id = ResourceId::of::<K>(namespace, name);
    match cluster.get(&id).await? {
        Some(obj) => Ok(Some(parse(obj)?)),
        None => Ok(None),
    }
}

/// Typed list of every object of a kind.
pub async fn list_all<K>(cluster: &dyn ClusterApi) -> Result<Vec<K>, ClusterError>
where
    K: kube::Resource<DynamicType = ()> + DeserializeOwned,
{
    let objs = cluster
        .list(&K::api_version(&()), &K::kind(&()), &BTreeMap::new())
        .await?;
    objs.into_iter().map(parse).collect()
}

fn parse<K: DeserializeOwned>(obj: DynamicObject) -> Result<K, ClusterError> {
    Ok(serde_json::from_value(serde_json::to_value(obj)?)?)
}
