use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::ByteString;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

use crate::error::StoreResult;

#[cfg(feature = "kube")]
pub mod cluster;
#[cfg(feature = "memory")]
pub mod memory;

#[cfg(feature = "kube")]
pub use cluster::KubeSecretStore;
#[cfg(feature = "memory")]
pub use memory::MemorySecretStore;

/// Persisted secret as seen by the certificate layer.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StoredSecret {
    pub name: String,
    pub namespace: String,
    pub data: BTreeMap<String, Vec<u8>>,
    pub labels: BTreeMap<String, String>,
}

impl StoredSecret {
    pub fn new(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            ..Default::default()
        }
    }

    pub fn with_data(mut self, key: &str, value: impl Into<Vec<u8>>) -> Self {
        self.data.insert(key.to_string(), value.into());
        self
    }

    /// UTF-8 view of a data entry, if present and valid.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.data
            .get(key)
            .and_then(|v| std::str::from_utf8(v).ok())
    }

    pub fn from_secret(secret: &Secret) -> Self {
        let data = secret
            .data
            .as_ref()
            .map(|d| {
                d.iter()
                    .map(|(k, ByteString(v))| (k.clone(), v.clone()))
                    .collect()
            })
            .unwrap_or_default();
        Self {
            name: secret.metadata.name.clone().unwrap_or_default(),
            namespace: secret.metadata.namespace.clone().unwrap_or_default(),
            data,
            labels: secret.metadata.labels.clone().unwrap_or_default(),
        }
    }

    pub fn to_secret(&self) -> Secret {
        Secret {
            metadata: ObjectMeta {
                name: Some(self.name.clone()),
                namespace: Some(self.namespace.clone()),
                labels: (!self.labels.is_empty()).then(|| self.labels.clone()),
                ..Default::default()
            },
            type_: Some("kubernetes.io/tls".to_string()),
            data: Some(
                self.data
                    .iter()
                    .map(|(k, v)| (k.clone(), ByteString(v.clone())))
                    .collect(),
            ),
            ..Default::default()
        }
    }
}

/// Backing store for TLS secrets.
///
/// `create` must enforce create-once semantics: creating a secret whose
/// identity already exists fails with [`StoreError::AlreadyExists`]. The
/// certificate manager relies on this to elect a single signing authority
/// when several reconciliation passes race on first use.
///
/// [`StoreError::AlreadyExists`]: crate::StoreError::AlreadyExists
#[async_trait]
pub trait SecretStore: Send + Sync {
    async fn get(
        &self,
        name: &str,
        namespace: &str,
    ) -> StoreResult<Option<StoredSecret>>;

    async fn create(&self, secret: &StoredSecret) -> StoreResult<()>;
}
