use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use super::{SecretStore, StoredSecret};
use crate::error::{StoreError, StoreResult};

type MemoryStore = Arc<RwLock<HashMap<(String, String), StoredSecret>>>;

/// Process-local secret store. Cloning shares the underlying map.
#[derive(Clone, Default)]
pub struct MemorySecretStore {
    store: MemoryStore,
}

impl MemorySecretStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrite (or insert) a secret, bypassing create-once semantics.
    pub async fn put(&self, secret: StoredSecret) {
        let mut store = self.store.write().await;
        store.insert(
            (secret.namespace.clone(), secret.name.clone()),
            secret,
        );
    }

    pub async fn remove(&self, name: &str, namespace: &str) {
        let mut store = self.store.write().await;
        store.remove(&(namespace.to_string(), name.to_string()));
    }

    pub async fn len(&self) -> usize {
        self.store.read().await.len()
    }
}

#[async_trait]
impl SecretStore for MemorySecretStore {
    async fn get(
        &self,
        name: &str,
        namespace: &str,
    ) -> StoreResult<Option<StoredSecret>> {
        let store = self.store.read().await;
        Ok(store
            .get(&(namespace.to_string(), name.to_string()))
            .cloned())
    }

    async fn create(&self, secret: &StoredSecret) -> StoreResult<()> {
        let mut store = self.store.write().await;
        let key = (secret.namespace.clone(), secret.name.clone());
        if store.contains_key(&key) {
            return Err(StoreError::AlreadyExists(format!(
                "{}/{}",
                secret.namespace, secret.name
            )));
        }
        store.insert(key, secret.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_is_create_once() {
        let store = MemorySecretStore::new();
        let s = StoredSecret::new("ca", "ops").with_data("tls.crt", "a");
        store.create(&s).await.unwrap();
        let again = StoredSecret::new("ca", "ops").with_data("tls.crt", "b");
        let err = store.create(&again).await.unwrap_err();
        assert!(matches!(err, StoreError::AlreadyExists(_)));
        let got = store.get("ca", "ops").await.unwrap().unwrap();
        assert_eq!(got.get_str("tls.crt"), Some("a"));
    }

    #[tokio::test]
    async fn get_missing_returns_none() {
        let store = MemorySecretStore::new();
        assert!(store.get("nope", "ops").await.unwrap().is_none());
    }
}
