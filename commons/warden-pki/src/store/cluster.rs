use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use kube::{
    Client,
    api::{Api, PostParams},
};
use tracing::debug;

use super::{SecretStore, StoredSecret};
use crate::error::{StoreError, StoreResult};

/// Secret store backed by cluster `Secret` objects.
///
/// Create-once is enforced by the API server: a second create of the same
/// name is rejected with 409 Conflict.
#[derive(Clone)]
pub struct KubeSecretStore {
    client: Client,
}

impl KubeSecretStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

fn into_backend(e: kube::Error) -> StoreError {
    StoreError::Backend(e.to_string())
}

#[async_trait]
impl SecretStore for KubeSecretStore {
    async fn get(
        &self,
        name: &str,
        namespace: &str,
    ) -> StoreResult<Option<StoredSecret>> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        let secret = api.get_opt(name).await.map_err(into_backend)?;
        Ok(secret.as_ref().map(StoredSecret::from_secret))
    }

    async fn create(&self, secret: &StoredSecret) -> StoreResult<()> {
        let api: Api<Secret> =
            Api::namespaced(self.client.clone(), &secret.namespace);
        match api.create(&PostParams::default(), &secret.to_secret()).await {
            Ok(_) => {
                debug!(ns = %secret.namespace, name = %secret.name, "secret created");
                Ok(())
            }
            Err(kube::Error::Api(ae)) if ae.code == 409 => {
                Err(StoreError::AlreadyExists(format!(
                    "{}/{}",
                    secret.namespace, secret.name
                )))
            }
            Err(e) => Err(into_backend(e)),
        }
    }
}
