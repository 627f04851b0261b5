use std::sync::Arc;

use kube::Client;
use tokio::{task::JoinHandle, try_join};
use tracing::info;
use warden_pki::store::KubeSecretStore;

use crate::cluster::KubeCluster;
use crate::config::{OperatorConfig, Registry};
use crate::controller::{Feature, FeatureContext, run_controller};
use crate::crd::{IntrusionDetection, LogStorage, ManagementClusterConnection};

/// Context shared by every controller, backed by the API server.
pub fn build_context(client: Client, cfg: &OperatorConfig) -> Arc<FeatureContext> {
    let registry = Registry::from_config(cfg);
    let cluster = Arc::new(KubeCluster::new(client.clone(), &registry.field_manager));
    let secrets = Arc::new(KubeSecretStore::new(client));
    Arc::new(FeatureContext::new(cluster, secrets, registry))
}

/// Spawn the controller loop for one feature.
pub fn spawn_controller<K: Feature>(
    client: Client,
    ctx: Arc<FeatureContext>,
) -> JoinHandle<anyhow::Result<()>> {
    info!(feature = K::FEATURE, "starting controller");
    tokio::spawn(async move { run_controller::<K>(client, ctx).await })
}

/// Start every feature controller and wait until one of them finishes.
pub async fn run_all(client: Client, cfg: OperatorConfig) -> anyhow::Result<()> {
    let ctx = build_context(client.clone(), &cfg);

    let ids = spawn_controller::<IntrusionDetection>(client.clone(), ctx.clone());
    let logs = spawn_controller::<LogStorage>(client.clone(), ctx.clone());
    let conn = spawn_controller::<ManagementClusterConnection>(client, ctx);

    let (ids, logs, conn) = try_join!(ids, logs, conn)?;
    ids?;
    logs?;
    conn?;
    Ok(())
}
