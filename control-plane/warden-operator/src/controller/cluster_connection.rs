//! Managed cluster connection: the guardian tunnel agent.

use async_trait::async_trait;
use tracing::{info, instrument};

use super::{Feature, FeatureContext, Outcome, PassError, converge};
use crate::apply::Owner;
use crate::cluster::fetch;
use crate::crd::{
    DEFAULT_NAME, FeatureStatus, ManagementCluster, ManagementClusterConnection,
};
use crate::render::{CertificateManagementConfig, ComponentConfig, GuardianConfig};

#[async_trait]
impl Feature for ManagementClusterConnection {
    const FEATURE: &'static str = "cluster-connection";

    fn status(&self) -> Option<&FeatureStatus> {
        self.status.as_ref()
    }

    async fn run_pass(ctx: &FeatureContext, obj: &Self) -> Result<Outcome, PassError> {
        run_pass(ctx, obj).await
    }
}

#[instrument(skip_all, fields(feature = ManagementClusterConnection::FEATURE))]
pub async fn run_pass(
    ctx: &FeatureContext,
    conn: &ManagementClusterConnection,
) -> Result<Outcome, PassError> {
    let reg = ctx.registry.as_ref();
    let installation = ctx.installation().await?;
    let license_active = ctx.feature_active(&reg.features.multi_cluster).await?;

    let has_mc = fetch::<ManagementCluster>(ctx.cluster.as_ref(), None, DEFAULT_NAME)
        .await?
        .is_some();

    let manager = ctx.certificate_manager(&installation.spec).await?;
    let platform = ctx.platform(&installation.spec).await?;
    let bundle = manager.create_trusted_bundle([]);

    // Without a license the connection is treated as absent, which tears
    // the agent down.
    let (connection_addr, tunnel_secret) = if license_active {
        let tunnel = ctx.required_secret(&reg.names.tunnel_secret).await?;
        (Some(conn.spec.management_cluster_addr.clone()), Some(tunnel))
    } else {
        (None, None)
    };

    let components: Vec<ComponentConfig> = vec![
        CertificateManagementConfig {
            component: format!("certificates-{}", reg.names.guardian_namespace),
            operator_namespace: reg.operator_namespace.clone(),
            target_namespace: reg.names.guardian_namespace.clone(),
            key_pairs: Vec::new(),
            bundle: bundle.clone(),
            csr_service_accounts: Vec::new(),
            remove: !license_active,
        }
        .into(),
        GuardianConfig {
            platform,
            has_management_cluster: has_mc,
            connection_addr,
            tunnel_secret,
            bundle,
        }
        .into(),
    ];
    let report = converge(ctx, &Owner::of(conn), &components).await?;
    info!(
        created = report.created.len(),
        updated = report.updated.len(),
        deleted = report.deleted.len(),
        "cluster connection pass done"
    );

    if !license_active {
        return Ok(Outcome::degraded(
            "Feature is not active - License does not support this feature",
        ));
    }
    Ok(Outcome::Ready)
}
