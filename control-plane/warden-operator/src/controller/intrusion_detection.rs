//! Intrusion detection: the deep packet inspection agent and its TLS
//! material.

use async_trait::async_trait;
use tracing::{info, instrument};

use super::{Feature, FeatureContext, Outcome, PassError, converge};
use crate::apply::Owner;
use crate::cluster::list_all;
use crate::crd::{DeepPacketInspection, FeatureStatus, IntrusionDetection};
use crate::render::{CertificateManagementConfig, ComponentConfig, DpiConfig};

const DPI_RESOURCE_NAME: &str = "DeepPacketInspection";

#[async_trait]
impl Feature for IntrusionDetection {
    const FEATURE: &'static str = "intrusion-detection";

    fn status(&self) -> Option<&FeatureStatus> {
        self.status.as_ref()
    }

    async fn run_pass(ctx: &FeatureContext, obj: &Self) -> Result<Outcome, PassError> {
        run_pass(ctx, obj).await
    }
}

#[instrument(skip_all, fields(feature = IntrusionDetection::FEATURE))]
pub async fn run_pass(
    ctx: &FeatureContext,
    ids: &IntrusionDetection,
) -> Result<Outcome, PassError> {
    let reg = ctx.registry.as_ref();
    let installation = ctx.installation().await?;
    let license_active = ctx.feature_active(&reg.features.intrusion_detection).await?;

    let manager = ctx.certificate_manager(&installation.spec).await?;
    let platform = ctx.platform(&installation.spec).await?;

    let has_dpi_resource = !list_all::<DeepPacketInspection>(ctx.cluster.as_ref())
        .await?
        .is_empty();
    let enabled = license_active && has_dpi_resource;

    // Peer certificates are only a prerequisite while the agent runs.
    let op_ns = reg.operator_namespace.as_str();
    let mut peers = Vec::new();
    for name in [&reg.names.packet_capture_secret, &reg.names.prometheus_secret] {
        match manager.get_certificate(name, op_ns).await? {
            Some(cert) => peers.push(cert),
            None if enabled => return Err(PassError::waiting_for_secret(name, reg)),
            None => {}
        }
    }
    let bundle = manager.create_trusted_bundle(peers);

    let dns = manager.service_dns_names(&reg.names.dpi, &reg.names.dpi_namespace);
    let key_pair = manager
        .get_or_create_key_pair(&reg.names.dpi_tls_secret, op_ns, &dns)
        .await?;

    let keys = manager.keys_status([&key_pair]);

    let components: Vec<ComponentConfig> = vec![
        CertificateManagementConfig {
            component: format!("certificates-{}", reg.names.dpi_namespace),
            operator_namespace: op_ns.to_string(),
            target_namespace: reg.names.dpi_namespace.clone(),
            key_pairs: vec![key_pair.clone()],
            bundle: bundle.clone(),
            csr_service_accounts: vec![reg.names.dpi.clone()],
            remove: !enabled,
        }
        .into(),
        DpiConfig {
            platform,
            license_active,
            has_dpi_resource,
            key_pair,
            bundle,
            resources: ids.spec.resources_for(DPI_RESOURCE_NAME),
        }
        .into(),
    ];
    let report = converge(ctx, &Owner::of(ids), &components).await?;
    info!(
        created = report.created.len(),
        updated = report.updated.len(),
        deleted = report.deleted.len(),
        ?keys,
        "intrusion detection pass done"
    );

    if !license_active {
        return Ok(Outcome::degraded(
            "Feature is not active - License does not support this feature",
        ));
    }
    Ok(Outcome::Ready)
}
