//! Log storage: the log gateway, its certificates and the public gateway
//! certificate other components trust.

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::ByteString;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use tracing::{info, instrument};
use warden_pki::{KeyPair, TLS_CERT_KEY};

use super::{Feature, FeatureContext, Outcome, PassError, converge};
use crate::apply::Owner;
use crate::cluster::fetch;
use crate::config::Registry;
use crate::crd::{
    DEFAULT_NAME, FeatureStatus, LogStorage, ManagementCluster,
    ManagementClusterConnection,
};
use crate::render::{
    CertificateManagementConfig, ClusterTopology, ComponentConfig, GatewayConfig,
    PassthroughConfig,
};

#[async_trait]
impl Feature for LogStorage {
    const FEATURE: &'static str = "log-storage";

    fn status(&self) -> Option<&FeatureStatus> {
        self.status.as_ref()
    }

    async fn run_pass(ctx: &FeatureContext, obj: &Self) -> Result<Outcome, PassError> {
        run_pass(ctx, obj).await
    }
}

/// Certificate-only copy of the gateway key pair, readable by components
/// that must trust the gateway without seeing its key.
fn public_cert(kp: &KeyPair, reg: &Registry) -> Option<Secret> {
    let pem = kp.cert_pem()?;
    Some(Secret {
        metadata: ObjectMeta {
            name: Some(reg.names.gateway_public_cert.clone()),
            namespace: Some(reg.operator_namespace.clone()),
            ..Default::default()
        },
        data: Some(BTreeMap::from([(
            TLS_CERT_KEY.to_string(),
            ByteString(pem.as_bytes().to_vec()),
        )])),
        ..Default::default()
    })
}

fn public_cert_ref(reg: &Registry) -> Secret {
    Secret {
        metadata: ObjectMeta {
            name: Some(reg.names.gateway_public_cert.clone()),
            namespace: Some(reg.operator_namespace.clone()),
            ..Default::default()
        },
        ..Default::default()
    }
}

#[instrument(skip_all, fields(feature = LogStorage::FEATURE))]
pub async fn run_pass(ctx: &FeatureContext, ls: &LogStorage) -> Result<Outcome, PassError> {
    let reg = ctx.registry.as_ref();
    let installation = ctx.installation().await?;
    let license_active = ctx.feature_active(&reg.features.log_storage).await?;

    let cluster = ctx.cluster.as_ref();
    let has_mc = fetch::<ManagementCluster>(cluster, None, DEFAULT_NAME)
        .await?
        .is_some();
    let has_conn = fetch::<ManagementClusterConnection>(cluster, None, DEFAULT_NAME)
        .await?
        .is_some();
    let topology = ClusterTopology::resolve(has_mc, has_conn)?;
    let enabled = license_active && !topology.is_managed();

    let manager = ctx.certificate_manager(&installation.spec).await?;
    let platform = ctx.platform(&installation.spec).await?;

    let op_ns = reg.operator_namespace.as_str();
    let dns = manager.service_dns_names(&reg.names.gateway, &reg.names.log_storage_namespace);
    let key_pair = manager
        .get_or_create_key_pair(&reg.names.gateway_tls_secret, op_ns, &dns)
        .await?;
    let bundle = manager.create_trusted_bundle([]);
    let replicas = ls
        .spec
        .gateway_replicas
        .unwrap_or(platform.control_plane_replicas);

    let mut public = PassthroughConfig {
        component: "log-gateway-public-cert".into(),
        objects: Vec::new(),
        delete: Vec::new(),
    };
    match public_cert(&key_pair, reg) {
        Some(secret) if enabled => public.objects.push(secret.into()),
        _ => public.delete.push(public_cert_ref(reg).into()),
    }

    let keys = manager.keys_status([&key_pair]);

    let components: Vec<ComponentConfig> = vec![
        CertificateManagementConfig {
            component: format!("certificates-{}", reg.names.log_storage_namespace),
            operator_namespace: op_ns.to_string(),
            target_namespace: reg.names.log_storage_namespace.clone(),
            key_pairs: vec![key_pair.clone()],
            bundle: bundle.clone(),
            csr_service_accounts: vec![reg.names.gateway.clone()],
            remove: !enabled,
        }
        .into(),
        public.into(),
        GatewayConfig {
            platform,
            license_active,
            topology,
            replicas,
            key_pair,
            bundle,
        }
        .into(),
    ];
    let report = converge(ctx, &Owner::of(ls), &components).await?;
    info!(
        created = report.created.len(),
        updated = report.updated.len(),
        deleted = report.deleted.len(),
        ?keys,
        ?topology,
        "log storage pass done"
    );

    if !license_active {
        return Ok(Outcome::degraded(
            "Feature is not active - License does not support this feature",
        ));
    }
    Ok(Outcome::Ready)
}
