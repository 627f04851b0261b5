//! Per-feature controller drivers.
//!
//! A pass gathers inputs from the cluster, builds a fully resolved
//! configuration for every component of the feature, renders all of them
//! and only then hands the union to the apply engine. Anything that keeps a
//! pass from converging surfaces as a [`PassError`] and maps onto an
//! [`Outcome`]; nothing is retried inside a pass.

pub mod cluster_connection;
pub mod intrusion_detection;
pub mod log_storage;
pub mod status;

use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures_util::StreamExt;
use k8s_openapi::api::core::v1::Secret;
use kube::runtime::reflector::ObjectRef;
use kube::runtime::{Controller, controller::Action, watcher::Config};
use kube::{Api, Client, ResourceExt};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, error, info, instrument, warn};
use warden_pki::{
    CertificateManagement, CertificateManager, PkiError, SecretStore,
};

use crate::apply::{ApplyEngine, ApplyError, ApplyReport, Owner, Rendered};
use crate::cluster::{ClusterApi, ClusterError, fetch};
use crate::config::Registry;
use crate::crd::{
    DEFAULT_NAME, FeatureStatus, Installation, InstallationSpec, LicenseKey,
};
use crate::render::{ComponentConfig, Platform, RenderError};

/// How a pass ended, as reported to the status aggregator.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outcome {
    Ready,
    Degraded { reason: String },
    RetryAfter { after: Duration, reason: String },
}

impl Outcome {
    pub fn degraded(reason: impl Into<String>) -> Self {
        Outcome::Degraded {
            reason: reason.into(),
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, Outcome::Ready)
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            Outcome::Ready => None,
            Outcome::Degraded { reason } | Outcome::RetryAfter { reason, .. } => {
                Some(reason.as_str())
            }
        }
    }

    /// When to run the next pass. Converged and degraded features fall
    /// back to the periodic resync; new events always come first.
    pub fn requeue_after(&self, reg: &Registry) -> Duration {
        match self {
            Outcome::RetryAfter { after, .. } => *after,
            Outcome::Ready | Outcome::Degraded { .. } => reg.retry.resync,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PassError {
    /// A prerequisite is missing; try again later.
    #[error("{reason}")]
    NotReady { reason: String, after: Duration },

    #[error("invalid configuration: {0}")]
    InvalidConfig(#[from] RenderError),

    #[error("certificate authority: {0}")]
    Authority(#[from] PkiError),

    #[error(transparent)]
    Apply(#[from] ApplyError),

    #[error("cluster client: {0}")]
    Client(#[from] ClusterError),
}

impl PassError {
    pub fn not_ready(reason: impl Into<String>, after: Duration) -> Self {
        PassError::NotReady {
            reason: reason.into(),
            after,
        }
    }

    pub fn waiting_for_secret(name: &str, reg: &Registry) -> Self {
        Self::not_ready(
            format!("Waiting for secret '{name}' to become available"),
            reg.retry.not_ready,
        )
    }

    pub fn outcome(&self, reg: &Registry) -> Outcome {
        let retry = |after: Duration| Outcome::RetryAfter {
            after,
            reason: self.to_string(),
        };
        match self {
            PassError::NotReady { reason, after } => Outcome::RetryAfter {
                after: *after,
                reason: reason.clone(),
            },
            PassError::InvalidConfig(_) => Outcome::degraded(self.to_string()),
            PassError::Authority(e) if e.is_transport() => retry(reg.retry.apply),
            PassError::Authority(_) => Outcome::degraded(self.to_string()),
            PassError::Apply(ApplyError::InvalidRender(_)) => {
                Outcome::degraded(self.to_string())
            }
            PassError::Apply(ApplyError::Batch { .. }) => retry(reg.retry.apply),
            PassError::Client(_) => retry(reg.retry.apply),
        }
    }
}

/// Everything a pass needs; shared by all passes of all features.
#[derive(Clone)]
pub struct FeatureContext {
    pub cluster: Arc<dyn ClusterApi>,
    pub secrets: Arc<dyn SecretStore>,
    pub registry: Arc<Registry>,
    pub engine: ApplyEngine,
}

impl FeatureContext {
    pub fn new(
        cluster: Arc<dyn ClusterApi>,
        secrets: Arc<dyn SecretStore>,
        registry: Registry,
    ) -> Self {
        let registry = Arc::new(registry);
        let engine = ApplyEngine::new(cluster.clone(), registry.clone());
        Self {
            cluster,
            secrets,
            registry,
            engine,
        }
    }

    pub async fn installation(&self) -> Result<Installation, PassError> {
        fetch::<Installation>(self.cluster.as_ref(), None, DEFAULT_NAME)
            .await?
            .ok_or_else(|| {
                PassError::not_ready(
                    "Waiting for Installation to become available",
                    self.registry.retry.not_ready,
                )
            })
    }

    pub async fn license(&self) -> Result<LicenseKey, PassError> {
        fetch::<LicenseKey>(self.cluster.as_ref(), None, DEFAULT_NAME)
            .await?
            .ok_or_else(|| {
                PassError::not_ready("License not found", self.registry.retry.license)
            })
    }

    pub async fn feature_active(&self, feature: &str) -> Result<bool, PassError> {
        let license = self.license().await?;
        Ok(license.spec.is_feature_active(feature, Utc::now()))
    }

    /// Secret in the operator namespace that must exist before the pass
    /// can go on.
    pub async fn required_secret(&self, name: &str) -> Result<Secret, PassError> {
        fetch::<Secret>(
            self.cluster.as_ref(),
            Some(&self.registry.operator_namespace),
            name,
        )
        .await?
        .ok_or_else(|| PassError::waiting_for_secret(name, &self.registry))
    }

    /// Installation-wide render inputs, with pull secrets resolved.
    pub async fn platform(&self, spec: &InstallationSpec) -> Result<Platform, PassError> {
        let mut pull_secrets = Vec::new();
        for name in spec.image_pull_secrets.iter().flatten() {
            pull_secrets.push(self.required_secret(name).await?);
        }
        Ok(Platform::from_installation(
            spec,
            self.registry.provider_override.as_deref(),
            pull_secrets,
        ))
    }

    pub async fn certificate_manager(
        &self,
        spec: &InstallationSpec,
    ) -> Result<CertificateManager, PassError> {
        let mut settings = self.registry.manager_settings();
        settings.certificate_management =
            spec.certificate_management.as_ref().map(|cm| CertificateManagement {
                ca_cert_pem: cm.ca_cert.clone(),
                signer_name: cm.signer_name.clone(),
            });
        Ok(CertificateManager::create(self.secrets.clone(), settings).await?)
    }
}

/// Render every component, then apply the union in one batch.
///
/// A render failure aborts before anything is written. A batch that does
/// not converge is an error; the caller re-runs the whole pass.
#[instrument(skip_all, fields(owner = %owner.name, kind = %owner.kind))]
pub async fn converge(
    ctx: &FeatureContext,
    owner: &Owner,
    components: &[ComponentConfig],
) -> Result<ApplyReport, PassError> {
    let rendered = components
        .iter()
        .map(|c| {
            Ok(Rendered {
                component: c.component().to_string(),
                result: c.render(&ctx.registry)?,
            })
        })
        .collect::<Result<Vec<_>, RenderError>>()?;
    let report = ctx.engine.apply(owner, &rendered).await?;
    Ok(report.into_result()?)
}

/// A primary resource driven by one controller.
#[async_trait]
pub trait Feature:
    kube::Resource<DynamicType = ()>
    + Clone
    + Debug
    + Serialize
    + DeserializeOwned
    + Send
    + Sync
    + 'static
{
    /// Name used in logs.
    const FEATURE: &'static str;

    fn status(&self) -> Option<&FeatureStatus>;

    async fn run_pass(ctx: &FeatureContext, obj: &Self) -> Result<Outcome, PassError>;
}

/// One full pass plus status reporting.
pub async fn reconcile_once<K: Feature>(
    ctx: &FeatureContext,
    obj: &K,
) -> Result<Outcome, ClusterError> {
    let outcome = match K::run_pass(ctx, obj).await {
        Ok(outcome) => outcome,
        Err(e) => {
            warn!(feature = K::FEATURE, error = %e, "pass did not converge");
            e.outcome(&ctx.registry)
        }
    };
    status::report(ctx, obj, &outcome).await?;
    Ok(outcome)
}

#[derive(thiserror::Error, Debug)]
pub enum ReconcileErr {
    #[error("internal error: {0}")]
    Internal(String),
}

fn into_internal<E: std::fmt::Display>(e: E) -> ReconcileErr {
    ReconcileErr::Internal(e.to_string())
}

async fn reconcile<K: Feature>(
    obj: Arc<K>,
    ctx: Arc<FeatureContext>,
) -> Result<Action, ReconcileErr> {
    if obj.meta().deletion_timestamp.is_some() {
        // Owned objects are reclaimed by garbage collection.
        debug!(feature = K::FEATURE, name = %obj.name_any(), "being deleted");
        return Ok(Action::await_change());
    }
    let outcome = reconcile_once(&ctx, obj.as_ref())
        .await
        .map_err(into_internal)?;
    Ok(Action::requeue(outcome.requeue_after(&ctx.registry)))
}

fn error_policy<K: Feature>(
    obj: Arc<K>,
    err: &ReconcileErr,
    ctx: Arc<FeatureContext>,
) -> Action {
    warn!(feature = K::FEATURE, name = %obj.name_any(), error = %err, "reconcile failed");
    Action::requeue(ctx.registry.retry.apply)
}

/// Watch `K` and run a pass on every change, on license and installation
/// changes, and on every requeue.
pub async fn run_controller<K: Feature>(
    client: Client,
    ctx: Arc<FeatureContext>,
) -> anyhow::Result<()> {
    let api: Api<K> = Api::all(client.clone());
    let primary = || Some(ObjectRef::<K>::new(DEFAULT_NAME));

    Controller::new(api, Config::default())
        .watches(
            Api::<LicenseKey>::all(client.clone()),
            Config::default(),
            move |_| primary(),
        )
        .watches(
            Api::<Installation>::all(client),
            Config::default(),
            move |_| primary(),
        )
        .run(reconcile::<K>, error_policy::<K>, ctx)
        .for_each(|res| async move {
            match res {
                Ok((obj_ref, action)) => info!(
                    feature = K::FEATURE,
                    name = %obj_ref.name,
                    "reconciled: requeue={:?}",
                    action
                ),
                Err(e) => error!(feature = K::FEATURE, error = ?e, "reconcile error"),
            }
        })
        .await;

    Ok(())
}
