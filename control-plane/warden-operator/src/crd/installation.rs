use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::status::FeatureStatus;

/// Cluster-wide installation settings. A single instance named `default`.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema, Default)]
#[kube(
    group = "operator.warden.io",
    version = "v1",
    kind = "Installation",
    plural = "installations",
    status = "FeatureStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct InstallationSpec {
    pub kubernetes_provider: Option<Provider>,
    /// Registry prefix for every component image, e.g. "mirror.local/".
    pub registry: Option<String>,
    /// Replicas for control-plane style deployments (default 2).
    pub control_plane_replicas: Option<i32>,
    pub control_plane_node_selector: Option<BTreeMap<String, String>>,
    pub control_plane_tolerations: Option<Vec<Toleration>>,
    /// Names of pull secrets in the operator namespace.
    pub image_pull_secrets: Option<Vec<String>>,
    /// When set, workload certificates are issued by the cluster signer.
    pub certificate_management: Option<CertificateManagementSpec>,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, JsonSchema, PartialEq, Eq, Default)]
pub enum Provider {
    #[default]
    Generic,
    OpenShift,
    #[serde(rename = "EKS")]
    Eks,
    #[serde(rename = "GKE")]
    Gke,
    #[serde(rename = "AKS")]
    Aks,
}

impl Provider {
    pub fn is_openshift(self) -> bool {
        self == Provider::OpenShift
    }

    /// Lenient parse for operator-level overrides.
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "" | "generic" | "none" => Some(Provider::Generic),
            "openshift" => Some(Provider::OpenShift),
            "eks" => Some(Provider::Eks),
            "gke" => Some(Provider::Gke),
            "aks" => Some(Provider::Aks),
            _ => None,
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct Toleration {
    pub key: Option<String>,
    /// Equal | Exists
    pub operator: Option<String>,
    pub value: Option<String>,
    pub effect: Option<String>,
    pub toleration_seconds: Option<i64>,
}

impl From<&Toleration> for k8s_openapi::api::core::v1::Toleration {
    fn from(t: &Toleration) -> Self {
        Self {
            key: t.key.clone(),
            operator: t.operator.clone(),
            value: t.value.clone(),
            effect: t.effect.clone(),
            toleration_seconds: t.toleration_seconds,
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct CertificateManagementSpec {
    /// PEM certificate of the cluster signer.
    pub ca_cert: String,
    pub signer_name: String,
}

impl InstallationSpec {
    pub fn replicas(&self) -> i32 {
        self.control_plane_replicas.unwrap_or(2)
    }

    /// Effective provider; an operator-level override wins.
    pub fn provider(&self, override_: Option<&str>) -> Provider {
        override_
            .and_then(Provider::parse)
            .or(self.kubernetes_provider)
            .unwrap_or_default()
    }

    pub fn tolerations(&self) -> Vec<k8s_openapi::api::core::v1::Toleration> {
        self.control_plane_tolerations
            .iter()
            .flatten()
            .map(Into::into)
            .collect()
    }
}
