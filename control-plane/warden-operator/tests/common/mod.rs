#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::Arc;

use k8s_openapi::ByteString;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::{Resource, ResourceExt};
use serde::Serialize;
use serde::de::DeserializeOwned;
use warden_operator::cluster::{MemoryCluster, fetch};
use warden_operator::config::Registry;
use warden_operator::controller::FeatureContext;
use warden_operator::crd::{
    CertificateManagementSpec, DEFAULT_NAME, Installation, InstallationSpec,
    LicenseKey, LicenseKeySpec,
};

pub const OPERATOR_NS: &str = "warden-operator";

// Env guard utilities
pub struct EnvGuard {
    key: &'static str,
    old: Option<String>,
}
impl Drop for EnvGuard {
    fn drop(&mut self) {
        unsafe {
            if let Some(ref v) = self.old {
                std::env::set_var(self.key, v);
            } else {
                std::env::remove_var(self.key);
            }
        }
    }
}
pub fn set_env(key: &'static str, val: &str) -> EnvGuard {
    let old = std::env::var(key).ok();
    unsafe {
        std::env::set_var(key, val);
    }
    EnvGuard { key, old }
}

/// In-memory cluster plus a context wired to it, for both the cluster API
/// and the secret store.
pub struct Harness {
    pub cluster: MemoryCluster,
    pub ctx: FeatureContext,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_registry(Registry::default())
    }

    pub fn with_registry(registry: Registry) -> Self {
        let cluster = MemoryCluster::new();
        let ctx = FeatureContext::new(
            Arc::new(cluster.clone()),
            Arc::new(cluster.clone()),
            registry,
        );
        Self { cluster, ctx }
    }

    /// Store `obj` and return it as the cluster sees it (uid assigned).
    pub async fn seed<K: Serialize + DeserializeOwned>(&self, obj: &K) -> K {
        let stored = self.cluster.insert(obj).await.unwrap();
        serde_json::from_value(serde_json::to_value(stored).unwrap()).unwrap()
    }

    pub async fn reload<K>(&self, obj: &K) -> K
    where
        K: Resource<DynamicType = ()> + DeserializeOwned,
    {
        fetch::<K>(&self.cluster, obj.namespace().as_deref(), &obj.name_any())
            .await
            .unwrap()
            .unwrap()
    }

    pub async fn get<K>(&self, namespace: Option<&str>, name: &str) -> Option<K>
    where
        K: Resource<DynamicType = ()> + DeserializeOwned,
    {
        fetch::<K>(&self.cluster, namespace, name).await.unwrap()
    }

    pub async fn installation(&self, spec: InstallationSpec) {
        self.seed(&Installation::new(DEFAULT_NAME, spec)).await;
    }

    pub async fn license(&self, features: &[&str]) {
        let spec = LicenseKeySpec {
            features: features.iter().map(|f| f.to_string()).collect(),
            expiry: None,
        };
        self.seed(&LicenseKey::new(DEFAULT_NAME, spec)).await;
    }

    pub async fn secret(&self, name: &str, data: &[(&str, &str)]) {
        self.seed(&secret(name, OPERATOR_NS, data)).await;
    }

    /// Certificates intrusion detection trusts in addition to the CA.
    pub async fn peer_certs(&self) {
        let reg = self.ctx.registry.clone();
        self.secret(&reg.names.packet_capture_secret, &[("tls.crt", "PACKET-CAPTURE")])
            .await;
        self.secret(&reg.names.prometheus_secret, &[("tls.crt", "PROMETHEUS")])
            .await;
    }
}

pub fn secret(name: &str, namespace: &str, data: &[(&str, &str)]) -> Secret {
    Secret {
        metadata: ObjectMeta {
            name: Some(name.into()),
            namespace: Some(namespace.into()),
            ..Default::default()
        },
        data: Some(
            data.iter()
                .map(|(k, v)| (k.to_string(), ByteString(v.as_bytes().to_vec())))
                .collect::<BTreeMap<_, _>>(),
        ),
        ..Default::default()
    }
}

pub fn cert_managed_installation() -> InstallationSpec {
    InstallationSpec {
        certificate_management: Some(CertificateManagementSpec {
            ca_cert: "EXTERNAL-CA".into(),
            signer_name: "example.com/signer".into(),
        }),
        ..Default::default()
    }
}

pub fn pod_annotations(obj: &serde_json::Value) -> BTreeMap<String, String> {
    obj.pointer("/spec/template/metadata/annotations")
        .cloned()
        .map(|v| serde_json::from_value(v).unwrap())
        .unwrap_or_default()
}
