//! Helpers shared by every component renderer.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    Affinity, EnvVar, EnvVarSource, HTTPGetAction, LocalObjectReference,
    Namespace, ObjectFieldSelector, PodAffinityTerm, PodAntiAffinity, Probe,
    Secret, Toleration, WeightedPodAffinityTerm,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{
    LabelSelector, ObjectMeta,
};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;

use crate::crd::{InstallationSpec, Provider};

const PSS_ENFORCE: &str = "pod-security.kubernetes.io/enforce";
const PSS_ENFORCE_VERSION: &str = "pod-security.kubernetes.io/enforce-version";
const OPENSHIFT_NODE_SELECTOR: &str = "openshift.io/node-selector";

/// Installation-wide inputs every component renders against.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Platform {
    pub provider: Provider,
    /// Registry prefix from the installation, if any.
    pub registry: Option<String>,
    /// Pull secrets as read from the operator namespace.
    pub pull_secrets: Vec<Secret>,
    pub node_selector: BTreeMap<String, String>,
    pub tolerations: Vec<Toleration>,
    pub control_plane_replicas: i32,
}

impl Platform {
    pub fn from_installation(
        spec: &InstallationSpec,
        provider_override: Option<&str>,
        pull_secrets: Vec<Secret>,
    ) -> Self {
        Self {
            provider: spec.provider(provider_override),
            registry: spec.registry.clone(),
            pull_secrets,
            node_selector: spec
                .control_plane_node_selector
                .clone()
                .unwrap_or_default(),
            tolerations: spec.tolerations(),
            control_plane_replicas: spec.replicas(),
        }
    }

    pub fn node_selector(&self) -> Option<BTreeMap<String, String>> {
        (!self.node_selector.is_empty()).then(|| self.node_selector.clone())
    }

    pub fn tolerations(&self) -> Option<Vec<Toleration>> {
        (!self.tolerations.is_empty()).then(|| self.tolerations.clone())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PodSecurity {
    Privileged,
    Baseline,
    Restricted,
}

impl PodSecurity {
    pub fn as_str(self) -> &'static str {
        match self {
            PodSecurity::Privileged => "privileged",
            PodSecurity::Baseline => "baseline",
            PodSecurity::Restricted => "restricted",
        }
    }
}

pub fn meta(name: &str, namespace: Option<&str>) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: namespace.map(str::to_string),
        ..Default::default()
    }
}

pub fn labeled_meta(
    name: &str,
    namespace: Option<&str>,
    labels: &BTreeMap<String, String>,
) -> ObjectMeta {
    ObjectMeta {
        labels: Some(labels.clone()),
        ..meta(name, namespace)
    }
}

pub fn create_namespace(
    name: &str,
    provider: Provider,
    level: PodSecurity,
) -> Namespace {
    let labels = BTreeMap::from([
        (PSS_ENFORCE.to_string(), level.as_str().to_string()),
        (PSS_ENFORCE_VERSION.to_string(), "latest".to_string()),
    ]);
    // Namespaces must not inherit the cluster-wide default node selector,
    // node agents have to land on every node.
    let annotations = provider.is_openshift().then(|| {
        BTreeMap::from([(OPENSHIFT_NODE_SELECTOR.to_string(), String::new())])
    });
    Namespace {
        metadata: ObjectMeta {
            labels: Some(labels),
            annotations,
            ..meta(name, None)
        },
        ..Default::default()
    }
}

/// Copy secrets into `namespace`, keeping only name, type and data.
pub fn copy_to_namespace(namespace: &str, secrets: &[Secret]) -> Vec<Secret> {
    secrets
        .iter()
        .filter_map(|s| s.metadata.name.as_deref().map(|n| (n, s)))
        .map(|(name, s)| Secret {
            metadata: meta(name, Some(namespace)),
            data: s.data.clone(),
            string_data: s.string_data.clone(),
            type_: s.type_.clone(),
            ..Default::default()
        })
        .collect()
}

/// Bare secret carrying only an identity, for the delete list.
pub fn secret_ref(name: &str, namespace: &str) -> Secret {
    Secret {
        metadata: meta(name, Some(namespace)),
        ..Default::default()
    }
}

pub fn pull_secret_refs(secrets: &[Secret]) -> Option<Vec<LocalObjectReference>> {
    let refs: Vec<_> = secrets
        .iter()
        .filter_map(|s| s.metadata.name.clone())
        .map(|name| LocalObjectReference { name })
        .collect();
    (!refs.is_empty()).then_some(refs)
}

/// Prefer spreading pods labelled `key=value` in `namespace` across hosts.
pub fn pod_anti_affinity(key: &str, value: &str, namespace: &str) -> Affinity {
    Affinity {
        pod_anti_affinity: Some(PodAntiAffinity {
            preferred_during_scheduling_ignored_during_execution: Some(vec![
                WeightedPodAffinityTerm {
                    weight: 100,
                    pod_affinity_term: PodAffinityTerm {
                        label_selector: Some(LabelSelector {
                            match_labels: Some(BTreeMap::from([(
                                key.to_string(),
                                value.to_string(),
                            )])),
                            ..Default::default()
                        }),
                        namespaces: Some(vec![namespace.to_string()]),
                        topology_key: "kubernetes.io/hostname".to_string(),
                        ..Default::default()
                    },
                },
            ]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Anti-affinity only once there is more than one replica to spread.
pub fn replica_affinity(
    replicas: i32,
    key: &str,
    value: &str,
    namespace: &str,
) -> Option<Affinity> {
    (replicas > 1).then(|| pod_anti_affinity(key, value, namespace))
}

/// Tolerations that let a node agent run on every node.
pub fn tolerate_all() -> Vec<Toleration> {
    vec![
        Toleration {
            operator: Some("Exists".into()),
            effect: Some("NoSchedule".into()),
            ..Default::default()
        },
        Toleration {
            operator: Some("Exists".into()),
            effect: Some("NoExecute".into()),
            ..Default::default()
        },
        Toleration {
            key: Some("CriticalAddonsOnly".into()),
            operator: Some("Exists".into()),
            ..Default::default()
        },
    ]
}

pub fn env(name: &str, value: impl Into<String>) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.into()),
        ..Default::default()
    }
}

pub fn env_from_field(name: &str, field_path: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value_from: Some(EnvVarSource {
            field_ref: Some(ObjectFieldSelector {
                field_path: field_path.to_string(),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub fn http_probe(path: &str, port: i32) -> Probe {
    Probe {
        http_get: Some(HTTPGetAction {
            path: Some(path.to_string()),
            port: IntOrString::Int(port),
            ..Default::default()
        }),
        initial_delay_seconds: Some(10),
        period_seconds: Some(10),
        ..Default::default()
    }
}

/// Content fingerprint of a secret's data, for pod template annotations.
pub fn secret_fingerprint(secret: &Secret) -> String {
    let mut buf = Vec::new();
    for (k, v) in secret.data.iter().flatten() {
        buf.extend_from_slice(k.as_bytes());
        buf.push(0);
        buf.extend_from_slice(&v.0);
        buf.push(0);
    }
    for (k, v) in secret.string_data.iter().flatten() {
        buf.extend_from_slice(k.as_bytes());
        buf.push(0);
        buf.extend_from_slice(v.as_bytes());
        buf.push(0);
    }
    warden_pki::fingerprint(&buf)
}
