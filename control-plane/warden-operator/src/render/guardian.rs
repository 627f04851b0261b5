//! Agent that tunnels a managed cluster to its management cluster.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, PodSpec, PodTemplateSpec, Secret,
    SecretVolumeSource, Service, ServiceAccount, ServicePort, ServiceSpec,
    Volume, VolumeMount,
};
use k8s_openapi::api::rbac::v1::{
    ClusterRole, ClusterRoleBinding, PolicyRule, RoleRef, Subject,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{
    LabelSelector, ObjectMeta,
};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use warden_pki::{TrustedBundle, hash_annotation_key};

use super::common::{
    PodSecurity, Platform, copy_to_namespace, create_namespace, env,
    labeled_meta, meta, pull_secret_refs, secret_fingerprint, secret_ref,
};
use super::{ClusterTopology, Render, RenderError, RenderResult};
use crate::config::Registry;

pub const TUNNEL_CERT_KEY: &str = "management-cluster.crt";
pub const TUNNEL_KEY_KEY: &str = "management-cluster.key";
const TUNNEL_MOUNT_DIR: &str = "/certs/tunnel";
const PROXY_PORT: i32 = 8080;

#[derive(Clone, Debug, PartialEq)]
pub struct GuardianConfig {
    pub platform: Platform,
    pub has_management_cluster: bool,
    /// Address from the `ManagementClusterConnection`, when one exists.
    pub connection_addr: Option<String>,
    /// Tunnel credentials as read from the operator namespace.
    pub tunnel_secret: Option<Secret>,
    pub bundle: TrustedBundle,
}

impl Render for GuardianConfig {
    fn component(&self) -> &str {
        "guardian"
    }

    fn render(&self, reg: &Registry) -> Result<RenderResult, RenderError> {
        let topology = ClusterTopology::resolve(
            self.has_management_cluster,
            self.connection_addr.is_some(),
        )?;
        let ns = reg.names.guardian_namespace.as_str();
        let mut out = RenderResult::new();

        if !topology.is_managed() {
            out.delete(create_namespace(
                ns,
                self.platform.provider,
                PodSecurity::Restricted,
            ));
            out.delete(secret_ref(&reg.names.tunnel_secret, ns));
            for s in copy_to_namespace(ns, &self.platform.pull_secrets) {
                out.delete(s);
            }
            out.delete(self.service_account(reg));
            out.delete(self.cluster_role(reg));
            out.delete(self.cluster_role_binding(reg));
            out.delete(Service {
                metadata: meta(&reg.names.guardian, Some(ns)),
                ..Default::default()
            });
            out.delete(Deployment {
                metadata: meta(&reg.names.guardian, Some(ns)),
                ..Default::default()
            });
            return Ok(out);
        }

        let addr = self
            .connection_addr
            .as_deref()
            .filter(|a| !a.trim().is_empty())
            .ok_or_else(|| {
                RenderError::InvalidConfig(
                    "managementClusterAddr must not be empty".into(),
                )
            })?;
        let tunnel = self.tunnel_secret.as_ref().ok_or_else(|| {
            RenderError::MissingInput(format!(
                "secret {}/{}",
                reg.operator_namespace, reg.names.tunnel_secret
            ))
        })?;

        out.create(create_namespace(
            ns,
            self.platform.provider,
            PodSecurity::Restricted,
        ));
        for s in copy_to_namespace(ns, std::slice::from_ref(tunnel)) {
            out.create(s);
        }
        for s in copy_to_namespace(ns, &self.platform.pull_secrets) {
            out.create(s);
        }
        out.create(self.service_account(reg));
        out.create(self.cluster_role(reg));
        out.create(self.cluster_role_binding(reg));
        out.create(self.service(reg));
        out.create(self.deployment(reg, addr, tunnel));
        Ok(out)
    }
}

impl GuardianConfig {
    fn labels(&self, reg: &Registry) -> BTreeMap<String, String> {
        BTreeMap::from([(reg.keys.app_label.clone(), reg.names.guardian.clone())])
    }

    fn service_account(&self, reg: &Registry) -> ServiceAccount {
        ServiceAccount {
            metadata: meta(&reg.names.guardian, Some(&reg.names.guardian_namespace)),
            ..Default::default()
        }
    }

    fn cluster_role(&self, reg: &Registry) -> ClusterRole {
        ClusterRole {
            metadata: meta(&reg.names.guardian, None),
            rules: Some(vec![
                PolicyRule {
                    api_groups: Some(vec!["".into()]),
                    resources: Some(vec![
                        "users".into(),
                        "groups".into(),
                        "serviceaccounts".into(),
                    ]),
                    verbs: vec!["impersonate".into()],
                    ..Default::default()
                },
                PolicyRule {
                    api_groups: Some(vec!["authorization.k8s.io".into()]),
                    resources: Some(vec!["subjectaccessreviews".into()]),
                    verbs: vec!["create".into()],
                    ..Default::default()
                },
            ]),
            ..Default::default()
        }
    }

    fn cluster_role_binding(&self, reg: &Registry) -> ClusterRoleBinding {
        ClusterRoleBinding {
            metadata: meta(&reg.names.guardian, None),
            role_ref: RoleRef {
                api_group: "rbac.authorization.k8s.io".into(),
                kind: "ClusterRole".into(),
                name: reg.names.guardian.clone(),
            },
            subjects: Some(vec![Subject {
                kind: "ServiceAccount".into(),
                name: reg.names.guardian.clone(),
                namespace: Some(reg.names.guardian_namespace.clone()),
                ..Default::default()
            }]),
        }
    }

    fn service(&self, reg: &Registry) -> Service {
        let labels = self.labels(reg);
        Service {
            metadata: labeled_meta(
                &reg.names.guardian,
                Some(&reg.names.guardian_namespace),
                &labels,
            ),
            spec: Some(ServiceSpec {
                selector: Some(labels),
                ports: Some(vec![ServicePort {
                    name: Some("https".into()),
                    port: 443,
                    target_port: Some(IntOrString::Int(PROXY_PORT)),
                    protocol: Some("TCP".into()),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn deployment(&self, reg: &Registry, addr: &str, tunnel: &Secret) -> Deployment {
        let ns = reg.names.guardian_namespace.as_str();
        let labels = self.labels(reg);
        let tunnel_name = reg.names.tunnel_secret.clone();

        let mut annotations = self.bundle.hash_annotations();
        annotations.insert(hash_annotation_key(&tunnel_name), secret_fingerprint(tunnel));

        let container = Container {
            name: reg.names.guardian.clone(),
            image: Some(reg.image(&reg.images.guardian, self.platform.registry.as_deref())),
            env: Some(vec![
                env("GUARDIAN_URL", addr),
                env("GUARDIAN_CA_BUNDLE", self.bundle.mount_path()),
                env(
                    "GUARDIAN_TUNNEL_CERT",
                    format!("{TUNNEL_MOUNT_DIR}/{TUNNEL_CERT_KEY}"),
                ),
                env(
                    "GUARDIAN_TUNNEL_KEY",
                    format!("{TUNNEL_MOUNT_DIR}/{TUNNEL_KEY_KEY}"),
                ),
                env("GUARDIAN_PORT", PROXY_PORT.to_string()),
            ]),
            ports: Some(vec![ContainerPort {
                container_port: PROXY_PORT,
                ..Default::default()
            }]),
            volume_mounts: Some(vec![
                self.bundle.volume_mount(),
                VolumeMount {
                    name: tunnel_name.clone(),
                    mount_path: TUNNEL_MOUNT_DIR.into(),
                    read_only: Some(true),
                    ..Default::default()
                },
            ]),
            ..Default::default()
        };

        Deployment {
            metadata: labeled_meta(&reg.names.guardian, Some(ns), &labels),
            spec: Some(DeploymentSpec {
                replicas: Some(1),
                selector: LabelSelector {
                    match_labels: Some(labels.clone()),
                    ..Default::default()
                },
                template: PodTemplateSpec {
                    metadata: Some(ObjectMeta {
                        labels: Some(labels),
                        annotations: Some(annotations),
                        ..Default::default()
                    }),
                    spec: Some(PodSpec {
                        service_account_name: Some(reg.names.guardian.clone()),
                        node_selector: self.platform.node_selector(),
                        tolerations: self.platform.tolerations(),
                        image_pull_secrets: pull_secret_refs(&self.platform.pull_secrets),
                        containers: vec![container],
                        volumes: Some(vec![
                            self.bundle.volume(),
                            Volume {
                                name: tunnel_name.clone(),
                                secret: Some(SecretVolumeSource {
                                    secret_name: Some(tunnel_name),
                                    default_mode: Some(0o420),
                                    ..Default::default()
                                }),
                                ..Default::default()
                            },
                        ]),
                        ..Default::default()
                    }),
                },
                ..Default::default()
            }),
            ..Default::default()
        }
    }
}
