//! Log storage gateway.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, PodSpec, PodTemplateSpec, Service, ServiceAccount,
    ServicePort, ServiceSpec,
};
use k8s_openapi::api::rbac::v1::{
    PolicyRule, Role, RoleBinding, RoleRef, Subject,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{
    LabelSelector, ObjectMeta,
};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use warden_pki::{KeyPair, TrustedBundle};

use super::common::{
    PodSecurity, Platform, copy_to_namespace, create_namespace, env,
    http_probe, labeled_meta, meta, pull_secret_refs, replica_affinity,
};
use super::{ClusterTopology, Render, RenderError, RenderResult};
use crate::config::Registry;

pub const GATEWAY_PORT: i32 = 8443;

#[derive(Clone, Debug, PartialEq)]
pub struct GatewayConfig {
    pub platform: Platform,
    pub license_active: bool,
    pub topology: ClusterTopology,
    pub replicas: i32,
    pub key_pair: KeyPair,
    pub bundle: TrustedBundle,
}

impl Render for GatewayConfig {
    fn component(&self) -> &str {
        "log-gateway"
    }

    fn render(&self, reg: &Registry) -> Result<RenderResult, RenderError> {
        if self.replicas < 0 {
            return Err(RenderError::InvalidConfig(format!(
                "gateway replicas must not be negative, got {}",
                self.replicas
            )));
        }
        // Managed clusters ship their logs to the management cluster.
        let enabled = self.license_active && !self.topology.is_managed();
        let ns = reg.names.log_storage_namespace.as_str();

        let mut out = RenderResult::new();
        out.gate(
            enabled,
            create_namespace(ns, self.platform.provider, PodSecurity::Baseline),
        );
        out.gate_all(enabled, copy_to_namespace(ns, &self.platform.pull_secrets));
        out.gate(enabled, self.service_account(reg));
        out.gate(enabled, self.role(reg));
        out.gate(enabled, self.role_binding(reg));
        out.gate(enabled, self.service(reg));
        out.gate(enabled, self.deployment(reg));
        Ok(out)
    }
}

impl GatewayConfig {
    fn labels(&self, reg: &Registry) -> BTreeMap<String, String> {
        BTreeMap::from([(reg.keys.app_label.clone(), reg.names.gateway.clone())])
    }

    fn ns<'a>(&self, reg: &'a Registry) -> &'a str {
        &reg.names.log_storage_namespace
    }

    fn service_account(&self, reg: &Registry) -> ServiceAccount {
        ServiceAccount {
            metadata: meta(&reg.names.gateway, Some(self.ns(reg))),
            ..Default::default()
        }
    }

    fn role(&self, reg: &Registry) -> Role {
        Role {
            metadata: meta(&reg.names.gateway, Some(self.ns(reg))),
            rules: Some(vec![PolicyRule {
                api_groups: Some(vec!["".into()]),
                resources: Some(vec!["secrets".into(), "configmaps".into()]),
                verbs: vec!["get".into(), "list".into(), "watch".into()],
                ..Default::default()
            }]),
        }
    }

    fn role_binding(&self, reg: &Registry) -> RoleBinding {
        RoleBinding {
            metadata: meta(&reg.names.gateway, Some(self.ns(reg))),
            role_ref: RoleRef {
                api_group: "rbac.authorization.k8s.io".into(),
                kind: "Role".into(),
                name: reg.names.gateway.clone(),
            },
            subjects: Some(vec![Subject {
                kind: "ServiceAccount".into(),
                name: reg.names.gateway.clone(),
                namespace: Some(self.ns(reg).to_string()),
                ..Default::default()
            }]),
        }
    }

    fn service(&self, reg: &Registry) -> Service {
        Service {
            metadata: labeled_meta(&reg.names.gateway, Some(self.ns(reg)), &self.labels(reg)),
            spec: Some(ServiceSpec {
                selector: Some(self.labels(reg)),
                ports: Some(vec![ServicePort {
                    name: Some("https".into()),
                    port: GATEWAY_PORT,
                    target_port: Some(IntOrString::Int(GATEWAY_PORT)),
                    protocol: Some("TCP".into()),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn pod_annotations(&self) -> BTreeMap<String, String> {
        let mut annotations = self.bundle.hash_annotations();
        annotations.insert(
            self.key_pair.hash_annotation_key(),
            self.key_pair.hash_annotation_value(),
        );
        annotations
    }

    fn deployment(&self, reg: &Registry) -> Deployment {
        let ns = self.ns(reg);
        let labels = self.labels(reg);
        let registry = self.platform.registry.as_deref();

        let mut probe = http_probe("/health", GATEWAY_PORT);
        if let Some(get) = probe.http_get.as_mut() {
            get.scheme = Some("HTTPS".into());
        }
        let container = Container {
            name: reg.names.gateway.clone(),
            image: Some(reg.image(&reg.images.gateway, registry)),
            env: Some(vec![
                env("GATEWAY_PORT", GATEWAY_PORT.to_string()),
                env("GATEWAY_TLS_CERT", self.key_pair.cert_path()),
                env("GATEWAY_TLS_KEY", self.key_pair.key_path()),
                env("GATEWAY_CA_BUNDLE", self.bundle.mount_path()),
            ]),
            ports: Some(vec![ContainerPort {
                name: Some("https".into()),
                container_port: GATEWAY_PORT,
                ..Default::default()
            }]),
            resources: Some(reg.gateway_resources()),
            readiness_probe: Some(probe),
            volume_mounts: Some(vec![
                self.bundle.volume_mount(),
                self.key_pair.volume_mount(),
            ]),
            ..Default::default()
        };
        let init_containers = self.key_pair.use_certificate_management().then(|| {
            vec![self.key_pair.init_container(
                ns,
                &reg.image(&reg.images.key_cert_provisioner, registry),
            )]
        });

        Deployment {
            metadata: labeled_meta(&reg.names.gateway, Some(ns), &labels),
            spec: Some(DeploymentSpec {
                replicas: Some(self.replicas),
                selector: LabelSelector {
                    match_labels: Some(labels.clone()),
                    ..Default::default()
                },
                template: PodTemplateSpec {
                    metadata: Some(ObjectMeta {
                        labels: Some(labels),
                        annotations: Some(self.pod_annotations()),
                        ..Default::default()
                    }),
                    spec: Some(PodSpec {
                        service_account_name: Some(reg.names.gateway.clone()),
                        affinity: replica_affinity(
                            self.replicas,
                            &reg.keys.app_label,
                            &reg.names.gateway,
                            ns,
                        ),
                        node_selector: self.platform.node_selector(),
                        tolerations: self.platform.tolerations(),
                        image_pull_secrets: pull_secret_refs(&self.platform.pull_secrets),
                        init_containers,
                        containers: vec![container],
                        volumes: Some(vec![
                            self.bundle.volume(),
                            self.key_pair.volume(),
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
