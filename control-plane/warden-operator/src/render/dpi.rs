//! Deep packet inspection node agent.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{DaemonSet, DaemonSetSpec};
use k8s_openapi::api::core::v1::{
    Container, HostPathVolumeSource, PodSpec, PodTemplateSpec,
    ResourceRequirements, SecurityContext, ServiceAccount, Volume,
    VolumeMount,
};
use k8s_openapi::api::rbac::v1::{
    ClusterRole, ClusterRoleBinding, PolicyRule, RoleRef, Subject,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{
    LabelSelector, ObjectMeta,
};
use warden_pki::{KeyPair, TrustedBundle};

use super::common::{
    PodSecurity, Platform, copy_to_namespace, create_namespace, env,
    env_from_field, http_probe, labeled_meta, meta, pull_secret_refs,
    tolerate_all,
};
use super::{Render, RenderError, RenderResult};
use crate::config::Registry;

const CONTAINER_NAME: &str = "warden-dpi";
const ALERTS_VOLUME: &str = "dpi-alerts";
const ALERTS_DIR: &str = "/var/log/warden/dpi";
const HEALTH_PORT: i32 = 9097;

#[derive(Clone, Debug, PartialEq)]
pub struct DpiConfig {
    pub platform: Platform,
    pub license_active: bool,
    /// At least one `DeepPacketInspection` resource exists.
    pub has_dpi_resource: bool,
    pub key_pair: KeyPair,
    pub bundle: TrustedBundle,
    /// Override from the `IntrusionDetection` component resources.
    pub resources: Option<ResourceRequirements>,
}

impl Render for DpiConfig {
    fn component(&self) -> &str {
        "dpi"
    }

    fn render(&self, reg: &Registry) -> Result<RenderResult, RenderError> {
        let ns = reg.names.dpi_namespace.as_str();
        let enabled = self.license_active && self.has_dpi_resource;

        let mut out = RenderResult::new();
        out.gate(
            self.license_active,
            create_namespace(ns, self.platform.provider, PodSecurity::Privileged),
        );
        out.gate_all(enabled, copy_to_namespace(ns, &self.platform.pull_secrets));
        out.gate(enabled, self.service_account(reg));
        out.gate(enabled, self.cluster_role(reg));
        out.gate(enabled, self.cluster_role_binding(reg));
        out.gate(enabled, self.daemon_set(reg));
        Ok(out)
    }
}

impl DpiConfig {
    fn labels(&self, reg: &Registry) -> BTreeMap<String, String> {
        BTreeMap::from([(reg.keys.app_label.clone(), reg.names.dpi.clone())])
    }

    fn service_account(&self, reg: &Registry) -> ServiceAccount {
        ServiceAccount {
            metadata: meta(&reg.names.dpi, Some(&reg.names.dpi_namespace)),
            ..Default::default()
        }
    }

    fn cluster_role(&self, reg: &Registry) -> ClusterRole {
        let rule = |groups: &[&str], resources: &[&str], verbs: &[&str]| PolicyRule {
            api_groups: Some(groups.iter().map(|s| s.to_string()).collect()),
            resources: Some(resources.iter().map(|s| s.to_string()).collect()),
            verbs: verbs.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        };
        let mut rules = vec![
            rule(&[""], &["pods", "nodes", "namespaces"], &["get", "list", "watch"]),
            rule(
                &["operator.warden.io"],
                &["deeppacketinspections"],
                &["get", "list", "watch"],
            ),
            rule(
                &["operator.warden.io"],
                &["deeppacketinspections/status"],
                &["update", "patch"],
            ),
        ];
        if !self.platform.provider.is_openshift() {
            // OpenShift grants through security context constraints instead.
            rules.push(PolicyRule {
                api_groups: Some(vec!["policy".into()]),
                resources: Some(vec!["podsecuritypolicies".into()]),
                resource_names: Some(vec![reg.names.dpi.clone()]),
                verbs: vec!["use".into()],
                ..Default::default()
            });
        }
        ClusterRole {
            metadata: meta(&reg.names.dpi, None),
            rules: Some(rules),
            ..Default::default()
        }
    }

    fn cluster_role_binding(&self, reg: &Registry) -> ClusterRoleBinding {
        ClusterRoleBinding {
            metadata: meta(&reg.names.dpi, None),
            role_ref: RoleRef {
                api_group: "rbac.authorization.k8s.io".into(),
                kind: "ClusterRole".into(),
                name: reg.names.dpi.clone(),
            },
            subjects: Some(vec![Subject {
                kind: "ServiceAccount".into(),
                name: reg.names.dpi.clone(),
                namespace: Some(reg.names.dpi_namespace.clone()),
                ..Default::default()
            }]),
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

    fn container(&self, reg: &Registry) -> Container {
        let privileged = self.platform.provider.is_openshift();
        Container {
            name: CONTAINER_NAME.into(),
            image: Some(reg.image(&reg.images.dpi, self.platform.registry.as_deref())),
            env: Some(vec![
                env_from_field("NODENAME", "spec.nodeName"),
                env("DPI_TLS_CERT", self.key_pair.cert_path()),
                env("DPI_TLS_KEY", self.key_pair.key_path()),
                env("DPI_CA_BUNDLE", self.bundle.mount_path()),
                env("DPI_ALERTS_DIR", ALERTS_DIR),
                env("DPI_HEALTH_PORT", HEALTH_PORT.to_string()),
            ]),
            resources: Some(
                self.resources.clone().unwrap_or_else(|| reg.dpi_resources()),
            ),
            security_context: privileged.then(|| SecurityContext {
                privileged: Some(true),
                ..Default::default()
            }),
            readiness_probe: Some(http_probe("/readiness", HEALTH_PORT)),
            volume_mounts: Some(vec![
                self.bundle.volume_mount(),
                self.key_pair.volume_mount(),
                VolumeMount {
                    name: ALERTS_VOLUME.into(),
                    mount_path: ALERTS_DIR.into(),
                    ..Default::default()
                },
            ]),
            ..Default::default()
        }
    }

    fn daemon_set(&self, reg: &Registry) -> DaemonSet {
        let labels = self.labels(reg);
        let init_containers = self.key_pair.use_certificate_management().then(|| {
            vec![self.key_pair.init_container(
                &reg.names.dpi_namespace,
                &reg.image(
                    &reg.images.key_cert_provisioner,
                    self.platform.registry.as_deref(),
                ),
            )]
        });
        let alerts = Volume {
            name: ALERTS_VOLUME.into(),
            host_path: Some(HostPathVolumeSource {
                path: ALERTS_DIR.into(),
                type_: Some("DirectoryOrCreate".into()),
            }),
            ..Default::default()
        };

        DaemonSet {
            metadata: labeled_meta(&reg.names.dpi, Some(&reg.names.dpi_namespace), &labels),
            spec: Some(DaemonSetSpec {
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
                        service_account_name: Some(reg.names.dpi.clone()),
                        tolerations: Some(tolerate_all()),
                        host_network: Some(true),
                        dns_policy: Some("ClusterFirstWithHostNet".into()),
                        termination_grace_period_seconds: Some(30),
                        image_pull_secrets: pull_secret_refs(&self.platform.pull_secrets),
                        init_containers,
                        containers: vec![self.container(reg)],
                        volumes: Some(vec![
                            self.bundle.volume(),
                            self.key_pair.volume(),
                            alerts,
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
