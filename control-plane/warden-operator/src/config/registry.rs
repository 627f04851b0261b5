//! Naming and default registry.
//!
//! Every namespace, object name, label key and default the renderers and the
//! apply engine rely on lives here and is passed in explicitly. Tests build a
//! registry with overridden values instead of patching globals.

use std::collections::BTreeMap;
use std::time::Duration;

use k8s_openapi::api::core::v1::ResourceRequirements;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use warden_pki::ManagerSettings;

use super::OperatorConfig;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Names {
    pub ca_secret: String,
    pub trusted_bundle: String,
    pub dpi_namespace: String,
    pub dpi: String,
    pub dpi_tls_secret: String,
    pub log_storage_namespace: String,
    pub gateway: String,
    pub gateway_tls_secret: String,
    pub gateway_public_cert: String,
    pub guardian_namespace: String,
    pub guardian: String,
    pub tunnel_secret: String,
    pub packet_capture_secret: String,
    pub prometheus_secret: String,
    pub csr_cluster_role: String,
}

impl Default for Names {
    fn default() -> Self {
        Self {
            ca_secret: "warden-ca-private".into(),
            trusted_bundle: "warden-ca-bundle".into(),
            dpi_namespace: "warden-dpi".into(),
            dpi: "warden-dpi".into(),
            dpi_tls_secret: "warden-dpi-tls".into(),
            log_storage_namespace: "warden-log-storage".into(),
            gateway: "warden-log-gateway".into(),
            gateway_tls_secret: "warden-log-gateway-tls".into(),
            gateway_public_cert: "warden-log-gateway-public-cert".into(),
            guardian_namespace: "warden-guardian".into(),
            guardian: "warden-guardian".into(),
            tunnel_secret: "warden-managed-cluster-connection".into(),
            packet_capture_secret: "warden-packetcapture-tls".into(),
            prometheus_secret: "warden-prometheus-tls".into(),
            csr_cluster_role: "warden-csr-creator".into(),
        }
    }
}

/// Label and annotation keys stamped on every managed object.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Keys {
    pub managed_by_label: String,
    pub managed_by_value: String,
    pub component_label: String,
    pub applied_hash_annotation: String,
    pub app_label: String,
}

impl Default for Keys {
    fn default() -> Self {
        Self {
            managed_by_label: "app.kubernetes.io/managed-by".into(),
            managed_by_value: "warden-operator".into(),
            component_label: "warden.io/component".into(),
            applied_hash_annotation: "warden.io/applied-hash".into(),
            app_label: "k8s-app".into(),
        }
    }
}

/// License feature identifiers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Features {
    pub intrusion_detection: String,
    pub log_storage: String,
    pub multi_cluster: String,
}

impl Default for Features {
    fn default() -> Self {
        Self {
            intrusion_detection: "threat-defense".into(),
            log_storage: "log-storage".into(),
            multi_cluster: "multi-cluster-management".into(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ImageRef {
    pub path: String,
    pub tag: String,
}

impl ImageRef {
    fn new(path: &str, tag: &str) -> Self {
        Self {
            path: path.into(),
            tag: tag.into(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Images {
    /// Default registry prefix, with trailing slash.
    pub registry: String,
    pub dpi: ImageRef,
    pub gateway: ImageRef,
    pub guardian: ImageRef,
    pub key_cert_provisioner: ImageRef,
}

impl Default for Images {
    fn default() -> Self {
        let tag = "v0.1.0";
        Self {
            registry: "quay.io/".into(),
            dpi: ImageRef::new("warden/dpi", tag),
            gateway: ImageRef::new("warden/log-gateway", tag),
            guardian: ImageRef::new("warden/guardian", tag),
            key_cert_provisioner: ImageRef::new(
                "warden/key-cert-provisioner",
                tag,
            ),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Retry {
    pub not_ready: Duration,
    pub license: Duration,
    pub apply: Duration,
    pub resync: Duration,
}

impl Default for Retry {
    fn default() -> Self {
        Self {
            not_ready: Duration::from_secs(5),
            license: Duration::from_secs(10),
            apply: Duration::from_secs(5),
            resync: Duration::from_secs(300),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Registry {
    pub operator_namespace: String,
    pub cluster_domain: String,
    pub field_manager: String,
    /// Provider forced by operator configuration, if any.
    pub provider_override: Option<String>,
    pub names: Names,
    pub keys: Keys,
    pub features: Features,
    pub images: Images,
    pub retry: Retry,
}

impl Default for Registry {
    fn default() -> Self {
        Self {
            operator_namespace: "warden-operator".into(),
            cluster_domain: "cluster.local".into(),
            field_manager: "warden-operator".into(),
            provider_override: None,
            names: Names::default(),
            keys: Keys::default(),
            features: Features::default(),
            images: Images::default(),
            retry: Retry::default(),
        }
    }
}

impl Registry {
    pub fn from_config(cfg: &OperatorConfig) -> Self {
        let mut reg = Self {
            operator_namespace: cfg.operator_namespace.clone(),
            cluster_domain: cfg.cluster_domain.clone(),
            field_manager: cfg.field_manager.clone(),
            provider_override: cfg.kubernetes_provider.clone(),
            retry: Retry {
                not_ready: Duration::from_secs(cfg.retry.not_ready_secs),
                license: Duration::from_secs(cfg.retry.license_secs),
                apply: Duration::from_secs(cfg.retry.apply_secs),
                resync: Duration::from_secs(cfg.retry.resync_secs),
            },
            ..Self::default()
        };
        if let Some(registry) = &cfg.image_registry {
            reg.images.registry = with_trailing_slash(registry);
        }
        reg
    }

    /// Fully qualified image reference. An installation-level registry wins
    /// over the operator default.
    pub fn image(&self, image: &ImageRef, installation_registry: Option<&str>) -> String {
        let registry = installation_registry
            .filter(|r| !r.is_empty())
            .map(with_trailing_slash)
            .unwrap_or_else(|| self.images.registry.clone());
        format!("{}{}:{}", registry, image.path, image.tag)
    }

    /// Labels that identify objects written by this operator for one
    /// component. Used both for stamping and for orphan discovery.
    pub fn managed_labels(&self, component: &str) -> BTreeMap<String, String> {
        BTreeMap::from([
            (
                self.keys.managed_by_label.clone(),
                self.keys.managed_by_value.clone(),
            ),
            (self.keys.component_label.clone(), component.to_string()),
        ])
    }

    pub fn manager_settings(&self) -> ManagerSettings {
        ManagerSettings {
            operator_namespace: self.operator_namespace.clone(),
            ca_secret_name: self.names.ca_secret.clone(),
            bundle_name: self.names.trusted_bundle.clone(),
            cluster_domain: self.cluster_domain.clone(),
            certificate_management: None,
        }
    }

    pub fn dpi_resources(&self) -> ResourceRequirements {
        requirements(("1", "1Gi"), ("100m", "100Mi"))
    }

    pub fn gateway_resources(&self) -> ResourceRequirements {
        requirements(("500m", "512Mi"), ("100m", "128Mi"))
    }
}

fn requirements(
    (cpu_limit, mem_limit): (&str, &str),
    (cpu_req, mem_req): (&str, &str),
) -> ResourceRequirements {
    let pair = |cpu: &str, mem: &str| {
        BTreeMap::from([
            ("cpu".to_string(), Quantity(cpu.to_string())),
            ("memory".to_string(), Quantity(mem.to_string())),
        ])
    };
    ResourceRequirements {
        limits: Some(pair(cpu_limit, mem_limit)),
        requests: Some(pair(cpu_req, mem_req)),
        ..Default::default()
    }
}

fn with_trailing_slash(registry: &str) -> String {
    if registry.ends_with('/') {
        registry.to_string()
    } else {
        format!("{registry}/")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn installation_registry_overrides_default() {
        let reg = Registry::default();
        let img = reg.images.dpi.clone();
        assert_eq!(reg.image(&img, None), "quay.io/warden/dpi:v0.1.0");
        assert_eq!(
            reg.image(&img, Some("mirror.local")),
            "mirror.local/warden/dpi:v0.1.0"
        );
        assert_eq!(reg.image(&img, Some("")), "quay.io/warden/dpi:v0.1.0");
    }

    #[test]
    fn from_config_applies_overrides() {
        let cfg = OperatorConfig {
            operator_namespace: "ops".into(),
            image_registry: Some("registry.example.com".into()),
            ..Default::default()
        };
        let reg = Registry::from_config(&cfg);
        assert_eq!(reg.operator_namespace, "ops");
        assert_eq!(reg.images.registry, "registry.example.com/");
        assert_eq!(reg.manager_settings().operator_namespace, "ops");
    }
}
