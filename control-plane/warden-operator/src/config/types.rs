use envconfig::Envconfig;

#[derive(Envconfig, Clone, Debug)]
pub struct OperatorConfig {
    /// Namespace holding the signing authority and operator-owned secrets.
    #[envconfig(from = "WARDEN_OPERATOR_NAMESPACE", default = "warden-operator")]
    pub operator_namespace: String,

    #[envconfig(from = "WARDEN_CLUSTER_DOMAIN", default = "cluster.local")]
    pub cluster_domain: String,

    /// Overrides the provider declared on the Installation resource.
    /// Env: WARDEN_KUBERNETES_PROVIDER (generic | openshift | eks | gke | aks)
    #[envconfig(from = "WARDEN_KUBERNETES_PROVIDER")]
    pub kubernetes_provider: Option<String>,

    /// Default image registry, with trailing slash (e.g. "quay.io/").
    #[envconfig(from = "WARDEN_IMAGE_REGISTRY")]
    pub image_registry: Option<String>,

    #[envconfig(from = "WARDEN_FIELD_MANAGER", default = "warden-operator")]
    pub field_manager: String,

    #[envconfig(nested)]
    pub retry: RetryConfig,
}

#[derive(Envconfig, Clone, Debug)]
pub struct RetryConfig {
    /// Delay before re-checking a missing prerequisite secret.
    #[envconfig(from = "WARDEN_RETRY_NOT_READY_SECS", default = "5")]
    pub not_ready_secs: u64,

    /// Delay before re-checking a missing or unreadable license.
    #[envconfig(from = "WARDEN_RETRY_LICENSE_SECS", default = "10")]
    pub license_secs: u64,

    /// Delay before re-running a pass whose apply did not converge.
    #[envconfig(from = "WARDEN_RETRY_APPLY_SECS", default = "5")]
    pub apply_secs: u64,

    /// Periodic resync of converged resources.
    #[envconfig(from = "WARDEN_RESYNC_SECS", default = "300")]
    pub resync_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            not_ready_secs: 5,
            license_secs: 10,
            apply_secs: 5,
            resync_secs: 300,
        }
    }
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            operator_namespace: "warden-operator".into(),
            cluster_domain: "cluster.local".into(),
            kubernetes_provider: None,
            image_registry: None,
            field_manager: "warden-operator".into(),
            retry: RetryConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults_from_empty_env() {
        let cfg = OperatorConfig::init_from_hashmap(&HashMap::new()).unwrap();
        assert_eq!(cfg.operator_namespace, "warden-operator");
        assert_eq!(cfg.cluster_domain, "cluster.local");
        assert_eq!(cfg.kubernetes_provider, None);
        assert_eq!(cfg.retry.license_secs, 10);
        assert_eq!(cfg.retry.not_ready_secs, 5);
    }

    #[test]
    fn env_overrides_are_read() {
        let env = HashMap::from([
            ("WARDEN_OPERATOR_NAMESPACE".to_string(), "ops".to_string()),
            ("WARDEN_KUBERNETES_PROVIDER".to_string(), "openshift".to_string()),
            ("WARDEN_RETRY_LICENSE_SECS".to_string(), "30".to_string()),
        ]);
        let cfg = OperatorConfig::init_from_hashmap(&env).unwrap();
        assert_eq!(cfg.operator_namespace, "ops");
        assert_eq!(cfg.kubernetes_provider.as_deref(), Some("openshift"));
        assert_eq!(cfg.retry.license_secs, 30);
    }
}
