//! TLS material distribution for one target namespace.
//!
//! Operator-issued key pairs are persisted in the operator namespace so the
//! next pass finds and reuses them, then copied next to the workloads that
//! mount them together with the trusted bundle. In certificate-management
//! mode nothing is copied; instead the workloads' service accounts are
//! allowed to file signing requests.

use k8s_openapi::api::rbac::v1::{
    ClusterRole, ClusterRoleBinding, PolicyRule, RoleRef, Subject,
};
use warden_pki::{KeyPair, TrustedBundle};

use super::common::{meta, secret_ref};
use super::{Render, RenderError, RenderResult};
use crate::config::Registry;

#[derive(Clone, Debug, PartialEq)]
pub struct CertificateManagementConfig {
    /// Component label; distinct per target namespace.
    pub component: String,
    pub operator_namespace: String,
    pub target_namespace: String,
    pub key_pairs: Vec<KeyPair>,
    pub bundle: TrustedBundle,
    /// Service accounts in the target namespace that request certificates
    /// from the cluster signer.
    pub csr_service_accounts: Vec<String>,
    /// Tear down everything in the target namespace.
    pub remove: bool,
}

impl Render for CertificateManagementConfig {
    fn component(&self) -> &str {
        &self.component
    }

    fn render(&self, reg: &Registry) -> Result<RenderResult, RenderError> {
        let mut out = RenderResult::new();
        let same_ns = self.operator_namespace == self.target_namespace;

        for kp in self.key_pairs.iter().filter(|kp| kp.issued_by_operator()) {
            let secret = kp.to_secret(&self.operator_namespace).ok_or_else(|| {
                RenderError::MissingInput(format!(
                    "key material for {}",
                    kp.name()
                ))
            })?;
            out.create(secret);
        }

        if !same_ns {
            for kp in &self.key_pairs {
                match kp.to_secret(&self.target_namespace) {
                    Some(copy) if !self.remove => out.create(copy),
                    // Cert-managed pairs have nothing to copy but a stale copy
                    // from before the mode switch must go.
                    _ => out.delete(secret_ref(kp.name(), &self.target_namespace)),
                }
            }
        }
        out.gate(!self.remove, self.bundle.config_map(&self.target_namespace));

        let cert_managed = self.key_pairs.iter().any(KeyPair::use_certificate_management);
        let csr = !self.remove && cert_managed && !self.csr_service_accounts.is_empty();
        out.gate(csr, self.csr_cluster_role(reg));
        out.gate(csr, self.csr_cluster_role_binding(reg));
        Ok(out)
    }
}

impl CertificateManagementConfig {
    fn csr_role_name(&self, reg: &Registry) -> String {
        format!("{}-{}", reg.names.csr_cluster_role, self.target_namespace)
    }

    fn csr_cluster_role(&self, reg: &Registry) -> ClusterRole {
        ClusterRole {
            metadata: meta(&self.csr_role_name(reg), None),
            rules: Some(vec![PolicyRule {
                api_groups: Some(vec!["certificates.k8s.io".into()]),
                resources: Some(vec!["certificatesigningrequests".into()]),
                verbs: ["create", "get", "list", "watch"]
                    .iter()
                    .map(|v| v.to_string())
                    .collect(),
                ..Default::default()
            }]),
            ..Default::default()
        }
    }

    fn csr_cluster_role_binding(&self, reg: &Registry) -> ClusterRoleBinding {
        let name = self.csr_role_name(reg);
        let mut accounts = self.csr_service_accounts.clone();
        accounts.sort();
        accounts.dedup();
        ClusterRoleBinding {
            metadata: meta(&name, None),
            role_ref: RoleRef {
                api_group: "rbac.authorization.k8s.io".into(),
                kind: "ClusterRole".into(),
                name,
            },
            subjects: Some(
                accounts
                    .into_iter()
                    .map(|sa| Subject {
                        kind: "ServiceAccount".into(),
                        name: sa,
                        namespace: Some(self.target_namespace.clone()),
                        ..Default::default()
                    })
                    .collect(),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::ResourceId;
    use k8s_openapi::api::core::v1::{ConfigMap, Secret};
    use warden_pki::{Certificate, Issuer};

    fn local(name: &str, issuer: Issuer) -> KeyPair {
        KeyPair::new(
            name,
            "warden-operator",
            vec![format!("{name}.svc")],
            format!("CERT-{name}"),
            "KEY".into(),
            issuer,
        )
    }

    fn config(key_pairs: Vec<KeyPair>, remove: bool) -> CertificateManagementConfig {
        CertificateManagementConfig {
            component: "dpi-certificates".into(),
            operator_namespace: "warden-operator".into(),
            target_namespace: "warden-dpi".into(),
            key_pairs,
            bundle: TrustedBundle::new("warden-ca-bundle")
                .add_certificate(Certificate::new("ca", "warden-operator", "CA")),
            csr_service_accounts: vec!["warden-dpi".into()],
            remove,
        }
    }

    #[test]
    fn operator_pairs_are_persisted_and_copied() {
        let reg = Registry::default();
        let result = config(
            vec![local("dpi-tls", Issuer::OperatorCa), local("byo", Issuer::UserSupplied)],
            false,
        )
        .render(&reg)
        .unwrap();
        result.validate().unwrap();
        let ids = result.create_ids();
        let secret = |name: &str, ns: &str| ResourceId::of::<Secret>(Some(ns), name);
        assert!(ids.contains(&secret("dpi-tls", "warden-operator")));
        assert!(ids.contains(&secret("dpi-tls", "warden-dpi")));
        // user supplied material is copied but never rewritten at the source
        assert!(!ids.contains(&secret("byo", "warden-operator")));
        assert!(ids.contains(&secret("byo", "warden-dpi")));
        assert!(ids.contains(&ResourceId::of::<ConfigMap>(Some("warden-dpi"), "warden-ca-bundle")));
        // no cert-managed pair, no signing request permissions
        assert_eq!(result.to_create.iter().filter(|r| r.kind() == "ClusterRole").count(), 0);
    }

    #[test]
    fn remove_deletes_target_copies_but_keeps_source() {
        let reg = Registry::default();
        let result = config(vec![local("dpi-tls", Issuer::OperatorCa)], true)
            .render(&reg)
            .unwrap();
        result.validate().unwrap();
        assert_eq!(
            result.create_ids(),
            vec![ResourceId::of::<Secret>(Some("warden-operator"), "dpi-tls")]
        );
        assert!(
            result
                .delete_ids()
                .contains(&ResourceId::of::<Secret>(Some("warden-dpi"), "dpi-tls"))
        );
    }

    #[test]
    fn certificate_managed_pairs_get_signing_permissions() {
        let reg = Registry::default();
        let managed = KeyPair::certificate_managed(
            "dpi-tls",
            "warden-operator",
            vec!["dpi".into()],
            "CA",
            "example.com/signer",
        );
        let result = config(vec![managed], false).render(&reg).unwrap();
        result.validate().unwrap();
        let kinds: Vec<_> = result.to_create.iter().map(|r| r.kind().to_string()).collect();
        assert_eq!(kinds, vec!["ConfigMap", "ClusterRole", "ClusterRoleBinding"]);
        assert_eq!(
            result.create_ids()[1].name,
            "warden-csr-creator-warden-dpi"
        );
    }
}
