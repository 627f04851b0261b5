use std::collections::BTreeMap;

use k8s_openapi::ByteString;
use k8s_openapi::api::core::v1::{
    Container, EmptyDirVolumeSource, EnvVar, EnvVarSource, ObjectFieldSelector,
    Secret, SecretVolumeSource, SecurityContext, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

use crate::{TLS_CERT_KEY, TLS_KEY_KEY, fingerprint, hash_annotation_key};

/// Where a key pair's certificate came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Issuer {
    /// The root authority itself.
    SelfSigned,
    /// Signed by the operator-managed authority.
    OperatorCa,
    /// Provided by the user; never reissued by the operator.
    UserSupplied,
    /// Issued out-of-band by the cluster signer; materialised at pod start.
    CertificateManagement,
}

impl std::fmt::Display for Issuer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Issuer::SelfSigned => write!(f, "self-signed"),
            Issuer::OperatorCa => write!(f, "operator-ca"),
            Issuer::UserSupplied => write!(f, "user-supplied"),
            Issuer::CertificateManagement => write!(f, "certificate-management"),
        }
    }
}

/// Public certificate without its private key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Certificate {
    pub name: String,
    pub namespace: String,
    pub cert_pem: String,
    pub fingerprint: String,
}

impl Certificate {
    pub fn new(
        name: impl Into<String>,
        namespace: impl Into<String>,
        cert_pem: impl Into<String>,
    ) -> Self {
        let cert_pem = cert_pem.into();
        let fingerprint = fingerprint(cert_pem.trim().as_bytes());
        Self {
            name: name.into(),
            namespace: namespace.into(),
            cert_pem,
            fingerprint,
        }
    }

    /// Identity used to order and deduplicate bundle entries.
    pub fn identity(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }
}

/// Private key, certificate and fingerprint for one workload identity.
///
/// Values are never edited in place; a rotated pair is a new value with a new
/// fingerprint.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyPair {
    name: String,
    namespace: String,
    dns_names: Vec<String>,
    cert_pem: Option<String>,
    key_pem: Option<String>,
    issuer: Issuer,
    signer_name: Option<String>,
    fingerprint: String,
}

impl KeyPair {
    /// Key pair with locally held material.
    pub fn new(
        name: impl Into<String>,
        namespace: impl Into<String>,
        dns_names: Vec<String>,
        cert_pem: String,
        key_pem: String,
        issuer: Issuer,
    ) -> Self {
        let fingerprint = fingerprint(cert_pem.trim().as_bytes());
        Self {
            name: name.into(),
            namespace: namespace.into(),
            dns_names,
            cert_pem: Some(cert_pem),
            key_pem: Some(key_pem),
            issuer,
            signer_name: None,
            fingerprint,
        }
    }

    /// Reference to material issued out-of-band by `signer_name`.
    ///
    /// No certificate exists locally; the fingerprint covers the external
    /// authority and the requested names so it still moves when either does.
    pub fn certificate_managed(
        name: impl Into<String>,
        namespace: impl Into<String>,
        mut dns_names: Vec<String>,
        ca_cert_pem: &str,
        signer_name: impl Into<String>,
    ) -> Self {
        let mut sorted = dns_names.clone();
        sorted.sort();
        let mut material = ca_cert_pem.trim().to_string();
        for n in &sorted {
            material.push('\n');
            material.push_str(n);
        }
        dns_names.dedup();
        Self {
            name: name.into(),
            namespace: namespace.into(),
            dns_names,
            cert_pem: None,
            key_pem: None,
            issuer: Issuer::CertificateManagement,
            signer_name: Some(signer_name.into()),
            fingerprint: fingerprint(material.as_bytes()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn dns_names(&self) -> &[String] {
        &self.dns_names
    }

    pub fn cert_pem(&self) -> Option<&str> {
        self.cert_pem.as_deref()
    }

    pub fn key_pem(&self) -> Option<&str> {
        self.key_pem.as_deref()
    }

    pub fn issuer(&self) -> Issuer {
        self.issuer
    }

    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    /// True when consumers must run the provisioner init container instead
    /// of mounting a pre-populated secret.
    pub fn use_certificate_management(&self) -> bool {
        self.issuer == Issuer::CertificateManagement
    }

    /// Whether the operator created this material and should persist it.
    pub fn issued_by_operator(&self) -> bool {
        matches!(self.issuer, Issuer::OperatorCa | Issuer::SelfSigned)
    }

    pub fn certificate(&self) -> Option<Certificate> {
        self.cert_pem
            .as_ref()
            .map(|pem| Certificate::new(&self.name, &self.namespace, pem))
    }

    pub fn hash_annotation_key(&self) -> String {
        hash_annotation_key(&self.name)
    }

    pub fn hash_annotation_value(&self) -> String {
        self.fingerprint.clone()
    }

    /// Secret holding this pair in `namespace`. `None` for cert-managed
    /// pairs, which have no local material.
    pub fn to_secret(&self, namespace: &str) -> Option<Secret> {
        let cert = self.cert_pem.as_ref()?;
        let key = self.key_pem.as_ref()?;
        let mut data = BTreeMap::new();
        data.insert(
            TLS_CERT_KEY.to_string(),
            ByteString(cert.clone().into_bytes()),
        );
        data.insert(
            TLS_KEY_KEY.to_string(),
            ByteString(key.clone().into_bytes()),
        );
        Some(Secret {
            metadata: ObjectMeta {
                name: Some(self.name.clone()),
                namespace: Some(namespace.to_string()),
                ..Default::default()
            },
            type_: Some("kubernetes.io/tls".to_string()),
            data: Some(data),
            ..Default::default()
        })
    }

    pub fn volume(&self) -> Volume {
        if self.use_certificate_management() {
            Volume {
                name: self.name.clone(),
                empty_dir: Some(EmptyDirVolumeSource::default()),
                ..Default::default()
            }
        } else {
            Volume {
                name: self.name.clone(),
                secret: Some(SecretVolumeSource {
                    secret_name: Some(self.name.clone()),
                    default_mode: Some(0o420),
                    ..Default::default()
                }),
                ..Default::default()
            }
        }
    }

    pub fn mount_dir(&self) -> String {
        format!("/{}", self.name)
    }

    pub fn volume_mount(&self) -> VolumeMount {
        VolumeMount {
            name: self.name.clone(),
            mount_path: self.mount_dir(),
            read_only: Some(true),
            ..Default::default()
        }
    }

    pub fn cert_path(&self) -> String {
        format!("{}/{}", self.mount_dir(), TLS_CERT_KEY)
    }

    pub fn key_path(&self) -> String {
        format!("{}/{}", self.mount_dir(), TLS_KEY_KEY)
    }

    /// Init container that requests the certificate from the cluster signer
    /// and writes it into the shared emptyDir before the workload starts.
    pub fn init_container(&self, namespace: &str, image: &str) -> Container {
        let env = |name: &str, value: String| EnvVar {
            name: name.to_string(),
            value: Some(value),
            ..Default::default()
        };
        let field = |name: &str, path: &str| EnvVar {
            name: name.to_string(),
            value_from: Some(EnvVarSource {
                field_ref: Some(ObjectFieldSelector {
                    field_path: path.to_string(),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        };
        let common_name = self
            .dns_names
            .first()
            .cloned()
            .unwrap_or_else(|| self.name.clone());
        Container {
            name: format!("{}-key-cert-provisioner", self.name),
            image: Some(image.to_string()),
            image_pull_policy: Some("IfNotPresent".to_string()),
            env: Some(vec![
                env("SIGNER", self.signer_name.clone().unwrap_or_default()),
                env("COMMON_NAME", common_name),
                env("DNS_NAMES", self.dns_names.join(",")),
                env("CSR_NAME_PREFIX", format!("{}:{}", namespace, self.name)),
                env("CERTIFICATE_PATH", "/certs-share/".to_string()),
                field("POD_IP", "status.podIP"),
                field("POD_NAMESPACE", "metadata.namespace"),
            ]),
            volume_mounts: Some(vec![VolumeMount {
                name: self.name.clone(),
                mount_path: "/certs-share".to_string(),
                read_only: Some(false),
                ..Default::default()
            }]),
            security_context: Some(SecurityContext {
                run_as_non_root: Some(true),
                allow_privilege_escalation: Some(false),
                ..Default::default()
            }),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn local(cert: &str) -> KeyPair {
        KeyPair::new(
            "gw-tls",
            "warden-operator",
            vec!["gw".into()],
            cert.to_string(),
            "KEY".to_string(),
            Issuer::OperatorCa,
        )
    }

    #[test]
    fn local_pair_mounts_secret_and_renders_secret() {
        let kp = local("CERT");
        assert!(!kp.use_certificate_management());
        let vol = kp.volume();
        assert_eq!(
            vol.secret.and_then(|s| s.secret_name).as_deref(),
            Some("gw-tls")
        );
        let secret = kp.to_secret("logs").unwrap();
        assert_eq!(secret.metadata.namespace.as_deref(), Some("logs"));
        let data = secret.data.unwrap();
        assert_eq!(data[TLS_CERT_KEY].0, b"CERT".to_vec());
        assert_eq!(kp.cert_path(), "/gw-tls/tls.crt");
        assert_eq!(kp.hash_annotation_key(), "hash.warden.io/gw-tls");
    }

    #[test]
    fn fingerprint_tracks_certificate_bytes() {
        assert_eq!(local("CERT").fingerprint(), local("CERT").fingerprint());
        assert_ne!(local("CERT").fingerprint(), local("CERU").fingerprint());
    }

    #[test]
    fn certificate_managed_pair_uses_empty_dir_and_init_container() {
        let kp = KeyPair::certificate_managed(
            "gw-tls",
            "warden-operator",
            vec!["gw".into(), "gw.logs".into()],
            "EXTERNAL CA",
            "example.com/signer",
        );
        assert!(kp.use_certificate_management());
        assert!(kp.to_secret("logs").is_none());
        assert!(kp.volume().empty_dir.is_some());
        let init = kp.init_container("logs", "reg/provisioner:v1");
        assert_eq!(init.name, "gw-tls-key-cert-provisioner");
        let env = init.env.unwrap();
        assert!(env.iter().any(|e| e.name == "SIGNER"
            && e.value.as_deref() == Some("example.com/signer")));
        assert!(env.iter().any(|e| e.name == "DNS_NAMES"
            && e.value.as_deref() == Some("gw,gw.logs")));
    }

    #[test]
    fn certificate_managed_fingerprint_ignores_name_order() {
        let a = KeyPair::certificate_managed(
            "x",
            "ns",
            vec!["a".into(), "b".into()],
            "CA",
            "s",
        );
        let b = KeyPair::certificate_managed(
            "x",
            "ns",
            vec!["b".into(), "a".into()],
            "CA",
            "s",
        );
        assert_eq!(a.fingerprint(), b.fingerprint());
    }
}
