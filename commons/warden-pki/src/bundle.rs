use std::collections::{BTreeMap, BTreeSet};

use k8s_openapi::api::core::v1::{
    ConfigMap, ConfigMapVolumeSource, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

use crate::keypair::Certificate;
use crate::{fingerprint, hash_annotation_key};

/// Data key of the bundle inside its config map.
pub const BUNDLE_KEY: &str = "tls-ca-bundle.crt";

/// Directory the bundle is mounted into.
pub const BUNDLE_MOUNT_DIR: &str = "/etc/pki/tls/certs";

/// Aggregate of trusted certificates plus a content fingerprint.
///
/// A bundle is a persistent value: [`TrustedBundle::add_certificate`]
/// returns a new bundle and leaves the receiver untouched, so one base
/// bundle can be extended independently by concurrent renders.
///
/// Entries are keyed by `namespace/name`, which fixes the output order
/// regardless of insertion order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TrustedBundle {
    name: String,
    certificates: BTreeMap<String, Certificate>,
}

impl TrustedBundle {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            certificates: BTreeMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// New bundle that also trusts `cert`. A certificate with the same
    /// identity replaces the previous entry.
    pub fn add_certificate(&self, cert: Certificate) -> Self {
        let mut next = self.clone();
        next.insert(cert);
        next
    }

    pub fn add_certificates<I>(&self, certs: I) -> Self
    where
        I: IntoIterator<Item = Certificate>,
    {
        let mut next = self.clone();
        for cert in certs {
            next.insert(cert);
        }
        next
    }

    fn insert(&mut self, cert: Certificate) {
        self.certificates.insert(cert.identity(), cert);
    }

    pub fn len(&self) -> usize {
        self.certificates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.certificates.is_empty()
    }

    pub fn certificates(&self) -> impl Iterator<Item = &Certificate> {
        self.certificates.values()
    }

    /// Concatenated PEM blocks in identity order. Content already written
    /// under a smaller identity is written once.
    pub fn pem(&self) -> String {
        let mut out = String::new();
        let mut written = BTreeSet::new();
        for (identity, cert) in &self.certificates {
            if !written.insert(cert.fingerprint.as_str()) {
                continue;
            }
            out.push_str("# certificate name: ");
            out.push_str(identity);
            out.push('\n');
            out.push_str(cert.cert_pem.trim());
            out.push_str("\n\n");
        }
        out
    }

    pub fn fingerprint(&self) -> String {
        fingerprint(self.pem().as_bytes())
    }

    pub fn hash_annotations(&self) -> BTreeMap<String, String> {
        BTreeMap::from([(hash_annotation_key(&self.name), self.fingerprint())])
    }

    pub fn config_map(&self, namespace: &str) -> ConfigMap {
        ConfigMap {
            metadata: ObjectMeta {
                name: Some(self.name.clone()),
                namespace: Some(namespace.to_string()),
                annotations: Some(self.hash_annotations()),
                ..Default::default()
            },
            data: Some(BTreeMap::from([(BUNDLE_KEY.to_string(), self.pem())])),
            ..Default::default()
        }
    }

    pub fn volume(&self) -> Volume {
        Volume {
            name: self.name.clone(),
            config_map: Some(ConfigMapVolumeSource {
                name: self.name.clone(),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    pub fn volume_mount(&self) -> VolumeMount {
        VolumeMount {
            name: self.name.clone(),
            mount_path: BUNDLE_MOUNT_DIR.to_string(),
            read_only: Some(true),
            ..Default::default()
        }
    }

    /// Path of the bundle file inside a consuming container.
    pub fn mount_path(&self) -> String {
        format!("{}/{}", BUNDLE_MOUNT_DIR, BUNDLE_KEY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cert(name: &str, body: &str) -> Certificate {
        Certificate::new(name, "warden-operator", body)
    }

    #[test]
    fn insertion_order_does_not_change_fingerprint() {
        let a = cert("a", "AAA");
        let b = cert("b", "BBB");
        let ab = TrustedBundle::new("bundle")
            .add_certificate(a.clone())
            .add_certificate(b.clone());
        let ba = TrustedBundle::new("bundle").add_certificates([b, a]);
        assert_eq!(ab.pem(), ba.pem());
        assert_eq!(ab.fingerprint(), ba.fingerprint());
    }

    #[test]
    fn one_changed_byte_changes_fingerprint() {
        let base = TrustedBundle::new("bundle").add_certificate(cert("a", "AAA"));
        let x = base.add_certificate(cert("b", "BBB"));
        let y = base.add_certificate(cert("b", "BBC"));
        assert_ne!(x.fingerprint(), y.fingerprint());
    }

    #[test]
    fn add_returns_new_value() {
        let base = TrustedBundle::new("bundle").add_certificate(cert("a", "AAA"));
        let extended = base.add_certificate(cert("b", "BBB"));
        assert_eq!(base.len(), 1);
        assert_eq!(extended.len(), 2);
    }

    #[test]
    fn same_identity_replaces_and_duplicate_content_collapses() {
        let bundle = TrustedBundle::new("bundle")
            .add_certificate(cert("a", "OLD"))
            .add_certificate(cert("a", "NEW"));
        assert_eq!(bundle.len(), 1);
        assert!(bundle.pem().contains("NEW"));

        let x = TrustedBundle::new("bundle")
            .add_certificates([cert("b", "SAME"), cert("a", "SAME")]);
        let y = TrustedBundle::new("bundle")
            .add_certificates([cert("a", "SAME"), cert("b", "SAME")]);
        assert_eq!(x.pem().matches("SAME").count(), 1);
        assert_eq!(x.fingerprint(), y.fingerprint());
    }

    #[test]
    fn rotating_one_identity_keeps_shared_content_for_the_other() {
        let rotated = TrustedBundle::new("bundle")
            .add_certificate(cert("a", "SHARED"))
            .add_certificate(cert("b", "SHARED"))
            .add_certificate(cert("a", "ROTATED"));
        let fresh = TrustedBundle::new("bundle")
            .add_certificate(cert("b", "SHARED"))
            .add_certificate(cert("a", "ROTATED"));

        assert_eq!(rotated.len(), 2);
        assert!(rotated.pem().contains("SHARED"));
        assert!(rotated.pem().contains("ROTATED"));
        assert_eq!(rotated, fresh);
        assert_eq!(rotated.fingerprint(), fresh.fingerprint());
    }

    #[test]
    fn config_map_carries_fingerprint_annotation() {
        let bundle = TrustedBundle::new("warden-ca-bundle")
            .add_certificate(cert("a", "AAA"));
        let cm = bundle.config_map("logs");
        let ann = cm.metadata.annotations.unwrap();
        assert_eq!(
            ann.get("hash.warden.io/warden-ca-bundle"),
            Some(&bundle.fingerprint())
        );
        assert!(cm.data.unwrap()[BUNDLE_KEY].contains("AAA"));
        assert_eq!(
            bundle.mount_path(),
            "/etc/pki/tls/certs/tls-ca-bundle.crt"
        );
    }
}
