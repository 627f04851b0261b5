use std::sync::Arc;

use k8s_openapi::api::core::v1::Secret;
use tracing::{debug, info, instrument, warn};

use crate::authority::{CertificateAuthority, CertificateInfo};
use crate::bundle::TrustedBundle;
use crate::dns::service_dns_names;
use crate::error::{PkiError, Result, StoreError};
use crate::keypair::{Certificate, Issuer, KeyPair};
use crate::store::{SecretStore, StoredSecret};
use crate::{TLS_CERT_KEY, TLS_KEY_KEY};

/// External issuer integration. When configured the operator never holds
/// private keys; pods obtain their certificates from `signer_name` at start.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CertificateManagement {
    pub ca_cert_pem: String,
    pub signer_name: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ManagerSettings {
    pub operator_namespace: String,
    pub ca_secret_name: String,
    pub bundle_name: String,
    pub cluster_domain: String,
    pub certificate_management: Option<CertificateManagement>,
}

impl Default for ManagerSettings {
    fn default() -> Self {
        Self {
            operator_namespace: "warden-operator".to_string(),
            ca_secret_name: "warden-ca-private".to_string(),
            bundle_name: "warden-ca-bundle".to_string(),
            cluster_domain: "cluster.local".to_string(),
            certificate_management: None,
        }
    }
}

/// Hands out key pairs and trust bundles backed by a single signing
/// authority.
///
/// Built once per reconciliation pass. Cheap to clone; every clone shares
/// the same store.
#[derive(Clone)]
pub struct CertificateManager {
    store: Arc<dyn SecretStore>,
    settings: ManagerSettings,
    authority: Option<CertificateAuthority>,
}

impl CertificateManager {
    /// Load the signing authority, provisioning it on first use.
    ///
    /// Concurrent first use is resolved by the store's create-once
    /// semantics: the loser of the race adopts the winner's authority.
    #[instrument(skip_all, fields(ns = %settings.operator_namespace))]
    pub async fn create(
        store: Arc<dyn SecretStore>,
        settings: ManagerSettings,
    ) -> Result<Self> {
        let authority = if settings.certificate_management.is_some() {
            debug!("certificate management enabled, skipping local authority");
            None
        } else {
            Some(load_or_provision(store.as_ref(), &settings).await?)
        };
        Ok(Self {
            store,
            settings,
            authority,
        })
    }

    pub fn settings(&self) -> &ManagerSettings {
        &self.settings
    }

    pub fn use_certificate_management(&self) -> bool {
        self.settings.certificate_management.is_some()
    }

    /// DNS names for a service in this cluster's domain.
    pub fn service_dns_names(&self, service: &str, namespace: &str) -> Vec<String> {
        service_dns_names(service, namespace, &self.settings.cluster_domain)
    }

    /// Key pair for `name` in `namespace` covering `dns_names`.
    ///
    /// Material signed by our authority is reused while it still covers the
    /// requested names and is not due for rotation, and reissued otherwise.
    /// Material from any other issuer is left alone. Newly issued pairs are
    /// not persisted here; the caller renders them as secrets.
    #[instrument(skip(self, dns_names))]
    pub async fn get_or_create_key_pair(
        &self,
        name: &str,
        namespace: &str,
        dns_names: &[String],
    ) -> Result<KeyPair> {
        if let Some(cm) = &self.settings.certificate_management {
            return Ok(KeyPair::certificate_managed(
                name,
                namespace,
                dns_names.to_vec(),
                &cm.ca_cert_pem,
                &cm.signer_name,
            ));
        }
        let authority = self.authority()?;

        if let Some(secret) = self.store.get(name, namespace).await? {
            let (cert_pem, key_pem) = tls_material(&secret)?;
            let info = CertificateInfo::from_pem(cert_pem).map_err(|e| {
                invalid_secret(&secret, e.to_string())
            })?;
            if !authority.issued(&info)? {
                debug!("keeping user supplied certificate");
                return Ok(KeyPair::new(
                    name,
                    namespace,
                    dns_names.to_vec(),
                    cert_pem.to_string(),
                    key_pem.to_string(),
                    Issuer::UserSupplied,
                ));
            }
            if info.covers(dns_names)
                && !info.is_expired()
                && !info.needs_rotation()
            {
                return Ok(KeyPair::new(
                    name,
                    namespace,
                    dns_names.to_vec(),
                    cert_pem.to_string(),
                    key_pem.to_string(),
                    Issuer::OperatorCa,
                ));
            }
            info!("reissuing certificate (names changed or rotation due)");
        }

        let common_name = dns_names.first().map(String::as_str).unwrap_or(name);
        let (cert_pem, key_pem) = authority.issue(common_name, dns_names)?;
        Ok(KeyPair::new(
            name,
            namespace,
            dns_names.to_vec(),
            cert_pem,
            key_pem,
            Issuer::OperatorCa,
        ))
    }

    /// Existing key pair, or `None` if no secret has been created yet.
    pub async fn get_key_pair(
        &self,
        name: &str,
        namespace: &str,
    ) -> Result<Option<KeyPair>> {
        let Some(secret) = self.store.get(name, namespace).await? else {
            return Ok(None);
        };
        let (cert_pem, key_pem) = tls_material(&secret)?;
        let info = CertificateInfo::from_pem(cert_pem)
            .map_err(|e| invalid_secret(&secret, e.to_string()))?;
        let issuer = match &self.authority {
            Some(ca) if ca.issued(&info)? => Issuer::OperatorCa,
            _ => Issuer::UserSupplied,
        };
        Ok(Some(KeyPair::new(
            name,
            namespace,
            info.dns_names,
            cert_pem.to_string(),
            key_pem.to_string(),
            issuer,
        )))
    }

    /// Public certificate stored under `name`, without its key.
    pub async fn get_certificate(
        &self,
        name: &str,
        namespace: &str,
    ) -> Result<Option<Certificate>> {
        let Some(secret) = self.store.get(name, namespace).await? else {
            return Ok(None);
        };
        let cert_pem = secret
            .get_str(TLS_CERT_KEY)
            .ok_or_else(|| invalid_secret(&secret, format!("missing {TLS_CERT_KEY}")))?;
        Ok(Some(Certificate::new(name, namespace, cert_pem)))
    }

    /// The authority as a key pair. `None` with certificate management.
    pub fn ca_key_pair(&self) -> Option<KeyPair> {
        self.authority.as_ref().map(|ca| {
            KeyPair::new(
                &self.settings.ca_secret_name,
                &self.settings.operator_namespace,
                Vec::new(),
                ca.ca_cert_pem().to_string(),
                ca.ca_key_pem().to_string(),
                Issuer::SelfSigned,
            )
        })
    }

    /// Certificate every consumer must trust.
    pub fn ca_certificate(&self) -> Certificate {
        let pem = match (&self.authority, &self.settings.certificate_management) {
            (Some(ca), _) => ca.ca_cert_pem(),
            (None, Some(cm)) => cm.ca_cert_pem.as_str(),
            (None, None) => "",
        };
        Certificate::new(
            &self.settings.ca_secret_name,
            &self.settings.operator_namespace,
            pem,
        )
    }

    /// Secret persisting the authority in the operator namespace.
    pub fn ca_secret(&self) -> Option<Secret> {
        self.ca_key_pair()
            .and_then(|kp| kp.to_secret(&self.settings.operator_namespace))
    }

    /// Bundle of the authority plus `certs`.
    pub fn create_trusted_bundle<I>(&self, certs: I) -> TrustedBundle
    where
        I: IntoIterator<Item = Certificate>,
    {
        TrustedBundle::new(&self.settings.bundle_name)
            .add_certificate(self.ca_certificate())
            .add_certificates(certs)
    }

    /// `(name, issuer)` for every pair, sorted by name.
    pub fn keys_status<'a, I>(&self, pairs: I) -> Vec<(String, Issuer)>
    where
        I: IntoIterator<Item = &'a KeyPair>,
    {
        let mut out: Vec<_> = pairs
            .into_iter()
            .map(|kp| (kp.name().to_string(), kp.issuer()))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    fn authority(&self) -> Result<&CertificateAuthority> {
        self.authority.as_ref().ok_or_else(|| {
            PkiError::CaUnavailable("no local authority configured".into())
        })
    }
}

async fn load_or_provision(
    store: &dyn SecretStore,
    settings: &ManagerSettings,
) -> Result<CertificateAuthority> {
    let name = &settings.ca_secret_name;
    let ns = &settings.operator_namespace;

    if let Some(secret) = store.get(name, ns).await? {
        return authority_from_secret(&secret);
    }

    let cn = format!(
        "warden-ca@{}",
        time::OffsetDateTime::now_utc().unix_timestamp()
    );
    let ca = CertificateAuthority::generate(&cn)
        .map_err(|e| PkiError::CaUnavailable(e.to_string()))?;
    let secret = StoredSecret::new(name.as_str(), ns.as_str())
        .with_data(TLS_CERT_KEY, ca.ca_cert_pem())
        .with_data(TLS_KEY_KEY, ca.ca_key_pem());

    match store.create(&secret).await {
        Ok(()) => {
            info!(secret = %name, "provisioned certificate authority");
            Ok(ca)
        }
        Err(StoreError::AlreadyExists(_)) => {
            debug!(secret = %name, "authority created concurrently, adopting it");
            let winner = store.get(name, ns).await?.ok_or_else(|| {
                PkiError::CaUnavailable(format!(
                    "{ns}/{name} reported existing but could not be read"
                ))
            })?;
            authority_from_secret(&winner)
        }
        Err(e) => Err(e.into()),
    }
}

fn authority_from_secret(secret: &StoredSecret) -> Result<CertificateAuthority> {
    let unavailable = |reason: String| {
        warn!(ns = %secret.namespace, name = %secret.name, %reason, "authority secret unusable");
        PkiError::CaUnavailable(format!(
            "{}/{}: {}",
            secret.namespace, secret.name, reason
        ))
    };
    let cert = secret
        .get_str(TLS_CERT_KEY)
        .ok_or_else(|| unavailable(format!("missing {TLS_CERT_KEY}")))?;
    let key = secret
        .get_str(TLS_KEY_KEY)
        .ok_or_else(|| unavailable(format!("missing {TLS_KEY_KEY}")))?;
    CertificateAuthority::from_pem(cert, key).map_err(|e| unavailable(e.to_string()))
}

fn tls_material(secret: &StoredSecret) -> Result<(&str, &str)> {
    let cert = secret
        .get_str(TLS_CERT_KEY)
        .ok_or_else(|| invalid_secret(secret, format!("missing {TLS_CERT_KEY}")))?;
    let key = secret
        .get_str(TLS_KEY_KEY)
        .ok_or_else(|| invalid_secret(secret, format!("missing {TLS_KEY_KEY}")))?;
    Ok((cert, key))
}

fn invalid_secret(secret: &StoredSecret, reason: String) -> PkiError {
    PkiError::InvalidSecret {
        name: secret.name.clone(),
        namespace: secret.namespace.clone(),
        reason,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemorySecretStore;

    fn names(n: &[&str]) -> Vec<String> {
        n.iter().map(|s| s.to_string()).collect()
    }

    async fn manager(store: &MemorySecretStore) -> CertificateManager {
        CertificateManager::create(
            Arc::new(store.clone()),
            ManagerSettings::default(),
        )
        .await
        .unwrap()
    }

    async fn persist(store: &MemorySecretStore, kp: &KeyPair) {
        store
            .put(
                StoredSecret::new(kp.name(), kp.namespace())
                    .with_data(TLS_CERT_KEY, kp.cert_pem().unwrap())
                    .with_data(TLS_KEY_KEY, kp.key_pem().unwrap()),
            )
            .await;
    }

    #[test_log::test(tokio::test)]
    async fn authority_is_provisioned_once() {
        let store = MemorySecretStore::new();
        let first = manager(&store).await;
        let second = manager(&store).await;
        assert_eq!(store.len().await, 1);
        assert_eq!(first.ca_certificate(), second.ca_certificate());
    }

    #[test_log::test(tokio::test)]
    async fn corrupt_authority_secret_is_unavailable_not_transport() {
        let store = MemorySecretStore::new();
        store.put(
            StoredSecret::new("warden-ca-private", "warden-operator")
                .with_data(TLS_CERT_KEY, "garbage"),
        )
        .await;
        let err = CertificateManager::create(
            Arc::new(store.clone()),
            ManagerSettings::default(),
        )
        .await
        .err()
        .unwrap();
        assert!(matches!(err, PkiError::CaUnavailable(_)));
        assert!(!err.is_transport());
    }

    #[test_log::test(tokio::test)]
    async fn existing_valid_pair_is_reused() {
        let store = MemorySecretStore::new();
        let mgr = manager(&store).await;
        let dns = names(&["gw", "gw.logs"]);
        let first = mgr.get_or_create_key_pair("gw-tls", "logs", &dns).await.unwrap();
        persist(&store, &first).await;
        let again = mgr.get_or_create_key_pair("gw-tls", "logs", &dns).await.unwrap();
        assert_eq!(first.fingerprint(), again.fingerprint());
        assert_eq!(again.issuer(), Issuer::OperatorCa);
    }

    #[test_log::test(tokio::test)]
    async fn changed_dns_names_trigger_reissue() {
        let store = MemorySecretStore::new();
        let mgr = manager(&store).await;
        let first = mgr
            .get_or_create_key_pair("gw-tls", "logs", &names(&["gw"]))
            .await
            .unwrap();
        persist(&store, &first).await;
        let second = mgr
            .get_or_create_key_pair("gw-tls", "logs", &names(&["gw", "gw.logs"]))
            .await
            .unwrap();
        assert_ne!(first.fingerprint(), second.fingerprint());
    }

    #[test_log::test(tokio::test)]
    async fn foreign_certificate_is_kept_as_user_supplied() {
        let store = MemorySecretStore::new();
        let mgr = manager(&store).await;
        let foreign = CertificateAuthority::generate("someone-else").unwrap();
        let (cert, key) = foreign.issue("gw", &names(&["gw"])).unwrap();
        store.put(
            StoredSecret::new("gw-tls", "logs")
                .with_data(TLS_CERT_KEY, cert.as_str())
                .with_data(TLS_KEY_KEY, key.as_str()),
        )
        .await;
        let kp = mgr
            .get_or_create_key_pair("gw-tls", "logs", &names(&["gw", "other"]))
            .await
            .unwrap();
        assert_eq!(kp.issuer(), Issuer::UserSupplied);
        assert_eq!(kp.cert_pem(), Some(cert.as_str()));
    }

    #[test_log::test(tokio::test)]
    async fn lookups_distinguish_absent_from_present() {
        let store = MemorySecretStore::new();
        let mgr = manager(&store).await;
        assert!(mgr.get_key_pair("gw-tls", "logs").await.unwrap().is_none());
        assert!(mgr.get_certificate("gw-tls", "logs").await.unwrap().is_none());

        let kp = mgr
            .get_or_create_key_pair("gw-tls", "logs", &names(&["gw"]))
            .await
            .unwrap();
        persist(&store, &kp).await;
        let found = mgr.get_key_pair("gw-tls", "logs").await.unwrap().unwrap();
        assert_eq!(found.fingerprint(), kp.fingerprint());
        let cert = mgr.get_certificate("gw-tls", "logs").await.unwrap().unwrap();
        assert_eq!(cert.fingerprint, kp.fingerprint());
    }

    #[test_log::test(tokio::test)]
    async fn certificate_management_never_generates_locally() {
        let store = MemorySecretStore::new();
        let settings = ManagerSettings {
            certificate_management: Some(CertificateManagement {
                ca_cert_pem: "EXTERNAL".into(),
                signer_name: "example.com/signer".into(),
            }),
            ..Default::default()
        };
        let mgr = CertificateManager::create(Arc::new(store.clone()), settings)
            .await
            .unwrap();
        assert_eq!(store.len().await, 0);
        assert!(mgr.ca_key_pair().is_none());
        assert!(mgr.ca_secret().is_none());
        let kp = mgr
            .get_or_create_key_pair("gw-tls", "logs", &names(&["gw"]))
            .await
            .unwrap();
        assert!(kp.use_certificate_management());
        assert!(mgr.create_trusted_bundle([]).pem().contains("EXTERNAL"));
    }

    #[test_log::test(tokio::test)]
    async fn bundle_is_seeded_with_authority() {
        let store = MemorySecretStore::new();
        let mgr = manager(&store).await;
        let bundle = mgr.create_trusted_bundle([Certificate::new("peer", "logs", "PEER")]);
        assert_eq!(bundle.len(), 2);
        assert!(bundle.pem().contains(mgr.ca_certificate().cert_pem.trim()));
        assert!(mgr.ca_secret().is_some());
    }
}
