//! Root signing authority and leaf issuance.
//!
//! The authority is a self-signed CA whose key never leaves the operator
//! namespace. Leaf certificates carry both server and client usages so the
//! same key pair serves either end of a TLS connection.

use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, DnValue,
    ExtendedKeyUsagePurpose, IsCa, Issuer, KeyPair as RcgenKeyPair,
    KeyUsagePurpose, SanType, string::Ia5String,
};
use x509_parser::prelude::*;

use crate::error::{PkiError, Result};

/// Validity period for the root authority (10 years).
pub const CA_VALIDITY_DAYS: i64 = 3650;

/// Validity period for issued leaf certificates (1 year).
pub const LEAF_VALIDITY_DAYS: i64 = 365;

/// Fraction of a certificate's lifetime after which it is reissued.
pub const ROTATION_THRESHOLD: f64 = 0.80;

const ORGANIZATION: &str = "Warden";

fn compute_validity(days: i64) -> (::time::OffsetDateTime, ::time::OffsetDateTime) {
    let now = ::time::OffsetDateTime::now_utc();
    (now, now + ::time::Duration::days(days))
}

fn now_unix() -> i64 {
    ::time::OffsetDateTime::now_utc().unix_timestamp()
}

/// Parse PEM-encoded data and return the DER bytes.
pub fn parse_pem(pem_data: &str) -> Result<Vec<u8>> {
    let pem_obj = ::pem::parse(pem_data.as_bytes())
        .map_err(|e| PkiError::Parse(format!("failed to parse PEM: {}", e)))?;
    Ok(pem_obj.contents().to_vec())
}

/// Validity, naming and SAN details extracted from a certificate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateInfo {
    pub not_before: i64,
    pub not_after: i64,
    pub subject: String,
    pub issuer: String,
    pub dns_names: Vec<String>,
}

impl CertificateInfo {
    pub fn from_pem(pem_data: &str) -> Result<Self> {
        let der = parse_pem(pem_data)?;
        Self::from_der(&der)
    }

    pub fn from_der(der: &[u8]) -> Result<Self> {
        let (_, cert) = X509Certificate::from_der(der).map_err(|e| {
            PkiError::Parse(format!("failed to parse certificate: {}", e))
        })?;

        let mut dns_names = Vec::new();
        if let Ok(Some(san)) = cert.subject_alternative_name() {
            for name in &san.value.general_names {
                match name {
                    GeneralName::DNSName(dns) => {
                        dns_names.push(dns.to_string())
                    }
                    GeneralName::IPAddress(bytes) => {
                        if let Some(ip) = ip_from_bytes(bytes) {
                            dns_names.push(ip.to_string());
                        }
                    }
                    _ => {}
                }
            }
        }

        Ok(Self {
            not_before: cert.validity().not_before.timestamp(),
            not_after: cert.validity().not_after.timestamp(),
            subject: cert.subject().to_string(),
            issuer: cert.issuer().to_string(),
            dns_names,
        })
    }

    pub fn lifetime_secs(&self) -> i64 {
        self.not_after - self.not_before
    }

    pub fn is_expired(&self) -> bool {
        self.not_after <= now_unix()
    }

    /// True once [`ROTATION_THRESHOLD`] of the lifetime has elapsed.
    pub fn needs_rotation(&self) -> bool {
        let lifetime = self.lifetime_secs();
        if lifetime <= 0 {
            return true;
        }
        let age = (now_unix() - self.not_before) as f64;
        age / lifetime as f64 >= ROTATION_THRESHOLD
    }

    /// Whether every requested name appears in the certificate SANs.
    pub fn covers(&self, dns_names: &[String]) -> bool {
        dns_names.iter().all(|n| self.dns_names.contains(n))
    }
}

fn ip_from_bytes(bytes: &[u8]) -> Option<std::net::IpAddr> {
    match bytes.len() {
        4 => {
            let b: [u8; 4] = bytes.try_into().ok()?;
            Some(std::net::IpAddr::from(b))
        }
        16 => {
            let b: [u8; 16] = bytes.try_into().ok()?;
            Some(std::net::IpAddr::from(b))
        }
        _ => None,
    }
}

fn distinguished_name(common_name: &str) -> DistinguishedName {
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, DnValue::Utf8String(common_name.to_string()));
    dn.push(
        DnType::OrganizationName,
        DnValue::Utf8String(ORGANIZATION.to_string()),
    );
    dn
}

fn subject_alt_names(names: &[String]) -> Result<Vec<SanType>> {
    names
        .iter()
        .map(|san| {
            if let Ok(ip) = san.parse::<std::net::IpAddr>() {
                Ok(SanType::IpAddress(ip))
            } else {
                Ia5String::try_from(san.to_string())
                    .map(SanType::DnsName)
                    .map_err(|_| PkiError::InvalidDnsName(san.clone()))
            }
        })
        .collect()
}

/// Self-signed certificate authority.
///
/// The key is kept in PEM form since the rcgen key type is not `Clone`.
#[derive(Clone)]
pub struct CertificateAuthority {
    ca_key_pem: String,
    ca_cert_pem: String,
}

impl std::fmt::Debug for CertificateAuthority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateAuthority")
            .field("ca_cert_pem", &self.ca_cert_pem)
            .finish_non_exhaustive()
    }
}

impl CertificateAuthority {
    /// Generate a fresh self-signed authority.
    pub fn generate(common_name: &str) -> Result<Self> {
        let mut params = CertificateParams::default();
        params.distinguished_name = distinguished_name(common_name);
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        let (not_before, not_after) = compute_validity(CA_VALIDITY_DAYS);
        params.not_before = not_before;
        params.not_after = not_after;

        let key_pair = RcgenKeyPair::generate().map_err(|e| {
            PkiError::KeyGeneration(format!("failed to generate CA key: {}", e))
        })?;
        let cert = params.self_signed(&key_pair).map_err(|e| {
            PkiError::CertificateGeneration(format!(
                "failed to create CA cert: {}",
                e
            ))
        })?;

        Ok(Self {
            ca_key_pem: key_pair.serialize_pem(),
            ca_cert_pem: cert.pem(),
        })
    }

    /// Load an authority from stored PEM material, validating both halves.
    pub fn from_pem(cert_pem: &str, key_pem: &str) -> Result<Self> {
        RcgenKeyPair::from_pem(key_pem).map_err(|e| {
            PkiError::Parse(format!("failed to parse CA key: {}", e))
        })?;
        CertificateInfo::from_pem(cert_pem)?;
        Ok(Self {
            ca_key_pem: key_pem.to_string(),
            ca_cert_pem: cert_pem.to_string(),
        })
    }

    pub fn ca_cert_pem(&self) -> &str {
        &self.ca_cert_pem
    }

    pub fn ca_key_pem(&self) -> &str {
        &self.ca_key_pem
    }

    pub fn cert_info(&self) -> Result<CertificateInfo> {
        CertificateInfo::from_pem(&self.ca_cert_pem)
    }

    fn load_key_pair(&self) -> Result<RcgenKeyPair> {
        RcgenKeyPair::from_pem(&self.ca_key_pem).map_err(|e| {
            PkiError::Parse(format!("failed to load CA key: {}", e))
        })
    }

    /// Issue a leaf certificate for `dns_names`, returning `(cert, key)` PEM.
    pub fn issue(
        &self,
        common_name: &str,
        dns_names: &[String],
    ) -> Result<(String, String)> {
        let mut params = CertificateParams::default();
        params.distinguished_name = distinguished_name(common_name);
        params.is_ca = IsCa::NoCa;
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![
            ExtendedKeyUsagePurpose::ServerAuth,
            ExtendedKeyUsagePurpose::ClientAuth,
        ];
        let (not_before, not_after) = compute_validity(LEAF_VALIDITY_DAYS);
        params.not_before = not_before;
        params.not_after = not_after;
        params.subject_alt_names = subject_alt_names(dns_names)?;

        let leaf_key = RcgenKeyPair::generate().map_err(|e| {
            PkiError::KeyGeneration(format!(
                "failed to generate key for {}: {}",
                common_name, e
            ))
        })?;

        let ca_key = self.load_key_pair()?;
        let issuer = Issuer::from_ca_cert_pem(&self.ca_cert_pem, &ca_key)
            .map_err(|e| {
                PkiError::Parse(format!("failed to create issuer: {}", e))
            })?;
        let cert = params.signed_by(&leaf_key, &issuer).map_err(|e| {
            PkiError::CertificateGeneration(format!(
                "failed to sign certificate for {}: {}",
                common_name, e
            ))
        })?;

        Ok((cert.pem(), leaf_key.serialize_pem()))
    }

    /// True when `info` was signed by this authority.
    pub fn issued(&self, info: &CertificateInfo) -> Result<bool> {
        Ok(info.issuer == self.cert_info()?.subject)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(n: &[&str]) -> Vec<String> {
        n.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn generated_authority_round_trips_through_pem() {
        let ca = CertificateAuthority::generate("warden-ca@1").unwrap();
        let loaded =
            CertificateAuthority::from_pem(ca.ca_cert_pem(), ca.ca_key_pem())
                .unwrap();
        assert_eq!(loaded.ca_cert_pem(), ca.ca_cert_pem());
        let info = loaded.cert_info().unwrap();
        assert_eq!(info.subject, info.issuer, "root must be self-signed");
        assert!(!info.is_expired());
        assert!(!info.needs_rotation());
    }

    #[test]
    fn issued_leaf_carries_sans_and_issuer() {
        let ca = CertificateAuthority::generate("warden-ca@2").unwrap();
        let dns = names(&["gw", "gw.logs", "gw.logs.svc", "10.0.0.7"]);
        let (cert, key) = ca.issue("gw", &dns).unwrap();
        assert!(key.contains("PRIVATE KEY"));
        let info = CertificateInfo::from_pem(&cert).unwrap();
        assert!(info.covers(&dns));
        assert!(!info.covers(&names(&["other"])));
        assert!(ca.issued(&info).unwrap());

        let other = CertificateAuthority::generate("warden-ca@3").unwrap();
        assert!(!other.issued(&info).unwrap());
    }

    #[test]
    fn from_pem_rejects_garbage() {
        let err =
            CertificateAuthority::from_pem("not pem", "not a key").unwrap_err();
        assert!(matches!(err, PkiError::Parse(_)));
    }

    #[test]
    fn invalid_dns_name_is_reported() {
        let ca = CertificateAuthority::generate("warden-ca@4").unwrap();
        let err = ca.issue("x", &names(&["bad\u{00e9}name"])).unwrap_err();
        assert!(matches!(err, PkiError::InvalidDnsName(n) if n == "bad\u{00e9}name"));
    }
}
