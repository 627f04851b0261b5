//! Certificate authority, key pair and trust bundle management for the
//! warden operator.
//!
//! The [`CertificateManager`] owns (or discovers) the cluster signing
//! authority, hands out [`KeyPair`]s for workloads and aggregates
//! certificates into a [`TrustedBundle`]. Every produced value is immutable;
//! rotation yields a new value with a new fingerprint.

pub mod authority;
pub mod bundle;
pub mod dns;
pub mod error;
pub mod keypair;
pub mod manager;
pub mod store;

pub use authority::{CertificateAuthority, CertificateInfo};
pub use bundle::TrustedBundle;
pub use dns::service_dns_names;
pub use error::*;
pub use keypair::{Certificate, Issuer, KeyPair};
pub use manager::{CertificateManagement, CertificateManager, ManagerSettings};
pub use store::{SecretStore, StoredSecret};

use sha2::{Digest, Sha256};

/// Annotation key prefix used for every material fingerprint stamped on a
/// pod template.
pub const HASH_ANNOTATION_PREFIX: &str = "hash.warden.io/";

/// Secret data key holding the PEM certificate.
pub const TLS_CERT_KEY: &str = "tls.crt";
/// Secret data key holding the PEM private key.
pub const TLS_KEY_KEY: &str = "tls.key";

/// Hex encoded SHA-256 digest of `bytes`.
///
/// Fingerprints are persisted in annotations, so they must be stable across
/// toolchain versions; never swap this for `DefaultHasher`.
pub fn fingerprint(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Annotation key for a named material source.
pub fn hash_annotation_key(name: &str) -> String {
    format!("{}{}", HASH_ANNOTATION_PREFIX, name)
}
