use std::sync::Arc;

use futures_util::future::join_all;
use warden_pki::store::MemorySecretStore;
use warden_pki::{
    Certificate, CertificateManager, ManagerSettings, SecretStore,
};

#[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn concurrent_first_use_elects_a_single_authority() {
    let store = MemorySecretStore::new();
    let shared: Arc<dyn SecretStore> = Arc::new(store.clone());

    let passes = (0..8).map(|_| {
        let store = shared.clone();
        tokio::spawn(async move {
            CertificateManager::create(store, ManagerSettings::default()).await
        })
    });
    let managers: Vec<_> = join_all(passes)
        .await
        .into_iter()
        .map(|joined| joined.unwrap().unwrap())
        .collect();

    assert_eq!(store.len().await, 1);
    let first = managers[0].ca_certificate();
    for m in &managers[1..] {
        assert_eq!(m.ca_certificate(), first);
    }
}

#[test_log::test(tokio::test)]
async fn bundle_fingerprint_is_order_independent_and_content_sensitive() {
    let store: Arc<dyn SecretStore> = Arc::new(MemorySecretStore::new());
    let mgr = CertificateManager::create(store, ManagerSettings::default())
        .await
        .unwrap();

    let a = mgr
        .get_or_create_key_pair("a-tls", "ns", &["a".to_string()])
        .await
        .unwrap()
        .certificate()
        .unwrap();
    let b = mgr
        .get_or_create_key_pair("b-tls", "ns", &["b".to_string()])
        .await
        .unwrap()
        .certificate()
        .unwrap();

    let ab = mgr.create_trusted_bundle([a.clone(), b.clone()]);
    let ba = mgr.create_trusted_bundle([b.clone(), a.clone()]);
    assert_eq!(ab.fingerprint(), ba.fingerprint());

    let mut tampered = b.cert_pem.clone().into_bytes();
    let idx = tampered.len() / 2;
    tampered[idx] = if tampered[idx] == b'A' { b'B' } else { b'A' };
    let tampered = Certificate::new(
        &b.name,
        &b.namespace,
        String::from_utf8(tampered).unwrap(),
    );
    let changed = mgr.create_trusted_bundle([a, tampered]);
    assert_ne!(ab.fingerprint(), changed.fingerprint());
    assert_ne!(ab.hash_annotations(), changed.hash_annotations());
}
