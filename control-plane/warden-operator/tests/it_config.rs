mod common;

use envconfig::Envconfig;
use warden_operator::config::{OperatorConfig, Registry};
use warden_operator::crd::{InstallationSpec, Provider};

use common::set_env;

#[test]
fn registry_follows_the_environment() {
    let _ns = set_env("WARDEN_OPERATOR_NAMESPACE", "security-ops");
    let _provider = set_env("WARDEN_KUBERNETES_PROVIDER", "OpenShift");
    let _registry = set_env("WARDEN_IMAGE_REGISTRY", "mirror.local");
    let _resync = set_env("WARDEN_RESYNC_SECS", "60");

    let cfg = OperatorConfig::init_from_env().unwrap();
    let reg = Registry::from_config(&cfg);

    assert_eq!(reg.operator_namespace, "security-ops");
    assert_eq!(reg.manager_settings().operator_namespace, "security-ops");
    assert_eq!(reg.retry.resync.as_secs(), 60);
    assert_eq!(
        reg.image(&reg.images.dpi, None),
        "mirror.local/warden/dpi:v0.1.0"
    );

    let spec = InstallationSpec {
        kubernetes_provider: Some(Provider::Eks),
        ..Default::default()
    };
    assert_eq!(
        spec.provider(reg.provider_override.as_deref()),
        Provider::OpenShift
    );
}
