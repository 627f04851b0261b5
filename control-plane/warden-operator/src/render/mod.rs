//! Component renderers.
//!
//! Each component configuration maps to a [`RenderResult`] without touching
//! the cluster: identical input always yields identical output, and a
//! malformed configuration fails before anything is returned.

mod certificate_management;
mod common;
mod dpi;
mod gateway;
mod guardian;
mod passthrough;
mod resource;
mod topology;


pub use certificate_management::CertificateManagementConfig;
pub use common::{
    Platform, PodSecurity, copy_to_namespace, create_namespace,
    pod_anti_affinity, replica_affinity, secret_fingerprint,
};
pub use dpi::DpiConfig;
pub use gateway::{GATEWAY_PORT, GatewayConfig};
pub use guardian::{GuardianConfig, TUNNEL_CERT_KEY, TUNNEL_KEY_KEY};
pub use passthrough::PassthroughConfig;
pub use resource::{
    RenderError, RenderResult, RenderedResource, ResourceId, Tier,
};
pub use topology::ClusterTopology;

use crate::config::Registry;

pub trait Render {
    /// Value of the component label on every object this renderer owns.
    fn component(&self) -> &str;

    fn render(&self, reg: &Registry) -> Result<RenderResult, RenderError>;
}

/// The closed set of things a driver can ask to have rendered.
#[derive(Clone, Debug, PartialEq)]
pub enum ComponentConfig {
    Dpi(DpiConfig),
    Gateway(GatewayConfig),
    Guardian(GuardianConfig),
    CertificateManagement(CertificateManagementConfig),
    Passthrough(PassthroughConfig),
}

impl ComponentConfig {
    fn inner(&self) -> &dyn Render {
        match self {
            ComponentConfig::Dpi(c) => c,
            ComponentConfig::Gateway(c) => c,
            ComponentConfig::Guardian(c) => c,
            ComponentConfig::CertificateManagement(c) => c,
            ComponentConfig::Passthrough(c) => c,
        }
    }

    pub fn component(&self) -> &str {
        self.inner().component()
    }

    /// Render and check the result before handing it out.
    pub fn render(&self, reg: &Registry) -> Result<RenderResult, RenderError> {
        let result = self.inner().render(reg)?;
        result.validate()?;
        Ok(result)
    }
}

impl From<DpiConfig> for ComponentConfig {
    fn from(c: DpiConfig) -> Self {
        ComponentConfig::Dpi(c)
    }
}

impl From<GatewayConfig> for ComponentConfig {
    fn from(c: GatewayConfig) -> Self {
        ComponentConfig::Gateway(c)
    }
}

impl From<GuardianConfig> for ComponentConfig {
    fn from(c: GuardianConfig) -> Self {
        ComponentConfig::Guardian(c)
    }
}

impl From<CertificateManagementConfig> for ComponentConfig {
    fn from(c: CertificateManagementConfig) -> Self {
        ComponentConfig::CertificateManagement(c)
    }
}

impl From<PassthroughConfig> for ComponentConfig {
    fn from(c: PassthroughConfig) -> Self {
        ComponentConfig::Passthrough(c)
    }
}
