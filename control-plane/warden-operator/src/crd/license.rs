use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema, Default)]
#[kube(
    group = "operator.warden.io",
    version = "v1",
    kind = "LicenseKey",
    plural = "licensekeys"
)]
#[serde(rename_all = "camelCase")]
pub struct LicenseKeySpec {
    /// Feature identifiers this license grants.
    #[serde(default)]
    pub features: Vec<String>,
    /// RFC 3339 expiry; no expiry means perpetual.
    pub expiry: Option<String>,
}

impl LicenseKeySpec {
    /// A feature is active when granted and the license has not expired.
    /// An unparseable expiry counts as expired.
    pub fn is_feature_active(&self, feature: &str, now: DateTime<Utc>) -> bool {
        if !self.features.iter().any(|f| f == feature) {
            return false;
        }
        match self.expiry.as_deref() {
            None => true,
            Some(raw) => DateTime::parse_from_rfc3339(raw)
                .map(|exp| exp.with_timezone(&Utc) > now)
                .unwrap_or(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(features: &[&str], expiry: Option<&str>) -> LicenseKeySpec {
        LicenseKeySpec {
            features: features.iter().map(|s| s.to_string()).collect(),
            expiry: expiry.map(str::to_string),
        }
    }

    #[test]
    fn feature_gating() {
        let now = Utc::now();
        assert!(spec(&["a"], None).is_feature_active("a", now));
        assert!(!spec(&["a"], None).is_feature_active("b", now));
        assert!(!spec(&["a"], Some("2001-01-01T00:00:00Z")).is_feature_active("a", now));
        assert!(spec(&["a"], Some("2999-01-01T00:00:00Z")).is_feature_active("a", now));
        assert!(!spec(&["a"], Some("soon")).is_feature_active("a", now));
    }
}
