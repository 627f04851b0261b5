use std::collections::HashSet;
use std::fmt;

use k8s_openapi::api::apps::v1::{DaemonSet, Deployment};
use k8s_openapi::api::core::v1::{
    ConfigMap, Namespace, PodTemplateSpec, Secret, Service, ServiceAccount,
};
use k8s_openapi::api::rbac::v1::{
    ClusterRole, ClusterRoleBinding, Role, RoleBinding,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde_json::Value as JsonValue;

/// Identity of a cluster object across reconciliation passes.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceId {
    pub api_version: String,
    pub kind: String,
    pub namespace: Option<String>,
    pub name: String,
}

impl ResourceId {
    pub fn new(
        api_version: impl Into<String>,
        kind: impl Into<String>,
        namespace: Option<&str>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            api_version: api_version.into(),
            kind: kind.into(),
            namespace: namespace.map(str::to_string),
            name: name.into(),
        }
    }

    /// Identity of a typed object kind.
    pub fn of<K>(namespace: Option<&str>, name: &str) -> Self
    where
        K: kube::Resource<DynamicType = ()>,
    {
        Self::new(K::api_version(&()), K::kind(&()), namespace, name)
    }

    /// `(group, version)` split of the api version; core objects have an
    /// empty group.
    pub fn group_version(&self) -> (&str, &str) {
        match self.api_version.split_once('/') {
            Some((g, v)) => (g, v),
            None => ("", self.api_version.as_str()),
        }
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{} {}/{}", self.kind, ns, self.name),
            None => write!(f, "{} {}", self.kind, self.name),
        }
    }
}

/// Dependency tier. Objects of a lower tier are applied before any object of
/// a higher tier; deletion runs in reverse.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Tier {
    Namespace,
    Config,
    Network,
    Workload,
}

impl Tier {
    pub fn of_kind(kind: &str) -> Tier {
        match kind {
            "Namespace" => Tier::Namespace,
            "Service" | "NetworkPolicy" | "Ingress" => Tier::Network,
            "Deployment" | "DaemonSet" | "StatefulSet" | "Job" | "CronJob"
            | "Pod" => Tier::Workload,
            _ => Tier::Config,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum RenderedResource {
    Namespace(Namespace),
    ServiceAccount(ServiceAccount),
    Secret(Secret),
    ConfigMap(ConfigMap),
    ClusterRole(ClusterRole),
    ClusterRoleBinding(ClusterRoleBinding),
    Role(Role),
    RoleBinding(RoleBinding),
    Service(Service),
    Deployment(Deployment),
    DaemonSet(DaemonSet),
    Other {
        api_version: String,
        kind: String,
        manifest: JsonValue,
    },
}

enum Header<'a> {
    Typed(&'static str, &'static str, &'a ObjectMeta),
    Untyped(&'a str, &'a str, &'a JsonValue),
}

macro_rules! typed_resources {
    ($($kind:ident),* $(,)?) => {
        impl RenderedResource {
            fn header(&self) -> Header<'_> {
                match self {
                    $(RenderedResource::$kind(o) => Header::Typed(
                        <$kind as k8s_openapi::Resource>::API_VERSION,
                        <$kind as k8s_openapi::Resource>::KIND,
                        &o.metadata,
                    ),)*
                    RenderedResource::Other { api_version, kind, manifest } => {
                        Header::Untyped(api_version, kind, manifest)
                    }
                }
            }

            /// Full JSON manifest including `apiVersion` and `kind`.
            pub fn to_value(&self) -> Result<JsonValue, serde_json::Error> {
                match self {
                    $(RenderedResource::$kind(o) => serde_json::to_value(o),)*
                    RenderedResource::Other { api_version, kind, manifest } => {
                        let mut v = manifest.clone();
                        if let Some(map) = v.as_object_mut() {
                            map.insert("apiVersion".into(), api_version.clone().into());
                            map.insert("kind".into(), kind.clone().into());
                        }
                        Ok(v)
                    }
                }
            }
        }

        $(impl From<$kind> for RenderedResource {
            fn from(o: $kind) -> Self {
                RenderedResource::$kind(o)
            }
        })*
    };
}

typed_resources!(
    Namespace,
    ServiceAccount,
    Secret,
    ConfigMap,
    ClusterRole,
    ClusterRoleBinding,
    Role,
    RoleBinding,
    Service,
    Deployment,
    DaemonSet,
);

impl RenderedResource {
    pub fn id(&self) -> ResourceId {
        match self.header() {
            Header::Typed(api_version, kind, meta) => ResourceId::new(
                api_version,
                kind,
                meta.namespace.as_deref(),
                meta.name.clone().unwrap_or_default(),
            ),
            Header::Untyped(api_version, kind, manifest) => {
                let meta = manifest.get("metadata");
                let field = |k: &str| {
                    meta.and_then(|m| m.get(k)).and_then(|v| v.as_str())
                };
                ResourceId::new(
                    api_version,
                    kind,
                    field("namespace"),
                    field("name").unwrap_or_default(),
                )
            }
        }
    }

    pub fn kind(&self) -> &str {
        match self.header() {
            Header::Typed(_, kind, _) => kind,
            Header::Untyped(_, kind, _) => kind,
        }
    }

    pub fn tier(&self) -> Tier {
        Tier::of_kind(self.kind())
    }

    pub fn pod_template(&self) -> Option<&PodTemplateSpec> {
        match self {
            RenderedResource::Deployment(d) => d.spec.as_ref().map(|s| &s.template),
            RenderedResource::DaemonSet(d) => d.spec.as_ref().map(|s| &s.template),
            _ => None,
        }
    }
}

/// Objects that must exist and objects that must be removed for one
/// component configuration.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RenderResult {
    pub to_create: Vec<RenderedResource>,
    pub to_delete: Vec<RenderedResource>,
}

impl RenderResult {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(&mut self, r: impl Into<RenderedResource>) {
        self.to_create.push(r.into());
    }

    pub fn delete(&mut self, r: impl Into<RenderedResource>) {
        self.to_delete.push(r.into());
    }

    /// Push into `to_create` when `enabled`, otherwise into `to_delete`.
    pub fn gate(&mut self, enabled: bool, r: impl Into<RenderedResource>) {
        if enabled {
            self.create(r)
        } else {
            self.delete(r)
        }
    }

    pub fn gate_all<I, R>(&mut self, enabled: bool, rs: I)
    where
        I: IntoIterator<Item = R>,
        R: Into<RenderedResource>,
    {
        for r in rs {
            self.gate(enabled, r);
        }
    }

    pub fn create_ids(&self) -> Vec<ResourceId> {
        self.to_create.iter().map(RenderedResource::id).collect()
    }

    pub fn delete_ids(&self) -> Vec<ResourceId> {
        self.to_delete.iter().map(RenderedResource::id).collect()
    }

    /// Check the partition and ordering invariants.
    ///
    /// Every object is named, no identity is both created and deleted, no
    /// identity is created twice, and `to_create` never places an object
    /// before an object of a lower tier.
    pub fn validate(&self) -> Result<(), RenderError> {
        let mut seen = HashSet::new();
        let mut prev: Option<(Tier, ResourceId)> = None;
        for r in &self.to_create {
            let id = r.id();
            if id.name.is_empty() {
                return Err(RenderError::InvalidConfig(format!(
                    "{} has no name",
                    id.kind
                )));
            }
            let tier = r.tier();
            if let Some((prev_tier, prev_id)) = &prev {
                if tier < *prev_tier {
                    return Err(RenderError::OrderingViolation {
                        dependency: id,
                        dependent: prev_id.clone(),
                    });
                }
            }
            if !seen.insert(id.clone()) {
                return Err(RenderError::InvalidConfig(format!(
                    "{id} rendered twice"
                )));
            }
            prev = Some((tier, id));
        }
        for r in &self.to_delete {
            let id = r.id();
            if seen.contains(&id) {
                return Err(RenderError::OverlappingPartition(id));
            }
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum RenderError {
    #[error(
        "having both a ManagementCluster and a ManagementClusterConnection is not supported"
    )]
    ConflictingTopology,

    #[error("missing input: {0}")]
    MissingInput(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("{dependent} is ordered before its dependency {dependency}")]
    OrderingViolation {
        dependency: ResourceId,
        dependent: ResourceId,
    },

    #[error("{0} is both desired and scheduled for deletion")]
    OverlappingPartition(ResourceId),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(ns: Option<&str>, name: &str) -> ObjectMeta {
        ObjectMeta {
            name: Some(name.into()),
            namespace: ns.map(str::to_string),
            ..Default::default()
        }
    }

    fn ns(name: &str) -> Namespace {
        Namespace {
            metadata: meta(None, name),
            ..Default::default()
        }
    }

    fn sa(ns: &str, name: &str) -> ServiceAccount {
        ServiceAccount {
            metadata: meta(Some(ns), name),
            ..Default::default()
        }
    }

    #[test]
    fn typed_identity_uses_api_constants() {
        let id = RenderedResource::from(sa("logs", "gw")).id();
        assert_eq!(id.api_version, "v1");
        assert_eq!(id.kind, "ServiceAccount");
        assert_eq!(id.to_string(), "ServiceAccount logs/gw");
        let role = RenderedResource::from(ClusterRole {
            metadata: meta(None, "gw"),
            ..Default::default()
        });
        assert_eq!(role.id().group_version(), ("rbac.authorization.k8s.io", "v1"));
    }

    #[test]
    fn other_identity_reads_manifest() {
        let r = RenderedResource::Other {
            api_version: "policy/v1".into(),
            kind: "PodDisruptionBudget".into(),
            manifest: serde_json::json!({"metadata": {"name": "pdb", "namespace": "logs"}}),
        };
        assert_eq!(r.id().namespace.as_deref(), Some("logs"));
        assert_eq!(r.tier(), Tier::Config);
        let v = r.to_value().unwrap();
        assert_eq!(v["kind"], "PodDisruptionBudget");
    }

    #[test]
    fn validate_rejects_overlap_and_bad_order() {
        let mut ok = RenderResult::new();
        ok.create(ns("a"));
        ok.create(sa("a", "x"));
        ok.delete(sa("a", "y"));
        assert!(ok.validate().is_ok());

        let mut overlap = ok.clone();
        overlap.delete(sa("a", "x"));
        assert!(matches!(
            overlap.validate(),
            Err(RenderError::OverlappingPartition(_))
        ));

        let mut order = RenderResult::new();
        order.create(sa("a", "x"));
        order.create(ns("a"));
        assert!(matches!(
            order.validate(),
            Err(RenderError::OrderingViolation { .. })
        ));

        let mut dup = RenderResult::new();
        dup.create(sa("a", "x"));
        dup.create(sa("a", "x"));
        assert!(dup.validate().is_err());
    }
}
