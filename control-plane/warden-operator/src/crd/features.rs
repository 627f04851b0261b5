use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::ResourceRequirements;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::status::FeatureStatus;

/// Enables intrusion detection, including deep packet inspection.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema, Default)]
#[kube(
    group = "operator.warden.io",
    version = "v1",
    kind = "IntrusionDetection",
    plural = "intrusiondetections",
    status = "FeatureStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct IntrusionDetectionSpec {
    pub component_resources: Option<Vec<ComponentResource>>,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ComponentResource {
    /// e.g. "DeepPacketInspection"
    pub component_name: String,
    pub limits: Option<BTreeMap<String, String>>,
    pub requests: Option<BTreeMap<String, String>>,
}

impl ComponentResource {
    pub fn requirements(&self) -> ResourceRequirements {
        let q = |m: &Option<BTreeMap<String, String>>| {
            m.as_ref().map(|m| {
                m.iter()
                    .map(|(k, v)| (k.clone(), Quantity(v.clone())))
                    .collect()
            })
        };
        ResourceRequirements {
            limits: q(&self.limits),
            requests: q(&self.requests),
            ..Default::default()
        }
    }
}

impl IntrusionDetectionSpec {
    pub fn resources_for(&self, component: &str) -> Option<ResourceRequirements> {
        self.component_resources
            .iter()
            .flatten()
            .find(|c| c.component_name == component)
            .map(ComponentResource::requirements)
    }
}

/// Selects the endpoints deep packet inspection runs against. Its mere
/// existence switches the DPI workload on.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema, Default)]
#[kube(
    group = "operator.warden.io",
    version = "v1",
    kind = "DeepPacketInspection",
    plural = "deeppacketinspections",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct DeepPacketInspectionSpec {
    pub selector: String,
}

/// Log storage settings; drives the log gateway.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema, Default)]
#[kube(
    group = "operator.warden.io",
    version = "v1",
    kind = "LogStorage",
    plural = "logstorages",
    status = "FeatureStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct LogStorageSpec {
    /// Overrides the installation's control plane replicas for the gateway.
    pub gateway_replicas: Option<i32>,
}

/// Marks this cluster as a management cluster.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema, Default)]
#[kube(
    group = "operator.warden.io",
    version = "v1",
    kind = "ManagementCluster",
    plural = "managementclusters"
)]
#[serde(rename_all = "camelCase")]
pub struct ManagementClusterSpec {
    /// Address managed clusters dial, host:port.
    pub address: Option<String>,
}

/// Connects this (managed) cluster to a management cluster.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema, Default)]
#[kube(
    group = "operator.warden.io",
    version = "v1",
    kind = "ManagementClusterConnection",
    plural = "managementclusterconnections",
    status = "FeatureStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct ManagementClusterConnectionSpec {
    pub management_cluster_addr: String,
}
