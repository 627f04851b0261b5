use super::RenderError;

/// Role of this cluster in a multi-cluster deployment.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ClusterTopology {
    #[default]
    Standalone,
    /// A `ManagementCluster` resource exists.
    Management,
    /// A `ManagementClusterConnection` resource exists.
    Managed,
}

impl ClusterTopology {
    /// Resolve the topology from the presence of the two selecting
    /// resources. Both at once is rejected rather than preferring one.
    pub fn resolve(
        management_cluster: bool,
        connection: bool,
    ) -> Result<Self, RenderError> {
        match (management_cluster, connection) {
            (true, true) => Err(RenderError::ConflictingTopology),
            (true, false) => Ok(ClusterTopology::Management),
            (false, true) => Ok(ClusterTopology::Managed),
            (false, false) => Ok(ClusterTopology::Standalone),
        }
    }

    pub fn is_managed(self) -> bool {
        self == ClusterTopology::Managed
    }
}
