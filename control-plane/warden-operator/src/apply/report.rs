use std::fmt;

use crate::cluster::ClusterError;
use crate::render::{RenderError, ResourceId};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Operation {
    Read,
    List,
    Create,
    Update,
    Delete,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Operation::Read => "read",
            Operation::List => "list",
            Operation::Create => "create",
            Operation::Update => "update",
            Operation::Delete => "delete",
        };
        f.write_str(s)
    }
}

#[derive(Debug)]
pub struct ApplyFailure {
    pub id: ResourceId,
    pub op: Operation,
    pub error: ClusterError,
}

impl fmt::Display for ApplyFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}: {}", self.op, self.id, self.error)
    }
}

/// What one apply call did, object by object.
#[derive(Debug, Default)]
pub struct ApplyReport {
    pub created: Vec<ResourceId>,
    pub updated: Vec<ResourceId>,
    pub unchanged: Vec<ResourceId>,
    pub deleted: Vec<ResourceId>,
    pub failures: Vec<ApplyFailure>,
}

impl ApplyReport {
    pub fn is_converged(&self) -> bool {
        self.failures.is_empty()
    }

    /// Number of writes issued against the cluster.
    pub fn mutations(&self) -> usize {
        self.created.len() + self.updated.len() + self.deleted.len()
    }

    pub fn into_result(self) -> Result<ApplyReport, ApplyError> {
        if self.failures.is_empty() {
            Ok(self)
        } else {
            Err(ApplyError::Batch {
                failures: self.failures,
            })
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ApplyError {
    #[error("{} object(s) did not converge: {}", .failures.len(), summarize(.failures))]
    Batch { failures: Vec<ApplyFailure> },

    #[error("refusing to apply an invalid render: {0}")]
    InvalidRender(#[from] RenderError),
}

fn summarize(failures: &[ApplyFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}
