pub mod features;
pub mod installation;
pub mod license;
pub mod status;

pub use features::*;
pub use installation::*;
pub use license::*;
pub use status::*;

/// Name of the singleton instance of every cluster-scoped resource.
pub const DEFAULT_NAME: &str = "default";
