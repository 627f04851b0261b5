mod registry;
mod types;

pub use registry::*;
pub use types::*;
