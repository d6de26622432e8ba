//! Topology Model Accessors and the data-model records they read.

pub mod accessors;
pub mod model;

pub use accessors::{TopologyError, TopologyStore, COMPUTE_TYPE, ENDPOINT_TYPE, HOSTED_ON_TYPE};
pub use model::*;
