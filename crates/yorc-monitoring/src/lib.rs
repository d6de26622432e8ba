//! Monitoring Ticker (§4.7): independent periodic TCP/HTTP liveness
//! checks that feed node-state transitions.

pub mod check;
pub mod supervisor;

pub use check::{CheckSpec, CheckTarget};
pub use supervisor::{MonitoringError, MonitoringSupervisor};
