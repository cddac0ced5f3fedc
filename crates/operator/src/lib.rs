//! DevPlane workspace operator
//!
//! Watches `Workspace` resources and converges the cluster to them: a
//! persistent claim, a locked-down pod, a headless service, per-user RBAC,
//! and three network policies, all owned by the Workspace so cascade
//! deletion cleans up together. Also enforces idle eviction and image
//! rollout, and reflects observed pod state back onto the Workspace status.

pub mod config;
pub mod controller;
pub mod resources;

pub use config::OperatorConfig;
