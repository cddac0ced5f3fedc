//! DevPlane workspace gateway
//!
//! The stateful-per-request front door for user workspaces. Each request is
//! authenticated against the OIDC provider (with a bounded token cache),
//! the user's Workspace resource is created or fetched and awaited until
//! serviceable, and the connection is then streamed to the workspace pod's
//! terminal: WebSocket frames on `/ws`, plain HTTP on everything else.

pub mod auth;
pub mod config;
pub mod lifecycle;
pub mod oidc;
pub mod proxy;
pub mod routes;

pub use config::GatewayConfig;
