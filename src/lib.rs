//! # capmesh
//!
//! Runtime capability registry for a mesh of independently deployed agent
//! processes. Version 0.4.1
//!
//! Agents register named tools (capability, semver version, tags) in one
//! batch, heartbeat to stay live, and receive resolved provider endpoints
//! for their declared capability requirements in the register/heartbeat
//! responses. Topology changes propagate through revision-diffed heartbeat
//! responses; no agent is ever reconfigured or restarted to learn about a
//! new provider.
//!
//! The crate ships the registry server (`registry` binary), the typed wire
//! client used by agent runtimes, and the stateless invocation proxy that
//! turns a resolved provider into a callable handle.

pub mod client;
pub mod clock;
pub mod config;
pub mod errors;
pub mod proxy;
pub mod registry;
pub mod server;

pub use client::RegistryClient;
pub use clock::{Clock, SystemClock};
pub use config::MeshConfig;
pub use errors::{ClientError, ProxyError, RegistryError};
pub use proxy::InvocationProxy;
pub use registry::service::RegistryService;
pub use registry::types::{
    AgentSummary, FastHeartbeatStatus, HeartbeatRequest, HeartbeatResponse, RegisterRequest,
    RegisterResponse, Requirement, ResolvedProvider, ToolSpec,
};

/// Library version reported by the `/health` probe.
pub const VERSION: &str = "0.4.1";
