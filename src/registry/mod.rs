//! Registry core: store, health derivation, matching, resolution, and the
//! registration/heartbeat protocol service.
//!
//! All mutation flows through [`service::RegistryService`]; everything
//! below it is synchronous and lock-free so the service can run the whole
//! mutate-then-resolve sequence inside one short write-lock scope.

pub mod health;
pub mod matcher;
pub mod resolver;
pub mod service;
pub mod snapshot;
pub mod store;
pub mod types;
pub mod validation;

pub use health::{HealthPolicy, HealthState};
pub use service::RegistryService;
pub use types::{
    AgentSummary, CapabilitySummary, FastHeartbeatStatus, HeartbeatRequest, HeartbeatResponse,
    RegisterRequest, RegisterResponse, Requirement, ResolvedProvider, ToolSpec,
};
