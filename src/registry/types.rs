//! Wire and store data model for the registry protocol.
//!
//! Request/response bodies are snake_case JSON. Resolution maps are keyed
//! by tool name, then by requirement index; an explicit `null` value marks
//! a requirement that currently has no eligible provider.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::registry::health::HealthState;

/// Call mechanisms an agent can serve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    Http,
    Stdio,
}

/// A named tool an agent exposes: the unit of registration and matching.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSpec {
    /// Unique within the owning agent.
    pub tool_name: String,
    /// The capability this tool provides; requirements match on this name.
    pub capability: String,
    /// Semver version of the capability implementation.
    #[serde(default = "default_tool_version")]
    pub version: String,
    /// Arbitrary labels; requirement tags filter and rank on these.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    /// Ordered capability requirements this tool consumes.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<Requirement>,
}

fn default_tool_version() -> String {
    "1.0.0".to_string()
}

/// A capability requirement declared by a tool.
///
/// Tags use matcher prefixes: a bare tag is required, `+tag` is preferred
/// (ranking only), `-tag` excludes providers carrying it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Requirement {
    pub capability: String,
    /// Semver range; absent means any version.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version_constraint: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

impl Requirement {
    /// Requirement on a capability name alone, any version, any tags.
    pub fn capability(name: impl Into<String>) -> Self {
        Self {
            capability: name.into(),
            version_constraint: None,
            tags: Vec::new(),
        }
    }
}

/// Provider assignment for one requirement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedProvider {
    pub agent_id: String,
    pub tool_name: String,
    pub capability: String,
    /// Directly callable address. `stdio://{agent_id}` when the provider
    /// exposes no HTTP endpoint.
    pub endpoint: String,
    pub version: String,
}

/// Resolutions keyed by consumer tool name, then requirement index.
/// `None` is serialized as an explicit `null` (unresolved marker).
pub type ResolutionMap = BTreeMap<String, BTreeMap<usize, Option<ResolvedProvider>>>;

// ---------------------------------------------------------------------------
// Protocol bodies
// ---------------------------------------------------------------------------

/// `POST /register` body: an agent and its full tool set. Re-registering
/// replaces the previous tool set atomically.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub agent_id: String,
    /// Externally callable address. Absent or empty when the agent only
    /// consumes capabilities.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub transports: Vec<Transport>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ToolSpec>,
    /// Opaque passthrough; merged on heartbeat, never interpreted.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, Value>,
}

/// `POST /register` response: the full resolution set for every declared
/// requirement of the registering agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterResponse {
    pub status: String,
    pub agent_id: String,
    /// Store revision after this registration was applied.
    pub revision: u64,
    pub resolutions: ResolutionMap,
}

/// `POST /heartbeat` body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    pub agent_id: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, Value>,
}

/// `POST /heartbeat` response. When nothing changed since the agent's last
/// contact the response is a bare acknowledgement; otherwise `resolutions`
/// carries only the entries that differ from what the agent last received,
/// with `null` for requirements that became unresolved.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatResponse {
    pub status: String,
    pub agent_id: String,
    pub revision: u64,
    pub changed: bool,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub resolutions: ResolutionMap,
}

/// Outcome of `HEAD /heartbeat/{agent_id}`, carried entirely in the HTTP
/// status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FastHeartbeatStatus {
    /// 200: topology unchanged, keep current resolutions.
    NoChanges,
    /// 202: topology changed, send a full heartbeat to fetch deltas.
    TopologyChanged,
    /// 410: the registry no longer knows this agent; re-register.
    AgentUnknown,
}

impl FastHeartbeatStatus {
    pub fn status_code(&self) -> u16 {
        match self {
            FastHeartbeatStatus::NoChanges => 200,
            FastHeartbeatStatus::TopologyChanged => 202,
            FastHeartbeatStatus::AgentUnknown => 410,
        }
    }

    pub fn from_status_code(code: u16) -> Option<Self> {
        match code {
            200 => Some(FastHeartbeatStatus::NoChanges),
            202 => Some(FastHeartbeatStatus::TopologyChanged),
            410 => Some(FastHeartbeatStatus::AgentUnknown),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Store entries and listings
// ---------------------------------------------------------------------------

/// Authoritative per-agent record held by the store and persisted in
/// snapshots.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentEntry {
    pub agent_id: String,
    /// Empty when the agent exposes no externally callable tools.
    pub endpoint: String,
    pub transports: Vec<Transport>,
    pub tools: Vec<ToolSpec>,
    pub metadata: HashMap<String, Value>,
    pub registered_at: DateTime<Utc>,
    pub last_heartbeat_at: DateTime<Utc>,
}

impl AgentEntry {
    /// Address surfaced in resolutions. Falls back to the stdio form when
    /// the agent registered without an endpoint.
    pub fn provider_endpoint(&self) -> String {
        if self.endpoint.is_empty() {
            format!("stdio://{}", self.agent_id)
        } else {
            self.endpoint.clone()
        }
    }
}

/// `GET /agents` row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSummary {
    pub agent_id: String,
    pub endpoint: String,
    pub health: HealthState,
    pub last_heartbeat_at: DateTime<Utc>,
    pub tool_count: usize,
    pub capabilities: Vec<String>,
}

/// `GET /capabilities` row: one provider tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapabilitySummary {
    pub capability: String,
    pub version: String,
    pub agent_id: String,
    pub tool_name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    pub health: HealthState,
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Builds a mesh-unique agent id from a stable name: `{name}-{8 hex}`.
/// The suffix makes concurrent deployments of the same agent distinct;
/// the stable prefix keeps logs and listings readable.
pub fn agent_id(name: &str) -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{}-{}", name, &suffix[..8])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_request_defaults() {
        let req: RegisterRequest = serde_json::from_str(
            r#"{"agent_id": "weather-1a2b3c4d", "tools": [{"tool_name": "t", "capability": "weather"}]}"#,
        )
        .unwrap();
        assert!(req.endpoint.is_none());
        assert_eq!(req.tools[0].version, "1.0.0");
        assert!(req.tools[0].tags.is_empty());
        assert!(req.tools[0].dependencies.is_empty());
    }

    #[test]
    fn test_unresolved_marker_serializes_as_null() {
        let mut by_index = BTreeMap::new();
        by_index.insert(0usize, None::<ResolvedProvider>);
        let mut resolutions: ResolutionMap = BTreeMap::new();
        resolutions.insert("report".to_string(), by_index);

        let json = serde_json::to_value(&resolutions).unwrap();
        assert_eq!(json["report"]["0"], serde_json::Value::Null);
    }

    #[test]
    fn test_fast_heartbeat_status_round_trip() {
        for status in [
            FastHeartbeatStatus::NoChanges,
            FastHeartbeatStatus::TopologyChanged,
            FastHeartbeatStatus::AgentUnknown,
        ] {
            assert_eq!(
                FastHeartbeatStatus::from_status_code(status.status_code()),
                Some(status)
            );
        }
        assert_eq!(FastHeartbeatStatus::from_status_code(500), None);
    }

    #[test]
    fn test_agent_id_shape() {
        let id = agent_id("weather");
        assert!(id.starts_with("weather-"));
        let suffix = id.rsplit('-').next().unwrap();
        assert_eq!(suffix.len(), 8);
        assert!(suffix.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_provider_endpoint_falls_back_to_stdio() {
        let entry = AgentEntry {
            agent_id: "quiet-0a1b2c3d".to_string(),
            endpoint: String::new(),
            transports: vec![Transport::Stdio],
            tools: Vec::new(),
            metadata: HashMap::new(),
            registered_at: Utc::now(),
            last_heartbeat_at: Utc::now(),
        };
        assert_eq!(entry.provider_endpoint(), "stdio://quiet-0a1b2c3d");
    }

    #[test]
    fn test_heartbeat_response_omits_empty_resolutions() {
        let response = HeartbeatResponse {
            status: "success".to_string(),
            agent_id: "a-00000000".to_string(),
            revision: 3,
            changed: false,
            resolutions: BTreeMap::new(),
        };
        let json = serde_json::to_value(&response).unwrap();
        assert!(json.get("resolutions").is_none());
    }
}
