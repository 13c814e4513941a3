//! Authoritative registry state: the agent table, the revision counter,
//! per-agent protocol sessions, and consumer-load accounting.
//!
//! `StoreInner` is plain synchronous data. The service wraps it in a
//! `parking_lot::RwLock` and runs every mutate-then-resolve sequence in
//! one write-lock scope, so partial updates are never observable.
//!
//! The revision advances only on topology changes: a tool set, endpoint,
//! or transport change, an eviction, or an unregistration. Timestamp
//! refreshes and metadata merges leave it alone, which is what lets an
//! unchanged mesh answer heartbeats with a bare acknowledgement.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::registry::health::{HealthPolicy, HealthState};
use crate::registry::matcher::Candidate;
use crate::registry::snapshot::StoreSnapshot;
use crate::registry::types::{
    AgentEntry, AgentSummary, CapabilitySummary, ResolutionMap, ToolSpec, Transport,
};

/// Per-agent protocol bookkeeping for revision-diffed heartbeat responses.
#[derive(Debug, Clone, Default)]
pub struct AgentSession {
    /// Store revision at the time `last_sent` was computed.
    pub last_seen_revision: u64,
    /// The resolutions this agent most recently received.
    pub last_sent: ResolutionMap,
}

/// Registry state. All fields mutate together under the service's lock.
pub struct StoreInner {
    policy: HealthPolicy,
    agents: HashMap<String, AgentEntry>,
    sessions: HashMap<String, AgentSession>,
    /// (provider agent_id, provider tool_name) -> currently assigned
    /// resolutions pointing at it. Feeds the load ranking key.
    consumers: HashMap<(String, String), u32>,
    revision: u64,
}

impl StoreInner {
    pub fn new(policy: HealthPolicy) -> Self {
        Self {
            policy,
            agents: HashMap::new(),
            sessions: HashMap::new(),
            consumers: HashMap::new(),
            revision: 0,
        }
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn agent_count(&self) -> usize {
        self.agents.len()
    }

    pub fn get(&self, agent_id: &str) -> Option<&AgentEntry> {
        self.agents.get(agent_id)
    }

    pub fn session(&self, agent_id: &str) -> Option<&AgentSession> {
        self.sessions.get(agent_id)
    }

    // -----------------------------------------------------------------------
    // Mutation
    // -----------------------------------------------------------------------

    /// Inserts or replaces an agent and its full tool set atomically.
    /// Returns true when the topology changed (new agent, or a tool set /
    /// endpoint / transport difference), in which case the revision has
    /// been advanced.
    pub fn upsert_agent(
        &mut self,
        agent_id: String,
        endpoint: String,
        transports: Vec<Transport>,
        tools: Vec<ToolSpec>,
        metadata: HashMap<String, Value>,
        now: DateTime<Utc>,
    ) -> bool {
        let changed = match self.agents.get(&agent_id) {
            Some(existing) => {
                existing.tools != tools
                    || existing.endpoint != endpoint
                    || existing.transports != transports
            }
            None => true,
        };

        let registered_at = self
            .agents
            .get(&agent_id)
            .map(|e| e.registered_at)
            .unwrap_or(now);

        self.agents.insert(
            agent_id.clone(),
            AgentEntry {
                agent_id: agent_id.clone(),
                endpoint,
                transports,
                tools,
                metadata,
                registered_at,
                last_heartbeat_at: now,
            },
        );
        self.sessions.entry(agent_id.clone()).or_default();

        if changed {
            self.revision += 1;
            log::debug!("agent {agent_id} registered, revision now {}", self.revision);
        } else {
            log::debug!("agent {agent_id} re-registered unchanged");
        }
        changed
    }

    /// Refreshes the heartbeat timestamp and merges metadata. Returns
    /// false when the agent is unknown. Never advances the revision.
    pub fn touch(
        &mut self,
        agent_id: &str,
        metadata: HashMap<String, Value>,
        now: DateTime<Utc>,
    ) -> bool {
        match self.agents.get_mut(agent_id) {
            Some(entry) => {
                entry.last_heartbeat_at = now;
                entry.metadata.extend(metadata);
                true
            }
            None => false,
        }
    }

    /// Removes an agent, its session, and every load-count entry it was
    /// involved in, as provider or consumer. Advances the revision when
    /// the agent existed.
    pub fn remove_agent(&mut self, agent_id: &str) -> bool {
        let Some(entry) = self.agents.remove(agent_id) else {
            return false;
        };
        for tool in &entry.tools {
            self.consumers
                .remove(&(entry.agent_id.clone(), tool.tool_name.clone()));
        }
        if let Some(session) = self.sessions.remove(agent_id) {
            self.release_assignments(&session.last_sent);
        }
        self.revision += 1;
        true
    }

    /// Evicts every agent past the eviction window. Returns the evicted
    /// ids; each eviction advances the revision so dependents recompute
    /// at their next contact.
    pub fn sweep(&mut self, now: DateTime<Utc>) -> Vec<String> {
        let expired: Vec<String> = self
            .agents
            .values()
            .filter(|entry| self.policy.is_expired(entry.last_heartbeat_at, now))
            .map(|entry| entry.agent_id.clone())
            .collect();

        for agent_id in &expired {
            self.remove_agent(agent_id);
            log::info!("evicted agent {agent_id} after missed heartbeats");
        }
        expired
    }

    /// Records the resolutions just sent to an agent, keeping the load
    /// counts in step: the agent's previous assignments are released and
    /// the new ones counted.
    pub fn record_sent(&mut self, agent_id: &str, resolutions: ResolutionMap) {
        let previous = self
            .sessions
            .get(agent_id)
            .map(|s| s.last_sent.clone())
            .unwrap_or_default();
        self.release_assignments(&previous);
        self.count_assignments(&resolutions);
        self.sessions.insert(
            agent_id.to_string(),
            AgentSession {
                last_seen_revision: self.revision,
                last_sent: resolutions,
            },
        );
    }

    /// Takes the agent's standing assignments out of the load counts and
    /// returns what it was last sent. Callers re-resolve against counts
    /// that exclude the requesting agent, then `record_sent` the fresh
    /// result; the returned map feeds the response delta.
    pub fn take_assignments(&mut self, agent_id: &str) -> ResolutionMap {
        let previous = self
            .sessions
            .get_mut(agent_id)
            .map(|session| std::mem::take(&mut session.last_sent))
            .unwrap_or_default();
        self.release_assignments(&previous);
        previous
    }

    fn count_assignments(&mut self, resolutions: &ResolutionMap) {
        for by_index in resolutions.values() {
            for provider in by_index.values().flatten() {
                *self
                    .consumers
                    .entry((provider.agent_id.clone(), provider.tool_name.clone()))
                    .or_insert(0) += 1;
            }
        }
    }

    fn release_assignments(&mut self, resolutions: &ResolutionMap) {
        for by_index in resolutions.values() {
            for provider in by_index.values().flatten() {
                let key = (provider.agent_id.clone(), provider.tool_name.clone());
                if let Some(count) = self.consumers.get_mut(&key) {
                    *count = count.saturating_sub(1);
                    if *count == 0 {
                        self.consumers.remove(&key);
                    }
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    /// Provider tools for a capability, joined with owner endpoint,
    /// derived health, and consumer load. Expired owners are skipped.
    /// Ordered by (agent_id, tool_name) so equal-rank selection is
    /// deterministic.
    pub fn candidates(&self, capability: &str, now: DateTime<Utc>) -> Vec<Candidate> {
        let mut candidates: Vec<Candidate> = Vec::new();
        for entry in self.agents.values() {
            let health = self.policy.state(entry.last_heartbeat_at, now);
            if health == HealthState::Expired {
                continue;
            }
            for tool in &entry.tools {
                if tool.capability != capability {
                    continue;
                }
                candidates.push(Candidate {
                    agent_id: entry.agent_id.clone(),
                    tool_name: tool.tool_name.clone(),
                    capability: tool.capability.clone(),
                    version: tool.version.clone(),
                    tags: tool.tags.clone(),
                    endpoint: entry.provider_endpoint(),
                    health,
                    consumers: self
                        .consumers
                        .get(&(entry.agent_id.clone(), tool.tool_name.clone()))
                        .copied()
                        .unwrap_or(0),
                });
            }
        }
        candidates.sort_by(|a, b| {
            (a.agent_id.as_str(), a.tool_name.as_str())
                .cmp(&(b.agent_id.as_str(), b.tool_name.as_str()))
        });
        candidates
    }

    /// One row per live agent, ordered by agent id.
    pub fn agent_summaries(&self, now: DateTime<Utc>) -> Vec<AgentSummary> {
        let mut summaries: Vec<AgentSummary> = self
            .agents
            .values()
            .map(|entry| {
                let mut capabilities: Vec<String> =
                    entry.tools.iter().map(|t| t.capability.clone()).collect();
                capabilities.sort();
                capabilities.dedup();
                AgentSummary {
                    agent_id: entry.agent_id.clone(),
                    endpoint: entry.provider_endpoint(),
                    health: self.policy.state(entry.last_heartbeat_at, now),
                    last_heartbeat_at: entry.last_heartbeat_at,
                    tool_count: entry.tools.len(),
                    capabilities,
                }
            })
            .collect();
        summaries.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        summaries
    }

    /// One row per provider tool, ordered by (capability, agent, tool).
    pub fn capability_summaries(&self, now: DateTime<Utc>) -> Vec<CapabilitySummary> {
        let mut summaries: Vec<CapabilitySummary> = Vec::new();
        for entry in self.agents.values() {
            let health = self.policy.state(entry.last_heartbeat_at, now);
            for tool in &entry.tools {
                summaries.push(CapabilitySummary {
                    capability: tool.capability.clone(),
                    version: tool.version.clone(),
                    agent_id: entry.agent_id.clone(),
                    tool_name: tool.tool_name.clone(),
                    tags: tool.tags.clone(),
                    health,
                });
            }
        }
        summaries.sort_by(|a, b| {
            (a.capability.as_str(), a.agent_id.as_str(), a.tool_name.as_str()).cmp(&(
                b.capability.as_str(),
                b.agent_id.as_str(),
                b.tool_name.as_str(),
            ))
        });
        summaries
    }

    // -----------------------------------------------------------------------
    // Snapshots
    // -----------------------------------------------------------------------

    /// Durable view of the store: agents and revision. Sessions and load
    /// counts rebuild from heartbeats after a restore, which also forces
    /// a full resolution delta to every agent on its next contact.
    pub fn to_snapshot(&self) -> StoreSnapshot {
        let mut agents: Vec<AgentEntry> = self.agents.values().cloned().collect();
        agents.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        StoreSnapshot {
            revision: self.revision,
            agents,
        }
    }

    /// Replaces the live state with a restored snapshot.
    pub fn restore(&mut self, snapshot: StoreSnapshot) {
        self.agents = snapshot
            .agents
            .into_iter()
            .map(|entry| (entry.agent_id.clone(), entry))
            .collect();
        self.sessions.clear();
        self.consumers.clear();
        self.revision = snapshot.revision;
        log::info!(
            "restored {} agents at revision {}",
            self.agents.len(),
            self.revision
        );
    }
}
