//! Liveness derivation from heartbeat age.
//!
//! Health is never stored. It is computed from `last_heartbeat_at` and the
//! configured windows whenever a decision needs it, so there is no monitor
//! task to fall behind and no stored state to go stale.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::config::MeshConfig;

/// Derived liveness of an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    /// Heartbeat age within the healthy window. Fully eligible.
    Healthy,
    /// Healthy window exceeded but not yet evictable. Eligible only as a
    /// fallback when no healthy provider matches.
    Degraded,
    /// Eviction window exceeded. Removed at the next sweep; never
    /// resolvable.
    Expired,
}

/// Configured heartbeat windows.
#[derive(Debug, Clone, Copy)]
pub struct HealthPolicy {
    healthy_window: Duration,
    eviction_window: Duration,
}

impl HealthPolicy {
    pub fn new(healthy_window_secs: u64, eviction_window_secs: u64) -> Self {
        Self {
            healthy_window: Duration::seconds(healthy_window_secs as i64),
            eviction_window: Duration::seconds(eviction_window_secs as i64),
        }
    }

    pub fn from_config(config: &MeshConfig) -> Self {
        Self::new(config.healthy_window_secs, config.eviction_window_secs)
    }

    /// Health state for a heartbeat last seen at `last_heartbeat_at`.
    /// Both windows are inclusive: an agent is healthy through
    /// `age == healthy_window` and evictable only once
    /// `age > eviction_window`.
    pub fn state(&self, last_heartbeat_at: DateTime<Utc>, now: DateTime<Utc>) -> HealthState {
        let age = now - last_heartbeat_at;
        if age <= self.healthy_window {
            HealthState::Healthy
        } else if age <= self.eviction_window {
            HealthState::Degraded
        } else {
            HealthState::Expired
        }
    }

    /// True when the agent has crossed the eviction threshold.
    pub fn is_expired(&self, last_heartbeat_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        self.state(last_heartbeat_at, now) == HealthState::Expired
    }
}

impl Default for HealthPolicy {
    fn default() -> Self {
        let defaults = MeshConfig::default();
        Self::new(defaults.healthy_window_secs, defaults.eviction_window_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(secs_ago: i64, now: DateTime<Utc>) -> DateTime<Utc> {
        now - Duration::seconds(secs_ago)
    }

    #[test]
    fn test_state_transitions_at_window_edges() {
        let policy = HealthPolicy::new(60, 120);
        let now = Utc::now();

        assert_eq!(policy.state(at(0, now), now), HealthState::Healthy);
        assert_eq!(policy.state(at(60, now), now), HealthState::Healthy);
        assert_eq!(policy.state(at(61, now), now), HealthState::Degraded);
        assert_eq!(policy.state(at(120, now), now), HealthState::Degraded);
        assert_eq!(policy.state(at(121, now), now), HealthState::Expired);
        assert_eq!(policy.state(at(3600, now), now), HealthState::Expired);
    }

    #[test]
    fn test_future_heartbeat_is_healthy() {
        // Clock skew between replicas must not evict a live agent.
        let policy = HealthPolicy::new(60, 120);
        let now = Utc::now();
        assert_eq!(policy.state(at(-5, now), now), HealthState::Healthy);
    }

    #[test]
    fn test_serializes_lowercase() {
        assert_eq!(
            serde_json::to_value(HealthState::Degraded).unwrap(),
            serde_json::json!("degraded")
        );
    }
}
