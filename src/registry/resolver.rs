//! Dependency resolution: pick at most one provider per requirement.
//!
//! Filtering removes ineligible candidates (wrong capability, failed
//! version constraint, missing required tag, excluded tag, expired
//! owner). Degraded owners survive filtering only when no healthy
//! candidate does. The survivors are ranked by a total order so equal
//! inputs always produce the same assignment:
//!
//! 1. tag score, descending (preferred-tag matches dominate)
//! 2. capability version, descending (invalid semver sorts last)
//! 3. consumer load, ascending
//! 4. agent id, then tool name, ascending

use chrono::{DateTime, Utc};
use semver::Version;
use std::cmp::Ordering;

use crate::registry::health::HealthState;
use crate::registry::matcher::{match_candidate, Candidate};
use crate::registry::store::StoreInner;
use crate::registry::types::{Requirement, ResolutionMap, ResolvedProvider};

struct Ranked {
    candidate: Candidate,
    score: u32,
    version: Option<Version>,
}

/// Resolves one requirement against the current store state. `None`
/// means no eligible provider exists right now; the caller records an
/// explicit unresolved marker, never an error.
pub fn resolve_requirement(
    store: &StoreInner,
    requirement: &Requirement,
    now: DateTime<Utc>,
) -> Option<ResolvedProvider> {
    let candidates = store.candidates(&requirement.capability, now);

    let mut eligible: Vec<Ranked> = candidates
        .into_iter()
        .filter_map(|candidate| {
            let score = match_candidate(
                &candidate,
                &requirement.capability,
                requirement.version_constraint.as_deref(),
                &requirement.tags,
            )?;
            let version = Version::parse(&candidate.version).ok();
            Some(Ranked {
                candidate,
                score,
                version,
            })
        })
        .collect();

    if eligible
        .iter()
        .any(|r| r.candidate.health == HealthState::Healthy)
    {
        eligible.retain(|r| r.candidate.health == HealthState::Healthy);
    }

    if eligible.is_empty() {
        log::debug!(
            "no eligible provider for capability '{}' (constraint {:?}, tags {:?})",
            requirement.capability,
            requirement.version_constraint,
            requirement.tags
        );
        return None;
    }

    eligible.sort_by(rank);
    let best = &eligible[0];
    Some(ResolvedProvider {
        agent_id: best.candidate.agent_id.clone(),
        tool_name: best.candidate.tool_name.clone(),
        capability: best.candidate.capability.clone(),
        endpoint: best.candidate.endpoint.clone(),
        version: best.candidate.version.clone(),
    })
}

/// Resolves every requirement declared by an agent's tools, keyed by
/// tool name and requirement index. Tools without requirements produce
/// no entry. An agent may resolve to its own tools.
pub fn resolve_for_agent(store: &StoreInner, agent_id: &str, now: DateTime<Utc>) -> ResolutionMap {
    let mut resolutions = ResolutionMap::new();
    let Some(entry) = store.get(agent_id) else {
        return resolutions;
    };

    for tool in &entry.tools {
        if tool.dependencies.is_empty() {
            continue;
        }
        let by_index = tool
            .dependencies
            .iter()
            .enumerate()
            .map(|(index, requirement)| (index, resolve_requirement(store, requirement, now)))
            .collect();
        resolutions.insert(tool.tool_name.clone(), by_index);
    }
    resolutions
}

fn rank(a: &Ranked, b: &Ranked) -> Ordering {
    b.score
        .cmp(&a.score)
        .then_with(|| compare_versions_desc(a, b))
        .then_with(|| a.candidate.consumers.cmp(&b.candidate.consumers))
        .then_with(|| a.candidate.agent_id.cmp(&b.candidate.agent_id))
        .then_with(|| a.candidate.tool_name.cmp(&b.candidate.tool_name))
}

fn compare_versions_desc(a: &Ranked, b: &Ranked) -> Ordering {
    match (&a.version, &b.version) {
        (Some(va), Some(vb)) => vb.cmp(va),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => b.candidate.version.cmp(&a.candidate.version),
    }
}
