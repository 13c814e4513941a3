//! Version-constraint and tag matching for dependency resolution.
//!
//! Matching answers eligibility; the returned tag score feeds ranking.
//!
//! Version rules:
//! - no constraint matches any version
//! - an empty version satisfies only an empty constraint
//! - a version or constraint that does not parse as semver degrades to
//!   exact string equality
//! - a bare version constraint (`"1.2.3"`) is a caret requirement, the
//!   cargo convention
//!
//! Tag rules (per requirement tag):
//! - bare tag: required, provider must carry it (+5 score)
//! - `+tag`: preferred, +10 score when present, no penalty when absent
//! - `-tag`: excluded, provider carrying it is ineligible

use semver::{Version, VersionReq};

use crate::registry::health::HealthState;

/// A provider tool under consideration for one requirement, joined with
/// the owning agent's endpoint, health, and current consumer load.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub agent_id: String,
    pub tool_name: String,
    pub capability: String,
    pub version: String,
    pub tags: Vec<String>,
    pub endpoint: String,
    pub health: HealthState,
    /// Number of resolutions currently assigned to this provider tool.
    pub consumers: u32,
}

/// True when `version` satisfies `constraint`.
pub fn version_matches(version: &str, constraint: Option<&str>) -> bool {
    let constraint = match constraint {
        Some(c) if !c.is_empty() => c,
        _ => return true,
    };
    if version.is_empty() {
        return false;
    }

    let parsed = match Version::parse(version) {
        Ok(v) => v,
        Err(err) => {
            log::debug!("version '{version}' is not semver ({err}), comparing as string");
            return version == constraint;
        }
    };
    let requirement = match VersionReq::parse(constraint) {
        Ok(r) => r,
        Err(err) => {
            log::debug!("constraint '{constraint}' is not a semver range ({err}), comparing as string");
            return version == constraint;
        }
    };
    requirement.matches(&parsed)
}

/// Tag eligibility and score. `None` means the provider is ineligible.
pub fn match_tags(provider_tags: &[String], requirement_tags: &[String]) -> Option<u32> {
    let mut score = 0;

    for tag in requirement_tags {
        if tag.is_empty() {
            continue;
        }
        if let Some(excluded) = tag.strip_prefix('-') {
            if !excluded.is_empty() && contains(provider_tags, excluded) {
                return None;
            }
        } else if let Some(preferred) = tag.strip_prefix('+') {
            if !preferred.is_empty() && contains(provider_tags, preferred) {
                score += 10;
            }
        } else if contains(provider_tags, tag) {
            score += 5;
        } else {
            return None;
        }
    }

    Some(score)
}

/// Full eligibility check for one candidate against one requirement:
/// capability equality, version constraint, then tag constraints.
pub fn match_candidate(
    candidate: &Candidate,
    capability: &str,
    version_constraint: Option<&str>,
    tags: &[String],
) -> Option<u32> {
    if candidate.capability != capability {
        return None;
    }
    if !version_matches(&candidate.version, version_constraint) {
        return None;
    }
    match_tags(&candidate.tags, tags)
}

fn contains(tags: &[String], tag: &str) -> bool {
    tags.iter().any(|t| t == tag)
}
