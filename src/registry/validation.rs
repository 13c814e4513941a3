//! Registration payload validation.
//!
//! A batch is accepted or rejected as a whole; any failure leaves the
//! store untouched. Version constraints are deliberately NOT validated
//! here: a constraint that does not parse as a semver range degrades to
//! exact string matching in the matcher.

use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashSet;

use crate::errors::RegistryError;
use crate::registry::types::{RegisterRequest, ToolSpec};

// Kubernetes-style DNS label for agent ids.
static AGENT_ID_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z0-9]([a-z0-9-]*[a-z0-9])?$").unwrap());

// Identifier rule shared by capability and tool names.
static NAME_PATTERN: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[a-zA-Z][a-zA-Z0-9_-]*$").unwrap());

// Semver triple with optional pre-release suffix.
static VERSION_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\d+\.\d+\.\d+(-[a-zA-Z0-9-]+)?$").unwrap());

const MAX_AGENT_ID_LEN: usize = 253;
const MAX_NAME_LEN: usize = 100;

/// Validates a full registration request.
///
/// # Errors
///
/// Returns [`RegistryError::Validation`] naming the first offending field.
pub fn validate_register(request: &RegisterRequest) -> Result<(), RegistryError> {
    validate_agent_id(&request.agent_id)?;

    if let Some(endpoint) = request.endpoint.as_deref() {
        validate_endpoint(endpoint)?;
    }

    let mut seen_names: HashSet<&str> = HashSet::new();
    for (index, tool) in request.tools.iter().enumerate() {
        validate_tool(index, tool)?;
        if !seen_names.insert(tool.tool_name.as_str()) {
            return Err(RegistryError::validation(
                format!("tools[{index}].tool_name"),
                format!("duplicate tool name '{}'", tool.tool_name),
            ));
        }
    }

    Ok(())
}

/// Validates an agent id on its own (used by heartbeat and path params).
pub fn validate_agent_id(agent_id: &str) -> Result<(), RegistryError> {
    if agent_id.is_empty() {
        return Err(RegistryError::validation("agent_id", "must not be empty"));
    }
    if agent_id.len() > MAX_AGENT_ID_LEN {
        return Err(RegistryError::validation(
            "agent_id",
            format!("must not exceed {MAX_AGENT_ID_LEN} characters"),
        ));
    }
    if !AGENT_ID_PATTERN.is_match(agent_id) {
        return Err(RegistryError::validation(
            "agent_id",
            "must contain only lowercase alphanumerics and hyphens",
        ));
    }
    Ok(())
}

fn validate_tool(index: usize, tool: &ToolSpec) -> Result<(), RegistryError> {
    validate_name(&format!("tools[{index}].tool_name"), &tool.tool_name)?;
    validate_name(&format!("tools[{index}].capability"), &tool.capability)?;

    if !VERSION_PATTERN.is_match(&tool.version) {
        return Err(RegistryError::validation(
            format!("tools[{index}].version"),
            format!(
                "'{}' is not a semantic version (e.g. '1.0.0' or '1.0.0-alpha')",
                tool.version
            ),
        ));
    }

    for (dep_index, dep) in tool.dependencies.iter().enumerate() {
        validate_name(
            &format!("tools[{index}].dependencies[{dep_index}].capability"),
            &dep.capability,
        )?;
    }

    Ok(())
}

fn validate_name(field: &str, name: &str) -> Result<(), RegistryError> {
    if name.is_empty() {
        return Err(RegistryError::validation(field, "must not be empty"));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(RegistryError::validation(
            field,
            format!("must not exceed {MAX_NAME_LEN} characters"),
        ));
    }
    if !NAME_PATTERN.is_match(name) {
        return Err(RegistryError::validation(
            field,
            "must start with a letter and contain only letters, numbers, underscores, and hyphens",
        ));
    }
    Ok(())
}

fn validate_endpoint(endpoint: &str) -> Result<(), RegistryError> {
    if endpoint.is_empty() || endpoint.starts_with("stdio://") {
        return Ok(());
    }
    if !endpoint.starts_with("http://") && !endpoint.starts_with("https://") {
        return Err(RegistryError::validation(
            "endpoint",
            "must be an http(s):// URL or a stdio:// address",
        ));
    }
    let rest = endpoint.splitn(2, "://").nth(1).unwrap_or("");
    let host = rest.split('/').next().unwrap_or("");
    if host.is_empty() {
        return Err(RegistryError::validation(
            "endpoint",
            "must include a host",
        ));
    }
    Ok(())
}
