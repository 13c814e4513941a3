//! Registry configuration loaded from the environment.

use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;

use thiserror::Error;

/// Configuration errors abort startup; there is no safe fallback for a
/// misconfigured eviction window.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid value for {var}: {message}")]
    Invalid { var: String, message: String },

    #[error("{0}")]
    Inconsistent(String),
}

/// Runtime settings for the registry server.
#[derive(Debug, Clone)]
pub struct MeshConfig {
    /// Bind host for the HTTP listener.
    pub host: String,
    /// Bind port for the HTTP listener.
    pub port: u16,
    /// Heartbeat age below which an agent is healthy.
    pub healthy_window_secs: u64,
    /// Heartbeat age beyond which an agent is evicted. Must exceed the
    /// healthy window; between the two the agent is degraded.
    pub eviction_window_secs: u64,
    /// Interval for the background eviction sweep. Zero disables the
    /// task; expiry is still enforced lazily on every protocol operation.
    pub sweep_interval_secs: u64,
    /// SQLite file for state snapshots. `None` disables persistence.
    pub snapshot_path: Option<PathBuf>,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
            healthy_window_secs: 60,
            eviction_window_secs: 120,
            sweep_interval_secs: 30,
            snapshot_path: None,
        }
    }
}

impl MeshConfig {
    /// Loads configuration from environment variables, falling back to
    /// defaults for anything unset.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when a numeric variable fails to parse or
    /// the eviction window does not exceed the healthy window.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let host = env::var("HOST").unwrap_or(defaults.host);
        let port = parse_var("PORT", defaults.port)?;
        let healthy_window_secs =
            parse_var("CAPMESH_HEALTHY_WINDOW_SECS", defaults.healthy_window_secs)?;
        let eviction_window_secs =
            parse_var("CAPMESH_EVICTION_WINDOW_SECS", defaults.eviction_window_secs)?;
        let sweep_interval_secs =
            parse_var("CAPMESH_SWEEP_INTERVAL_SECS", defaults.sweep_interval_secs)?;
        let snapshot_path = env::var("CAPMESH_SNAPSHOT_PATH").ok().map(PathBuf::from);

        let config = Self {
            host,
            port,
            healthy_window_secs,
            eviction_window_secs,
            sweep_interval_secs,
            snapshot_path,
        };
        config.validate()?;
        Ok(config)
    }

    /// Checks cross-field consistency.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.healthy_window_secs == 0 {
            return Err(ConfigError::Invalid {
                var: "CAPMESH_HEALTHY_WINDOW_SECS".to_string(),
                message: "must be greater than zero".to_string(),
            });
        }
        if self.eviction_window_secs <= self.healthy_window_secs {
            return Err(ConfigError::Inconsistent(format!(
                "eviction window ({}s) must exceed healthy window ({}s)",
                self.eviction_window_secs, self.healthy_window_secs
            )));
        }
        Ok(())
    }

    /// Socket address for the HTTP listener.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] when the host does not parse as an
    /// IP address.
    pub fn bind_addr(&self) -> Result<SocketAddr, ConfigError> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .map_err(|_| ConfigError::Invalid {
                var: "HOST".to_string(),
                message: format!("'{}' is not a bindable address", self.host),
            })
    }
}

fn parse_var<T: std::str::FromStr>(var: &str, default: T) -> Result<T, ConfigError> {
    match env::var(var) {
        Ok(raw) => raw.parse().map_err(|_| ConfigError::Invalid {
            var: var.to_string(),
            message: format!("'{raw}' is not a valid number"),
        }),
        Err(_) => Ok(default),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = MeshConfig::default();
        assert_eq!(config.port, 8000);
        assert_eq!(config.healthy_window_secs, 60);
        assert_eq!(config.eviction_window_secs, 120);
        assert!(config.snapshot_path.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_eviction_must_exceed_healthy() {
        let config = MeshConfig {
            healthy_window_secs: 120,
            eviction_window_secs: 120,
            ..MeshConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Inconsistent(_))
        ));
    }

    #[test]
    fn test_zero_healthy_window_rejected() {
        let config = MeshConfig {
            healthy_window_secs: 0,
            ..MeshConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_bind_addr() {
        let config = MeshConfig {
            host: "127.0.0.1".to_string(),
            port: 9900,
            ..MeshConfig::default()
        };
        assert_eq!(
            config.bind_addr().unwrap(),
            "127.0.0.1:9900".parse().unwrap()
        );
    }

    #[test]
    fn test_bad_host_rejected() {
        let config = MeshConfig {
            host: "not-an-ip".to_string(),
            ..MeshConfig::default()
        };
        assert!(config.bind_addr().is_err());
    }
}
