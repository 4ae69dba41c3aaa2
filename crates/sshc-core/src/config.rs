//! Configuration for the SSH connectivity core

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::ConfigError;

/// One configured reverse-forward service, e.g. `VNC -> 3000`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelSpec {
    /// Human-readable label (`VNC`, `Gateway`, ...).
    pub label: String,
    /// Port the service listens on inside the agent.
    pub remote_port: u16,
}

impl TunnelSpec {
    pub fn new(label: impl Into<String>, remote_port: u16) -> Self {
        Self {
            label: label.into(),
            remote_port,
        }
    }
}

/// Backoff policy for reconnection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackoffConfig {
    #[serde(with = "humantime_serde")]
    pub initial: Duration,
    #[serde(with = "humantime_serde")]
    pub max: Duration,
    pub multiplier: f64,
    /// Jitter factor in `[0.0, 1.0]`; each delay is spread over
    /// `[base * (1 - jitter/2), base * (1 + jitter/2)]` by the caller.
    pub jitter: f64,
    pub max_attempts: u32,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: 0.4,
            max_attempts: 10,
        }
    }
}

/// Rate-limiter policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    pub max_per_min: u32,
    pub max_consec_failures: u32,
    #[serde(with = "humantime_serde")]
    pub block_duration: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_per_min: 10,
            max_consec_failures: 5,
            block_duration: Duration::from_secs(5 * 60),
        }
    }
}

/// Top-level configuration for the whole connectivity core.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    /// Location of key files and the TOFU host-key store.
    pub data_dir: PathBuf,

    #[serde(with = "humantime_serde")]
    pub dial_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub handshake_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub keepalive_interval: Duration,
    pub keepalive_miss_max: u32,
    #[serde(with = "humantime_serde")]
    pub keepalive_reply_timeout: Duration,

    pub backoff: BackoffConfig,

    #[serde(with = "humantime_serde")]
    pub tunnel_health_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub reconciler_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub ping_timeout: Duration,

    pub rate_limit: RateLimitConfig,

    pub tunnels: Vec<TunnelSpec>,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            dial_timeout: Duration::from_secs(15),
            handshake_timeout: Duration::from_secs(15),
            keepalive_interval: Duration::from_secs(30),
            keepalive_miss_max: 2,
            keepalive_reply_timeout: Duration::from_secs(10),
            backoff: BackoffConfig::default(),
            tunnel_health_interval: Duration::from_secs(10),
            reconciler_interval: Duration::from_secs(60),
            ping_timeout: Duration::from_secs(3),
            rate_limit: RateLimitConfig::default(),
            tunnels: vec![TunnelSpec::new("VNC", 3000), TunnelSpec::new("Gateway", 8080)],
        }
    }
}

/// Default data directory for key files and the TOFU host-key store.
pub fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("ssh-connectivity-core")
}

/// Load configuration from a TOML file.
pub fn load_config(path: &Path) -> Result<CoreConfig, ConfigError> {
    if !path.exists() {
        return Err(ConfigError::NotFound(path.to_path_buf()));
    }
    let content = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Invalid(format!("failed to read config: {e}")))?;
    let config: CoreConfig = toml::from_str(&content)?;
    Ok(config)
}

/// Save configuration to a TOML file, creating parent directories as needed.
pub fn save_config(path: &Path, config: &CoreConfig) -> Result<(), ConfigError> {
    let content = toml::to_string_pretty(config)?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| ConfigError::Invalid(format!("failed to create config dir: {e}")))?;
    }
    std::fs::write(path, content)
        .map_err(|e| ConfigError::Invalid(format!("failed to write config: {e}")))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_tunnels_match_expected_defaults() {
        let config = CoreConfig::default();
        assert_eq!(config.tunnels.len(), 2);
        assert_eq!(config.tunnels[0], TunnelSpec::new("VNC", 3000));
        assert_eq!(config.tunnels[1], TunnelSpec::new("Gateway", 8080));
    }

    #[test]
    fn roundtrip_through_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let config = CoreConfig::default();

        save_config(&path, &config).unwrap();
        let loaded = load_config(&path).unwrap();

        assert_eq!(loaded.rate_limit.max_per_min, config.rate_limit.max_per_min);
        assert_eq!(loaded.backoff.max_attempts, config.backoff.max_attempts);
    }

    #[test]
    fn missing_file_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.toml");
        assert!(matches!(load_config(&path), Err(ConfigError::NotFound(_))));
    }
}
