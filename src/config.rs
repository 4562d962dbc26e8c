//! Receiver configuration: TOML file plus `SENDSPIN_*` environment overrides.
//!
//! Shaped like `RtpOutputConfig`/`JitterBuffer::new`'s explicit typed
//! parameters rather than scattering magic numbers through the pipeline.

use std::env;
use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Which network route a session prefers when the supervisor has a choice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionProfile {
    Wifi,
    Ethernet,
    Cellular,
    Vpn,
    Unknown,
}

impl Default for ConnectionProfile {
    fn default() -> Self {
        ConnectionProfile::Unknown
    }
}

impl fmt::Display for ConnectionProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionProfile::Wifi => "wifi",
            ConnectionProfile::Ethernet => "ethernet",
            ConnectionProfile::Cellular => "cellular",
            ConnectionProfile::Vpn => "vpn",
            ConnectionProfile::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReceiverConfig {
    pub profile: ConnectionProfile,
    pub ring_high_water_frames: usize,
    pub command_timeout_ms: u64,
    pub auth_timeout_ms: u64,
    pub signaling_timeout_ms: u64,
    pub reanchor_threshold_us: i64,
    pub correction_threshold_us: i64,
    pub correction_gain: f64,
    pub grace_period_ms: u64,
    pub gap_fill_ceiling_ms: u64,
    pub log_level: String,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        ReceiverConfig {
            profile: ConnectionProfile::Unknown,
            // 2.5s of 48kHz stereo frames.
            ring_high_water_frames: 120_000,
            command_timeout_ms: 15_000,
            auth_timeout_ms: 10_000,
            signaling_timeout_ms: 30_000,
            reanchor_threshold_us: 300_000,
            correction_threshold_us: 5_000,
            correction_gain: 1.0,
            grace_period_ms: 2_000,
            gap_fill_ceiling_ms: 500,
            log_level: "info".to_string(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },
}

/// Loads config from `path`, then applies any `SENDSPIN_*` env overrides.
pub fn load(path: &Path) -> Result<ReceiverConfig, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.display().to_string(),
        source,
    })?;
    let mut config: ReceiverConfig = toml::from_str(&text).map_err(|source| ConfigError::Parse {
        path: path.display().to_string(),
        source,
    })?;
    apply_env_overrides(&mut config)?;
    Ok(config)
}

/// Loads the built-in defaults, then applies any `SENDSPIN_*` env overrides.
/// Used by the CLI when no config file is supplied.
pub fn load_defaults() -> Result<ReceiverConfig, ConfigError> {
    let mut config = ReceiverConfig::default();
    apply_env_overrides(&mut config)?;
    Ok(config)
}

fn apply_env_overrides(config: &mut ReceiverConfig) -> Result<(), ConfigError> {
    if let Ok(v) = env::var("SENDSPIN_PROFILE") {
        config.profile = match v.to_lowercase().as_str() {
            "wifi" => ConnectionProfile::Wifi,
            "ethernet" => ConnectionProfile::Ethernet,
            "cellular" => ConnectionProfile::Cellular,
            "vpn" => ConnectionProfile::Vpn,
            "unknown" => ConnectionProfile::Unknown,
            other => {
                return Err(ConfigError::InvalidValue {
                    field: "SENDSPIN_PROFILE".to_string(),
                    reason: format!("unrecognized profile '{other}'"),
                })
            }
        };
    }
    if let Some(v) = parse_env_u64("SENDSPIN_RING_HIGH_WATER_FRAMES")? {
        config.ring_high_water_frames = v as usize;
    }
    if let Some(v) = parse_env_u64("SENDSPIN_COMMAND_TIMEOUT_MS")? {
        config.command_timeout_ms = v;
    }
    if let Some(v) = parse_env_u64("SENDSPIN_AUTH_TIMEOUT_MS")? {
        config.auth_timeout_ms = v;
    }
    if let Some(v) = parse_env_u64("SENDSPIN_SIGNALING_TIMEOUT_MS")? {
        config.signaling_timeout_ms = v;
    }
    if let Some(v) = parse_env_i64("SENDSPIN_REANCHOR_THRESHOLD_US")? {
        config.reanchor_threshold_us = v;
    }
    if let Some(v) = parse_env_i64("SENDSPIN_CORRECTION_THRESHOLD_US")? {
        config.correction_threshold_us = v;
    }
    if let Ok(v) = env::var("SENDSPIN_CORRECTION_GAIN") {
        config.correction_gain = v.parse().map_err(|_| ConfigError::InvalidValue {
            field: "SENDSPIN_CORRECTION_GAIN".to_string(),
            reason: format!("'{v}' is not a float"),
        })?;
    }
    if let Some(v) = parse_env_u64("SENDSPIN_GRACE_PERIOD_MS")? {
        config.grace_period_ms = v;
    }
    if let Some(v) = parse_env_u64("SENDSPIN_GAP_FILL_CEILING_MS")? {
        config.gap_fill_ceiling_ms = v;
    }
    if let Ok(v) = env::var("SENDSPIN_LOG_LEVEL") {
        config.log_level = v;
    }
    Ok(())
}

fn parse_env_u64(name: &str) -> Result<Option<u64>, ConfigError> {
    match env::var(name) {
        Ok(v) => v
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue {
                field: name.to_string(),
                reason: format!("'{v}' is not an unsigned integer"),
            }),
        Err(_) => Ok(None),
    }
}

fn parse_env_i64(name: &str) -> Result<Option<i64>, ConfigError> {
    match env::var(name) {
        Ok(v) => v
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue {
                field: name.to_string(),
                reason: format!("'{v}' is not an integer"),
            }),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = ReceiverConfig::default();
        assert_eq!(config.ring_high_water_frames, 120_000);
        assert_eq!(config.command_timeout_ms, 15_000);
        assert_eq!(config.auth_timeout_ms, 10_000);
        assert_eq!(config.signaling_timeout_ms, 30_000);
        assert_eq!(config.reanchor_threshold_us, 300_000);
        assert_eq!(config.correction_threshold_us, 5_000);
        assert_eq!(config.correction_gain, 1.0);
        assert_eq!(config.grace_period_ms, 2_000);
        assert_eq!(config.gap_fill_ceiling_ms, 500);
    }

    #[test]
    fn parses_toml() {
        let toml_text = r#"
            profile = "wifi"
            ring_high_water_frames = 96000
        "#;
        let config: ReceiverConfig = toml::from_str(toml_text).unwrap();
        assert_eq!(config.profile, ConnectionProfile::Wifi);
        assert_eq!(config.ring_high_water_frames, 96_000);
        // Unset fields fall back to defaults via #[serde(default)].
        assert_eq!(config.command_timeout_ms, 15_000);
    }
}
