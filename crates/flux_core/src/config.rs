use flux_traits::{BandwidthConfig, LatencyConfig, MetricsConfig, PacketLossConfig};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Invalid(String),
}

/// Process-wide settings. Loaded once and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub listen_address: String,
    pub upstream_address: String,
    pub latency: LatencyConfig,
    pub packet_loss: PacketLossConfig,
    pub bandwidth: BandwidthConfig,
    pub metrics: MetricsConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_address: "127.0.0.1:42069".to_string(),
            upstream_address: "127.0.0.1:8080".to_string(),
            latency: LatencyConfig::default(),
            packet_loss: PacketLossConfig::default(),
            bandwidth: BandwidthConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Config {
    /// Reads `.json` files as JSON and everything else as YAML, then validates.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        let is_json = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
        let config = if is_json {
            Self::from_json_str(&raw)?
        } else {
            Self::from_yaml_str(&raw)?
        };

        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_str(raw: &str) -> Result<Self, ConfigError> {
        // An empty document is a valid "all defaults" file.
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(raw)?)
    }

    pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(raw)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.listen_address.trim().is_empty() {
            return Err(invalid("listen_address must not be empty"));
        }
        if self.upstream_address.trim().is_empty() {
            return Err(invalid("upstream_address must not be empty"));
        }

        if self.latency.enabled && self.latency.min_ms > self.latency.max_ms {
            return Err(invalid(format!(
                "latency.min_ms ({}) exceeds latency.max_ms ({})",
                self.latency.min_ms, self.latency.max_ms
            )));
        }

        let p = self.packet_loss.probability;
        if !p.is_finite() || !(0.0..=1.0).contains(&p) {
            return Err(invalid(format!(
                "packet_loss.probability must be a fraction between 0.0 and 1.0 (got {p})"
            )));
        }

        if self.bandwidth.enabled && self.bandwidth.limit_kbps == 0 {
            return Err(invalid("bandwidth.limit_kbps must be positive when bandwidth is enabled"));
        }

        if !self.metrics.path.starts_with('/') {
            return Err(invalid(format!(
                "metrics.path must start with '/' (got {:?})",
                self.metrics.path
            )));
        }
        if self.metrics.enabled && self.metrics.listen_address.parse::<SocketAddr>().is_err() {
            return Err(invalid(format!(
                "metrics.listen_address must be an ip:port pair (got {:?})",
                self.metrics.listen_address
            )));
        }

        Ok(())
    }
}

fn invalid(msg: impl Into<String>) -> ConfigError {
    ConfigError::Invalid(msg.into())
}
