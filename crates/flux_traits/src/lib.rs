use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Fixed or jittered per-chunk delay. `min_ms == max_ms` means a fixed delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LatencyConfig {
    pub enabled: bool,
    pub min_ms: u64,
    pub max_ms: u64,
}

impl Default for LatencyConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            min_ms: 0,
            max_ms: 0,
        }
    }
}

/// Per-chunk drop probability, expressed as a fraction in `[0, 1]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PacketLossConfig {
    pub enabled: bool,
    pub probability: f64,
}

impl Default for PacketLossConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            probability: 0.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BandwidthConfig {
    pub enabled: bool,
    pub limit_kbps: u64,
}

impl Default for BandwidthConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            limit_kbps: 0,
        }
    }
}

/// Gates the reporting surface only. Collection always runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub path: String,
    pub listen_address: String,
    pub log_dir: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            path: "/metrics".to_string(),
            listen_address: "127.0.0.1:9091".to_string(),
            log_dir: ".".to_string(),
        }
    }
}

/// Process-wide aggregate as seen by the reporting surface.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct Stats {
    pub active_connections: u64,
    pub total_connections: u64,
    pub total_bytes: u64,
    pub packets_lost: u64,
    pub average_latency_ms: f64,
}

/// Bookkeeping view of one live connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub id: String,
    pub started_at: DateTime<Utc>,
    pub bytes_upstream: u64,
    pub bytes_downstream: u64,
    pub packets_lost: u64,
}

/// Which way a chunk travels through the proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// Client to server.
    Upstream,
    /// Server to client.
    Downstream,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Upstream => f.write_str("downstream->upstream"),
            Direction::Downstream => f.write_str("upstream->downstream"),
        }
    }
}

/// Policy consulted once per chunk by every directional pipe.
///
/// Implementations must be cheap and non-blocking: the pipe performs the
/// sleeps itself, so the caller is never held longer than the decided delay.
pub trait ConditionModel: Send + Sync {
    /// Whether the chunk just read should be discarded.
    fn should_drop(&self) -> bool;

    /// Propagation delay applied once per chunk.
    fn latency_delay(&self) -> Duration;

    /// Transmission delay for a chunk of `chunk_bytes` under the rate cap.
    fn bandwidth_delay(&self, chunk_bytes: usize) -> Duration;

    /// Returns the semantic identifier of the model.
    fn name(&self) -> &str;
}

/// A model that forwards everything untouched.
#[derive(Debug, Clone, Copy, Default)]
pub struct Passthrough;

impl ConditionModel for Passthrough {
    fn should_drop(&self) -> bool {
        false
    }

    fn latency_delay(&self) -> Duration {
        Duration::ZERO
    }

    fn bandwidth_delay(&self, _chunk_bytes: usize) -> Duration {
        Duration::ZERO
    }

    fn name(&self) -> &str {
        "Passthrough"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sections_default_to_disabled() {
        assert!(!LatencyConfig::default().enabled);
        assert!(!PacketLossConfig::default().enabled);
        assert!(!BandwidthConfig::default().enabled);
        assert!(!MetricsConfig::default().enabled);
        assert_eq!(MetricsConfig::default().path, "/metrics");
    }

    #[test]
    fn partial_section_fills_defaults() {
        let latency: LatencyConfig = serde_json::from_str(r#"{"enabled": true, "max_ms": 40}"#).unwrap();
        assert!(latency.enabled);
        assert_eq!(latency.min_ms, 0);
        assert_eq!(latency.max_ms, 40);
    }

    #[test]
    fn stats_serialize_with_public_field_names() {
        let json = serde_json::to_value(Stats {
            active_connections: 2,
            total_connections: 5,
            total_bytes: 1024,
            packets_lost: 1,
            average_latency_ms: 12.5,
        })
        .unwrap();
        assert_eq!(json["active_connections"], 2);
        assert_eq!(json["total_connections"], 5);
        assert_eq!(json["total_bytes"], 1024);
        assert_eq!(json["average_latency_ms"], 12.5);
    }

    #[test]
    fn passthrough_never_interferes() {
        let model = Passthrough;
        assert!(!model.should_drop());
        assert_eq!(model.latency_delay(), Duration::ZERO);
        assert_eq!(model.bandwidth_delay(1 << 20), Duration::ZERO);
    }
}
