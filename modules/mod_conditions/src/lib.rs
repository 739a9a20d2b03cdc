use flux_traits::{BandwidthConfig, ConditionModel, LatencyConfig, PacketLossConfig};
use rand::Rng;
use std::time::Duration;

/// Propagation delay: fixed when `min == max`, otherwise uniform in `[min, max)`.
#[derive(Debug, Clone, Copy)]
pub struct LatencyModel {
    enabled: bool,
    min: Duration,
    max: Duration,
}

impl LatencyModel {
    pub fn new(cfg: &LatencyConfig) -> Self {
        let min = Duration::from_millis(cfg.min_ms);
        // An inverted range degrades to the fixed lower bound.
        let max = Duration::from_millis(cfg.max_ms).max(min);
        Self {
            enabled: cfg.enabled,
            min,
            max,
        }
    }

    pub fn delay(&self) -> Duration {
        if !self.enabled {
            return Duration::ZERO;
        }
        if self.min == self.max {
            return self.min;
        }

        rand::thread_rng().gen_range(self.min..self.max)
    }
}

/// Independent per-chunk drop decision.
#[derive(Debug, Clone, Copy)]
pub struct PacketLossModel {
    enabled: bool,
    probability: f64,
}

impl PacketLossModel {
    pub fn new(cfg: &PacketLossConfig) -> Self {
        let probability = if cfg.probability.is_finite() {
            cfg.probability.clamp(0.0, 1.0)
        } else {
            0.0
        };
        Self {
            enabled: cfg.enabled,
            probability,
        }
    }

    pub fn should_drop(&self) -> bool {
        if !self.enabled || self.probability <= 0.0 {
            return false;
        }
        rand::thread_rng().gen::<f64>() < self.probability
    }
}

/// Serialisation delay of a chunk on a link capped at `limit_kbps`.
#[derive(Debug, Clone, Copy)]
pub struct BandwidthModel {
    enabled: bool,
    bits_per_second: u64,
}

impl BandwidthModel {
    pub fn new(cfg: &BandwidthConfig) -> Self {
        Self {
            enabled: cfg.enabled,
            bits_per_second: cfg.limit_kbps.saturating_mul(1000),
        }
    }

    pub fn delay(&self, chunk_bytes: usize) -> Duration {
        if !self.enabled || self.bits_per_second == 0 || chunk_bytes == 0 {
            return Duration::ZERO;
        }
        let bits = chunk_bytes as f64 * 8.0;
        Duration::from_secs_f64(bits / self.bits_per_second as f64)
    }
}

/// The three link effects composed into one policy.
///
/// Each effect is toggled on its own and applied as an independent delay (or
/// drop) per chunk. The random source is the calling thread's generator, so
/// connections on different worker threads never contend on a shared lock.
#[derive(Debug, Clone, Copy)]
pub struct Simulator {
    latency: LatencyModel,
    loss: PacketLossModel,
    bandwidth: BandwidthModel,
}

impl Simulator {
    pub fn new(latency: &LatencyConfig, loss: &PacketLossConfig, bandwidth: &BandwidthConfig) -> Self {
        let simulator = Self {
            latency: LatencyModel::new(latency),
            loss: PacketLossModel::new(loss),
            bandwidth: BandwidthModel::new(bandwidth),
        };
        tracing::debug!(
            "Simulator: latency={:?} loss={:?} bandwidth={:?}",
            simulator.latency,
            simulator.loss,
            simulator.bandwidth
        );
        simulator
    }
}

impl ConditionModel for Simulator {
    fn should_drop(&self) -> bool {
        self.loss.should_drop()
    }

    fn latency_delay(&self) -> Duration {
        self.latency.delay()
    }

    fn bandwidth_delay(&self, chunk_bytes: usize) -> Duration {
        self.bandwidth.delay(chunk_bytes)
    }

    fn name(&self) -> &str {
        "Simulator"
    }
}
