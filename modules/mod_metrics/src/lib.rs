pub mod reporter;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use flux_traits::{Direction, SessionSnapshot, Stats};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::debug;

pub use reporter::StatsReporter;

/// Weight of the newest sample in the latency moving average.
pub const LATENCY_ALPHA: f64 = 0.1;

struct Session {
    started_at: DateTime<Utc>,
    bytes_upstream: AtomicU64,
    bytes_downstream: AtomicU64,
    packets_lost: AtomicU64,
}

impl Session {
    fn new() -> Self {
        Self {
            started_at: Utc::now(),
            bytes_upstream: AtomicU64::new(0),
            bytes_downstream: AtomicU64::new(0),
            packets_lost: AtomicU64::new(0),
        }
    }

    fn snapshot(&self, id: &str) -> SessionSnapshot {
        SessionSnapshot {
            id: id.to_string(),
            started_at: self.started_at,
            bytes_upstream: self.bytes_upstream.load(Ordering::Relaxed),
            bytes_downstream: self.bytes_downstream.load(Ordering::Relaxed),
            packets_lost: self.packets_lost.load(Ordering::Relaxed),
        }
    }
}

/// Concurrent aggregator of connection and traffic counters.
///
/// Counters are plain atomics; the latency average is a read-modify-write and
/// lives behind its own lock. The session map is sharded (`DashMap`) so that
/// inserts and removals from different connections rarely meet on a shard.
/// `active_connections` only moves down when a session is actually removed,
/// so it can never underflow.
pub struct MetricsCollector {
    active_connections: AtomicU64,
    total_connections: AtomicU64,
    total_bytes: AtomicU64,
    packets_lost: AtomicU64,
    average_latency_ms: Mutex<f64>,
    sessions: DashMap<String, Session>,
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            active_connections: AtomicU64::new(0),
            total_connections: AtomicU64::new(0),
            total_bytes: AtomicU64::new(0),
            packets_lost: AtomicU64::new(0),
            average_latency_ms: Mutex::new(0.0),
            sessions: DashMap::new(),
        }
    }

    /// Registers a session. Returns `false` (and changes nothing) if `id` is already live.
    pub fn start_connection(&self, id: &str) -> bool {
        match self.sessions.entry(id.to_string()) {
            Entry::Occupied(_) => {
                debug!("MetricsCollector: duplicate session id {}", id);
                false
            }
            Entry::Vacant(slot) => {
                slot.insert(Session::new());
                self.active_connections.fetch_add(1, Ordering::AcqRel);
                self.total_connections.fetch_add(1, Ordering::AcqRel);
                true
            }
        }
    }

    /// Removes a session. Ending an unknown or already-ended id is a no-op.
    pub fn end_connection(&self, id: &str) -> Option<SessionSnapshot> {
        let (key, session) = self.sessions.remove(id)?;
        self.active_connections.fetch_sub(1, Ordering::AcqRel);
        Some(session.snapshot(&key))
    }

    pub fn record_bytes(&self, n: usize) {
        self.total_bytes.fetch_add(n as u64, Ordering::Relaxed);
    }

    /// Attributes forwarded bytes to one session. Unknown ids are ignored.
    pub fn record_session_bytes(&self, id: &str, direction: Direction, n: usize) {
        if let Some(session) = self.sessions.get(id) {
            let counter = match direction {
                Direction::Upstream => &session.bytes_upstream,
                Direction::Downstream => &session.bytes_downstream,
            };
            counter.fetch_add(n as u64, Ordering::Relaxed);
        }
    }

    pub fn record_packet_loss(&self, id: &str) {
        self.packets_lost.fetch_add(1, Ordering::Relaxed);
        if let Some(session) = self.sessions.get(id) {
            session.packets_lost.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Folds one sample into the exponential moving average.
    pub fn record_latency(&self, latency: Duration) {
        let sample_ms = latency.as_secs_f64() * 1000.0;
        let mut avg = self.average_latency_ms.lock();
        *avg = *avg * (1.0 - LATENCY_ALPHA) + sample_ms * LATENCY_ALPHA;
    }

    pub fn get_stats(&self) -> Stats {
        Stats {
            active_connections: self.active_connections.load(Ordering::Acquire),
            total_connections: self.total_connections.load(Ordering::Acquire),
            total_bytes: self.total_bytes.load(Ordering::Relaxed),
            packets_lost: self.packets_lost.load(Ordering::Relaxed),
            average_latency_ms: *self.average_latency_ms.lock(),
        }
    }

    /// Snapshots every live session, oldest first.
    pub fn sessions(&self) -> Vec<SessionSnapshot> {
        let mut all: Vec<SessionSnapshot> = self
            .sessions
            .iter()
            .map(|entry| entry.value().snapshot(entry.key()))
            .collect();
        all.sort_by(|a, b| a.started_at.cmp(&b.started_at).then_with(|| a.id.cmp(&b.id)));
        all
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn start_then_end_moves_active_but_not_total() {
        let metrics = MetricsCollector::new();
        let before = metrics.get_stats();

        assert!(metrics.start_connection("127.0.0.1:5000-1"));
        let during = metrics.get_stats();
        assert_eq!(during.active_connections, before.active_connections + 1);
        assert_eq!(during.total_connections, before.total_connections + 1);

        assert!(metrics.end_connection("127.0.0.1:5000-1").is_some());
        let after = metrics.get_stats();
        assert_eq!(after.active_connections, before.active_connections);
        assert_eq!(after.total_connections, during.total_connections);
    }

    #[test]
    fn ending_twice_is_harmless() {
        let metrics = MetricsCollector::new();
        metrics.start_connection("a");
        metrics.start_connection("b");

        assert!(metrics.end_connection("a").is_some());
        assert!(metrics.end_connection("a").is_none());
        assert!(metrics.end_connection("never-started").is_none());

        let stats = metrics.get_stats();
        assert_eq!(stats.active_connections, 1);
        assert_eq!(stats.total_connections, 2);
    }

    #[test]
    fn duplicate_start_is_ignored() {
        let metrics = MetricsCollector::new();
        assert!(metrics.start_connection("dup"));
        assert!(!metrics.start_connection("dup"));

        let stats = metrics.get_stats();
        assert_eq!(stats.active_connections, 1);
        assert_eq!(stats.total_connections, 1);
        assert_eq!(metrics.session_count(), 1);
    }

    #[test]
    fn concurrent_byte_recording_loses_nothing() {
        let metrics = Arc::new(MetricsCollector::new());
        let handles: Vec<_> = (0..100)
            .map(|_| {
                let metrics = metrics.clone();
                std::thread::spawn(move || {
                    for _ in 0..10 {
                        metrics.record_bytes(100);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(metrics.get_stats().total_bytes, 100_000);
    }

    #[test]
    fn concurrent_sessions_balance_out() {
        let metrics = Arc::new(MetricsCollector::new());
        let handles: Vec<_> = (0..64)
            .map(|i| {
                let metrics = metrics.clone();
                std::thread::spawn(move || {
                    let id = format!("10.0.0.1:{}-{}", 40000 + i, i);
                    metrics.start_connection(&id);
                    metrics.record_latency(Duration::from_millis(5));
                    metrics.end_connection(&id);
                    metrics.end_connection(&id);
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        let stats = metrics.get_stats();
        assert_eq!(stats.active_connections, 0);
        assert_eq!(stats.total_connections, 64);
    }

    #[test]
    fn latency_average_is_exponentially_smoothed() {
        let metrics = MetricsCollector::new();
        metrics.record_latency(Duration::from_millis(100));
        assert!((metrics.get_stats().average_latency_ms - 10.0).abs() < 1e-9);

        metrics.record_latency(Duration::from_millis(100));
        assert!((metrics.get_stats().average_latency_ms - 19.0).abs() < 1e-9);

        for _ in 0..500 {
            metrics.record_latency(Duration::from_millis(100));
        }
        assert!((metrics.get_stats().average_latency_ms - 100.0).abs() < 1e-6);
    }

    #[test]
    fn per_session_traffic_is_attributed() {
        let metrics = MetricsCollector::new();
        metrics.start_connection("s1");
        metrics.record_session_bytes("s1", Direction::Upstream, 10);
        metrics.record_session_bytes("s1", Direction::Downstream, 32);
        metrics.record_session_bytes("ghost", Direction::Upstream, 99);
        metrics.record_packet_loss("s1");

        let sessions = metrics.sessions();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].bytes_upstream, 10);
        assert_eq!(sessions[0].bytes_downstream, 32);
        assert_eq!(sessions[0].packets_lost, 1);

        let closed = metrics.end_connection("s1").unwrap();
        assert_eq!(closed.id, "s1");
        assert_eq!(closed.bytes_downstream, 32);
        assert_eq!(metrics.get_stats().packets_lost, 1);
    }
}
