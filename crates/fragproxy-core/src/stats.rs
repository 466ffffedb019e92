//! Connection and traffic counters, plus periodic throughput tracking.
//!
//! Counters are plain atomics so hot-path increments never contend with the
//! 1Hz snapshot writer. Speed tracking needs a previous-sample, so it lives
//! behind a small mutex that only the periodic tick touches.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use parking_lot::Mutex;
use serde::Serialize;

use crate::fragment::FragmentMethod;

struct SpeedState {
    last_traffic_in: u64,
    last_traffic_out: u64,
    last_time: Option<Instant>,
    speed_in_bps: f64,
    speed_out_bps: f64,
    avg_speed_in_sum: f64,
    avg_speed_in_count: u64,
    avg_speed_out_sum: f64,
    avg_speed_out_count: u64,
}

impl Default for SpeedState {
    fn default() -> Self {
        Self {
            last_traffic_in: 0,
            last_traffic_out: 0,
            last_time: None,
            speed_in_bps: 0.0,
            speed_out_bps: 0.0,
            avg_speed_in_sum: 0.0,
            avg_speed_in_count: 1,
            avg_speed_out_sum: 0.0,
            avg_speed_out_count: 1,
        }
    }
}

/// Process-wide connection and traffic counters.
pub struct StatsSink {
    total_connections: AtomicU64,
    allowed_connections: AtomicU64,
    blocked_connections: AtomicU64,
    error_connections: AtomicU64,
    traffic_in: AtomicU64,
    traffic_out: AtomicU64,
    speed: Mutex<SpeedState>,
}

impl StatsSink {
    /// A fresh, all-zero set of counters.
    pub fn new() -> Self {
        Self {
            total_connections: AtomicU64::new(0),
            allowed_connections: AtomicU64::new(0),
            blocked_connections: AtomicU64::new(0),
            error_connections: AtomicU64::new(0),
            traffic_in: AtomicU64::new(0),
            traffic_out: AtomicU64::new(0),
            speed: Mutex::new(SpeedState::default()),
        }
    }

    /// Record the start of a new connection.
    pub fn record_connection(&self) {
        self.total_connections.fetch_add(1, Ordering::Relaxed);
    }

    /// Record that a connection was allowed through unfragmented.
    pub fn record_allowed(&self) {
        self.allowed_connections.fetch_add(1, Ordering::Relaxed);
    }

    /// Record that a connection's first record was fragmented.
    pub fn record_blocked(&self) {
        self.blocked_connections.fetch_add(1, Ordering::Relaxed);
    }

    /// Record that a connection ended in an error.
    pub fn record_error(&self) {
        self.error_connections.fetch_add(1, Ordering::Relaxed);
    }

    /// Accumulate relayed byte counts.
    pub fn record_traffic(&self, incoming: u64, outgoing: u64) {
        self.traffic_in.fetch_add(incoming, Ordering::Relaxed);
        self.traffic_out.fetch_add(outgoing, Ordering::Relaxed);
    }

    /// Recompute instantaneous and running-average speeds against the
    /// previous call. Intended to be driven by a 1Hz tick; the first call
    /// only seeds the baseline and reports zero speed.
    pub fn update_speeds(&self) {
        let now = Instant::now();
        let traffic_in = self.traffic_in.load(Ordering::Relaxed);
        let traffic_out = self.traffic_out.load(Ordering::Relaxed);
        let mut speed = self.speed.lock();

        if let Some(last_time) = speed.last_time {
            let dt = now.duration_since(last_time).as_secs_f64();
            if dt > 0.0 {
                speed.speed_in_bps = (traffic_in - speed.last_traffic_in) as f64 * 8.0 / dt;
                speed.speed_out_bps = (traffic_out - speed.last_traffic_out) as f64 * 8.0 / dt;
                if speed.speed_in_bps > 0.0 {
                    speed.avg_speed_in_sum += speed.speed_in_bps;
                    speed.avg_speed_in_count += 1;
                }
                if speed.speed_out_bps > 0.0 {
                    speed.avg_speed_out_sum += speed.speed_out_bps;
                    speed.avg_speed_out_count += 1;
                }
            }
        }

        speed.last_traffic_in = traffic_in;
        speed.last_traffic_out = traffic_out;
        speed.last_time = Some(now);
    }

    /// Build a point-in-time snapshot, ready for JSON serialization.
    pub fn snapshot(&self, fragment_method: FragmentMethod, host: &str, port: u16) -> Snapshot {
        let total = self.total_connections.load(Ordering::Relaxed);
        let allowed = self.allowed_connections.load(Ordering::Relaxed);
        let blocked = self.blocked_connections.load(Ordering::Relaxed);
        let errors = self.error_connections.load(Ordering::Relaxed);
        let efficiency = if total > 0 {
            (blocked as f64 / total as f64) * 100.0
        } else {
            0.0
        };

        let speed = self.speed.lock();
        Snapshot {
            total_connections: total,
            allowed_connections: allowed,
            blocked_connections: blocked,
            error_connections: errors,
            traffic_in: self.traffic_in.load(Ordering::Relaxed),
            traffic_out: self.traffic_out.load(Ordering::Relaxed),
            speed_in_bps: speed.speed_in_bps,
            speed_out_bps: speed.speed_out_bps,
            avg_speed_in_bps: speed.avg_speed_in_sum / speed.avg_speed_in_count as f64,
            avg_speed_out_bps: speed.avg_speed_out_sum / speed.avg_speed_out_count as f64,
            efficiency,
            fragment_method,
            host: host.to_string(),
            port,
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }
}

impl Default for StatsSink {
    fn default() -> Self {
        Self::new()
    }
}

/// A serializable point-in-time view of [`StatsSink`]'s counters.
#[derive(Debug, Clone, Serialize)]
pub struct Snapshot {
    pub total_connections: u64,
    pub allowed_connections: u64,
    pub blocked_connections: u64,
    pub error_connections: u64,
    pub traffic_in: u64,
    pub traffic_out: u64,
    pub speed_in_bps: f64,
    pub speed_out_bps: f64,
    pub avg_speed_in_bps: f64,
    pub avg_speed_out_bps: f64,
    pub efficiency: f64,
    pub fragment_method: FragmentMethod,
    pub host: String,
    pub port: u16,
    pub timestamp: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_start_at_zero() {
        let stats = StatsSink::new();
        let snap = stats.snapshot(FragmentMethod::Random, "127.0.0.1", 8881);
        assert_eq!(snap.total_connections, 0);
        assert_eq!(snap.efficiency, 0.0);
    }

    #[test]
    fn efficiency_is_blocked_over_total_as_percent() {
        let stats = StatsSink::new();
        stats.record_connection();
        stats.record_connection();
        stats.record_connection();
        stats.record_connection();
        stats.record_blocked();
        let snap = stats.snapshot(FragmentMethod::Random, "127.0.0.1", 8881);
        assert_eq!(snap.total_connections, 4);
        assert_eq!(snap.blocked_connections, 1);
        assert!((snap.efficiency - 25.0).abs() < f64::EPSILON);
    }

    #[test]
    fn traffic_accumulates_across_calls() {
        let stats = StatsSink::new();
        stats.record_traffic(100, 50);
        stats.record_traffic(20, 10);
        let snap = stats.snapshot(FragmentMethod::Random, "127.0.0.1", 8881);
        assert_eq!(snap.traffic_in, 120);
        assert_eq!(snap.traffic_out, 60);
    }

    #[test]
    fn first_speed_update_seeds_baseline_without_panicking() {
        let stats = StatsSink::new();
        stats.record_traffic(1000, 1000);
        stats.update_speeds();
        let snap = stats.snapshot(FragmentMethod::Random, "127.0.0.1", 8881);
        assert_eq!(snap.speed_in_bps, 0.0);
    }

    #[test]
    fn snapshot_carries_identity_fields() {
        let stats = StatsSink::new();
        let snap = stats.snapshot(FragmentMethod::Sni, "0.0.0.0", 9999);
        assert_eq!(snap.host, "0.0.0.0");
        assert_eq!(snap.port, 9999);
        assert_eq!(snap.fragment_method, FragmentMethod::Sni);
        assert!(!snap.timestamp.is_empty());
    }
}
