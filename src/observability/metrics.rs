//! Thread-safe metrics collection for the connection pool
//!
//! Atomic counters for connection churn and publish outcomes, plus a bounded
//! window of publish latencies. The collector is owned by the service and
//! shared by `Arc`; there is no process-wide instance.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

const LATENCY_WINDOW: usize = 1000;

/// Thread-safe metrics collector using atomics and a mutex-protected window
pub struct MetricsCollector {
    // Connection churn
    connect_attempts: AtomicU64,
    connections_established: AtomicU64,
    connect_failures: AtomicU64,
    connect_timeouts: AtomicU64,
    connections_reused: AtomicU64,
    connections_replaced: AtomicU64,
    connections_closed: AtomicU64,

    // Publish outcomes
    messages_published: AtomicU64,
    publish_failures: AtomicU64,
    publish_times: Mutex<Vec<u64>>, // in milliseconds

    started_at: u64,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            connect_attempts: AtomicU64::new(0),
            connections_established: AtomicU64::new(0),
            connect_failures: AtomicU64::new(0),
            connect_timeouts: AtomicU64::new(0),
            connections_reused: AtomicU64::new(0),
            connections_replaced: AtomicU64::new(0),
            connections_closed: AtomicU64::new(0),
            messages_published: AtomicU64::new(0),
            publish_failures: AtomicU64::new(0),
            publish_times: Mutex::new(Vec::new()),
            started_at: current_timestamp(),
        }
    }

    pub fn connect_attempt(&self) {
        self.connect_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_established(&self) {
        self.connections_established.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connect_failed(&self, timed_out: bool) {
        self.connect_failures.fetch_add(1, Ordering::Relaxed);
        if timed_out {
            self.connect_timeouts.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn connection_reused(&self) {
        self.connections_reused.fetch_add(1, Ordering::Relaxed);
    }

    /// A pooled connection failed its liveness check and was dropped
    pub fn connection_replaced(&self) {
        self.connections_replaced.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connections_closed(&self, count: usize) {
        self.connections_closed
            .fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn message_published(&self, duration: Duration) {
        self.messages_published.fetch_add(1, Ordering::Relaxed);
        self.record_publish_time(duration);
    }

    pub fn publish_failed(&self) {
        self.publish_failures.fetch_add(1, Ordering::Relaxed);
    }

    fn record_publish_time(&self, duration: Duration) {
        if let Ok(mut times) = self.publish_times.lock() {
            times.push(duration.as_millis() as u64);

            if times.len() > LATENCY_WINDOW {
                times.remove(0);
            }
        }
    }

    fn publish_time_statistics(&self) -> (f64, f64, f64) {
        let Ok(times) = self.publish_times.lock() else {
            return (0.0, 0.0, 0.0);
        };
        if times.is_empty() {
            return (0.0, 0.0, 0.0);
        }

        let mut sorted = times.clone();
        sorted.sort_unstable();
        let avg = sorted.iter().sum::<u64>() as f64 / sorted.len() as f64;
        (avg, percentile(&sorted, 50.0), percentile(&sorted, 95.0))
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let now = current_timestamp();
        let (avg_publish_time_ms, publish_time_p50_ms, publish_time_p95_ms) =
            self.publish_time_statistics();

        MetricsSnapshot {
            connections: ConnectionMetrics {
                connect_attempts: self.connect_attempts.load(Ordering::Relaxed),
                connections_established: self.connections_established.load(Ordering::Relaxed),
                connect_failures: self.connect_failures.load(Ordering::Relaxed),
                connect_timeouts: self.connect_timeouts.load(Ordering::Relaxed),
                connections_reused: self.connections_reused.load(Ordering::Relaxed),
                connections_replaced: self.connections_replaced.load(Ordering::Relaxed),
                connections_closed: self.connections_closed.load(Ordering::Relaxed),
            },
            publishes: PublishMetrics {
                messages_published: self.messages_published.load(Ordering::Relaxed),
                publish_failures: self.publish_failures.load(Ordering::Relaxed),
                avg_publish_time_ms,
                publish_time_p50_ms,
                publish_time_p95_ms,
            },
            uptime_seconds: now.saturating_sub(self.started_at),
            timestamp: now,
        }
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub connections: ConnectionMetrics,
    pub publishes: PublishMetrics,
    pub uptime_seconds: u64,
    pub timestamp: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectionMetrics {
    pub connect_attempts: u64,
    pub connections_established: u64,
    pub connect_failures: u64,
    pub connect_timeouts: u64,
    pub connections_reused: u64,
    pub connections_replaced: u64,
    pub connections_closed: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct PublishMetrics {
    pub messages_published: u64,
    pub publish_failures: u64,
    pub avg_publish_time_ms: f64,
    pub publish_time_p50_ms: f64,
    pub publish_time_p95_ms: f64,
}

// Helper functions
fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn percentile(sorted_data: &[u64], percentile: f64) -> f64 {
    if sorted_data.is_empty() {
        return 0.0;
    }

    let len = sorted_data.len();
    let index = (percentile / 100.0) * (len - 1) as f64;

    if index.fract() == 0.0 {
        sorted_data[index as usize] as f64
    } else {
        let lower_value = sorted_data[index.floor() as usize] as f64;
        let upper_value = sorted_data[index.ceil() as usize] as f64;

        lower_value + (upper_value - lower_value) * index.fract()
    }
}
