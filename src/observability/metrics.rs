//! Thread-safe metrics collection system
//!
//! Provides atomic counters and a mutex-protected latency window for tracking
//! ingest requests and the broker publisher.

use once_cell::sync::Lazy;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Global metrics collector instance
pub static METRICS: Lazy<MetricsCollector> = Lazy::new(MetricsCollector::new);

/// Get reference to global metrics collector
pub fn metrics() -> &'static MetricsCollector {
    &METRICS
}

const LATENCY_WINDOW: usize = 1000;

/// Thread-safe metrics collector using atomics and mutexes
pub struct MetricsCollector {
    // Ingest request metrics
    requests_received: AtomicU64,
    requests_accepted: AtomicU64,
    requests_rejected: AtomicU64,
    requests_failed: AtomicU64,
    request_latencies: Mutex<Vec<u64>>, // in milliseconds

    // Publisher metrics
    broker_connected: AtomicBool,
    publish_attempts: AtomicU64,
    messages_published: AtomicU64,
    nacks: AtomicU64,
    confirm_timeouts: AtomicU64,
    cancellations: AtomicU64,
    publish_failures: AtomicU64,
    reconnect_attempts: AtomicU64,
    connections_established: AtomicU64,
    connection_failures: AtomicU64,
    connection_start_time: AtomicU64,

    uptime_start: AtomicU64,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            requests_received: AtomicU64::new(0),
            requests_accepted: AtomicU64::new(0),
            requests_rejected: AtomicU64::new(0),
            requests_failed: AtomicU64::new(0),
            request_latencies: Mutex::new(Vec::new()),
            broker_connected: AtomicBool::new(false),
            publish_attempts: AtomicU64::new(0),
            messages_published: AtomicU64::new(0),
            nacks: AtomicU64::new(0),
            confirm_timeouts: AtomicU64::new(0),
            cancellations: AtomicU64::new(0),
            publish_failures: AtomicU64::new(0),
            reconnect_attempts: AtomicU64::new(0),
            connections_established: AtomicU64::new(0),
            connection_failures: AtomicU64::new(0),
            connection_start_time: AtomicU64::new(0),
            uptime_start: AtomicU64::new(current_timestamp()),
        }
    }

    // Ingest request metrics
    pub fn request_received(&self) {
        self.requests_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn request_accepted(&self, duration: Duration) {
        self.requests_accepted.fetch_add(1, Ordering::Relaxed);
        self.record_latency(duration);
    }

    /// Request refused before publishing (malformed or incomplete payload)
    pub fn request_rejected(&self) {
        self.requests_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn request_failed(&self, duration: Duration) {
        self.requests_failed.fetch_add(1, Ordering::Relaxed);
        self.record_latency(duration);
    }

    fn record_latency(&self, duration: Duration) {
        if let Ok(mut latencies) = self.request_latencies.lock() {
            latencies.push(duration.as_millis() as u64);

            if latencies.len() > LATENCY_WINDOW {
                latencies.remove(0);
            }
        }
    }

    // Publisher metrics
    pub fn record_publish_attempt(&self) {
        self.publish_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_message_published(&self) {
        self.messages_published.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_nack(&self) {
        self.nacks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_confirm_timeout(&self) {
        self.confirm_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cancellation(&self) {
        self.cancellations.fetch_add(1, Ordering::Relaxed);
    }

    /// A publish that used its whole attempt budget
    pub fn record_publish_exhausted(&self) {
        self.publish_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reconnect_attempt(&self) {
        self.reconnect_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_connection_established(&self) {
        self.connections_established.fetch_add(1, Ordering::Relaxed);
        self.connection_start_time
            .store(current_timestamp(), Ordering::Relaxed);
    }

    pub fn record_connection_failure(&self) {
        self.connection_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_broker_connected(&self, connected: bool) {
        self.broker_connected.store(connected, Ordering::Relaxed);
        if !connected {
            self.connection_start_time.store(0, Ordering::Relaxed);
        }
    }

    pub fn is_broker_connected(&self) -> bool {
        self.broker_connected.load(Ordering::Relaxed)
    }

    /// Reset all metrics to initial state
    pub fn reset(&self) {
        for counter in [
            &self.requests_received,
            &self.requests_accepted,
            &self.requests_rejected,
            &self.requests_failed,
            &self.publish_attempts,
            &self.messages_published,
            &self.nacks,
            &self.confirm_timeouts,
            &self.cancellations,
            &self.publish_failures,
            &self.reconnect_attempts,
            &self.connections_established,
            &self.connection_failures,
            &self.connection_start_time,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
        self.broker_connected.store(false, Ordering::Relaxed);
        if let Ok(mut latencies) = self.request_latencies.lock() {
            latencies.clear();
        }
        self.uptime_start
            .store(current_timestamp(), Ordering::Relaxed);
    }

    fn latency_statistics(&self) -> (f64, f64, f64, f64) {
        let mut sorted = match self.request_latencies.lock() {
            Ok(latencies) => latencies.clone(),
            Err(_) => return (0.0, 0.0, 0.0, 0.0),
        };
        if sorted.is_empty() {
            return (0.0, 0.0, 0.0, 0.0);
        }
        sorted.sort_unstable();
        let avg = sorted.iter().sum::<u64>() as f64 / sorted.len() as f64;
        (
            avg,
            percentile(&sorted, 50.0),
            percentile(&sorted, 95.0),
            percentile(&sorted, 99.0),
        )
    }

    /// Get complete metrics snapshot
    pub fn get_metrics(&self) -> MetricsSnapshot {
        let now = current_timestamp();
        let (avg, p50, p95, p99) = self.latency_statistics();

        let connection_start = self.connection_start_time.load(Ordering::Relaxed);
        let connection_duration_seconds = if connection_start > 0 {
            now.saturating_sub(connection_start)
        } else {
            0
        };

        MetricsSnapshot {
            requests: RequestMetrics {
                received: self.requests_received.load(Ordering::Relaxed),
                accepted: self.requests_accepted.load(Ordering::Relaxed),
                rejected: self.requests_rejected.load(Ordering::Relaxed),
                failed: self.requests_failed.load(Ordering::Relaxed),
                avg_latency_ms: avg,
                latency_p50_ms: p50,
                latency_p95_ms: p95,
                latency_p99_ms: p99,
            },
            publisher: PublisherMetrics {
                connected: self.broker_connected.load(Ordering::Relaxed),
                publish_attempts: self.publish_attempts.load(Ordering::Relaxed),
                messages_published: self.messages_published.load(Ordering::Relaxed),
                nacks: self.nacks.load(Ordering::Relaxed),
                confirm_timeouts: self.confirm_timeouts.load(Ordering::Relaxed),
                cancellations: self.cancellations.load(Ordering::Relaxed),
                publish_failures: self.publish_failures.load(Ordering::Relaxed),
                reconnect_attempts: self.reconnect_attempts.load(Ordering::Relaxed),
                connections_established: self.connections_established.load(Ordering::Relaxed),
                connection_failures: self.connection_failures.load(Ordering::Relaxed),
                connection_duration_seconds,
            },
            uptime_seconds: now.saturating_sub(self.uptime_start.load(Ordering::Relaxed)),
            timestamp: now,
        }
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Serialize)]
pub struct MetricsSnapshot {
    pub requests: RequestMetrics,
    pub publisher: PublisherMetrics,
    pub uptime_seconds: u64,
    pub timestamp: u64,
}

#[derive(Debug, Serialize)]
pub struct RequestMetrics {
    pub received: u64,
    pub accepted: u64,
    pub rejected: u64,
    pub failed: u64,
    pub avg_latency_ms: f64,
    pub latency_p50_ms: f64,
    pub latency_p95_ms: f64,
    pub latency_p99_ms: f64,
}

#[derive(Debug, Serialize)]
pub struct PublisherMetrics {
    pub connected: bool,
    pub publish_attempts: u64,
    pub messages_published: u64,
    pub nacks: u64,
    pub confirm_timeouts: u64,
    pub cancellations: u64,
    pub publish_failures: u64,
    pub reconnect_attempts: u64,
    pub connections_established: u64,
    pub connection_failures: u64,
    pub connection_duration_seconds: u64,
}

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
        let lower = sorted_data[index.floor() as usize] as f64;
        let upper = sorted_data[index.ceil() as usize] as f64;
        lower + (upper - lower) * index.fract()
    }
}
