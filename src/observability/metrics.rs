//! Thread-safe metrics collection system
//!
//! Atomic counters for the hot paths (routing, upstream sends, store
//! operations) and mutex-protected collections for per-endpoint detail.

use once_cell::sync::Lazy;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Global metrics collector instance
pub static METRICS: Lazy<MetricsCollector> = Lazy::new(MetricsCollector::new);

/// Get reference to global metrics collector
pub fn metrics() -> &'static MetricsCollector {
    &METRICS
}

/// Thread-safe metrics collector using atomics and mutexes
pub struct MetricsCollector {
    // Routing
    messages_received: AtomicU64,
    messages_delivered: AtomicU64,
    messages_stored: AtomicU64,
    messages_failed: AtomicU64,
    messages_unmatched: AtomicU64,
    route_reloads: AtomicU64,

    // Store
    store_dropped: AtomicU64,
    store_expired: AtomicU64,
    store_acked: AtomicU64,

    // Upstream
    cloud_open_attempts: AtomicU64,
    cloud_connections_established: AtomicU64,
    cloud_connection_failures: AtomicU64,
    cloud_connections_active: AtomicU64,
    cloud_sends: AtomicU64,
    cloud_send_failures: AtomicU64,
    cloud_throttled: AtomicU64,

    // Downstream
    devices_connected: AtomicU64,
    device_connects: AtomicU64,
    device_disconnects: AtomicU64,
    connections_replaced: AtomicU64,

    // Twin
    reported_patches_sent: AtomicU64,
    reported_patches_dropped: AtomicU64,
    desired_patches_received: AtomicU64,
    twin_conflicts: AtomicU64,

    // Upstream send latency in milliseconds
    send_times: Mutex<Vec<u64>>,

    // Depth per endpoint queue, keyed by queue name
    queue_depths: Mutex<HashMap<String, u64>>,

    // Lifecycle
    hub_state: Mutex<String>,
    uptime_start: AtomicU64,
    state_transitions: AtomicU64,
    health_status: AtomicBool,
    last_health_check: AtomicU64,
}

impl MetricsCollector {
    pub fn new() -> Self {
        let now = current_timestamp();

        Self {
            messages_received: AtomicU64::new(0),
            messages_delivered: AtomicU64::new(0),
            messages_stored: AtomicU64::new(0),
            messages_failed: AtomicU64::new(0),
            messages_unmatched: AtomicU64::new(0),
            route_reloads: AtomicU64::new(0),
            store_dropped: AtomicU64::new(0),
            store_expired: AtomicU64::new(0),
            store_acked: AtomicU64::new(0),
            cloud_open_attempts: AtomicU64::new(0),
            cloud_connections_established: AtomicU64::new(0),
            cloud_connection_failures: AtomicU64::new(0),
            cloud_connections_active: AtomicU64::new(0),
            cloud_sends: AtomicU64::new(0),
            cloud_send_failures: AtomicU64::new(0),
            cloud_throttled: AtomicU64::new(0),
            devices_connected: AtomicU64::new(0),
            device_connects: AtomicU64::new(0),
            device_disconnects: AtomicU64::new(0),
            connections_replaced: AtomicU64::new(0),
            reported_patches_sent: AtomicU64::new(0),
            reported_patches_dropped: AtomicU64::new(0),
            desired_patches_received: AtomicU64::new(0),
            twin_conflicts: AtomicU64::new(0),
            send_times: Mutex::new(Vec::new()),
            queue_depths: Mutex::new(HashMap::new()),
            hub_state: Mutex::new("initializing".to_string()),
            uptime_start: AtomicU64::new(now),
            state_transitions: AtomicU64::new(0),
            health_status: AtomicBool::new(true),
            last_health_check: AtomicU64::new(now),
        }
    }

    // Routing metrics
    pub fn message_received(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn message_delivered(&self) {
        self.messages_delivered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn message_stored(&self) {
        self.messages_stored.fetch_add(1, Ordering::Relaxed);
    }

    pub fn message_failed(&self) {
        self.messages_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn message_unmatched(&self) {
        self.messages_unmatched.fetch_add(1, Ordering::Relaxed);
    }

    pub fn routes_reloaded(&self) {
        self.route_reloads.fetch_add(1, Ordering::Relaxed);
    }

    // Store metrics
    pub fn store_dropped(&self, count: u64) {
        self.store_dropped.fetch_add(count, Ordering::Relaxed);
    }

    pub fn store_expired(&self, count: u64) {
        self.store_expired.fetch_add(count, Ordering::Relaxed);
    }

    pub fn store_acked(&self, count: u64) {
        self.store_acked.fetch_add(count, Ordering::Relaxed);
    }

    pub fn set_queue_depth(&self, queue: &str, depth: usize) {
        if let Ok(mut depths) = self.queue_depths.lock() {
            if depth == 0 {
                depths.remove(queue);
            } else {
                depths.insert(queue.to_string(), depth as u64);
            }
        }
    }

    // Upstream metrics
    pub fn cloud_open_attempt(&self) {
        self.cloud_open_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn cloud_connection_established(&self) {
        self.cloud_connections_established
            .fetch_add(1, Ordering::Relaxed);
        self.cloud_connections_active.fetch_add(1, Ordering::Relaxed);
    }

    pub fn cloud_connection_failed(&self) {
        self.cloud_connection_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn cloud_connection_lost(&self) {
        saturating_decrement(&self.cloud_connections_active);
    }

    pub fn cloud_send_completed(&self, duration: Duration) {
        self.cloud_sends.fetch_add(1, Ordering::Relaxed);
        self.record_send_time(duration);
    }

    pub fn cloud_send_failed(&self) {
        self.cloud_send_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn cloud_throttled(&self) {
        self.cloud_throttled.fetch_add(1, Ordering::Relaxed);
    }

    fn record_send_time(&self, duration: Duration) {
        if let Ok(mut times) = self.send_times.lock() {
            times.push(duration.as_millis() as u64);

            // Limit to last 1000 measurements to prevent unbounded growth
            if times.len() > 1000 {
                times.remove(0);
            }
        }
    }

    // Downstream metrics
    pub fn device_connected(&self) {
        self.device_connects.fetch_add(1, Ordering::Relaxed);
        self.devices_connected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn device_disconnected(&self) {
        self.device_disconnects.fetch_add(1, Ordering::Relaxed);
        saturating_decrement(&self.devices_connected);
    }

    pub fn connection_replaced(&self) {
        self.connections_replaced.fetch_add(1, Ordering::Relaxed);
    }

    // Twin metrics
    pub fn reported_patch_sent(&self) {
        self.reported_patches_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn reported_patch_dropped(&self) {
        self.reported_patches_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn desired_patch_received(&self) {
        self.desired_patches_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn twin_conflict(&self) {
        self.twin_conflicts.fetch_add(1, Ordering::Relaxed);
    }

    // Lifecycle metrics
    pub fn set_hub_state(&self, state: &str) {
        if let Ok(mut current_state) = self.hub_state.lock() {
            if *current_state != state {
                self.state_transitions.fetch_add(1, Ordering::Relaxed);
                *current_state = state.to_string();
            }
        }
    }

    pub fn update_health_status(&self, healthy: bool) {
        self.health_status.store(healthy, Ordering::Relaxed);
        self.last_health_check
            .store(current_timestamp(), Ordering::Relaxed);
    }

    // Reset all metrics (useful for testing)
    pub fn reset(&self) {
        for counter in [
            &self.messages_received,
            &self.messages_delivered,
            &self.messages_stored,
            &self.messages_failed,
            &self.messages_unmatched,
            &self.route_reloads,
            &self.store_dropped,
            &self.store_expired,
            &self.store_acked,
            &self.cloud_open_attempts,
            &self.cloud_connections_established,
            &self.cloud_connection_failures,
            &self.cloud_connections_active,
            &self.cloud_sends,
            &self.cloud_send_failures,
            &self.cloud_throttled,
            &self.devices_connected,
            &self.device_connects,
            &self.device_disconnects,
            &self.connections_replaced,
            &self.reported_patches_sent,
            &self.reported_patches_dropped,
            &self.desired_patches_received,
            &self.twin_conflicts,
            &self.state_transitions,
        ] {
            counter.store(0, Ordering::Relaxed);
        }

        let now = current_timestamp();
        self.uptime_start.store(now, Ordering::Relaxed);
        self.health_status.store(true, Ordering::Relaxed);
        self.last_health_check.store(now, Ordering::Relaxed);

        if let Ok(mut times) = self.send_times.lock() {
            times.clear();
        }
        if let Ok(mut depths) = self.queue_depths.lock() {
            depths.clear();
        }
        if let Ok(mut state) = self.hub_state.lock() {
            *state = "initializing".to_string();
        }
    }

    /// Calculate send latency statistics (pure function)
    fn calculate_send_time_statistics(&self) -> (f64, f64, f64, f64) {
        if let Ok(times) = self.send_times.lock() {
            if times.is_empty() {
                (0.0, 0.0, 0.0, 0.0)
            } else {
                let mut sorted_times = times.clone();
                sorted_times.sort_unstable();

                let avg = sorted_times.iter().sum::<u64>() as f64 / sorted_times.len() as f64;
                let p50 = percentile(&sorted_times, 50.0);
                let p95 = percentile(&sorted_times, 95.0);
                let p99 = percentile(&sorted_times, 99.0);

                (avg, p50, p95, p99)
            }
        } else {
            (0.0, 0.0, 0.0, 0.0)
        }
    }

    fn current_hub_state(&self) -> String {
        self.hub_state
            .lock()
            .map(|s| s.clone())
            .unwrap_or_else(|_| "unknown".to_string())
    }

    /// Get complete metrics snapshot
    pub fn snapshot(&self) -> MetricsSnapshot {
        let now = current_timestamp();
        let (avg_send_time_ms, p50, p95, p99) = self.calculate_send_time_statistics();
        let queue_depths = self
            .queue_depths
            .lock()
            .map(|depths| depths.clone())
            .unwrap_or_default();
        let total_depth = queue_depths.values().sum();

        MetricsSnapshot {
            routing: RoutingMetrics {
                messages_received: self.messages_received.load(Ordering::Relaxed),
                messages_delivered: self.messages_delivered.load(Ordering::Relaxed),
                messages_stored: self.messages_stored.load(Ordering::Relaxed),
                messages_failed: self.messages_failed.load(Ordering::Relaxed),
                messages_unmatched: self.messages_unmatched.load(Ordering::Relaxed),
                route_reloads: self.route_reloads.load(Ordering::Relaxed),
            },
            store: StoreMetrics {
                total_depth,
                queue_depths,
                dropped: self.store_dropped.load(Ordering::Relaxed),
                expired: self.store_expired.load(Ordering::Relaxed),
                acked: self.store_acked.load(Ordering::Relaxed),
            },
            upstream: UpstreamMetrics {
                open_attempts: self.cloud_open_attempts.load(Ordering::Relaxed),
                connections_established: self
                    .cloud_connections_established
                    .load(Ordering::Relaxed),
                connection_failures: self.cloud_connection_failures.load(Ordering::Relaxed),
                connections_active: self.cloud_connections_active.load(Ordering::Relaxed),
                sends: self.cloud_sends.load(Ordering::Relaxed),
                send_failures: self.cloud_send_failures.load(Ordering::Relaxed),
                throttled: self.cloud_throttled.load(Ordering::Relaxed),
                avg_send_time_ms,
                send_time_p50_ms: p50,
                send_time_p95_ms: p95,
                send_time_p99_ms: p99,
            },
            devices: DeviceMetrics {
                connected: self.devices_connected.load(Ordering::Relaxed),
                connects: self.device_connects.load(Ordering::Relaxed),
                disconnects: self.device_disconnects.load(Ordering::Relaxed),
                replaced: self.connections_replaced.load(Ordering::Relaxed),
            },
            twin: TwinMetrics {
                reported_patches_sent: self.reported_patches_sent.load(Ordering::Relaxed),
                reported_patches_dropped: self.reported_patches_dropped.load(Ordering::Relaxed),
                desired_patches_received: self.desired_patches_received.load(Ordering::Relaxed),
                conflicts: self.twin_conflicts.load(Ordering::Relaxed),
            },
            lifecycle: LifecycleMetrics {
                current_state: self.current_hub_state(),
                uptime_seconds: now.saturating_sub(self.uptime_start.load(Ordering::Relaxed)),
                state_transitions: self.state_transitions.load(Ordering::Relaxed),
                healthy: self.health_status.load(Ordering::Relaxed),
                last_health_check: self.last_health_check.load(Ordering::Relaxed),
            },
            timestamp: now,
        }
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

// Public metrics structures
#[derive(Debug, Serialize)]
pub struct MetricsSnapshot {
    pub routing: RoutingMetrics,
    pub store: StoreMetrics,
    pub upstream: UpstreamMetrics,
    pub devices: DeviceMetrics,
    pub twin: TwinMetrics,
    pub lifecycle: LifecycleMetrics,
    pub timestamp: u64,
}

#[derive(Debug, Serialize)]
pub struct RoutingMetrics {
    pub messages_received: u64,
    pub messages_delivered: u64,
    pub messages_stored: u64,
    pub messages_failed: u64,
    pub messages_unmatched: u64,
    pub route_reloads: u64,
}

#[derive(Debug, Serialize)]
pub struct StoreMetrics {
    pub total_depth: u64,
    pub queue_depths: HashMap<String, u64>,
    pub dropped: u64,
    pub expired: u64,
    pub acked: u64,
}

#[derive(Debug, Serialize)]
pub struct UpstreamMetrics {
    pub open_attempts: u64,
    pub connections_established: u64,
    pub connection_failures: u64,
    pub connections_active: u64,
    pub sends: u64,
    pub send_failures: u64,
    pub throttled: u64,
    pub avg_send_time_ms: f64,
    pub send_time_p50_ms: f64,
    pub send_time_p95_ms: f64,
    pub send_time_p99_ms: f64,
}

#[derive(Debug, Serialize)]
pub struct DeviceMetrics {
    pub connected: u64,
    pub connects: u64,
    pub disconnects: u64,
    pub replaced: u64,
}

#[derive(Debug, Serialize)]
pub struct TwinMetrics {
    pub reported_patches_sent: u64,
    pub reported_patches_dropped: u64,
    pub desired_patches_received: u64,
    pub conflicts: u64,
}

#[derive(Debug, Serialize)]
pub struct LifecycleMetrics {
    pub current_state: String,
    pub uptime_seconds: u64,
    pub state_transitions: u64,
    pub healthy: bool,
    pub last_health_check: u64,
}

// Helper functions
fn saturating_decrement(counter: &AtomicU64) {
    let _ = counter.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
        Some(v.saturating_sub(1))
    });
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
        let lower_index = index.floor() as usize;
        let upper_index = index.ceil() as usize;
        let lower_value = sorted_data[lower_index] as f64;
        let upper_value = sorted_data[upper_index] as f64;

        lower_value + (upper_value - lower_value) * index.fract()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_routing_metrics() {
        let collector = MetricsCollector::new();

        collector.message_received();
        collector.message_received();
        collector.message_delivered();
        collector.message_stored();
        collector.message_unmatched();

        let metrics = collector.snapshot();
        assert_eq!(metrics.routing.messages_received, 2);
        assert_eq!(metrics.routing.messages_delivered, 1);
        assert_eq!(metrics.routing.messages_stored, 1);
        assert_eq!(metrics.routing.messages_unmatched, 1);
    }

    #[test]
    fn test_upstream_metrics() {
        let collector = MetricsCollector::new();

        collector.cloud_open_attempt();
        collector.cloud_connection_established();
        collector.cloud_send_completed(Duration::from_millis(40));
        collector.cloud_send_completed(Duration::from_millis(60));

        let metrics = collector.snapshot();
        assert_eq!(metrics.upstream.open_attempts, 1);
        assert_eq!(metrics.upstream.connections_active, 1);
        assert_eq!(metrics.upstream.sends, 2);
        assert!((metrics.upstream.avg_send_time_ms - 50.0).abs() < 0.1);

        collector.cloud_connection_lost();
        collector.cloud_connection_lost();
        assert_eq!(collector.snapshot().upstream.connections_active, 0);
    }

    #[test]
    fn test_queue_depths() {
        let collector = MetricsCollector::new();

        collector.set_queue_depth("leaf-1/$upstream", 3);
        collector.set_queue_depth("edge/filter/input1", 2);
        assert_eq!(collector.snapshot().store.total_depth, 5);

        collector.set_queue_depth("leaf-1/$upstream", 0);
        let metrics = collector.snapshot();
        assert_eq!(metrics.store.total_depth, 2);
        assert!(!metrics.store.queue_depths.contains_key("leaf-1/$upstream"));
    }

    #[test]
    fn test_thread_safety() {
        let collector = Arc::new(MetricsCollector::new());

        let mut handles = vec![];

        for _ in 0..10 {
            let collector_clone = Arc::clone(&collector);
            let handle = thread::spawn(move || {
                for _ in 0..100 {
                    collector_clone.message_received();
                    collector_clone.message_delivered();
                }
            });
            handles.push(handle);
        }

        for handle in handles {
            handle.join().unwrap();
        }

        let metrics = collector.snapshot();
        assert_eq!(metrics.routing.messages_received, 1000);
        assert_eq!(metrics.routing.messages_delivered, 1000);
    }

    #[test]
    fn test_percentile_calculation() {
        let data = vec![1, 2, 3, 4, 5, 6, 7, 8, 9, 10];

        let p50 = percentile(&data, 50.0);
        let p95 = percentile(&data, 95.0);

        assert!((p50 - 5.5).abs() < 0.1, "P50: expected ~5.5, got {p50}");
        assert!((p95 - 9.5).abs() < 0.1, "P95: expected ~9.5, got {p95}");
        assert_eq!(percentile(&[], 50.0), 0.0);
    }

    #[test]
    fn test_state_transitions_counted_once() {
        let collector = MetricsCollector::new();

        collector.set_hub_state("running");
        collector.set_hub_state("running");
        collector.set_hub_state("stopping");

        let metrics = collector.snapshot();
        assert_eq!(metrics.lifecycle.current_state, "stopping");
        assert_eq!(metrics.lifecycle.state_transitions, 2);
    }

    #[test]
    fn test_reset_functionality() {
        let collector = MetricsCollector::new();

        collector.message_received();
        collector.device_connected();
        collector.set_queue_depth("q", 4);

        collector.reset();

        let metrics = collector.snapshot();
        assert_eq!(metrics.routing.messages_received, 0);
        assert_eq!(metrics.devices.connected, 0);
        assert!(metrics.store.queue_depths.is_empty());
    }
}
