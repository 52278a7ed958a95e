use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

/// Point-in-time copy of the proxy traffic counters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrafficSnapshot {
    /// Total number of requests received (CONNECT and plain HTTP)
    pub total_requests: u64,
    /// Tunnels whose relays are still running
    pub active_tunnels: u64,
    /// Total number of established tunnels
    pub total_tunnels: u64,
    /// Total number of forwarded plain HTTP requests
    pub forwarded_requests: u64,
    /// Dial or outbound transport failures
    pub upstream_failures: u64,
    /// Bytes moved by relays and forwarded response bodies
    pub bytes_relayed: u64,
    /// Timestamp when the tracker was created (Unix timestamp)
    pub start_time: u64,
}

/// Lock-free traffic counters shared by every connection handler
#[derive(Debug, Clone)]
pub struct TrafficStats {
    total_requests: Arc<AtomicU64>,
    active_tunnels: Arc<AtomicU64>,
    total_tunnels: Arc<AtomicU64>,
    forwarded_requests: Arc<AtomicU64>,
    upstream_failures: Arc<AtomicU64>,
    bytes_relayed: Arc<AtomicU64>,
    start_time: u64,
}

impl TrafficStats {
    pub fn new() -> Self {
        Self {
            total_requests: Arc::new(AtomicU64::new(0)),
            active_tunnels: Arc::new(AtomicU64::new(0)),
            total_tunnels: Arc::new(AtomicU64::new(0)),
            forwarded_requests: Arc::new(AtomicU64::new(0)),
            upstream_failures: Arc::new(AtomicU64::new(0)),
            bytes_relayed: Arc::new(AtomicU64::new(0)),
            start_time: SystemTime::now()
                .duration_since(SystemTime::UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or_default(),
        }
    }

    pub fn request_received(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    /// Called once per tunnel when its relays start
    pub fn tunnel_opened(&self) {
        self.total_tunnels.fetch_add(1, Ordering::Relaxed);
        self.active_tunnels.fetch_add(1, Ordering::Relaxed);
    }

    /// Called once per tunnel when both relays have finished
    pub fn tunnel_closed(&self) {
        // saturating: never wraps below zero
        let _ = self
            .active_tunnels
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
                Some(v.saturating_sub(1))
            });
    }

    pub fn request_forwarded(&self) {
        self.forwarded_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn upstream_failed(&self) {
        self.upstream_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_bytes(&self, bytes: u64) {
        self.bytes_relayed.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Get current snapshot of stats
    pub fn snapshot(&self) -> TrafficSnapshot {
        TrafficSnapshot {
            total_requests: self.total_requests.load(Ordering::Relaxed),
            active_tunnels: self.active_tunnels.load(Ordering::Relaxed),
            total_tunnels: self.total_tunnels.load(Ordering::Relaxed),
            forwarded_requests: self.forwarded_requests.load(Ordering::Relaxed),
            upstream_failures: self.upstream_failures.load(Ordering::Relaxed),
            bytes_relayed: self.bytes_relayed.load(Ordering::Relaxed),
            start_time: self.start_time,
        }
    }
}

impl Default for TrafficStats {
    fn default() -> Self {
        Self::new()
    }
}

/// 格式化字节数为人类可读格式
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_idx = 0;

    while size >= 1024.0 && unit_idx < UNITS.len() - 1 {
        size /= 1024.0;
        unit_idx += 1;
    }

    if unit_idx == 0 {
        format!("{} {}", bytes, UNITS[unit_idx])
    } else {
        format!("{:.2} {}", size, UNITS[unit_idx])
    }
}
