use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Counter handle shared between the registry, the streaming pipeline, and
/// the runtime heartbeat loop.
pub type SharedMetrics = Arc<Mutex<Metrics>>;

pub fn shared() -> SharedMetrics {
    Arc::new(Mutex::new(Metrics::new()))
}

/// Lock the shared handle. A poisoned lock still yields the counters:
/// losing a heartbeat line is better than propagating a panic.
pub fn lock(metrics: &SharedMetrics) -> MutexGuard<'_, Metrics> {
    metrics.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Gateway runtime metrics, reported on the heartbeat log line
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Metrics {
    pub uptime_sec: u64,
    pub sessions_created: u64,
    pub sessions_evicted: u64,
    pub sessions_expired: u64,
    pub bridges_healed: u64,
    pub tool_calls_total: u64,
    pub tool_calls_failed: u64,
    pub memory_bytes: u64,
    pub custom: HashMap<String, f64>,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Update memory usage from system
    pub fn update_memory(&mut self) {
        #[cfg(target_os = "linux")]
        {
            if let Ok(status) = std::fs::read_to_string("/proc/self/status") {
                for line in status.lines() {
                    if line.starts_with("VmRSS:") {
                        if let Some(kb) = line.split_whitespace().nth(1) {
                            if let Ok(kb) = kb.parse::<u64>() {
                                self.memory_bytes = kb * 1024;
                            }
                        }
                    }
                }
            }
        }
    }

    pub fn record_session_created(&mut self) {
        self.sessions_created += 1;
    }

    pub fn record_sessions_evicted(&mut self, count: u64) {
        self.sessions_evicted += count;
    }

    pub fn record_sessions_expired(&mut self, count: u64) {
        self.sessions_expired += count;
    }

    pub fn record_bridge_healed(&mut self) {
        self.bridges_healed += 1;
    }

    /// Record a completed tool call
    pub fn record_tool_call(&mut self, failed: bool) {
        self.tool_calls_total += 1;
        if failed {
            self.tool_calls_failed += 1;
        }
    }

    /// Set a custom metric
    pub fn set_custom(&mut self, key: impl Into<String>, value: f64) {
        self.custom.insert(key.into(), value);
    }

    /// Tool call success rate as percentage
    pub fn tool_success_rate(&self) -> f64 {
        if self.tool_calls_total == 0 {
            return 100.0;
        }
        let succeeded = self.tool_calls_total - self.tool_calls_failed;
        (succeeded as f64 / self.tool_calls_total as f64) * 100.0
    }

    /// Increment uptime (typically called every heartbeat interval)
    pub fn increment_uptime(&mut self, seconds: u64) {
        self.uptime_sec += seconds;
    }
}
