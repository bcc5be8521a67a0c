/**
 * HEALTH - Process-level health of the engine
 *
 * ROLE: Uptime, junction counters and resident memory for `/api/system/health`.
 */

use serde::{Deserialize, Serialize};
use std::time::Instant;

use crate::engine::EngineCounts;

#[derive(Debug, Serialize, Deserialize)]
pub struct KernelHealth {
    pub uptime_seconds: u64,
    pub junctions_total: usize,
    pub junctions_running: usize,
    pub junctions_error: usize,
    pub broker_connections: usize,
    pub memory_usage_mb: f32,
}

#[derive(Clone)]
pub struct HealthTracker {
    start_time: Instant,
}

impl Default for HealthTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthTracker {
    pub fn new() -> Self {
        Self { start_time: Instant::now() }
    }

    pub fn get_health(&self, counts: EngineCounts) -> KernelHealth {
        KernelHealth {
            uptime_seconds: self.start_time.elapsed().as_secs(),
            junctions_total: counts.junctions_total,
            junctions_running: counts.junctions_running,
            junctions_error: counts.junctions_error,
            broker_connections: counts.broker_connections,
            memory_usage_mb: get_memory_usage_mb(),
        }
    }
}

/// Resident set size from `/proc`; 0 where that is unavailable.
fn get_memory_usage_mb() -> f32 {
    #[cfg(target_os = "linux")]
    {
        if let Ok(status) = std::fs::read_to_string("/proc/self/status") {
            let kb = status
                .lines()
                .find(|l| l.starts_with("VmRSS:"))
                .and_then(|l| l.split_whitespace().nth(1))
                .and_then(|v| v.parse::<u64>().ok());
            if let Some(kb) = kb {
                return kb as f32 / 1024.0;
            }
        }
    }
    0.0
}
