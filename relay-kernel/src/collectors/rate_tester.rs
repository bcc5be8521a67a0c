use std::sync::atomic::{AtomicU64, Ordering};

use crate::models::{SensorReading, SensorValue};

/// Synthetic collector for throughput testing.
///
/// Produces `count` sensors `rate_0..rate_{count-1}`; every poll bumps a shared
/// counter so receivers can spot dropped or duplicated frames.
pub struct RateTesterDriver {
    count: u32,
    tick: AtomicU64,
}

impl RateTesterDriver {
    pub fn new(count: u32) -> Self {
        Self {
            count: count.max(1),
            tick: AtomicU64::new(0),
        }
    }

    pub fn poll(&self) -> Vec<SensorReading> {
        let tick = self.tick.fetch_add(1, Ordering::Relaxed) + 1;
        (0..self.count)
            .map(|i| {
                SensorReading::new(format!("rate_{i}"), SensorValue::Number((tick + i as u64) as f64))
                    .with_name(format!("Rate Sensor {i}"))
                    .with_component("RateTester")
                    .with_unit("count")
            })
            .collect()
    }
}
