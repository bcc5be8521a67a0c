use parking_lot::Mutex;
use sysinfo::{Components, System};

use super::DriverError;
use crate::models::{SensorReading, SensorValue};

const MB: f64 = 1024.0 * 1024.0;

/// Metrics of the machine the engine runs on.
///
/// The `System` handle lives across polls so CPU usage is measured between
/// two consecutive refreshes; the first poll reports 0 %.
pub struct HostDriver {
    sys: Mutex<System>,
    components: Mutex<Components>,
}

impl HostDriver {
    pub fn new() -> Self {
        Self {
            sys: Mutex::new(System::new()),
            components: Mutex::new(Components::new_with_refreshed_list()),
        }
    }

    pub async fn poll(&self) -> Result<Vec<SensorReading>, DriverError> {
        let mut out = Vec::new();
        {
            let mut sys = self.sys.lock();
            sys.refresh_cpu();
            sys.refresh_memory();

            let total = sys.total_memory() as f64;
            let used = sys.used_memory() as f64;
            out.push(reading("cpu_usage", "CPU Usage", "CPU", round1(sys.global_cpu_info().cpu_usage() as f64), "%"));
            out.push(reading("memory_used", "Memory Used", "Memory", round1(used / MB), "MB"));
            out.push(reading("memory_total", "Memory Total", "Memory", round1(total / MB), "MB"));
            let pct = if total > 0.0 { used / total * 100.0 } else { 0.0 };
            out.push(reading("memory_usage", "Memory Usage", "Memory", round1(pct), "%"));
        }

        out.push(reading("uptime", "Uptime", "System", System::uptime() as f64, "s"));
        let load = System::load_average();
        out.push(reading("load_1", "Load (1m)", "System", load.one, ""));
        out.push(reading("load_5", "Load (5m)", "System", load.five, ""));

        let mut components = self.components.lock();
        components.refresh();
        for (i, c) in components.iter().enumerate() {
            let temp = c.temperature() as f64;
            if !temp.is_finite() {
                continue;
            }
            out.push(reading(
                &format!("temp_{i}"),
                c.label(),
                "Temperatures",
                round1(temp),
                "°C",
            ));
        }
        Ok(out)
    }
}

impl Default for HostDriver {
    fn default() -> Self {
        Self::new()
    }
}

fn reading(id: &str, name: &str, component: &str, value: f64, unit: &str) -> SensorReading {
    SensorReading::new(id, SensorValue::Number(value))
        .with_name(name)
        .with_component(component)
        .with_unit(unit)
}

fn round1(v: f64) -> f64 {
    (v * 10.0).round() / 10.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_host_reports_core_metrics() {
        let driver = HostDriver::new();
        let readings = driver.poll().await.unwrap();
        let ids: Vec<&str> = readings.iter().map(|r| r.external_id.as_str()).collect();
        for expected in ["cpu_usage", "memory_used", "memory_total", "memory_usage", "uptime"] {
            assert!(ids.contains(&expected), "missing {expected}");
        }
        let mem = readings.iter().find(|r| r.external_id == "memory_total").unwrap();
        assert!(matches!(mem.value, SensorValue::Number(n) if n > 0.0));
    }
}
