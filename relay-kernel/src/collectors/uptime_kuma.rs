//! Uptime Kuma exposes monitor state as Prometheus text on `/metrics`,
//! guarded by basic auth with an API key as the password.

use reqwest::Client;
use std::collections::HashMap;

use super::{fetch, DriverError};
use crate::models::{SensorReading, SensorValue};

pub struct UptimeKumaDriver {
    http: Client,
    url: String,
    api_key: Option<String>,
}

impl UptimeKumaDriver {
    pub fn new(http: Client, url: String, api_key: Option<String>) -> Self {
        Self { http, url, api_key }
    }

    pub async fn poll(&self) -> Result<Vec<SensorReading>, DriverError> {
        let mut req = self.http.get(format!("{}/metrics", self.url));
        if let Some(key) = self.api_key.as_deref().filter(|k| !k.is_empty()) {
            req = req.basic_auth("", Some(key));
        }
        let text = fetch(req).await?.text().await?;
        Ok(parse_metrics(&text))
    }
}

/// Maps `monitor_status` and `monitor_response_time` samples to readings.
pub fn parse_metrics(text: &str) -> Vec<SensorReading> {
    let mut out = Vec::new();
    for line in text.lines().map(str::trim) {
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((metric, labels, value)) = split_sample(line) else {
            continue;
        };
        let (suffix, label, unit) = match metric {
            "monitor_status" => ("status", "Status", ""),
            "monitor_response_time" => ("response_time", "Response Time", "ms"),
            _ => continue,
        };
        let Some(monitor) = labels.get("monitor_name") else {
            continue;
        };
        let Ok(value) = value.parse::<f64>() else {
            continue;
        };
        out.push(
            SensorReading::new(format!("{monitor}_{suffix}"), SensorValue::Number(value))
                .with_name(format!("{monitor} {label}"))
                .with_component(monitor.clone())
                .with_unit(unit),
        );
    }
    out
}

fn split_sample(line: &str) -> Option<(&str, HashMap<String, String>, &str)> {
    match line.find('{') {
        Some(open) => {
            let close = line.rfind('}')?;
            let labels = parse_labels(&line[open + 1..close]);
            Some((&line[..open], labels, line[close + 1..].trim()))
        }
        None => {
            let (metric, value) = line.split_once(char::is_whitespace)?;
            Some((metric, HashMap::new(), value.trim()))
        }
    }
}

// key="value" pairs; values may contain commas and escaped quotes.
fn parse_labels(raw: &str) -> HashMap<String, String> {
    let mut labels = HashMap::new();
    let mut chars = raw.chars().peekable();
    loop {
        let key: String = chars
            .by_ref()
            .skip_while(|c| *c == ',' || c.is_whitespace())
            .take_while(|c| *c != '=')
            .collect();
        if key.is_empty() {
            break;
        }
        if chars.next() != Some('"') {
            break;
        }
        let mut value = String::new();
        while let Some(c) = chars.next() {
            match c {
                '\\' => {
                    if let Some(escaped) = chars.next() {
                        value.push(escaped);
                    }
                }
                '"' => break,
                other => value.push(other),
            }
        }
        labels.insert(key.trim().to_string(), value);
    }
    labels
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_devkit::MockDevice;

    const METRICS: &str = r#"# HELP monitor_status Monitor Status (1 = UP, 0= DOWN)
# TYPE monitor_status gauge
monitor_status{monitor_name="Web, main",monitor_type="http",monitor_url="https://example.com"} 1
monitor_response_time{monitor_name="Web, main",monitor_type="http"} 123
monitor_cert_days_remaining{monitor_name="Web, main"} 40
process_cpu_seconds_total 0.5
"#;

    #[test]
    fn test_parse_metrics_keeps_monitor_samples() {
        let readings = parse_metrics(METRICS);
        assert_eq!(readings.len(), 2);
        assert_eq!(readings[0].external_id, "Web, main_status");
        assert_eq!(readings[0].component_name, "Web, main");
        assert_eq!(readings[1].value, SensorValue::Number(123.0));
        assert_eq!(readings[1].unit, "ms");
    }

    #[tokio::test]
    async fn test_poll_sends_api_key_as_basic_auth() {
        let upstream = MockDevice::start().await.unwrap();
        upstream.serve_text("/metrics", METRICS);
        let driver = UptimeKumaDriver::new(Client::new(), upstream.base_url(), Some("key".into()));
        let readings = driver.poll().await.unwrap();
        assert_eq!(readings.len(), 2);
        let auth = upstream.last_authorization().unwrap();
        assert!(auth.starts_with("Basic "));
    }
}
