use reqwest::Client;
use serde_json::Value;

use super::{fetch, DriverError};
use crate::models::{SensorReading, SensorValue};

/// Pulls `GET <url>/data.json`, either the LibreHardwareMonitor node tree or
/// a flat `[{Text, Type, Value, SensorId}]` list.
pub struct LhmDriver {
    http: Client,
    url: String,
}

impl LhmDriver {
    pub fn new(http: Client, url: String) -> Self {
        Self { http, url }
    }

    pub async fn poll(&self) -> Result<Vec<SensorReading>, DriverError> {
        let feed: Value = fetch(self.http.get(format!("{}/data.json", self.url)))
            .await?
            .json()
            .await
            .map_err(|e| DriverError::Malformed(e.to_string()))?;
        parse_feed(&feed)
    }
}

pub fn parse_feed(feed: &Value) -> Result<Vec<SensorReading>, DriverError> {
    match feed {
        Value::Array(items) => Ok(items
            .iter()
            .filter_map(|item| leaf_reading(item, item.get("Type").and_then(Value::as_str).unwrap_or("")))
            .collect()),
        Value::Object(_) => {
            let mut out = Vec::new();
            walk(feed, 0, "", &mut out);
            Ok(out)
        }
        other => Err(DriverError::Malformed(format!("unexpected data.json root: {other}"))),
    }
}

// Depth 0 is the root, 1 the machine, 2 the hardware item (CPU, GPU, ...).
fn walk(node: &Value, depth: usize, component: &str, out: &mut Vec<SensorReading>) {
    let text = node.get("Text").and_then(Value::as_str).unwrap_or("");
    let component = if depth == 2 { text } else { component };
    if let Some(reading) = leaf_reading(node, component) {
        out.push(reading);
    }
    if let Some(children) = node.get("Children").and_then(Value::as_array) {
        for child in children {
            walk(child, depth + 1, component, out);
        }
    }
}

fn leaf_reading(node: &Value, component: &str) -> Option<SensorReading> {
    let id = node.get("SensorId").and_then(Value::as_str)?;
    let raw = match node.get("Value")? {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        _ => return None,
    };
    let (value, unit) = split_value(&raw);
    let name = node.get("Text").and_then(Value::as_str).unwrap_or(id);
    Some(
        SensorReading::new(id, value)
            .with_name(name)
            .with_component(component)
            .with_unit(unit),
    )
}

/// `"45,5 °C"` → (45.5, "°C"); anything non numeric stays symbolic.
pub fn split_value(raw: &str) -> (SensorValue, String) {
    let raw = raw.trim();
    let (number, unit) = match raw.split_once(char::is_whitespace) {
        Some((n, u)) => (n, u.trim()),
        None => (raw, ""),
    };
    match number.replace(',', ".").parse::<f64>() {
        Ok(n) if n.is_finite() => (SensorValue::Number(n), unit.to_string()),
        _ => (SensorValue::parse(raw), String::new()),
    }
}
