/**
 * DATA MODEL - Junctions, links, sensors and their live projections
 *
 * ROLE:
 * Shared vocabulary of the engine. Everything here is plain data that is
 * serialised to the control API (camelCase JSON) and to the catalog file.
 *
 * OWNERSHIP:
 * - A Junction owns its Links; deleting a Junction cascades to them.
 * - Sensors are keyed by (junctionId, sourceLinkId, externalId).
 * - SensorTargets are bare edges (sensorId, deviceId, screenId?).
 * - ActivePoller / ActiveStream only exist while a Junction runs.
 */

use serde::{Deserialize, Serialize};
use std::fmt;
use time::OffsetDateTime;

pub type DeviceId = u64;
pub type CollectorId = u64;
pub type JunctionId = u64;
pub type LinkId = u64;
pub type SensorId = u64;

pub const DEFAULT_POLL_RATE_MS: u64 = 5_000;
pub const DEFAULT_SEND_RATE_MS: u64 = 5_000;

// ---------------------------------------------------------------------------
// Junctions
// ---------------------------------------------------------------------------

/// Transport family of a junction. Decides how Target links are reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum JunctionType {
    #[serde(rename = "COM")]
    Com,
    #[serde(rename = "HTTP")]
    #[default]
    Http,
    #[serde(rename = "MQTT")]
    Mqtt,
    #[serde(rename = "Gateway-HTTP")]
    GatewayHttp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum JunctionStatus {
    #[default]
    Idle,
    Running,
    Error,
}

impl fmt::Display for JunctionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "Idle",
            Self::Running => "Running",
            Self::Error => "Error",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct Junction {
    pub id: JunctionId,
    pub name: String,
    pub description: Option<String>,
    #[serde(rename = "type")]
    pub junction_type: JunctionType,
    pub status: JunctionStatus,
    pub show_on_dashboard: bool,
    pub auto_start_on_launch: bool,
    /// Scheduled starts
    pub cron_expression: Option<String>,
    /// Scheduled stops
    pub cron_stop_expression: Option<String>,
    pub all_targets_all_data: bool,
    /// IP of the relay device used by Gateway-HTTP junctions.
    pub gateway_destination: Option<String>,
    pub retry_count: u32,
    pub retry_interval_ms: u64,
    pub enable_health_check: bool,
    pub health_check_interval_ms: u64,
    pub enable_notifications: bool,
    pub sort_order: i64,
}

impl Default for Junction {
    fn default() -> Self {
        Self {
            id: 0,
            name: String::new(),
            description: None,
            junction_type: JunctionType::Http,
            status: JunctionStatus::Idle,
            show_on_dashboard: true,
            auto_start_on_launch: false,
            cron_expression: None,
            cron_stop_expression: None,
            all_targets_all_data: false,
            gateway_destination: None,
            retry_count: 3,
            retry_interval_ms: 5_000,
            enable_health_check: false,
            health_check_interval_ms: 60_000,
            enable_notifications: false,
            sort_order: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SortOrderUpdate {
    pub junction_id: JunctionId,
    pub sort_order: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SortOrderRequest {
    pub updates: Vec<SortOrderUpdate>,
}

// ---------------------------------------------------------------------------
// Links
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LinkRole {
    Source,
    Target,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Device,
    Collector,
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Device => f.write_str("device"),
            Self::Collector => f.write_str("collector"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Link {
    pub id: LinkId,
    pub junction_id: JunctionId,
    pub entity_id: u64,
    pub entity_kind: EntityKind,
    pub role: LinkRole,
    pub poll_rate_override_ms: Option<u64>,
    pub send_rate_override_ms: Option<u64>,
}

/// Body of `POST .../device-links` and `POST .../collector-links`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkInput {
    #[serde(alias = "deviceId", alias = "collectorId")]
    pub entity_id: u64,
    pub role: LinkRole,
    #[serde(default)]
    pub poll_rate_override_ms: Option<u64>,
    #[serde(default)]
    pub send_rate_override_ms: Option<u64>,
}

/// Body of `PUT .../{linkId}/update`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkRateUpdate {
    #[serde(default)]
    pub poll_rate_override_ms: Option<u64>,
    #[serde(default)]
    pub send_rate_override_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JunctionLinks {
    pub device_links: Vec<Link>,
    pub collector_links: Vec<Link>,
}

// ---------------------------------------------------------------------------
// Devices & collectors (external entities the engine talks to)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum DeviceProtocol {
    #[default]
    Http,
    Mqtt,
    WebSocket,
    Com,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Screen {
    pub screen_key: String,
    #[serde(default)]
    pub display_name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct Device {
    pub id: DeviceId,
    pub name: String,
    /// IP / host[:port] for network devices, port path for COM devices.
    pub address: String,
    pub protocol: DeviceProtocol,
    pub poll_rate_ms: u64,
    pub send_rate_ms: u64,
    pub mqtt_topic: Option<String>,
    pub qos: u8,
    /// MQTT collector whose broker carries this device's traffic.
    pub broker_collector_id: Option<CollectorId>,
    pub screens: Vec<Screen>,
    pub is_gateway: bool,
    pub baud_rate: Option<u32>,
}

impl Default for Device {
    fn default() -> Self {
        Self {
            id: 0,
            name: String::new(),
            address: String::new(),
            protocol: DeviceProtocol::Http,
            poll_rate_ms: DEFAULT_POLL_RATE_MS,
            send_rate_ms: DEFAULT_SEND_RATE_MS,
            mqtt_topic: None,
            qos: 1,
            broker_collector_id: None,
            screens: Vec::new(),
            is_gateway: false,
            baud_rate: None,
        }
    }
}

impl Device {
    /// Base MQTT topic of the device.
    pub fn topic(&self) -> String {
        match &self.mqtt_topic {
            Some(t) if !t.trim().is_empty() => t.trim_end_matches('/').to_string(),
            _ => format!("junctionrelay/{}", self.id),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum CollectorType {
    HomeAssistant,
    LibreHardwareMonitor,
    UptimeKuma,
    #[default]
    Host,
    RateTester,
    #[serde(rename = "MQTT")]
    Mqtt,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MqttSubscription {
    pub topic: String,
    pub qos: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct Collector {
    pub id: CollectorId,
    pub name: String,
    pub collector_type: CollectorType,
    pub url: Option<String>,
    pub access_token: Option<String>,
    pub poll_rate_ms: u64,
    pub send_rate_ms: u64,
    pub broker_host: Option<String>,
    pub broker_port: Option<u16>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub subscriptions: Vec<MqttSubscription>,
    /// Number of synthetic sensors produced by a RateTester.
    pub sensor_count: Option<u32>,
}

impl Default for Collector {
    fn default() -> Self {
        Self {
            id: 0,
            name: String::new(),
            collector_type: CollectorType::Host,
            url: None,
            access_token: None,
            poll_rate_ms: DEFAULT_POLL_RATE_MS,
            send_rate_ms: DEFAULT_SEND_RATE_MS,
            broker_host: None,
            broker_port: None,
            username: None,
            password: None,
            subscriptions: Vec::new(),
            sensor_count: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Sensors & fan-out edges
// ---------------------------------------------------------------------------

/// Numeric or symbolic sensor value.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum SensorValue {
    Number(f64),
    Text(String),
}

impl SensorValue {
    /// Numbers are kept numeric, anything else stays symbolic.
    pub fn parse(raw: &str) -> Self {
        let trimmed = raw.trim();
        match trimmed.parse::<f64>() {
            Ok(n) if n.is_finite() => Self::Number(n),
            _ => Self::Text(trimmed.to_string()),
        }
    }

    pub fn as_json(&self) -> serde_json::Value {
        match self {
            Self::Number(n) => serde_json::json!(n),
            Self::Text(s) => serde_json::Value::String(s.clone()),
        }
    }
}

impl Default for SensorValue {
    fn default() -> Self {
        Self::Text(String::new())
    }
}

impl fmt::Display for SensorValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{}", n),
            Self::Text(s) => f.write_str(s),
        }
    }
}

/// Normalised reading produced by a driver or a device poll.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SensorReading {
    pub external_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub component_name: String,
    pub value: SensorValue,
    #[serde(default)]
    pub unit: String,
}

impl SensorReading {
    pub fn new(external_id: impl Into<String>, value: SensorValue) -> Self {
        let external_id = external_id.into();
        Self {
            name: external_id.clone(),
            external_id,
            component_name: String::new(),
            value,
            unit: String::new(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_component(mut self, component: impl Into<String>) -> Self {
        self.component_name = component.into();
        self
    }

    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = unit.into();
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Sensor {
    pub id: SensorId,
    pub junction_id: JunctionId,
    /// `None` for manually injected sensors.
    pub source_link_id: Option<LinkId>,
    pub external_id: String,
    pub name: String,
    pub component_name: String,
    pub value: SensorValue,
    pub unit: String,
    pub sort_order: i64,
    pub sensor_tag: String,
    pub is_selected: bool,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub last_updated: Option<OffsetDateTime>,
}

/// Body of `PUT /api/sensors/junction-sensors/update`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SensorUpdate {
    pub id: SensorId,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub sensor_tag: Option<String>,
    #[serde(default)]
    pub sort_order: Option<i64>,
    #[serde(default)]
    pub unit: Option<String>,
}

/// Fan-out edge from a sensor to a device, optionally narrowed to one screen.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SensorTarget {
    pub sensor_id: SensorId,
    pub device_id: DeviceId,
    pub screen_id: Option<String>,
}

// ---------------------------------------------------------------------------
// Live projections
// ---------------------------------------------------------------------------

/// Prefixed frame as it went over the wire.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PayloadPreview {
    pub prefix: String,
    pub body: String,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryOutcome {
    pub device_id: Option<DeviceId>,
    pub screen_id: Option<String>,
    pub success: bool,
    pub latency_ms: u64,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ActivePoller {
    pub junction_id: JunctionId,
    pub link_id: LinkId,
    pub entity_id: u64,
    pub entity_kind: EntityKind,
    pub name: String,
    pub poll_rate_ms: u64,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_poll_at: Option<OffsetDateTime>,
    /// Measured spacing between the two most recent polls.
    pub computed_rate_ms: Option<u64>,
    pub latency_ms: Option<u64>,
    pub sensor_count: usize,
    pub consecutive_failures: u32,
    pub last_payload: Option<serde_json::Value>,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ActiveStream {
    pub junction_id: JunctionId,
    pub link_id: LinkId,
    pub entity_id: u64,
    pub entity_kind: EntityKind,
    pub name: String,
    pub send_rate_ms: u64,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_send_at: Option<OffsetDateTime>,
    pub computed_rate_ms: Option<u64>,
    pub latency_ms: Option<u64>,
    pub consecutive_failures: u32,
    pub last_payload: Option<PayloadPreview>,
    /// Broker-formatted variant, MQTT targets only.
    pub last_mqtt_payload: Option<String>,
    pub deliveries: Vec<DeliveryOutcome>,
    pub last_error: Option<String>,
}

/// Self-contained junction document of `GET /api/junctions/export/{id}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JunctionExport {
    pub junction: Junction,
    #[serde(default)]
    pub links: Vec<Link>,
    #[serde(default)]
    pub sensors: Vec<Sensor>,
    #[serde(default)]
    pub sensor_targets: Vec<SensorTarget>,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq)]
pub struct RunningStatus {
    pub id: JunctionId,
    pub status: JunctionStatus,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_junction_type_wire_names() {
        let json = serde_json::to_string(&JunctionType::GatewayHttp).unwrap();
        assert_eq!(json, "\"Gateway-HTTP\"");
        let parsed: JunctionType = serde_json::from_str("\"COM\"").unwrap();
        assert_eq!(parsed, JunctionType::Com);
    }

    #[test]
    fn test_junction_defaults_from_partial_json() {
        let j: Junction = serde_json::from_str(r#"{"name":"Desk","type":"MQTT"}"#).unwrap();
        assert_eq!(j.name, "Desk");
        assert_eq!(j.junction_type, JunctionType::Mqtt);
        assert_eq!(j.status, JunctionStatus::Idle);
        assert_eq!(j.retry_count, 3);
    }

    #[test]
    fn test_sensor_value_parse() {
        assert_eq!(SensorValue::parse(" 42.5 "), SensorValue::Number(42.5));
        assert_eq!(SensorValue::parse("on"), SensorValue::Text("on".into()));
        assert_eq!(SensorValue::parse("NaN"), SensorValue::Text("NaN".into()));
        assert_eq!(SensorValue::Number(88.0).to_string(), "88");
    }

    #[test]
    fn test_link_input_accepts_entity_aliases() {
        let input: LinkInput = serde_json::from_str(r#"{"deviceId":7,"role":"Target"}"#).unwrap();
        assert_eq!(input.entity_id, 7);
        assert_eq!(input.role, LinkRole::Target);
        assert!(input.poll_rate_override_ms.is_none());
    }

    #[test]
    fn test_device_topic_fallback() {
        let mut device = Device { id: 9, ..Device::default() };
        assert_eq!(device.topic(), "junctionrelay/9");
        device.mqtt_topic = Some("home/panel/".into());
        assert_eq!(device.topic(), "home/panel");
    }
}
