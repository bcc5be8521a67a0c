/**
 * COLLECTOR DRIVERS - Uniform poll contract over heterogeneous sources
 *
 * ROLE:
 * A closed set of drivers selected by the collector type (or, for Source
 * devices, by the device protocol). Every driver answers `poll()` with
 * normalised SensorReadings; `delta()` filters out externalIds the registry
 * already knows for the link.
 *
 * ERRORS:
 * Connectivity problems come back as DriverError and end up as the Source
 * link's last error. They never stop the poll loop.
 */

pub mod homeassistant;
pub mod host;
pub mod lhm;
pub mod mqtt;
pub mod rate_tester;
pub mod uptime_kuma;

use std::collections::HashSet;

use crate::config::MqttConf;
use crate::models::{Collector, CollectorType, Device, DeviceProtocol, SensorReading};
use crate::transport::Transports;

pub use self::homeassistant::HomeAssistantDriver;
pub use self::host::HostDriver;
pub use self::lhm::LhmDriver;
pub use self::mqtt::MqttDriver;
pub use self::rate_tester::RateTesterDriver;
pub use self::uptime_kuma::UptimeKumaDriver;

#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    #[error("request failed: {0}")]
    Http(reqwest::Error),
    #[error("request timed out")]
    Timeout,
    #[error("authentication rejected (HTTP {0})")]
    Auth(u16),
    #[error("upstream answered HTTP {0}")]
    Status(u16),
    #[error("malformed response: {0}")]
    Malformed(String),
    #[error("not configured: {0}")]
    Config(String),
    #[error("broker: {0}")]
    Broker(String),
}

impl From<reqwest::Error> for DriverError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::Timeout
        } else {
            Self::Http(e)
        }
    }
}

/// Sends a GET and maps 401/403 to `Auth`, other non-2xx to `Status`.
pub(crate) async fn fetch(req: reqwest::RequestBuilder) -> Result<reqwest::Response, DriverError> {
    let resp = req.send().await?;
    let status = resp.status();
    if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
        return Err(DriverError::Auth(status.as_u16()));
    }
    if !status.is_success() {
        return Err(DriverError::Status(status.as_u16()));
    }
    Ok(resp)
}

pub(crate) fn base_url(raw: &str) -> String {
    let trimmed = raw.trim().trim_end_matches('/');
    if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        trimmed.to_string()
    } else {
        format!("http://{trimmed}")
    }
}

pub enum Driver {
    HomeAssistant(HomeAssistantDriver),
    Lhm(LhmDriver),
    UptimeKuma(UptimeKumaDriver),
    Host(HostDriver),
    RateTester(RateTesterDriver),
    Mqtt(MqttDriver),
}

impl Driver {
    pub fn for_collector(collector: &Collector, transports: &Transports, mqtt: &MqttConf) -> Result<Self, DriverError> {
        let http = transports.http.client().clone();
        let url = || {
            collector
                .url
                .as_deref()
                .filter(|u| !u.trim().is_empty())
                .map(base_url)
                .ok_or_else(|| DriverError::Config(format!("collector '{}' has no url", collector.name)))
        };
        Ok(match collector.collector_type {
            CollectorType::HomeAssistant => {
                Self::HomeAssistant(HomeAssistantDriver::new(http, url()?, collector.access_token.clone()))
            }
            CollectorType::LibreHardwareMonitor => Self::Lhm(LhmDriver::new(http, url()?)),
            CollectorType::UptimeKuma => {
                Self::UptimeKuma(UptimeKumaDriver::new(http, url()?, collector.access_token.clone()))
            }
            CollectorType::Host => Self::Host(HostDriver::new()),
            CollectorType::RateTester => Self::RateTester(RateTesterDriver::new(collector.sensor_count.unwrap_or(10))),
            CollectorType::Mqtt => Self::Mqtt(MqttDriver::new(collector, &transports.mqtt, mqtt)),
        })
    }

    /// Source devices expose the flat `/data.json` feed.
    pub fn for_device(device: &Device, transports: &Transports) -> Result<Self, DriverError> {
        match device.protocol {
            DeviceProtocol::Http => Ok(Self::Lhm(LhmDriver::new(
                transports.http.client().clone(),
                base_url(&device.address),
            ))),
            other => Err(DriverError::Config(format!(
                "{other:?} device '{}' cannot be polled",
                device.name
            ))),
        }
    }

    /// One-time setup before the first poll (MQTT subscribes its topics).
    pub async fn start(&self) -> Result<(), DriverError> {
        match self {
            Self::Mqtt(d) => d.start().await,
            _ => Ok(()),
        }
    }

    pub async fn poll(&self) -> Result<Vec<SensorReading>, DriverError> {
        match self {
            Self::HomeAssistant(d) => d.poll().await,
            Self::Lhm(d) => d.poll().await,
            Self::UptimeKuma(d) => d.poll().await,
            Self::Host(d) => d.poll().await,
            Self::RateTester(d) => Ok(d.poll()),
            Self::Mqtt(d) => Ok(d.poll()),
        }
    }

    /// Readings whose externalId is not in `known`.
    pub async fn delta(&self, known: &HashSet<String>) -> Result<Vec<SensorReading>, DriverError> {
        if let Self::Mqtt(d) = self {
            // A fresh broker connection has seen nothing yet.
            d.wait_for_messages(mqtt::RETAINED_WAIT).await;
        }
        let readings = self.poll().await?;
        Ok(readings
            .into_iter()
            .filter(|r| !known.contains(&r.external_id))
            .collect())
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::HomeAssistant(_) => "homeassistant",
            Self::Lhm(_) => "lhm",
            Self::UptimeKuma(_) => "uptime-kuma",
            Self::Host(_) => "host",
            Self::RateTester(_) => "rate-tester",
            Self::Mqtt(_) => "mqtt",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::KernelConfig;

    #[tokio::test]
    async fn test_delta_never_returns_known_ids() {
        let driver = Driver::RateTester(RateTesterDriver::new(4));
        let known: HashSet<String> = ["rate_0".to_string(), "rate_2".to_string()].into_iter().collect();
        let delta = driver.delta(&known).await.unwrap();
        let ids: Vec<&str> = delta.iter().map(|r| r.external_id.as_str()).collect();
        assert_eq!(ids, vec!["rate_1", "rate_3"]);
    }

    #[test]
    fn test_url_is_required_for_rest_collectors() {
        let transports = Transports::new(&KernelConfig::default()).unwrap();
        let collector = Collector {
            name: "ha".into(),
            collector_type: CollectorType::HomeAssistant,
            ..Collector::default()
        };
        let err = Driver::for_collector(&collector, &transports, &KernelConfig::default().mqtt).err();
        assert!(matches!(err, Some(DriverError::Config(_))));
    }

    #[test]
    fn test_base_url_adds_scheme() {
        assert_eq!(base_url("10.0.0.3:8085/"), "http://10.0.0.3:8085");
        assert_eq!(base_url("https://ha.lan"), "https://ha.lan");
    }
}
