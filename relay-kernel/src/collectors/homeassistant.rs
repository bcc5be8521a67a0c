use reqwest::Client;
use serde::Deserialize;

use super::{fetch, DriverError};
use crate::models::{SensorReading, SensorValue};

#[derive(Debug, Deserialize)]
struct HaState {
    entity_id: String,
    state: String,
    #[serde(default)]
    attributes: HaAttributes,
}

#[derive(Debug, Default, Deserialize)]
struct HaAttributes {
    unit_of_measurement: Option<String>,
    friendly_name: Option<String>,
}

/// Pulls `GET <url>/api/states` with a long-lived bearer token.
pub struct HomeAssistantDriver {
    http: Client,
    url: String,
    token: Option<String>,
}

impl HomeAssistantDriver {
    pub fn new(http: Client, url: String, token: Option<String>) -> Self {
        Self { http, url, token }
    }

    pub async fn poll(&self) -> Result<Vec<SensorReading>, DriverError> {
        let mut req = self.http.get(format!("{}/api/states", self.url));
        if let Some(token) = self.token.as_deref().filter(|t| !t.is_empty()) {
            req = req.bearer_auth(token);
        }
        let states: Vec<HaState> = fetch(req)
            .await?
            .json()
            .await
            .map_err(|e| DriverError::Malformed(e.to_string()))?;
        Ok(states.into_iter().map(to_reading).collect())
    }
}

fn to_reading(state: HaState) -> SensorReading {
    // Entity ids look like `sensor.kitchen_temperature`; the domain is the component.
    let domain = state.entity_id.split('.').next().unwrap_or_default().to_string();
    let name = state
        .attributes
        .friendly_name
        .unwrap_or_else(|| state.entity_id.clone());
    SensorReading::new(state.entity_id, SensorValue::parse(&state.state))
        .with_name(name)
        .with_component(domain)
        .with_unit(state.attributes.unit_of_measurement.unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_devkit::MockDevice;

    #[tokio::test]
    async fn test_states_become_readings_with_bearer_token() {
        let upstream = MockDevice::start().await.unwrap();
        upstream.serve_json(
            "/api/states",
            &serde_json::json!([
                {"entity_id": "sensor.kitchen_temp", "state": "21.5",
                 "attributes": {"unit_of_measurement": "°C", "friendly_name": "Kitchen"}},
                {"entity_id": "light.hall", "state": "on", "attributes": {}}
            ]),
        );
        let driver = HomeAssistantDriver::new(Client::new(), upstream.base_url(), Some("tok".into()));
        let readings = driver.poll().await.unwrap();

        assert_eq!(upstream.last_authorization().as_deref(), Some("Bearer tok"));
        assert_eq!(readings.len(), 2);
        assert_eq!(readings[0].value, SensorValue::Number(21.5));
        assert_eq!(readings[0].component_name, "sensor");
        assert_eq!(readings[0].name, "Kitchen");
        assert_eq!(readings[1].value, SensorValue::Text("on".into()));
    }

    #[tokio::test]
    async fn test_missing_endpoint_is_status_error() {
        let upstream = MockDevice::start().await.unwrap();
        let driver = HomeAssistantDriver::new(Client::new(), upstream.base_url(), None);
        assert!(matches!(driver.poll().await, Err(DriverError::Status(404))));
    }
}
