use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use serde_json::Value;

use super::DriverError;
use crate::config::MqttConf;
use crate::models::{Collector, MqttSubscription, SensorReading, SensorValue};
use crate::transport::mqtt::{BrokerKey, BrokerLease, InboxMessage, MqttPool};

/// How long a one-off fetch waits for retained messages on a fresh connection.
pub const RETAINED_WAIT: Duration = Duration::from_secs(2);
/// Quiet time after the first message so the rest of a retained burst lands.
const BURST_GRACE: Duration = Duration::from_millis(200);

/// Reads the latest retained message of each subscribed topic.
///
/// JSON object payloads are flattened one level: `{"temp":21}` on
/// `home/kitchen` becomes the reading `home/kitchen/temp`.
pub struct MqttDriver {
    lease: BrokerLease,
    subscriptions: Vec<MqttSubscription>,
}

impl MqttDriver {
    pub fn new(collector: &Collector, pool: &MqttPool, cfg: &MqttConf) -> Self {
        let key = BrokerKey::for_collector(collector, cfg);
        Self {
            lease: pool.acquire(&key),
            subscriptions: collector.subscriptions.clone(),
        }
    }

    pub async fn start(&self) -> Result<(), DriverError> {
        for sub in &self.subscriptions {
            self.lease
                .subscribe(&sub.topic, sub.qos)
                .await
                .map_err(|e| DriverError::Broker(e.to_string()))?;
        }
        tracing::debug!(
            "[collector] subscribed {} topic(s) on {}",
            self.subscriptions.len(),
            self.lease.key()
        );
        Ok(())
    }

    fn has_messages(&self) -> bool {
        self.subscriptions
            .iter()
            .any(|sub| !self.lease.inbox_matching(&sub.topic).is_empty())
    }

    /// Waits up to `window` for the first message on any subscribed topic.
    pub async fn wait_for_messages(&self, window: Duration) -> bool {
        if self.subscriptions.is_empty() {
            return false;
        }
        let deadline = Instant::now() + window;
        while !self.has_messages() {
            if Instant::now() >= deadline {
                tracing::debug!("[collector] no retained messages on {} within {window:?}", self.lease.key());
                return false;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        tokio::time::sleep(BURST_GRACE).await;
        true
    }

    pub fn poll(&self) -> Vec<SensorReading> {
        // One message may match several filters.
        let mut latest: BTreeMap<String, InboxMessage> = BTreeMap::new();
        for sub in &self.subscriptions {
            for msg in self.lease.inbox_matching(&sub.topic) {
                latest.insert(msg.topic.clone(), msg);
            }
        }
        latest.values().flat_map(readings_of).collect()
    }
}

fn readings_of(msg: &InboxMessage) -> Vec<SensorReading> {
    let component = msg.topic.split('/').next().unwrap_or_default();
    match serde_json::from_str::<Value>(&msg.payload) {
        Ok(Value::Object(fields)) => fields
            .iter()
            .filter_map(|(key, value)| {
                let value = match value {
                    Value::Number(n) => SensorValue::Number(n.as_f64()?),
                    Value::String(s) => SensorValue::parse(s),
                    Value::Bool(b) => SensorValue::Text(b.to_string()),
                    _ => return None,
                };
                Some(
                    SensorReading::new(format!("{}/{key}", msg.topic), value)
                        .with_name(key.clone())
                        .with_component(component),
                )
            })
            .collect(),
        _ => {
            let name = msg.topic.rsplit('/').next().unwrap_or(&msg.topic);
            vec![SensorReading::new(msg.topic.clone(), SensorValue::parse(&msg.payload))
                .with_name(name)
                .with_component(component)]
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::KernelConfig;
    use crate::models::CollectorType;
    use crate::collectors::Driver;
    use crate::transport::mqtt::tests::{mock_pool, relaying_pool};
    use std::collections::HashSet;
    use relay_devkit::MockMqttClient;

    fn collector() -> Collector {
        Collector {
            name: "broker".into(),
            collector_type: CollectorType::Mqtt,
            broker_host: Some("mqtt.lan".into()),
            subscriptions: vec![
                MqttSubscription { topic: "home/+/climate".into(), qos: 1 },
                MqttSubscription { topic: "home/#".into(), qos: 0 },
            ],
            ..Collector::default()
        }
    }

    #[tokio::test]
    async fn test_start_subscribes_and_poll_flattens_payloads() {
        let client = MockMqttClient::new();
        let pool = mock_pool(client.clone());
        let driver = MqttDriver::new(&collector(), &pool, &KernelConfig::default().mqtt);
        driver.start().await.unwrap();
        assert_eq!(client.get_subscriptions().len(), 2);

        driver.lease.record_incoming("home/kitchen/climate", br#"{"temp":21.5,"humidity":"40"}"#);
        driver.lease.record_incoming("home/door", b"open");
        let readings = driver.poll();

        let ids: Vec<&str> = readings.iter().map(|r| r.external_id.as_str()).collect();
        assert_eq!(
            ids,
            vec!["home/door", "home/kitchen/climate/humidity", "home/kitchen/climate/temp"]
        );
        assert_eq!(readings[0].value, SensorValue::Text("open".into()));
        assert_eq!(readings[2].value, SensorValue::Number(21.5));
    }

    #[tokio::test]
    async fn test_dropping_driver_releases_broker() {
        let pool = mock_pool(MockMqttClient::new());
        let driver = MqttDriver::new(&collector(), &pool, &KernelConfig::default().mqtt);
        assert_eq!(pool.open_connections(), 1);
        drop(driver);
        assert_eq!(pool.open_connections(), 0);
    }

    #[tokio::test]
    async fn test_delta_waits_for_retained_messages() {
        let client = MockMqttClient::new();
        let pool = relaying_pool(client.clone());
        let driver = Driver::Mqtt(MqttDriver::new(&collector(), &pool, &KernelConfig::default().mqtt));
        driver.start().await.unwrap();

        // The broker replays retained messages shortly after the subscribe.
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(150)).await;
            client.simulate_incoming("home/kitchen/climate", r#"{"temp":21.5}"#).await.unwrap();
            client.simulate_incoming("home/door", "open").await.unwrap();
        });

        let delta = driver.delta(&HashSet::new()).await.unwrap();
        let ids: Vec<&str> = delta.iter().map(|r| r.external_id.as_str()).collect();
        assert_eq!(ids, vec!["home/door", "home/kitchen/climate/temp"]);
    }

    #[tokio::test]
    async fn test_wait_gives_up_on_a_silent_broker() {
        let pool = mock_pool(MockMqttClient::new());
        let driver = MqttDriver::new(&collector(), &pool, &KernelConfig::default().mqtt);
        driver.start().await.unwrap();
        assert!(!driver.wait_for_messages(std::time::Duration::from_millis(120)).await);
        assert!(driver.poll().is_empty());
    }
}
