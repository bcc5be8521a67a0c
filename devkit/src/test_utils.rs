/*!
Test harness for the junction engine

Bundles a mock broker client with any number of mock devices and offers
expectations on published topics plus assertions on decoded frames.
*/

use crate::device_stub::MockDevice;
use crate::frame::decode_frame;
use crate::mqtt_stub::MockMqttClient;
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use anyhow::Result;

pub struct TestHarness {
    pub mqtt_client: MockMqttClient,
    devices: Vec<MockDevice>,
    expectations: Vec<Expectation>,
}

#[derive(Debug)]
struct Expectation {
    topic: String,
    expected_count: usize,
    timeout_ms: u64,
}

impl TestHarness {
    pub fn new() -> Self {
        env_logger::try_init().ok();

        Self {
            mqtt_client: MockMqttClient::new(),
            devices: Vec::new(),
            expectations: Vec::new(),
        }
    }

    /// Starts a mock device and returns its index.
    pub async fn spawn_device(&mut self) -> Result<usize> {
        let device = MockDevice::start().await?;
        self.devices.push(device);
        Ok(self.devices.len() - 1)
    }

    pub fn device(&self, index: usize) -> &MockDevice {
        &self.devices[index]
    }

    /// Expect exactly `count` publishes on `topic` (checked with a 5s timeout).
    pub fn expect_messages(&mut self, topic: &str, count: usize) -> &mut Self {
        self.expectations.push(Expectation {
            topic: topic.to_string(),
            expected_count: count,
            timeout_ms: 5000,
        });
        self
    }

    /// Simulates a broker message arriving for the engine.
    pub async fn send_reading(&self, topic: &str, payload: &str) -> Result<()> {
        self.mqtt_client.simulate_incoming(topic, payload.as_bytes().to_vec()).await?;
        log::info!("📨 Sent reading on {}", topic);
        Ok(())
    }

    /// Waits for a frame on `topic` and returns it decoded.
    pub async fn wait_for_frame(&self, topic: &str, timeout_ms: u64) -> Result<Option<Value>> {
        let start = std::time::Instant::now();

        while start.elapsed() < Duration::from_millis(timeout_ms) {
            if let Some(frame) = self.mqtt_client.get_last_frame(topic)? {
                return Ok(Some(frame));
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        log::warn!("⏰ Timeout waiting for frame on {}", topic);
        Ok(None)
    }

    pub async fn verify_expectations(&self) -> Result<()> {
        log::info!("🔍 Verifying {} expectations...", self.expectations.len());

        for expectation in &self.expectations {
            let start = std::time::Instant::now();
            let mut actual_count = self.mqtt_client.find_messages_by_topic(&expectation.topic).len();
            while actual_count < expectation.expected_count
                && start.elapsed() < Duration::from_millis(expectation.timeout_ms)
            {
                tokio::time::sleep(Duration::from_millis(50)).await;
                actual_count = self.mqtt_client.find_messages_by_topic(&expectation.topic).len();
            }

            if actual_count != expectation.expected_count {
                anyhow::bail!(
                    "Expectation failed for topic '{}': expected {} messages, got {}",
                    expectation.topic, expectation.expected_count, actual_count
                );
            }
        }

        log::info!("🎉 All expectations verified successfully");
        Ok(())
    }

    /// Asserts that some frame on `topic` carries `field_path` = `expected`.
    pub fn assert_frame_field(&self, topic: &str, field_path: &str, expected: &Value) -> Result<()> {
        for msg in self.mqtt_client.find_messages_by_topic(topic) {
            let Ok(frame) = decode_frame(&msg.payload) else { continue };
            if get_nested_field(&frame, field_path) == Some(expected) {
                return Ok(());
            }
        }
        anyhow::bail!("No frame on {} with {} = {}", topic, field_path, expected);
    }

    /// Asserts that device `index` received a sensor frame carrying `tag`.
    pub fn assert_device_got_tag(&self, index: usize, tag: &str) -> Result<()> {
        let found = self
            .device(index)
            .frames_of_type("sensor")
            .iter()
            .any(|f| get_nested_field(f, &format!("sensors.{tag}")).is_some());
        if !found {
            anyhow::bail!("Device {} never received sensor '{}'", index, tag);
        }
        Ok(())
    }

    pub fn get_stats(&self) -> TestStats {
        let messages = self.mqtt_client.get_published_messages();
        let mut topic_counts = HashMap::new();

        for msg in &messages {
            *topic_counts.entry(msg.topic.clone()).or_insert(0) += 1;
        }

        TestStats {
            total_messages: messages.len(),
            topic_counts,
            subscriptions: self.mqtt_client.get_subscriptions(),
            device_frames: self.devices.iter().map(|d| d.frames().len()).collect(),
        }
    }

    pub fn reset(&mut self) {
        self.mqtt_client.clear();
        self.expectations.clear();
        for device in &self.devices {
            device.clear();
        }
        log::info!("🧹 Test harness reset");
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}

fn get_nested_field<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = value;
    for part in path.split('.') {
        match current {
            Value::Object(obj) => current = obj.get(part)?,
            _ => return None,
        }
    }
    Some(current)
}

#[derive(Debug)]
pub struct TestStats {
    pub total_messages: usize,
    pub topic_counts: HashMap<String, usize>,
    pub subscriptions: Vec<String>,
    pub device_frames: Vec<usize>,
}

impl TestStats {
    pub fn print(&self) {
        println!("📊 Test Statistics:");
        println!("  Total messages: {}", self.total_messages);
        for (topic, count) in &self.topic_counts {
            println!("    {}: {} messages", topic, count);
        }
        println!("  Subscriptions: {:?}", self.subscriptions);
        println!("  Frames per device: {:?}", self.device_frames);
    }
}
