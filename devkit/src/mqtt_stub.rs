/*!
Mock MQTT client for running the engine without a broker

Records every publish, keeps the live subscription set (topic → QoS) and can
be told to fail publishes to exercise the engine's retry path.
*/

use rumqttc::QoS;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use anyhow::Result;

use crate::frame::decode_frame;

#[derive(Debug, Clone)]
pub struct MockMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QoS,
    pub retain: bool,
}

/// Mock MQTT client shaped like rumqttc::AsyncClient
#[derive(Clone)]
pub struct MockMqttClient {
    published_messages: Arc<Mutex<Vec<MockMessage>>>,
    subscriptions: Arc<Mutex<BTreeMap<String, QoS>>>,
    message_sender: Arc<Mutex<Option<mpsc::UnboundedSender<MockMessage>>>>,
    fail_publish: Arc<AtomicBool>,
}

impl MockMqttClient {
    pub fn new() -> Self {
        Self {
            published_messages: Arc::new(Mutex::new(Vec::new())),
            subscriptions: Arc::new(Mutex::new(BTreeMap::new())),
            message_sender: Arc::new(Mutex::new(None)),
            fail_publish: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Channel fed by `simulate_incoming`
    pub fn setup_receiver(&self) -> mpsc::UnboundedReceiver<MockMessage> {
        let (sender, receiver) = mpsc::unbounded_channel();
        *self.message_sender.lock().unwrap() = Some(sender);
        receiver
    }

    /// Makes every following publish fail until switched back.
    pub fn set_fail_publish(&self, fail: bool) {
        self.fail_publish.store(fail, Ordering::SeqCst);
    }

    pub async fn publish<S, V>(&self, topic: S, qos: QoS, retain: bool, payload: V) -> Result<()>
    where
        S: Into<String>,
        V: Into<Vec<u8>>,
    {
        let topic = topic.into();
        if self.fail_publish.load(Ordering::SeqCst) {
            anyhow::bail!("mock broker refused publish to {topic}");
        }
        let message = MockMessage {
            topic,
            payload: payload.into(),
            qos,
            retain,
        };
        log::info!("📤 [MOCK] Published to {}: {} bytes", message.topic, message.payload.len());
        self.published_messages.lock().unwrap().push(message);
        Ok(())
    }

    /// Re-subscribing an existing topic only updates its QoS.
    pub async fn subscribe<S: Into<String>>(&self, topic: S, qos: QoS) -> Result<()> {
        let topic = topic.into();
        log::info!("📥 [MOCK] Subscribed to {} ({:?})", topic, qos);
        self.subscriptions.lock().unwrap().insert(topic, qos);
        Ok(())
    }

    pub async fn unsubscribe<S: Into<String>>(&self, topic: S) -> Result<()> {
        let topic = topic.into();
        self.subscriptions.lock().unwrap().remove(&topic);
        log::info!("[MOCK] Unsubscribed from {}", topic);
        Ok(())
    }

    pub async fn simulate_incoming<S, V>(&self, topic: S, payload: V) -> Result<()>
    where
        S: Into<String>,
        V: Into<Vec<u8>>,
    {
        let message = MockMessage {
            topic: topic.into(),
            payload: payload.into(),
            qos: QoS::AtLeastOnce,
            retain: false,
        };

        if let Some(sender) = self.message_sender.lock().unwrap().as_ref() {
            sender.send(message.clone()).map_err(|e| anyhow::anyhow!("Send error: {}", e))?;
        }

        log::info!("📨 [MOCK] Simulated incoming: {}", message.topic);
        Ok(())
    }

    pub fn get_published_messages(&self) -> Vec<MockMessage> {
        self.published_messages.lock().unwrap().clone()
    }

    /// Topics currently subscribed, in topic order.
    pub fn get_subscriptions(&self) -> Vec<String> {
        self.subscriptions.lock().unwrap().keys().cloned().collect()
    }

    pub fn subscription_qos(&self, topic: &str) -> Option<QoS> {
        self.subscriptions.lock().unwrap().get(topic).copied()
    }

    pub fn find_messages_by_topic(&self, topic: &str) -> Vec<MockMessage> {
        self.published_messages
            .lock()
            .unwrap()
            .iter()
            .filter(|msg| msg.topic == topic)
            .cloned()
            .collect()
    }

    pub fn get_last_json_message<T>(&self, topic: &str) -> Result<Option<T>>
    where
        T: for<'de> serde::Deserialize<'de>,
    {
        let messages = self.find_messages_by_topic(topic);
        if let Some(last_msg) = messages.last() {
            let parsed: T = serde_json::from_slice(&last_msg.payload)?;
            Ok(Some(parsed))
        } else {
            Ok(None)
        }
    }

    /// Last length-prefixed frame published on `topic`, decoded.
    pub fn get_last_frame(&self, topic: &str) -> Result<Option<serde_json::Value>> {
        match self.find_messages_by_topic(topic).last() {
            Some(msg) => Ok(Some(decode_frame(&msg.payload)?)),
            None => Ok(None),
        }
    }

    pub fn clear(&self) {
        self.published_messages.lock().unwrap().clear();
        self.subscriptions.lock().unwrap().clear();
    }
}

impl Default for MockMqttClient {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::encode_frame;

    #[tokio::test]
    async fn test_mock_client_publish_subscribe() {
        let client = MockMqttClient::new();

        client.subscribe("sensors/kitchen/temp", QoS::AtLeastOnce).await.unwrap();
        client.subscribe("sensors/kitchen/temp", QoS::ExactlyOnce).await.unwrap();
        assert_eq!(client.get_subscriptions(), vec!["sensors/kitchen/temp"]);
        assert_eq!(client.subscription_qos("sensors/kitchen/temp"), Some(QoS::ExactlyOnce));

        client.publish("panel/data", QoS::AtLeastOnce, false, b"x".to_vec()).await.unwrap();
        assert_eq!(client.get_published_messages().len(), 1);

        client.unsubscribe("sensors/kitchen/temp").await.unwrap();
        assert!(client.get_subscriptions().is_empty());
    }

    #[tokio::test]
    async fn test_fail_mode_rejects_publish() {
        let client = MockMqttClient::new();
        client.set_fail_publish(true);
        assert!(client.publish("a", QoS::AtMostOnce, false, Vec::new()).await.is_err());
        client.set_fail_publish(false);
        assert!(client.publish("a", QoS::AtMostOnce, false, Vec::new()).await.is_ok());
        assert_eq!(client.find_messages_by_topic("a").len(), 1);
    }

    #[tokio::test]
    async fn test_last_frame_is_decoded() {
        let client = MockMqttClient::new();
        let body = serde_json::json!({"type": "sensor", "sensors": {"cpu": []}});
        client
            .publish("panel/data", QoS::AtLeastOnce, false, encode_frame(&body))
            .await
            .unwrap();
        assert_eq!(client.get_last_frame("panel/data").unwrap(), Some(body));
    }
}
