//! Junction notifications: logged, kept in a bounded history and, when the
//! default broker is already connected, published on the notification topic.

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use time::OffsetDateTime;

use crate::models::{Junction, JunctionId};
use crate::transport::mqtt::{BrokerKey, MqttPool};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Info,
    Error,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub id: u64,
    pub junction_id: JunctionId,
    pub junction_name: String,
    pub level: Level,
    pub message: String,
    #[serde(with = "time::serde::rfc3339")]
    pub raised_at: OffsetDateTime,
}

pub struct Notifier {
    history: Mutex<VecDeque<Notification>>,
    capacity: usize,
    next_id: AtomicU64,
    topic: Option<String>,
    pool: MqttPool,
    broker: BrokerKey,
}

impl Notifier {
    pub fn new(capacity: usize, topic: Option<String>, pool: MqttPool, broker: BrokerKey) -> Self {
        Self {
            history: Mutex::new(VecDeque::new()),
            capacity: capacity.max(1),
            next_id: AtomicU64::new(1),
            topic: topic.filter(|t| !t.trim().is_empty()),
            pool,
            broker,
        }
    }

    pub async fn raise(&self, junction: &Junction, level: Level, message: impl Into<String>) {
        let note = Notification {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            junction_id: junction.id,
            junction_name: junction.name.clone(),
            level,
            message: message.into(),
            raised_at: OffsetDateTime::now_utc(),
        };
        match level {
            Level::Error => tracing::warn!("[notify] {}: {}", note.junction_name, note.message),
            Level::Info => tracing::info!("[notify] {}: {}", note.junction_name, note.message),
        }
        {
            let mut history = self.history.lock();
            if history.len() == self.capacity {
                history.pop_front();
            }
            history.push_back(note.clone());
        }
        self.publish(&note).await;
    }

    // Never opens a connection of its own.
    async fn publish(&self, note: &Notification) {
        let Some(topic) = &self.topic else { return };
        let Some(conn) = self.pool.get(&self.broker).filter(|c| c.is_connected()) else {
            return;
        };
        let payload = match serde_json::to_vec(note) {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!("[notify] cannot encode notification: {e}");
                return;
            }
        };
        if let Err(e) = conn.publish(topic, 1, payload).await {
            tracing::warn!("[notify] publish to {topic} failed: {e}");
        }
    }

    /// Newest first.
    pub fn list(&self) -> Vec<Notification> {
        self.history.lock().iter().rev().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MqttConf;
    use crate::transport::mqtt::tests::mock_pool;
    use relay_devkit::MockMqttClient;

    fn junction() -> Junction {
        Junction {
            id: 4,
            name: "Desk".into(),
            ..Junction::default()
        }
    }

    #[tokio::test]
    async fn test_history_is_bounded_and_newest_first() {
        let cfg = MqttConf::default();
        let notifier = Notifier::new(2, None, mock_pool(MockMqttClient::new()), BrokerKey::default_broker(&cfg));
        for i in 0..3 {
            notifier.raise(&junction(), Level::Error, format!("n{i}")).await;
        }
        let list = notifier.list();
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].message, "n2");
        assert_eq!(list[1].message, "n1");
    }

    #[tokio::test]
    async fn test_publishes_only_on_open_connection() {
        let cfg = MqttConf::default();
        let client = MockMqttClient::new();
        let pool = mock_pool(client.clone());
        let key = BrokerKey::default_broker(&cfg);
        let notifier = Notifier::new(10, Some("relay/notifications".into()), pool.clone(), key.clone());

        notifier.raise(&junction(), Level::Error, "no broker yet").await;
        assert!(client.find_messages_by_topic("relay/notifications").is_empty());

        let _lease = pool.acquire(&key);
        notifier.raise(&junction(), Level::Error, "retry budget exhausted").await;
        let json: serde_json::Value = client
            .get_last_json_message("relay/notifications")
            .unwrap()
            .unwrap();
        assert_eq!(json["junctionId"], 4);
        assert_eq!(json["level"], "error");
    }
}
