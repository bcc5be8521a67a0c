//! Transport adapters: protocol send/receive primitives, no routing logic.

pub mod http;
pub mod mqtt;
pub mod serial;
pub mod websocket;

use std::sync::Arc;

use crate::config::KernelConfig;

pub use self::http::HttpTransport;
pub use self::mqtt::{BrokerClient, BrokerConnection, BrokerKey, BrokerLease, MqttPool};
pub use self::serial::SerialWriter;
pub use self::websocket::WsHub;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("http: {0}")]
    Http(#[from] reqwest::Error),
    #[error("endpoint answered {0}")]
    Status(u16),
    #[error("mqtt: {0}")]
    Mqtt(String),
    #[error("serial {port}: {message}")]
    Serial { port: String, message: String },
    #[error("{0} is not connected")]
    NotConnected(String),
    #[error("send queue of {0} is full")]
    QueueFull(String),
    #[error("frame: {0}")]
    Frame(String),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// Every adapter the dispatcher and drivers can reach.
pub struct Transports {
    pub http: HttpTransport,
    pub mqtt: MqttPool,
    pub websocket: Arc<WsHub>,
    pub serial: SerialWriter,
}

impl Transports {
    pub fn new(cfg: &KernelConfig) -> Result<Self, TransportError> {
        Ok(Self {
            http: HttpTransport::new(cfg.engine.http_timeout_ms)?,
            mqtt: MqttPool::new(cfg.mqtt.clone()),
            websocket: Arc::new(WsHub::default()),
            serial: SerialWriter::new(cfg.serial.default_baud_rate),
        })
    }

    /// Swaps the broker pool, used to run the engine against a mock broker.
    pub fn with_mqtt_pool(mut self, pool: MqttPool) -> Self {
        self.mqtt = pool;
        self
    }
}
