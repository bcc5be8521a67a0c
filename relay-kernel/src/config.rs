use serde::{Deserialize, Serialize};
use std::path::Path;
use tokio::fs;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("config io: {0}")]
    Io(#[from] std::io::Error),
    #[error("config yaml: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("invalid {key}: {value}")]
    InvalidEnv { key: &'static str, value: String },
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct KernelConfig {
    pub http: HttpConf,
    pub storage: StorageConf,
    pub mqtt: MqttConf,
    pub engine: EngineConf,
    pub serial: SerialConf,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct HttpConf {
    pub bind: String,
}

impl Default for HttpConf {
    fn default() -> Self {
        Self { bind: "0.0.0.0:7180".into() }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct StorageConf {
    pub data_file: String,
}

impl Default for StorageConf {
    fn default() -> Self {
        Self { data_file: "data/catalog.json".into() }
    }
}

/// Broker used by MQTT devices that do not name a broker collector.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct MqttConf {
    pub host: String,
    pub port: u16,
    pub keep_alive_secs: u64,
    pub client_id_prefix: String,
    /// Upper bound on a single publish or subscribe request.
    pub request_timeout_ms: u64,
}

impl Default for MqttConf {
    fn default() -> Self {
        Self {
            host: "localhost".into(),
            port: 1883,
            keep_alive_secs: 15,
            client_id_prefix: "relay-kernel".into(),
            request_timeout_ms: 3000,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct EngineConf {
    pub default_poll_rate_ms: u64,
    pub default_send_rate_ms: u64,
    /// Applied to new junctions that do not set their own retry policy.
    pub default_retry_count: u32,
    pub default_retry_interval_ms: u64,
    pub default_health_interval_ms: u64,
    pub http_timeout_ms: u64,
    pub notification_topic: Option<String>,
    pub notification_history: usize,
}

impl Default for EngineConf {
    fn default() -> Self {
        Self {
            default_poll_rate_ms: crate::models::DEFAULT_POLL_RATE_MS,
            default_send_rate_ms: crate::models::DEFAULT_SEND_RATE_MS,
            default_retry_count: 3,
            default_retry_interval_ms: 5_000,
            default_health_interval_ms: 60_000,
            http_timeout_ms: 3_000,
            notification_topic: Some("junctionrelay/notifications".into()),
            notification_history: 200,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct SerialConf {
    pub default_baud_rate: u32,
}

impl Default for SerialConf {
    fn default() -> Self {
        Self { default_baud_rate: 115_200 }
    }
}

impl KernelConfig {
    pub fn from_yaml_str(txt: &str) -> Result<Self, ConfigError> {
        if txt.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(txt)?)
    }

    /// Applies `RELAY_*` overrides from an arbitrary lookup (the process env in `load_config`).
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(addr) = lookup("RELAY_HTTP_ADDR") {
            self.http.bind = addr;
        }
        if let Some(path) = lookup("RELAY_DATA_FILE") {
            self.storage.data_file = path;
        }
        if let Some(host) = lookup("RELAY_MQTT_HOST") {
            self.mqtt.host = host;
        }
        if let Some(port) = lookup("RELAY_MQTT_PORT") {
            self.mqtt.port = port.parse().map_err(|_| ConfigError::InvalidEnv {
                key: "RELAY_MQTT_PORT",
                value: port.clone(),
            })?;
        }
        Ok(())
    }
}

pub async fn load_config() -> KernelConfig {
    let path = std::env::var("RELAY_KERNEL_CONFIG").unwrap_or_else(|_| "kernel.yaml".into());
    let mut cfg = if Path::new(&path).exists() {
        match fs::read_to_string(&path).await {
            Ok(txt) => KernelConfig::from_yaml_str(&txt).unwrap_or_else(|e| {
                tracing::warn!("[kernel] invalid config {path}: {e}");
                KernelConfig::default()
            }),
            Err(e) => {
                tracing::warn!("[kernel] cannot read {path}: {e}");
                KernelConfig::default()
            }
        }
    } else {
        tracing::info!("[kernel] no {path}, using default config");
        KernelConfig::default()
    };

    if let Err(e) = cfg.apply_overrides(|key| std::env::var(key).ok()) {
        tracing::warn!("[kernel] ignoring env override: {e}");
    }
    cfg
}
