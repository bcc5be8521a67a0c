use parking_lot::Mutex;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use super::TransportError;
use crate::models::PayloadPreview;

/// Path layout of device firmware. Older builds serve `/data` and
/// `/heartbeat`, newer ones moved both under `/api`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceLayout {
    Legacy,
    Api,
}

#[derive(Debug, Clone, Copy)]
enum DeviceRoute {
    Data,
    Heartbeat,
}

impl DeviceLayout {
    fn path(self, route: DeviceRoute) -> &'static str {
        match (self, route) {
            (Self::Legacy, DeviceRoute::Data) => "/data",
            (Self::Legacy, DeviceRoute::Heartbeat) => "/heartbeat",
            (Self::Api, DeviceRoute::Data) => "/api/data",
            (Self::Api, DeviceRoute::Heartbeat) => "/api/health/heartbeat",
        }
    }

    fn other(self) -> Self {
        match self {
            Self::Legacy => Self::Api,
            Self::Api => Self::Legacy,
        }
    }
}

/// Shared reqwest client for device posts, heartbeats and collector pulls.
#[derive(Clone)]
pub struct HttpTransport {
    client: Client,
    /// Layout learned per device address after a 404 on the other one.
    layouts: Arc<Mutex<HashMap<String, DeviceLayout>>>,
}

impl HttpTransport {
    pub fn new(timeout_ms: u64) -> Result<Self, TransportError> {
        let client = Client::builder()
            .timeout(Duration::from_millis(timeout_ms.max(100)))
            .user_agent(concat!("relay-kernel/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            layouts: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn layout_of(&self, address: &str) -> DeviceLayout {
        self.layouts
            .lock()
            .get(address)
            .copied()
            .unwrap_or(DeviceLayout::Legacy)
    }

    /// Sends to the device's known layout and retries once on the other
    /// layout when the path is missing (404).
    async fn device_request(
        &self,
        address: &str,
        route: DeviceRoute,
        request: impl Fn(String) -> RequestBuilder,
    ) -> Result<(), TransportError> {
        let layout = self.layout_of(address);
        let resp = request(device_url(address, layout.path(route))).send().await?;
        if resp.status() != StatusCode::NOT_FOUND {
            return check_status(resp.status());
        }
        let other = layout.other();
        let retry = request(device_url(address, other.path(route))).send().await?;
        if retry.status() != StatusCode::NOT_FOUND {
            tracing::info!("[http] {address} uses the {other:?} firmware paths");
            self.layouts.lock().insert(address.to_string(), other);
        }
        check_status(retry.status())
    }

    /// `POST http://<address>/data` (or `/api/data`) with the prefixed frame as body.
    pub async fn post_frame(&self, address: &str, frame: &PayloadPreview) -> Result<(), TransportError> {
        let wire = frame.wire();
        self.device_request(address, DeviceRoute::Data, |url| {
            self.client
                .post(url)
                .header(reqwest::header::CONTENT_TYPE, "text/plain")
                .body(wire.clone())
        })
        .await
    }

    /// Plain JSON post for outbound services.
    pub async fn post_json(&self, url: &str, body: &Value) -> Result<(), TransportError> {
        let resp = self.client.post(url).json(body).send().await?;
        check_status(resp.status())
    }

    /// Service check: any answer below 500 counts as reachable.
    pub async fn reachable(&self, url: &str) -> Result<(), TransportError> {
        let resp = self.client.get(url).send().await?;
        if resp.status().is_server_error() {
            return Err(TransportError::Status(resp.status().as_u16()));
        }
        Ok(())
    }

    /// `GET http://<address>/heartbeat` (or `/api/health/heartbeat`), healthy on any 2xx.
    pub async fn heartbeat(&self, address: &str) -> Result<(), TransportError> {
        self.device_request(address, DeviceRoute::Heartbeat, |url| self.client.get(url))
            .await
    }
}

fn check_status(status: reqwest::StatusCode) -> Result<(), TransportError> {
    if status.is_success() {
        Ok(())
    } else {
        Err(TransportError::Status(status.as_u16()))
    }
}

/// Device addresses are stored as `host[:port]`; full URLs are accepted too.
pub fn device_url(address: &str, path: &str) -> String {
    let base = address.trim().trim_end_matches('/');
    if base.starts_with("http://") || base.starts_with("https://") {
        format!("{base}{path}")
    } else {
        format!("http://{base}{path}")
    }
}
