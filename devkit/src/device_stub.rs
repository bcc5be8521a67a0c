/*!
Mock network device

A small axum server on 127.0.0.1 standing in for a display device or an
upstream service:
- `POST /data` decodes length-prefixed frames (or records plain JSON bodies)
- `GET /heartbeat` answers 200 unless told otherwise
- `start_with_api_paths` serves the newer firmware layout instead
  (`POST /api/data`, `GET /api/health/heartbeat`)
- any other GET path serves a canned body registered with `serve_json`/`serve_text`
*/

use axum::{
    body::Bytes,
    extract::State,
    http::{header, HeaderMap, StatusCode, Uri},
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use serde_json::Value;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;
use anyhow::Result;

use crate::frame::decode_frame;

#[derive(Default)]
struct DeviceState {
    frames: Mutex<Vec<Value>>,
    rejected: AtomicUsize,
    failing: AtomicBool,
    heartbeat_down: AtomicBool,
    routes: Mutex<HashMap<String, (String, &'static str)>>,
    last_authorization: Mutex<Option<String>>,
}

pub struct MockDevice {
    addr: SocketAddr,
    state: Arc<DeviceState>,
    shutdown: Option<oneshot::Sender<()>>,
}

impl MockDevice {
    pub async fn start() -> Result<Self> {
        Self::serve("/data", "/heartbeat").await
    }

    pub async fn start_with_api_paths() -> Result<Self> {
        Self::serve("/api/data", "/api/health/heartbeat").await
    }

    async fn serve(data_path: &str, heartbeat_path: &str) -> Result<Self> {
        let state = Arc::new(DeviceState::default());
        let app = Router::new()
            .route(data_path, post(receive_data))
            .route(heartbeat_path, get(heartbeat))
            .fallback(canned)
            .with_state(state.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let (tx, rx) = oneshot::channel::<()>();
        tokio::spawn(async move {
            let server = axum::serve(listener, app).with_graceful_shutdown(async {
                rx.await.ok();
            });
            if let Err(e) = server.await {
                log::warn!("[mock-device] server error: {e}");
            }
        });
        log::info!("🖥️  [mock-device] listening on {addr}");

        Ok(Self {
            addr,
            state,
            shutdown: Some(tx),
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// `host:port`, the form stored as a device address.
    pub fn address(&self) -> String {
        self.addr.to_string()
    }

    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// While failing, `POST /data` answers 500 and records nothing.
    pub fn set_failing(&self, failing: bool) {
        self.state.failing.store(failing, Ordering::SeqCst);
    }

    pub fn set_heartbeat(&self, up: bool) {
        self.state.heartbeat_down.store(!up, Ordering::SeqCst);
    }

    pub fn serve_json(&self, path: &str, body: &Value) {
        self.state
            .routes
            .lock()
            .unwrap()
            .insert(path.to_string(), (body.to_string(), "application/json"));
    }

    pub fn serve_text(&self, path: &str, body: &str) {
        self.state
            .routes
            .lock()
            .unwrap()
            .insert(path.to_string(), (body.to_string(), "text/plain; version=0.0.4"));
    }

    pub fn frames(&self) -> Vec<Value> {
        self.state.frames.lock().unwrap().clone()
    }

    /// Frames whose `type` field equals `kind` (`sensor`, `config`, ...).
    pub fn frames_of_type(&self, kind: &str) -> Vec<Value> {
        self.frames()
            .into_iter()
            .filter(|f| f.get("type").and_then(Value::as_str) == Some(kind))
            .collect()
    }

    pub fn rejected_count(&self) -> usize {
        self.state.rejected.load(Ordering::SeqCst)
    }

    pub fn last_authorization(&self) -> Option<String> {
        self.state.last_authorization.lock().unwrap().clone()
    }

    pub fn clear(&self) {
        self.state.frames.lock().unwrap().clear();
    }

    /// Polls until at least `count` frames of `kind` arrived or the timeout elapses.
    pub async fn wait_for_frames(&self, kind: &str, count: usize, timeout: Duration) -> bool {
        let start = std::time::Instant::now();
        while start.elapsed() < timeout {
            if self.frames_of_type(kind).len() >= count {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        false
    }
}

impl Drop for MockDevice {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }
}

async fn receive_data(State(state): State<Arc<DeviceState>>, body: Bytes) -> StatusCode {
    if state.failing.load(Ordering::SeqCst) {
        return StatusCode::INTERNAL_SERVER_ERROR;
    }
    // Service receivers get a plain JSON array, devices get frames.
    let parsed = if body.first() == Some(&b'[') {
        serde_json::from_slice::<Value>(&body).map_err(anyhow::Error::from)
    } else {
        decode_frame(&body)
    };
    match parsed {
        Ok(value) => {
            state.frames.lock().unwrap().push(value);
            StatusCode::OK
        }
        Err(e) => {
            log::warn!("[mock-device] rejected body: {e}");
            state.rejected.fetch_add(1, Ordering::SeqCst);
            StatusCode::BAD_REQUEST
        }
    }
}

async fn heartbeat(State(state): State<Arc<DeviceState>>) -> StatusCode {
    if state.heartbeat_down.load(Ordering::SeqCst) {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    }
}

async fn canned(State(state): State<Arc<DeviceState>>, headers: HeaderMap, uri: Uri) -> Response {
    if let Some(auth) = headers.get(header::AUTHORIZATION).and_then(|v| v.to_str().ok()) {
        *state.last_authorization.lock().unwrap() = Some(auth.to_string());
    }
    let routes = state.routes.lock().unwrap();
    match routes.get(uri.path()) {
        Some((body, content_type)) => {
            ([(header::CONTENT_TYPE, *content_type)], body.clone()).into_response()
        }
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::encode_frame;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    async fn raw_post(addr: SocketAddr, body: &str) -> String {
        let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        let req = format!(
            "POST /data HTTP/1.1\r\nHost: {addr}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
            body.len()
        );
        stream.write_all(req.as_bytes()).await.unwrap();
        let mut out = String::new();
        stream.read_to_string(&mut out).await.unwrap();
        out
    }

    #[tokio::test]
    async fn test_device_records_frames_and_fails_on_demand() {
        let device = MockDevice::start().await.unwrap();
        let frame = encode_frame(&serde_json::json!({"type": "sensor", "sensors": {}}));

        let reply = raw_post(device.addr(), &frame).await;
        assert!(reply.starts_with("HTTP/1.1 200"));
        assert_eq!(device.frames_of_type("sensor").len(), 1);

        device.set_failing(true);
        let reply = raw_post(device.addr(), &frame).await;
        assert!(reply.starts_with("HTTP/1.1 500"));
        assert_eq!(device.frames().len(), 1);
    }

    #[tokio::test]
    async fn test_device_rejects_bad_prefix() {
        let device = MockDevice::start().await.unwrap();
        let reply = raw_post(device.addr(), "00000099{}").await;
        assert!(reply.starts_with("HTTP/1.1 400"));
        assert_eq!(device.rejected_count(), 1);
    }
}
