//! WebSocket hub: devices dial in on `/ws/devices/{id}` and frames are pushed
//! to whichever socket is currently attached for that device.
//!
//! Each socket has a bounded outbound queue. A device that stops reading
//! fills it and further frames fail instead of piling up in memory.

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::collections::HashMap;
use tokio::sync::mpsc::{self, error::TrySendError};

use super::TransportError;
use crate::models::{DeviceId, PayloadPreview};

/// Frames waiting per socket.
pub const QUEUE_DEPTH: usize = 32;

pub struct WsHub {
    peers: Mutex<HashMap<DeviceId, (u64, mpsc::Sender<String>)>>,
    next_session: Mutex<u64>,
    depth: usize,
}

impl Default for WsHub {
    fn default() -> Self {
        Self::with_depth(QUEUE_DEPTH)
    }
}

impl WsHub {
    pub fn with_depth(depth: usize) -> Self {
        Self {
            peers: Mutex::new(HashMap::new()),
            next_session: Mutex::new(0),
            depth: depth.max(1),
        }
    }

    /// Registers a socket for `device_id`, replacing any older one.
    pub fn attach(&self, device_id: DeviceId) -> (u64, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(self.depth);
        let session = {
            let mut next = self.next_session.lock();
            *next += 1;
            *next
        };
        self.peers.lock().insert(device_id, (session, tx));
        (session, rx)
    }

    /// Only the session that attached may detach, so a late close of an old
    /// socket does not drop its replacement.
    pub fn detach(&self, device_id: DeviceId, session: u64) {
        let mut peers = self.peers.lock();
        if peers.get(&device_id).is_some_and(|(s, _)| *s == session) {
            peers.remove(&device_id);
        }
    }

    pub fn is_connected(&self, device_id: DeviceId) -> bool {
        self.peers.lock().contains_key(&device_id)
    }

    pub fn send_frame(&self, device_id: DeviceId, frame: &PayloadPreview) -> Result<(), TransportError> {
        let peers = self.peers.lock();
        let (_, tx) = peers
            .get(&device_id)
            .ok_or_else(|| TransportError::NotConnected(format!("websocket device {device_id}")))?;
        tx.try_send(frame.wire()).map_err(|e| match e {
            TrySendError::Full(_) => TransportError::QueueFull(format!("websocket device {device_id}")),
            TrySendError::Closed(_) => TransportError::NotConnected(format!("websocket device {device_id}")),
        })
    }
}

/// Pumps frames to the socket until either side closes.
pub async fn serve_socket(hub: std::sync::Arc<WsHub>, device_id: DeviceId, socket: WebSocket) {
    let (session, mut outbound) = hub.attach(device_id);
    let (mut sink, mut stream) = socket.split();
    tracing::info!("[ws] device {device_id} connected");

    loop {
        tokio::select! {
            msg = outbound.recv() => {
                let Some(text) = msg else { break };
                if sink.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
            incoming = stream.next() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    hub.detach(device_id, session);
    tracing::info!("[ws] device {device_id} disconnected");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame() -> PayloadPreview {
        PayloadPreview { prefix: "00000002".into(), body: "{}".into() }
    }

    #[test]
    fn test_send_without_socket_fails() {
        let hub = WsHub::default();
        assert!(matches!(hub.send_frame(3, &frame()), Err(TransportError::NotConnected(_))));
    }

    #[tokio::test]
    async fn test_attached_device_receives_wire_frame() {
        let hub = WsHub::default();
        let (_, mut rx) = hub.attach(3);
        hub.send_frame(3, &frame()).unwrap();
        assert_eq!(rx.recv().await.unwrap(), "00000002{}");
    }

    #[test]
    fn test_stale_detach_keeps_new_session() {
        let hub = WsHub::default();
        let (old, _rx1) = hub.attach(3);
        let (_new, _rx2) = hub.attach(3);
        hub.detach(3, old);
        assert!(hub.is_connected(3));
    }

    #[tokio::test]
    async fn test_stalled_socket_fills_its_queue() {
        let hub = WsHub::with_depth(2);
        let (_, mut rx) = hub.attach(3);
        hub.send_frame(3, &frame()).unwrap();
        hub.send_frame(3, &frame()).unwrap();
        assert!(matches!(hub.send_frame(3, &frame()), Err(TransportError::QueueFull(_))));

        // Draining makes room again.
        rx.recv().await.unwrap();
        hub.send_frame(3, &frame()).unwrap();

        drop(rx);
        assert!(matches!(hub.send_frame(3, &frame()), Err(TransportError::NotConnected(_))));
    }
}
