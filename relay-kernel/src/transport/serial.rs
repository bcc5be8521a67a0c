use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tokio::io::{AsyncWrite, AsyncWriteExt};

use super::TransportError;
use crate::models::PayloadPreview;

pub type PortStream = Box<dyn AsyncWrite + Send + Unpin>;
pub type PortOpener = Arc<dyn Fn(&str, u32) -> Result<PortStream, TransportError> + Send + Sync>;

struct OpenPort {
    baud: u32,
    stream: PortStream,
}

type PortSlot = Arc<tokio::sync::Mutex<Option<OpenPort>>>;

#[derive(Default)]
struct PortEntry {
    slot: PortSlot,
    leases: usize,
}

struct WriterInner {
    ports: Mutex<HashMap<String, PortEntry>>,
    opener: PortOpener,
}

/// Writes frames to COM ports.
///
/// While a running junction holds a [`SerialLease`] on a port, the stream
/// stays open between frames; the last lease closes it. Writes to the same
/// port are serialised so two junctions never interleave bytes. A failed
/// write drops the stream and the next frame reopens the port.
#[derive(Clone)]
pub struct SerialWriter {
    default_baud: u32,
    inner: Arc<WriterInner>,
}

impl SerialWriter {
    pub fn new(default_baud: u32) -> Self {
        Self::with_opener(default_baud, Arc::new(open_serial))
    }

    pub fn with_opener(default_baud: u32, opener: PortOpener) -> Self {
        Self {
            default_baud,
            inner: Arc::new(WriterInner {
                ports: Mutex::new(HashMap::new()),
                opener,
            }),
        }
    }

    /// Keeps `port` open until the lease drops.
    pub fn acquire(&self, port: &str) -> SerialLease {
        self.inner.ports.lock().entry(port.to_string()).or_default().leases += 1;
        SerialLease {
            inner: Arc::downgrade(&self.inner),
            port: port.to_string(),
        }
    }

    pub fn lease_count(&self, port: &str) -> usize {
        self.inner.ports.lock().get(port).map_or(0, |e| e.leases)
    }

    /// Slot of `port` and whether a lease wants the stream kept open.
    fn slot(&self, port: &str) -> (PortSlot, bool) {
        let mut ports = self.inner.ports.lock();
        let entry = ports.entry(port.to_string()).or_default();
        (entry.slot.clone(), entry.leases > 0)
    }

    pub async fn write_frame(&self, port: &str, baud: Option<u32>, frame: &PayloadPreview) -> Result<(), TransportError> {
        let baud = baud.filter(|b| *b > 0).unwrap_or(self.default_baud);
        let (slot, keep_open) = self.slot(port);
        let mut open = slot.lock().await;

        let mut stream = match open.take() {
            Some(p) if p.baud == baud => p.stream,
            _ => (self.inner.opener)(port, baud)?,
        };
        let written = write_all(&mut stream, frame).await;
        match &written {
            Ok(()) if keep_open => *open = Some(OpenPort { baud, stream }),
            Ok(()) => {}
            Err(e) => tracing::debug!("[serial] {port} write failed, closing: {e}"),
        }
        written
    }
}

async fn write_all(stream: &mut PortStream, frame: &PayloadPreview) -> Result<(), TransportError> {
    stream.write_all(frame.wire().as_bytes()).await?;
    stream.flush().await?;
    Ok(())
}

fn open_serial(port: &str, baud: u32) -> Result<PortStream, TransportError> {
    let builder = tokio_serial::new(port, baud);
    let stream = tokio_serial::SerialStream::open(&builder).map_err(|e| TransportError::Serial {
        port: port.to_string(),
        message: format!("open failed: {e}"),
    })?;
    tracing::debug!("[serial] opened {port} at {baud} baud");
    Ok(Box::new(stream))
}

pub struct SerialLease {
    inner: Weak<WriterInner>,
    port: String,
}

impl Drop for SerialLease {
    fn drop(&mut self) {
        let Some(inner) = self.inner.upgrade() else { return };
        let mut ports = inner.ports.lock();
        let Some(entry) = ports.get_mut(&self.port) else { return };
        entry.leases = entry.leases.saturating_sub(1);
        if entry.leases == 0 {
            ports.remove(&self.port);
            tracing::debug!("[serial] released {}", self.port);
        }
    }
}
