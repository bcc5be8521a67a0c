/**
 * CATALOG STORE - JSON file persistence of the engine catalog
 *
 * ROLE:
 * Loads the catalog at boot and rewrites it after each mutating API call.
 * The whole catalog is one snapshot; writes go to a temp file then rename,
 * so a crash mid-write never leaves a truncated catalog behind.
 */

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;

use crate::models::{Collector, Device, Junction, Link, Sensor, SensorTarget};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("catalog io: {0}")]
    Io(#[from] std::io::Error),
    #[error("catalog json: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CatalogSnapshot {
    pub next_id: u64,
    pub devices: Vec<Device>,
    pub collectors: Vec<Collector>,
    pub junctions: Vec<Junction>,
    pub links: Vec<Link>,
    pub sensors: Vec<Sensor>,
    pub sensor_targets: Vec<SensorTarget>,
}

impl CatalogSnapshot {
    /// Highest id used by any record, 0 for an empty catalog.
    pub fn max_id(&self) -> u64 {
        let ids = self
            .devices
            .iter()
            .map(|d| d.id)
            .chain(self.collectors.iter().map(|c| c.id))
            .chain(self.junctions.iter().map(|j| j.id))
            .chain(self.links.iter().map(|l| l.id))
            .chain(self.sensors.iter().map(|s| s.id));
        ids.max().unwrap_or(0)
    }
}

pub struct JsonStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Missing file means a fresh catalog.
    pub async fn load(&self) -> Result<CatalogSnapshot, StoreError> {
        if !self.path.exists() {
            tracing::info!("[store] no catalog at {}, starting fresh", self.path.display());
            return Ok(CatalogSnapshot::default());
        }
        let content = tokio::fs::read_to_string(&self.path).await?;
        if content.trim().is_empty() {
            return Ok(CatalogSnapshot::default());
        }
        let snapshot: CatalogSnapshot = serde_json::from_str(&content)?;
        tracing::info!(
            "[store] loaded {} junctions, {} devices, {} collectors from {}",
            snapshot.junctions.len(),
            snapshot.devices.len(),
            snapshot.collectors.len(),
            self.path.display()
        );
        Ok(snapshot)
    }

    pub async fn save(&self, snapshot: &CatalogSnapshot) -> Result<(), StoreError> {
        let content = serde_json::to_string_pretty(snapshot)?;
        let _guard = self.write_lock.lock().await;
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, content).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}
