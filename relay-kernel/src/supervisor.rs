//! Owns the running junctions.
//!
//! Each junction has its own async slot, so start/stop/restart of one
//! junction serialise against each other but never block another junction.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

use crate::engine::Runtime;
use crate::error::EngineResult;
use crate::models::{JunctionId, JunctionStatus};
use crate::scheduler::{self, RunningJunction};

type Slot = Arc<tokio::sync::Mutex<Option<RunningJunction>>>;

#[derive(Default)]
pub struct Supervisor {
    slots: Mutex<HashMap<JunctionId, Slot>>,
}

impl Supervisor {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, id: JunctionId) -> Slot {
        self.slots.lock().entry(id).or_default().clone()
    }

    /// No-op while already running; returns the live status either way.
    pub async fn start(&self, rt: &Arc<Runtime>, id: JunctionId) -> EngineResult<JunctionStatus> {
        let junction = rt.catalog.junction(id)?;
        let slot = self.slot(id);
        let mut guard = slot.lock().await;
        if guard.is_some() {
            return Ok(rt.status.status(id));
        }
        tracing::info!("[supervisor] starting '{}'", junction.name);
        *guard = Some(scheduler::launch(rt, junction));
        Ok(rt.status.status(id))
    }

    /// Cancels the junction's loops and waits for them before tearing down
    /// its live status. No-op when idle.
    pub async fn stop(&self, rt: &Runtime, id: JunctionId) -> JunctionStatus {
        let slot = self.slot(id);
        let mut guard = slot.lock().await;
        if let Some(run) = guard.take() {
            run.shutdown().await;
            rt.status.end(id);
            tracing::info!("[supervisor] stopped junction {id}");
        }
        JunctionStatus::Idle
    }

    /// Picks up configuration changes of a running junction.
    pub async fn restart_if_running(&self, rt: &Arc<Runtime>, id: JunctionId) -> EngineResult<()> {
        let slot = self.slot(id);
        let mut guard = slot.lock().await;
        let Some(run) = guard.take() else {
            return Ok(());
        };
        run.shutdown().await;
        rt.status.end(id);
        let junction = rt.catalog.junction(id)?;
        tracing::info!("[supervisor] restarting '{}'", junction.name);
        *guard = Some(scheduler::launch(rt, junction));
        Ok(())
    }

    pub async fn is_running(&self, id: JunctionId) -> bool {
        self.slot(id).lock().await.is_some()
    }

    /// Stops and forgets the slot (junction deleted).
    pub async fn remove(&self, rt: &Runtime, id: JunctionId) {
        self.stop(rt, id).await;
        self.slots.lock().remove(&id);
    }

    pub async fn stop_all(&self, rt: &Runtime) {
        let ids: Vec<JunctionId> = self.slots.lock().keys().copied().collect();
        for id in ids {
            self.stop(rt, id).await;
        }
    }
}
