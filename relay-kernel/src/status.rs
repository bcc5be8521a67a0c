/**
 * STATUS AGGREGATOR - Live view of running junctions
 *
 * ROLE:
 * Holds the ActivePoller / ActiveStream projections and the live junction
 * status. Poll and send loops write after every cycle; the control API reads
 * snapshots (cloned records, never references into the maps).
 *
 * FAILURE LEDGER:
 * Consecutive failures are counted per (link, check). A count above the
 * junction's retryCount flips it to Error; a success that brings every count
 * back within budget flips it to Running again.
 */

use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use time::OffsetDateTime;

use crate::models::{
    ActivePoller, ActiveStream, DeliveryOutcome, JunctionId, JunctionStatus, LinkId, PayloadPreview,
    RunningStatus,
};

/// What a failure was counted against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Check {
    Cycle,
    Health,
}

#[derive(Debug, Default)]
struct JunctionRun {
    status: JunctionStatus,
    failures: HashMap<(LinkId, Check), u32>,
}

#[derive(Debug, Clone, Default)]
pub struct PollReport {
    pub latency_ms: u64,
    pub sensor_count: usize,
    pub payload: Option<serde_json::Value>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct SendReport {
    pub latency_ms: u64,
    pub payload: Option<PayloadPreview>,
    pub mqtt_payload: Option<String>,
    pub deliveries: Vec<DeliveryOutcome>,
    pub error: Option<String>,
}

#[derive(Default)]
pub struct StatusAggregator {
    runs: RwLock<HashMap<JunctionId, JunctionRun>>,
    pollers: RwLock<BTreeMap<(JunctionId, LinkId), ActivePoller>>,
    streams: RwLock<BTreeMap<(JunctionId, LinkId), ActiveStream>>,
}

impl StatusAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin(&self, junction_id: JunctionId) {
        self.runs.write().insert(
            junction_id,
            JunctionRun {
                status: JunctionStatus::Running,
                failures: HashMap::new(),
            },
        );
    }

    /// Forgets everything about the junction's last run.
    pub fn end(&self, junction_id: JunctionId) {
        self.runs.write().remove(&junction_id);
        self.pollers.write().retain(|(j, _), _| *j != junction_id);
        self.streams.write().retain(|(j, _), _| *j != junction_id);
    }

    pub fn status(&self, junction_id: JunctionId) -> JunctionStatus {
        self.runs
            .read()
            .get(&junction_id)
            .map(|r| r.status)
            .unwrap_or(JunctionStatus::Idle)
    }

    pub fn register_poller(&self, poller: ActivePoller) {
        self.pollers
            .write()
            .insert((poller.junction_id, poller.link_id), poller);
    }

    pub fn register_stream(&self, stream: ActiveStream) {
        self.streams
            .write()
            .insert((stream.junction_id, stream.link_id), stream);
    }

    pub fn record_poll(&self, junction_id: JunctionId, link_id: LinkId, report: PollReport) {
        let mut pollers = self.pollers.write();
        let Some(p) = pollers.get_mut(&(junction_id, link_id)) else {
            return;
        };
        let now = OffsetDateTime::now_utc();
        p.computed_rate_ms = p.last_poll_at.map(|prev| elapsed_ms(prev, now));
        p.last_poll_at = Some(now);
        p.latency_ms = Some(report.latency_ms);
        match report.error {
            None => {
                p.sensor_count = report.sensor_count;
                p.consecutive_failures = 0;
                p.last_payload = report.payload;
                p.last_error = None;
            }
            Some(e) => {
                p.consecutive_failures += 1;
                p.last_error = Some(e);
            }
        }
    }

    pub fn record_send(&self, junction_id: JunctionId, link_id: LinkId, report: SendReport) {
        let mut streams = self.streams.write();
        let Some(s) = streams.get_mut(&(junction_id, link_id)) else {
            return;
        };
        let now = OffsetDateTime::now_utc();
        s.computed_rate_ms = s.last_send_at.map(|prev| elapsed_ms(prev, now));
        s.last_send_at = Some(now);
        s.latency_ms = Some(report.latency_ms);
        if report.payload.is_some() {
            s.last_payload = report.payload;
        }
        if report.mqtt_payload.is_some() {
            s.last_mqtt_payload = report.mqtt_payload;
        }
        s.deliveries = report.deliveries;
        match report.error {
            None => {
                s.consecutive_failures = 0;
                s.last_error = None;
            }
            Some(e) => {
                s.consecutive_failures += 1;
                s.last_error = Some(e);
            }
        }
    }

    /// Feeds one cycle result into the ledger. Returns the new status when it changed.
    pub fn note_result(
        &self,
        junction_id: JunctionId,
        link_id: LinkId,
        check: Check,
        ok: bool,
        retry_count: u32,
    ) -> Option<JunctionStatus> {
        let mut runs = self.runs.write();
        let run = runs.get_mut(&junction_id)?;
        let count = run.failures.entry((link_id, check)).or_insert(0);
        if ok {
            *count = 0;
        } else {
            *count += 1;
        }
        let over_budget = run.failures.values().any(|c| *c > retry_count);
        let next = match (run.status, over_budget) {
            (JunctionStatus::Running, true) => JunctionStatus::Error,
            (JunctionStatus::Error, false) if ok => JunctionStatus::Running,
            (current, _) => current,
        };
        if next == run.status {
            return None;
        }
        run.status = next;
        Some(next)
    }

    pub fn pollers(&self) -> Vec<ActivePoller> {
        self.pollers.read().values().cloned().collect()
    }

    pub fn streams(&self) -> Vec<ActiveStream> {
        self.streams.read().values().cloned().collect()
    }

    pub fn running_statuses(&self) -> Vec<RunningStatus> {
        let mut list: Vec<RunningStatus> = self
            .runs
            .read()
            .iter()
            .map(|(id, run)| RunningStatus {
                id: *id,
                status: run.status,
            })
            .collect();
        list.sort_by_key(|r| r.id);
        list
    }

    pub fn running_count(&self) -> usize {
        self.runs.read().len()
    }

    pub fn error_count(&self) -> usize {
        self.runs
            .read()
            .values()
            .filter(|r| r.status == JunctionStatus::Error)
            .count()
    }
}

fn elapsed_ms(from: OffsetDateTime, to: OffsetDateTime) -> u64 {
    (to - from).whole_milliseconds().max(0) as u64
}
