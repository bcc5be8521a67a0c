/**
 * SCHEDULER - Poll and send loops of one running junction
 *
 * ROLE:
 * `launch` spawns one task per Source link (poll loop), one per Target link
 * (send loop) and, when enabled, a health loop. Every loop ticks on its own
 * wall-clock interval with MissedTickBehavior::Skip, so a cycle still in
 * flight swallows the ticks it overlaps instead of queueing them.
 *
 * FAILURES:
 * A failed cycle is recorded on its poller/stream, counted in the status
 * ledger and retried after the junction's retry interval. Loops never exit
 * on their own; only the cancellation token stops them.
 */

use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::collectors::Driver;
use crate::dispatcher::{self, Endpoint};
use crate::engine::Runtime;
use crate::models::{
    ActivePoller, ActiveStream, EntityKind, Junction, JunctionStatus, JunctionType, Link, LinkRole,
};
use crate::notifications::Level;
use crate::status::{Check, PollReport, SendReport};
use crate::transport::mqtt::BrokerKey;

/// Handle on the tasks of one running junction.
pub struct RunningJunction {
    token: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl RunningJunction {
    /// Cancels every loop and waits until none of them is still running.
    pub async fn shutdown(self) {
        self.token.cancel();
        for task in self.tasks {
            if let Err(e) = task.await {
                if e.is_panic() {
                    tracing::error!("[scheduler] junction task panicked: {e}");
                }
            }
        }
    }
}

pub fn launch(rt: &Arc<Runtime>, junction: Junction) -> RunningJunction {
    let token = CancellationToken::new();
    let mut tasks = Vec::new();
    let mut health_targets = Vec::new();
    let junction = Arc::new(junction);

    rt.status.begin(junction.id);
    for link in rt.catalog.links_of(junction.id) {
        match link.role {
            LinkRole::Source => {
                let rate = rt.catalog.poll_rate(&link);
                rt.status.register_poller(new_poller(rt, &link, rate));
                tasks.push(tokio::spawn(poll_loop(
                    rt.clone(),
                    junction.clone(),
                    link,
                    rate,
                    token.child_token(),
                )));
            }
            LinkRole::Target => {
                let Some(endpoint) = resolve_endpoint(rt, &junction, &link) else {
                    continue;
                };
                let endpoint = Arc::new(endpoint);
                let rate = rt.catalog.send_rate(&link);
                rt.status.register_stream(ActiveStream {
                    junction_id: junction.id,
                    link_id: link.id,
                    entity_id: link.entity_id,
                    entity_kind: link.entity_kind,
                    name: endpoint.name().to_string(),
                    send_rate_ms: rate,
                    last_send_at: None,
                    computed_rate_ms: None,
                    latency_ms: None,
                    consecutive_failures: 0,
                    last_payload: None,
                    last_mqtt_payload: None,
                    deliveries: Vec::new(),
                    last_error: None,
                });
                health_targets.push((link.clone(), endpoint.clone()));
                tasks.push(tokio::spawn(send_loop(
                    rt.clone(),
                    junction.clone(),
                    link,
                    endpoint,
                    rate,
                    token.child_token(),
                )));
            }
        }
    }

    if junction.enable_health_check && !health_targets.is_empty() {
        tasks.push(tokio::spawn(health_loop(
            rt.clone(),
            junction.clone(),
            health_targets,
            token.child_token(),
        )));
    }

    tracing::info!(
        "[scheduler] '{}' running with {} task(s)",
        junction.name,
        tasks.len()
    );
    RunningJunction { token, tasks }
}

fn new_poller(rt: &Runtime, link: &Link, rate_ms: u64) -> ActivePoller {
    ActivePoller {
        junction_id: link.junction_id,
        link_id: link.id,
        entity_id: link.entity_id,
        entity_kind: link.entity_kind,
        name: rt.catalog.entity_name(link.entity_kind, link.entity_id),
        poll_rate_ms: rate_ms,
        last_poll_at: None,
        computed_rate_ms: None,
        latency_ms: None,
        sensor_count: rt.sensors.known_external_ids(link.junction_id, link.id).len(),
        consecutive_failures: 0,
        last_payload: None,
        last_error: None,
    }
}

fn resolve_endpoint(rt: &Runtime, junction: &Junction, link: &Link) -> Option<Endpoint> {
    let endpoint = match link.entity_kind {
        EntityKind::Device => rt.catalog.device(link.entity_id).map(|device| {
            let broker = (junction.junction_type == JunctionType::Mqtt).then(|| {
                let key = device
                    .broker_collector_id
                    .and_then(|cid| rt.catalog.collector(cid).ok())
                    .map(|c| BrokerKey::for_collector(&c, &rt.config.mqtt))
                    .unwrap_or_else(|| BrokerKey::default_broker(&rt.config.mqtt));
                rt.transports.mqtt.acquire(&key)
            });
            let serial = (junction.junction_type == JunctionType::Com)
                .then(|| rt.transports.serial.acquire(&device.address));
            Endpoint::Device { device, broker, serial }
        }),
        EntityKind::Collector => rt.catalog.collector(link.entity_id).map(Endpoint::Collector),
    };
    match endpoint {
        Ok(e) => Some(e),
        Err(e) => {
            tracing::warn!("[scheduler] '{}' skips target link {}: {e}", junction.name, link.id);
            None
        }
    }
}

fn build_driver(rt: &Runtime, link: &Link) -> Result<Driver, String> {
    match link.entity_kind {
        EntityKind::Device => {
            let device = rt.catalog.device(link.entity_id).map_err(|e| e.to_string())?;
            Driver::for_device(&device, &rt.transports).map_err(|e| e.to_string())
        }
        EntityKind::Collector => {
            let collector = rt.catalog.collector(link.entity_id).map_err(|e| e.to_string())?;
            Driver::for_collector(&collector, &rt.transports, &rt.config.mqtt).map_err(|e| e.to_string())
        }
    }
}

/// Counts the cycle in the ledger and raises notifications on transitions.
async fn settle(rt: &Runtime, junction: &Junction, link: &Link, check: Check, error: Option<&str>) {
    let Some(next) = rt
        .status
        .note_result(junction.id, link.id, check, error.is_none(), junction.retry_count)
    else {
        return;
    };
    match next {
        JunctionStatus::Error => {
            let message = format!(
                "link {} failed more than {} time(s) in a row: {}",
                link.id,
                junction.retry_count,
                error.unwrap_or("unknown error")
            );
            tracing::warn!("[scheduler] '{}' entered Error: {message}", junction.name);
            if junction.enable_notifications {
                rt.notifier.raise(junction, Level::Error, message).await;
            }
        }
        JunctionStatus::Running => {
            tracing::info!("[scheduler] '{}' recovered", junction.name);
            if junction.enable_notifications {
                rt.notifier.raise(junction, Level::Info, "recovered").await;
            }
        }
        JunctionStatus::Idle => {}
    }
}

async fn poll_failed(rt: &Runtime, junction: &Junction, link: &Link, latency_ms: Option<u64>, error: String) {
    tracing::debug!("[scheduler] poll of link {} failed: {error}", link.id);
    rt.status.record_poll(
        junction.id,
        link.id,
        PollReport { latency_ms: latency_ms.unwrap_or_default(), error: Some(error.clone()), ..PollReport::default() },
    );
    settle(rt, junction, link, Check::Cycle, Some(&error)).await;
}

/// Builds and starts the driver lazily, so a Source that is not ready yet
/// is retried like any other failed poll.
async fn poll_loop(
    rt: Arc<Runtime>,
    junction: Arc<Junction>,
    link: Link,
    rate_ms: u64,
    token: CancellationToken,
) {
    let retry = Duration::from_millis(junction.retry_interval_ms);
    let mut driver: Option<Driver> = None;
    let mut started = false;
    let mut ticker = interval(Duration::from_millis(rate_ms));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {}
        }
        if driver.is_none() {
            match build_driver(&rt, &link) {
                Ok(d) => {
                    tracing::debug!("[scheduler] link {} polls a {} driver", link.id, d.kind());
                    driver = Some(d);
                }
                Err(e) => {
                    poll_failed(&rt, &junction, &link, None, e).await;
                    ticker.reset_after(retry);
                    continue;
                }
            }
        }
        let Some(active) = driver.as_ref() else { continue };
        if !started {
            match active.start().await {
                Ok(()) => started = true,
                Err(e) => {
                    poll_failed(&rt, &junction, &link, None, e.to_string()).await;
                    ticker.reset_after(retry);
                    continue;
                }
            }
        }

        let t0 = Instant::now();
        let result = tokio::select! {
            _ = token.cancelled() => break,
            r = active.poll() => r,
        };
        let latency_ms = t0.elapsed().as_millis() as u64;

        match result {
            Ok(readings) => {
                // First contact discovers the link's sensors; later readings need an import.
                let discover = rt.sensors.known_external_ids(junction.id, link.id).is_empty();
                rt.sensors.apply_poll(junction.id, link.id, &readings, discover);
                let sensor_count = rt.sensors.known_external_ids(junction.id, link.id).len();
                let payload = serde_json::to_value(&readings).ok();
                rt.status.record_poll(
                    junction.id,
                    link.id,
                    PollReport { latency_ms, sensor_count, payload, error: None },
                );
                settle(&rt, &junction, &link, Check::Cycle, None).await;
            }
            Err(e) => {
                poll_failed(&rt, &junction, &link, Some(latency_ms), e.to_string()).await;
                ticker.reset_after(retry);
            }
        }
    }
}

async fn send_loop(
    rt: Arc<Runtime>,
    junction: Arc<Junction>,
    link: Link,
    endpoint: Arc<Endpoint>,
    rate_ms: u64,
    token: CancellationToken,
) {
    let retry = Duration::from_millis(junction.retry_interval_ms);
    tokio::select! {
        _ = token.cancelled() => return,
        _ = dispatcher::warmup(&rt, &junction, &endpoint) => {}
    }
    let mut ticker = interval(Duration::from_millis(rate_ms));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let t0 = Instant::now();
        let outcome = tokio::select! {
            _ = token.cancelled() => break,
            o = dispatcher::send_cycle(&rt, &junction, &endpoint) => o,
        };
        if outcome.deliveries.is_empty() {
            continue;
        }
        let failed = outcome.failed();
        let error = outcome.error_summary();
        rt.status.record_send(
            junction.id,
            link.id,
            SendReport {
                latency_ms: t0.elapsed().as_millis() as u64,
                payload: outcome.payload,
                mqtt_payload: outcome.mqtt_payload,
                deliveries: outcome.deliveries,
                error: if failed { error.clone() } else { None },
            },
        );
        if failed {
            settle(&rt, &junction, &link, Check::Cycle, error.as_deref()).await;
            ticker.reset_after(retry);
        } else {
            settle(&rt, &junction, &link, Check::Cycle, None).await;
        }
    }
}

async fn health_loop(
    rt: Arc<Runtime>,
    junction: Arc<Junction>,
    targets: Vec<(Link, Arc<Endpoint>)>,
    token: CancellationToken,
) {
    let mut ticker = interval(Duration::from_millis(junction.health_check_interval_ms));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {}
        }
        for (link, endpoint) in &targets {
            let result = tokio::select! {
                _ = token.cancelled() => return,
                r = dispatcher::check_health(&rt, &junction, endpoint) => r,
            };
            let error = result.err().map(|e| format!("health check: {e}"));
            if let Some(e) = &error {
                tracing::debug!("[scheduler] {} unhealthy: {e}", endpoint.name());
            }
            settle(&rt, &junction, link, Check::Health, error.as_deref()).await;
        }
    }
}
