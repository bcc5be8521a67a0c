/**
 * JUNCTION ENGINE - Facade over catalog, registry, supervisor and store
 *
 * ROLE:
 * Every control API operation goes through `Engine`. It validates against
 * the catalog, keeps the sensor registry in step with link changes, restarts
 * running junctions whose configuration changed and persists the catalog
 * after each mutation.
 *
 * SHARED RUNTIME:
 * `Runtime` is the part the scheduler tasks hold on to (catalog, sensors,
 * status, transports, notifier). It is built once and shared behind an Arc.
 */

use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;

use crate::collectors::Driver;
use crate::config::KernelConfig;
use crate::catalog::Catalog;
use crate::error::{EngineError, EngineResult};
use crate::models::{
    ActivePoller, ActiveStream, Collector, CollectorId, CollectorType, Device, DeviceId, EntityKind,
    Junction, JunctionExport, JunctionId, JunctionLinks, JunctionStatus, Link, LinkId, LinkInput,
    LinkRateUpdate, LinkRole, MqttSubscription, RunningStatus, Sensor, SensorId, SensorReading,
    SensorTarget, SensorUpdate, SortOrderUpdate,
};
use crate::notifications::{Notification, Notifier};
use crate::sensors::SensorRegistry;
use crate::state::IdGen;
use crate::status::StatusAggregator;
use crate::store::{CatalogSnapshot, JsonStore};
use crate::supervisor::Supervisor;
use crate::transport::mqtt::BrokerKey;
use crate::transport::Transports;

pub struct Runtime {
    pub config: KernelConfig,
    pub ids: Arc<IdGen>,
    pub catalog: Catalog,
    pub sensors: SensorRegistry,
    pub status: StatusAggregator,
    pub transports: Transports,
    pub notifier: Notifier,
}

impl Runtime {
    pub fn new(config: KernelConfig, snapshot: &CatalogSnapshot, transports: Transports) -> Arc<Self> {
        let ids = Arc::new(IdGen::new(snapshot.next_id));
        ids.observe(snapshot.max_id());
        let notifier = Notifier::new(
            config.engine.notification_history,
            config.engine.notification_topic.clone(),
            transports.mqtt.clone(),
            BrokerKey::default_broker(&config.mqtt),
        );
        Arc::new(Self {
            catalog: Catalog::restore(ids.clone(), snapshot),
            sensors: SensorRegistry::restore(ids.clone(), &snapshot.sensors, &snapshot.sensor_targets),
            status: StatusAggregator::new(),
            transports,
            notifier,
            ids,
            config,
        })
    }

    fn snapshot(&self) -> CatalogSnapshot {
        let mut snapshot = CatalogSnapshot {
            next_id: self.ids.peek(),
            ..CatalogSnapshot::default()
        };
        self.catalog.fill_snapshot(&mut snapshot);
        let (sensors, targets) = self.sensors.snapshot();
        snapshot.sensors = sensors;
        snapshot.sensor_targets = targets;
        snapshot
    }
}

/// Counters for `/api/system/health`.
#[derive(Debug, Clone, Copy)]
pub struct EngineCounts {
    pub junctions_total: usize,
    pub junctions_running: usize,
    pub junctions_error: usize,
    pub broker_connections: usize,
}

pub struct Engine {
    rt: Arc<Runtime>,
    supervisor: Supervisor,
    store: Option<JsonStore>,
}

impl Engine {
    pub fn new(rt: Arc<Runtime>, store: Option<JsonStore>) -> Self {
        Self {
            rt,
            supervisor: Supervisor::new(),
            store,
        }
    }

    /// Loads the catalog from `store` and builds the engine around it.
    pub async fn open(config: KernelConfig, transports: Transports, store: JsonStore) -> EngineResult<Self> {
        let snapshot = store.load().await?;
        tracing::info!(
            "[engine] catalog {}: {} junction(s), {} device(s), {} collector(s)",
            store.path().display(),
            snapshot.junctions.len(),
            snapshot.devices.len(),
            snapshot.collectors.len()
        );
        let rt = Runtime::new(config, &snapshot, transports);
        Ok(Self::new(rt, Some(store)))
    }

    pub fn runtime(&self) -> &Arc<Runtime> {
        &self.rt
    }

    async fn persist(&self) -> EngineResult<()> {
        if let Some(store) = &self.store {
            store.save(&self.rt.snapshot()).await?;
        }
        Ok(())
    }

    fn with_live_status(&self, mut junction: Junction) -> Junction {
        junction.status = self.rt.status.status(junction.id);
        junction
    }

    fn junctions_using(&self, kind: EntityKind, entity_id: u64) -> Vec<JunctionId> {
        self
            .rt
            .catalog
            .list_junctions()
            .into_iter()
            .filter(|j| {
                self.rt
                    .catalog
                    .links_of(j.id)
                    .iter()
                    .any(|l| l.entity_kind == kind && l.entity_id == entity_id)
            })
            .map(|j| j.id)
            .collect()
    }

    async fn restart_all(&self, ids: &[JunctionId]) -> EngineResult<()> {
        for id in ids {
            self.supervisor.restart_if_running(&self.rt, *id).await?;
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Devices & collectors
    // -----------------------------------------------------------------------

    pub fn list_devices(&self) -> Vec<Device> {
        self.rt.catalog.list_devices()
    }

    pub fn device(&self, id: DeviceId) -> EngineResult<Device> {
        self.rt.catalog.device(id)
    }

    pub async fn create_device(&self, mut device: Device) -> EngineResult<Device> {
        self.fill_device_rates(&mut device);
        let device = self.rt.catalog.create_device(device)?;
        self.persist().await?;
        Ok(device)
    }

    pub async fn update_device(&self, id: DeviceId, mut device: Device) -> EngineResult<Device> {
        self.fill_device_rates(&mut device);
        let device = self.rt.catalog.update_device(id, device)?;
        self.restart_all(&self.junctions_using(EntityKind::Device, id)).await?;
        self.persist().await?;
        Ok(device)
    }

    pub async fn delete_device(&self, id: DeviceId) -> EngineResult<Device> {
        let device = self.rt.catalog.delete_device(id)?;
        self.persist().await?;
        Ok(device)
    }

    fn fill_device_rates(&self, device: &mut Device) {
        let engine = &self.rt.config.engine;
        if device.poll_rate_ms == 0 {
            device.poll_rate_ms = engine.default_poll_rate_ms;
        }
        if device.send_rate_ms == 0 {
            device.send_rate_ms = engine.default_send_rate_ms;
        }
    }

    pub fn list_collectors(&self) -> Vec<Collector> {
        self.rt.catalog.list_collectors()
    }

    pub fn collector(&self, id: CollectorId) -> EngineResult<Collector> {
        self.rt.catalog.collector(id)
    }

    pub async fn create_collector(&self, mut collector: Collector) -> EngineResult<Collector> {
        self.fill_collector_rates(&mut collector);
        let collector = self.rt.catalog.create_collector(collector)?;
        self.persist().await?;
        Ok(collector)
    }

    pub async fn update_collector(&self, id: CollectorId, mut collector: Collector) -> EngineResult<Collector> {
        self.fill_collector_rates(&mut collector);
        let collector = self.rt.catalog.update_collector(id, collector)?;
        self.restart_all(&self.junctions_using(EntityKind::Collector, id)).await?;
        self.persist().await?;
        Ok(collector)
    }

    pub async fn delete_collector(&self, id: CollectorId) -> EngineResult<Collector> {
        let collector = self.rt.catalog.delete_collector(id)?;
        self.persist().await?;
        Ok(collector)
    }

    fn fill_collector_rates(&self, collector: &mut Collector) {
        let engine = &self.rt.config.engine;
        if collector.poll_rate_ms == 0 {
            collector.poll_rate_ms = engine.default_poll_rate_ms;
        }
        if collector.send_rate_ms == 0 {
            collector.send_rate_ms = engine.default_send_rate_ms;
        }
    }

    // -----------------------------------------------------------------------
    // MQTT subscriptions
    // -----------------------------------------------------------------------

    fn mqtt_collector(&self, id: CollectorId) -> EngineResult<Collector> {
        let collector = self.rt.catalog.collector(id)?;
        if collector.collector_type != CollectorType::Mqtt {
            return Err(EngineError::bad_request(format!(
                "collector '{}' is not an MQTT collector",
                collector.name
            )));
        }
        Ok(collector)
    }

    /// Stores the subscription and applies it right away when the broker
    /// connection is already open. Re-subscribing a topic updates its QoS.
    pub async fn subscribe(&self, id: CollectorId, sub: MqttSubscription) -> EngineResult<Vec<MqttSubscription>> {
        if sub.topic.trim().is_empty() {
            return Err(EngineError::bad_request("topic is required"));
        }
        if sub.qos > 2 {
            return Err(EngineError::bad_request(format!("invalid MQTT qos {}", sub.qos)));
        }
        let collector = self.mqtt_collector(id)?;
        let mut subs = collector.subscriptions.clone();
        match subs.iter_mut().find(|s| s.topic == sub.topic) {
            Some(existing) => existing.qos = sub.qos,
            None => subs.push(sub.clone()),
        }
        self.rt.catalog.set_subscriptions(id, subs.clone())?;

        let key = BrokerKey::for_collector(&collector, &self.rt.config.mqtt);
        if let Some(conn) = self.rt.transports.mqtt.get(&key) {
            if let Err(e) = conn.subscribe(&sub.topic, sub.qos).await {
                tracing::warn!("[mqtt] live subscribe {} on {key} failed: {e}", sub.topic);
            }
        }
        self.persist().await?;
        Ok(subs)
    }

    pub async fn unsubscribe(&self, id: CollectorId, topic: &str) -> EngineResult<Vec<MqttSubscription>> {
        let collector = self.mqtt_collector(id)?;
        let mut subs = collector.subscriptions.clone();
        let before = subs.len();
        subs.retain(|s| s.topic != topic);
        if subs.len() == before {
            return Err(EngineError::not_found(format!("subscription {topic}")));
        }
        self.rt.catalog.set_subscriptions(id, subs.clone())?;

        let key = BrokerKey::for_collector(&collector, &self.rt.config.mqtt);
        if let Some(conn) = self.rt.transports.mqtt.get(&key) {
            if let Err(e) = conn.unsubscribe(topic).await {
                tracing::warn!("[mqtt] live unsubscribe {topic} on {key} failed: {e}");
            }
        }
        self.persist().await?;
        Ok(subs)
    }

    pub fn subscriptions(&self, id: CollectorId) -> EngineResult<Vec<MqttSubscription>> {
        Ok(self.mqtt_collector(id)?.subscriptions)
    }

    // -----------------------------------------------------------------------
    // Junctions
    // -----------------------------------------------------------------------

    pub fn list_junctions(&self) -> Vec<Junction> {
        self.rt
            .catalog
            .list_junctions()
            .into_iter()
            .map(|j| self.with_live_status(j))
            .collect()
    }

    pub fn junction(&self, id: JunctionId) -> EngineResult<Junction> {
        Ok(self.with_live_status(self.rt.catalog.junction(id)?))
    }

    /// Fields missing from `body` take the engine's defaults.
    pub async fn create_junction(&self, body: Value) -> EngineResult<Junction> {
        let engine = &self.rt.config.engine;
        let template = Junction {
            retry_count: engine.default_retry_count,
            retry_interval_ms: engine.default_retry_interval_ms,
            health_check_interval_ms: engine.default_health_interval_ms,
            ..Junction::default()
        };
        let junction = self.rt.catalog.create_junction(merge(template, body)?)?;
        tracing::info!("[engine] created junction '{}' ({})", junction.name, junction.id);
        self.persist().await?;
        Ok(junction)
    }

    /// Partial update: fields missing from `body` keep their current value.
    pub async fn update_junction(&self, id: JunctionId, body: Value) -> EngineResult<Junction> {
        let current = self.rt.catalog.junction(id)?;
        let junction = self.rt.catalog.update_junction(id, merge(current, body)?)?;
        self.supervisor.restart_if_running(&self.rt, id).await?;
        self.persist().await?;
        Ok(self.with_live_status(junction))
    }

    pub async fn delete_junction(&self, id: JunctionId) -> EngineResult<Junction> {
        self.rt.catalog.junction(id)?;
        self.supervisor.remove(&self.rt, id).await;
        let (junction, links) = self.rt.catalog.delete_junction(id)?;
        self.rt.sensors.remove_junction(id);
        tracing::info!("[engine] deleted junction '{}' and {} link(s)", junction.name, links.len());
        self.persist().await?;
        Ok(junction)
    }

    pub async fn clone_junction(&self, id: JunctionId) -> EngineResult<Junction> {
        let (copy, link_map) = self.rt.catalog.clone_junction(id)?;
        let (sensors, targets) = self.rt.sensors.export(id);
        self.rt.sensors.copy_in(copy.id, &sensors, &targets, &link_map);
        self.persist().await?;
        Ok(copy)
    }

    pub async fn update_sort_order(&self, updates: &[SortOrderUpdate]) -> EngineResult<()> {
        self.rt.catalog.update_sort_order(updates)?;
        self.persist().await
    }

    pub fn export_junction(&self, id: JunctionId) -> EngineResult<JunctionExport> {
        let junction = self.junction(id)?;
        let (sensors, sensor_targets) = self.rt.sensors.export(id);
        Ok(JunctionExport {
            junction,
            links: self.rt.catalog.links_of(id),
            sensors,
            sensor_targets,
        })
    }

    pub async fn import_junction(&self, doc: JunctionExport) -> EngineResult<Junction> {
        let (junction, link_map) = self.rt.catalog.import_junction(doc.junction, doc.links)?;
        self.rt
            .sensors
            .copy_in(junction.id, &doc.sensors, &doc.sensor_targets, &link_map);
        self.persist().await?;
        Ok(junction)
    }

    // -----------------------------------------------------------------------
    // Links
    // -----------------------------------------------------------------------

    pub fn links(&self, junction_id: JunctionId) -> EngineResult<JunctionLinks> {
        self.rt.catalog.links(junction_id)
    }

    pub async fn add_link(&self, junction_id: JunctionId, kind: EntityKind, input: LinkInput) -> EngineResult<Link> {
        let link = self.rt.catalog.add_link(junction_id, kind, input)?;
        self.supervisor.restart_if_running(&self.rt, junction_id).await?;
        self.persist().await?;
        Ok(link)
    }

    /// Source links take their discovered sensors along; the last Target link
    /// of a device takes the device's fan-out edges along.
    pub async fn remove_link(&self, junction_id: JunctionId, kind: EntityKind, link_id: LinkId) -> EngineResult<Link> {
        let link = self.rt.catalog.remove_link(junction_id, kind, link_id)?;
        match link.role {
            LinkRole::Source => self.rt.sensors.remove_link(junction_id, link.id),
            LinkRole::Target if kind == EntityKind::Device => {
                let still_target = self.rt.catalog.links_of(junction_id).iter().any(|l| {
                    l.entity_kind == EntityKind::Device && l.entity_id == link.entity_id && l.role == LinkRole::Target
                });
                if !still_target {
                    self.rt.sensors.drop_device_edges(junction_id, link.entity_id);
                }
            }
            LinkRole::Target => {}
        }
        self.supervisor.restart_if_running(&self.rt, junction_id).await?;
        self.persist().await?;
        Ok(link)
    }

    pub async fn update_link(
        &self,
        junction_id: JunctionId,
        kind: EntityKind,
        link_id: LinkId,
        update: LinkRateUpdate,
    ) -> EngineResult<Link> {
        let link = self.rt.catalog.update_link_rates(junction_id, kind, link_id, update)?;
        self.supervisor.restart_if_running(&self.rt, junction_id).await?;
        self.persist().await?;
        Ok(link)
    }

    // -----------------------------------------------------------------------
    // Sensors & fan-out
    // -----------------------------------------------------------------------

    pub fn available_sensors(&self, junction_id: JunctionId) -> EngineResult<Vec<Sensor>> {
        self.rt.catalog.junction(junction_id)?;
        Ok(self.rt.sensors.list(junction_id))
    }

    pub async fn select_sensor(&self, sensor_id: SensorId, selected: bool) -> EngineResult<Sensor> {
        let sensor = self.rt.sensors.set_selected(sensor_id, selected)?;
        self.persist().await?;
        Ok(sensor)
    }

    pub async fn update_sensor(&self, update: &SensorUpdate) -> EngineResult<Sensor> {
        let sensor = self.rt.sensors.update(update)?;
        self.persist().await?;
        Ok(sensor)
    }

    fn target_device(&self, junction_id: JunctionId, device_id: DeviceId) -> EngineResult<Device> {
        self.rt.catalog.junction(junction_id)?;
        let device = self.rt.catalog.device(device_id)?;
        let linked = self
            .rt
            .catalog
            .links_of(junction_id)
            .iter()
            .any(|l| l.entity_kind == EntityKind::Device && l.entity_id == device_id && l.role == LinkRole::Target);
        if !linked {
            return Err(EngineError::bad_request(format!(
                "device '{}' is not a target of junction {junction_id}",
                device.name
            )));
        }
        Ok(device)
    }

    pub async fn assign_target(
        &self,
        junction_id: JunctionId,
        sensor_id: SensorId,
        device_id: DeviceId,
    ) -> EngineResult<Vec<SensorTarget>> {
        self.target_device(junction_id, device_id)?;
        let edges = self.rt.sensors.assign_target(junction_id, sensor_id, device_id)?;
        self.persist().await?;
        Ok(edges)
    }

    pub async fn assign_screen(
        &self,
        junction_id: JunctionId,
        sensor_id: SensorId,
        device_id: DeviceId,
        screen_id: &str,
    ) -> EngineResult<Vec<SensorTarget>> {
        let device = self.target_device(junction_id, device_id)?;
        if !device.screens.is_empty() && !device.screens.iter().any(|s| s.screen_key == screen_id) {
            return Err(EngineError::bad_request(format!(
                "device '{}' has no screen '{screen_id}'",
                device.name
            )));
        }
        let edges = self
            .rt
            .sensors
            .assign_screen(junction_id, sensor_id, device_id, screen_id)?;
        self.persist().await?;
        Ok(edges)
    }

    pub async fn remove_target(
        &self,
        junction_id: JunctionId,
        sensor_id: SensorId,
        device_id: DeviceId,
    ) -> EngineResult<Vec<SensorTarget>> {
        let edges = self.rt.sensors.remove_target(junction_id, sensor_id, device_id)?;
        self.persist().await?;
        Ok(edges)
    }

    pub async fn remove_screen(
        &self,
        junction_id: JunctionId,
        sensor_id: SensorId,
        device_id: DeviceId,
        screen_id: &str,
    ) -> EngineResult<Vec<SensorTarget>> {
        let edges = self
            .rt
            .sensors
            .remove_screen(junction_id, sensor_id, device_id, screen_id)?;
        self.persist().await?;
        Ok(edges)
    }

    /// Writes values straight into the registry; works without any Source.
    pub async fn inject(&self, junction_id: JunctionId, readings: Vec<SensorReading>) -> EngineResult<Vec<Sensor>> {
        self.rt.catalog.junction(junction_id)?;
        if readings.iter().any(|r| r.external_id.trim().is_empty()) {
            return Err(EngineError::bad_request("every reading needs an externalId"));
        }
        let readings: Vec<SensorReading> = readings
            .into_iter()
            .map(|mut r| {
                if r.name.is_empty() {
                    r.name = r.external_id.clone();
                }
                r
            })
            .collect();
        let sensors = self.rt.sensors.import(junction_id, None, &readings, true);
        self.persist().await?;
        Ok(sensors)
    }

    pub fn live_sensors(&self, junction_id: JunctionId) -> EngineResult<Vec<Sensor>> {
        self.available_sensors(junction_id)
    }

    // -----------------------------------------------------------------------
    // Fetch new sensors
    // -----------------------------------------------------------------------

    async fn source_driver(&self, junction_id: JunctionId, link_id: LinkId) -> EngineResult<Driver> {
        let link = self.rt.catalog.link(junction_id, link_id)?;
        if link.role != LinkRole::Source {
            return Err(EngineError::bad_request(format!("link {link_id} is not a Source")));
        }
        let driver = match link.entity_kind {
            EntityKind::Device => Driver::for_device(&self.rt.catalog.device(link.entity_id)?, &self.rt.transports),
            EntityKind::Collector => Driver::for_collector(
                &self.rt.catalog.collector(link.entity_id)?,
                &self.rt.transports,
                &self.rt.config.mqtt,
            ),
        }
        .map_err(|e| EngineError::bad_request(e.to_string()))?;
        driver
            .start()
            .await
            .map_err(|e| EngineError::Upstream(e.to_string()))?;
        Ok(driver)
    }

    /// Readings the link's driver reports that the registry does not know yet.
    pub async fn delta(&self, junction_id: JunctionId, link_id: LinkId) -> EngineResult<Vec<SensorReading>> {
        let driver = self.source_driver(junction_id, link_id).await?;
        let known: HashSet<String> = self.rt.sensors.known_external_ids(junction_id, link_id);
        driver
            .delta(&known)
            .await
            .map_err(|e| EngineError::Upstream(e.to_string()))
    }

    /// Imports the delta as unselected sensors.
    pub async fn import_delta(&self, junction_id: JunctionId, link_id: LinkId) -> EngineResult<Vec<Sensor>> {
        let fresh = self.delta(junction_id, link_id).await?;
        let sensors = self.rt.sensors.import(junction_id, Some(link_id), &fresh, false);
        tracing::info!("[engine] imported {} sensor(s) from link {link_id}", sensors.len());
        self.persist().await?;
        Ok(sensors)
    }

    // -----------------------------------------------------------------------
    // Runtime control & status
    // -----------------------------------------------------------------------

    pub async fn start(&self, id: JunctionId) -> EngineResult<JunctionStatus> {
        self.supervisor.start(&self.rt, id).await
    }

    pub async fn stop(&self, id: JunctionId) -> EngineResult<JunctionStatus> {
        self.rt.catalog.junction(id)?;
        Ok(self.supervisor.stop(&self.rt, id).await)
    }

    pub fn running(&self) -> Vec<RunningStatus> {
        self.rt.status.running_statuses()
    }

    pub fn streams(&self) -> Vec<ActiveStream> {
        self.rt.status.streams()
    }

    pub fn pollers(&self) -> Vec<ActivePoller> {
        self.rt.status.pollers()
    }

    pub fn notifications(&self) -> Vec<Notification> {
        self.rt.notifier.list()
    }

    pub fn counts(&self) -> EngineCounts {
        EngineCounts {
            junctions_total: self.rt.catalog.junction_count(),
            junctions_running: self.rt.status.running_count(),
            junctions_error: self.rt.status.error_count(),
            broker_connections: self.rt.transports.mqtt.open_connections(),
        }
    }

    /// Starts every junction flagged `autoStartOnLaunch`.
    pub async fn autostart(&self) -> usize {
        let mut started = 0;
        for junction in self.rt.catalog.list_junctions() {
            if !junction.auto_start_on_launch {
                continue;
            }
            match self.start(junction.id).await {
                Ok(_) => started += 1,
                Err(e) => tracing::warn!("[engine] autostart of '{}' failed: {e}", junction.name),
            }
        }
        started
    }

    /// Stops every junction, waiting for in-flight cycles, then saves.
    pub async fn shutdown(&self) {
        self.supervisor.stop_all(&self.rt).await;
        if let Err(e) = self.persist().await {
            tracing::error!("[engine] final save failed: {e}");
        }
    }
}

/// Overlays the JSON object `patch` on `base`.
fn merge<T>(base: T, patch: Value) -> EngineResult<T>
where
    T: serde::Serialize + serde::de::DeserializeOwned,
{
    let Value::Object(patch) = patch else {
        return Err(EngineError::bad_request("expected a JSON object"));
    };
    let mut value = serde_json::to_value(base).map_err(|e| EngineError::Internal(e.to_string()))?;
    if let Value::Object(fields) = &mut value {
        for (k, v) in patch {
            if k != "id" && k != "status" {
                fields.insert(k, v);
            }
        }
    }
    serde_json::from_value(value).map_err(|e| EngineError::bad_request(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::models::{JunctionType, Screen, SensorValue};
    use crate::transport::mqtt::tests::mock_pool;
    use relay_devkit::{MockDevice, MockMqttClient, TestHarness};
    use serde_json::json;
    use std::time::Duration;

    fn engine_with(client: MockMqttClient, store: Option<JsonStore>) -> Engine {
        let cfg = KernelConfig::default();
        let transports = Transports::new(&cfg).unwrap().with_mqtt_pool(mock_pool(client));
        Engine::new(Runtime::new(cfg, &CatalogSnapshot::default(), transports), store)
    }

    fn engine() -> Engine {
        engine_with(MockMqttClient::new(), None)
    }

    fn target(entity_id: u64) -> LinkInput {
        LinkInput { entity_id, role: LinkRole::Target, poll_rate_override_ms: None, send_rate_override_ms: None }
    }

    #[tokio::test]
    async fn test_create_uses_config_defaults_and_update_is_partial() {
        let engine = engine();
        let j = engine.create_junction(json!({"name": "Desk", "type": "MQTT"})).await.unwrap();
        assert_eq!(j.junction_type, JunctionType::Mqtt);
        assert_eq!(j.retry_interval_ms, 5_000);

        let j = engine
            .update_junction(j.id, json!({"description": "office", "status": "Error"}))
            .await
            .unwrap();
        assert_eq!(j.name, "Desk");
        assert_eq!(j.description.as_deref(), Some("office"));
        assert_eq!(j.status, JunctionStatus::Idle);

        let err = engine.create_junction(json!({"name": "desk"})).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);
    }

    #[tokio::test]
    async fn test_status_reflects_start_and_stop() {
        let engine = engine();
        let j = engine.create_junction(json!({"name": "Manual"})).await.unwrap();
        assert_eq!(engine.stop(j.id).await.unwrap(), JunctionStatus::Idle);
        assert_eq!(engine.start(j.id).await.unwrap(), JunctionStatus::Running);
        assert_eq!(engine.junction(j.id).unwrap().status, JunctionStatus::Running);
        assert_eq!(engine.running().len(), 1);
        engine.stop(j.id).await.unwrap();
        assert_eq!(engine.junction(j.id).unwrap().status, JunctionStatus::Idle);
        assert_eq!(engine.stop(999).await.unwrap_err().kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_autostart_starts_only_flagged_junctions() {
        let engine = engine();
        let boot = engine
            .create_junction(json!({"name": "Boot", "autoStartOnLaunch": true}))
            .await
            .unwrap();
        let manual = engine.create_junction(json!({"name": "Manual"})).await.unwrap();

        assert_eq!(engine.autostart().await, 1);
        assert_eq!(engine.junction(boot.id).unwrap().status, JunctionStatus::Running);
        assert_eq!(engine.junction(manual.id).unwrap().status, JunctionStatus::Idle);
        assert_eq!(engine.counts().junctions_running, 1);
        engine.shutdown().await;
        assert!(engine.running().is_empty());
    }

    #[tokio::test]
    async fn test_assign_target_requires_target_link() {
        let engine = engine();
        let j = engine.create_junction(json!({"name": "Fan"})).await.unwrap();
        let d = engine
            .create_device(Device {
                name: "panel".into(),
                address: "10.0.0.9".into(),
                screens: vec![Screen { screen_key: "main".into(), display_name: None }],
                ..Device::default()
            })
            .await
            .unwrap();
        let sensor = engine
            .inject(j.id, vec![SensorReading::new("cpu", SensorValue::Number(3.0))])
            .await
            .unwrap()
            .remove(0);

        let err = engine.assign_target(j.id, sensor.id, d.id).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BadRequest);

        engine.add_link(j.id, EntityKind::Device, target(d.id)).await.unwrap();
        engine.assign_target(j.id, sensor.id, d.id).await.unwrap();
        let edges = engine.assign_target(j.id, sensor.id, d.id).await.unwrap();
        assert_eq!(edges.len(), 1);

        let err = engine.assign_screen(j.id, sensor.id, d.id, "nope").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BadRequest);
        let edges = engine.assign_screen(j.id, sensor.id, d.id, "main").await.unwrap();
        assert_eq!(edges[0].screen_id.as_deref(), Some("main"));

        // Removing the last target link drops the device's edges.
        let link = engine.links(j.id).unwrap().device_links.remove(0);
        engine.remove_link(j.id, EntityKind::Device, link.id).await.unwrap();
        assert!(engine.rt.sensors.targets_of(sensor.id).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_subscribe_list_unsubscribe() {
        let client = MockMqttClient::new();
        let engine = engine_with(client.clone(), None);
        let c = engine
            .create_collector(Collector {
                name: "broker".into(),
                collector_type: CollectorType::Mqtt,
                broker_host: Some("mqtt.lan".into()),
                ..Collector::default()
            })
            .await
            .unwrap();

        let sub = MqttSubscription { topic: "sensors/kitchen/temp".into(), qos: 1 };
        engine.subscribe(c.id, sub.clone()).await.unwrap();
        assert_eq!(engine.subscriptions(c.id).unwrap(), vec![sub.clone()]);

        let bad = MqttSubscription { topic: "x".into(), qos: 3 };
        assert_eq!(engine.subscribe(c.id, bad).await.unwrap_err().kind(), ErrorKind::BadRequest);

        engine.unsubscribe(c.id, "sensors/kitchen/temp").await.unwrap();
        assert!(engine.subscriptions(c.id).unwrap().is_empty());
        assert_eq!(
            engine.unsubscribe(c.id, "sensors/kitchen/temp").await.unwrap_err().kind(),
            ErrorKind::NotFound
        );
    }

    #[tokio::test]
    async fn test_delta_and_import_from_source_device() {
        let engine = engine();
        let upstream = MockDevice::start().await.unwrap();
        upstream.serve_json(
            "/data.json",
            &json!([
                {"Text": "A", "Type": "Load", "Value": "1", "SensorId": "a"},
                {"Text": "B", "Type": "Load", "Value": "2", "SensorId": "b"}
            ]),
        );
        let j = engine.create_junction(json!({"name": "Pull"})).await.unwrap();
        let d = engine
            .create_device(Device { name: "src".into(), address: upstream.address(), ..Device::default() })
            .await
            .unwrap();
        let link = engine
            .add_link(j.id, EntityKind::Device, LinkInput { role: LinkRole::Source, ..target(d.id) })
            .await
            .unwrap();

        assert_eq!(engine.delta(j.id, link.id).await.unwrap().len(), 2);
        let imported = engine.import_delta(j.id, link.id).await.unwrap();
        assert!(imported.iter().all(|s| !s.is_selected));
        assert!(engine.delta(j.id, link.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_clone_and_export_import_carry_sensors() {
        let engine = engine();
        let j = engine.create_junction(json!({"name": "Orig"})).await.unwrap();
        engine
            .inject(j.id, vec![SensorReading::new("t", SensorValue::Number(1.0))])
            .await
            .unwrap();

        let copy = engine.clone_junction(j.id).await.unwrap();
        assert_eq!(copy.name, "Orig (copy)");
        assert_eq!(engine.available_sensors(copy.id).unwrap().len(), 1);

        let doc = engine.export_junction(j.id).unwrap();
        let text = serde_json::to_string(&doc).unwrap();
        let imported = engine
            .import_junction(serde_json::from_str(&text).unwrap())
            .await
            .unwrap();
        assert_eq!(imported.name, "Orig (imported)");
        assert_eq!(engine.available_sensors(imported.id).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_rate_tester_reaches_http_and_mqtt_targets() {
        let mut harness = TestHarness::new();
        let idx = harness.spawn_device().await.unwrap();
        let engine = engine_with(harness.mqtt_client.clone(), None);

        let rate = engine
            .create_collector(Collector {
                name: "rate".into(),
                collector_type: CollectorType::RateTester,
                sensor_count: Some(2),
                ..Collector::default()
            })
            .await
            .unwrap();
        let source = LinkInput {
            entity_id: rate.id,
            role: LinkRole::Source,
            poll_rate_override_ms: Some(20),
            send_rate_override_ms: None,
        };
        let fast_target = |id| LinkInput { send_rate_override_ms: Some(20), ..target(id) };

        let http = engine
            .create_junction(json!({"name": "Http", "allTargetsAllData": true}))
            .await
            .unwrap();
        let panel = engine
            .create_device(Device { name: "panel".into(), address: harness.device(idx).address(), ..Device::default() })
            .await
            .unwrap();
        engine.add_link(http.id, EntityKind::Collector, source.clone()).await.unwrap();
        engine.add_link(http.id, EntityKind::Device, fast_target(panel.id)).await.unwrap();

        let mqtt = engine
            .create_junction(json!({"name": "Mqtt", "type": "MQTT", "allTargetsAllData": true}))
            .await
            .unwrap();
        let display = engine
            .create_device(Device {
                name: "display".into(),
                protocol: crate::models::DeviceProtocol::Mqtt,
                mqtt_topic: Some("display".into()),
                ..Device::default()
            })
            .await
            .unwrap();
        engine.add_link(mqtt.id, EntityKind::Collector, source).await.unwrap();
        engine.add_link(mqtt.id, EntityKind::Device, fast_target(display.id)).await.unwrap();

        engine.start(http.id).await.unwrap();
        engine.start(mqtt.id).await.unwrap();

        assert!(harness.device(idx).wait_for_frames("sensor", 1, Duration::from_secs(3)).await);
        harness.assert_device_got_tag(idx, "rate_0").unwrap();

        assert!(harness.wait_for_frame("display/data", 3_000).await.unwrap().is_some());
        harness.assert_frame_field("display/data", "type", &json!("sensor")).unwrap();
        assert!(harness.get_stats().topic_counts.contains_key("display/config"));

        engine.shutdown().await;
        assert!(engine.running().is_empty());
        assert_eq!(engine.counts().junctions_total, 2);
    }

    #[tokio::test]
    async fn test_catalog_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("catalog.json");
        let id = {
            let engine = engine_with(MockMqttClient::new(), Some(JsonStore::new(&path)));
            let j = engine.create_junction(json!({"name": "Kept"})).await.unwrap();
            engine
                .inject(j.id, vec![SensorReading::new("t", SensorValue::Number(2.0))])
                .await
                .unwrap();
            j.id
        };

        let cfg = KernelConfig::default();
        let transports = Transports::new(&cfg).unwrap().with_mqtt_pool(mock_pool(MockMqttClient::new()));
        let engine = Engine::open(cfg, transports, JsonStore::new(&path)).await.unwrap();
        assert_eq!(engine.junction(id).unwrap().name, "Kept");
        assert_eq!(engine.available_sensors(id).unwrap().len(), 1);
        let fresh = engine.create_junction(json!({"name": "New"})).await.unwrap();
        assert!(fresh.id > id);
    }
}
