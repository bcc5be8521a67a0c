/**
 * SENSOR REGISTRY - Known sensors per junction and their fan-out edges
 *
 * ROLE:
 * Poll cycles write values here, send cycles read them. Each junction has its
 * own read/write lock so polls and sends of one junction never contend with
 * another junction.
 *
 * FAN-OUT EDGES:
 * A SensorTarget is (sensorId, deviceId, screenId?). Assigning a device adds
 * a bare edge; assigning a screen replaces the bare edge; removing the last
 * screen of a device brings the bare edge back.
 */

use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use time::OffsetDateTime;

use crate::error::{EngineError, EngineResult};
use crate::models::{
    Device, DeviceId, JunctionId, LinkId, Sensor, SensorId, SensorReading, SensorTarget,
    SensorUpdate,
};
use crate::state::{new_rw_state, IdGen, SharedRw};

#[derive(Debug, Default)]
struct JunctionSensors {
    sensors: BTreeMap<SensorId, Sensor>,
    by_key: HashMap<(Option<LinkId>, String), SensorId>,
    targets: BTreeSet<SensorTarget>,
}

impl JunctionSensors {
    fn insert(&mut self, sensor: Sensor) {
        self.by_key
            .insert((sensor.source_link_id, sensor.external_id.clone()), sensor.id);
        self.sensors.insert(sensor.id, sensor);
    }

    fn next_sort_order(&self) -> i64 {
        self.sensors.values().map(|s| s.sort_order + 1).max().unwrap_or(0)
    }

    fn ordered(&self) -> Vec<Sensor> {
        let mut list: Vec<Sensor> = self.sensors.values().cloned().collect();
        list.sort_by_key(|s| (s.sort_order, s.id));
        list
    }

    fn has_edge(&self, sensor_id: SensorId, device_id: DeviceId) -> bool {
        self.targets
            .iter()
            .any(|t| t.sensor_id == sensor_id && t.device_id == device_id)
    }

    fn edges_of(&self, sensor_id: SensorId) -> Vec<SensorTarget> {
        self.targets
            .iter()
            .filter(|t| t.sensor_id == sensor_id)
            .cloned()
            .collect()
    }
}

/// One resolved delivery: the sensors a device (or one of its screens) receives.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub screen_id: Option<String>,
    pub sensors: Vec<Sensor>,
}

pub struct SensorRegistry {
    ids: Arc<IdGen>,
    junctions: RwLock<HashMap<JunctionId, SharedRw<JunctionSensors>>>,
    index: RwLock<HashMap<SensorId, JunctionId>>,
}

impl SensorRegistry {
    pub fn new(ids: Arc<IdGen>) -> Self {
        Self {
            ids,
            junctions: RwLock::new(HashMap::new()),
            index: RwLock::new(HashMap::new()),
        }
    }

    pub fn restore(ids: Arc<IdGen>, sensors: &[Sensor], targets: &[SensorTarget]) -> Self {
        let registry = Self::new(ids);
        for sensor in sensors {
            registry.index.write().insert(sensor.id, sensor.junction_id);
            registry.slot(sensor.junction_id).write().insert(sensor.clone());
        }
        for target in targets {
            if let Ok((_, slot)) = registry.locate(target.sensor_id) {
                slot.write().targets.insert(target.clone());
            }
        }
        registry
    }

    pub fn snapshot(&self) -> (Vec<Sensor>, Vec<SensorTarget>) {
        let mut sensors = Vec::new();
        let mut targets = Vec::new();
        for slot in self.junctions.read().values() {
            let data = slot.read();
            sensors.extend(data.sensors.values().cloned());
            targets.extend(data.targets.iter().cloned());
        }
        sensors.sort_by_key(|s| s.id);
        targets.sort();
        (sensors, targets)
    }

    fn slot(&self, junction_id: JunctionId) -> SharedRw<JunctionSensors> {
        if let Some(slot) = self.junctions.read().get(&junction_id) {
            return slot.clone();
        }
        self.junctions
            .write()
            .entry(junction_id)
            .or_insert_with(|| new_rw_state(JunctionSensors::default()))
            .clone()
    }

    fn existing(&self, junction_id: JunctionId) -> Option<SharedRw<JunctionSensors>> {
        self.junctions.read().get(&junction_id).cloned()
    }

    fn locate(&self, sensor_id: SensorId) -> EngineResult<(JunctionId, SharedRw<JunctionSensors>)> {
        let junction_id = self
            .index
            .read()
            .get(&sensor_id)
            .copied()
            .ok_or_else(|| EngineError::not_found(format!("sensor {sensor_id}")))?;
        let slot = self
            .existing(junction_id)
            .ok_or_else(|| EngineError::not_found(format!("sensor {sensor_id}")))?;
        Ok((junction_id, slot))
    }

    /// Like `locate`, but the sensor must belong to `junction_id`.
    fn locate_in(&self, junction_id: JunctionId, sensor_id: SensorId) -> EngineResult<SharedRw<JunctionSensors>> {
        match self.locate(sensor_id) {
            Ok((owner, slot)) if owner == junction_id => Ok(slot),
            _ => Err(EngineError::not_found(format!(
                "sensor {sensor_id} in junction {junction_id}"
            ))),
        }
    }

    fn new_sensor(&self, data: &JunctionSensors, junction_id: JunctionId, link: Option<LinkId>, r: &SensorReading, selected: bool) -> Sensor {
        Sensor {
            id: self.ids.next(),
            junction_id,
            source_link_id: link,
            external_id: r.external_id.clone(),
            name: if r.name.is_empty() { r.external_id.clone() } else { r.name.clone() },
            component_name: r.component_name.clone(),
            value: r.value.clone(),
            unit: r.unit.clone(),
            sort_order: data.next_sort_order(),
            sensor_tag: r.external_id.clone(),
            is_selected: selected,
            last_updated: Some(OffsetDateTime::now_utc()),
        }
    }

    /// Writes polled values into known sensors. Unknown readings are only
    /// created when `auto_import` is set. Returns how many sensors changed.
    pub fn apply_poll(
        &self,
        junction_id: JunctionId,
        link_id: LinkId,
        readings: &[SensorReading],
        auto_import: bool,
    ) -> usize {
        let slot = self.slot(junction_id);
        let mut data = slot.write();
        let now = OffsetDateTime::now_utc();
        let mut touched = 0;
        let mut created = Vec::new();
        for r in readings {
            let key = (Some(link_id), r.external_id.clone());
            match data.by_key.get(&key).copied() {
                Some(id) => {
                    if let Some(sensor) = data.sensors.get_mut(&id) {
                        sensor.value = r.value.clone();
                        sensor.last_updated = Some(now);
                        touched += 1;
                    }
                }
                None if auto_import => {
                    let sensor = self.new_sensor(&data, junction_id, Some(link_id), r, true);
                    created.push(sensor.id);
                    data.insert(sensor);
                    touched += 1;
                }
                None => {}
            }
        }
        drop(data);
        if !created.is_empty() {
            let mut index = self.index.write();
            for id in created {
                index.insert(id, junction_id);
            }
        }
        touched
    }

    /// Upserts readings (value refresh for known keys, new sensors otherwise).
    pub fn import(
        &self,
        junction_id: JunctionId,
        link_id: Option<LinkId>,
        readings: &[SensorReading],
        selected: bool,
    ) -> Vec<Sensor> {
        let slot = self.slot(junction_id);
        let mut data = slot.write();
        let now = OffsetDateTime::now_utc();
        let mut out = Vec::with_capacity(readings.len());
        let mut created = Vec::new();
        for r in readings {
            let key = (link_id, r.external_id.clone());
            let existing = data.by_key.get(&key).copied();
            match existing.and_then(|id| data.sensors.get_mut(&id)) {
                Some(sensor) => {
                    sensor.value = r.value.clone();
                    if !r.unit.is_empty() {
                        sensor.unit = r.unit.clone();
                    }
                    sensor.last_updated = Some(now);
                    out.push(sensor.clone());
                }
                None => {
                    let sensor = self.new_sensor(&data, junction_id, link_id, r, selected);
                    created.push(sensor.id);
                    out.push(sensor.clone());
                    data.insert(sensor);
                }
            }
        }
        drop(data);
        let mut index = self.index.write();
        for id in created {
            index.insert(id, junction_id);
        }
        out
    }

    pub fn known_external_ids(&self, junction_id: JunctionId, link_id: LinkId) -> HashSet<String> {
        let Some(slot) = self.existing(junction_id) else {
            return HashSet::new();
        };
        let data = slot.read();
        data.sensors
            .values()
            .filter(|s| s.source_link_id == Some(link_id))
            .map(|s| s.external_id.clone())
            .collect()
    }

    pub fn list(&self, junction_id: JunctionId) -> Vec<Sensor> {
        self.existing(junction_id)
            .map(|slot| slot.read().ordered())
            .unwrap_or_default()
    }

    pub fn count(&self, junction_id: JunctionId) -> usize {
        self.existing(junction_id)
            .map(|slot| slot.read().sensors.len())
            .unwrap_or(0)
    }

    pub fn get(&self, sensor_id: SensorId) -> EngineResult<Sensor> {
        let (_, slot) = self.locate(sensor_id)?;
        let data = slot.read();
        data.sensors
            .get(&sensor_id)
            .cloned()
            .ok_or_else(|| EngineError::not_found(format!("sensor {sensor_id}")))
    }

    pub fn set_selected(&self, sensor_id: SensorId, selected: bool) -> EngineResult<Sensor> {
        let (_, slot) = self.locate(sensor_id)?;
        let mut data = slot.write();
        let sensor = data
            .sensors
            .get_mut(&sensor_id)
            .ok_or_else(|| EngineError::not_found(format!("sensor {sensor_id}")))?;
        sensor.is_selected = selected;
        Ok(sensor.clone())
    }

    pub fn update(&self, update: &SensorUpdate) -> EngineResult<Sensor> {
        let (_, slot) = self.locate(update.id)?;
        let mut data = slot.write();
        let sensor = data
            .sensors
            .get_mut(&update.id)
            .ok_or_else(|| EngineError::not_found(format!("sensor {}", update.id)))?;
        if let Some(name) = &update.name {
            sensor.name = name.clone();
        }
        if let Some(tag) = &update.sensor_tag {
            if tag.trim().is_empty() {
                return Err(EngineError::bad_request("sensor tag cannot be empty"));
            }
            sensor.sensor_tag = tag.trim().to_string();
        }
        if let Some(order) = update.sort_order {
            sensor.sort_order = order;
        }
        if let Some(unit) = &update.unit {
            sensor.unit = unit.clone();
        }
        Ok(sensor.clone())
    }

    // -----------------------------------------------------------------------
    // Fan-out edges
    // -----------------------------------------------------------------------

    /// Adds a bare device edge unless the sensor already targets that device.
    pub fn assign_target(&self, junction_id: JunctionId, sensor_id: SensorId, device_id: DeviceId) -> EngineResult<Vec<SensorTarget>> {
        let slot = self.locate_in(junction_id, sensor_id)?;
        let mut data = slot.write();
        if !data.has_edge(sensor_id, device_id) {
            data.targets.insert(SensorTarget {
                sensor_id,
                device_id,
                screen_id: None,
            });
        }
        Ok(data.edges_of(sensor_id))
    }

    pub fn assign_screen(
        &self,
        junction_id: JunctionId,
        sensor_id: SensorId,
        device_id: DeviceId,
        screen_id: &str,
    ) -> EngineResult<Vec<SensorTarget>> {
        let slot = self.locate_in(junction_id, sensor_id)?;
        let mut data = slot.write();
        data.targets.remove(&SensorTarget {
            sensor_id,
            device_id,
            screen_id: None,
        });
        data.targets.insert(SensorTarget {
            sensor_id,
            device_id,
            screen_id: Some(screen_id.to_string()),
        });
        Ok(data.edges_of(sensor_id))
    }

    /// Drops every edge between the sensor and the device.
    pub fn remove_target(&self, junction_id: JunctionId, sensor_id: SensorId, device_id: DeviceId) -> EngineResult<Vec<SensorTarget>> {
        let slot = self.locate_in(junction_id, sensor_id)?;
        let mut data = slot.write();
        data.targets
            .retain(|t| !(t.sensor_id == sensor_id && t.device_id == device_id));
        Ok(data.edges_of(sensor_id))
    }

    pub fn remove_screen(
        &self,
        junction_id: JunctionId,
        sensor_id: SensorId,
        device_id: DeviceId,
        screen_id: &str,
    ) -> EngineResult<Vec<SensorTarget>> {
        let slot = self.locate_in(junction_id, sensor_id)?;
        let mut data = slot.write();
        let removed = data.targets.remove(&SensorTarget {
            sensor_id,
            device_id,
            screen_id: Some(screen_id.to_string()),
        });
        if !removed {
            return Err(EngineError::not_found(format!(
                "screen {screen_id} of device {device_id} on sensor {sensor_id}"
            )));
        }
        if !data.has_edge(sensor_id, device_id) {
            data.targets.insert(SensorTarget {
                sensor_id,
                device_id,
                screen_id: None,
            });
        }
        Ok(data.edges_of(sensor_id))
    }

    pub fn targets_of(&self, sensor_id: SensorId) -> EngineResult<Vec<SensorTarget>> {
        let (_, slot) = self.locate(sensor_id)?;
        let data = slot.read();
        Ok(data.edges_of(sensor_id))
    }

    /// Drops the device's edges inside one junction (its Target link went away).
    pub fn drop_device_edges(&self, junction_id: JunctionId, device_id: DeviceId) {
        if let Some(slot) = self.existing(junction_id) {
            slot.write().targets.retain(|t| t.device_id != device_id);
        }
    }

    /// Groups what `device` receives per screen.
    ///
    /// Broadcast junctions ignore the edges: every known sensor goes to every
    /// screen of the device, or once without a screen when it has none.
    pub fn resolve(&self, junction_id: JunctionId, device: &Device, broadcast: bool) -> Vec<Delivery> {
        let Some(slot) = self.existing(junction_id) else {
            return Vec::new();
        };
        let data = slot.read();
        if broadcast {
            let sensors = data.ordered();
            if sensors.is_empty() {
                return Vec::new();
            }
            if device.screens.is_empty() {
                return vec![Delivery { screen_id: None, sensors }];
            }
            return device
                .screens
                .iter()
                .map(|screen| Delivery {
                    screen_id: Some(screen.screen_key.clone()),
                    sensors: sensors.clone(),
                })
                .collect();
        }

        let mut grouped: BTreeMap<Option<String>, Vec<Sensor>> = BTreeMap::new();
        for edge in data.targets.iter().filter(|t| t.device_id == device.id) {
            if let Some(sensor) = data.sensors.get(&edge.sensor_id).filter(|s| s.is_selected) {
                grouped
                    .entry(edge.screen_id.clone())
                    .or_default()
                    .push(sensor.clone());
            }
        }
        grouped
            .into_iter()
            .map(|(screen_id, mut sensors)| {
                sensors.sort_by_key(|s| (s.sort_order, s.id));
                Delivery { screen_id, sensors }
            })
            .collect()
    }

    /// What a non-device target (outbound service) receives.
    pub fn selected(&self, junction_id: JunctionId, broadcast: bool) -> Vec<Sensor> {
        self.list(junction_id)
            .into_iter()
            .filter(|s| broadcast || s.is_selected)
            .collect()
    }

    // -----------------------------------------------------------------------
    // Junction / link lifecycle
    // -----------------------------------------------------------------------

    pub fn remove_junction(&self, junction_id: JunctionId) {
        let Some(slot) = self.junctions.write().remove(&junction_id) else {
            return;
        };
        let data = slot.read();
        let mut index = self.index.write();
        for id in data.sensors.keys() {
            index.remove(id);
        }
    }

    /// Forgets sensors discovered through `link_id` and their edges.
    pub fn remove_link(&self, junction_id: JunctionId, link_id: LinkId) {
        let Some(slot) = self.existing(junction_id) else {
            return;
        };
        let mut data = slot.write();
        let dropped: Vec<SensorId> = data
            .sensors
            .values()
            .filter(|s| s.source_link_id == Some(link_id))
            .map(|s| s.id)
            .collect();
        for id in &dropped {
            if let Some(s) = data.sensors.remove(id) {
                data.by_key.remove(&(s.source_link_id, s.external_id));
            }
        }
        data.targets.retain(|t| !dropped.contains(&t.sensor_id));
        drop(data);
        let mut index = self.index.write();
        for id in dropped {
            index.remove(&id);
        }
    }

    pub fn export(&self, junction_id: JunctionId) -> (Vec<Sensor>, Vec<SensorTarget>) {
        match self.existing(junction_id) {
            Some(slot) => {
                let data = slot.read();
                (data.ordered(), data.targets.iter().cloned().collect())
            }
            None => (Vec::new(), Vec::new()),
        }
    }

    /// Copies sensors and edges into `junction_id` under fresh ids, remapping
    /// source links through `link_map`.
    pub fn copy_in(
        &self,
        junction_id: JunctionId,
        sensors: &[Sensor],
        targets: &[SensorTarget],
        link_map: &HashMap<LinkId, LinkId>,
    ) {
        let slot = self.slot(junction_id);
        let mut data = slot.write();
        let mut id_map = HashMap::new();
        for sensor in sensors {
            let mut copy = sensor.clone();
            copy.id = self.ids.next();
            copy.junction_id = junction_id;
            copy.source_link_id = sensor.source_link_id.and_then(|l| link_map.get(&l).copied());
            let key = (copy.source_link_id, copy.external_id.clone());
            if data.by_key.contains_key(&key) {
                continue;
            }
            id_map.insert(sensor.id, copy.id);
            data.insert(copy);
        }
        for target in targets {
            if let Some(new_id) = id_map.get(&target.sensor_id) {
                data.targets.insert(SensorTarget {
                    sensor_id: *new_id,
                    device_id: target.device_id,
                    screen_id: target.screen_id.clone(),
                });
            }
        }
        drop(data);
        let mut index = self.index.write();
        for new_id in id_map.into_values() {
            index.insert(new_id, junction_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Screen, SensorValue};

    fn registry() -> SensorRegistry {
        SensorRegistry::new(Arc::new(IdGen::default()))
    }

    fn reading(ext: &str, v: f64) -> SensorReading {
        SensorReading::new(ext, SensorValue::Number(v)).with_unit("%")
    }

    fn device(id: DeviceId, screens: &[&str]) -> Device {
        Device {
            id,
            name: format!("dev{id}"),
            screens: screens
                .iter()
                .map(|s| Screen { screen_key: s.to_string(), display_name: None })
                .collect(),
            ..Device::default()
        }
    }

    #[test]
    fn test_poll_updates_known_sensors_only() {
        let reg = registry();
        reg.import(1, Some(10), &[reading("cpu", 1.0)], true);
        let touched = reg.apply_poll(1, 10, &[reading("cpu", 42.0), reading("gpu", 3.0)], false);
        assert_eq!(touched, 1);
        let list = reg.list(1);
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].value, SensorValue::Number(42.0));

        let touched = reg.apply_poll(1, 10, &[reading("gpu", 3.0)], true);
        assert_eq!(touched, 1);
        assert_eq!(reg.count(1), 2);
    }

    #[test]
    fn test_same_external_id_from_two_links_are_distinct() {
        let reg = registry();
        reg.import(1, Some(10), &[reading("temp", 1.0)], true);
        reg.import(1, Some(11), &[reading("temp", 2.0)], true);
        assert_eq!(reg.count(1), 2);
        assert!(reg.known_external_ids(1, 10).contains("temp"));
        assert!(reg.known_external_ids(1, 12).is_empty());
    }

    #[test]
    fn test_assign_target_is_idempotent() {
        let reg = registry();
        let s = reg.import(1, None, &[reading("cpu", 1.0)], true).remove(0);
        reg.assign_target(1, s.id, 5).unwrap();
        let edges = reg.assign_target(1, s.id, 5).unwrap();
        assert_eq!(edges.len(), 1);
        assert_eq!(edges[0].screen_id, None);
    }

    #[test]
    fn test_remove_screen_then_assign_screen_restores_state() {
        let reg = registry();
        let s = reg.import(1, None, &[reading("cpu", 1.0)], true).remove(0);
        reg.assign_target(1, s.id, 5).unwrap();
        let before = reg.assign_screen(1, s.id, 5, "main").unwrap();
        assert_eq!(before.len(), 1);

        let bare = reg.remove_screen(1, s.id, 5, "main").unwrap();
        assert_eq!(bare, vec![SensorTarget { sensor_id: s.id, device_id: 5, screen_id: None }]);
        let after = reg.assign_screen(1, s.id, 5, "main").unwrap();
        assert_eq!(after, before);
    }

    #[test]
    fn test_remove_target_drops_all_screens() {
        let reg = registry();
        let s = reg.import(1, None, &[reading("cpu", 1.0)], true).remove(0);
        reg.assign_screen(1, s.id, 5, "a").unwrap();
        reg.assign_screen(1, s.id, 5, "b").unwrap();
        reg.assign_target(1, s.id, 6).unwrap();
        let left = reg.remove_target(1, s.id, 5).unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].device_id, 6);
    }

    #[test]
    fn test_sensor_from_other_junction_is_not_found() {
        let reg = registry();
        let s = reg.import(1, None, &[reading("cpu", 1.0)], true).remove(0);
        assert!(reg.assign_target(2, s.id, 5).is_err());
    }

    #[test]
    fn test_resolve_groups_by_screen() {
        let reg = registry();
        let s = reg.import(1, None, &[reading("cpu", 1.0)], true).remove(0);
        reg.assign_screen(1, s.id, 1, "S1").unwrap();
        reg.assign_screen(1, s.id, 1, "S2").unwrap();
        reg.assign_target(1, s.id, 2).unwrap();

        let d1 = reg.resolve(1, &device(1, &["S1", "S2"]), false);
        let d2 = reg.resolve(1, &device(2, &[]), false);
        assert_eq!(d1.len() + d2.len(), 3);
        assert_eq!(d2[0].screen_id, None);
    }

    #[test]
    fn test_unselected_sensors_are_not_routed_unless_broadcast() {
        let reg = registry();
        let s = reg.import(1, None, &[reading("cpu", 1.0)], false).remove(0);
        reg.assign_target(1, s.id, 1).unwrap();
        assert!(reg.resolve(1, &device(1, &[]), false).is_empty());

        let all = reg.resolve(1, &device(1, &["a", "b"]), true);
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].sensors.len(), 1);
    }

    #[test]
    fn test_remove_link_forgets_its_sensors() {
        let reg = registry();
        let s = reg.import(1, Some(10), &[reading("cpu", 1.0)], true).remove(0);
        reg.import(1, Some(11), &[reading("gpu", 1.0)], true);
        reg.assign_target(1, s.id, 3).unwrap();
        reg.remove_link(1, 10);
        assert_eq!(reg.count(1), 1);
        assert!(reg.get(s.id).is_err());
        assert!(reg.export(1).1.is_empty());
    }

    #[test]
    fn test_copy_in_remaps_links_and_edges() {
        let reg = registry();
        let s = reg.import(1, Some(10), &[reading("cpu", 1.0)], true).remove(0);
        reg.assign_screen(1, s.id, 4, "main").unwrap();
        let (sensors, targets) = reg.export(1);

        let map: HashMap<LinkId, LinkId> = [(10, 20)].into_iter().collect();
        reg.copy_in(2, &sensors, &targets, &map);
        let copied = reg.list(2);
        assert_eq!(copied[0].source_link_id, Some(20));
        assert_ne!(copied[0].id, s.id);
        assert_eq!(reg.targets_of(copied[0].id).unwrap()[0].screen_id.as_deref(), Some("main"));
    }

    #[test]
    fn test_restore_rebuilds_index() {
        let reg = registry();
        let s = reg.import(3, None, &[reading("cpu", 1.0)], true).remove(0);
        reg.assign_target(3, s.id, 9).unwrap();
        let (sensors, targets) = reg.snapshot();

        let restored = SensorRegistry::restore(Arc::new(IdGen::new(100)), &sensors, &targets);
        assert_eq!(restored.get(s.id).unwrap().external_id, "cpu");
        assert_eq!(restored.targets_of(s.id).unwrap().len(), 1);
    }
}
