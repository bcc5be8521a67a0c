/**
 * CATALOG - Devices, collectors, junctions and their links
 *
 * ROLE:
 * In-memory registry of everything the control API configures, plus the
 * validation that keeps it consistent (unique junction names, transport
 * compatibility of Target links, no dangling link references).
 *
 * NOTES:
 * - The persisted junction `status` is informational only; the live value
 *   comes from the status aggregator and is merged by the engine on read.
 * - Ids come from the shared IdGen so sensors and catalog records never clash.
 */

use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::cron::CronSchedule;
use crate::error::{EngineError, EngineResult};
use crate::models::{
    Collector, CollectorId, CollectorType, Device, DeviceId, DeviceProtocol, EntityKind, Junction,
    JunctionId, JunctionLinks, JunctionStatus, JunctionType, Link, LinkId, LinkInput,
    LinkRateUpdate, LinkRole, SortOrderUpdate, DEFAULT_POLL_RATE_MS, DEFAULT_SEND_RATE_MS,
};
use crate::state::IdGen;
use crate::store::CatalogSnapshot;

#[derive(Default)]
struct CatalogData {
    devices: BTreeMap<DeviceId, Device>,
    collectors: BTreeMap<CollectorId, Collector>,
    junctions: BTreeMap<JunctionId, Junction>,
    links: BTreeMap<LinkId, Link>,
}

pub struct Catalog {
    ids: Arc<IdGen>,
    inner: RwLock<CatalogData>,
}

impl Catalog {
    pub fn new(ids: Arc<IdGen>) -> Self {
        Self {
            ids,
            inner: RwLock::new(CatalogData::default()),
        }
    }

    /// Rebuilds the catalog from a stored snapshot. Every junction comes back Idle.
    pub fn restore(ids: Arc<IdGen>, snapshot: &CatalogSnapshot) -> Self {
        let catalog = Self::new(ids);
        {
            let mut data = catalog.inner.write();
            for d in &snapshot.devices {
                data.devices.insert(d.id, d.clone());
            }
            for c in &snapshot.collectors {
                data.collectors.insert(c.id, c.clone());
            }
            for j in &snapshot.junctions {
                let mut j = j.clone();
                j.status = JunctionStatus::Idle;
                data.junctions.insert(j.id, j);
            }
            for l in &snapshot.links {
                if data.junctions.contains_key(&l.junction_id) {
                    data.links.insert(l.id, l.clone());
                }
            }
        }
        catalog
    }

    pub fn fill_snapshot(&self, snapshot: &mut CatalogSnapshot) {
        let data = self.inner.read();
        snapshot.devices = data.devices.values().cloned().collect();
        snapshot.collectors = data.collectors.values().cloned().collect();
        snapshot.junctions = data.junctions.values().cloned().collect();
        snapshot.links = data.links.values().cloned().collect();
    }

    // -----------------------------------------------------------------------
    // Devices
    // -----------------------------------------------------------------------

    pub fn list_devices(&self) -> Vec<Device> {
        self.inner.read().devices.values().cloned().collect()
    }

    pub fn device(&self, id: DeviceId) -> EngineResult<Device> {
        self.inner
            .read()
            .devices
            .get(&id)
            .cloned()
            .ok_or_else(|| EngineError::not_found(format!("device {id}")))
    }

    pub fn create_device(&self, mut device: Device) -> EngineResult<Device> {
        let mut data = self.inner.write();
        validate_device(&device, &data)?;
        device.id = self.ids.next();
        data.devices.insert(device.id, device.clone());
        Ok(device)
    }

    pub fn update_device(&self, id: DeviceId, mut device: Device) -> EngineResult<Device> {
        let mut data = self.inner.write();
        if !data.devices.contains_key(&id) {
            return Err(EngineError::not_found(format!("device {id}")));
        }
        device.id = id;
        validate_device(&device, &data)?;
        for link in data.links.values() {
            if link.entity_kind == EntityKind::Device && link.entity_id == id {
                if let Some(j) = data.junctions.get(&link.junction_id) {
                    check_device_role(j, link.role, &device)?;
                }
            }
        }
        data.devices.insert(id, device.clone());
        Ok(device)
    }

    pub fn delete_device(&self, id: DeviceId) -> EngineResult<Device> {
        let mut data = self.inner.write();
        if let Some(link) = data
            .links
            .values()
            .find(|l| l.entity_kind == EntityKind::Device && l.entity_id == id)
        {
            return Err(EngineError::conflict(format!(
                "device {id} is still linked to junction {}",
                link.junction_id
            )));
        }
        data.devices
            .remove(&id)
            .ok_or_else(|| EngineError::not_found(format!("device {id}")))
    }

    // -----------------------------------------------------------------------
    // Collectors
    // -----------------------------------------------------------------------

    pub fn list_collectors(&self) -> Vec<Collector> {
        self.inner.read().collectors.values().cloned().collect()
    }

    pub fn collector(&self, id: CollectorId) -> EngineResult<Collector> {
        self.inner
            .read()
            .collectors
            .get(&id)
            .cloned()
            .ok_or_else(|| EngineError::not_found(format!("collector {id}")))
    }

    pub fn create_collector(&self, mut collector: Collector) -> EngineResult<Collector> {
        validate_collector(&collector)?;
        let mut data = self.inner.write();
        collector.id = self.ids.next();
        data.collectors.insert(collector.id, collector.clone());
        Ok(collector)
    }

    pub fn update_collector(&self, id: CollectorId, mut collector: Collector) -> EngineResult<Collector> {
        validate_collector(&collector)?;
        let mut data = self.inner.write();
        let Some(existing) = data.collectors.get_mut(&id) else {
            return Err(EngineError::not_found(format!("collector {id}")));
        };
        collector.id = id;
        *existing = collector.clone();
        Ok(collector)
    }

    /// Replaces the stored subscription list of an MQTT collector.
    pub fn set_subscriptions(&self, id: CollectorId, subs: Vec<crate::models::MqttSubscription>) -> EngineResult<()> {
        let mut data = self.inner.write();
        let collector = data
            .collectors
            .get_mut(&id)
            .ok_or_else(|| EngineError::not_found(format!("collector {id}")))?;
        collector.subscriptions = subs;
        Ok(())
    }

    pub fn delete_collector(&self, id: CollectorId) -> EngineResult<Collector> {
        let mut data = self.inner.write();
        if let Some(link) = data
            .links
            .values()
            .find(|l| l.entity_kind == EntityKind::Collector && l.entity_id == id)
        {
            return Err(EngineError::conflict(format!(
                "collector {id} is still linked to junction {}",
                link.junction_id
            )));
        }
        if let Some(device) = data.devices.values().find(|d| d.broker_collector_id == Some(id)) {
            return Err(EngineError::conflict(format!(
                "collector {id} is the broker of device '{}'",
                device.name
            )));
        }
        data.collectors
            .remove(&id)
            .ok_or_else(|| EngineError::not_found(format!("collector {id}")))
    }

    // -----------------------------------------------------------------------
    // Junctions
    // -----------------------------------------------------------------------

    /// Dashboard order: sort order first, id as tie breaker.
    pub fn list_junctions(&self) -> Vec<Junction> {
        let mut list: Vec<Junction> = self.inner.read().junctions.values().cloned().collect();
        list.sort_by_key(|j| (j.sort_order, j.id));
        list
    }

    pub fn junction(&self, id: JunctionId) -> EngineResult<Junction> {
        self.inner
            .read()
            .junctions
            .get(&id)
            .cloned()
            .ok_or_else(|| EngineError::not_found(format!("junction {id}")))
    }

    pub fn create_junction(&self, mut junction: Junction) -> EngineResult<Junction> {
        let mut data = self.inner.write();
        junction.name = junction.name.trim().to_string();
        validate_junction(&junction)?;
        check_unique_name(&data, &junction.name, None)?;
        junction.id = self.ids.next();
        junction.status = JunctionStatus::Idle;
        junction.sort_order = next_sort_order(&data);
        data.junctions.insert(junction.id, junction.clone());
        Ok(junction)
    }

    pub fn update_junction(&self, id: JunctionId, mut junction: Junction) -> EngineResult<Junction> {
        let mut data = self.inner.write();
        let Some(existing) = data.junctions.get(&id) else {
            return Err(EngineError::not_found(format!("junction {id}")));
        };
        junction.id = id;
        junction.status = existing.status;
        junction.name = junction.name.trim().to_string();
        validate_junction(&junction)?;
        check_unique_name(&data, &junction.name, Some(id))?;
        for link in data.links.values().filter(|l| l.junction_id == id) {
            check_link_compat(&data, &junction, link.entity_kind, link.entity_id, link.role)?;
        }
        data.junctions.insert(id, junction.clone());
        Ok(junction)
    }

    /// Removes the junction and cascades to its links.
    pub fn delete_junction(&self, id: JunctionId) -> EngineResult<(Junction, Vec<Link>)> {
        let mut data = self.inner.write();
        let junction = data
            .junctions
            .remove(&id)
            .ok_or_else(|| EngineError::not_found(format!("junction {id}")))?;
        let link_ids: Vec<LinkId> = data
            .links
            .values()
            .filter(|l| l.junction_id == id)
            .map(|l| l.id)
            .collect();
        let links = link_ids.iter().filter_map(|lid| data.links.remove(lid)).collect();
        Ok((junction, links))
    }

    /// Copies a junction and its links under a fresh name. Returns the old→new link id map.
    pub fn clone_junction(&self, id: JunctionId) -> EngineResult<(Junction, HashMap<LinkId, LinkId>)> {
        let (junction, links) = {
            let data = self.inner.read();
            let junction = data
                .junctions
                .get(&id)
                .cloned()
                .ok_or_else(|| EngineError::not_found(format!("junction {id}")))?;
            let links: Vec<Link> = data.links.values().filter(|l| l.junction_id == id).cloned().collect();
            (junction, links)
        };
        self.insert_copy(junction, links, "copy")
    }

    /// Inserts a junction coming from an export document. Referenced entities must exist.
    pub fn import_junction(
        &self,
        junction: Junction,
        links: Vec<Link>,
    ) -> EngineResult<(Junction, HashMap<LinkId, LinkId>)> {
        validate_junction(&junction)?;
        self.insert_copy(junction, links, "imported")
    }

    fn insert_copy(
        &self,
        mut junction: Junction,
        links: Vec<Link>,
        suffix: &str,
    ) -> EngineResult<(Junction, HashMap<LinkId, LinkId>)> {
        let mut data = self.inner.write();
        for link in &links {
            check_link_compat(&data, &junction, link.entity_kind, link.entity_id, link.role)?;
        }

        let base = junction.name.trim().to_string();
        let mut name = base.clone();
        let mut n = 1;
        while name_taken(&data, &name, None) {
            name = if n == 1 {
                format!("{base} ({suffix})")
            } else {
                format!("{base} ({suffix} {n})")
            };
            n += 1;
        }

        junction.id = self.ids.next();
        junction.name = name;
        junction.status = JunctionStatus::Idle;
        junction.sort_order = next_sort_order(&data);

        let mut link_map = HashMap::new();
        for mut link in links {
            let new_id = self.ids.next();
            link_map.insert(link.id, new_id);
            link.id = new_id;
            link.junction_id = junction.id;
            data.links.insert(new_id, link);
        }
        data.junctions.insert(junction.id, junction.clone());
        Ok((junction, link_map))
    }

    /// Applies a batch of sort orders. Unknown ids reject the whole batch.
    pub fn update_sort_order(&self, updates: &[SortOrderUpdate]) -> EngineResult<()> {
        let mut data = self.inner.write();
        if let Some(u) = updates.iter().find(|u| !data.junctions.contains_key(&u.junction_id)) {
            return Err(EngineError::not_found(format!("junction {}", u.junction_id)));
        }
        for u in updates {
            if let Some(j) = data.junctions.get_mut(&u.junction_id) {
                j.sort_order = u.sort_order;
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Links
    // -----------------------------------------------------------------------

    pub fn links(&self, junction_id: JunctionId) -> EngineResult<JunctionLinks> {
        let data = self.inner.read();
        if !data.junctions.contains_key(&junction_id) {
            return Err(EngineError::not_found(format!("junction {junction_id}")));
        }
        let (device_links, collector_links) = data
            .links
            .values()
            .filter(|l| l.junction_id == junction_id)
            .cloned()
            .partition(|l| l.entity_kind == EntityKind::Device);
        Ok(JunctionLinks {
            device_links,
            collector_links,
        })
    }

    pub fn links_of(&self, junction_id: JunctionId) -> Vec<Link> {
        self.inner
            .read()
            .links
            .values()
            .filter(|l| l.junction_id == junction_id)
            .cloned()
            .collect()
    }

    pub fn link(&self, junction_id: JunctionId, link_id: LinkId) -> EngineResult<Link> {
        self.inner
            .read()
            .links
            .get(&link_id)
            .filter(|l| l.junction_id == junction_id)
            .cloned()
            .ok_or_else(|| EngineError::not_found(format!("link {link_id}")))
    }

    pub fn add_link(&self, junction_id: JunctionId, kind: EntityKind, input: LinkInput) -> EngineResult<Link> {
        check_rates(input.poll_rate_override_ms, input.send_rate_override_ms)?;
        let mut data = self.inner.write();
        let junction = data
            .junctions
            .get(&junction_id)
            .cloned()
            .ok_or_else(|| EngineError::not_found(format!("junction {junction_id}")))?;
        check_link_compat(&data, &junction, kind, input.entity_id, input.role)?;
        let duplicate = data.links.values().any(|l| {
            l.junction_id == junction_id
                && l.entity_kind == kind
                && l.entity_id == input.entity_id
                && l.role == input.role
        });
        if duplicate {
            return Err(EngineError::conflict(format!(
                "{kind} {} is already a {:?} of junction {junction_id}",
                input.entity_id, input.role
            )));
        }
        let link = Link {
            id: self.ids.next(),
            junction_id,
            entity_id: input.entity_id,
            entity_kind: kind,
            role: input.role,
            poll_rate_override_ms: input.poll_rate_override_ms,
            send_rate_override_ms: input.send_rate_override_ms,
        };
        data.links.insert(link.id, link.clone());
        Ok(link)
    }

    pub fn remove_link(&self, junction_id: JunctionId, kind: EntityKind, link_id: LinkId) -> EngineResult<Link> {
        let mut data = self.inner.write();
        let matches = data
            .links
            .get(&link_id)
            .is_some_and(|l| l.junction_id == junction_id && l.entity_kind == kind);
        if !matches {
            return Err(EngineError::not_found(format!("{kind} link {link_id}")));
        }
        data.links
            .remove(&link_id)
            .ok_or_else(|| EngineError::not_found(format!("{kind} link {link_id}")))
    }

    pub fn update_link_rates(
        &self,
        junction_id: JunctionId,
        kind: EntityKind,
        link_id: LinkId,
        update: LinkRateUpdate,
    ) -> EngineResult<Link> {
        check_rates(update.poll_rate_override_ms, update.send_rate_override_ms)?;
        let mut data = self.inner.write();
        let link = data
            .links
            .get_mut(&link_id)
            .filter(|l| l.junction_id == junction_id && l.entity_kind == kind)
            .ok_or_else(|| EngineError::not_found(format!("{kind} link {link_id}")))?;
        link.poll_rate_override_ms = update.poll_rate_override_ms;
        link.send_rate_override_ms = update.send_rate_override_ms;
        Ok(link.clone())
    }

    /// Override if set, else the entity's own poll rate.
    pub fn poll_rate(&self, link: &Link) -> u64 {
        if let Some(rate) = link.poll_rate_override_ms.filter(|r| *r > 0) {
            return rate;
        }
        let data = self.inner.read();
        let own = match link.entity_kind {
            EntityKind::Device => data.devices.get(&link.entity_id).map(|d| d.poll_rate_ms),
            EntityKind::Collector => data.collectors.get(&link.entity_id).map(|c| c.poll_rate_ms),
        };
        own.filter(|r| *r > 0).unwrap_or(DEFAULT_POLL_RATE_MS)
    }

    /// Override if set, else the entity's own send rate.
    pub fn send_rate(&self, link: &Link) -> u64 {
        if let Some(rate) = link.send_rate_override_ms.filter(|r| *r > 0) {
            return rate;
        }
        let data = self.inner.read();
        let own = match link.entity_kind {
            EntityKind::Device => data.devices.get(&link.entity_id).map(|d| d.send_rate_ms),
            EntityKind::Collector => data.collectors.get(&link.entity_id).map(|c| c.send_rate_ms),
        };
        own.filter(|r| *r > 0).unwrap_or(DEFAULT_SEND_RATE_MS)
    }

    pub fn entity_name(&self, kind: EntityKind, id: u64) -> String {
        let data = self.inner.read();
        let name = match kind {
            EntityKind::Device => data.devices.get(&id).map(|d| d.name.clone()),
            EntityKind::Collector => data.collectors.get(&id).map(|c| c.name.clone()),
        };
        name.unwrap_or_else(|| format!("{kind} {id}"))
    }

    pub fn junction_count(&self) -> usize {
        self.inner.read().junctions.len()
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

fn validate_junction(j: &Junction) -> EngineResult<()> {
    if j.name.trim().is_empty() {
        return Err(EngineError::bad_request("junction name is required"));
    }
    if j.junction_type == JunctionType::GatewayHttp
        && j.gateway_destination.as_deref().map_or(true, |d| d.trim().is_empty())
    {
        return Err(EngineError::bad_request(
            "Gateway-HTTP junction requires a gateway destination",
        ));
    }
    if j.retry_interval_ms == 0 {
        return Err(EngineError::bad_request("retryIntervalMs must be positive"));
    }
    if j.enable_health_check && j.health_check_interval_ms == 0 {
        return Err(EngineError::bad_request("healthCheckIntervalMs must be positive"));
    }
    for expr in [&j.cron_expression, &j.cron_stop_expression].into_iter().flatten() {
        if !expr.trim().is_empty() {
            CronSchedule::parse(expr)?;
        }
    }
    Ok(())
}

fn validate_device(d: &Device, data: &CatalogData) -> EngineResult<()> {
    if d.name.trim().is_empty() {
        return Err(EngineError::bad_request("device name is required"));
    }
    if d.qos > 2 {
        return Err(EngineError::bad_request(format!("invalid MQTT qos {}", d.qos)));
    }
    if d.protocol != DeviceProtocol::Mqtt && d.address.trim().is_empty() {
        return Err(EngineError::bad_request(format!("device '{}' needs an address", d.name)));
    }
    if let Some(cid) = d.broker_collector_id {
        match data.collectors.get(&cid) {
            Some(c) if c.collector_type == CollectorType::Mqtt => {}
            Some(_) => {
                return Err(EngineError::bad_request(format!("collector {cid} is not an MQTT broker")));
            }
            None => return Err(EngineError::not_found(format!("collector {cid}"))),
        }
    }
    Ok(())
}

fn validate_collector(c: &Collector) -> EngineResult<()> {
    if c.name.trim().is_empty() {
        return Err(EngineError::bad_request("collector name is required"));
    }
    match c.collector_type {
        CollectorType::HomeAssistant | CollectorType::LibreHardwareMonitor | CollectorType::UptimeKuma => {
            if c.url.as_deref().map_or(true, |u| u.trim().is_empty()) {
                return Err(EngineError::bad_request(format!(
                    "{:?} collector '{}' needs a url",
                    c.collector_type, c.name
                )));
            }
        }
        CollectorType::Mqtt => {
            if c.broker_host.as_deref().map_or(true, |h| h.trim().is_empty()) {
                return Err(EngineError::bad_request(format!(
                    "MQTT collector '{}' needs a broker host",
                    c.name
                )));
            }
        }
        CollectorType::Host | CollectorType::RateTester => {}
    }
    if let Some(sub) = c.subscriptions.iter().find(|s| s.qos > 2) {
        return Err(EngineError::bad_request(format!(
            "invalid qos {} for topic {}",
            sub.qos, sub.topic
        )));
    }
    Ok(())
}

fn check_rates(poll: Option<u64>, send: Option<u64>) -> EngineResult<()> {
    if poll == Some(0) || send == Some(0) {
        return Err(EngineError::bad_request("rate overrides must be positive"));
    }
    Ok(())
}

fn check_link_compat(
    data: &CatalogData,
    junction: &Junction,
    kind: EntityKind,
    entity_id: u64,
    role: LinkRole,
) -> EngineResult<()> {
    match kind {
        EntityKind::Device => {
            let device = data
                .devices
                .get(&entity_id)
                .ok_or_else(|| EngineError::not_found(format!("device {entity_id}")))?;
            check_device_role(junction, role, device)
        }
        EntityKind::Collector => {
            let collector = data
                .collectors
                .get(&entity_id)
                .ok_or_else(|| EngineError::not_found(format!("collector {entity_id}")))?;
            if role == LinkRole::Target {
                if junction.junction_type != JunctionType::Http {
                    return Err(EngineError::bad_request(format!(
                        "collector targets are only supported on HTTP junctions, not {:?}",
                        junction.junction_type
                    )));
                }
                if collector.url.as_deref().map_or(true, |u| u.trim().is_empty()) {
                    return Err(EngineError::bad_request(format!(
                        "collector '{}' has no url to deliver to",
                        collector.name
                    )));
                }
            }
            Ok(())
        }
    }
}

fn check_device_role(junction: &Junction, role: LinkRole, device: &Device) -> EngineResult<()> {
    let ok = match role {
        LinkRole::Source => device.protocol == DeviceProtocol::Http,
        LinkRole::Target => match junction.junction_type {
            JunctionType::Com => device.protocol == DeviceProtocol::Com,
            JunctionType::Mqtt => device.protocol == DeviceProtocol::Mqtt,
            JunctionType::Http | JunctionType::GatewayHttp => {
                matches!(device.protocol, DeviceProtocol::Http | DeviceProtocol::WebSocket)
            }
        },
    };
    if ok {
        Ok(())
    } else {
        Err(EngineError::bad_request(format!(
            "{:?} device '{}' cannot be a {:?} of a {:?} junction",
            device.protocol, device.name, role, junction.junction_type
        )))
    }
}

fn name_taken(data: &CatalogData, name: &str, except: Option<JunctionId>) -> bool {
    data.junctions
        .values()
        .any(|j| Some(j.id) != except && j.name.eq_ignore_ascii_case(name))
}

fn check_unique_name(data: &CatalogData, name: &str, except: Option<JunctionId>) -> EngineResult<()> {
    if name_taken(data, name, except) {
        return Err(EngineError::conflict(format!("junction name '{name}' already exists")));
    }
    Ok(())
}

fn next_sort_order(data: &CatalogData) -> i64 {
    data.junctions.values().map(|j| j.sort_order + 1).max().unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn catalog() -> Catalog {
        Catalog::new(Arc::new(IdGen::default()))
    }

    fn junction(name: &str, ty: JunctionType) -> Junction {
        Junction {
            name: name.into(),
            junction_type: ty,
            ..Junction::default()
        }
    }

    fn device(cat: &Catalog, name: &str, protocol: DeviceProtocol) -> Device {
        cat.create_device(Device {
            name: name.into(),
            address: "10.0.0.2".into(),
            protocol,
            ..Device::default()
        })
        .unwrap()
    }

    fn link(entity_id: u64, role: LinkRole) -> LinkInput {
        LinkInput {
            entity_id,
            role,
            poll_rate_override_ms: None,
            send_rate_override_ms: None,
        }
    }

    #[test]
    fn test_duplicate_junction_name_is_conflict() {
        let cat = catalog();
        cat.create_junction(junction("Desk", JunctionType::Http)).unwrap();
        let err = cat.create_junction(junction("desk", JunctionType::Http)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);
    }

    #[test]
    fn test_gateway_without_destination_is_bad_request() {
        let cat = catalog();
        let err = cat.create_junction(junction("Gw", JunctionType::GatewayHttp)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BadRequest);

        let mut j = junction("Gw", JunctionType::GatewayHttp);
        j.gateway_destination = Some("192.168.1.50".into());
        assert!(cat.create_junction(j).is_ok());
    }

    #[test]
    fn test_sort_order_controls_listing() {
        let cat = catalog();
        let a = cat.create_junction(junction("A", JunctionType::Http)).unwrap();
        let b = cat.create_junction(junction("B", JunctionType::Http)).unwrap();
        cat.update_sort_order(&[
            SortOrderUpdate { junction_id: b.id, sort_order: 0 },
            SortOrderUpdate { junction_id: a.id, sort_order: 1 },
        ])
        .unwrap();
        let names: Vec<String> = cat.list_junctions().into_iter().map(|j| j.name).collect();
        assert_eq!(names, vec!["B", "A"]);

        let err = cat
            .update_sort_order(&[SortOrderUpdate { junction_id: 999, sort_order: 0 }])
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn test_target_protocol_must_match_junction_type() {
        let cat = catalog();
        let j = cat.create_junction(junction("Serial", JunctionType::Com)).unwrap();
        let http_dev = device(&cat, "panel", DeviceProtocol::Http);
        let com_dev = device(&cat, "usb", DeviceProtocol::Com);

        let err = cat.add_link(j.id, EntityKind::Device, link(http_dev.id, LinkRole::Target)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BadRequest);
        assert!(cat.add_link(j.id, EntityKind::Device, link(com_dev.id, LinkRole::Target)).is_ok());
        // COM devices are write-only.
        let err = cat.add_link(j.id, EntityKind::Device, link(com_dev.id, LinkRole::Source)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BadRequest);
    }

    #[test]
    fn test_device_can_be_source_and_target_but_not_twice() {
        let cat = catalog();
        let j = cat.create_junction(junction("Loop", JunctionType::Http)).unwrap();
        let d = device(&cat, "panel", DeviceProtocol::Http);
        cat.add_link(j.id, EntityKind::Device, link(d.id, LinkRole::Source)).unwrap();
        cat.add_link(j.id, EntityKind::Device, link(d.id, LinkRole::Target)).unwrap();
        let err = cat.add_link(j.id, EntityKind::Device, link(d.id, LinkRole::Target)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);
        assert_eq!(cat.links(j.id).unwrap().device_links.len(), 2);
    }

    #[test]
    fn test_rate_falls_back_to_entity_default() {
        let cat = catalog();
        let j = cat.create_junction(junction("Rates", JunctionType::Http)).unwrap();
        let mut d = device(&cat, "panel", DeviceProtocol::Http);
        d.send_rate_ms = 750;
        cat.update_device(d.id, d.clone()).unwrap();
        let l = cat.add_link(j.id, EntityKind::Device, link(d.id, LinkRole::Target)).unwrap();
        assert_eq!(cat.send_rate(&l), 750);

        let l = cat
            .update_link_rates(
                j.id,
                EntityKind::Device,
                l.id,
                LinkRateUpdate { poll_rate_override_ms: None, send_rate_override_ms: Some(200) },
            )
            .unwrap();
        assert_eq!(cat.send_rate(&l), 200);
    }

    #[test]
    fn test_delete_junction_cascades_links_and_frees_device() {
        let cat = catalog();
        let j = cat.create_junction(junction("Tmp", JunctionType::Http)).unwrap();
        let d = device(&cat, "panel", DeviceProtocol::Http);
        cat.add_link(j.id, EntityKind::Device, link(d.id, LinkRole::Target)).unwrap();

        assert_eq!(cat.delete_device(d.id).unwrap_err().kind(), ErrorKind::Conflict);
        let (_, links) = cat.delete_junction(j.id).unwrap();
        assert_eq!(links.len(), 1);
        assert!(cat.links_of(j.id).is_empty());
        assert!(cat.delete_device(d.id).is_ok());
    }

    #[test]
    fn test_clone_gets_unique_name_and_new_link_ids() {
        let cat = catalog();
        let j = cat.create_junction(junction("Desk", JunctionType::Http)).unwrap();
        let d = device(&cat, "panel", DeviceProtocol::Http);
        let l = cat.add_link(j.id, EntityKind::Device, link(d.id, LinkRole::Target)).unwrap();

        let (copy, map) = cat.clone_junction(j.id).unwrap();
        assert_eq!(copy.name, "Desk (copy)");
        assert_ne!(map[&l.id], l.id);
        let (copy2, _) = cat.clone_junction(j.id).unwrap();
        assert_eq!(copy2.name, "Desk (copy 2)");
        assert!(copy2.sort_order > copy.sort_order);
    }

    #[test]
    fn test_mqtt_qos_out_of_range_rejected() {
        let cat = catalog();
        let err = cat
            .create_device(Device {
                name: "m".into(),
                protocol: DeviceProtocol::Mqtt,
                qos: 3,
                ..Device::default()
            })
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BadRequest);
    }
}
