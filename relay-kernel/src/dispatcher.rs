/**
 * DISPATCHER - Payload building and per-target delivery
 *
 * ROLE:
 * A send cycle resolves what one Target link receives, frames it and pushes
 * it over the transport the junction type selects:
 * - HTTP junction: POST /data (or the WebSocket hub for WebSocket devices)
 * - Gateway-HTTP: the same frame, posted to the gateway destination
 * - MQTT: frame on <topic>/data plus {tag: value} on <topic>/sensors/<screen|all>
 * - COM: frame written to the serial port
 * - Collector target: JSON array posted to <url>/data
 *
 * GUARANTEE:
 * Deliveries of one cycle run concurrently and are reported one by one; a
 * failed screen or device never aborts its siblings.
 */

use futures::future::join_all;
use std::time::Instant;

use crate::collectors::base_url;
use crate::engine::Runtime;
use crate::models::{
    Collector, DeliveryOutcome, Device, DeviceProtocol, Junction, JunctionType, PayloadPreview,
};
use crate::payload;
use crate::sensors::Delivery;
use crate::transport::mqtt::BrokerLease;
use crate::transport::serial::SerialLease;
use crate::transport::{BrokerConnection, TransportError};

/// Resolved peer of a Target link, held for the whole run of the junction.
pub enum Endpoint {
    Device {
        device: Device,
        /// Present on MQTT junctions.
        broker: Option<BrokerLease>,
        /// Present on COM junctions; keeps the port open for the run.
        serial: Option<SerialLease>,
    },
    Collector(Collector),
}

impl Endpoint {
    pub fn name(&self) -> &str {
        match self {
            Self::Device { device, .. } => &device.name,
            Self::Collector(c) => &c.name,
        }
    }
}

#[derive(Debug, Default)]
pub struct CycleOutcome {
    pub deliveries: Vec<DeliveryOutcome>,
    pub payload: Option<PayloadPreview>,
    pub mqtt_payload: Option<String>,
}

impl CycleOutcome {
    /// A cycle fails only when it attempted something and nothing got through.
    pub fn failed(&self) -> bool {
        !self.deliveries.is_empty() && self.deliveries.iter().all(|d| !d.success)
    }

    pub fn error_summary(&self) -> Option<String> {
        let errors: Vec<String> = self
            .deliveries
            .iter()
            .filter_map(|d| {
                let e = d.error.as_ref()?;
                Some(match &d.screen_id {
                    Some(screen) => format!("{screen}: {e}"),
                    None => e.clone(),
                })
            })
            .collect();
        (!errors.is_empty()).then(|| errors.join("; "))
    }
}

struct Delivered {
    outcome: DeliveryOutcome,
    payload: Option<PayloadPreview>,
    mqtt_payload: Option<String>,
}

pub async fn send_cycle(rt: &Runtime, junction: &Junction, endpoint: &Endpoint) -> CycleOutcome {
    match endpoint {
        Endpoint::Device { device, broker, .. } => {
            let plan = rt
                .sensors
                .resolve(junction.id, device, junction.all_targets_all_data);
            let conn = broker.as_ref().map(|l| l.connection().as_ref());
            let results = join_all(
                plan.into_iter()
                    .map(|delivery| deliver_device(rt, junction, device, conn, delivery)),
            )
            .await;

            let mut outcome = CycleOutcome::default();
            for d in results {
                if d.payload.is_some() {
                    outcome.payload = d.payload;
                }
                if d.mqtt_payload.is_some() {
                    outcome.mqtt_payload = d.mqtt_payload;
                }
                outcome.deliveries.push(d.outcome);
            }
            outcome
        }
        Endpoint::Collector(collector) => deliver_service(rt, junction, collector).await,
    }
}

async fn deliver_device(
    rt: &Runtime,
    junction: &Junction,
    device: &Device,
    broker: Option<&BrokerConnection>,
    delivery: Delivery,
) -> Delivered {
    let started = Instant::now();
    let screen = delivery.screen_id.as_deref();
    let mut mqtt_payload = None;

    let result = match payload::sensor_frames(screen, &delivery.sensors) {
        Ok(frames) => {
            if frames.len() > 1 {
                tracing::debug!(
                    "[dispatch] {} -> {}: {} sensors split into {} frames",
                    junction.name,
                    device.name,
                    delivery.sensors.len(),
                    frames.len()
                );
            }
            let mut sent = Ok(());
            for frame in &frames {
                sent = send_frame(rt, junction, device, broker, "data", frame).await;
                if sent.is_err() {
                    break;
                }
            }
            if sent.is_ok() && junction.junction_type == JunctionType::Mqtt {
                let broker_body = payload::broker_payload(&delivery.sensors).to_string();
                let topic = format!("{}/sensors/{}", device.topic(), screen.unwrap_or("all"));
                sent = match broker {
                    Some(conn) => conn.publish(&topic, device.qos, broker_body.clone().into_bytes()).await,
                    None => Err(TransportError::NotConnected(format!("broker of {}", device.name))),
                };
                mqtt_payload = Some(broker_body);
            }
            sent.and_then(|_| {
                frames
                    .into_iter()
                    .last()
                    .ok_or_else(|| TransportError::Frame("no frame built".into()))
            })
        }
        Err(e) => Err(e),
    };

    let latency_ms = started.elapsed().as_millis() as u64;
    match result {
        Ok(frame) => Delivered {
            outcome: DeliveryOutcome {
                device_id: Some(device.id),
                screen_id: delivery.screen_id,
                success: true,
                latency_ms,
                error: None,
            },
            payload: Some(frame),
            mqtt_payload,
        },
        Err(e) => {
            tracing::debug!("[dispatch] {} -> {} failed: {e}", junction.name, device.name);
            Delivered {
                outcome: DeliveryOutcome {
                    device_id: Some(device.id),
                    screen_id: delivery.screen_id,
                    success: false,
                    latency_ms,
                    error: Some(e.to_string()),
                },
                payload: None,
                mqtt_payload: None,
            }
        }
    }
}

async fn deliver_service(rt: &Runtime, junction: &Junction, collector: &Collector) -> CycleOutcome {
    let sensors = rt.sensors.selected(junction.id, junction.all_targets_all_data);
    if sensors.is_empty() {
        return CycleOutcome::default();
    }
    let body = payload::service_payload(&sensors);
    let started = Instant::now();
    let url = format!("{}/data", base_url(collector.url.as_deref().unwrap_or_default()));
    let result = rt.transports.http.post_json(&url, &body).await;
    CycleOutcome {
        deliveries: vec![DeliveryOutcome {
            device_id: None,
            screen_id: None,
            success: result.is_ok(),
            latency_ms: started.elapsed().as_millis() as u64,
            error: result.err().map(|e| e.to_string()),
        }],
        payload: Some(PayloadPreview {
            prefix: String::new(),
            body: body.to_string(),
        }),
        mqtt_payload: None,
    }
}

/// Pushes one frame to a device over the junction's transport.
/// `topic_suffix` only matters for MQTT (`data`, `config`).
async fn send_frame(
    rt: &Runtime,
    junction: &Junction,
    device: &Device,
    broker: Option<&BrokerConnection>,
    topic_suffix: &str,
    frame: &PayloadPreview,
) -> Result<(), TransportError> {
    let transports = &rt.transports;
    match junction.junction_type {
        JunctionType::GatewayHttp => {
            let gateway = junction.gateway_destination.as_deref().unwrap_or_default();
            transports.http.post_frame(gateway, frame).await
        }
        JunctionType::Com => {
            transports
                .serial
                .write_frame(&device.address, device.baud_rate, frame)
                .await
        }
        JunctionType::Mqtt => {
            let conn = broker.ok_or_else(|| TransportError::NotConnected(format!("broker of {}", device.name)))?;
            let topic = format!("{}/{topic_suffix}", device.topic());
            conn.publish(&topic, device.qos, frame.wire().into_bytes()).await
        }
        JunctionType::Http => match device.protocol {
            DeviceProtocol::WebSocket => transports.websocket.send_frame(device.id, frame),
            _ => transports.http.post_frame(&device.address, frame).await,
        },
    }
}

/// Start-of-run frames: the MQTT subscription request, then one config frame
/// per screen so the firmware can register its tags. Best effort.
pub async fn warmup(rt: &Runtime, junction: &Junction, endpoint: &Endpoint) {
    let Endpoint::Device { device, broker, .. } = endpoint else {
        return;
    };
    let conn = broker.as_ref().map(|l| l.connection().as_ref());

    if junction.junction_type == JunctionType::Mqtt {
        let topic = device.topic();
        let request = payload::subscription_request(&[format!("{topic}/data"), format!("{topic}/sensors/#")]);
        if let Err(e) = push(rt, junction, device, conn, &request).await {
            tracing::warn!("[dispatch] subscription request to {} failed: {e}", device.name);
        }
    }

    let plan = rt
        .sensors
        .resolve(junction.id, device, junction.all_targets_all_data);
    let screens: Vec<Option<String>> = if device.screens.is_empty() {
        vec![None]
    } else {
        device.screens.iter().map(|s| Some(s.screen_key.clone())).collect()
    };
    for screen in screens {
        let sensors = plan
            .iter()
            .find(|d| d.screen_id == screen)
            .map(|d| d.sensors.as_slice())
            .unwrap_or_default();
        let config = payload::config_payload(screen.as_deref(), sensors);
        if let Err(e) = push(rt, junction, device, conn, &config).await {
            tracing::warn!("[dispatch] config frame to {} failed: {e}", device.name);
        }
    }
}

async fn push(
    rt: &Runtime,
    junction: &Junction,
    device: &Device,
    broker: Option<&BrokerConnection>,
    body: &serde_json::Value,
) -> Result<(), TransportError> {
    let frame = payload::frame(body)?;
    send_frame(rt, junction, device, broker, "config", &frame).await
}

/// Health check of a Target endpoint.
pub async fn check_health(rt: &Runtime, junction: &Junction, endpoint: &Endpoint) -> Result<(), TransportError> {
    match endpoint {
        Endpoint::Device { device, broker, .. } => match junction.junction_type {
            JunctionType::GatewayHttp => {
                let gateway = junction.gateway_destination.as_deref().unwrap_or_default();
                rt.transports.http.heartbeat(gateway).await
            }
            JunctionType::Mqtt => match broker {
                Some(conn) if conn.is_connected() => Ok(()),
                _ => Err(TransportError::NotConnected(format!("broker of {}", device.name))),
            },
            // Serial ports have no back channel to check.
            JunctionType::Com => Ok(()),
            JunctionType::Http if device.protocol == DeviceProtocol::WebSocket => {
                if rt.transports.websocket.is_connected(device.id) {
                    Ok(())
                } else {
                    Err(TransportError::NotConnected(format!("websocket device {}", device.id)))
                }
            }
            JunctionType::Http => rt.transports.http.heartbeat(&device.address).await,
        },
        Endpoint::Collector(c) => {
            rt.transports
                .http
                .reachable(&base_url(c.url.as_deref().unwrap_or_default()))
                .await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::KernelConfig;
    use crate::models::{EntityKind, LinkInput, LinkRole, Screen, SensorReading, SensorValue};
    use crate::transport::mqtt::tests::{mock_pool, mock_pool_with};
    use crate::transport::mqtt::{BrokerKey, MqttPool};
    use crate::transport::Transports;
    use relay_devkit::{MockDevice, MockMqttClient};
    use std::sync::Arc;
    use std::time::Duration;

    fn runtime(client: MockMqttClient) -> Arc<Runtime> {
        runtime_on(mock_pool(client))
    }

    fn runtime_on(pool: MqttPool) -> Arc<Runtime> {
        let cfg = KernelConfig::default();
        let transports = Transports::new(&cfg).unwrap().with_mqtt_pool(pool);
        Runtime::new(cfg, &Default::default(), transports)
    }

    /// MQTT junction broadcasting one sensor to `home/panel`.
    fn mqtt_setup(rt: &Runtime) -> (Junction, Endpoint) {
        let j = rt
            .catalog
            .create_junction(Junction {
                name: "Broker".into(),
                junction_type: JunctionType::Mqtt,
                all_targets_all_data: true,
                ..Junction::default()
            })
            .unwrap();
        rt.sensors.import(j.id, None, &[reading("temp", 21.5)], true);
        let device = Device {
            id: 7,
            name: "panel".into(),
            protocol: DeviceProtocol::Mqtt,
            mqtt_topic: Some("home/panel".into()),
            ..Device::default()
        };
        let broker = rt.transports.mqtt.acquire(&BrokerKey::default_broker(&rt.config.mqtt));
        (j, Endpoint::Device { device, broker: Some(broker), serial: None })
    }

    fn reading(id: &str, value: f64) -> SensorReading {
        SensorReading::new(id, SensorValue::Number(value))
    }

    fn screen(key: &str) -> Screen {
        Screen { screen_key: key.into(), display_name: None }
    }

    #[tokio::test]
    async fn test_fan_out_reports_each_delivery() {
        let rt = runtime(MockMqttClient::new());
        let d1_mock = MockDevice::start().await.unwrap();
        let d2_mock = MockDevice::start().await.unwrap();
        d2_mock.set_failing(true);

        let j = rt
            .catalog
            .create_junction(Junction { name: "Fan".into(), ..Junction::default() })
            .unwrap();
        let d1 = rt
            .catalog
            .create_device(Device {
                name: "d1".into(),
                address: d1_mock.address(),
                screens: vec![screen("S1"), screen("S2")],
                ..Device::default()
            })
            .unwrap();
        let d2 = rt
            .catalog
            .create_device(Device { name: "d2".into(), address: d2_mock.address(), ..Device::default() })
            .unwrap();
        for d in [&d1, &d2] {
            rt.catalog
                .add_link(
                    j.id,
                    EntityKind::Device,
                    LinkInput { entity_id: d.id, role: LinkRole::Target, poll_rate_override_ms: None, send_rate_override_ms: None },
                )
                .unwrap();
        }

        let sensor = rt.sensors.import(j.id, None, &[reading("cpu", 40.0)], true).remove(0);
        rt.sensors.assign_screen(j.id, sensor.id, d1.id, "S1").unwrap();
        rt.sensors.assign_screen(j.id, sensor.id, d1.id, "S2").unwrap();
        rt.sensors.assign_target(j.id, sensor.id, d2.id).unwrap();

        let e1 = Endpoint::Device { device: d1, broker: None, serial: None };
        let e2 = Endpoint::Device { device: d2, broker: None, serial: None };
        let first = send_cycle(&rt, &j, &e1).await;
        let second = send_cycle(&rt, &j, &e2).await;

        let all: Vec<&DeliveryOutcome> = first.deliveries.iter().chain(&second.deliveries).collect();
        assert_eq!(all.len(), 3);
        assert_eq!(all.iter().filter(|d| d.success).count(), 2);
        assert!(!first.failed());
        assert!(second.failed());
        assert_eq!(d1_mock.frames_of_type("sensor").len(), 2);
        let screens: Vec<String> = d1_mock
            .frames_of_type("sensor")
            .iter()
            .map(|f| f["screenId"].as_str().unwrap_or_default().to_string())
            .collect();
        assert!(screens.contains(&"S1".to_string()) && screens.contains(&"S2".to_string()));
    }

    #[tokio::test]
    async fn test_mqtt_delivery_publishes_both_variants() {
        let client = MockMqttClient::new();
        let rt = runtime(client.clone());
        let (j, endpoint) = mqtt_setup(&rt);

        let outcome = send_cycle(&rt, &j, &endpoint).await;
        assert!(outcome.deliveries[0].success);
        let frame = client.get_last_frame("home/panel/data").unwrap().unwrap();
        assert_eq!(frame["sensors"]["temp"][0]["Value"], "21.5");
        let broker_body: serde_json::Value = client
            .get_last_json_message("home/panel/sensors/all")
            .unwrap()
            .unwrap();
        assert_eq!(broker_body["temp"], 21.5);
        assert_eq!(outcome.mqtt_payload.as_deref(), Some(r#"{"temp":21.5}"#));
    }

    #[tokio::test]
    async fn test_mqtt_cycles_fail_while_broker_is_down() {
        let client = MockMqttClient::new();
        let rt = runtime_on(mock_pool_with(client.clone(), false));
        let (j, endpoint) = mqtt_setup(&rt);

        // Well past the client's request channel capacity.
        for _ in 0..100 {
            let outcome = tokio::time::timeout(Duration::from_secs(2), send_cycle(&rt, &j, &endpoint))
                .await
                .expect("send cycle must not stall");
            assert!(outcome.failed());
            assert!(outcome.error_summary().unwrap().contains("not connected"));
        }
        assert!(client.get_published_messages().is_empty());
        assert!(check_health(&rt, &j, &endpoint).await.is_err());
    }

    #[tokio::test]
    async fn test_refused_mqtt_publish_fails_the_cycle() {
        let client = MockMqttClient::new();
        let rt = runtime(client.clone());
        let (j, endpoint) = mqtt_setup(&rt);

        client.set_fail_publish(true);
        assert!(send_cycle(&rt, &j, &endpoint).await.failed());
        client.set_fail_publish(false);
        assert!(!send_cycle(&rt, &j, &endpoint).await.failed());
    }

    #[tokio::test]
    async fn test_large_delivery_is_split_across_frames() {
        let rt = runtime(MockMqttClient::new());
        let mock = MockDevice::start().await.unwrap();
        let j = rt
            .catalog
            .create_junction(Junction { name: "Bulk".into(), all_targets_all_data: true, ..Junction::default() })
            .unwrap();
        let readings: Vec<SensorReading> = (0..150).map(|i| reading(&format!("rate_{i}"), i as f64)).collect();
        rt.sensors.import(j.id, None, &readings, true);
        let device = Device { id: 4, name: "wall".into(), address: mock.address(), ..Device::default() };

        let outcome = send_cycle(&rt, &j, &Endpoint::Device { device, broker: None, serial: None }).await;
        assert_eq!(outcome.deliveries.len(), 1);
        assert!(outcome.deliveries[0].success, "{:?}", outcome.deliveries[0].error);

        let frames = mock.frames_of_type("sensor");
        assert!(frames.len() > 1);
        let delivered: usize = frames
            .iter()
            .map(|f| f["sensors"].as_object().map_or(0, |m| m.len()))
            .sum();
        assert_eq!(delivered, 150);
        assert!(outcome.payload.unwrap().body.len() <= payload::MAX_FRAME_LEN);
    }

    #[tokio::test]
    async fn test_gateway_posts_to_destination() {
        let rt = runtime(MockMqttClient::new());
        let gateway = MockDevice::start().await.unwrap();
        let j = rt
            .catalog
            .create_junction(Junction {
                name: "Gw".into(),
                junction_type: JunctionType::GatewayHttp,
                gateway_destination: Some(gateway.address()),
                all_targets_all_data: true,
                ..Junction::default()
            })
            .unwrap();
        rt.sensors.import(j.id, None, &[reading("a", 1.0)], true);
        let endpoint = Endpoint::Device {
            device: Device { id: 3, name: "behind-gw".into(), address: "10.255.0.1".into(), ..Device::default() },
            broker: None,
            serial: None,
        };
        let outcome = send_cycle(&rt, &j, &endpoint).await;
        assert!(outcome.deliveries[0].success);
        assert_eq!(gateway.frames_of_type("sensor").len(), 1);
    }

    #[tokio::test]
    async fn test_collector_target_gets_json_array() {
        let rt = runtime(MockMqttClient::new());
        let receiver = MockDevice::start().await.unwrap();
        let j = rt
            .catalog
            .create_junction(Junction { name: "Svc".into(), ..Junction::default() })
            .unwrap();
        rt.sensors.import(j.id, None, &[reading("a", 1.0)], true);
        let collector = Collector { name: "sink".into(), url: Some(receiver.base_url()), ..Collector::default() };

        let outcome = send_cycle(&rt, &j, &Endpoint::Collector(collector)).await;
        assert!(outcome.deliveries[0].success);
        let frames = receiver.frames();
        assert_eq!(frames[0][0]["ExternalId"], "a");
    }

    #[tokio::test]
    async fn test_warmup_sends_config_per_screen() {
        let rt = runtime(MockMqttClient::new());
        let mock = MockDevice::start().await.unwrap();
        let j = rt
            .catalog
            .create_junction(Junction { name: "Warm".into(), ..Junction::default() })
            .unwrap();
        let device = Device {
            id: 11,
            name: "panel".into(),
            address: mock.address(),
            screens: vec![screen("main"), screen("side")],
            ..Device::default()
        };
        let endpoint = Endpoint::Device { device, broker: None, serial: None };
        warmup(&rt, &j, &endpoint).await;
        assert_eq!(mock.frames_of_type("config").len(), 2);
        assert!(check_health(&rt, &j, &endpoint).await.is_ok());
    }
}
