//! Device wire payloads.
//!
//! Every frame sent to a device is `NNNNNNNN{json}`: eight zero-padded ASCII
//! digits giving the byte length of the JSON body. Firmware drops frames with
//! a length of zero or above [`MAX_FRAME_LEN`].

use serde_json::{json, Map, Value};

use crate::models::{PayloadPreview, Sensor};
use crate::transport::TransportError;

pub const MAX_FRAME_LEN: usize = 8192;

/// Wraps a JSON body in its length prefix.
pub fn frame(body: &Value) -> Result<PayloadPreview, TransportError> {
    let body = body.to_string();
    if body.is_empty() || body.len() > MAX_FRAME_LEN {
        return Err(TransportError::Frame(format!(
            "payload of {} bytes exceeds the {MAX_FRAME_LEN} byte frame limit",
            body.len()
        )));
    }
    Ok(PayloadPreview {
        prefix: format!("{:08}", body.len()),
        body,
    })
}

impl PayloadPreview {
    pub fn wire(&self) -> String {
        format!("{}{}", self.prefix, self.body)
    }
}

/// Tag a device routes on; falls back to the external id.
pub fn tag_of(sensor: &Sensor) -> &str {
    if sensor.sensor_tag.trim().is_empty() {
        &sensor.external_id
    } else {
        &sensor.sensor_tag
    }
}

/// `{"type":"sensor","screenId":..,"sensors":{tag:[{Value,Unit,Name,ExternalId}]}}`
pub fn sensor_payload(screen_id: Option<&str>, sensors: &[Sensor]) -> Value {
    let mut by_tag = Map::new();
    for s in sensors {
        let entry = json!({
            "Value": s.value.to_string(),
            "Unit": s.unit,
            "Name": s.name,
            "ExternalId": s.external_id,
        });
        match by_tag.get_mut(tag_of(s)) {
            Some(Value::Array(list)) => list.push(entry),
            _ => {
                by_tag.insert(tag_of(s).to_string(), Value::Array(vec![entry]));
            }
        }
    }
    let mut body = Map::new();
    body.insert("type".into(), json!("sensor"));
    if let Some(screen) = screen_id {
        body.insert("screenId".into(), json!(screen));
    }
    body.insert("sensors".into(), Value::Object(by_tag));
    Value::Object(body)
}

/// Sensor frames for one screen, split so that none exceeds [`MAX_FRAME_LEN`].
///
/// Sensors are packed greedily in order. Only a sensor too large for a frame
/// on its own is an error.
pub fn sensor_frames(screen_id: Option<&str>, sensors: &[Sensor]) -> Result<Vec<PayloadPreview>, TransportError> {
    if sensors.is_empty() {
        return Ok(vec![frame(&sensor_payload(screen_id, sensors))?]);
    }
    let mut frames = Vec::new();
    let mut pending: Option<PayloadPreview> = None;
    let (mut start, mut end) = (0, 0);
    while end < sensors.len() {
        match frame(&sensor_payload(screen_id, &sensors[start..=end])) {
            Ok(f) => {
                pending = Some(f);
                end += 1;
            }
            Err(e) => match pending.take() {
                Some(full) => {
                    frames.push(full);
                    start = end;
                }
                None => return Err(e),
            },
        }
    }
    frames.extend(pending);
    Ok(frames)
}

/// Sent once per screen at start so the firmware can register its tags.
pub fn config_payload(screen_id: Option<&str>, sensors: &[Sensor]) -> Value {
    let layout: Vec<Value> = sensors.iter().map(|s| json!({ "id": tag_of(s) })).collect();
    let mut body = Map::new();
    body.insert("type".into(), json!("config"));
    if let Some(screen) = screen_id {
        body.insert("screenId".into(), json!(screen));
    }
    body.insert("layout".into(), Value::Array(layout));
    Value::Object(body)
}

pub fn subscription_request(topics: &[String]) -> Value {
    json!({
        "type": "MQTT_Subscription_Request",
        "subscriptions": topics,
    })
}

/// Broker-formatted variant published next to the standard frame: `{tag: value}`.
pub fn broker_payload(sensors: &[Sensor]) -> Value {
    let map: Map<String, Value> = sensors
        .iter()
        .map(|s| (tag_of(s).to_string(), s.value.as_json()))
        .collect();
    Value::Object(map)
}

/// Body for plain HTTP receivers (collector targets).
pub fn service_payload(sensors: &[Sensor]) -> Value {
    Value::Array(
        sensors
            .iter()
            .map(|s| {
                json!({
                    "ExternalId": s.external_id,
                    "Name": s.name,
                    "SensorTag": tag_of(s),
                    "Value": s.value.as_json(),
                    "Unit": s.unit,
                })
            })
            .collect(),
    )
}
