/**
 * CONTROL API - REST surface of the Junction Engine
 *
 * ROLE:
 * Thin Axum layer over `Engine`. Every handler parses its request, calls one
 * engine operation and serialises the result; `EngineError` turns into a
 * structured `{error:{kind,message}}` body with the matching status code.
 *
 * ROUTES:
 * - /api/junctions, links, sensors and fan-out edges (administrative UI)
 * - /api/connections (runtime control and live status)
 * - /api/devices, /api/collectors, /api/services (entities, MQTT subscriptions)
 * - /api/notifications, /health, /api/system/health
 * - /ws/devices/{id} (WebSocket targets connect here)
 */

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::Response;
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

use crate::engine::Engine;
use crate::error::EngineResult;
use crate::health::{HealthTracker, KernelHealth};
use crate::models::{
    ActivePoller, ActiveStream, Collector, CollectorId, Device, DeviceId, EntityKind, Junction, JunctionExport,
    JunctionId, JunctionLinks, Link, LinkId, LinkInput, LinkRateUpdate, MqttSubscription, RunningStatus, Sensor,
    SensorId, SensorReading, SensorTarget, SensorUpdate, SortOrderRequest,
};
use crate::notifications::Notification;
use crate::transport::websocket::serve_socket;

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<Engine>,
    pub health_tracker: HealthTracker,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SelectBody {
    is_selected: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TargetBody {
    device_id: DeviceId,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ScreenBody {
    device_id: DeviceId,
    screen_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RemoveScreenQuery {
    device_id: DeviceId,
    screen_id: String,
}

#[derive(Debug, Deserialize)]
struct TopicBody {
    topic: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StreamsView {
    active_streams: Vec<ActiveStream>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PollersView {
    active_pollers: Vec<ActivePoller>,
}

#[derive(Serialize)]
struct StatusView {
    id: JunctionId,
    status: crate::models::JunctionStatus,
}

pub fn build_router(app_state: AppState) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/api/system/health", get(get_system_health))
        // junctions
        .route("/api/junctions", get(list_junctions).post(create_junction))
        .route("/api/junctions/sort-order", put(update_sort_order))
        .route("/api/junctions/import", post(import_junction))
        .route("/api/junctions/export/{id}", get(export_junction))
        .route(
            "/api/junctions/{id}",
            get(get_junction).put(update_junction).delete(delete_junction),
        )
        .route("/api/junctions/{id}/clone", post(clone_junction))
        // links
        .route("/api/junctions/{id}/links", get(get_links))
        .route("/api/junctions/{id}/links/available-sensors", get(available_sensors))
        .route("/api/junctions/{id}/links/device-links", post(add_device_link))
        .route("/api/junctions/{id}/links/device-links/{link_id}", axum::routing::delete(remove_device_link))
        .route("/api/junctions/{id}/links/device-links/{link_id}/update", put(update_device_link))
        .route("/api/junctions/{id}/links/collector-links", post(add_collector_link))
        .route(
            "/api/junctions/{id}/links/collector-links/{link_id}",
            axum::routing::delete(remove_collector_link),
        )
        .route("/api/junctions/{id}/links/collector-links/{link_id}/update", put(update_collector_link))
        .route("/api/junctions/{id}/links/{link_id}/delta", get(get_delta).post(import_delta))
        // sensors & fan-out
        .route("/api/sensors/junction-sensors/update", put(update_sensor))
        .route("/api/sensors/junction-sensors/{id}/device-select", put(select_sensor))
        .route("/api/sensors/junction-sensors/{id}/collector-select", put(select_sensor))
        .route("/api/sensors/junction-sensors/{id}/{sensor_id}/assign-target", post(assign_target))
        .route("/api/sensors/junction-sensors/{id}/{sensor_id}/assign-screen", post(assign_screen))
        .route(
            "/api/sensors/junction-sensors/{id}/{sensor_id}/remove-target/{device_id}",
            axum::routing::delete(remove_target),
        )
        .route(
            "/api/sensors/junction-sensors/{id}/{sensor_id}/remove-screen",
            axum::routing::delete(remove_screen),
        )
        // runtime
        .route("/api/connections/start/{id}", post(start_junction))
        .route("/api/connections/stop/{id}", post(stop_junction))
        .route("/api/connections/running", get(get_running))
        .route("/api/connections/streams", get(get_streams))
        .route("/api/connections/sensors/junction/{id}", get(live_sensors).post(inject_sensors))
        .route("/api/notifications", get(list_notifications))
        // entities
        .route("/api/devices", get(list_devices).post(create_device))
        .route("/api/devices/{id}", get(get_device).put(update_device).delete(delete_device))
        .route("/api/collectors", get(list_collectors).post(create_collector))
        .route("/api/collectors/pollers", get(get_pollers))
        .route(
            "/api/collectors/{id}",
            get(get_collector).put(update_collector).delete(delete_collector),
        )
        .route("/api/services/subscribe/{id}", post(subscribe))
        .route("/api/services/unsubscribe/{id}", post(unsubscribe))
        .route("/api/services/subscriptions/{id}", get(get_subscriptions))
        .route("/ws/devices/{id}", get(device_socket))
        .with_state(app_state)
}

// GET /api/system/health
async fn get_system_health(State(app): State<AppState>) -> Json<KernelHealth> {
    Json(app.health_tracker.get_health(app.engine.counts()))
}

// ---------------------------------------------------------------------------
// Junctions
// ---------------------------------------------------------------------------

// GET /api/junctions
async fn list_junctions(State(app): State<AppState>) -> Json<Vec<Junction>> {
    Json(app.engine.list_junctions())
}

// GET /api/junctions/{id}
async fn get_junction(State(app): State<AppState>, Path(id): Path<JunctionId>) -> EngineResult<Json<Junction>> {
    Ok(Json(app.engine.junction(id)?))
}

// POST /api/junctions
async fn create_junction(
    State(app): State<AppState>,
    Json(body): Json<Value>,
) -> EngineResult<(StatusCode, Json<Junction>)> {
    let junction = app.engine.create_junction(body).await?;
    Ok((StatusCode::CREATED, Json(junction)))
}

// PUT /api/junctions/{id}
async fn update_junction(
    State(app): State<AppState>,
    Path(id): Path<JunctionId>,
    Json(body): Json<Value>,
) -> EngineResult<Json<Junction>> {
    Ok(Json(app.engine.update_junction(id, body).await?))
}

// DELETE /api/junctions/{id}
async fn delete_junction(State(app): State<AppState>, Path(id): Path<JunctionId>) -> EngineResult<Json<Junction>> {
    Ok(Json(app.engine.delete_junction(id).await?))
}

// POST /api/junctions/{id}/clone
async fn clone_junction(
    State(app): State<AppState>,
    Path(id): Path<JunctionId>,
) -> EngineResult<(StatusCode, Json<Junction>)> {
    let copy = app.engine.clone_junction(id).await?;
    Ok((StatusCode::CREATED, Json(copy)))
}

// PUT /api/junctions/sort-order
async fn update_sort_order(
    State(app): State<AppState>,
    Json(req): Json<SortOrderRequest>,
) -> EngineResult<Json<Vec<Junction>>> {
    app.engine.update_sort_order(&req.updates).await?;
    Ok(Json(app.engine.list_junctions()))
}

// GET /api/junctions/export/{id}
async fn export_junction(
    State(app): State<AppState>,
    Path(id): Path<JunctionId>,
) -> EngineResult<Json<JunctionExport>> {
    Ok(Json(app.engine.export_junction(id)?))
}

// POST /api/junctions/import
async fn import_junction(
    State(app): State<AppState>,
    Json(doc): Json<JunctionExport>,
) -> EngineResult<(StatusCode, Json<Junction>)> {
    let junction = app.engine.import_junction(doc).await?;
    Ok((StatusCode::CREATED, Json(junction)))
}

// ---------------------------------------------------------------------------
// Links
// ---------------------------------------------------------------------------

// GET /api/junctions/{id}/links
async fn get_links(State(app): State<AppState>, Path(id): Path<JunctionId>) -> EngineResult<Json<JunctionLinks>> {
    Ok(Json(app.engine.links(id)?))
}

// GET /api/junctions/{id}/links/available-sensors
async fn available_sensors(
    State(app): State<AppState>,
    Path(id): Path<JunctionId>,
) -> EngineResult<Json<Vec<Sensor>>> {
    Ok(Json(app.engine.available_sensors(id)?))
}

async fn add_link(app: &AppState, id: JunctionId, kind: EntityKind, input: LinkInput) -> EngineResult<(StatusCode, Json<Link>)> {
    let link = app.engine.add_link(id, kind, input).await?;
    Ok((StatusCode::CREATED, Json(link)))
}

// POST /api/junctions/{id}/links/device-links
async fn add_device_link(
    State(app): State<AppState>,
    Path(id): Path<JunctionId>,
    Json(input): Json<LinkInput>,
) -> EngineResult<(StatusCode, Json<Link>)> {
    add_link(&app, id, EntityKind::Device, input).await
}

// POST /api/junctions/{id}/links/collector-links
async fn add_collector_link(
    State(app): State<AppState>,
    Path(id): Path<JunctionId>,
    Json(input): Json<LinkInput>,
) -> EngineResult<(StatusCode, Json<Link>)> {
    add_link(&app, id, EntityKind::Collector, input).await
}

// DELETE /api/junctions/{id}/links/device-links/{link_id}
async fn remove_device_link(
    State(app): State<AppState>,
    Path((id, link_id)): Path<(JunctionId, LinkId)>,
) -> EngineResult<Json<Link>> {
    Ok(Json(app.engine.remove_link(id, EntityKind::Device, link_id).await?))
}

// DELETE /api/junctions/{id}/links/collector-links/{link_id}
async fn remove_collector_link(
    State(app): State<AppState>,
    Path((id, link_id)): Path<(JunctionId, LinkId)>,
) -> EngineResult<Json<Link>> {
    Ok(Json(app.engine.remove_link(id, EntityKind::Collector, link_id).await?))
}

// PUT /api/junctions/{id}/links/device-links/{link_id}/update
async fn update_device_link(
    State(app): State<AppState>,
    Path((id, link_id)): Path<(JunctionId, LinkId)>,
    Json(update): Json<LinkRateUpdate>,
) -> EngineResult<Json<Link>> {
    Ok(Json(app.engine.update_link(id, EntityKind::Device, link_id, update).await?))
}

// PUT /api/junctions/{id}/links/collector-links/{link_id}/update
async fn update_collector_link(
    State(app): State<AppState>,
    Path((id, link_id)): Path<(JunctionId, LinkId)>,
    Json(update): Json<LinkRateUpdate>,
) -> EngineResult<Json<Link>> {
    Ok(Json(app.engine.update_link(id, EntityKind::Collector, link_id, update).await?))
}

// GET /api/junctions/{id}/links/{link_id}/delta
async fn get_delta(
    State(app): State<AppState>,
    Path((id, link_id)): Path<(JunctionId, LinkId)>,
) -> EngineResult<Json<Vec<SensorReading>>> {
    Ok(Json(app.engine.delta(id, link_id).await?))
}

// POST /api/junctions/{id}/links/{link_id}/delta
async fn import_delta(
    State(app): State<AppState>,
    Path((id, link_id)): Path<(JunctionId, LinkId)>,
) -> EngineResult<Json<Vec<Sensor>>> {
    Ok(Json(app.engine.import_delta(id, link_id).await?))
}

// ---------------------------------------------------------------------------
// Sensors & fan-out
// ---------------------------------------------------------------------------

// PUT /api/sensors/junction-sensors/{id}/{device|collector}-select
async fn select_sensor(
    State(app): State<AppState>,
    Path(id): Path<SensorId>,
    Json(body): Json<SelectBody>,
) -> EngineResult<Json<Sensor>> {
    Ok(Json(app.engine.select_sensor(id, body.is_selected).await?))
}

// PUT /api/sensors/junction-sensors/update
async fn update_sensor(State(app): State<AppState>, Json(update): Json<SensorUpdate>) -> EngineResult<Json<Sensor>> {
    Ok(Json(app.engine.update_sensor(&update).await?))
}

// POST /api/sensors/junction-sensors/{id}/{sensor_id}/assign-target
async fn assign_target(
    State(app): State<AppState>,
    Path((id, sensor_id)): Path<(JunctionId, SensorId)>,
    Json(body): Json<TargetBody>,
) -> EngineResult<Json<Vec<SensorTarget>>> {
    Ok(Json(app.engine.assign_target(id, sensor_id, body.device_id).await?))
}

// POST /api/sensors/junction-sensors/{id}/{sensor_id}/assign-screen
async fn assign_screen(
    State(app): State<AppState>,
    Path((id, sensor_id)): Path<(JunctionId, SensorId)>,
    Json(body): Json<ScreenBody>,
) -> EngineResult<Json<Vec<SensorTarget>>> {
    Ok(Json(
        app.engine
            .assign_screen(id, sensor_id, body.device_id, &body.screen_id)
            .await?,
    ))
}

// DELETE /api/sensors/junction-sensors/{id}/{sensor_id}/remove-target/{device_id}
async fn remove_target(
    State(app): State<AppState>,
    Path((id, sensor_id, device_id)): Path<(JunctionId, SensorId, DeviceId)>,
) -> EngineResult<Json<Vec<SensorTarget>>> {
    Ok(Json(app.engine.remove_target(id, sensor_id, device_id).await?))
}

// DELETE /api/sensors/junction-sensors/{id}/{sensor_id}/remove-screen?deviceId=&screenId=
async fn remove_screen(
    State(app): State<AppState>,
    Path((id, sensor_id)): Path<(JunctionId, SensorId)>,
    Query(q): Query<RemoveScreenQuery>,
) -> EngineResult<Json<Vec<SensorTarget>>> {
    Ok(Json(
        app.engine
            .remove_screen(id, sensor_id, q.device_id, &q.screen_id)
            .await?,
    ))
}

// ---------------------------------------------------------------------------
// Runtime control & status
// ---------------------------------------------------------------------------

// POST /api/connections/start/{id}
async fn start_junction(State(app): State<AppState>, Path(id): Path<JunctionId>) -> EngineResult<Json<StatusView>> {
    let status = app.engine.start(id).await?;
    Ok(Json(StatusView { id, status }))
}

// POST /api/connections/stop/{id}
async fn stop_junction(State(app): State<AppState>, Path(id): Path<JunctionId>) -> EngineResult<Json<StatusView>> {
    let status = app.engine.stop(id).await?;
    Ok(Json(StatusView { id, status }))
}

// GET /api/connections/running
async fn get_running(State(app): State<AppState>) -> Json<Vec<RunningStatus>> {
    Json(app.engine.running())
}

// GET /api/connections/streams
async fn get_streams(State(app): State<AppState>) -> Json<StreamsView> {
    Json(StreamsView { active_streams: app.engine.streams() })
}

// GET /api/collectors/pollers
async fn get_pollers(State(app): State<AppState>) -> Json<PollersView> {
    Json(PollersView { active_pollers: app.engine.pollers() })
}

// GET /api/connections/sensors/junction/{id}
async fn live_sensors(State(app): State<AppState>, Path(id): Path<JunctionId>) -> EngineResult<Json<Vec<Sensor>>> {
    Ok(Json(app.engine.live_sensors(id)?))
}

// POST /api/connections/sensors/junction/{id}
async fn inject_sensors(
    State(app): State<AppState>,
    Path(id): Path<JunctionId>,
    Json(readings): Json<Vec<SensorReading>>,
) -> EngineResult<Json<Vec<Sensor>>> {
    Ok(Json(app.engine.inject(id, readings).await?))
}

// GET /api/notifications
async fn list_notifications(State(app): State<AppState>) -> Json<Vec<Notification>> {
    Json(app.engine.notifications())
}

// ---------------------------------------------------------------------------
// Devices, collectors, MQTT subscriptions
// ---------------------------------------------------------------------------

// GET /api/devices
async fn list_devices(State(app): State<AppState>) -> Json<Vec<Device>> {
    Json(app.engine.list_devices())
}

// GET /api/devices/{id}
async fn get_device(State(app): State<AppState>, Path(id): Path<DeviceId>) -> EngineResult<Json<Device>> {
    Ok(Json(app.engine.device(id)?))
}

// POST /api/devices
async fn create_device(
    State(app): State<AppState>,
    Json(device): Json<Device>,
) -> EngineResult<(StatusCode, Json<Device>)> {
    let device = app.engine.create_device(device).await?;
    Ok((StatusCode::CREATED, Json(device)))
}

// PUT /api/devices/{id}
async fn update_device(
    State(app): State<AppState>,
    Path(id): Path<DeviceId>,
    Json(device): Json<Device>,
) -> EngineResult<Json<Device>> {
    Ok(Json(app.engine.update_device(id, device).await?))
}

// DELETE /api/devices/{id}
async fn delete_device(State(app): State<AppState>, Path(id): Path<DeviceId>) -> EngineResult<Json<Device>> {
    Ok(Json(app.engine.delete_device(id).await?))
}

// GET /api/collectors
async fn list_collectors(State(app): State<AppState>) -> Json<Vec<Collector>> {
    Json(app.engine.list_collectors())
}

// GET /api/collectors/{id}
async fn get_collector(State(app): State<AppState>, Path(id): Path<CollectorId>) -> EngineResult<Json<Collector>> {
    Ok(Json(app.engine.collector(id)?))
}

// POST /api/collectors
async fn create_collector(
    State(app): State<AppState>,
    Json(collector): Json<Collector>,
) -> EngineResult<(StatusCode, Json<Collector>)> {
    let collector = app.engine.create_collector(collector).await?;
    Ok((StatusCode::CREATED, Json(collector)))
}

// PUT /api/collectors/{id}
async fn update_collector(
    State(app): State<AppState>,
    Path(id): Path<CollectorId>,
    Json(collector): Json<Collector>,
) -> EngineResult<Json<Collector>> {
    Ok(Json(app.engine.update_collector(id, collector).await?))
}

// DELETE /api/collectors/{id}
async fn delete_collector(
    State(app): State<AppState>,
    Path(id): Path<CollectorId>,
) -> EngineResult<Json<Collector>> {
    Ok(Json(app.engine.delete_collector(id).await?))
}

// POST /api/services/subscribe/{id}
async fn subscribe(
    State(app): State<AppState>,
    Path(id): Path<CollectorId>,
    Json(sub): Json<MqttSubscription>,
) -> EngineResult<Json<Vec<MqttSubscription>>> {
    Ok(Json(app.engine.subscribe(id, sub).await?))
}

// POST /api/services/unsubscribe/{id}
async fn unsubscribe(
    State(app): State<AppState>,
    Path(id): Path<CollectorId>,
    Json(body): Json<TopicBody>,
) -> EngineResult<Json<Vec<MqttSubscription>>> {
    Ok(Json(app.engine.unsubscribe(id, &body.topic).await?))
}

// GET /api/services/subscriptions/{id}
async fn get_subscriptions(
    State(app): State<AppState>,
    Path(id): Path<CollectorId>,
) -> EngineResult<Json<Vec<MqttSubscription>>> {
    Ok(Json(app.engine.subscriptions(id)?))
}

// GET /ws/devices/{id}
async fn device_socket(
    State(app): State<AppState>,
    Path(id): Path<DeviceId>,
    ws: WebSocketUpgrade,
) -> EngineResult<Response> {
    app.engine.device(id)?;
    let hub = app.engine.runtime().transports.websocket.clone();
    Ok(ws.on_upgrade(move |socket| serve_socket(hub, id, socket)))
}
