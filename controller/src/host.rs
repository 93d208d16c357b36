use std::{
    collections::HashMap, io::ErrorKind, net::SocketAddr, path::PathBuf, sync::Arc,
    time::Duration,
};

use anyhow::Context;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use offset_thermostat_common::{
    controller_state_topic, entity_set_topic, parse_inbound, ControllerOptions, ControllerStatus,
    InboundTopic, RuntimeConfig, CMND_BOOST, CMND_RESET, CMND_TARGET, CMND_TRIGGER,
    TOPIC_CONTROLLER_CMND_WILDCARD, TOPIC_ENTITY_STATE_WILDCARD,
};
use rumqttc::{AsyncClient, ClientError, Event, Incoming, MqttOptions, QoS};
use serde::{Deserialize, Serialize};
use tokio::{
    net::TcpListener,
    sync::{watch, Mutex},
};
use tracing::{debug, info, warn};

use crate::{
    entities::EntityStates,
    instance::{spawn_instance, Actuator, ControllerHandle, Trigger},
    store::OffsetStore,
};

const MAX_MQTT_PAYLOAD_BYTES: usize = 512;
const COMMAND_REPLY_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Clone)]
struct AppState {
    controllers: Arc<HashMap<String, ControllerHandle>>,
    runtime: Arc<Mutex<RuntimeConfig>>,
    entities: EntityStates,
    store: AppStore,
}

#[derive(Clone)]
struct AppStore {
    runtime_path: Arc<PathBuf>,
    offsets_path: Arc<PathBuf>,
    lock: Arc<Mutex<()>>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

#[derive(Debug, Deserialize)]
struct TriggerParams {
    #[serde(default)]
    force: bool,
}

/// Publishes setpoints to the valve's set topic without waiting on the broker.
struct MqttActuator {
    mqtt: AsyncClient,
}

impl Actuator for MqttActuator {
    fn set_target_temperature(&self, entity: &str, value: f64) {
        let topic = entity_set_topic(entity);
        if let Err(err) = self
            .mqtt
            .try_publish(topic, QoS::AtLeastOnce, false, value.to_string())
        {
            warn!(entity, "setpoint publish failed: {err}");
        }
    }
}

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let store = AppStore::new();
    let mut runtime = store.load_runtime_config().await.unwrap_or_else(|err| {
        warn!("failed to load runtime config from store: {err:#}");
        RuntimeConfig::default()
    });
    if runtime.normalize() {
        if let Err(err) = store.save_runtime_config(&runtime).await {
            warn!("failed to persist migrated runtime config: {err:#}");
        }
    }

    let offsets = Arc::new(OffsetStore::new(store.offsets_path.as_ref()));
    match offsets.load().await {
        Ok(count) => info!(count, "loaded learned offsets"),
        Err(err) => warn!(
            path = %offsets.path().display(),
            "failed to load learned offsets, starting from zero: {err}"
        ),
    }

    let mqtt_host = std::env::var("MQTT_HOST").unwrap_or(runtime.network.mqtt_host.clone());
    let mqtt_port = std::env::var("MQTT_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(runtime.network.mqtt_port);

    let mut mqtt_options = MqttOptions::new("offset-thermostat-controller", mqtt_host, mqtt_port);
    let mqtt_user = std::env::var("MQTT_USER").unwrap_or(runtime.network.mqtt_user.clone());
    let mqtt_pass = std::env::var("MQTT_PASS").unwrap_or(runtime.network.mqtt_pass.clone());
    if !mqtt_user.is_empty() {
        mqtt_options.set_credentials(mqtt_user, mqtt_pass);
    }
    mqtt_options.set_keep_alive(Duration::from_secs(30));

    let (mqtt, eventloop) = AsyncClient::new(mqtt_options, 64);

    let entities = EntityStates::new();
    let actuator: Arc<dyn Actuator> = Arc::new(MqttActuator { mqtt: mqtt.clone() });
    let mut controllers = HashMap::new();
    for instance in &runtime.instances {
        if let Err(err) = instance.validate() {
            warn!("skipping controller: {err}");
            continue;
        }
        let handle = spawn_instance(
            instance.clone(),
            offsets.clone(),
            entities.clone(),
            actuator.clone(),
        );
        spawn_state_publish_loop(mqtt.clone(), &handle);
        controllers.insert(instance.id.clone(), handle);
    }
    if controllers.is_empty() {
        warn!(
            path = %store.runtime_path.display(),
            "no controller instances configured"
        );
    }

    let port = std::env::var("CONTROLLER_HTTP_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(runtime.http_port);

    let app_state = AppState {
        controllers: Arc::new(controllers),
        runtime: Arc::new(Mutex::new(runtime)),
        entities,
        store,
    };

    spawn_mqtt_loop(app_state.clone(), mqtt, eventloop);

    let app = Router::new()
        .route("/api/controllers", get(handle_list_controllers))
        .route("/api/controllers/{id}", get(handle_get_controller))
        .route("/api/controllers/{id}/target", post(handle_set_target))
        .route("/api/controllers/{id}/options", put(handle_put_options))
        .route(
            "/api/controllers/{id}/boost",
            post(handle_start_boost).delete(handle_cancel_boost),
        )
        .route("/api/controllers/{id}/offset/reset", post(handle_reset_offset))
        .route("/api/controllers/{id}/trigger", post(handle_trigger))
        .with_state(app_state.clone());

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind controller server at {addr}"))?;

    info!("controller listening on http://{addr}");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("controller server failed")?;

    for handle in app_state.controllers.values() {
        handle.shutdown().await;
    }
    info!("controller shut down");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!("failed to listen for ctrl-c, running until killed: {err}");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}

fn subscribe_topics(mqtt: &AsyncClient) -> Result<(), ClientError> {
    for topic in [TOPIC_ENTITY_STATE_WILDCARD, TOPIC_CONTROLLER_CMND_WILDCARD] {
        mqtt.try_subscribe(topic, QoS::AtMostOnce)?;
    }
    Ok(())
}

fn spawn_mqtt_loop(app_state: AppState, mqtt: AsyncClient, mut eventloop: rumqttc::EventLoop) {
    tokio::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Incoming::Publish(message))) => {
                    if let Err(err) =
                        handle_mqtt_message(&app_state, message.topic, message.payload.to_vec())
                            .await
                    {
                        warn!("mqtt message handling error: {err:#}");
                    }
                }
                Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                    info!("mqtt connected");
                    // A clean session forgets subscriptions across reconnects.
                    if let Err(err) = subscribe_topics(&mqtt) {
                        warn!("mqtt subscribe failed: {err}");
                    }
                }
                Ok(_) => {}
                Err(err) => {
                    warn!("mqtt poll error: {err}");
                    tokio::time::sleep(Duration::from_secs(2)).await;
                }
            }
        }
    });
}

fn spawn_state_publish_loop(mqtt: AsyncClient, handle: &ControllerHandle) {
    let topic = controller_state_topic(handle.id());
    let mut status = handle.subscribe();

    tokio::spawn(async move {
        loop {
            let payload = serde_json::to_vec(&*status.borrow_and_update());
            match payload {
                Ok(body) => {
                    if let Err(err) = mqtt
                        .publish(topic.clone(), QoS::AtLeastOnce, true, body)
                        .await
                    {
                        warn!(topic, "controller state publish failed: {err}");
                    }
                }
                Err(err) => warn!(topic, "controller state serialization failed: {err}"),
            }

            // Closed once the controller task has stopped.
            if status.changed().await.is_err() {
                break;
            }
        }
    });
}

async fn handle_mqtt_message(
    app_state: &AppState,
    topic: String,
    payload: Vec<u8>,
) -> anyhow::Result<()> {
    if payload.len() > MAX_MQTT_PAYLOAD_BYTES {
        warn!(
            "dropping oversized MQTT payload on topic {} ({} bytes)",
            topic,
            payload.len()
        );
        return Ok(());
    }

    let message = String::from_utf8(payload).context("non utf8 mqtt payload")?;
    let message = message.trim();

    match parse_inbound(&topic) {
        Some(InboundTopic::EntityState { entity }) => {
            // An empty retained payload clears the entity.
            if message.is_empty() {
                app_state.entities.remove(entity);
            } else {
                app_state.entities.update(entity, message);
            }
        }
        Some(InboundTopic::ControllerCommand { id, command }) => {
            let Some(handle) = app_state.controllers.get(id) else {
                debug!(controller = id, "command for unknown controller");
                return Ok(());
            };

            let trigger = match command {
                CMND_TARGET => {
                    let value = message
                        .parse::<f64>()
                        .ok()
                        .filter(|value| value.is_finite())
                        .with_context(|| format!("invalid target temperature {message:?}"))?;
                    apply_target(app_state, handle, value).await?;
                    return Ok(());
                }
                CMND_BOOST => match message.to_ascii_lowercase().as_str() {
                    "on" | "start" | "true" | "1" => Trigger::StartBoost,
                    "off" | "cancel" | "stop" | "false" | "0" => Trigger::CancelBoost,
                    other => anyhow::bail!("unknown boost payload {other:?}"),
                },
                CMND_RESET => Trigger::ResetOffset,
                CMND_TRIGGER => Trigger::Evaluate {
                    force: message.eq_ignore_ascii_case("force"),
                },
                other => {
                    debug!(controller = id, command = other, "unknown controller command");
                    return Ok(());
                }
            };
            handle.send(trigger).await?;
        }
        None => {}
    }

    Ok(())
}

/// Clamps a new room target to the valve range, stores it in the options
/// layer and hands it to the controller. Returns the applied target.
async fn apply_target(
    state: &AppState,
    handle: &ControllerHandle,
    value: f64,
) -> anyhow::Result<f64> {
    let mut runtime = state.runtime.lock().await;
    let instance = runtime
        .instance_mut(handle.id())
        .with_context(|| format!("controller {} missing from runtime config", handle.id()))?;
    let config = instance.resolve();
    let target = value.clamp(config.trv_min, config.trv_max);
    instance.set_room_target(target);

    handle.send(Trigger::SetTarget(target)).await?;
    info!(controller = handle.id(), target, "room target changed");

    state
        .store
        .save_runtime_config(&runtime)
        .await
        .context("failed to persist target update")?;
    Ok(target)
}

async fn handle_list_controllers(State(state): State<AppState>) -> impl IntoResponse {
    let mut statuses: Vec<ControllerStatus> = state
        .controllers
        .values()
        .map(ControllerHandle::status)
        .collect();
    statuses.sort_by(|a, b| a.id.cmp(&b.id));
    Json(statuses)
}

async fn handle_get_controller(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Response {
    match state.controllers.get(&id) {
        Some(handle) => Json(handle.status()).into_response(),
        None => unknown_controller(&id),
    }
}

async fn handle_set_target(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let Some(handle) = state.controllers.get(&id) else {
        return unknown_controller(&id);
    };
    let Some(value) = params.get("value") else {
        return error_response(StatusCode::BAD_REQUEST, "Missing 'value' parameter");
    };
    let Some(value) = value.parse::<f64>().ok().filter(|value| value.is_finite()) else {
        return error_response(StatusCode::BAD_REQUEST, "Invalid temperature value");
    };

    let status = fresh_status(handle);
    if let Err(err) = apply_target(&state, handle, value).await {
        warn!("failed to apply target update: {err:#}");
        return error_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to apply target");
    }
    reply_with_status(status).await
}

async fn handle_put_options(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(update): Json<ControllerOptions>,
) -> Response {
    if !state.controllers.contains_key(&id) {
        return unknown_controller(&id);
    }

    let instance = {
        let mut runtime = state.runtime.lock().await;
        let Some(mut instance) = runtime.instance(&id).cloned() else {
            return unknown_controller(&id);
        };
        if let Err(err) = instance.apply_options(update) {
            return error_response(StatusCode::BAD_REQUEST, &err.to_string());
        }

        let Some(slot) = runtime.instance_mut(&id) else {
            return unknown_controller(&id);
        };
        let previous = std::mem::replace(slot, instance.clone());
        if let Err(err) = state.store.save_runtime_config(&runtime).await {
            warn!("failed to persist controller options: {err:#}");
            if let Some(slot) = runtime.instance_mut(&id) {
                *slot = previous;
            }
            return error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to persist controller options",
            );
        }
        instance
    };

    info!(controller = %id, "controller options updated");
    dispatch(&state, &id, Trigger::Reconfigure(Box::new(instance))).await
}

async fn handle_start_boost(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    dispatch(&state, &id, Trigger::StartBoost).await
}

async fn handle_cancel_boost(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    dispatch(&state, &id, Trigger::CancelBoost).await
}

async fn handle_reset_offset(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    dispatch(&state, &id, Trigger::ResetOffset).await
}

async fn handle_trigger(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(params): Query<TriggerParams>,
) -> Response {
    dispatch(&state, &id, Trigger::Evaluate { force: params.force }).await
}

async fn dispatch(state: &AppState, id: &str, trigger: Trigger) -> Response {
    let Some(handle) = state.controllers.get(id) else {
        return unknown_controller(id);
    };

    let status = fresh_status(handle);
    if let Err(err) = handle.send(trigger).await {
        warn!("{err}");
        return error_response(StatusCode::INTERNAL_SERVER_ERROR, "Controller is not running");
    }
    reply_with_status(status).await
}

fn fresh_status(handle: &ControllerHandle) -> watch::Receiver<ControllerStatus> {
    let mut status = handle.subscribe();
    status.mark_unchanged();
    status
}

/// Waits briefly for the evaluation a command caused, then answers with the
/// latest snapshot either way.
async fn reply_with_status(mut status: watch::Receiver<ControllerStatus>) -> Response {
    if tokio::time::timeout(COMMAND_REPLY_TIMEOUT, status.changed())
        .await
        .is_err()
    {
        debug!("no fresh controller status before reply timeout");
    }
    let snapshot = status.borrow().clone();
    Json(snapshot).into_response()
}

impl AppStore {
    fn new() -> Self {
        let data_dir = std::env::var("OFFSET_THERMOSTAT_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./.offset-thermostat"));

        Self {
            runtime_path: Arc::new(data_dir.join("runtime.json")),
            offsets_path: Arc::new(data_dir.join("offsets.json")),
            lock: Arc::new(Mutex::new(())),
        }
    }

    async fn load_runtime_config(&self) -> anyhow::Result<RuntimeConfig> {
        let _guard = self.lock.lock().await;
        match tokio::fs::read(self.runtime_path.as_ref()).await {
            Ok(raw) => Ok(serde_json::from_slice::<RuntimeConfig>(&raw)
                .with_context(|| format!("invalid {}", self.runtime_path.display()))?),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(RuntimeConfig::default()),
            Err(err) => Err(err.into()),
        }
    }

    async fn save_runtime_config(&self, runtime: &RuntimeConfig) -> anyhow::Result<()> {
        let _guard = self.lock.lock().await;
        let path = self.runtime_path.as_ref().clone();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let payload = serde_json::to_vec_pretty(runtime)?;
        tokio::fs::write(path, payload).await?;
        Ok(())
    }
}

fn unknown_controller(id: &str) -> Response {
    error_response(StatusCode::NOT_FOUND, &format!("Unknown controller '{id}'"))
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (
        status,
        Json(ErrorBody {
            error: message.to_string(),
        }),
    )
        .into_response()
}
