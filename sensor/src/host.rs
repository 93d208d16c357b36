use std::time::Duration;

use anyhow::Context;
use rumqttc::{AsyncClient, Event, Incoming, MqttOptions, QoS};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use offset_thermostat_common::{entity_set_topic, entity_state_topic};

// The valve's own sensor sits near the radiator and reads warmer than the room.
const VALVE_SENSOR_BIAS: f64 = 1.5;
const HEAT_GAIN_PER_MIN: f64 = 0.2;
const WALL_LOSS_PER_MIN: f64 = 0.01;
const WINDOW_LOSS_PER_MIN: f64 = 0.08;
const WINDOW_OPEN_TICKS: u64 = 4;

#[derive(Debug, Clone, PartialEq)]
struct RoomModel {
    temperature: f64,
    outdoor: f64,
    window_open: bool,
}

impl RoomModel {
    fn step(&mut self, setpoint: Option<f64>, elapsed: Duration) {
        let heating = setpoint
            .map(|setpoint| (setpoint - VALVE_SENSOR_BIAS - self.temperature).max(0.0))
            .unwrap_or(0.0)
            * HEAT_GAIN_PER_MIN;
        let loss_rate = if self.window_open {
            WINDOW_LOSS_PER_MIN
        } else {
            WALL_LOSS_PER_MIN
        };
        let loss = (self.temperature - self.outdoor) * loss_rate;
        self.temperature += (heating - loss) * elapsed.as_secs_f64() / 60.0;
    }
}

struct Entities {
    climate: String,
    room: String,
    window: String,
}

impl Entities {
    fn from_env() -> Self {
        let var = |name: &str, fallback: &str| {
            std::env::var(name).unwrap_or_else(|_| fallback.to_string())
        };
        Self {
            climate: var("SIM_CLIMATE_ENTITY", "climate.living_trv"),
            room: var("SIM_ROOM_ENTITY", "sensor.living_temperature"),
            window: var("SIM_WINDOW_ENTITY", "binary_sensor.living_window"),
        }
    }
}

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let mqtt_host = std::env::var("MQTT_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
    let mqtt_port = std::env::var("MQTT_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(1883);
    let tick_seconds = std::env::var("SIM_TICK_SECONDS")
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .filter(|seconds| *seconds > 0)
        .unwrap_or(30);
    // Ticks between simulated window openings; 0 keeps it shut.
    let window_period = std::env::var("SIM_WINDOW_PERIOD")
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .unwrap_or(0);

    let mut mqtt_options = MqttOptions::new("offset-thermostat-sensor", mqtt_host, mqtt_port);

    if let Ok(user) = std::env::var("MQTT_USER") {
        let pass = std::env::var("MQTT_PASS").unwrap_or_default();
        mqtt_options.set_credentials(user, pass);
    }

    let (mqtt, eventloop) = AsyncClient::new(mqtt_options, 32);
    let entities = Entities::from_env();
    let setpoint = spawn_valve_listener(mqtt.clone(), eventloop, &entities.climate);

    mqtt.publish(
        entity_state_topic(&entities.climate),
        QoS::AtLeastOnce,
        true,
        "heat",
    )
    .await
    .context("failed to publish valve state")?;

    info!(
        climate = %entities.climate,
        room = %entities.room,
        window = %entities.window,
        "room simulator started"
    );

    let mut room = RoomModel {
        temperature: 18.0,
        outdoor: 8.0,
        window_open: false,
    };
    let elapsed = Duration::from_secs(tick_seconds);
    let mut tick: u64 = 0;
    let mut interval = tokio::time::interval(elapsed);

    loop {
        interval.tick().await;
        tick = tick.saturating_add(1);

        room.window_open = window_period > 0 && tick % window_period < WINDOW_OPEN_TICKS;
        let commanded = *setpoint.borrow();
        room.step(commanded, elapsed);
        debug!(temperature = room.temperature, setpoint = ?commanded, "room step");

        mqtt.publish(
            entity_state_topic(&entities.room),
            QoS::AtLeastOnce,
            true,
            format!("{:.2}", room.temperature),
        )
        .await
        .context("failed to publish room temperature")?;
        mqtt.publish(
            entity_state_topic(&entities.window),
            QoS::AtLeastOnce,
            true,
            if room.window_open { "on" } else { "off" },
        )
        .await
        .context("failed to publish window state")?;
    }
}

/// Drives the MQTT event loop and exposes the last setpoint sent to the valve.
fn spawn_valve_listener(
    mqtt: AsyncClient,
    mut eventloop: rumqttc::EventLoop,
    climate: &str,
) -> watch::Receiver<Option<f64>> {
    let set_topic = entity_set_topic(climate);
    let (setpoint_tx, setpoint) = watch::channel(None);

    tokio::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Incoming::Publish(message))) if message.topic == set_topic => {
                    let parsed = std::str::from_utf8(&message.payload)
                        .ok()
                        .and_then(|raw| raw.trim().parse::<f64>().ok())
                        .filter(|value| value.is_finite());
                    match parsed {
                        Some(value) => {
                            info!(setpoint = value, "valve setpoint received");
                            setpoint_tx.send_replace(Some(value));
                        }
                        None => warn!("ignoring malformed valve setpoint"),
                    }
                }
                Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                    if let Err(err) = mqtt.try_subscribe(set_topic.clone(), QoS::AtLeastOnce) {
                        warn!("sensor mqtt subscribe failed: {err}");
                    }
                }
                Ok(_) => {}
                Err(err) => {
                    warn!("sensor mqtt poll error: {err}");
                    tokio::time::sleep(Duration::from_secs(2)).await;
                }
            }
        }
    });

    setpoint
}
