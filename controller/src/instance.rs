use std::{sync::Arc, time::Duration};

use offset_thermostat_common::{
    window, ControllerConfig, ControllerStatus, InstanceConfig, OffsetEngine, Readings,
};
use thiserror::Error;
use tokio::{
    sync::{broadcast, mpsc, watch, Mutex},
    task::JoinHandle,
    time::{Instant, Interval, MissedTickBehavior},
};
use tracing::{debug, info, warn};

use crate::{entities::EntityStates, store::OffsetStore};

const TRIGGER_CHANNEL_CAPACITY: usize = 32;

/// Receives setpoint commands. Implementations must not block.
pub trait Actuator: Send + Sync {
    fn set_target_temperature(&self, entity: &str, value: f64);
}

#[derive(Debug, Clone, PartialEq)]
pub enum Trigger {
    Tick,
    Evaluate { force: bool },
    StartBoost,
    CancelBoost,
    ResetOffset,
    SetTarget(f64),
    Reconfigure(Box<InstanceConfig>),
    Shutdown,
}

#[derive(Debug, Error)]
pub enum InstanceError {
    #[error("controller {0} is not running")]
    Stopped(String),
}

/// Cloneable front door to one running controller task.
#[derive(Debug, Clone)]
pub struct ControllerHandle {
    id: String,
    triggers: mpsc::Sender<Trigger>,
    status: watch::Receiver<ControllerStatus>,
    task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl ControllerHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub async fn send(&self, trigger: Trigger) -> Result<(), InstanceError> {
        self.triggers
            .send(trigger)
            .await
            .map_err(|_| InstanceError::Stopped(self.id.clone()))
    }

    pub fn status(&self) -> ControllerStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ControllerStatus> {
        self.status.clone()
    }

    /// Stops the task and waits for it to finish. Safe to call repeatedly.
    pub async fn shutdown(&self) {
        let Some(task) = self.task.lock().await.take() else {
            return;
        };
        let _ = self.triggers.send(Trigger::Shutdown).await;
        if let Err(err) = task.await {
            warn!(controller = %self.id, "controller task ended abnormally: {err}");
        }
    }
}

pub fn spawn_instance(
    instance: InstanceConfig,
    store: Arc<OffsetStore>,
    entities: EntityStates,
    actuator: Arc<dyn Actuator>,
) -> ControllerHandle {
    let id = instance.id.clone();
    let (triggers, trigger_rx) = mpsc::channel(TRIGGER_CHANNEL_CAPACITY);
    let changes = entities.subscribe();

    let config = instance.resolve();
    let engine = OffsetEngine::new();
    let initial = engine.status(&id, &config, store.get(&id), 0);
    let (status_tx, status) = watch::channel(initial);

    let actor = InstanceActor {
        window_entities: config.window_entities.clone(),
        instance,
        engine,
        store,
        entities,
        actuator,
        status_tx,
        started: Instant::now(),
    };
    let task = tokio::spawn(actor.run(trigger_rx, changes));

    ControllerHandle {
        id,
        triggers,
        status,
        task: Arc::new(Mutex::new(Some(task))),
    }
}

/// Everything that arrived since the last evaluation, folded together.
#[derive(Debug, Default)]
struct Pending {
    evaluate: bool,
    force: bool,
    start_boost: bool,
    cancel_boost: bool,
    boost_expired: bool,
    reset_offset: bool,
    window_changed: bool,
    target: Option<f64>,
    reconfigure: Option<Box<InstanceConfig>>,
    shutdown: bool,
}

impl Pending {
    fn absorb(&mut self, trigger: Trigger) {
        match trigger {
            Trigger::Tick => self.evaluate = true,
            Trigger::Evaluate { force } => {
                self.evaluate = true;
                self.force |= force;
            }
            // Last boost request wins.
            Trigger::StartBoost => {
                self.start_boost = true;
                self.cancel_boost = false;
            }
            Trigger::CancelBoost => {
                self.cancel_boost = true;
                self.start_boost = false;
            }
            Trigger::ResetOffset => self.reset_offset = true,
            Trigger::SetTarget(target) => self.target = Some(target),
            Trigger::Reconfigure(instance) => self.reconfigure = Some(instance),
            Trigger::Shutdown => self.shutdown = true,
        }
    }
}

struct InstanceActor {
    instance: InstanceConfig,
    engine: OffsetEngine,
    store: Arc<OffsetStore>,
    entities: EntityStates,
    actuator: Arc<dyn Actuator>,
    status_tx: watch::Sender<ControllerStatus>,
    window_entities: Vec<String>,
    started: Instant,
}

impl InstanceActor {
    async fn run(
        mut self,
        mut triggers: mpsc::Receiver<Trigger>,
        mut changes: broadcast::Receiver<String>,
    ) {
        let mut interval = tick_interval(&self.instance.resolve(), true);
        let mut changes_open = true;
        info!(controller = %self.instance.id, "controller started");

        loop {
            let mut pending = Pending::default();
            let boost_deadline = self.boost_deadline();

            tokio::select! {
                _ = interval.tick() => pending.absorb(Trigger::Tick),
                _ = sleep_until_deadline(boost_deadline) => pending.boost_expired = true,
                trigger = triggers.recv() => match trigger {
                    Some(trigger) => pending.absorb(trigger),
                    None => break,
                },
                change = changes.recv(), if changes_open => match change {
                    Ok(entity) => pending.window_changed |= self.watches(&entity),
                    // Missed events may have included a window transition.
                    Err(broadcast::error::RecvError::Lagged(_)) => pending.window_changed = true,
                    Err(broadcast::error::RecvError::Closed) => changes_open = false,
                },
            }

            while let Ok(trigger) = triggers.try_recv() {
                pending.absorb(trigger);
            }
            while let Ok(entity) = changes.try_recv() {
                pending.window_changed |= self.watches(&entity);
            }

            if pending.shutdown {
                break;
            }

            if let Some(instance) = pending.reconfigure.take() {
                let previous = self.instance.resolve().interval_seconds;
                self.reconfigure(*instance);
                let current = self.instance.resolve();
                if current.interval_seconds != previous {
                    interval = tick_interval(&current, false);
                }
                pending.window_changed = true;
            }

            self.apply(pending).await;
        }

        self.engine.cancel_boost();
        self.publish(&self.instance.resolve());
        info!(controller = %self.instance.id, "controller stopped");
    }

    async fn apply(&mut self, pending: Pending) {
        let mut evaluate = pending.evaluate;
        let mut force = pending.force;
        let now_ms = self.now_ms();

        if let Some(target) = pending.target {
            self.instance.set_room_target(target);
            evaluate = true;
        }

        if pending.start_boost {
            let duration_ms = self.instance.resolve().boost_duration_ms();
            self.engine.start_boost(duration_ms, now_ms);
            info!(controller = %self.instance.id, duration_ms, "boost started");
            evaluate = true;
            force = true;
        }

        if pending.cancel_boost && self.engine.boost_deadline_ms().is_some() {
            self.engine.cancel_boost();
            info!(controller = %self.instance.id, "boost cancelled");
            evaluate = true;
            force = true;
        }

        if pending.boost_expired
            && self
                .engine
                .boost_deadline_ms()
                .is_some_and(|deadline| deadline <= now_ms)
        {
            self.engine.cancel_boost();
            info!(controller = %self.instance.id, "boost expired");
            evaluate = true;
            force = true;
        }

        if pending.reset_offset {
            self.store.set(&self.instance.id, 0.0);
            self.persist_offsets().await;
            self.engine.note_offset_reset();
            info!(controller = %self.instance.id, "learned offset reset");
            evaluate = true;
            force = true;
        }

        if pending.window_changed {
            evaluate = true;
            force = true;
        }

        if force {
            self.engine.request_force();
        }
        if evaluate {
            self.evaluate().await;
        }
    }

    async fn evaluate(&mut self) {
        let config = self.instance.resolve();
        let now_ms = self.now_ms();
        let id = self.instance.id.clone();

        let actuator_available = self.entities.read(&self.instance.climate_entity).is_some();
        let room = self.entities.read(&self.instance.room_sensor_entity);
        let window_open = window::any_open(&config.window_entities, |entity| {
            self.entities.read(entity)
        });
        let offset = self.store.get(&id);

        let readings = Readings {
            actuator_available,
            room: room.as_deref(),
            window_open,
            offset,
        };
        let result = self.engine.evaluate(&config, &readings, now_ms);

        if let Some(setpoint) = result.command {
            info!(
                controller = %id,
                entity = %self.instance.climate_entity,
                room = ?self.engine.room_temp(),
                target = config.room_target,
                error = ?self.engine.last_error(),
                offset,
                setpoint,
                action = result.action.as_str(),
                "set_temperature"
            );
            self.actuator
                .set_target_temperature(&self.instance.climate_entity, setpoint);
        } else if result.action.is_skipped_input() {
            debug!(
                controller = %id,
                climate = %self.instance.climate_entity,
                room_sensor = %self.instance.room_sensor_entity,
                action = result.action.as_str(),
                "inputs unusable, evaluation skipped"
            );
        } else {
            debug!(controller = %id, action = result.action.as_str(), "evaluation without command");
        }

        if let Some(learned) = result.offset {
            self.store.set(&id, learned);
            self.persist_offsets().await;
        }

        self.publish(&config);
    }

    async fn persist_offsets(&self) {
        if let Err(err) = self.store.save().await {
            warn!(
                controller = %self.instance.id,
                path = %self.store.path().display(),
                "failed to persist learned offset: {err}"
            );
        }
    }

    fn reconfigure(&mut self, mut instance: InstanceConfig) {
        instance.migrate_legacy();
        let config = instance.resolve();
        if config.window_entities != self.window_entities {
            debug!(
                controller = %instance.id,
                windows = ?config.window_entities,
                "window subscription replaced"
            );
            self.window_entities = config.window_entities;
        }
        self.instance = instance;
    }

    fn watches(&self, entity: &str) -> bool {
        self.window_entities.iter().any(|watched| watched == entity)
    }

    fn publish(&self, config: &ControllerConfig) {
        let now_ms = self.now_ms();
        let offset = self.store.get(&self.instance.id);
        self.status_tx
            .send_replace(self.engine.status(&self.instance.id, config, offset, now_ms));
    }

    fn boost_deadline(&self) -> Option<Instant> {
        self.engine
            .boost_deadline_ms()
            .map(|deadline| self.started + Duration::from_millis(deadline))
    }

    fn now_ms(&self) -> u64 {
        self.started
            .elapsed()
            .as_millis()
            .try_into()
            .unwrap_or(u64::MAX)
    }
}

fn tick_interval(config: &ControllerConfig, immediate: bool) -> Interval {
    let period = Duration::from_secs(config.interval_seconds);
    let start = if immediate {
        Instant::now()
    } else {
        Instant::now() + period
    };
    let mut interval = tokio::time::interval_at(start, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
