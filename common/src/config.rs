use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_ROOM_TARGET: f64 = 22.0;
pub const DEFAULT_INTERVAL_SECONDS: u64 = 300;
pub const DEFAULT_DEADBAND: f64 = 0.2;
pub const DEFAULT_STEP_MAX: f64 = 1.0;
pub const DEFAULT_STEP_MIN: f64 = 0.5;
pub const DEFAULT_LEARN_RATE: f64 = 0.02;
pub const DEFAULT_TRV_MIN: f64 = 5.0;
pub const DEFAULT_TRV_MAX: f64 = 30.0;
pub const DEFAULT_COOLDOWN_SECONDS: u64 = 600;
pub const DEFAULT_BOOST_DURATION_SECONDS: u64 = 900;
pub const DEFAULT_STUCK_SECONDS: u64 = 1_800;
pub const DEFAULT_STUCK_MIN_DROP: f64 = 0.1;
pub const DEFAULT_STUCK_STEP: f64 = 0.5;

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("instance {id:?}: {field} is empty")]
    EmptyField { id: String, field: &'static str },
    #[error("instance {id:?}: {field} {value:?} cannot be used in an mqtt topic")]
    InvalidTopicSegment {
        id: String,
        field: &'static str,
        value: String,
    },
}

/// Resolved, immutable parameter snapshot for one evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControllerConfig {
    pub room_target: f64,
    pub interval_seconds: u64,
    pub deadband: f64,
    pub step_max: f64,
    pub step_min: f64,
    pub learn_rate: f64,
    pub trv_min: f64,
    pub trv_max: f64,
    pub cooldown_seconds: u64,
    pub boost_duration_seconds: u64,
    pub enable_learning: bool,
    pub stuck_enable: bool,
    pub stuck_seconds: u64,
    pub stuck_min_drop: f64,
    pub stuck_step: f64,
    pub window_entities: Vec<String>,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            room_target: DEFAULT_ROOM_TARGET,
            interval_seconds: DEFAULT_INTERVAL_SECONDS,
            deadband: DEFAULT_DEADBAND,
            step_max: DEFAULT_STEP_MAX,
            step_min: DEFAULT_STEP_MIN,
            learn_rate: DEFAULT_LEARN_RATE,
            trv_min: DEFAULT_TRV_MIN,
            trv_max: DEFAULT_TRV_MAX,
            cooldown_seconds: DEFAULT_COOLDOWN_SECONDS,
            boost_duration_seconds: DEFAULT_BOOST_DURATION_SECONDS,
            enable_learning: true,
            stuck_enable: true,
            stuck_seconds: DEFAULT_STUCK_SECONDS,
            stuck_min_drop: DEFAULT_STUCK_MIN_DROP,
            stuck_step: DEFAULT_STUCK_STEP,
            window_entities: Vec::new(),
        }
    }
}

impl ControllerConfig {
    /// Clamps every numeric parameter into a usable range so a bad stored
    /// value degrades control instead of halting it.
    pub fn sanitize(&mut self) {
        let defaults = Self::default();

        self.room_target = finite_or(self.room_target, defaults.room_target).clamp(0.0, 40.0);
        self.interval_seconds = self.interval_seconds.clamp(10, 3_600);
        self.deadband = finite_or(self.deadband, defaults.deadband).clamp(0.0, 5.0);
        self.step_max = finite_or(self.step_max, defaults.step_max).clamp(0.0, 10.0);
        self.step_min = finite_or(self.step_min, defaults.step_min).clamp(0.0, 5.0);
        self.learn_rate = finite_or(self.learn_rate, defaults.learn_rate).clamp(0.0, 1.0);
        self.trv_min = finite_or(self.trv_min, defaults.trv_min);
        self.trv_max = finite_or(self.trv_max, defaults.trv_max);
        if self.trv_max < self.trv_min {
            self.trv_max = self.trv_min;
        }
        self.cooldown_seconds = self.cooldown_seconds.min(86_400);
        self.boost_duration_seconds = self.boost_duration_seconds.clamp(30, 3_600);
        self.stuck_seconds = self.stuck_seconds.clamp(300, 24 * 3_600);
        self.stuck_min_drop =
            finite_or(self.stuck_min_drop, defaults.stuck_min_drop).clamp(0.0, 5.0);
        self.stuck_step = finite_or(self.stuck_step, defaults.stuck_step).clamp(0.05, 5.0);

        let mut seen = HashSet::new();
        self.window_entities
            .retain(|entity| !entity.trim().is_empty() && seen.insert(entity.clone()));
    }

    pub fn clamp_setpoint(&self, value: f64) -> f64 {
        value.clamp(self.trv_min, self.trv_max)
    }

    pub fn cooldown_ms(&self) -> u64 {
        self.cooldown_seconds.saturating_mul(1_000)
    }

    pub fn boost_duration_ms(&self) -> u64 {
        self.boost_duration_seconds.saturating_mul(1_000)
    }

    pub fn stuck_ms(&self) -> u64 {
        self.stuck_seconds.saturating_mul(1_000)
    }
}

/// One layer of user-tunable settings. Unset fields fall through to the
/// next layer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub room_target: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interval_seconds: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deadband: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step_max: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step_min: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub learn_rate: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trv_min: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trv_max: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cooldown_seconds: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub boost_duration_seconds: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enable_learning: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stuck_enable: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stuck_seconds: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stuck_min_drop: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stuck_step: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub window_entities: Option<Vec<String>>,
    /// Single window sensor key written by older setups.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub window_entity: Option<String>,
}

/// Per-instance settings: fixed entity references plus the setup layer
/// (`data`) and the user-editable layer (`options`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceConfig {
    pub id: String,
    pub climate_entity: String,
    pub room_sensor_entity: String,
    #[serde(default)]
    pub data: ControllerOptions,
    #[serde(default)]
    pub options: ControllerOptions,
}

impl ControllerOptions {
    /// Overwrites every field that is set in `update`.
    pub fn merge(&mut self, update: ControllerOptions) {
        fn take<T>(slot: &mut Option<T>, value: Option<T>) {
            if value.is_some() {
                *slot = value;
            }
        }

        take(&mut self.room_target, update.room_target);
        take(&mut self.interval_seconds, update.interval_seconds);
        take(&mut self.deadband, update.deadband);
        take(&mut self.step_max, update.step_max);
        take(&mut self.step_min, update.step_min);
        take(&mut self.learn_rate, update.learn_rate);
        take(&mut self.trv_min, update.trv_min);
        take(&mut self.trv_max, update.trv_max);
        take(&mut self.cooldown_seconds, update.cooldown_seconds);
        take(&mut self.boost_duration_seconds, update.boost_duration_seconds);
        take(&mut self.enable_learning, update.enable_learning);
        take(&mut self.stuck_enable, update.stuck_enable);
        take(&mut self.stuck_seconds, update.stuck_seconds);
        take(&mut self.stuck_min_drop, update.stuck_min_drop);
        take(&mut self.stuck_step, update.stuck_step);
        take(&mut self.window_entities, update.window_entities);
        take(&mut self.window_entity, update.window_entity);
    }
}

impl InstanceConfig {
    pub fn new(
        id: impl Into<String>,
        climate_entity: impl Into<String>,
        room_sensor_entity: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            climate_entity: climate_entity.into(),
            room_sensor_entity: room_sensor_entity.into(),
            data: ControllerOptions::default(),
            options: ControllerOptions::default(),
        }
    }

    /// Folds the legacy single `window_entity` key of either layer into the
    /// effective `window_entities` list, stored in the options layer.
    /// Returns true when anything was rewritten.
    pub fn migrate_legacy(&mut self) -> bool {
        let keys = [self.options.window_entity.take(), self.data.window_entity.take()];
        if keys.iter().all(Option::is_none) {
            return false;
        }

        let legacy: Vec<String> = keys
            .into_iter()
            .flatten()
            .map(|entity| entity.trim().to_string())
            .filter(|entity| !entity.is_empty())
            .collect();
        if !legacy.is_empty() {
            let mut entities = self
                .options
                .window_entities
                .clone()
                .or_else(|| self.data.window_entities.clone())
                .unwrap_or_default();
            for entity in legacy {
                if !entities.contains(&entity) {
                    entities.push(entity);
                }
            }
            self.options.window_entities = Some(entities);
        }
        true
    }

    /// Resolves `options` over `data` over defaults and sanitizes the result.
    pub fn resolve(&self) -> ControllerConfig {
        let defaults = ControllerConfig::default();
        let o = &self.options;
        let d = &self.data;

        let mut config = ControllerConfig {
            room_target: o.room_target.or(d.room_target).unwrap_or(defaults.room_target),
            interval_seconds: o
                .interval_seconds
                .or(d.interval_seconds)
                .unwrap_or(defaults.interval_seconds),
            deadband: o.deadband.or(d.deadband).unwrap_or(defaults.deadband),
            step_max: o.step_max.or(d.step_max).unwrap_or(defaults.step_max),
            step_min: o.step_min.or(d.step_min).unwrap_or(defaults.step_min),
            learn_rate: o.learn_rate.or(d.learn_rate).unwrap_or(defaults.learn_rate),
            trv_min: o.trv_min.or(d.trv_min).unwrap_or(defaults.trv_min),
            trv_max: o.trv_max.or(d.trv_max).unwrap_or(defaults.trv_max),
            cooldown_seconds: o
                .cooldown_seconds
                .or(d.cooldown_seconds)
                .unwrap_or(defaults.cooldown_seconds),
            boost_duration_seconds: o
                .boost_duration_seconds
                .or(d.boost_duration_seconds)
                .unwrap_or(defaults.boost_duration_seconds),
            enable_learning: o
                .enable_learning
                .or(d.enable_learning)
                .unwrap_or(defaults.enable_learning),
            stuck_enable: o
                .stuck_enable
                .or(d.stuck_enable)
                .unwrap_or(defaults.stuck_enable),
            stuck_seconds: o
                .stuck_seconds
                .or(d.stuck_seconds)
                .unwrap_or(defaults.stuck_seconds),
            stuck_min_drop: o
                .stuck_min_drop
                .or(d.stuck_min_drop)
                .unwrap_or(defaults.stuck_min_drop),
            stuck_step: o.stuck_step.or(d.stuck_step).unwrap_or(defaults.stuck_step),
            window_entities: o
                .window_entities
                .clone()
                .or_else(|| d.window_entities.clone())
                .unwrap_or_default(),
        };
        config.sanitize();
        config
    }

    pub fn set_room_target(&mut self, target: f64) {
        self.options.room_target = Some(target);
    }

    /// Merges a partial update into the options layer. Nothing changes when
    /// the merged instance fails validation.
    pub fn apply_options(&mut self, update: ControllerOptions) -> Result<(), ConfigError> {
        let mut candidate = self.clone();
        candidate.options.merge(update);
        candidate.migrate_legacy();
        candidate.validate()?;
        *self = candidate;
        Ok(())
    }

    /// Ids and entity names become MQTT topic segments.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let window_entities = self
            .options
            .window_entities
            .iter()
            .chain(self.data.window_entities.iter())
            .flatten()
            .map(|entity| ("window_entities", entity.as_str()));
        let fields = [
            ("id", self.id.as_str()),
            ("climate_entity", self.climate_entity.as_str()),
            ("room_sensor_entity", self.room_sensor_entity.as_str()),
        ];

        for (field, value) in fields.into_iter().chain(window_entities) {
            let value = value.trim();
            if value.is_empty() && field != "window_entities" {
                return Err(ConfigError::EmptyField {
                    id: self.id.clone(),
                    field,
                });
            }
            if value.contains(['/', '+', '#']) {
                return Err(ConfigError::InvalidTopicSegment {
                    id: self.id.clone(),
                    field,
                    value: value.to_string(),
                });
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub mqtt_user: String,
    pub mqtt_pass: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            mqtt_host: "127.0.0.1".to_string(),
            mqtt_port: 1883,
            mqtt_user: String::new(),
            mqtt_pass: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default = "default_http_port")]
    pub http_port: u16,
    #[serde(default)]
    pub instances: Vec<InstanceConfig>,
}

fn default_http_port() -> u16 {
    8080
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            network: NetworkConfig::default(),
            http_port: default_http_port(),
            instances: Vec::new(),
        }
    }
}

impl RuntimeConfig {
    /// Runs legacy migration on every instance and drops duplicate ids,
    /// keeping the first. Returns true when the stored file should be
    /// rewritten.
    pub fn normalize(&mut self) -> bool {
        let mut changed = false;
        for instance in &mut self.instances {
            changed |= instance.migrate_legacy();
        }

        let before = self.instances.len();
        let mut seen = Vec::new();
        self.instances.retain(|instance| {
            if seen.contains(&instance.id) {
                false
            } else {
                seen.push(instance.id.clone());
                true
            }
        });
        changed | (self.instances.len() != before)
    }

    pub fn instance(&self, id: &str) -> Option<&InstanceConfig> {
        self.instances.iter().find(|instance| instance.id == id)
    }

    pub fn instance_mut(&mut self, id: &str) -> Option<&mut InstanceConfig> {
        self.instances.iter_mut().find(|instance| instance.id == id)
    }
}

fn finite_or(value: f64, fallback: f64) -> f64 {
    if value.is_finite() {
        value
    } else {
        fallback
    }
}
