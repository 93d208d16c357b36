use crate::{
    config::ControllerConfig,
    types::{ControlAction, ControllerStatus, WindowState},
};

/// Continuous deadband hold required before the setpoint is folded into the
/// learned offset.
pub const STABLE_LEARN_MS: u64 = 900_000;
/// Fraction of the distance to the implied offset covered per stable window.
pub const STABLE_LEARN_ALPHA: f64 = 0.25;
/// Learned offsets never leave `[-OFFSET_LIMIT, OFFSET_LIMIT]`.
pub const OFFSET_LIMIT: f64 = 10.0;

const TARGET_EPSILON: f64 = 1e-9;
const STEP_EPSILON: f64 = 1e-9;
const OFFSET_EPSILON: f64 = 1e-6;
const PROPORTIONAL_GAIN: f64 = 0.5;
// Errors at or above this magnitude bypass the cooldown.
const COOLDOWN_ERROR_LIMIT: f64 = 1.0;

/// Inputs gathered by the host right before an evaluation.
#[derive(Debug, Clone, Copy)]
pub struct Readings<'a> {
    pub actuator_available: bool,
    pub room: Option<&'a str>,
    pub window_open: bool,
    /// Learned offset currently held by the offset store.
    pub offset: f64,
}

/// Result of one evaluation.
#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
    pub action: ControlAction,
    /// Setpoint to push to the actuator, if any.
    pub command: Option<f64>,
    /// New learned offset the host must store and persist.
    pub offset: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Stability {
    since_ms: u64,
    target: f64,
    last_set: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct StuckWindow {
    ref_temp: f64,
    ref_time_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Boost {
    until_ms: u64,
}

#[derive(Debug, Clone)]
pub struct OffsetEngine {
    last_set: Option<f64>,
    last_change_ms: Option<u64>,
    last_action: ControlAction,
    last_error: Option<f64>,
    last_target_trv: Option<f64>,
    change_count: u64,

    room_temp: Option<f64>,
    last_room_target: Option<f64>,

    boost: Option<Boost>,
    window_is_open: bool,

    stability: Option<Stability>,

    stuck: Option<StuckWindow>,
    stuck_bias: f64,

    // Set while window/boost own the setpoint; the next deadband pass rebases.
    rebase_after_override: bool,
    force_next_evaluation: bool,
}

impl Default for OffsetEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl OffsetEngine {
    pub fn new() -> Self {
        Self {
            last_set: None,
            last_change_ms: None,
            last_action: ControlAction::Init,
            last_error: None,
            last_target_trv: None,
            change_count: 0,
            room_temp: None,
            last_room_target: None,
            boost: None,
            window_is_open: false,
            stability: None,
            stuck: None,
            stuck_bias: 0.0,
            rebase_after_override: false,
            force_next_evaluation: false,
        }
    }

    pub fn last_set(&self) -> Option<f64> {
        self.last_set
    }

    pub fn last_action(&self) -> ControlAction {
        self.last_action
    }

    pub fn room_temp(&self) -> Option<f64> {
        self.room_temp
    }

    pub fn last_error(&self) -> Option<f64> {
        self.last_error
    }

    pub fn last_target_trv(&self) -> Option<f64> {
        self.last_target_trv
    }

    pub fn change_count(&self) -> u64 {
        self.change_count
    }

    pub fn is_window_open(&self) -> bool {
        self.window_is_open
    }

    pub fn stuck_bias(&self) -> f64 {
        self.stuck_bias
    }

    pub fn is_stuck_tracking(&self) -> bool {
        self.stuck.is_some()
    }

    pub fn force_pending(&self) -> bool {
        self.force_next_evaluation
    }

    /// Lets the next command bypass the cooldown.
    pub fn request_force(&mut self) {
        self.force_next_evaluation = true;
    }

    pub fn start_boost(&mut self, duration_ms: u64, now_ms: u64) {
        self.boost = Some(Boost {
            until_ms: now_ms.saturating_add(duration_ms),
        });
    }

    pub fn cancel_boost(&mut self) {
        self.boost = None;
    }

    pub fn is_boost_active(&self, now_ms: u64) -> bool {
        self.boost.is_some_and(|boost| now_ms < boost.until_ms)
    }

    /// Monotonic time at which the running boost ends.
    pub fn boost_deadline_ms(&self) -> Option<u64> {
        self.boost.map(|boost| boost.until_ms)
    }

    pub fn boost_remaining_ms(&self, now_ms: u64) -> u64 {
        self.boost
            .map(|boost| boost.until_ms.saturating_sub(now_ms))
            .unwrap_or(0)
    }

    pub fn note_offset_reset(&mut self) {
        self.last_action = ControlAction::ResetOffset;
    }

    pub fn evaluate(
        &mut self,
        config: &ControllerConfig,
        readings: &Readings<'_>,
        now_ms: u64,
    ) -> Evaluation {
        let Some(raw_room) = readings.room.filter(|_| readings.actuator_available) else {
            return self.finish(ControlAction::SkippedUnavailableEntities, None, None);
        };
        let Some(room_temp) = parse_temperature(raw_room) else {
            return self.finish(ControlAction::SkippedInvalidRoomTemp, None, None);
        };
        self.room_temp = Some(room_temp);

        let target = config.room_target;
        let target_changed = self
            .last_room_target
            .is_some_and(|previous| (target - previous).abs() > TARGET_EPSILON);
        self.last_room_target = Some(target);
        self.window_is_open = readings.window_open;

        let error = target - room_temp;
        self.last_error = Some(error);
        if error.abs() > config.deadband {
            self.stability = None;
        }

        if readings.window_open {
            self.cancel_boost();
            let setpoint = config.clamp_setpoint(config.trv_min);
            let command = self.command_if_moved(setpoint, config, now_ms);
            self.reset_stuck();
            self.stability = None;
            self.rebase_after_override = true;
            return self.finish(ControlAction::WindowOpen, command, None);
        }

        if self.is_boost_active(now_ms) {
            // A boosted setpoint must never be learned.
            self.stability = None;
            self.reset_stuck();
            self.rebase_after_override = true;
            let setpoint = config.clamp_setpoint(config.trv_max);
            let command = self.command_if_moved(setpoint, config, now_ms);
            return self.finish(ControlAction::Boost, command, None);
        }

        if error.abs() <= config.deadband {
            return self.evaluate_deadband(config, readings.offset, target_changed, now_ms);
        }

        self.evaluate_correction(config, readings.offset, room_temp, error, now_ms)
    }

    pub fn status(
        &self,
        id: &str,
        config: &ControllerConfig,
        offset: f64,
        now_ms: u64,
    ) -> ControllerStatus {
        let boost_active = self.is_boost_active(now_ms);
        ControllerStatus {
            id: id.to_string(),
            room_target: config.room_target,
            room_temp: self.room_temp,
            error: self.last_error,
            offset,
            target_trv: self.last_target_trv,
            last_set: self.last_set,
            last_action: self.last_action,
            change_count: self.change_count,
            window_state: WindowState::from_open(self.window_is_open),
            boost_active,
            boost_remaining_sec: if boost_active {
                self.boost_remaining_ms(now_ms) / 1_000
            } else {
                0
            },
            control_paused: self.window_is_open || boost_active,
            stuck_bias: self.stuck_bias,
            min_temp: config.trv_min,
            max_temp: config.trv_max,
        }
    }

    fn evaluate_deadband(
        &mut self,
        config: &ControllerConfig,
        offset: f64,
        target_changed: bool,
        now_ms: u64,
    ) -> Evaluation {
        let target = config.room_target;
        self.reset_stuck();

        // A user-driven target change or the end of an override rebases even
        // inside the deadband, so an old (possibly very high) setpoint is not
        // held or learned.
        if target_changed || std::mem::take(&mut self.rebase_after_override) {
            let baseline = quantize(config, target + offset);
            let command = self.command_if_moved(baseline, config, now_ms);
            self.stability = None;
            return self.finish(ControlAction::DeadbandRebase, command, None);
        }

        let Some(last_set) = self.last_set else {
            let baseline = quantize(config, target + offset);
            self.last_target_trv = Some(baseline);
            let command = self.commit(baseline, now_ms);
            return self.finish(ControlAction::DeadbandInit, Some(command), None);
        };

        self.last_target_trv = Some(last_set);

        let since_ms = match self.stability {
            Some(stable)
                if (stable.target - target).abs() <= TARGET_EPSILON
                    && (stable.last_set - last_set).abs() <= TARGET_EPSILON =>
            {
                stable.since_ms
            }
            _ => {
                self.restart_stability(target, last_set, now_ms);
                return self.finish(ControlAction::Hold, None, None);
            }
        };

        if config.enable_learning && now_ms.saturating_sub(since_ms) >= STABLE_LEARN_MS {
            let implied = (last_set - target).clamp(-OFFSET_LIMIT, OFFSET_LIMIT);
            let learned = offset + STABLE_LEARN_ALPHA * (implied - offset);
            let update = ((learned - offset).abs() > OFFSET_EPSILON).then_some(learned);

            self.restart_stability(target, last_set, now_ms);
            return self.finish(ControlAction::StableLearn, None, update);
        }

        self.finish(ControlAction::Hold, None, None)
    }

    fn evaluate_correction(
        &mut self,
        config: &ControllerConfig,
        stored_offset: f64,
        room_temp: f64,
        error: f64,
        now_ms: u64,
    ) -> Evaluation {
        let mut offset = stored_offset;
        let mut update = None;
        self.rebase_after_override = false;

        if config.enable_learning && error > config.deadband {
            let nudged = (offset + config.learn_rate * error).clamp(-OFFSET_LIMIT, OFFSET_LIMIT);
            if (nudged - offset).abs() > OFFSET_EPSILON {
                offset = nudged;
                update = Some(nudged);
            }
        }

        let correction = (PROPORTIONAL_GAIN * error).clamp(-config.step_max, config.step_max);
        let mut candidate =
            round_to_step(config.room_target + offset + correction, config.step_min);
        let mut action = ControlAction::SetTemperature;

        // Window and boost already returned, so only the temperature matters here.
        if config.stuck_enable && error < -config.deadband {
            if self.track_stuck(config, room_temp, now_ms) {
                action = ControlAction::StuckOvertempDown;
            }
            if self.stuck_bias > 0.0 {
                candidate = quantize(config, candidate - self.stuck_bias);
            }
        } else {
            self.reset_stuck();
        }

        let candidate = config.clamp_setpoint(candidate);
        self.last_target_trv = Some(candidate);

        if let Some(last_set) = self.last_set {
            if (candidate - last_set).abs() < config.step_min - STEP_EPSILON {
                return self.finish(ControlAction::SkippedNoChange, None, update);
            }
            let in_cooldown = self
                .last_change_ms
                .is_some_and(|last| now_ms.saturating_sub(last) < config.cooldown_ms());
            if in_cooldown && error.abs() < COOLDOWN_ERROR_LIMIT && !self.force_next_evaluation {
                return self.finish(ControlAction::Cooldown, None, update);
            }
        }

        let command = self.commit(candidate, now_ms);
        self.finish(action, Some(command), update)
    }

    /// Advances the overtemperature window. Returns true when the bias grew.
    fn track_stuck(&mut self, config: &ControllerConfig, room_temp: f64, now_ms: u64) -> bool {
        let Some(window) = self.stuck else {
            self.stuck = Some(StuckWindow {
                ref_temp: room_temp,
                ref_time_ms: now_ms,
            });
            return false;
        };

        if now_ms.saturating_sub(window.ref_time_ms) < config.stuck_ms() {
            return false;
        }

        let bumped = room_temp >= window.ref_temp - config.stuck_min_drop;
        if bumped {
            self.stuck_bias += config.stuck_step;
        }
        self.stuck = Some(StuckWindow {
            ref_temp: room_temp,
            ref_time_ms: now_ms,
        });
        bumped
    }

    fn reset_stuck(&mut self) {
        self.stuck = None;
        self.stuck_bias = 0.0;
    }

    fn restart_stability(&mut self, target: f64, last_set: f64, now_ms: u64) {
        self.stability = Some(Stability {
            since_ms: now_ms,
            target,
            last_set,
        });
    }

    fn command_if_moved(
        &mut self,
        setpoint: f64,
        config: &ControllerConfig,
        now_ms: u64,
    ) -> Option<f64> {
        self.last_target_trv = Some(setpoint);
        let moved = self
            .last_set
            .map(|last| (setpoint - last).abs() >= config.step_min - STEP_EPSILON)
            .unwrap_or(true);
        moved.then(|| self.commit(setpoint, now_ms))
    }

    fn commit(&mut self, setpoint: f64, now_ms: u64) -> f64 {
        self.last_set = Some(setpoint);
        self.last_change_ms = Some(now_ms);
        self.change_count += 1;
        self.force_next_evaluation = false;
        setpoint
    }

    fn finish(
        &mut self,
        action: ControlAction,
        command: Option<f64>,
        offset: Option<f64>,
    ) -> Evaluation {
        self.last_action = action;
        Evaluation {
            action,
            command,
            offset,
        }
    }
}

pub fn round_to_step(value: f64, step: f64) -> f64 {
    if step <= 0.0 {
        return value;
    }
    (value / step).round() * step
}

fn quantize(config: &ControllerConfig, value: f64) -> f64 {
    config.clamp_setpoint(round_to_step(config.clamp_setpoint(value), config.step_min))
}

/// Parses a room sensor state; non-numeric and non-finite states are rejected.
pub fn parse_temperature(raw: &str) -> Option<f64> {
    raw.trim()
        .parse::<f64>()
        .ok()
        .filter(|value| value.is_finite())
}

#[cfg(test)]
mod tests {
    use super::*;

    const MIN: u64 = 60_000;

    fn config() -> ControllerConfig {
        ControllerConfig {
            room_target: 22.0,
            deadband: 0.3,
            step_min: 0.5,
            step_max: 1.0,
            trv_min: 5.0,
            trv_max: 35.0,
            enable_learning: false,
            ..ControllerConfig::default()
        }
    }

    fn room(value: &str) -> Readings<'_> {
        Readings {
            actuator_available: true,
            room: Some(value),
            window_open: false,
            offset: 0.0,
        }
    }

    fn assert_close(actual: f64, expected: f64) {
        assert!(
            (actual - expected).abs() < 1e-9,
            "expected {expected}, got {actual}"
        );
    }

    #[test]
    fn unavailable_inputs_skip_without_command() {
        let mut engine = OffsetEngine::new();
        let cfg = config();

        let missing_room = Readings {
            room: None,
            ..room("20.0")
        };
        let result = engine.evaluate(&cfg, &missing_room, 0);
        assert_eq!(result.action, ControlAction::SkippedUnavailableEntities);
        assert_eq!(result.command, None);

        let missing_actuator = Readings {
            actuator_available: false,
            ..room("20.0")
        };
        let result = engine.evaluate(&cfg, &missing_actuator, 0);
        assert_eq!(result.action, ControlAction::SkippedUnavailableEntities);

        for raw in ["unavailable", "", "nan", "inf"] {
            let result = engine.evaluate(&cfg, &room(raw), 0);
            assert_eq!(result.action, ControlAction::SkippedInvalidRoomTemp);
            assert_eq!(result.command, None);
        }

        assert_eq!(engine.change_count(), 0);
        assert_eq!(engine.last_error(), None);
        assert_eq!(engine.last_set(), None);
    }

    #[test]
    fn cold_room_commands_proportional_setpoint() {
        let mut engine = OffsetEngine::new();

        let result = engine.evaluate(&config(), &room("20.0"), 0);

        assert_eq!(result.action, ControlAction::SetTemperature);
        assert_eq!(result.command, Some(23.0));
        assert_eq!(result.offset, None);
        assert_close(engine.last_error().unwrap(), 2.0);
        assert_eq!(engine.change_count(), 1);
    }

    #[test]
    fn learning_nudges_offset_when_room_is_cold() {
        let mut engine = OffsetEngine::new();
        let cfg = ControllerConfig {
            enable_learning: true,
            learn_rate: 0.05,
            ..config()
        };

        let result = engine.evaluate(&cfg, &room("20.0"), 0);

        assert_close(result.offset.unwrap(), 0.1);
        assert_eq!(result.command, Some(23.0));
    }

    #[test]
    fn learned_offset_is_clamped() {
        let mut engine = OffsetEngine::new();
        let cfg = ControllerConfig {
            enable_learning: true,
            learn_rate: 1.0,
            ..config()
        };
        let readings = Readings {
            offset: 9.5,
            ..room("15.0")
        };

        let result = engine.evaluate(&cfg, &readings, 0);

        assert_eq!(result.offset, Some(OFFSET_LIMIT));
        assert_eq!(result.command, Some(cfg.trv_max.min(33.0)));
    }

    #[test]
    fn deadband_holds_after_setpoint_established() {
        let mut engine = OffsetEngine::new();
        let cfg = config();
        engine.evaluate(&cfg, &room("20.0"), 0);
        assert_eq!(engine.last_set(), Some(23.0));

        for step in 1..10 {
            let result = engine.evaluate(&cfg, &room("21.9"), step * MIN);
            assert_eq!(result.action, ControlAction::Hold);
            assert_eq!(result.command, None);
        }
        assert_eq!(engine.change_count(), 1);
        assert_eq!(engine.last_target_trv(), Some(23.0));
    }

    #[test]
    fn deadband_init_sets_baseline_once() {
        let mut engine = OffsetEngine::new();
        let readings = Readings {
            offset: 1.2,
            ..room("22.1")
        };

        let result = engine.evaluate(&config(), &readings, 0);
        assert_eq!(result.action, ControlAction::DeadbandInit);
        assert_eq!(result.command, Some(23.0));

        let result = engine.evaluate(&config(), &readings, MIN);
        assert_eq!(result.action, ControlAction::Hold);
    }

    #[test]
    fn target_change_in_deadband_rebases() {
        let mut engine = OffsetEngine::new();
        let cfg = config();
        engine.evaluate(&cfg, &room("20.0"), 0);
        engine.evaluate(&cfg, &room("21.9"), MIN);

        let lowered = ControllerConfig {
            room_target: 21.8,
            ..cfg.clone()
        };
        let result = engine.evaluate(&lowered, &room("21.9"), 2 * MIN);

        assert_eq!(result.action, ControlAction::DeadbandRebase);
        assert_eq!(result.command, Some(22.0));
        assert_eq!(engine.last_set(), Some(22.0));
    }

    #[test]
    fn rebase_reports_even_without_movement() {
        let mut engine = OffsetEngine::new();
        let cfg = config();
        engine.evaluate(&cfg, &room("22.0"), 0);
        assert_eq!(engine.last_set(), Some(22.0));

        let nudged = ControllerConfig {
            room_target: 22.1,
            ..cfg
        };
        let result = engine.evaluate(&nudged, &room("22.0"), MIN);

        assert_eq!(result.action, ControlAction::DeadbandRebase);
        assert_eq!(result.command, None);
    }

    #[test]
    fn stable_hold_folds_setpoint_into_offset() {
        let mut engine = OffsetEngine::new();
        let cfg = ControllerConfig {
            enable_learning: true,
            learn_rate: 0.0,
            ..config()
        };
        engine.evaluate(&cfg, &room("20.0"), 0);
        assert_eq!(engine.last_set(), Some(23.0));

        let first = engine.evaluate(&cfg, &room("22.0"), MIN);
        assert_eq!(first.action, ControlAction::Hold);

        let early = engine.evaluate(&cfg, &room("22.0"), MIN + STABLE_LEARN_MS - 1);
        assert_eq!(early.action, ControlAction::Hold);
        assert_eq!(early.offset, None);

        let learned = engine.evaluate(&cfg, &room("22.0"), MIN + STABLE_LEARN_MS);
        assert_eq!(learned.action, ControlAction::StableLearn);
        assert_close(learned.offset.unwrap(), 0.25);
        assert_eq!(learned.command, None);

        // Window restarts after learning.
        let after = engine.evaluate(&cfg, &room("22.0"), MIN + STABLE_LEARN_MS + MIN);
        assert_eq!(after.action, ControlAction::Hold);
    }

    #[test]
    fn stable_hold_without_learning_never_changes_offset() {
        let mut engine = OffsetEngine::new();
        let cfg = config();
        engine.evaluate(&cfg, &room("20.0"), 0);
        engine.evaluate(&cfg, &room("22.0"), MIN);

        let result = engine.evaluate(&cfg, &room("22.0"), MIN + 2 * STABLE_LEARN_MS);

        assert_eq!(result.action, ControlAction::Hold);
        assert_eq!(result.offset, None);
    }

    #[test]
    fn leaving_deadband_resets_stability() {
        let mut engine = OffsetEngine::new();
        let cfg = ControllerConfig {
            enable_learning: true,
            learn_rate: 0.0,
            cooldown_seconds: 0,
            ..config()
        };
        engine.evaluate(&cfg, &room("20.0"), 0);
        engine.evaluate(&cfg, &room("22.0"), MIN);
        engine.evaluate(&cfg, &room("21.0"), 10 * MIN);
        let set = engine.last_set().unwrap();

        let back = engine.evaluate(&cfg, &room("22.0"), 11 * MIN);
        assert_eq!(back.action, ControlAction::Hold);
        let result = engine.evaluate(&cfg, &room("22.0"), MIN + STABLE_LEARN_MS);
        assert_eq!(result.action, ControlAction::Hold);
        assert_eq!(engine.last_set(), Some(set));
    }

    #[test]
    fn window_open_dominates_boost_and_clears_state() {
        let mut engine = OffsetEngine::new();
        let cfg = config();
        engine.evaluate(&cfg, &room("20.0"), 0);
        engine.start_boost(900_000, MIN);

        let open = Readings {
            window_open: true,
            ..room("20.0")
        };
        let result = engine.evaluate(&cfg, &open, 2 * MIN);

        assert_eq!(result.action, ControlAction::WindowOpen);
        assert_eq!(result.command, Some(5.0));
        assert!(!engine.is_boost_active(2 * MIN));
        assert!(engine.is_window_open());
        assert_eq!(engine.stuck_bias(), 0.0);

        let again = engine.evaluate(&cfg, &open, 3 * MIN);
        assert_eq!(again.action, ControlAction::WindowOpen);
        assert_eq!(again.command, None);
        assert_eq!(engine.change_count(), 2);
    }

    #[test]
    fn boost_commands_max_until_expiry() {
        let mut engine = OffsetEngine::new();
        let cfg = ControllerConfig {
            enable_learning: true,
            ..config()
        };
        engine.start_boost(cfg.boost_duration_ms(), 0);

        let result = engine.evaluate(&cfg, &room("20.0"), 0);
        assert_eq!(result.action, ControlAction::Boost);
        assert_eq!(result.command, Some(35.0));
        assert_eq!(result.offset, None);

        let result = engine.evaluate(&cfg, &room("21.0"), MIN);
        assert_eq!(result.action, ControlAction::Boost);
        assert_eq!(result.command, None);

        let expired = engine.evaluate(&cfg, &room("22.0"), cfg.boost_duration_ms());
        assert_ne!(expired.action, ControlAction::Boost);
    }

    #[test]
    fn override_end_rebases_instead_of_holding() {
        let mut engine = OffsetEngine::new();
        let cfg = ControllerConfig {
            enable_learning: true,
            learn_rate: 0.0,
            ..config()
        };
        engine.start_boost(cfg.boost_duration_ms(), 0);
        engine.evaluate(&cfg, &room("21.9"), 0);
        assert_eq!(engine.last_set(), Some(35.0));

        engine.cancel_boost();
        let result = engine.evaluate(&cfg, &room("21.9"), MIN);
        assert_eq!(result.action, ControlAction::DeadbandRebase);
        assert_eq!(result.command, Some(22.0));

        let open = Readings {
            window_open: true,
            ..room("22.0")
        };
        engine.evaluate(&cfg, &open, 2 * MIN);
        let closed = engine.evaluate(&cfg, &room("22.0"), 3 * MIN);
        assert_eq!(closed.action, ControlAction::DeadbandRebase);
        assert_eq!(closed.command, Some(22.0));

        let held = engine.evaluate(&cfg, &room("22.0"), 4 * MIN);
        assert_eq!(held.action, ControlAction::Hold);
        let learned = engine.evaluate(&cfg, &room("22.0"), 4 * MIN + STABLE_LEARN_MS);
        assert_eq!(learned.action, ControlAction::StableLearn);
        assert_eq!(learned.offset, None);
    }

    #[test]
    fn cooldown_suppresses_small_corrections_unless_forced() {
        let mut engine = OffsetEngine::new();
        let cfg = config();
        engine.evaluate(&cfg, &room("21.0"), 0);
        assert_eq!(engine.last_set(), Some(22.5));

        let result = engine.evaluate(&cfg, &room("22.6"), MIN);
        assert_eq!(result.action, ControlAction::Cooldown);
        assert_eq!(result.command, None);
        assert_eq!(engine.last_target_trv(), Some(21.5));

        engine.request_force();
        let forced = engine.evaluate(&cfg, &room("22.6"), 2 * MIN);
        assert_eq!(forced.action, ControlAction::SetTemperature);
        assert_eq!(forced.command, Some(21.5));
        assert!(!engine.force_pending());
        assert_eq!(engine.change_count(), 2);
    }

    #[test]
    fn large_error_bypasses_cooldown() {
        let mut engine = OffsetEngine::new();
        let cfg = config();
        engine.evaluate(&cfg, &room("21.0"), 0);

        let result = engine.evaluate(&cfg, &room("19.0"), MIN);

        assert_eq!(result.action, ControlAction::SetTemperature);
        assert_eq!(result.command, Some(23.0));
    }

    #[test]
    fn unchanged_candidate_is_skipped() {
        let mut engine = OffsetEngine::new();
        let cfg = config();
        engine.evaluate(&cfg, &room("20.0"), 0);

        let result = engine.evaluate(&cfg, &room("19.5"), 20 * MIN);

        assert_eq!(result.action, ControlAction::SkippedNoChange);
        assert_eq!(engine.change_count(), 1);
    }

    #[test]
    fn stuck_overtemperature_adds_bias_once_per_window() {
        let mut engine = OffsetEngine::new();
        let cfg = ControllerConfig {
            stuck_enable: true,
            stuck_seconds: 600,
            stuck_min_drop: 0.2,
            stuck_step: 0.5,
            cooldown_seconds: 0,
            ..config()
        };
        let window = cfg.stuck_ms();

        let first = engine.evaluate(&cfg, &room("23.0"), 0);
        assert_eq!(first.command, Some(21.5));
        assert!(engine.is_stuck_tracking());
        assert_eq!(engine.stuck_bias(), 0.0);

        let waiting = engine.evaluate(&cfg, &room("23.0"), window - 1);
        assert_eq!(waiting.action, ControlAction::SkippedNoChange);

        let bumped = engine.evaluate(&cfg, &room("22.9"), window);
        assert_eq!(bumped.action, ControlAction::StuckOvertempDown);
        assert_close(engine.stuck_bias(), 0.5);
        assert_eq!(bumped.command, Some(21.0));

        let cooled = engine.evaluate(&cfg, &room("22.6"), window + MIN);
        assert_close(engine.stuck_bias(), 0.5);
        assert_eq!(cooled.command, None);

        let recovered = engine.evaluate(&cfg, &room("22.0"), window + 2 * MIN);
        assert_eq!(recovered.action, ControlAction::Hold);
        assert_eq!(engine.stuck_bias(), 0.0);
        let colder = engine.evaluate(&cfg, &room("21.5"), window + 3 * MIN);
        assert_eq!(engine.stuck_bias(), 0.0);
        assert!(!engine.is_stuck_tracking());
        assert_eq!(colder.action, ControlAction::SetTemperature);
    }

    #[test]
    fn stuck_window_ignores_rooms_that_cool() {
        let mut engine = OffsetEngine::new();
        let cfg = ControllerConfig {
            stuck_seconds: 600,
            stuck_min_drop: 0.2,
            ..config()
        };

        engine.evaluate(&cfg, &room("23.5"), 0);
        engine.evaluate(&cfg, &room("23.0"), cfg.stuck_ms());

        assert_eq!(engine.stuck_bias(), 0.0);
        assert!(engine.is_stuck_tracking());
    }

    #[test]
    fn setpoints_stay_within_bounds() {
        let cfg = ControllerConfig {
            trv_min: 7.2,
            trv_max: 24.2,
            step_min: 0.5,
            cooldown_seconds: 0,
            ..config()
        };
        let mut engine = OffsetEngine::new();
        let mut now = 0;

        for (raw, offset) in [("10.0", 9.0), ("30.0", -9.0), ("22.0", -20.0), ("22.0", 20.0)] {
            let retarget = ControllerConfig {
                room_target: 22.0 + offset / 100.0,
                ..cfg.clone()
            };
            let readings = Readings {
                offset,
                ..room(raw)
            };
            now += MIN;
            if let Some(command) = engine.evaluate(&retarget, &readings, now).command {
                assert!((cfg.trv_min..=cfg.trv_max).contains(&command), "{command}");
            }
        }
    }

    #[test]
    fn status_reports_pause_and_boost() {
        let mut engine = OffsetEngine::new();
        let cfg = config();
        engine.start_boost(120_000, 0);
        engine.evaluate(&cfg, &room("20.0"), 0);

        let status = engine.status("living", &cfg, 0.4, 30_000);

        assert!(status.boost_active);
        assert!(status.control_paused);
        assert_eq!(status.boost_remaining_sec, 90);
        assert_eq!(status.last_action, ControlAction::Boost);
        assert_eq!(status.window_state, WindowState::Closed);
        assert_eq!(status.room_temp, Some(20.0));
        assert_eq!(status.offset, 0.4);
    }

    #[test]
    fn rounds_to_step() {
        assert_close(round_to_step(22.26, 0.5), 22.5);
        assert_close(round_to_step(22.24, 0.5), 22.0);
        assert_close(round_to_step(22.24, 0.0), 22.24);
    }
}
