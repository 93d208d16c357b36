use serde::{Deserialize, Serialize};

/// Outcome tag of the most recent evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlAction {
    Init,
    SkippedUnavailableEntities,
    SkippedInvalidRoomTemp,
    WindowOpen,
    Boost,
    DeadbandRebase,
    DeadbandInit,
    StableLearn,
    Hold,
    StuckOvertempDown,
    SkippedNoChange,
    Cooldown,
    SetTemperature,
    ResetOffset,
}

impl ControlAction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::SkippedUnavailableEntities => "skipped_unavailable_entities",
            Self::SkippedInvalidRoomTemp => "skipped_invalid_room_temp",
            Self::WindowOpen => "window_open",
            Self::Boost => "boost",
            Self::DeadbandRebase => "deadband_rebase",
            Self::DeadbandInit => "deadband_init",
            Self::StableLearn => "stable_learn",
            Self::Hold => "hold",
            Self::StuckOvertempDown => "stuck_overtemp_down",
            Self::SkippedNoChange => "skipped_no_change",
            Self::Cooldown => "cooldown",
            Self::SetTemperature => "set_temperature",
            Self::ResetOffset => "reset_offset",
        }
    }

    /// True when the evaluation bailed out before reaching the decision logic.
    pub fn is_skipped_input(self) -> bool {
        matches!(
            self,
            Self::SkippedUnavailableEntities | Self::SkippedInvalidRoomTemp
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WindowState {
    Open,
    Closed,
}

impl WindowState {
    pub fn from_open(open: bool) -> Self {
        if open {
            Self::Open
        } else {
            Self::Closed
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Closed => "closed",
        }
    }
}

/// Snapshot read by the display layer after every evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControllerStatus {
    pub id: String,
    #[serde(rename = "roomTarget")]
    pub room_target: f64,
    #[serde(rename = "roomTemp")]
    pub room_temp: Option<f64>,
    pub error: Option<f64>,
    pub offset: f64,
    #[serde(rename = "targetTrv")]
    pub target_trv: Option<f64>,
    #[serde(rename = "lastSet")]
    pub last_set: Option<f64>,
    #[serde(rename = "lastAction")]
    pub last_action: ControlAction,
    #[serde(rename = "changeCount")]
    pub change_count: u64,
    #[serde(rename = "windowState")]
    pub window_state: WindowState,
    #[serde(rename = "boostActive")]
    pub boost_active: bool,
    #[serde(rename = "boostRemainingSec")]
    pub boost_remaining_sec: u64,
    #[serde(rename = "controlPaused")]
    pub control_paused: bool,
    #[serde(rename = "stuckBias")]
    pub stuck_bias: f64,
    #[serde(rename = "minTemp")]
    pub min_temp: f64,
    #[serde(rename = "maxTemp")]
    pub max_temp: f64,
}
