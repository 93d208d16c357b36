pub mod config;
pub mod thermostat;
pub mod topics;
pub mod types;
pub mod window;

pub use config::{ConfigError, ControllerConfig, ControllerOptions, InstanceConfig, RuntimeConfig};
pub use thermostat::{Evaluation, OffsetEngine, Readings, OFFSET_LIMIT};
pub use topics::*;
pub use types::{ControlAction, ControllerStatus, WindowState};
