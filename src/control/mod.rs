pub mod autotune;
pub mod pid;
pub mod pressure;
pub mod pump_model;
pub mod setpoint;
pub mod virtual_scale;

pub use autotune::{AutotuneConfig, AutotunePhase, AutotuneResult, Autotuner};
pub use pid::{PidConfig, PidCore, PidGains, PidMode};
pub use pressure::{PressureControllerConfig, PressureFlowController, PumpDemand};
pub use pump_model::PumpFlowModel;
pub use setpoint::{SetpointShaper, SetpointShaperConfig};
pub use virtual_scale::{VirtualScale, VirtualScaleConfig};
