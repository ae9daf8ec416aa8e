use serde::{Deserialize, Serialize};

/// One control-tick worth of sensor readings. Read each tick, never persisted.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ControlSample {
    pub temperature_c: f32,
    pub pressure_bar: f32,
    pub pump_flow_ml_s: f32,
    pub volume_ml: f32,
}

impl Default for ControlSample {
    fn default() -> Self {
        Self {
            temperature_c: 0.0,
            pressure_bar: 0.0,
            pump_flow_ml_s: 0.0,
            volume_ml: 0.0,
        }
    }
}

impl ControlSample {
    pub fn temperature_valid(&self) -> bool {
        is_valid_reading(self.temperature_c)
    }

    pub fn pressure_valid(&self) -> bool {
        is_valid_reading(self.pressure_bar)
    }
}

/// What the core asks the board to do this tick.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ActuatorCommands {
    /// 0-100 %
    pub heater_duty: f32,
    /// 0-100 %
    pub pump_duty: f32,
    pub valve_open: bool,
    /// Grinder relay
    pub alt_relay: bool,
}

impl ActuatorCommands {
    pub const OFF: Self = Self {
        heater_duty: 0.0,
        pump_duty: 0.0,
        valve_open: false,
        alt_relay: false,
    };

    /// Clamp both duty cycles into 0-100 %, mapping NaN to 0.
    pub fn sanitized(mut self) -> Self {
        self.heater_duty = clamp_duty(self.heater_duty);
        self.pump_duty = clamp_duty(self.pump_duty);
        self
    }
}

impl Default for ActuatorCommands {
    fn default() -> Self {
        Self::OFF
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MachineMode {
    Standby,
    Brew,
    Steam,
    Water,
    Grind,
}

/// How a process decides it is done.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessTarget {
    Time,
    Volumetric,
}

/// Sensor drivers report this when a read fails (e.g. thermocouple open circuit).
pub const SENSOR_ERROR_SENTINEL: f32 = -1.0e3;

pub const CONTROL_PERIOD_MS: u64 = 100;
pub const PUMP_CONTROL_PERIOD_S: f32 = 0.03;
pub const PREDICTIVE_WINDOW_MS: u64 = 4000;
pub const BREW_SAFETY_DURATION_MS: u64 = 120_000;
pub const STEAM_SAFETY_DURATION_MS: u64 = 60_000;
pub const HOT_WATER_SAFETY_DURATION_MS: u64 = 30_000;
pub const STEAM_PUMP_DUTY: f32 = 4.0;

pub fn is_valid_reading(value: f32) -> bool {
    value.is_finite() && value > SENSOR_ERROR_SENTINEL
}

pub fn clamp_duty(duty: f32) -> f32 {
    if duty.is_nan() {
        0.0
    } else {
        duty.clamp(0.0, 100.0)
    }
}
