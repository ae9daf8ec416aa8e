//! Centralized configuration: every component's tuning in one document.

use crate::brewing::ProcessTiming;
use crate::control::PressureControllerConfig;
use crate::estimation::{EstimatorConfig, RlsConfig};
use crate::heater::HeaterConfig;
use crate::safety::SafetyLimits;
use crate::types::CONTROL_PERIOD_MS;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EstimatorKind {
    /// Three-state EKF over pressure, flow coefficient and outflow
    #[default]
    Ekf,
    /// Single-state recursive least squares on `P = Q R`
    Rls,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    pub control_period_ms: u64,
    /// Starting actuation delay for volumetric brews (ms), learned per shot
    pub brew_delay_ms: u64,
    pub grind_delay_ms: u64,
    pub estimator_kind: EstimatorKind,
    pub heater: HeaterConfig,
    pub pressure: PressureControllerConfig,
    pub estimator: EstimatorConfig,
    pub rls: RlsConfig,
    pub process: ProcessTiming,
    pub safety: SafetyLimits,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            control_period_ms: CONTROL_PERIOD_MS,
            brew_delay_ms: 1000,
            grind_delay_ms: 1000,
            estimator_kind: EstimatorKind::default(),
            heater: HeaterConfig::default(),
            pressure: PressureControllerConfig::default(),
            estimator: EstimatorConfig::default(),
            rls: RlsConfig::default(),
            process: ProcessTiming::default(),
            safety: SafetyLimits::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ConfigError {
    Parse(String),
    Invalid { field: &'static str, reason: &'static str },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Parse(e) => write!(f, "Config parse error: {}", e),
            ConfigError::Invalid { field, reason } => write!(f, "Invalid config '{}': {}", field, reason),
        }
    }
}

impl std::error::Error for ConfigError {}

fn positive(field: &'static str, value: f32) -> Result<(), ConfigError> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(ConfigError::Invalid {
            field,
            reason: "must be a positive number",
        })
    }
}

fn ordered(field: &'static str, low: f32, high: f32) -> Result<(), ConfigError> {
    if low.is_finite() && high.is_finite() && low < high {
        Ok(())
    } else {
        Err(ConfigError::Invalid {
            field,
            reason: "lower bound must be below upper bound",
        })
    }
}

impl ControllerConfig {
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let value: serde_json::Value =
            serde_json::from_str(json).map_err(|e| ConfigError::Parse(e.to_string()))?;
        // Defaulted structs also deserialize from sequences; only accept an object
        if !value.is_object() {
            return Err(ConfigError::Parse(String::from("expected a JSON object")));
        }
        let config: ControllerConfig =
            serde_json::from_value(value).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json(&self) -> Result<String, ConfigError> {
        serde_json::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.control_period_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "control_period_ms",
                reason: "must be non-zero",
            });
        }

        let pid = &self.heater.pid;
        positive("heater.pid.sample_period_s", pid.sample_period_s)?;
        ordered("heater.pid.output_min/output_max", pid.output_min, pid.output_max)?;
        positive("heater.pid.shaper.frequency_hz", pid.shaper.frequency_hz)?;
        if !(0.0..=1.0).contains(&self.heater.smoothing) {
            return Err(ConfigError::Invalid {
                field: "heater.smoothing",
                reason: "must be within 0-1",
            });
        }

        let tune = &self.heater.autotune;
        ordered(
            "heater.autotune.min/max_phase_margin_deg",
            tune.min_phase_margin_deg,
            tune.max_phase_margin_deg,
        )?;
        if tune.min_phase_margin_deg <= 0.0 || tune.max_phase_margin_deg + tune.integral_phase_deg >= 90.0 {
            return Err(ConfigError::Invalid {
                field: "heater.autotune.max_phase_margin_deg",
                reason: "margins plus integral allowance must stay within 0-90 degrees",
            });
        }
        positive("heater.autotune.reaction_timeout_s", tune.reaction_timeout_s)?;
        positive("heater.autotune.output_span", tune.output_span)?;

        let pressure = &self.pressure;
        positive("pressure.compliance", pressure.compliance)?;
        positive("pressure.max_pressure", pressure.max_pressure)?;
        positive("pressure.scale.flow_exponent", pressure.scale.flow_exponent)?;
        if !pressure.pump.is_valid() {
            return Err(ConfigError::Invalid {
                field: "pressure.pump",
                reason: "pump model must deliver flow at zero pressure",
            });
        }

        let estimator = &self.estimator;
        positive("estimator.nominal_compliance", estimator.nominal_compliance)?;
        positive("estimator.measurement_noise", estimator.measurement_noise)?;
        positive("rls.forgetting_factor", self.rls.forgetting_factor)?;

        let safety = &self.safety;
        positive("safety.max_temperature", safety.max_temperature)?;
        positive("safety.max_pressure", safety.max_pressure)?;
        if safety.max_pressure < pressure.max_pressure {
            return Err(ConfigError::Invalid {
                field: "safety.max_pressure",
                reason: "below the controller pressure ceiling",
            });
        }
        Ok(())
    }
}
