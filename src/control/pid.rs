use crate::control::setpoint::{SetpointShaper, SetpointShaperConfig};
use log::{debug, info};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PidMode {
    Manual,
    Automatic,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PidGains {
    pub kp: f32,
    pub ki: f32,
    pub kd: f32,
    pub kff: f32,
}

impl Default for PidGains {
    fn default() -> Self {
        Self {
            kp: 2.4,
            ki: 0.04,
            kd: 10.0,
            kff: 0.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PidConfig {
    pub gains: PidGains,
    pub output_min: f32,
    pub output_max: f32,
    /// Updates closer together than this are accumulated, not computed
    pub sample_period_s: f32,
    pub shaper: SetpointShaperConfig,
}

impl Default for PidConfig {
    fn default() -> Self {
        Self {
            gains: PidGains::default(),
            output_min: 0.0,
            output_max: 100.0,
            sample_period_s: 0.1,
            shaper: SetpointShaperConfig {
                frequency_hz: 0.03,
                ..SetpointShaperConfig::default()
            }
            .with_rate_limits(None, Some(2.0)),
        }
    }
}

/// Last computed contribution of each term, for telemetry.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct PidTerms {
    pub proportional: f32,
    pub integral: f32,
    pub derivative: f32,
    pub feedforward: f32,
}

/// Feedback controller with setpoint shaping, feedforward and clamping anti-windup.
pub struct PidCore {
    config: PidConfig,
    mode: PidMode,
    shaper: SetpointShaper,
    integral: f32,
    prev_error: Option<f32>,
    output: f32,
    terms: PidTerms,
    pending_dt: f32,
    initialized: bool,
}

impl PidCore {
    pub fn new(config: PidConfig) -> Self {
        Self {
            shaper: SetpointShaper::new(config.shaper),
            config,
            mode: PidMode::Automatic,
            integral: 0.0,
            prev_error: None,
            output: 0.0,
            terms: PidTerms::default(),
            pending_dt: 0.0,
            initialized: false,
        }
    }

    /// Run one control step. Writes into `output` and returns true only when a new
    /// value was computed. Manual mode writes the held manual value and returns false.
    pub fn update(&mut self, setpoint: f32, measurement: f32, dt: f32, output: &mut f32) -> bool {
        if self.mode == PidMode::Manual {
            *output = self.output;
            return false;
        }

        if !setpoint.is_finite() || !measurement.is_finite() {
            self.output = self.safe_output();
            self.initialized = false;
            self.pending_dt = 0.0;
            *output = self.output;
            return false;
        }

        if dt.is_finite() && dt > 0.0 {
            self.pending_dt += dt;
        }
        if self.pending_dt < self.config.sample_period_s || self.pending_dt <= f32::EPSILON {
            *output = self.output;
            return false;
        }
        let dt = self.pending_dt;
        self.pending_dt = 0.0;

        if !self.initialized {
            self.shaper.reset(measurement);
            self.integral = 0.0;
            self.prev_error = None;
            self.initialized = true;
            debug!("PID reseeded at {:.2}", measurement);
        }

        let shaped = self.shaper.update(setpoint, dt);
        let error = shaped.value - measurement;
        let gains = self.config.gains;

        self.integral += error * dt;
        let derivative = match self.prev_error {
            Some(prev) => gains.kd * (error - prev) / dt,
            None => 0.0,
        };
        let feedforward = if gains.kff != 0.0 {
            gains.kff * shaped.derivative
        } else {
            0.0
        };
        let proportional = gains.kp * error;

        let mut sum = proportional + gains.ki * self.integral + derivative + feedforward;
        let mut clamped = sum.clamp(self.config.output_min, self.config.output_max);

        // Saturated in the direction the error pushes: stop integrating
        if clamped != sum && winds_up(error, sum) {
            self.integral -= error * dt;
            sum = proportional + gains.ki * self.integral + derivative + feedforward;
            clamped = sum.clamp(self.config.output_min, self.config.output_max);
        }

        self.terms = PidTerms {
            proportional,
            integral: gains.ki * self.integral,
            derivative,
            feedforward,
        };
        self.prev_error = Some(error);
        self.output = clamped;
        *output = clamped;
        true
    }

    pub fn set_mode(&mut self, mode: PidMode) {
        if mode == self.mode {
            return;
        }
        if mode == PidMode::Automatic {
            // reseed from the next measurement
            self.initialized = false;
        }
        info!("PID mode: {:?} -> {:?}", self.mode, mode);
        self.mode = mode;
    }

    pub fn get_mode(&self) -> PidMode {
        self.mode
    }

    /// Switch to manual and hold `value` (clamped to the output limits).
    pub fn set_manual_output(&mut self, value: f32) {
        self.set_mode(PidMode::Manual);
        self.output = if value.is_finite() {
            value.clamp(self.config.output_min, self.config.output_max)
        } else {
            self.safe_output()
        };
    }

    pub fn set_gains(&mut self, gains: PidGains) {
        info!(
            "PID gains: kp={:.3} ki={:.4} kd={:.3} kff={:.3}",
            gains.kp, gains.ki, gains.kd, gains.kff
        );
        self.config.gains = gains;
    }

    pub fn get_gains(&self) -> PidGains {
        self.config.gains
    }

    pub fn set_output_limits(&mut self, min: f32, max: f32) {
        if min < max {
            self.config.output_min = min;
            self.config.output_max = max;
            self.output = self.output.clamp(min, max);
        }
    }

    /// Size the setpoint delay line for a plant with `system_delay_s` of dead time.
    pub fn compute_setpoint_delay(&mut self, system_delay_s: f32) -> usize {
        let samples = SetpointShaper::delay_samples_for(
            system_delay_s,
            self.shaper.config().frequency_hz,
            self.config.sample_period_s,
        );
        self.shaper.set_delay_samples(samples);
        self.config.shaper.delay_samples = samples;
        debug!("Setpoint delay: {} samples for {:.2}s dead time", samples, system_delay_s);
        samples
    }

    pub fn reset(&mut self) {
        self.integral = 0.0;
        self.prev_error = None;
        self.pending_dt = 0.0;
        self.terms = PidTerms::default();
        self.initialized = false;
    }

    pub fn integral(&self) -> f32 {
        self.integral
    }

    pub fn last_output(&self) -> f32 {
        self.output
    }

    pub fn last_terms(&self) -> PidTerms {
        self.terms
    }

    /// Shaped setpoint the last update tracked.
    pub fn shaped_setpoint(&self) -> f32 {
        self.shaper.current().value
    }

    fn safe_output(&self) -> f32 {
        0.0f32.clamp(self.config.output_min, self.config.output_max)
    }
}

/// True when integrating `error` pushes a saturated `drive` further into its limit.
/// A zero error has no direction and never winds up.
pub(crate) fn winds_up(error: f32, drive: f32) -> bool {
    error != 0.0 && drive != 0.0 && error.signum() == drive.signum()
}
