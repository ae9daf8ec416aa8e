//! Second-order setpoint shaping with rate limits and a delay line.
//!
//! The shaper turns a raw (possibly stepping) target into a smooth reference and
//! its derivative. The derivative is published immediately while the reference
//! itself can be held back a few samples, so a feedforward term driven by the
//! derivative leads the reference by roughly the plant's pure delay.

use heapless::Deque;
use serde::{Deserialize, Serialize};
use std::f32::consts::PI;

pub const MAX_SETPOINT_DELAY_SAMPLES: usize = 64;
const HISTORY_CAPACITY: usize = MAX_SETPOINT_DELAY_SAMPLES + 1;
const MAX_STEP_RAD: f32 = 0.2;
const MAX_SUBSTEPS: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SetpointShaperConfig {
    /// Natural frequency of the filter (Hz)
    pub frequency_hz: f32,
    /// 1.0 is critically damped
    pub damping: f32,
    /// Lower bound on the reference rate (units/s), `None` = unbounded
    pub rate_min: Option<f32>,
    /// Upper bound on the reference rate (units/s), `None` = unbounded
    pub rate_max: Option<f32>,
    /// Samples the reference lags its derivative
    pub delay_samples: usize,
}

impl Default for SetpointShaperConfig {
    fn default() -> Self {
        Self {
            frequency_hz: 1.0,
            damping: 1.0,
            rate_min: None,
            rate_max: None,
            delay_samples: 0,
        }
    }
}

impl SetpointShaperConfig {
    pub fn with_rate_limits(mut self, min: Option<f32>, max: Option<f32>) -> Self {
        self.rate_min = min;
        self.rate_max = max;
        self
    }

    pub fn with_delay_samples(mut self, samples: usize) -> Self {
        self.delay_samples = samples.min(MAX_SETPOINT_DELAY_SAMPLES);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ShapedSetpoint {
    pub value: f32,
    pub derivative: f32,
}

#[derive(Debug, Clone)]
pub struct SetpointShaper {
    config: SetpointShaperConfig,
    lead: f32,
    derivative: f32,
    history: Deque<f32, HISTORY_CAPACITY>,
    initialized: bool,
}

impl SetpointShaper {
    pub fn new(config: SetpointShaperConfig) -> Self {
        Self {
            config: config.with_delay_samples(config.delay_samples),
            lead: 0.0,
            derivative: 0.0,
            history: Deque::new(),
            initialized: false,
        }
    }

    pub fn config(&self) -> &SetpointShaperConfig {
        &self.config
    }

    /// Swap the filter parameters. Changing the dynamics reseeds on the next update.
    pub fn set_config(&mut self, config: SetpointShaperConfig) {
        let dynamics_changed =
            config.frequency_hz != self.config.frequency_hz || config.damping != self.config.damping;
        self.config = config.with_delay_samples(config.delay_samples);
        if dynamics_changed {
            self.initialized = false;
        }
    }

    pub fn set_delay_samples(&mut self, samples: usize) {
        self.config.delay_samples = samples.min(MAX_SETPOINT_DELAY_SAMPLES);
        while self.history.len() > self.config.delay_samples + 1 {
            self.history.pop_front();
        }
    }

    /// Seed the filter at rest on `initial`.
    pub fn reset(&mut self, initial: f32) {
        self.lead = initial;
        self.derivative = 0.0;
        self.history.clear();
        for _ in 0..=self.config.delay_samples {
            let _ = self.history.push_back(initial);
        }
        self.initialized = true;
    }

    /// Forget the current state; the next `update` reseeds from its target.
    pub fn invalidate(&mut self) {
        self.initialized = false;
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn update(&mut self, target: f32, dt: f32) -> ShapedSetpoint {
        if !self.initialized {
            self.reset(target);
        }
        if !(dt > 0.0) || !target.is_finite() {
            return self.current();
        }

        let wn = 2.0 * PI * self.config.frequency_hz;
        // semi-implicit Euler is only stable for wn * h well below 2
        let steps = ((wn * dt / MAX_STEP_RAD).ceil() as usize).clamp(1, MAX_SUBSTEPS);
        let h = dt / steps as f32;
        for _ in 0..steps {
            let accel =
                wn * wn * (target - self.lead) - 2.0 * self.config.damping * wn * self.derivative;
            self.derivative += accel * h;
            if let Some(max) = self.config.rate_max {
                self.derivative = self.derivative.min(max);
            }
            if let Some(min) = self.config.rate_min {
                self.derivative = self.derivative.max(min);
            }
            self.lead += self.derivative * h;
        }

        if self.history.is_full() {
            self.history.pop_front();
        }
        let _ = self.history.push_back(self.lead);
        while self.history.len() > self.config.delay_samples + 1 {
            self.history.pop_front();
        }

        self.current()
    }

    pub fn current(&self) -> ShapedSetpoint {
        ShapedSetpoint {
            value: self.history.front().copied().unwrap_or(self.lead),
            derivative: self.derivative,
        }
    }

    /// Undelayed filter output.
    pub fn lead_value(&self) -> f32 {
        self.lead
    }

    /// Delay line length that lines the reference up with its derivative for a
    /// plant with `system_delay_s` of pure delay. The filter's own lag
    /// `1 / (2 pi f)` is subtracted first.
    pub fn delay_samples_for(system_delay_s: f32, frequency_hz: f32, sample_period_s: f32) -> usize {
        if !(sample_period_s > 0.0) || !(frequency_hz > 0.0) {
            return 0;
        }
        let filter_delay = 1.0 / (2.0 * PI * frequency_hz);
        let total = (system_delay_s - filter_delay).max(0.0);
        ((total / sample_period_s) as usize).min(MAX_SETPOINT_DELAY_SAMPLES)
    }
}
