//! Boiler heater loop: smoothed temperature into a PID, with autotune on demand
//! and time-proportional switching for relay/SSR heaters.

use crate::control::{AutotuneConfig, AutotuneResult, Autotuner, PidConfig, PidCore, PidGains, PidMode};
use crate::system::events::{AutotuneHandler, FaultHandler};
use crate::types::is_valid_reading;
use embassy_time::{Duration, Instant};
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeaterConfig {
    pub pid: PidConfig,
    pub autotune: AutotuneConfig,
    /// Weight of the newest reading in the temperature average
    pub smoothing: f32,
    /// Soft PWM period for relay heaters (ms)
    pub pwm_window_ms: u64,
}

impl Default for HeaterConfig {
    fn default() -> Self {
        Self {
            pid: PidConfig::default(),
            autotune: AutotuneConfig::default(),
            smoothing: 0.2,
            pwm_window_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HeaterStatus {
    Off,
    Regulating,
    Autotuning,
    SensorFault,
}

/// Time-proportional output: on for `duty` percent of each window.
#[derive(Debug, Clone)]
pub struct SoftPwm {
    window: Duration,
    window_start: Option<Instant>,
}

impl SoftPwm {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            window_start: None,
        }
    }

    pub fn is_on(&mut self, now: Instant, duty: f32) -> bool {
        let window_ms = self.window.as_millis().max(1);
        let start = *self.window_start.get_or_insert(now);
        let mut elapsed = now.saturating_duration_since(start).as_millis();
        if elapsed >= window_ms {
            // stay aligned to the first window's grid
            elapsed %= window_ms;
            self.window_start = Some(Instant::from_millis(now.as_millis() - elapsed));
        }
        let on_ms = window_ms as f32 * duty.clamp(0.0, 100.0) / 100.0;
        (elapsed as f32) < on_ms
    }

    pub fn reset(&mut self) {
        self.window_start = None;
    }
}

pub struct HeaterLoop {
    config: HeaterConfig,
    pid: PidCore,
    autotuner: Option<Autotuner>,
    autotune_time_s: f32,
    last_autotune: Option<AutotuneResult>,
    temperature: f32,
    setpoint: f32,
    output: f32,
    status: HeaterStatus,
    pwm: SoftPwm,
    autotune_handlers: Vec<AutotuneHandler>,
    fault_handlers: Vec<FaultHandler>,
}

impl HeaterLoop {
    pub fn new(config: HeaterConfig) -> Self {
        Self {
            pid: PidCore::new(config.pid),
            pwm: SoftPwm::new(Duration::from_millis(config.pwm_window_ms)),
            config,
            autotuner: None,
            autotune_time_s: 0.0,
            last_autotune: None,
            temperature: 0.0,
            setpoint: 0.0,
            output: 0.0,
            status: HeaterStatus::Off,
            autotune_handlers: Vec::new(),
            fault_handlers: Vec::new(),
        }
    }

    pub fn on_autotune_result(&mut self, handler: AutotuneHandler) {
        self.autotune_handlers.push(handler);
    }

    pub fn on_fault(&mut self, handler: FaultHandler) {
        self.fault_handlers.push(handler);
    }

    pub fn set_setpoint(&mut self, setpoint: f32) {
        if setpoint.is_finite() && setpoint != self.setpoint {
            info!("Heater setpoint: {:.1}°C", setpoint);
            self.setpoint = setpoint.max(0.0);
        }
    }

    pub fn set_gains(&mut self, gains: PidGains) {
        if gains != self.pid.get_gains() {
            self.pid.set_gains(gains);
        }
    }

    /// Begin identification. The heater stays off until the baseline is captured,
    /// then runs at full power until the tuner is done.
    pub fn start_autotune(&mut self, goal: f32, window_size: usize) {
        let mut tuner = Autotuner::new(self.config.autotune);
        tuner.set_tuning_goal(goal);
        tuner.set_window_size(window_size);
        info!("Heater: starting autotune (goal {:.0}%, window {})", goal, window_size);
        self.autotuner = Some(tuner);
        self.autotune_time_s = 0.0;
        self.pid.set_manual_output(0.0);
        self.status = HeaterStatus::Autotuning;
    }

    pub fn stop_autotune(&mut self) {
        if self.autotuner.take().is_some() {
            info!("Heater: autotune cancelled");
            self.pid.set_mode(PidMode::Automatic);
            self.status = HeaterStatus::Off;
        }
    }

    pub fn is_autotuning(&self) -> bool {
        self.autotuner.is_some()
    }

    /// One control step. Returns the heater duty (0-100 %).
    pub fn update(&mut self, raw_temperature: f32, dt: f32) -> f32 {
        if !is_valid_reading(raw_temperature) {
            if self.status != HeaterStatus::SensorFault {
                error!("Heater: invalid temperature reading {}, heater off", raw_temperature);
                for handler in self.fault_handlers.iter_mut() {
                    handler();
                }
            }
            if self.autotuner.is_some() {
                warn!("Heater: aborting autotune on sensor fault");
                self.autotuner = None;
                self.pid.set_mode(PidMode::Automatic);
            }
            self.pid.reset();
            self.status = HeaterStatus::SensorFault;
            self.output = 0.0;
            return self.output;
        }
        if self.status == HeaterStatus::SensorFault {
            info!("Heater: temperature sensor recovered");
            self.status = HeaterStatus::Off;
        }

        let alpha = self.config.smoothing.clamp(0.0, 1.0);
        if self.temperature == 0.0 {
            self.temperature = raw_temperature;
        } else {
            self.temperature = alpha * raw_temperature + (1.0 - alpha) * self.temperature;
        }

        if self.autotuner.is_some() {
            self.output = self.update_autotune(dt);
            return self.output;
        }

        if self.temperature == 0.0 || self.setpoint == 0.0 {
            if self.status != HeaterStatus::Off {
                debug!("Heater: setpoint cleared, resetting loop");
                self.pid.reset();
            }
            self.status = HeaterStatus::Off;
            self.output = 0.0;
            return self.output;
        }

        self.status = HeaterStatus::Regulating;
        let mut output = self.output;
        self.pid.update(self.setpoint, self.temperature, dt, &mut output);
        self.output = output;
        self.output
    }

    fn update_autotune(&mut self, dt: f32) -> f32 {
        if dt.is_finite() && dt > 0.0 {
            self.autotune_time_s += dt;
        }
        let Some(tuner) = self.autotuner.as_mut() else {
            return 0.0;
        };
        tuner.update(self.temperature, self.autotune_time_s);
        if !tuner.is_finished() {
            return if tuner.wants_full_power() { 100.0 } else { 0.0 };
        }

        let outcome = tuner.result();
        self.autotuner = None;
        match outcome {
            Ok(result) => {
                info!(
                    "Heater: autotune done, delay {:.1}s, gain {:.3}/s",
                    result.pure_delay_s, result.system_gain
                );
                self.pid.set_gains(result.gains);
                self.pid.compute_setpoint_delay(result.pure_delay_s);
                self.last_autotune = Some(result);
                for handler in self.autotune_handlers.iter_mut() {
                    handler(&result);
                }
            }
            Err(e) => warn!("Heater: autotune ended without new gains: {}", e),
        }
        self.pid.set_mode(PidMode::Automatic);
        self.status = HeaterStatus::Off;
        0.0
    }

    /// Relay state for a switched heater at `now`.
    pub fn relay_on(&mut self, now: Instant) -> bool {
        self.pwm.is_on(now, self.output)
    }

    pub fn temperature(&self) -> f32 {
        self.temperature
    }

    pub fn setpoint(&self) -> f32 {
        self.setpoint
    }

    pub fn output(&self) -> f32 {
        self.output
    }

    pub fn status(&self) -> HeaterStatus {
        self.status
    }

    pub fn gains(&self) -> PidGains {
        self.pid.get_gains()
    }

    pub fn pid(&self) -> &PidCore {
        &self.pid
    }

    pub fn last_autotune(&self) -> Option<AutotuneResult> {
        self.last_autotune
    }
}
