use crate::types::{is_valid_reading, ActuatorCommands, ControlSample};
use embassy_time::{Duration, Instant};
use log::{error, info};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SafetyLimits {
    /// Thermal runaway ceiling (°C)
    pub max_temperature: f32,
    pub max_pressure: f32,
    /// No valid temperature for this long shuts everything down (ms)
    pub sensor_timeout_ms: u64,
    /// Remote link silence before shutdown (ms), 0 = not supervised
    pub remote_timeout_ms: u64,
}

impl Default for SafetyLimits {
    fn default() -> Self {
        Self {
            max_temperature: 170.0,
            max_pressure: 15.0,
            sensor_timeout_ms: 5_000,
            remote_timeout_ms: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "fault", rename_all = "snake_case")]
pub enum SafetyFault {
    OverTemperature { temperature: f32 },
    OverPressure { pressure: f32 },
    SensorTimeout,
    RemoteTimeout,
}

/// Supervisor wrapped around the control core. Once tripped it holds heater and
/// pump off and the valve closed until cleared.
pub struct SafetyController {
    limits: SafetyLimits,
    armed_at: Option<Instant>,
    last_valid_temperature: Option<Instant>,
    last_ping: Option<Instant>,
    fault: Option<SafetyFault>,
}

impl SafetyController {
    pub fn new(limits: SafetyLimits) -> Self {
        Self {
            limits,
            armed_at: None,
            last_valid_temperature: None,
            last_ping: None,
            fault: None,
        }
    }

    pub fn note_ping(&mut self, now: Instant) {
        self.last_ping = Some(now);
    }

    /// Evaluate this tick's readings. Returns true while shut down.
    pub fn should_emergency_stop(&mut self, now: Instant, sample: &ControlSample) -> bool {
        let armed_at = *self.armed_at.get_or_insert(now);
        if self.fault.is_some() {
            return true;
        }

        if sample.temperature_valid() {
            self.last_valid_temperature = Some(now);
            if sample.temperature_c > self.limits.max_temperature {
                error!(
                    "SAFETY: temperature {:.1}°C above {:.1}°C - shutting down",
                    sample.temperature_c, self.limits.max_temperature
                );
                return self.trip(SafetyFault::OverTemperature {
                    temperature: sample.temperature_c,
                });
            }
        }
        let last_temperature = self.last_valid_temperature.unwrap_or(armed_at);
        if now.saturating_duration_since(last_temperature) > Duration::from_millis(self.limits.sensor_timeout_ms) {
            error!("SAFETY: no valid temperature reading - shutting down");
            return self.trip(SafetyFault::SensorTimeout);
        }

        if is_valid_reading(sample.pressure_bar) && sample.pressure_bar > self.limits.max_pressure {
            error!(
                "SAFETY: pressure {:.1} bar above {:.1} bar - shutting down",
                sample.pressure_bar, self.limits.max_pressure
            );
            return self.trip(SafetyFault::OverPressure {
                pressure: sample.pressure_bar,
            });
        }

        if self.limits.remote_timeout_ms > 0 {
            let last_ping = self.last_ping.unwrap_or(armed_at);
            if now.saturating_duration_since(last_ping) > Duration::from_millis(self.limits.remote_timeout_ms) {
                error!("SAFETY: remote link timed out - shutting down");
                return self.trip(SafetyFault::RemoteTimeout);
            }
        }
        false
    }

    fn trip(&mut self, fault: SafetyFault) -> bool {
        self.fault = Some(fault);
        true
    }

    /// Commands as they may actually be applied.
    pub fn filter(&self, commands: ActuatorCommands) -> ActuatorCommands {
        if self.fault.is_some() {
            ActuatorCommands::OFF
        } else {
            commands.sanitized()
        }
    }

    pub fn fault(&self) -> Option<SafetyFault> {
        self.fault
    }

    pub fn is_tripped(&self) -> bool {
        self.fault.is_some()
    }

    /// Re-arm after a fault. Timeouts restart from `now`.
    pub fn clear(&mut self, now: Instant) {
        if let Some(fault) = self.fault.take() {
            info!("SAFETY: clearing {:?}", fault);
        }
        self.armed_at = Some(now);
        self.last_valid_temperature = None;
        self.last_ping = None;
    }

    pub fn limits(&self) -> &SafetyLimits {
        &self.limits
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(ms: u64) -> Instant {
        Instant::from_millis(ms)
    }

    fn sample(temperature: f32, pressure: f32) -> ControlSample {
        ControlSample {
            temperature_c: temperature,
            pressure_bar: pressure,
            ..ControlSample::default()
        }
    }

    fn running() -> ActuatorCommands {
        ActuatorCommands {
            heater_duty: 80.0,
            pump_duty: 60.0,
            valve_open: true,
            alt_relay: false,
        }
    }

    #[test]
    fn test_over_temperature_latches() {
        let mut safety = SafetyController::new(SafetyLimits::default());
        assert!(!safety.should_emergency_stop(at(0), &sample(93.0, 9.0)));
        assert_eq!(safety.filter(running()), running());

        assert!(safety.should_emergency_stop(at(100), &sample(171.0, 9.0)));
        assert_eq!(safety.fault(), Some(SafetyFault::OverTemperature { temperature: 171.0 }));
        // stays tripped after the reading recovers
        assert!(safety.should_emergency_stop(at(200), &sample(93.0, 9.0)));
        assert_eq!(safety.filter(running()), ActuatorCommands::OFF);

        safety.clear(at(300));
        assert!(!safety.should_emergency_stop(at(300), &sample(93.0, 9.0)));
    }

    #[test]
    fn test_over_pressure() {
        let mut safety = SafetyController::new(SafetyLimits::default());
        assert!(safety.should_emergency_stop(at(0), &sample(93.0, 16.0)));
        assert!(matches!(safety.fault(), Some(SafetyFault::OverPressure { .. })));
    }

    #[test]
    fn test_sensor_watchdog() {
        let mut safety = SafetyController::new(SafetyLimits::default());
        assert!(!safety.should_emergency_stop(at(0), &sample(93.0, 0.0)));
        for k in 1..=50u64 {
            assert!(!safety.should_emergency_stop(at(k * 100), &sample(f32::NAN, 0.0)));
        }
        assert!(safety.should_emergency_stop(at(5_100), &sample(f32::NAN, 0.0)));
        assert_eq!(safety.fault(), Some(SafetyFault::SensorTimeout));
    }

    #[test]
    fn test_remote_timeout_only_when_supervised() {
        let mut safety = SafetyController::new(SafetyLimits::default());
        for k in 0..100u64 {
            assert!(!safety.should_emergency_stop(at(k * 100), &sample(93.0, 0.0)));
        }

        let mut safety = SafetyController::new(SafetyLimits {
            remote_timeout_ms: 1_000,
            ..SafetyLimits::default()
        });
        safety.note_ping(at(0));
        assert!(!safety.should_emergency_stop(at(900), &sample(93.0, 0.0)));
        safety.note_ping(at(900));
        assert!(!safety.should_emergency_stop(at(1_800), &sample(93.0, 0.0)));
        assert!(safety.should_emergency_stop(at(2_000), &sample(93.0, 0.0)));
        assert_eq!(safety.fault(), Some(SafetyFault::RemoteTimeout));
    }
}
