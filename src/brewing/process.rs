//! The action the machine is currently performing. At most one exists at a time;
//! the controller creates it on activation and drops it on deactivation.

use crate::brewing::predictive::VolumetricRateCalculator;
use crate::brewing::profile::Profile;
use crate::brewing::states::BrewRun;
use crate::control::PumpDemand;
use crate::types::{
    ControlSample, MachineMode, ProcessTarget, BREW_SAFETY_DURATION_MS, HOT_WATER_SAFETY_DURATION_MS,
    PREDICTIVE_WINDOW_MS, STEAM_PUMP_DUTY, STEAM_SAFETY_DURATION_MS,
};
use embassy_time::{Duration, Instant};
use log::{debug, info};
use serde::{Deserialize, Serialize};

/// Durations and fixed duties for the process variants (milliseconds).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessTiming {
    pub brew_safety_ms: u64,
    pub steam_safety_ms: u64,
    pub water_safety_ms: u64,
    pub steam_pump_duty: f32,
    pub water_pump_duty: f32,
    pub grind_time_ms: u64,
    /// Grinder weight target for volumetric grinds (g)
    pub grind_target: f32,
}

impl Default for ProcessTiming {
    fn default() -> Self {
        Self {
            brew_safety_ms: BREW_SAFETY_DURATION_MS,
            steam_safety_ms: STEAM_SAFETY_DURATION_MS,
            water_safety_ms: HOT_WATER_SAFETY_DURATION_MS,
            steam_pump_duty: STEAM_PUMP_DUTY,
            water_pump_duty: 100.0,
            grind_time_ms: 15_000,
            grind_target: 18.0,
        }
    }
}

/// Grinder run: fixed time, or until the delay-compensated weight passes the target.
#[derive(Debug)]
pub struct GrindRun {
    target: ProcessTarget,
    time: Duration,
    volume_target: f32,
    delay: Duration,
    started: Instant,
    finished_at: Option<Instant>,
    volume: f32,
    rate: VolumetricRateCalculator,
}

impl GrindRun {
    pub fn new(target: ProcessTarget, time: Duration, volume_target: f32, delay: Duration, now: Instant) -> Self {
        info!("Grind: starting ({:?} target)", target);
        Self {
            target,
            time,
            volume_target,
            delay,
            started: now,
            finished_at: None,
            volume: 0.0,
            rate: VolumetricRateCalculator::default(),
        }
    }

    pub fn progress(&mut self, now: Instant, sample: &ControlSample) {
        if sample.volume_ml.is_finite() {
            self.volume = sample.volume_ml;
            if self.finished_at.is_none() {
                self.rate.add_measurement(now, sample.volume_ml);
            }
        }
        match self.target {
            ProcessTarget::Time => {
                if self.finished_at.is_none() && now.saturating_duration_since(self.started) >= self.time {
                    self.finished_at = Some(now);
                }
            }
            ProcessTarget::Volumetric => {
                let rate = self.rate.get_rate(now);
                let offset = rate * self.delay.as_millis() as f32 / 1000.0;
                debug!("Grind: rate {:.2}, volume {:.1}, offset {:.2}", rate, self.volume, offset);
                if self.finished_at.is_none() && self.volume + offset > self.volume_target {
                    info!("Grind: target {:.1} reached at {:.1}", self.volume_target, self.volume);
                    self.finished_at = Some(now);
                }
            }
        }
    }

    pub fn is_active(&self, now: Instant) -> bool {
        match self.target {
            ProcessTarget::Time => now.saturating_duration_since(self.started) < self.time,
            ProcessTarget::Volumetric => self.finished_at.is_none(),
        }
    }

    pub fn is_complete(&self, now: Instant) -> bool {
        match self.target {
            ProcessTarget::Time => !self.is_active(now),
            ProcessTarget::Volumetric => match self.finished_at {
                Some(at) => now.saturating_duration_since(at) > Duration::from_millis(PREDICTIVE_WINDOW_MS),
                None => false,
            },
        }
    }

    pub fn new_delay(&self) -> Duration {
        self.rate.get_new_delay(self.delay, self.volume_target, self.volume)
    }
}

/// Runs the pump at a fixed duty until its safety duration passes. Used for
/// steam (low duty to top up the boiler) and hot water.
#[derive(Debug, Clone, Copy)]
pub struct TimedPump {
    duty: f32,
    duration: Duration,
    started: Instant,
}

impl TimedPump {
    pub fn new(duty: f32, duration: Duration, now: Instant) -> Self {
        Self {
            duty,
            duration,
            started: now,
        }
    }

    pub fn is_active(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.started) < self.duration
    }

    pub fn pump_value(&self, now: Instant) -> f32 {
        if self.is_active(now) {
            self.duty
        } else {
            0.0
        }
    }
}

pub enum Process {
    Brew(BrewRun),
    Grind(GrindRun),
    Steam(TimedPump),
    Water(TimedPump),
}

impl Process {
    pub fn brew(profile: Profile, target: ProcessTarget, delay: Duration, timing: &ProcessTiming, now: Instant) -> Self {
        Process::Brew(BrewRun::new(
            profile,
            target,
            delay,
            Duration::from_millis(timing.brew_safety_ms),
            now,
        ))
    }

    pub fn steam(timing: &ProcessTiming, now: Instant) -> Self {
        info!("Steam: pump at {:.0}%", timing.steam_pump_duty);
        Process::Steam(TimedPump::new(
            timing.steam_pump_duty,
            Duration::from_millis(timing.steam_safety_ms),
            now,
        ))
    }

    pub fn water(timing: &ProcessTiming, now: Instant) -> Self {
        info!("Hot water: pump at {:.0}%", timing.water_pump_duty);
        Process::Water(TimedPump::new(
            timing.water_pump_duty,
            Duration::from_millis(timing.water_safety_ms),
            now,
        ))
    }

    pub fn grind(target: ProcessTarget, delay: Duration, timing: &ProcessTiming, now: Instant) -> Self {
        Process::Grind(GrindRun::new(
            target,
            Duration::from_millis(timing.grind_time_ms),
            timing.grind_target,
            delay,
            now,
        ))
    }

    pub fn mode(&self) -> MachineMode {
        match self {
            Process::Brew(_) => MachineMode::Brew,
            Process::Grind(_) => MachineMode::Grind,
            Process::Steam(_) => MachineMode::Steam,
            Process::Water(_) => MachineMode::Water,
        }
    }

    pub fn progress(&mut self, now: Instant, sample: &ControlSample) {
        match self {
            Process::Brew(run) => {
                run.progress(now, sample);
            }
            Process::Grind(run) => run.progress(now, sample),
            // nothing to track
            Process::Steam(_) | Process::Water(_) => {}
        }
    }

    /// Brew valve
    pub fn is_relay_active(&self) -> bool {
        match self {
            Process::Brew(run) => run.is_relay_active(),
            _ => false,
        }
    }

    /// Grinder
    pub fn is_alt_relay_active(&self, now: Instant) -> bool {
        match self {
            Process::Grind(run) => run.is_active(now),
            _ => false,
        }
    }

    pub fn pump_demand(&self, now: Instant) -> PumpDemand {
        match self {
            Process::Brew(run) => run.pump_demand(now),
            Process::Grind(_) => PumpDemand::Off,
            Process::Steam(pump) | Process::Water(pump) => {
                if pump.is_active(now) {
                    PumpDemand::Power {
                        duty: pump.pump_value(now),
                    }
                } else {
                    PumpDemand::Off
                }
            }
        }
    }

    pub fn pump_value(&self, now: Instant) -> f32 {
        match self {
            Process::Brew(run) => run.pump_value(),
            Process::Grind(_) => 0.0,
            Process::Steam(pump) | Process::Water(pump) => pump.pump_value(now),
        }
    }

    pub fn is_active(&self, now: Instant) -> bool {
        match self {
            Process::Brew(run) => run.is_active(),
            Process::Grind(run) => run.is_active(now),
            Process::Steam(pump) | Process::Water(pump) => pump.is_active(now),
        }
    }

    pub fn is_complete(&self, now: Instant) -> bool {
        match self {
            Process::Brew(run) => run.is_complete(now),
            Process::Grind(run) => run.is_complete(now),
            Process::Steam(pump) | Process::Water(pump) => !pump.is_active(now),
        }
    }

    /// Brew temperature of the current phase, if this process sets one.
    pub fn temperature(&self) -> Option<f32> {
        match self {
            Process::Brew(run) => Some(run.temperature()),
            _ => None,
        }
    }

    /// Corrected actuation delay for volumetric runs.
    pub fn new_delay(&self) -> Option<Duration> {
        match self {
            Process::Brew(run) if run.target() == ProcessTarget::Volumetric => Some(run.new_delay()),
            Process::Grind(run) if run.target == ProcessTarget::Volumetric => Some(run.new_delay()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(ms: u64) -> Instant {
        Instant::from_millis(ms)
    }

    fn weight(volume: f32) -> ControlSample {
        ControlSample {
            volume_ml: volume,
            ..ControlSample::default()
        }
    }

    #[test]
    fn test_steam_runs_low_duty_until_safety_duration() {
        let timing = ProcessTiming::default();
        let steam = Process::steam(&timing, at(0));
        assert_eq!(steam.mode(), MachineMode::Steam);
        assert_eq!(steam.pump_demand(at(1_000)), PumpDemand::Power { duty: 4.0 });
        assert!(!steam.is_relay_active());
        assert!(steam.is_active(at(59_999)));
        assert!(steam.is_complete(at(60_000)));
        assert_eq!(steam.pump_value(at(60_000)), 0.0);
        assert_eq!(steam.pump_demand(at(60_000)), PumpDemand::Off);
    }

    #[test]
    fn test_water_pumps_full() {
        let water = Process::water(&ProcessTiming::default(), at(0));
        assert_eq!(water.pump_value(at(10)), 100.0);
        assert!(water.is_active(at(29_999)));
        assert!(!water.is_active(at(30_000)));
    }

    #[test]
    fn test_timed_grind() {
        let mut grind = Process::Grind(GrindRun::new(
            ProcessTarget::Time,
            Duration::from_secs(8),
            0.0,
            Duration::from_millis(0),
            at(0),
        ));
        grind.progress(at(4_000), &weight(0.0));
        assert!(grind.is_alt_relay_active(at(4_000)));
        assert_eq!(grind.pump_demand(at(4_000)), PumpDemand::Off);
        grind.progress(at(8_000), &weight(0.0));
        assert!(!grind.is_alt_relay_active(at(8_000)));
        assert!(grind.is_complete(at(8_000)));
        assert_eq!(grind.new_delay(), None);
    }

    #[test]
    fn test_volumetric_grind_stops_early_by_delay() {
        // 1 g/s with a 500 ms delay -> stop once 17.5 g is passed
        let mut run = GrindRun::new(
            ProcessTarget::Volumetric,
            Duration::from_secs(0),
            18.0,
            Duration::from_millis(500),
            at(0),
        );
        let mut k = 0u64;
        while run.is_active(at(k * 100)) && k < 1_000 {
            k += 1;
            run.progress(at(k * 100), &weight(k as f32 * 0.1));
        }
        let stopped_at = k as f32 * 0.1;
        assert!(stopped_at > 17.4 && stopped_at < 17.8, "stopped at {stopped_at}");
        assert!(!run.is_complete(at(k * 100 + 100)));
        assert!(run.is_complete(at(k * 100 + PREDICTIVE_WINDOW_MS + 1)));
    }
}
