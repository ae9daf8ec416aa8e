//! Step-response identification for the heater loop.
//!
//! The heater is forced to full power once a baseline slope is known. Reaction
//! onset is confirmed by a moving-window slope threshold; the steepest point of
//! the rise is found when the slope of the slope turns negative. Dead time and
//! maximum slope then give PID gains for a target phase margin.

use crate::control::pid::PidGains;
use crate::math::least_squares_slope;
use heapless::Deque;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::f32::consts::PI;
use std::fmt;

pub const MAX_AUTOTUNE_WINDOW: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AutotuneConfig {
    /// Samples in the slope window
    pub window_size: usize,
    /// Slope rise over baseline that counts as a reaction (units/s)
    pub epsilon: f32,
    pub required_confirmations: u32,
    /// Give up if no reaction within this long after power on
    pub reaction_timeout_s: f32,
    /// Give up if no inflection within this long after power on
    pub max_duration_s: f32,
    /// Rise past the starting temperature before an inflection is accepted
    pub min_rise: f32,
    /// 0 = most conservative, 100 = most aggressive
    pub tuning_goal: f32,
    pub min_phase_margin_deg: f32,
    pub max_phase_margin_deg: f32,
    /// Phase given up to the integral term at crossover
    pub integral_phase_deg: f32,
    pub kd_derating: f32,
    /// Controller output at full power
    pub output_span: f32,
}

impl Default for AutotuneConfig {
    fn default() -> Self {
        Self {
            window_size: 4,
            epsilon: 0.4,
            required_confirmations: 3,
            reaction_timeout_s: 20.0,
            max_duration_s: 600.0,
            min_rise: 7.0,
            tuning_goal: 50.0,
            min_phase_margin_deg: 20.0,
            max_phase_margin_deg: 70.0,
            integral_phase_deg: 10.0,
            kd_derating: 0.35,
            output_span: 100.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AutotunePhase {
    Baseline,
    AwaitingReaction,
    TrackingSlope,
    Finished,
    TimedOut,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct AutotuneResult {
    pub gains: PidGains,
    pub pure_delay_s: f32,
    /// Maximum slope at full power (units/s)
    pub system_gain: f32,
    pub crossover_hz: f32,
    pub phase_margin_deg: f32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AutotuneError {
    InProgress,
    ReactionTimeout,
    NoInflection,
    /// Identified delay or gain can not produce usable gains
    Implausible { delay_s: f32, gain: f32 },
}

impl fmt::Display for AutotuneError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AutotuneError::InProgress => write!(f, "Autotune still running"),
            AutotuneError::ReactionTimeout => write!(f, "No reaction detected before timeout"),
            AutotuneError::NoInflection => write!(f, "No inflection found before the deadline"),
            AutotuneError::Implausible { delay_s, gain } => {
                write!(f, "Implausible identification: delay={}s gain={}", delay_s, gain)
            }
        }
    }
}

impl std::error::Error for AutotuneError {}

pub struct Autotuner {
    config: AutotuneConfig,
    phase: AutotunePhase,
    window: Deque<(f32, f32), { MAX_AUTOTUNE_WINDOW + 1 }>,
    slopes: Deque<(f32, f32), MAX_AUTOTUNE_WINDOW>,
    confirmations: u32,
    initial_slope: f32,
    start_temperature: f32,
    power_on_time: f32,
    reaction_time: f32,
    outcome: Result<AutotuneResult, AutotuneError>,
}

impl Autotuner {
    pub fn new(config: AutotuneConfig) -> Self {
        let mut config = config;
        config.window_size = config.window_size.clamp(2, MAX_AUTOTUNE_WINDOW);
        config.required_confirmations = config.required_confirmations.max(1);
        Self {
            config,
            phase: AutotunePhase::Baseline,
            window: Deque::new(),
            slopes: Deque::new(),
            confirmations: 0,
            initial_slope: 0.0,
            start_temperature: 0.0,
            power_on_time: 0.0,
            reaction_time: 0.0,
            outcome: Err(AutotuneError::InProgress),
        }
    }

    pub fn reset(&mut self) {
        self.phase = AutotunePhase::Baseline;
        self.window.clear();
        self.slopes.clear();
        self.confirmations = 0;
        self.initial_slope = 0.0;
        self.start_temperature = 0.0;
        self.power_on_time = 0.0;
        self.reaction_time = 0.0;
        self.outcome = Err(AutotuneError::InProgress);
    }

    /// Feed one sample. Invalid temperatures are skipped.
    pub fn update(&mut self, temperature: f32, time_s: f32) -> AutotunePhase {
        if self.is_finished() || !temperature.is_finite() || !time_s.is_finite() {
            return self.phase;
        }

        if self.window.is_full() {
            self.window.pop_front();
        }
        let _ = self.window.push_back((time_s, temperature));

        let n = self.config.window_size;
        if self.window.len() < n {
            return self.phase;
        }

        let slope = self.window_slope();
        if self.phase == AutotunePhase::Baseline {
            // exactly n samples: baseline done, full power from here
            self.initial_slope = slope;
            self.start_temperature = temperature;
            self.power_on_time = time_s;
            self.phase = AutotunePhase::AwaitingReaction;
            info!(
                "Autotune: baseline slope {:.3}/s at {:.1}, forcing full power",
                slope, temperature
            );
            return self.phase;
        }

        let elapsed = time_s - self.power_on_time;
        match self.phase {
            AutotunePhase::AwaitingReaction => {
                if slope > self.initial_slope + self.config.epsilon {
                    self.confirmations += 1;
                    if self.confirmations >= self.config.required_confirmations {
                        // onset is the first of the confirming samples
                        let back = self.config.required_confirmations as usize;
                        let index = self.window.len().saturating_sub(back);
                        self.reaction_time = self
                            .window
                            .iter()
                            .nth(index)
                            .map(|&(t, _)| t)
                            .unwrap_or(time_s);
                        self.phase = AutotunePhase::TrackingSlope;
                        info!(
                            "Autotune: reaction at {:.2}s ({:.2}s after power on)",
                            self.reaction_time,
                            self.reaction_time - self.power_on_time
                        );
                    }
                } else {
                    self.confirmations = 0;
                    if elapsed > self.config.reaction_timeout_s {
                        warn!("Autotune: no reaction after {:.1}s", elapsed);
                        self.phase = AutotunePhase::TimedOut;
                        self.outcome = Err(AutotuneError::ReactionTimeout);
                    }
                }
            }
            AutotunePhase::TrackingSlope => {
                if self.slopes.is_full() {
                    self.slopes.pop_front();
                }
                let _ = self.slopes.push_back((time_s, slope));

                if self.slopes.len() >= n {
                    let slope_of_slope =
                        least_squares_slope(self.slopes.iter().map(|&(t, s)| (t as f64, s as f64)))
                            .unwrap_or(0.0);
                    debug!(
                        "Autotune: slope {:.3}/s, slope of slope {:.4}",
                        slope, slope_of_slope
                    );
                    if slope_of_slope < 0.0
                        && temperature > self.start_temperature + self.config.min_rise
                    {
                        let system_gain = self
                            .slopes
                            .iter()
                            .map(|&(_, s)| s)
                            .fold(f32::MIN, f32::max);
                        let delay = self.reaction_time - self.power_on_time;
                        self.finish(delay, system_gain);
                        return self.phase;
                    }
                    self.slopes.pop_front();
                }

                if elapsed > self.config.max_duration_s {
                    warn!("Autotune: no inflection after {:.1}s", elapsed);
                    self.phase = AutotunePhase::TimedOut;
                    self.outcome = Err(AutotuneError::NoInflection);
                }
            }
            _ => {}
        }

        self.phase
    }

    fn window_slope(&self) -> f32 {
        let skip = self.window.len() - self.config.window_size;
        least_squares_slope(
            self.window
                .iter()
                .skip(skip)
                .map(|&(t, v)| (t as f64, v as f64)),
        )
        .unwrap_or(0.0) as f32
    }

    fn finish(&mut self, delay_s: f32, system_gain: f32) {
        match self.compute_gains(delay_s, system_gain) {
            Ok(result) => {
                info!(
                    "Autotune finished: delay={:.2}s gain={:.3}/s fc={:.4}Hz kp={:.3} ki={:.4} kd={:.3} kff={:.3}",
                    result.pure_delay_s,
                    result.system_gain,
                    result.crossover_hz,
                    result.gains.kp,
                    result.gains.ki,
                    result.gains.kd,
                    result.gains.kff
                );
                self.phase = AutotunePhase::Finished;
                self.outcome = Ok(result);
            }
            Err(e) => {
                warn!("Autotune failed: {}", e);
                self.phase = AutotunePhase::Failed;
                self.outcome = Err(e);
            }
        }
    }

    /// Gains for a first-order-plus-dead-time plant with the given dead time and
    /// maximum slope at full power.
    pub fn compute_gains(&self, delay_s: f32, system_gain: f32) -> Result<AutotuneResult, AutotuneError> {
        let implausible = AutotuneError::Implausible {
            delay_s,
            gain: system_gain,
        };
        if !(delay_s > 0.0) || !(system_gain > 0.0) || !delay_s.is_finite() || !system_gain.is_finite() {
            return Err(implausible);
        }

        let c = &self.config;
        let phase_margin = self.phase_margin_deg();
        let mphi = phase_margin + c.integral_phase_deg;
        let crossover_hz = (90.0 - mphi) / (delay_s * 360.0);

        let kp = 2.0 * PI * crossover_hz / system_gain;
        let fi = crossover_hz / ((90.0 - c.integral_phase_deg).to_radians()).tan();
        let ki = fi * 2.0 * PI * kp;
        let ku = kp / 0.7;
        let tu = 1.75 * ku / ki;
        let kd = 0.105 * ku * tu * c.kd_derating;
        let kff = 1.0 / system_gain;

        if !(kp > 0.0) || !ki.is_finite() || !kd.is_finite() {
            return Err(implausible);
        }

        Ok(AutotuneResult {
            gains: PidGains {
                kp: kp * c.output_span,
                ki: ki * c.output_span,
                kd: kd * c.output_span,
                kff: kff * c.output_span,
            },
            pure_delay_s: delay_s,
            system_gain,
            crossover_hz,
            phase_margin_deg: phase_margin,
        })
    }

    /// Phase margin the current tuning goal maps to.
    pub fn phase_margin_deg(&self) -> f32 {
        let c = &self.config;
        let conservative = 100.0 - c.tuning_goal.clamp(0.0, 100.0).round();
        c.min_phase_margin_deg + conservative / 100.0 * (c.max_phase_margin_deg - c.min_phase_margin_deg)
    }

    pub fn set_tuning_goal(&mut self, goal: f32) {
        if goal.is_finite() {
            self.config.tuning_goal = goal.clamp(0.0, 100.0);
        }
    }

    pub fn set_window_size(&mut self, size: usize) {
        self.config.window_size = size.clamp(2, MAX_AUTOTUNE_WINDOW);
    }

    pub fn config(&self) -> &AutotuneConfig {
        &self.config
    }

    pub fn phase(&self) -> AutotunePhase {
        self.phase
    }

    /// Heater should be at full power.
    pub fn wants_full_power(&self) -> bool {
        matches!(
            self.phase,
            AutotunePhase::AwaitingReaction | AutotunePhase::TrackingSlope
        )
    }

    pub fn is_finished(&self) -> bool {
        matches!(
            self.phase,
            AutotunePhase::Finished | AutotunePhase::TimedOut | AutotunePhase::Failed
        )
    }

    pub fn result(&self) -> Result<AutotuneResult, AutotuneError> {
        self.outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::{assert_abs_diff_eq, assert_relative_eq};

    const DT: f32 = 0.25;
    const AMPLITUDE: f32 = 60.0;
    const TAU: f32 = 30.0;
    const DEAD_TIME: f32 = 3.0;

    /// Boiler that starts rising DEAD_TIME after the heater turns on.
    fn fopdt_temperature(t: f32, power_on: Option<f32>) -> f32 {
        match power_on {
            Some(on) if t >= on + DEAD_TIME => {
                20.0 + AMPLITUDE * (1.0 - (-(t - on - DEAD_TIME) / TAU).exp())
            }
            _ => 20.0,
        }
    }

    fn run_fopdt(tuner: &mut Autotuner) {
        let mut power_on = None;
        for k in 0..4000 {
            let t = k as f32 * DT;
            tuner.update(fopdt_temperature(t, power_on), t);
            if power_on.is_none() && tuner.wants_full_power() {
                power_on = Some(t);
            }
            if tuner.is_finished() {
                return;
            }
        }
    }

    #[test]
    fn test_identifies_first_order_plus_dead_time() {
        let mut tuner = Autotuner::new(AutotuneConfig::default());
        run_fopdt(&mut tuner);
        assert_eq!(tuner.phase(), AutotunePhase::Finished);

        let result = tuner.result().unwrap();
        assert_abs_diff_eq!(result.pure_delay_s, DEAD_TIME, epsilon = 1.0);
        assert_relative_eq!(result.system_gain, AMPLITUDE / TAU, max_relative = 0.2);
        assert!(result.gains.kp > 0.0);
        assert!(result.gains.ki > 0.0);

        // crossover as the phase margin formula gives it for the true dead time
        let mphi = result.phase_margin_deg + 10.0;
        let analytic = (90.0 - mphi) / (DEAD_TIME * 360.0);
        assert_relative_eq!(result.crossover_hz, analytic, max_relative = 0.15);
        // and exactly for the identified one
        let identified = (90.0 - mphi) / (result.pure_delay_s * 360.0);
        assert_relative_eq!(result.crossover_hz, identified, max_relative = 1e-5);
    }

    #[test]
    fn test_reaction_timeout() {
        let mut tuner = Autotuner::new(AutotuneConfig::default());
        for k in 0..200 {
            tuner.update(20.0, k as f32 * DT);
        }
        assert_eq!(tuner.phase(), AutotunePhase::TimedOut);
        assert_eq!(tuner.result(), Err(AutotuneError::ReactionTimeout));
        assert!(!tuner.wants_full_power());
    }

    #[test]
    fn test_accelerating_rise_hits_deadline() {
        // Slope keeps growing, so no inflection ever shows up
        let config = AutotuneConfig {
            max_duration_s: 30.0,
            ..AutotuneConfig::default()
        };
        let mut tuner = Autotuner::new(config);
        let mut on = None;
        for k in 0..400 {
            let t = k as f32 * DT;
            let temp = match on {
                Some(start) if t > start => 20.0 + 0.1 * (t - start) * (t - start),
                _ => 20.0,
            };
            tuner.update(temp, t);
            if on.is_none() && tuner.wants_full_power() {
                on = Some(t);
            }
        }
        assert_eq!(tuner.result(), Err(AutotuneError::NoInflection));
    }

    #[test]
    fn test_tuning_goal_maps_to_margin() {
        let mut tuner = Autotuner::new(AutotuneConfig::default());
        tuner.set_tuning_goal(0.0);
        assert_abs_diff_eq!(tuner.phase_margin_deg(), 70.0);
        tuner.set_tuning_goal(100.0);
        assert_abs_diff_eq!(tuner.phase_margin_deg(), 20.0);
        tuner.set_tuning_goal(250.0);
        assert_abs_diff_eq!(tuner.phase_margin_deg(), 20.0);
        tuner.set_tuning_goal(50.0);
        assert_abs_diff_eq!(tuner.phase_margin_deg(), 45.0);
    }

    #[test]
    fn test_implausible_identification_rejected() {
        let tuner = Autotuner::new(AutotuneConfig::default());
        assert!(tuner.compute_gains(0.0, 2.0).is_err());
        assert!(tuner.compute_gains(3.0, -1.0).is_err());
        assert!(tuner.compute_gains(3.0, 2.0).is_ok());
    }
}
