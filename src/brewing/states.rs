//! Brew phase sequencer
//! States: Running, Finished
//!
//! Each progress tick accumulates the pumped volume, then advances through every
//! phase whose finish condition already holds. Pump demands for the current phase
//! are eased from the values the phase started at towards its effective targets.

use crate::brewing::predictive::VolumetricRateCalculator;
use crate::brewing::profile::{Easing, Phase, PhaseProgress, Profile, PumpSpec, PumpTargetKind};
use crate::control::PumpDemand;
use crate::types::{ControlSample, ProcessTarget, PREDICTIVE_WINDOW_MS};
use embassy_time::{Duration, Instant};
use log::{debug, info, warn};
use statig::prelude::*;

// Input events to the sequencer
#[derive(Debug, Clone, Copy)]
pub enum BrewInput {
    Progress { now: Instant, sample: ControlSample },
    Stop { now: Instant },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrewState {
    Running,
    Finished,
}

// Shared context for the state machine
#[derive(Debug)]
pub struct BrewContext {
    profile: Profile,
    target: ProcessTarget,
    phase_index: usize,
    started: Instant,
    phase_started: Instant,
    last_progress: Instant,
    finished_at: Option<Instant>,
    /// Longest any single phase may run
    safety_duration: Duration,

    // Values the current phase eases from, and towards
    start_pressure: f32,
    start_flow: f32,
    effective_pressure: f32,
    effective_flow: f32,

    pressure: f32,
    flow: f32,
    volume: f32,
    pumped: f32,

    rate: VolumetricRateCalculator,
    delay: Duration,
}

impl BrewContext {
    fn new(profile: Profile, target: ProcessTarget, delay: Duration, safety_duration: Duration, now: Instant) -> Self {
        let mut context = Self {
            profile,
            target,
            phase_index: 0,
            started: now,
            phase_started: now,
            last_progress: now,
            finished_at: None,
            safety_duration,
            start_pressure: 0.0,
            start_flow: 0.0,
            effective_pressure: 0.0,
            effective_flow: 0.0,
            pressure: 0.0,
            flow: 0.0,
            volume: 0.0,
            pumped: 0.0,
            rate: VolumetricRateCalculator::default(),
            delay,
        };
        context.compute_effective_targets();
        context
    }

    fn phase(&self) -> Option<&Phase> {
        self.profile.phases.get(self.phase_index)
    }

    fn volumetric(&self) -> bool {
        self.target == ProcessTarget::Volumetric
    }

    /// Output volume expected once the actuation delay has passed.
    fn predicted_volume(&self, now: Instant) -> f32 {
        if self.volume <= 0.0 {
            return self.volume;
        }
        self.volume + self.rate.get_rate(now) * self.delay.as_millis() as f32 / 1000.0
    }

    fn progress_for(&self, now: Instant) -> PhaseProgress {
        PhaseProgress {
            elapsed: now.saturating_duration_since(self.phase_started),
            volume: self.predicted_volume(now),
            pressure: self.pressure,
            flow: self.flow,
            pumped: self.pumped,
        }
    }

    fn phase_finished(&self, now: Instant) -> bool {
        if now.saturating_duration_since(self.phase_started) > self.safety_duration {
            warn!("Brew: phase {} hit the safety duration", self.phase_index);
            return true;
        }
        match self.phase() {
            Some(phase) => phase.is_finished(self.volumetric(), &self.progress_for(now)),
            None => true,
        }
    }

    fn transition_alpha(&self, now: Instant) -> f32 {
        let Some(phase) = self.phase() else {
            return 1.0;
        };
        let transition = phase.transition;
        if transition.easing == Easing::Instant || transition.duration <= 0.0 {
            return 1.0;
        }
        let elapsed = now.saturating_duration_since(self.phase_started).as_millis() as f32 / 1000.0;
        transition.easing.apply(elapsed / transition.duration)
    }

    fn eased_pressure(&self, now: Instant) -> f32 {
        let alpha = self.transition_alpha(now);
        self.start_pressure + (self.effective_pressure - self.start_pressure) * alpha
    }

    fn eased_flow(&self, now: Instant) -> f32 {
        let alpha = self.transition_alpha(now);
        self.start_flow + (self.effective_flow - self.start_flow) * alpha
    }

    /// Resolve "-1 = measured at phase start" and pin the start of the limit
    /// channel to its target so only the tracked quantity is eased.
    fn compute_effective_targets(&mut self) {
        let Some(PumpSpec::Advanced(pump)) = self.phase().map(|p| p.pump) else {
            self.effective_pressure = 0.0;
            self.effective_flow = 0.0;
            return;
        };
        self.effective_pressure = if pump.pressure == -1.0 { self.start_pressure } else { pump.pressure };
        self.effective_flow = if pump.flow == -1.0 { self.start_flow } else { pump.flow };
        match pump.target {
            PumpTargetKind::Flow => self.start_pressure = self.effective_pressure,
            PumpTargetKind::Pressure => self.start_flow = self.effective_flow,
        }
    }

    /// Move to the next phase. Returns false when there is none left.
    fn advance(&mut self, now: Instant) -> bool {
        let ending_pressure = self.eased_pressure(now);
        let ending_flow = self.eased_flow(now);

        self.phase_index += 1;
        let Some(next) = self.phase() else {
            return false;
        };
        let adaptive = next.transition.adaptive;
        info!("Brew: entering phase {} '{}'", self.phase_index, next.name);

        self.phase_started = now;
        self.pumped = 0.0;
        if adaptive {
            self.start_pressure = self.pressure;
            self.start_flow = self.flow;
        } else {
            self.start_pressure = ending_pressure;
            self.start_flow = ending_flow;
        }
        self.compute_effective_targets();
        true
    }

    fn record(&mut self, now: Instant, sample: &ControlSample) {
        let dt = now.saturating_duration_since(self.last_progress).as_millis() as f32 / 1000.0;
        self.last_progress = now;
        if sample.pump_flow_ml_s.is_finite() {
            self.flow = sample.pump_flow_ml_s;
            self.pumped += self.flow.max(0.0) * dt;
        }
        if sample.pressure_valid() {
            self.pressure = sample.pressure_bar;
        }
        if sample.volume_ml.is_finite() {
            self.volume = sample.volume_ml;
            self.rate.add_measurement(now, sample.volume_ml);
        }
    }

    fn record_tail(&mut self, now: Instant, sample: &ControlSample) {
        self.last_progress = now;
        if sample.volume_ml.is_finite() {
            self.volume = sample.volume_ml;
        }
    }
}

#[derive(Debug, Default)]
pub struct BrewSequencer;

#[state_machine(
    initial = "State::running()",
    state(derive(Debug)),
    on_transition = "Self::on_transition"
)]
impl BrewSequencer {
    #[state]
    fn running(context: &mut BrewContext, event: &BrewInput) -> Response<State> {
        use Response::*;

        match event {
            BrewInput::Progress { now, sample } => {
                context.record(*now, sample);
                while context.phase_finished(*now) {
                    if !context.advance(*now) {
                        context.finished_at = Some(*now);
                        return Transition(State::finished());
                    }
                }
                debug!(
                    "Brew: phase {} elapsed {}ms, volume {:.1}, pumped {:.1}",
                    context.phase_index,
                    now.saturating_duration_since(context.phase_started).as_millis(),
                    context.volume,
                    context.pumped
                );
                Handled
            }
            BrewInput::Stop { now } => {
                context.finished_at = Some(*now);
                Transition(State::finished())
            }
        }
    }

    #[state]
    fn finished(context: &mut BrewContext, event: &BrewInput) -> Response<State> {
        use Response::*;

        // Rate stays at the last running sample; only the cup keeps filling
        if let BrewInput::Progress { now, sample } = event {
            context.record_tail(*now, sample);
        }
        Handled
    }

    fn on_transition(&mut self, source: &State, target: &State) {
        info!("Brew state transition: {:?} -> {:?}", source, target);
    }
}

/// One execution of a brew profile.
pub struct BrewRun {
    machine: statig::prelude::StateMachine<BrewSequencer>,
    context: BrewContext,
}

impl BrewRun {
    pub fn new(
        profile: Profile,
        target: ProcessTarget,
        delay: Duration,
        safety_duration: Duration,
        now: Instant,
    ) -> Self {
        info!(
            "Brew: starting '{}' ({} phases, {:?} target)",
            profile.label,
            profile.phases.len(),
            target
        );
        Self {
            machine: BrewSequencer::default().state_machine(),
            context: BrewContext::new(profile, target, delay, safety_duration, now),
        }
    }

    pub fn handle_input(&mut self, input: BrewInput) -> BrewState {
        self.machine.handle_with_context(&input, &mut self.context);
        self.get_state()
    }

    pub fn progress(&mut self, now: Instant, sample: &ControlSample) -> BrewState {
        self.handle_input(BrewInput::Progress { now, sample: *sample })
    }

    pub fn stop(&mut self, now: Instant) {
        self.handle_input(BrewInput::Stop { now });
    }

    pub fn get_state(&self) -> BrewState {
        match self.machine.state() {
            State::Running {} => BrewState::Running,
            State::Finished {} => BrewState::Finished,
        }
    }

    pub fn is_active(&self) -> bool {
        self.get_state() == BrewState::Running
    }

    /// A time run is complete as soon as it stops. A volumetric run waits out the
    /// predictive window so the drip after the stop lands in the final volume.
    pub fn is_complete(&self, now: Instant) -> bool {
        match (self.context.target, self.context.finished_at) {
            (_, None) => false,
            (ProcessTarget::Time, Some(_)) => true,
            (ProcessTarget::Volumetric, Some(at)) => {
                now.saturating_duration_since(at) > Duration::from_millis(PREDICTIVE_WINDOW_MS)
            }
        }
    }

    pub fn is_relay_active(&self) -> bool {
        self.is_active() && self.context.phase().map(|p| p.valve_open()).unwrap_or(false)
    }

    /// Duty cycle for open-loop pumping: the simple value, 100 % for advanced phases.
    pub fn pump_value(&self) -> f32 {
        if !self.is_active() {
            return 0.0;
        }
        match self.context.phase().map(|p| p.pump) {
            Some(PumpSpec::Simple(duty)) => duty,
            Some(PumpSpec::Advanced(_)) => 100.0,
            None => 0.0,
        }
    }

    pub fn pump_demand(&self, now: Instant) -> PumpDemand {
        if !self.is_active() {
            return PumpDemand::Off;
        }
        match self.context.phase().map(|p| p.pump) {
            Some(PumpSpec::Simple(duty)) => PumpDemand::Power { duty },
            Some(PumpSpec::Advanced(pump)) => {
                let pressure = self.context.eased_pressure(now);
                let flow = self.context.eased_flow(now);
                match pump.target {
                    PumpTargetKind::Pressure => PumpDemand::Pressure { pressure, flow_limit: flow },
                    PumpTargetKind::Flow => PumpDemand::Flow { flow, pressure_limit: pressure },
                }
            }
            None => PumpDemand::Off,
        }
    }

    pub fn temperature(&self) -> f32 {
        let index = self.context.phase_index.min(self.context.profile.phases.len().saturating_sub(1));
        self.context.profile.temperature_for(index)
    }

    /// Actuation delay corrected by how far the final volume missed the target.
    pub fn new_delay(&self) -> Duration {
        let expected = self.context.profile.brew_volume();
        if expected <= 0.0 {
            return self.context.delay;
        }
        self.context.rate.get_new_delay(self.context.delay, expected, self.context.volume)
    }

    pub fn phase_index(&self) -> usize {
        self.context.phase_index
    }

    pub fn target(&self) -> ProcessTarget {
        self.context.target
    }

    pub fn profile(&self) -> &Profile {
        &self.context.profile
    }

    pub fn pumped(&self) -> f32 {
        self.context.pumped
    }

    pub fn volume(&self) -> f32 {
        self.context.volume
    }

    pub fn elapsed(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.context.started)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::brewing::profile::{AdvancedPump, Comparison, PhaseKind, Target, TargetKind, Transition};
    use crate::types::BREW_SAFETY_DURATION_MS;
    use approx::assert_abs_diff_eq;

    const TICK_MS: u64 = 100;

    fn at(ms: u64) -> Instant {
        Instant::from_millis(ms)
    }

    fn sample(pressure: f32, flow: f32, volume: f32) -> ControlSample {
        ControlSample {
            temperature_c: 93.0,
            pressure_bar: pressure,
            pump_flow_ml_s: flow,
            volume_ml: volume,
        }
    }

    fn run(profile: Profile, target: ProcessTarget, delay_ms: u64) -> BrewRun {
        BrewRun::new(
            profile,
            target,
            Duration::from_millis(delay_ms),
            Duration::from_millis(BREW_SAFETY_DURATION_MS),
            at(0),
        )
    }

    fn phase(duration: f32, pump: PumpSpec, transition: Transition, targets: Vec<Target>) -> Phase {
        Phase {
            name: String::from("test"),
            kind: PhaseKind::Brew,
            valve: 1,
            duration,
            pump,
            temperature: 0.0,
            transition,
            targets,
        }
    }

    #[test]
    fn test_time_phase_finishes_on_the_tick_it_elapses() {
        let mut brew = run(Profile::single_phase("Shot", 93.0, 2.35), ProcessTarget::Time, 0);
        // ceil(2350 / 100) = 24
        let mut finished_tick = None;
        for k in 1..=40u64 {
            if brew.progress(at(k * TICK_MS), &sample(9.0, 2.0, 0.0)) == BrewState::Finished {
                finished_tick = Some(k);
                break;
            }
        }
        assert_eq!(finished_tick, Some(24));
    }

    #[test]
    fn test_five_second_phase_releases_relay() {
        let mut brew = run(Profile::single_phase("Shot", 93.0, 5.0), ProcessTarget::Time, 0);
        for k in 1..50u64 {
            brew.progress(at(k * TICK_MS), &sample(9.0, 2.0, 0.0));
            assert!(brew.is_relay_active());
            assert_abs_diff_eq!(brew.pump_value(), 100.0);
        }
        brew.progress(at(5_000), &sample(9.0, 2.0, 0.0));
        assert_eq!(brew.get_state(), BrewState::Finished);
        assert!(!brew.is_relay_active());
        assert_eq!(brew.pump_value(), 0.0);
        assert_eq!(brew.pump_demand(at(5_000)), PumpDemand::Off);
        assert!(brew.is_complete(at(5_000)));
    }

    #[test]
    fn test_volumetric_target_without_delay() {
        let mut profile = Profile::single_phase("Shot", 93.0, 60.0);
        profile.phases[0].targets.push(Target {
            kind: TargetKind::Volumetric,
            operator: Comparison::Gte,
            value: 36.0,
        });
        let mut brew = run(profile, ProcessTarget::Volumetric, 0);
        let mut volume = 0.0;
        let mut k = 0;
        while brew.is_active() {
            k += 1;
            volume += 0.7;
            brew.progress(at(k * TICK_MS), &sample(9.0, 2.0, volume));
            if volume < 36.0 {
                assert!(brew.is_active(), "finished early at {volume}");
            }
        }
        // first sample at or above 36 ml
        assert!(volume >= 36.0 && volume - 0.7 < 36.0);
        // the tail is still settling
        assert!(!brew.is_complete(at(k * TICK_MS + 1_000)));
        assert!(brew.is_complete(at(k * TICK_MS + PREDICTIVE_WINDOW_MS + 1)));
    }

    #[test]
    fn test_delay_stops_volumetric_run_early() {
        let mut profile = Profile::single_phase("Shot", 93.0, 60.0);
        profile.phases[0].targets.push(Target {
            kind: TargetKind::Volumetric,
            operator: Comparison::Gte,
            value: 36.0,
        });
        // 2 ml/s with a 1 s delay -> stop around 34 ml
        let mut brew = run(profile, ProcessTarget::Volumetric, 1_000);
        let mut volume = 0.0;
        let mut k = 0;
        while brew.is_active() && k < 1_000 {
            k += 1;
            volume += 0.2;
            brew.progress(at(k * TICK_MS), &sample(9.0, 2.0, volume));
        }
        assert!(volume < 35.0 && volume > 33.0, "stopped at {volume}");
    }

    #[test]
    fn test_time_run_ignores_volumetric_target() {
        let mut profile = Profile::single_phase("Shot", 93.0, 3.0);
        profile.phases[0].targets.push(Target {
            kind: TargetKind::Volumetric,
            operator: Comparison::Gte,
            value: 1.0,
        });
        let mut brew = run(profile, ProcessTarget::Time, 0);
        brew.progress(at(1_000), &sample(9.0, 2.0, 20.0));
        assert!(brew.is_active());
    }

    #[test]
    fn test_pumped_target_advances_and_resets_counter() {
        let profile = Profile {
            id: String::new(),
            label: String::from("Two step"),
            temperature: 93.0,
            phases: vec![
                phase(
                    30.0,
                    PumpSpec::Simple(80.0),
                    Transition::default(),
                    vec![Target {
                        kind: TargetKind::Pumped,
                        operator: Comparison::Gte,
                        value: 10.0,
                    }],
                ),
                phase(30.0, PumpSpec::Simple(50.0), Transition::default(), Vec::new()),
            ],
        };
        let mut brew = run(profile, ProcessTarget::Time, 0);
        // 5 ml/s -> 10 ml after 2 s
        for k in 1..=20u64 {
            brew.progress(at(k * TICK_MS), &sample(2.0, 5.0, 0.0));
        }
        assert_eq!(brew.phase_index(), 1);
        assert_eq!(brew.pumped(), 0.0);
        assert_abs_diff_eq!(brew.pump_value(), 50.0);
        brew.progress(at(2_100), &sample(2.0, 5.0, 0.0));
        assert_abs_diff_eq!(brew.pumped(), 0.5, epsilon = 1e-4);
    }

    #[test]
    fn test_transition_eases_from_previous_target() {
        let advanced = |target, pressure, flow| {
            PumpSpec::Advanced(AdvancedPump {
                target,
                pressure,
                flow,
            })
        };
        let profile = Profile {
            id: String::new(),
            label: String::from("Ramp"),
            temperature: 93.0,
            phases: vec![
                phase(1.0, advanced(PumpTargetKind::Pressure, 3.0, 0.0), Transition::default(), Vec::new()),
                phase(
                    10.0,
                    advanced(PumpTargetKind::Pressure, 9.0, 4.0),
                    Transition {
                        easing: Easing::Linear,
                        duration: 4.0,
                        adaptive: false,
                    },
                    Vec::new(),
                ),
            ],
        };
        let mut brew = run(profile, ProcessTarget::Time, 0);
        assert_eq!(
            brew.pump_demand(at(0)),
            PumpDemand::Pressure {
                pressure: 3.0,
                flow_limit: 0.0
            }
        );
        brew.progress(at(1_000), &sample(2.5, 3.0, 0.0));
        assert_eq!(brew.phase_index(), 1);
        // halfway through the 4 s ramp from 3 bar to 9 bar
        match brew.pump_demand(at(3_000)) {
            PumpDemand::Pressure { pressure, flow_limit } => {
                assert_abs_diff_eq!(pressure, 6.0, epsilon = 1e-4);
                // the limit channel is pinned to its target
                assert_abs_diff_eq!(flow_limit, 4.0, epsilon = 1e-4);
            }
            other => panic!("unexpected demand {other:?}"),
        }
        assert_eq!(brew.pump_value(), 100.0);
    }

    #[test]
    fn test_adaptive_phase_holds_measured_value() {
        let profile = Profile {
            id: String::new(),
            label: String::from("Hold"),
            temperature: 93.0,
            phases: vec![
                phase(1.0, PumpSpec::Simple(100.0), Transition::default(), Vec::new()),
                phase(
                    10.0,
                    PumpSpec::Advanced(AdvancedPump {
                        target: PumpTargetKind::Pressure,
                        pressure: -1.0,
                        flow: 5.0,
                    }),
                    Transition {
                        easing: Easing::Instant,
                        duration: 0.0,
                        adaptive: true,
                    },
                    Vec::new(),
                ),
            ],
        };
        let mut brew = run(profile, ProcessTarget::Time, 0);
        brew.progress(at(1_000), &sample(7.2, 3.0, 0.0));
        assert_eq!(
            brew.pump_demand(at(1_100)),
            PumpDemand::Pressure {
                pressure: 7.2,
                flow_limit: 5.0
            }
        );
    }

    #[test]
    fn test_stop_and_safety_duration() {
        let mut brew = run(Profile::single_phase("Shot", 93.0, 30.0), ProcessTarget::Time, 0);
        brew.stop(at(500));
        assert_eq!(brew.get_state(), BrewState::Finished);

        let mut brew = BrewRun::new(
            Profile::single_phase("Shot", 93.0, 300.0),
            ProcessTarget::Time,
            Duration::from_millis(0),
            Duration::from_millis(2_000),
            at(0),
        );
        brew.progress(at(2_000), &sample(9.0, 2.0, 0.0));
        assert!(brew.is_active());
        brew.progress(at(2_100), &sample(9.0, 2.0, 0.0));
        assert!(!brew.is_active());
    }

    #[test]
    fn test_new_delay_learns_from_overshoot() {
        let mut profile = Profile::single_phase("Shot", 93.0, 60.0);
        profile.phases[0].targets.push(Target {
            kind: TargetKind::Volumetric,
            operator: Comparison::Gte,
            value: 10.0,
        });
        let mut brew = run(profile, ProcessTarget::Volumetric, 0);
        let mut k = 0;
        while brew.is_active() {
            k += 1;
            brew.progress(at(k * TICK_MS), &sample(9.0, 2.0, k as f32 * 0.1));
        }
        // 1 ml/s keeps dripping for another second after the stop
        for _ in 0..10 {
            k += 1;
            brew.progress(at(k * TICK_MS), &sample(0.0, 0.0, k as f32 * 0.1));
        }
        let delay = brew.new_delay();
        assert!(delay.as_millis() >= 900 && delay.as_millis() <= 1_100, "{delay:?}");
        assert_abs_diff_eq!(brew.temperature(), 93.0);
    }

    #[test]
    fn test_delay_uses_shot_rate_not_drip_tail() {
        let mut profile = Profile::single_phase("Shot", 93.0, 60.0);
        profile.phases[0].targets.push(Target {
            kind: TargetKind::Volumetric,
            operator: Comparison::Gte,
            value: 36.0,
        });
        let mut brew = run(profile, ProcessTarget::Volumetric, 0);
        let mut volume = 0.0;
        let mut k = 0;
        while brew.is_active() && k < 1_000 {
            k += 1;
            volume += 0.2;
            brew.progress(at(k * TICK_MS), &sample(9.0, 2.0, volume));
        }
        let stopped_at = volume;

        // 1 ml drips in over half a second, then the cup sits still
        for _ in 0..5 {
            k += 1;
            volume += 0.2;
            brew.progress(at(k * TICK_MS), &sample(0.0, 0.0, volume));
        }
        for _ in 0..35 {
            k += 1;
            brew.progress(at(k * TICK_MS), &sample(0.0, 0.0, volume));
        }
        assert!(brew.is_complete(at(k * TICK_MS + 1)));
        assert_abs_diff_eq!(brew.volume(), stopped_at + 1.0, epsilon = 1e-3);

        // 1 ml over at 2 ml/s
        let delay = brew.new_delay().as_millis() as f32;
        assert_abs_diff_eq!(delay, 500.0, epsilon = 50.0);
    }

    #[test]
    fn test_finished_run_keeps_tracking_volume() {
        let mut brew = run(Profile::single_phase("Shot", 93.0, 30.0), ProcessTarget::Volumetric, 0);
        brew.progress(at(100), &sample(9.0, 2.0, 0.2));
        brew.stop(at(150));
        brew.progress(at(200), &sample(0.0, 0.0, 0.5));
        brew.progress(at(300), &sample(0.0, f32::NAN, f32::NAN));
        assert_eq!(brew.get_state(), BrewState::Finished);
        assert_abs_diff_eq!(brew.volume(), 0.5);
        // pump flow after the stop is not counted
        assert_abs_diff_eq!(brew.pumped(), 0.2, epsilon = 1e-4);
    }
}
