//! The machine controller: one `tick` turns a sensor sample into actuator commands.
//!
//! It owns the heater loop, the pump controller with its resistance estimator,
//! the safety supervisor and the active process. Remote commands and telemetry
//! go through `handle_command` and the registered handlers; transport belongs to
//! the caller.

use crate::brewing::{Process, Profile};
use crate::control::{PressureFlowController, PumpDemand};
use crate::estimation::{HydraulicEstimator, ResistanceEstimator, RlsResistanceEstimator};
use crate::heater::HeaterLoop;
use crate::safety::SafetyController;
use crate::system::config::{ControllerConfig, EstimatorKind};
use crate::system::events::{AutotuneHandler, FaultHandler, RemoteCommand, Telemetry, TelemetryHandler};
use crate::types::{is_valid_reading, ActuatorCommands, ControlSample, MachineMode, ProcessTarget};
use embassy_time::{Duration, Instant};
use log::{debug, error, info, warn};

pub type BoxedEstimator = Box<dyn ResistanceEstimator + Send>;

fn build_estimator(config: &ControllerConfig) -> BoxedEstimator {
    match config.estimator_kind {
        EstimatorKind::Ekf => Box::new(HydraulicEstimator::new(config.estimator)),
        EstimatorKind::Rls => Box::new(RlsResistanceEstimator::new(config.rls)),
    }
}

pub struct MachineController {
    config: ControllerConfig,
    heater: HeaterLoop,
    pump: PressureFlowController<BoxedEstimator>,
    safety: SafetyController,
    process: Option<Process>,
    profile: Profile,
    brew_delay: Duration,
    grind_delay: Duration,
    target_temperature: f32,
    manual_pump: PumpDemand,
    manual_valve: bool,
    last_tick: Option<Instant>,
    last_sample: ControlSample,
    commands: ActuatorCommands,
    telemetry_handlers: Vec<TelemetryHandler>,
}

impl MachineController {
    pub fn new(config: ControllerConfig, profile: Profile) -> Self {
        info!(
            "Machine controller: {:?} estimator, {}ms tick, profile '{}'",
            config.estimator_kind, config.control_period_ms, profile.label
        );
        Self {
            heater: HeaterLoop::new(config.heater),
            pump: PressureFlowController::new(config.pressure, build_estimator(&config)),
            safety: SafetyController::new(config.safety),
            process: None,
            profile,
            brew_delay: Duration::from_millis(config.brew_delay_ms),
            grind_delay: Duration::from_millis(config.grind_delay_ms),
            target_temperature: 0.0,
            manual_pump: PumpDemand::Off,
            manual_valve: false,
            last_tick: None,
            last_sample: ControlSample::default(),
            commands: ActuatorCommands::OFF,
            telemetry_handlers: Vec::new(),
            config,
        }
    }

    pub fn on_telemetry(&mut self, handler: TelemetryHandler) {
        self.telemetry_handlers.push(handler);
    }

    pub fn on_autotune_result(&mut self, handler: AutotuneHandler) {
        self.heater.on_autotune_result(handler);
    }

    pub fn on_heater_fault(&mut self, handler: FaultHandler) {
        self.heater.on_fault(handler);
    }

    /// One control period.
    pub fn tick(&mut self, now: Instant, sample: &ControlSample) -> ActuatorCommands {
        let dt = match self.last_tick {
            Some(last) => now.saturating_duration_since(last).as_millis() as f32 / 1000.0,
            None => self.config.control_period_ms as f32 / 1000.0,
        };
        self.last_tick = Some(now);
        self.last_sample = *sample;

        if self.safety.should_emergency_stop(now, sample) {
            self.shut_down();
            return self.commands;
        }

        let observed = self.observed(sample);
        if let Some(process) = self.process.as_mut() {
            process.progress(now, &observed);
        }

        let setpoint = self
            .process
            .as_ref()
            .and_then(|p| p.temperature())
            .unwrap_or(self.target_temperature);
        self.heater.set_setpoint(setpoint);
        let heater_duty = self.heater.update(sample.temperature_c, dt);

        let (demand, valve_open, alt_relay) = match self.process.as_ref() {
            Some(process) => (
                process.pump_demand(now),
                process.is_relay_active(),
                process.is_alt_relay_active(now),
            ),
            None => (self.manual_pump, self.manual_valve, false),
        };
        let measured_inflow = (is_valid_reading(sample.pump_flow_ml_s) && sample.pump_flow_ml_s > 0.0)
            .then_some(sample.pump_flow_ml_s);
        let pump_duty = self
            .pump
            .update(demand, sample.pressure_bar, measured_inflow, valve_open, dt);

        self.finish_completed(now);

        self.commands = self.safety.filter(ActuatorCommands {
            heater_duty,
            pump_duty,
            valve_open,
            alt_relay,
        });
        debug!("Tick: {:?}", self.commands);
        self.commands
    }

    /// Fill in what the sensors did not measure from the pump controller's estimates.
    fn observed(&self, sample: &ControlSample) -> ControlSample {
        let mut observed = *sample;
        if !(is_valid_reading(observed.pump_flow_ml_s) && observed.pump_flow_ml_s > 0.0) {
            observed.pump_flow_ml_s = self.pump.pump_flow();
        }
        if !(is_valid_reading(observed.volume_ml) && observed.volume_ml > 0.0) {
            observed.volume_ml = self.pump.coffee_output();
        }
        observed
    }

    fn finish_completed(&mut self, now: Instant) {
        let complete = match self.process.as_ref() {
            Some(process) => !process.is_active(now) && process.is_complete(now),
            None => false,
        };
        if !complete {
            return;
        }
        if let Some(process) = self.process.take() {
            self.learn_delay(&process);
            info!("{:?} complete", process.mode());
        }
    }

    fn learn_delay(&mut self, process: &Process) {
        let Some(delay) = process.new_delay() else {
            return;
        };
        match process.mode() {
            MachineMode::Brew => self.brew_delay = delay,
            MachineMode::Grind => self.grind_delay = delay,
            _ => {}
        }
    }

    fn shut_down(&mut self) {
        if let Some(process) = self.process.take() {
            error!("Aborting {:?} on safety fault", process.mode());
        }
        if self.heater.is_autotuning() {
            self.heater.stop_autotune();
        }
        self.manual_pump = PumpDemand::Off;
        self.manual_valve = false;
        self.commands = ActuatorCommands::OFF;
    }

    /// Start a process. Refused while the safety supervisor is tripped.
    pub fn activate(&mut self, mode: MachineMode, target: ProcessTarget, now: Instant) -> bool {
        if self.safety.is_tripped() {
            warn!("Refusing {:?}: safety fault {:?}", mode, self.safety.fault());
            return false;
        }
        let timing = self.config.process;
        let process = match mode {
            MachineMode::Standby => {
                self.deactivate();
                return true;
            }
            MachineMode::Brew => Process::brew(self.profile.clone(), target, self.brew_delay, &timing, now),
            MachineMode::Grind => Process::grind(target, self.grind_delay, &timing, now),
            MachineMode::Steam => Process::steam(&timing, now),
            MachineMode::Water => Process::water(&timing, now),
        };
        if let Some(previous) = self.process.replace(process) {
            info!("{:?} replaced by {:?}", previous.mode(), mode);
        }
        true
    }

    /// Stop the current process. Only runs that reached their own end teach the delay.
    pub fn deactivate(&mut self) {
        let Some(process) = self.process.take() else {
            return;
        };
        let now = self.last_tick.unwrap_or(Instant::from_millis(0));
        if !process.is_active(now) {
            self.learn_delay(&process);
        }
        info!("{:?} deactivated", process.mode());
    }

    pub fn tare(&mut self) {
        info!("Tare");
        self.pump.tare();
    }

    pub fn load_profile(&mut self, profile: Profile) -> bool {
        if let Err(e) = profile.validate() {
            warn!("Rejected profile '{}': {}", profile.label, e);
            return false;
        }
        info!("Profile '{}' loaded ({} phases)", profile.label, profile.phases.len());
        self.profile = profile;
        true
    }

    pub fn handle_command(&mut self, command: RemoteCommand, now: Instant) {
        debug!("Remote command: {:?}", command);
        self.safety.note_ping(now);

        match command {
            RemoteCommand::SetTemperature { temperature } => {
                if temperature.is_finite() && temperature >= 0.0 {
                    self.target_temperature = temperature;
                } else {
                    warn!("Ignoring temperature {}", temperature);
                }
            }
            RemoteCommand::SetPump { demand } => self.manual_pump = demand,
            RemoteCommand::SetValve { open } => self.manual_valve = open,
            RemoteCommand::SetGains { .. } => {
                if let Some(gains) = command.gains() {
                    info!("Heater gains: {:?}", gains);
                    self.heater.set_gains(gains);
                }
            }
            RemoteCommand::StartAutotune { goal, window_size } => {
                if self.safety.is_tripped() {
                    warn!("Refusing autotune: safety fault {:?}", self.safety.fault());
                } else {
                    self.heater.start_autotune(goal, window_size);
                }
            }
            RemoteCommand::StopAutotune => self.heater.stop_autotune(),
            RemoteCommand::LoadProfile { profile } => {
                self.load_profile(profile);
            }
            RemoteCommand::Activate { mode, target } => {
                self.activate(mode, target, now);
            }
            RemoteCommand::Deactivate => self.deactivate(),
            RemoteCommand::Tare => self.tare(),
            RemoteCommand::Ping => {}
            RemoteCommand::ClearFault => self.safety.clear(now),
        }
    }

    pub fn telemetry(&self, now: Instant) -> Telemetry {
        Telemetry {
            timestamp_ms: now.as_millis(),
            mode: self.mode(),
            temperature: self.heater.temperature(),
            target_temperature: self.heater.setpoint(),
            heater_duty: self.commands.heater_duty,
            heater_status: self.heater.status(),
            pressure: self.pump.filtered_pressure(),
            pump_duty: self.commands.pump_duty,
            pump_flow: self.pump.pump_flow(),
            pumped_volume: self.pump.pumped_volume(),
            coffee_flow: self.pump.coffee_flow(),
            coffee_output: self.pump.coffee_output(),
            resistance: self.pump.resistance(),
            convergence_score: self.pump.convergence_score(),
            valve_open: self.commands.valve_open,
            process_active: self.process.as_ref().map(|p| p.is_active(now)).unwrap_or(false),
            phase: match self.process.as_ref() {
                Some(Process::Brew(run)) => Some(run.phase_index()),
                _ => None,
            },
            fault: self.safety.fault(),
        }
    }

    pub fn publish_telemetry(&mut self, now: Instant) {
        if self.telemetry_handlers.is_empty() {
            return;
        }
        let telemetry = self.telemetry(now);
        for handler in self.telemetry_handlers.iter_mut() {
            handler(&telemetry);
        }
    }

    pub fn mode(&self) -> MachineMode {
        self.process.as_ref().map(|p| p.mode()).unwrap_or(MachineMode::Standby)
    }

    pub fn process(&self) -> Option<&Process> {
        self.process.as_ref()
    }

    pub fn profile(&self) -> &Profile {
        &self.profile
    }

    pub fn brew_delay(&self) -> Duration {
        self.brew_delay
    }

    pub fn grind_delay(&self) -> Duration {
        self.grind_delay
    }

    pub fn commands(&self) -> ActuatorCommands {
        self.commands
    }

    pub fn last_sample(&self) -> ControlSample {
        self.last_sample
    }

    pub fn heater(&self) -> &HeaterLoop {
        &self.heater
    }

    pub fn pump(&self) -> &PressureFlowController<BoxedEstimator> {
        &self.pump
    }

    pub fn safety(&self) -> &SafetyController {
        &self.safety
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::brewing::{Comparison, Target, TargetKind};
    use crate::safety::SafetyFault;
    use std::sync::{Arc, Mutex};

    const TICK_MS: u64 = 100;

    fn at(ms: u64) -> Instant {
        Instant::from_millis(ms)
    }

    fn sample(temperature: f32, volume: f32) -> ControlSample {
        ControlSample {
            temperature_c: temperature,
            pressure_bar: 0.0,
            pump_flow_ml_s: 0.0,
            volume_ml: volume,
        }
    }

    fn controller() -> MachineController {
        MachineController::new(
            ControllerConfig::default(),
            Profile::single_phase("flat", 93.0, 2.0),
        )
    }

    #[test]
    fn test_idle_machine_is_off() {
        let mut machine = controller();
        for k in 0..10 {
            let commands = machine.tick(at(k * TICK_MS), &sample(25.0, 0.0));
            assert_eq!(commands, ActuatorCommands::OFF);
        }
        assert_eq!(machine.mode(), MachineMode::Standby);
    }

    #[test]
    fn test_set_temperature_heats() {
        let mut machine = controller();
        machine.handle_command(RemoteCommand::SetTemperature { temperature: 93.0 }, at(0));
        let mut commands = ActuatorCommands::OFF;
        for k in 0..30 {
            commands = machine.tick(at(k * TICK_MS), &sample(25.0, 0.0));
        }
        assert!(commands.heater_duty > 0.0);
        assert_eq!(machine.heater().setpoint(), 93.0);
        assert_eq!(commands.pump_duty, 0.0);
    }

    #[test]
    fn test_timed_brew_runs_and_completes() {
        let mut machine = controller();
        assert!(machine.activate(MachineMode::Brew, ProcessTarget::Time, at(0)));
        assert_eq!(machine.mode(), MachineMode::Brew);

        let commands = machine.tick(at(TICK_MS), &sample(90.0, 0.0));
        assert!(commands.valve_open);
        assert_eq!(commands.pump_duty, 100.0);
        assert_eq!(machine.heater().setpoint(), 93.0);

        let mut k = 1;
        while machine.process().is_some() && k < 100 {
            k += 1;
            machine.tick(at(k * TICK_MS), &sample(90.0, 0.0));
        }
        assert_eq!(k, 20);
        assert_eq!(machine.mode(), MachineMode::Standby);
        let commands = machine.tick(at(21 * TICK_MS), &sample(90.0, 0.0));
        assert!(!commands.valve_open);
        assert_eq!(commands.pump_duty, 0.0);
    }

    #[test]
    fn test_volumetric_brew_learns_delay() {
        let mut profile = Profile::single_phase("cup", 93.0, 60.0);
        profile.phases[0].targets.push(Target {
            kind: TargetKind::Volumetric,
            operator: Comparison::Gte,
            value: 36.0,
        });
        let mut machine = MachineController::new(ControllerConfig::default(), profile);
        machine.activate(MachineMode::Brew, ProcessTarget::Volumetric, at(0));

        // 1.5 ml/s into the cup while the valve is open, dripping for 1.5 s after it closes
        let mut volume = 0.0;
        let mut drip = 15;
        let mut stopped_at = None;
        let mut k = 0;
        while machine.process().is_some() && k < 1_000 {
            k += 1;
            let commands = machine.tick(at(k * TICK_MS), &sample(93.0, volume));
            if commands.valve_open {
                volume += 0.15;
            } else if drip > 0 {
                stopped_at.get_or_insert(volume);
                drip -= 1;
                volume += 0.15;
            }
        }
        let stopped_at = stopped_at.unwrap();
        assert!(stopped_at > 34.4 && stopped_at < 35.0, "stopped at {stopped_at}");
        assert_eq!(machine.mode(), MachineMode::Standby);
        // about 1 ml over at 1.5 ml/s on top of the 1 s default
        assert!(machine.brew_delay() > Duration::from_millis(1_300));
        assert!(machine.brew_delay() < Duration::from_millis(2_000));
    }

    #[test]
    fn test_over_temperature_trips_until_cleared() {
        let mut machine = controller();
        machine.handle_command(RemoteCommand::SetTemperature { temperature: 93.0 }, at(0));
        machine.activate(MachineMode::Water, ProcessTarget::Time, at(0));
        assert_eq!(machine.tick(at(TICK_MS), &sample(90.0, 0.0)).pump_duty, 100.0);

        let commands = machine.tick(at(2 * TICK_MS), &sample(175.0, 0.0));
        assert_eq!(commands, ActuatorCommands::OFF);
        assert!(machine.process().is_none());
        assert!(matches!(
            machine.safety().fault(),
            Some(SafetyFault::OverTemperature { .. })
        ));
        assert!(!machine.activate(MachineMode::Brew, ProcessTarget::Time, at(300)));
        assert_eq!(machine.tick(at(4 * TICK_MS), &sample(90.0, 0.0)), ActuatorCommands::OFF);

        machine.handle_command(RemoteCommand::ClearFault, at(500));
        assert!(machine.activate(MachineMode::Water, ProcessTarget::Time, at(500)));
        assert_eq!(machine.tick(at(6 * TICK_MS), &sample(90.0, 0.0)).pump_duty, 100.0);
    }

    #[test]
    fn test_manual_pump_and_valve() {
        let mut machine = controller();
        machine.handle_command(RemoteCommand::SetValve { open: true }, at(0));
        machine.handle_command(
            RemoteCommand::SetPump {
                demand: PumpDemand::Power { duty: 40.0 },
            },
            at(0),
        );
        let commands = machine.tick(at(TICK_MS), &sample(90.0, 0.0));
        assert!(commands.valve_open);
        assert_eq!(commands.pump_duty, 40.0);

        // an active process takes over the outputs
        machine.activate(MachineMode::Grind, ProcessTarget::Time, at(TICK_MS));
        let commands = machine.tick(at(2 * TICK_MS), &sample(90.0, 0.0));
        assert!(commands.alt_relay);
        assert!(!commands.valve_open);
        assert_eq!(commands.pump_duty, 0.0);
    }

    #[test]
    fn test_rejects_invalid_profile() {
        let mut machine = controller();
        let mut profile = Profile::single_phase("bad", 93.0, 5.0);
        profile.phases.clear();
        machine.handle_command(RemoteCommand::LoadProfile { profile }, at(0));
        assert_eq!(machine.profile().label, "flat");
        assert!(machine.load_profile(Profile::single_phase("good", 94.0, 5.0)));
        assert_eq!(machine.profile().label, "good");
    }

    #[test]
    fn test_telemetry_handlers() {
        let mut machine = controller();
        let frames: Arc<Mutex<Vec<Telemetry>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = frames.clone();
        machine.on_telemetry(Box::new(move |t: &Telemetry| sink.lock().unwrap().push(t.clone())));

        machine.activate(MachineMode::Brew, ProcessTarget::Time, at(0));
        machine.tick(at(TICK_MS), &sample(92.0, 0.0));
        machine.publish_telemetry(at(TICK_MS));

        let frames = frames.lock().unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].mode, MachineMode::Brew);
        assert_eq!(frames[0].phase, Some(0));
        assert!(frames[0].process_active);
        assert!(frames[0].valve_open);
        assert_eq!(frames[0].fault, None);
    }

    #[test]
    fn test_rls_estimator_selectable() {
        let config = ControllerConfig {
            estimator_kind: EstimatorKind::Rls,
            ..ControllerConfig::default()
        };
        let mut machine = MachineController::new(config, Profile::single_phase("flat", 93.0, 2.0));
        machine.tick(at(0), &sample(90.0, 0.0));
        assert_eq!(machine.pump().convergence_score(), 0.0);
    }
}
