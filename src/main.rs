#[cfg(target_os = "espidf")]
#[embassy_executor::main]
async fn main(spawner: embassy_executor::Spawner) {
    // It is necessary to call this function once. Otherwise some patches to the runtime
    // implemented by esp-idf-sys might not link properly. See https://github.com/esp-rs/esp-idf-template/issues/71
    esp_idf_svc::sys::link_patches();

    // Bind the log crate to the ESP Logging facilities
    esp_idf_svc::log::EspLogger::initialize_default();

    log::info!("Starting espresso machine controller");

    if let Err(e) = firmware::run(spawner).await {
        log::error!("Controller stopped: {:?}", e);
    }
}

#[cfg(not(target_os = "espidf"))]
fn main() -> anyhow::Result<()> {
    simulator::run()
}

#[cfg(target_os = "espidf")]
mod firmware {
    use anyhow::anyhow;
    use embassy_executor::Spawner;
    use embassy_futures::select::{select, Either};
    use embassy_sync::{blocking_mutex::raw::CriticalSectionRawMutex, channel::Channel};
    use embassy_time::{Duration, Instant, Ticker};
    use embedded_hal::digital::v2::OutputPin;
    use embedded_hal::PwmPin;
    use esp_idf_svc::hal::gpio::{AnyOutputPin, Output, OutputPin as _, PinDriver};
    use esp_idf_svc::hal::ledc::{config::TimerConfig, LedcDriver, LedcTimerDriver};
    use esp_idf_svc::hal::prelude::*;
    use esp_idf_svc::sys::EspError;
    use log::{debug, error, info, warn};
    use std::sync::Arc;
    use tamper_rs::brewing::Profile;
    use tamper_rs::hardware::Actuators;
    use tamper_rs::state::{SharedOutputs, SharedSensors};
    use tamper_rs::system::{ControllerConfig, RemoteCommand, Telemetry};
    use tamper_rs::MachineController;

    /// Remote link inbox. The transport task sends parsed commands here.
    pub type RemoteChannel = Channel<CriticalSectionRawMutex, RemoteCommand, 8>;

    const TELEMETRY_EVERY: u32 = 5;

    struct Relay(PinDriver<'static, AnyOutputPin, Output>);

    impl OutputPin for Relay {
        type Error = EspError;

        fn set_low(&mut self) -> Result<(), EspError> {
            self.0.set_low()
        }

        fn set_high(&mut self) -> Result<(), EspError> {
            self.0.set_high()
        }
    }

    struct Ledc(LedcDriver<'static>);

    impl PwmPin for Ledc {
        type Duty = u32;

        fn disable(&mut self) {
            if let Err(e) = self.0.disable() {
                warn!("LEDC disable failed: {:?}", e);
            }
        }

        fn enable(&mut self) {
            if let Err(e) = self.0.enable() {
                warn!("LEDC enable failed: {:?}", e);
            }
        }

        fn get_duty(&self) -> u32 {
            self.0.get_duty()
        }

        fn get_max_duty(&self) -> u32 {
            self.0.get_max_duty()
        }

        fn set_duty(&mut self, duty: u32) {
            if let Err(e) = self.0.set_duty(duty) {
                error!("LEDC duty write failed: {:?}", e);
            }
        }
    }

    type BoardActuators = Actuators<Relay, Relay, Ledc, Ledc>;

    #[embassy_executor::task]
    async fn actuator_task(outputs: Arc<SharedOutputs>, actuators: BoardActuators, period: Duration) {
        info!("Actuator task started");
        let mut actuators = actuators;
        let mut ticker = Ticker::every(period);
        loop {
            if let Err(e) = actuators.apply(&outputs.snapshot()) {
                error!("Actuator write failed: {}", e);
                if let Err(e) = actuators.emergency_stop() {
                    error!("Emergency stop incomplete: {}", e);
                }
            }
            ticker.next().await;
        }
    }

    pub async fn run(spawner: Spawner) -> anyhow::Result<()> {
        let peripherals = Peripherals::take()?;
        let pins = peripherals.pins;
        let config = ControllerConfig::default();
        let period = Duration::from_millis(config.control_period_ms);

        let heater_timer = LedcTimerDriver::new(
            peripherals.ledc.timer0,
            &TimerConfig::default().frequency(50.Hz().into()),
        )?;
        let pump_timer = LedcTimerDriver::new(
            peripherals.ledc.timer1,
            &TimerConfig::default().frequency(1.kHz().into()),
        )?;
        let actuators = Actuators::new(
            Relay(PinDriver::output(pins.gpio4.downgrade_output())?),
            Relay(PinDriver::output(pins.gpio5.downgrade_output())?),
            Ledc(LedcDriver::new(peripherals.ledc.channel0, heater_timer, pins.gpio18)?),
            Ledc(LedcDriver::new(peripherals.ledc.channel1, pump_timer, pins.gpio19)?),
        )?;

        // Sensor drivers write `sensors`; the remote link feeds `remote`.
        let sensors = Arc::new(SharedSensors::new());
        let outputs = Arc::new(SharedOutputs::new());
        let remote: Arc<RemoteChannel> = Arc::new(Channel::new());

        spawner
            .spawn(actuator_task(outputs.clone(), actuators, period))
            .map_err(|e| anyhow!("Failed to spawn actuator task: {:?}", e))?;

        let mut controller = MachineController::new(config, Profile::single_phase("Default", 93.0, 30.0));
        controller.on_telemetry(Box::new(|telemetry: &Telemetry| match telemetry.to_json() {
            Ok(json) => debug!("{}", json),
            Err(e) => warn!("Telemetry encode failed: {}", e),
        }));
        controller.on_heater_fault(Box::new(|| error!("Heater sensor fault")));

        info!("Control loop running every {}ms", config.control_period_ms);
        let mut ticker = Ticker::every(period);
        let mut ticks: u32 = 0;
        loop {
            match select(remote.receive(), ticker.next()).await {
                Either::First(command) => controller.handle_command(command, Instant::now()),
                Either::Second(_) => {
                    let now = Instant::now();
                    let commands = controller.tick(now, &sensors.snapshot());
                    outputs.publish(&commands);
                    ticks = ticks.wrapping_add(1);
                    if ticks % TELEMETRY_EVERY == 0 {
                        controller.publish_telemetry(now);
                    }
                }
            }
        }
    }
}

/// Closed-loop shot on a simulated boiler and puck: `tamper-rs [config.json] [profile.json]`.
#[cfg(not(target_os = "espidf"))]
mod simulator {
    use anyhow::Context;
    use embassy_time::Instant;
    use log::{info, LevelFilter};
    use simplelog::{Config, SimpleLogger};
    use std::fs;
    use std::sync::Arc;
    use tamper_rs::brewing::Profile;
    use tamper_rs::state::{SharedOutputs, SharedSensors};
    use tamper_rs::system::{ControllerConfig, RemoteCommand, Telemetry};
    use tamper_rs::{MachineController, MachineMode, ProcessTarget};

    const DEFAULT_PROFILE: &str = r#"{
        "id": "classic",
        "label": "Classic 9 bar",
        "temperature": 93,
        "phases": [
            {
                "name": "Preinfusion",
                "phase": "preinfusion",
                "valve": 1,
                "duration": 8,
                "pump": { "target": "pressure", "pressure": 3, "flow": 4 },
                "targets": [ { "type": "pumped", "value": 40 } ]
            },
            {
                "name": "Brew",
                "phase": "brew",
                "valve": 1,
                "duration": 40,
                "pump": { "target": "pressure", "pressure": 9, "flow": 0 },
                "transition": { "type": "ease-in-out", "duration": 3, "adaptive": true },
                "targets": [ { "type": "volumetric", "value": 36 } ]
            }
        ]
    }"#;

    const MAX_SHOT_MS: u64 = 180_000;

    /// Boiler, pump and puck. Pressure follows the line compliance, the puck
    /// passes `k·√P`, and the cup lags the puck by a short drip.
    struct Machine {
        temperature: f32,
        pressure: f32,
        cup: f32,
        drip: f32,
        puck: f32,
        compliance: f32,
    }

    impl Machine {
        fn step(&mut self, config: &ControllerConfig, heater_duty: f32, pump_duty: f32, valve_open: bool, dt: f32) -> f32 {
            self.temperature += dt * (0.9 * heater_duty / 100.0 - 0.004 * (self.temperature - 20.0));

            let inflow = if pump_duty > 0.0 {
                config.pressure.pump.flow_at(self.pressure, pump_duty)
            } else {
                0.0
            };
            let outflow = if valve_open {
                self.puck * self.pressure.max(0.0).sqrt()
            } else {
                0.0
            };
            self.pressure = (self.pressure + dt * (inflow - outflow) / self.compliance).max(0.0);
            if !valve_open {
                // OPV and solenoid vent bleed the line
                self.pressure *= 0.8;
            }

            self.drip += outflow * dt;
            let poured = self.drip * (dt / 1.5).min(1.0);
            self.drip -= poured;
            self.cup += poured;
            inflow
        }
    }

    pub fn run() -> anyhow::Result<()> {
        SimpleLogger::init(LevelFilter::Info, Config::default())?;

        let mut args = std::env::args().skip(1);
        let config = match args.next() {
            Some(path) => {
                let json = fs::read_to_string(&path).with_context(|| format!("reading {}", path))?;
                ControllerConfig::from_json(&json)?
            }
            None => ControllerConfig::default(),
        };
        let profile = match args.next() {
            Some(path) => {
                let json = fs::read_to_string(&path).with_context(|| format!("reading {}", path))?;
                Profile::from_json(&json)?
            }
            None => Profile::from_json(DEFAULT_PROFILE)?,
        };

        let sensors = Arc::new(SharedSensors::new());
        let outputs = Arc::new(SharedOutputs::new());
        let mut machine = Machine {
            temperature: 88.0,
            pressure: 0.0,
            cup: 0.0,
            drip: 0.0,
            puck: 0.45,
            compliance: config.pressure.compliance,
        };

        let mut controller = MachineController::new(config, profile);
        controller.on_telemetry(Box::new(|t: &Telemetry| {
            info!(
                "t={:>6}ms T={:.1}/{:.1} P={:.2} pump={:.0}% Q={:.2} R={:.2} score={:.2} cup={:.1} phase={:?}",
                t.timestamp_ms,
                t.temperature,
                t.target_temperature,
                t.pressure,
                t.pump_duty,
                t.pump_flow,
                t.resistance,
                t.convergence_score,
                t.coffee_output,
                t.phase
            )
        }));

        let period = config.control_period_ms;
        let dt = period as f32 / 1000.0;
        let mut now_ms = 0;
        controller.handle_command(RemoteCommand::SetTemperature { temperature: 93.0 }, Instant::from_millis(now_ms));
        controller.activate(MachineMode::Brew, ProcessTarget::Volumetric, Instant::from_millis(now_ms));

        while controller.mode() != MachineMode::Standby && now_ms < MAX_SHOT_MS {
            now_ms += period;
            let now = Instant::from_millis(now_ms);

            let commands = outputs.snapshot();
            let inflow = machine.step(&config, commands.heater_duty, commands.pump_duty, commands.valve_open, dt);
            sensors.set_temperature(machine.temperature);
            sensors.set_pressure(machine.pressure);
            sensors.set_pump_flow(inflow);
            sensors.set_volume(machine.cup);

            let commands = controller.tick(now, &sensors.snapshot());
            outputs.publish(&commands);
            if now_ms % 1000 == 0 {
                controller.publish_telemetry(now);
            }
        }

        info!(
            "Shot done after {:.1}s: {:.1}ml in the cup, next brew delay {}ms",
            now_ms as f32 / 1000.0,
            machine.cup,
            controller.brew_delay().as_millis()
        );
        Ok(())
    }
}
