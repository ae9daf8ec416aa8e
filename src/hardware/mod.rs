//! Board outputs. Everything here is generic over `embedded-hal` 0.2 pins so the
//! same code drives ESP-IDF peripherals on the chip and mock pins in tests.

pub mod pwm;
pub mod relay;

pub use pwm::PwmOutput;
pub use relay::RelayController;

use crate::types::ActuatorCommands;
use embedded_hal::digital::v2::OutputPin;
use embedded_hal::PwmPin;
use log::error;
use std::fmt::{self, Debug};

#[derive(Debug, Clone, PartialEq)]
pub enum ActuatorError {
    Gpio(String),
}

impl fmt::Display for ActuatorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActuatorError::Gpio(msg) => write!(f, "GPIO error: {}", msg),
        }
    }
}

impl std::error::Error for ActuatorError {}

/// The machine's four outputs.
pub struct Actuators<V, A, H, P> {
    pub valve: RelayController<V>,
    pub alt: RelayController<A>,
    pub heater: PwmOutput<H>,
    pub pump: PwmOutput<P>,
}

impl<V, A, H, P> Actuators<V, A, H, P>
where
    V: OutputPin,
    V::Error: Debug,
    A: OutputPin,
    A::Error: Debug,
    H: PwmPin<Duty = u32>,
    P: PwmPin<Duty = u32>,
{
    pub fn new(valve: V, alt: A, heater: H, pump: P) -> Result<Self, ActuatorError> {
        Ok(Self {
            valve: RelayController::new(valve, "valve")?,
            alt: RelayController::new(alt, "grinder")?,
            heater: PwmOutput::new(heater, "heater"),
            pump: PwmOutput::new(pump, "pump"),
        })
    }

    /// Apply one tick's commands. Duty cycles are written before the relays so a
    /// failing relay never leaves the pump running against a closed valve.
    pub fn apply(&mut self, commands: &ActuatorCommands) -> Result<(), ActuatorError> {
        let commands = commands.sanitized();
        self.heater.set_percent(commands.heater_duty);
        self.pump.set_percent(commands.pump_duty);
        if let Err(e) = self.valve.set(commands.valve_open) {
            self.pump.set_percent(0.0);
            return Err(e);
        }
        self.alt.set(commands.alt_relay)
    }

    /// Everything off, attempting every output even if one fails.
    pub fn emergency_stop(&mut self) -> Result<(), ActuatorError> {
        self.heater.set_percent(0.0);
        self.pump.set_percent(0.0);
        let valve = self.valve.turn_off_immediately();
        let alt = self.alt.turn_off_immediately();
        if let Err(e) = &valve {
            error!("EMERGENCY: {}", e);
        }
        valve.and(alt)
    }
}
