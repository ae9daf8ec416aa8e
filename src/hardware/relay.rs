use super::ActuatorError;
use embedded_hal::digital::v2::OutputPin;
use log::{error, info};
use std::fmt::Debug;

/// On/off output (brew valve, grinder) on any `embedded-hal` pin, active high.
pub struct RelayController<P> {
    pin: P,
    name: &'static str,
    is_on: bool,
}

impl<P> RelayController<P>
where
    P: OutputPin,
    P::Error: Debug,
{
    pub fn new(mut pin: P, name: &'static str) -> Result<Self, ActuatorError> {
        // Relays always start released
        pin.set_low()
            .map_err(|e| ActuatorError::Gpio(format!("{}: failed to set initial low state: {:?}", name, e)))?;
        info!("Relay '{}' initialized (active high)", name);
        Ok(Self {
            pin,
            name,
            is_on: false,
        })
    }

    pub fn set(&mut self, on: bool) -> Result<(), ActuatorError> {
        if on == self.is_on {
            return Ok(());
        }
        if on {
            self.pin
                .set_high()
                .map_err(|e| ActuatorError::Gpio(format!("{}: failed to set high: {:?}", self.name, e)))?;
        } else {
            self.pin
                .set_low()
                .map_err(|e| ActuatorError::Gpio(format!("{}: failed to set low: {:?}", self.name, e)))?;
        }
        self.is_on = on;
        info!("Relay '{}' turned {}", self.name, if on { "ON" } else { "OFF" });
        Ok(())
    }

    /// Drive the pin low regardless of the tracked state.
    pub fn turn_off_immediately(&mut self) -> Result<(), ActuatorError> {
        match self.pin.set_low() {
            Ok(()) => {
                self.is_on = false;
                Ok(())
            }
            Err(e) => {
                error!("CRITICAL: failed to release relay '{}': {:?}", self.name, e);
                Err(ActuatorError::Gpio(format!("{}: emergency release failed: {:?}", self.name, e)))
            }
        }
    }

    pub fn is_on(&self) -> bool {
        self.is_on
    }

    pub fn release(self) -> P {
        self.pin
    }
}
