//! Values shared between the sensor, control and actuator tasks.
//!
//! Every field has exactly one writer. Each is a single word, so reads never
//! tear and no lock is needed.

use crate::types::{ActuatorCommands, ControlSample};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

/// `f32` stored as its bit pattern.
#[derive(Debug, Default)]
pub struct AtomicF32(AtomicU32);

impl AtomicF32 {
    pub fn new(value: f32) -> Self {
        Self(AtomicU32::new(value.to_bits()))
    }

    pub fn load(&self) -> f32 {
        f32::from_bits(self.0.load(Ordering::Relaxed))
    }

    pub fn store(&self, value: f32) {
        self.0.store(value.to_bits(), Ordering::Relaxed);
    }
}

/// Latest sensor readings, written by the acquisition tasks.
#[derive(Debug, Default)]
pub struct SharedSensors {
    temperature_c: AtomicF32,
    pressure_bar: AtomicF32,
    pump_flow_ml_s: AtomicF32,
    volume_ml: AtomicF32,
}

impl SharedSensors {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_temperature(&self, value: f32) {
        self.temperature_c.store(value);
    }

    pub fn set_pressure(&self, value: f32) {
        self.pressure_bar.store(value);
    }

    pub fn set_pump_flow(&self, value: f32) {
        self.pump_flow_ml_s.store(value);
    }

    pub fn set_volume(&self, value: f32) {
        self.volume_ml.store(value);
    }

    pub fn snapshot(&self) -> ControlSample {
        ControlSample {
            temperature_c: self.temperature_c.load(),
            pressure_bar: self.pressure_bar.load(),
            pump_flow_ml_s: self.pump_flow_ml_s.load(),
            volume_ml: self.volume_ml.load(),
        }
    }
}

/// Commands from the control loop, read by the actuator task.
#[derive(Debug, Default)]
pub struct SharedOutputs {
    heater_duty: AtomicF32,
    pump_duty: AtomicF32,
    valve_open: AtomicBool,
    alt_relay: AtomicBool,
}

impl SharedOutputs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&self, commands: &ActuatorCommands) {
        self.heater_duty.store(commands.heater_duty);
        self.pump_duty.store(commands.pump_duty);
        self.valve_open.store(commands.valve_open, Ordering::Relaxed);
        self.alt_relay.store(commands.alt_relay, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ActuatorCommands {
        ActuatorCommands {
            heater_duty: self.heater_duty.load(),
            pump_duty: self.pump_duty.load(),
            valve_open: self.valve_open.load(Ordering::Relaxed),
            alt_relay: self.alt_relay.load(Ordering::Relaxed),
        }
    }
}
