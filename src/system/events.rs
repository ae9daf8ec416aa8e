//! What the remote link delivers to the controller and what it gets back.
//! Transport and framing live outside the core; these are the semantic payloads.

use crate::brewing::Profile;
use crate::control::{AutotuneResult, PidGains, PumpDemand};
use crate::heater::HeaterStatus;
use crate::safety::SafetyFault;
use crate::types::{MachineMode, ProcessTarget};
use serde::{Deserialize, Serialize};

/// Commands from the remote link, tagged by `type` in JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum RemoteCommand {
    #[serde(rename = "set_temperature")]
    SetTemperature { temperature: f32 },
    #[serde(rename = "set_pump")]
    SetPump { demand: PumpDemand },
    #[serde(rename = "set_valve")]
    SetValve { open: bool },
    #[serde(rename = "set_gains")]
    SetGains {
        kp: f32,
        ki: f32,
        kd: f32,
        #[serde(default)]
        kff: f32,
    },
    #[serde(rename = "start_autotune")]
    StartAutotune {
        #[serde(default = "default_tuning_goal")]
        goal: f32,
        #[serde(default = "default_window_size")]
        window_size: usize,
    },
    #[serde(rename = "stop_autotune")]
    StopAutotune,
    #[serde(rename = "load_profile")]
    LoadProfile { profile: Profile },
    #[serde(rename = "activate")]
    Activate {
        mode: MachineMode,
        #[serde(default = "default_target")]
        target: ProcessTarget,
    },
    #[serde(rename = "deactivate")]
    Deactivate,
    #[serde(rename = "tare")]
    Tare,
    #[serde(rename = "ping")]
    Ping,
    #[serde(rename = "clear_fault")]
    ClearFault,
}

fn default_tuning_goal() -> f32 {
    50.0
}

fn default_window_size() -> usize {
    4
}

fn default_target() -> ProcessTarget {
    ProcessTarget::Time
}

impl RemoteCommand {
    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }

    pub fn gains(&self) -> Option<PidGains> {
        match *self {
            RemoteCommand::SetGains { kp, ki, kd, kff } => Some(PidGains { kp, ki, kd, kff }),
            _ => None,
        }
    }
}

/// Periodic state report for the remote link.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Telemetry {
    pub timestamp_ms: u64,
    pub mode: MachineMode,
    pub temperature: f32,
    pub target_temperature: f32,
    pub heater_duty: f32,
    pub heater_status: HeaterStatus,
    pub pressure: f32,
    pub pump_duty: f32,
    pub pump_flow: f32,
    pub pumped_volume: f32,
    pub coffee_flow: f32,
    pub coffee_output: f32,
    pub resistance: f32,
    pub convergence_score: f32,
    pub valve_open: bool,
    pub process_active: bool,
    pub phase: Option<usize>,
    pub fault: Option<SafetyFault>,
}

impl Telemetry {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

pub type TelemetryHandler = Box<dyn FnMut(&Telemetry) + Send>;
pub type AutotuneHandler = Box<dyn FnMut(&AutotuneResult) + Send>;
pub type FaultHandler = Box<dyn FnMut() + Send>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_commands() {
        let command = RemoteCommand::from_json(r#"{"type":"set_temperature","temperature":93.5}"#).unwrap();
        assert_eq!(command, RemoteCommand::SetTemperature { temperature: 93.5 });

        let command = RemoteCommand::from_json(
            r#"{"type":"set_pump","demand":{"mode":"pressure","pressure":9,"flow_limit":4}}"#,
        )
        .unwrap();
        assert_eq!(
            command,
            RemoteCommand::SetPump {
                demand: PumpDemand::Pressure {
                    pressure: 9.0,
                    flow_limit: 4.0
                }
            }
        );

        let command = RemoteCommand::from_json(r#"{"type":"set_gains","kp":2.4,"ki":0.04,"kd":10}"#).unwrap();
        assert_eq!(command.gains().map(|g| g.kff), Some(0.0));

        let command = RemoteCommand::from_json(r#"{"type":"start_autotune"}"#).unwrap();
        assert_eq!(
            command,
            RemoteCommand::StartAutotune {
                goal: 50.0,
                window_size: 4
            }
        );

        let command = RemoteCommand::from_json(r#"{"type":"activate","mode":"brew","target":"volumetric"}"#).unwrap();
        assert_eq!(
            command,
            RemoteCommand::Activate {
                mode: MachineMode::Brew,
                target: ProcessTarget::Volumetric
            }
        );
        assert!(RemoteCommand::from_json(r#"{"type":"reboot"}"#).is_err());
    }

    #[test]
    fn test_telemetry_json_fields() {
        let telemetry = Telemetry {
            timestamp_ms: 1200,
            mode: MachineMode::Brew,
            temperature: 92.8,
            target_temperature: 93.0,
            heater_duty: 35.0,
            heater_status: HeaterStatus::Regulating,
            pressure: 8.9,
            pump_duty: 61.0,
            pump_flow: 2.1,
            pumped_volume: 40.0,
            coffee_flow: 1.9,
            coffee_output: 18.2,
            resistance: 4.4,
            convergence_score: 0.97,
            valve_open: true,
            process_active: true,
            phase: Some(1),
            fault: None,
        };
        let value: serde_json::Value = serde_json::from_str(&telemetry.to_json().unwrap()).unwrap();
        assert_eq!(value["mode"], "brew");
        assert_eq!(value["heater_status"], "regulating");
        assert_eq!(value["phase"], 1);
        assert!(value["fault"].is_null());
    }
}
