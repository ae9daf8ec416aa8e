//! Brew recipes: an ordered list of phases, each with a pump demand, an optional
//! easing transition and the targets that end it.

use embassy_time::Duration;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PhaseKind {
    Preinfusion,
    Brew,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PumpTargetKind {
    Pressure,
    Flow,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AdvancedPump {
    pub target: PumpTargetKind,
    /// bar, -1 = hold what was measured when the phase started
    #[serde(default)]
    pub pressure: f32,
    /// ml/s, -1 = hold what was measured when the phase started
    #[serde(default)]
    pub flow: f32,
}

/// Either a plain duty cycle or a closed-loop pressure/flow demand.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PumpSpec {
    Simple(f32),
    Advanced(AdvancedPump),
}

impl Default for PumpSpec {
    fn default() -> Self {
        PumpSpec::Simple(100.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Easing {
    Linear,
    EaseIn,
    EaseOut,
    EaseInOut,
    #[default]
    Instant,
}

impl Easing {
    /// Map transition progress `t` (0-1) to interpolation weight.
    pub fn apply(self, t: f32) -> f32 {
        if t <= 0.0 {
            return 0.0;
        }
        if t >= 1.0 {
            return 1.0;
        }
        match self {
            Easing::Linear => t,
            Easing::EaseIn => t * t,
            Easing::EaseOut => 1.0 - (1.0 - t) * (1.0 - t),
            Easing::EaseInOut => {
                if t < 0.5 {
                    2.0 * t * t
                } else {
                    1.0 - 2.0 * (1.0 - t) * (1.0 - t)
                }
            }
            Easing::Instant => 1.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Transition {
    #[serde(rename = "type")]
    pub easing: Easing,
    /// seconds
    pub duration: f32,
    /// Start from the live measurement instead of the previous phase's value
    pub adaptive: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetKind {
    Volumetric,
    Pressure,
    Flow,
    /// Water pumped since the phase started
    Pumped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Comparison {
    #[default]
    Gte,
    Lte,
}

impl Comparison {
    pub fn holds(self, measured: f32, threshold: f32) -> bool {
        match self {
            Comparison::Gte => measured >= threshold,
            Comparison::Lte => measured <= threshold,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Target {
    #[serde(rename = "type")]
    pub kind: TargetKind,
    #[serde(default)]
    pub operator: Comparison,
    pub value: f32,
}

/// Live readings a phase's targets are tested against.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PhaseProgress {
    pub elapsed: Duration,
    /// Output volume, already delay-compensated
    pub volume: f32,
    pub pressure: f32,
    pub flow: f32,
    pub pumped: f32,
}

impl Default for PhaseProgress {
    fn default() -> Self {
        Self {
            elapsed: Duration::from_millis(0),
            volume: 0.0,
            pressure: 0.0,
            flow: 0.0,
            pumped: 0.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Phase {
    #[serde(default)]
    pub name: String,
    #[serde(rename = "phase", default = "default_phase_kind")]
    pub kind: PhaseKind,
    /// 1 = brew valve open
    #[serde(default)]
    pub valve: u8,
    /// seconds
    pub duration: f32,
    #[serde(default)]
    pub pump: PumpSpec,
    /// 0 = use the profile temperature
    #[serde(default)]
    pub temperature: f32,
    #[serde(default)]
    pub transition: Transition,
    #[serde(default)]
    pub targets: Vec<Target>,
}

fn default_phase_kind() -> PhaseKind {
    PhaseKind::Brew
}

impl Phase {
    pub fn valve_open(&self) -> bool {
        self.valve != 0
    }

    pub fn duration(&self) -> Duration {
        Duration::from_millis((self.duration.max(0.0) * 1000.0).round() as u64)
    }

    pub fn volumetric_target(&self) -> Option<&Target> {
        self.targets
            .iter()
            .find(|t| t.kind == TargetKind::Volumetric && t.value > 0.0)
    }

    /// Duration elapsed or any target reached. Volumetric targets only count
    /// when the run is volumetric.
    pub fn is_finished(&self, volumetric: bool, progress: &PhaseProgress) -> bool {
        if progress.elapsed >= self.duration() {
            return true;
        }
        self.targets.iter().any(|target| {
            let measured = match target.kind {
                TargetKind::Volumetric => {
                    if !volumetric || target.value <= 0.0 {
                        return false;
                    }
                    progress.volume
                }
                TargetKind::Pressure => progress.pressure,
                TargetKind::Flow => progress.flow,
                TargetKind::Pumped => progress.pumped,
            };
            target.operator.holds(measured, target.value)
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub label: String,
    /// Brew temperature (°C)
    pub temperature: f32,
    pub phases: Vec<Phase>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ProfileError {
    NoPhases,
    InvalidTemperature(f32),
    InvalidDuration { phase: usize },
    InvalidPump { phase: usize },
    InvalidTarget { phase: usize },
    Parse(String),
}

impl fmt::Display for ProfileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProfileError::NoPhases => write!(f, "Profile has no phases"),
            ProfileError::InvalidTemperature(t) => write!(f, "Invalid profile temperature: {}", t),
            ProfileError::InvalidDuration { phase } => write!(f, "Phase {} has an invalid duration", phase),
            ProfileError::InvalidPump { phase } => write!(f, "Phase {} has an invalid pump setting", phase),
            ProfileError::InvalidTarget { phase } => write!(f, "Phase {} has an invalid target", phase),
            ProfileError::Parse(e) => write!(f, "Profile parse error: {}", e),
        }
    }
}

impl std::error::Error for ProfileError {}

fn valid_advanced_value(value: f32) -> bool {
    value == -1.0 || (value.is_finite() && value >= 0.0)
}

impl Profile {
    pub fn from_json(json: &str) -> Result<Self, ProfileError> {
        let profile: Profile =
            serde_json::from_str(json).map_err(|e| ProfileError::Parse(e.to_string()))?;
        profile.validate()?;
        Ok(profile)
    }

    pub fn validate(&self) -> Result<(), ProfileError> {
        if self.phases.is_empty() {
            return Err(ProfileError::NoPhases);
        }
        if !self.temperature.is_finite() || self.temperature < 0.0 {
            return Err(ProfileError::InvalidTemperature(self.temperature));
        }
        for (index, phase) in self.phases.iter().enumerate() {
            if !phase.duration.is_finite() || phase.duration < 0.0 {
                return Err(ProfileError::InvalidDuration { phase: index });
            }
            if !phase.transition.duration.is_finite() || phase.transition.duration < 0.0 {
                return Err(ProfileError::InvalidDuration { phase: index });
            }
            let pump_ok = match phase.pump {
                PumpSpec::Simple(duty) => (0.0..=100.0).contains(&duty),
                PumpSpec::Advanced(adv) => {
                    valid_advanced_value(adv.pressure) && valid_advanced_value(adv.flow)
                }
            };
            if !pump_ok {
                return Err(ProfileError::InvalidPump { phase: index });
            }
            if phase.targets.iter().any(|t| !t.value.is_finite()) {
                return Err(ProfileError::InvalidTarget { phase: index });
            }
        }
        Ok(())
    }

    pub fn total_duration(&self) -> Duration {
        self.phases
            .iter()
            .fold(Duration::from_millis(0), |acc, phase| acc + phase.duration())
    }

    /// Volume of the last phase carrying a volumetric target, 0 if none does.
    pub fn brew_volume(&self) -> f32 {
        self.phases
            .iter()
            .filter_map(|phase| phase.volumetric_target())
            .last()
            .map(|t| t.value)
            .unwrap_or(0.0)
    }

    /// Phase override if set, profile temperature otherwise.
    pub fn temperature_for(&self, phase: usize) -> f32 {
        match self.phases.get(phase) {
            Some(p) if p.temperature > 0.0 => p.temperature,
            _ => self.temperature,
        }
    }

    /// Single phase that runs the pump flat out with the valve open.
    pub fn single_phase(label: &str, temperature: f32, duration_s: f32) -> Self {
        Self {
            id: String::new(),
            label: label.to_string(),
            temperature,
            phases: vec![Phase {
                name: label.to_string(),
                kind: PhaseKind::Brew,
                valve: 1,
                duration: duration_s,
                pump: PumpSpec::Simple(100.0),
                temperature: 0.0,
                transition: Transition::default(),
                targets: Vec::new(),
            }],
        }
    }
}
