pub mod predictive;
pub mod process;
pub mod profile;
pub mod states;

pub use predictive::VolumetricRateCalculator;
pub use process::{GrindRun, Process, ProcessTiming, TimedPump};
pub use profile::*;
pub use states::{BrewInput, BrewRun, BrewState};
