pub mod brewing;
pub mod control;
pub mod controller;
pub mod estimation;
pub mod hardware;
pub mod heater;
pub mod math;
pub mod safety;
pub mod state;
pub mod system;
pub mod types;

pub use controller::*;
pub use types::*;
