use log::info;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VirtualScaleConfig {
    /// Puck flow goes as `(P / R)^(1 / exponent)`
    pub flow_exponent: f32,
    /// ml (or g) per unit of modelled flow
    pub calibration: f32,
    pub convergence_threshold: f32,
    /// Consecutive confident ticks before output is trusted
    pub convergence_count: u32,
}

impl Default for VirtualScaleConfig {
    fn default() -> Self {
        Self {
            flow_exponent: 1.2,
            calibration: 1.0,
            convergence_threshold: 0.9,
            convergence_count: 10,
        }
    }
}

/// Beverage output estimated from pressure and the identified puck resistance.
///
/// Until the estimator is trusted, `P^(1/n) dt` is banked so the drips that
/// happened before convergence are credited once a resistance is known.
#[derive(Debug, Clone)]
pub struct VirtualScale {
    config: VirtualScaleConfig,
    flow: f32,
    output: f32,
    retro_pressure: f32,
    confident_ticks: u32,
}

impl VirtualScale {
    pub fn new(config: VirtualScaleConfig) -> Self {
        Self {
            config,
            flow: 0.0,
            output: 0.0,
            retro_pressure: 0.0,
            confident_ticks: 0,
        }
    }

    /// Advance one tick. `flowing` is false while the puck is not under load.
    pub fn update(&mut self, pressure: f32, resistance: f32, score: f32, flowing: bool, dt: f32) -> f32 {
        if !flowing || !pressure.is_finite() || pressure <= 0.0 || !(dt > 0.0) {
            self.flow = 0.0;
            return self.flow;
        }

        let inv_n = 1.0 / self.config.flow_exponent;
        if score > self.config.convergence_threshold {
            self.confident_ticks = self.confident_ticks.saturating_add(1);
        } else {
            self.confident_ticks = 0;
        }

        let trusted = self.confident_ticks >= self.config.convergence_count
            && resistance.is_finite()
            && resistance > 0.0;
        if !trusted {
            self.retro_pressure += pressure.powf(inv_n) * dt;
            self.flow = 0.0;
            return self.flow;
        }

        let scale = self.config.calibration * resistance.powf(-inv_n);
        if self.retro_pressure > 0.0 {
            let credited = self.retro_pressure * scale;
            info!("Virtual scale: crediting {:.1} ml from before convergence", credited);
            self.output += credited;
            self.retro_pressure = 0.0;
        }

        self.flow = scale * pressure.powf(inv_n);
        self.output += self.flow * dt;
        self.flow
    }

    pub fn flow(&self) -> f32 {
        self.flow
    }

    pub fn output(&self) -> f32 {
        self.output
    }

    pub fn is_trusted(&self) -> bool {
        self.confident_ticks >= self.config.convergence_count
    }

    pub fn tare(&mut self) {
        self.output = 0.0;
        self.retro_pressure = 0.0;
    }

    pub fn reset(&mut self) {
        self.tare();
        self.flow = 0.0;
        self.confident_ticks = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_flow_follows_power_law() {
        let mut scale = VirtualScale::new(VirtualScaleConfig {
            convergence_count: 1,
            ..VirtualScaleConfig::default()
        });
        let flow = scale.update(9.0, 4.5, 1.0, true, 0.1);
        assert_relative_eq!(flow, 2.0f32.powf(1.0 / 1.2), max_relative = 1e-5);
    }

    #[test]
    fn test_retroactive_credit_matches_steady_flow() {
        let config = VirtualScaleConfig::default();
        let mut scale = VirtualScale::new(config);
        // 20 ticks without confidence, then converged
        for _ in 0..20 {
            scale.update(9.0, 4.5, 0.2, true, 0.1);
        }
        assert_eq!(scale.output(), 0.0);
        for _ in 0..30 {
            scale.update(9.0, 4.5, 1.0, true, 0.1);
        }
        // ticks banked before and while gaining confidence are all credited
        let per_tick = 2.0f32.powf(1.0 / 1.2) * 0.1;
        assert_relative_eq!(scale.output(), per_tick * 50.0, max_relative = 1e-4);
    }

    #[test]
    fn test_not_flowing_and_tare() {
        let mut scale = VirtualScale::new(VirtualScaleConfig {
            convergence_count: 1,
            ..VirtualScaleConfig::default()
        });
        scale.update(9.0, 4.5, 1.0, true, 0.1);
        assert!(scale.output() > 0.0);
        assert_eq!(scale.update(9.0, 4.5, 1.0, false, 0.1), 0.0);
        scale.tare();
        assert_eq!(scale.output(), 0.0);
    }
}
