use super::{convergence_score, ResistanceEstimator};
use log::debug;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RlsConfig {
    /// bar·s/ml
    pub initial_resistance: f32,
    pub initial_covariance: f32,
    pub min_resistance: f32,
    pub max_resistance: f32,
    pub measurement_noise: f32,
    pub forgetting_factor: f32,
    /// Updates below this pressure carry no information
    pub min_pressure: f32,
    /// Elapsed update time before a score is reported
    pub convergence_delay_s: f32,
}

impl Default for RlsConfig {
    fn default() -> Self {
        Self {
            initial_resistance: 5.0,
            initial_covariance: 100.0,
            min_resistance: 0.01,
            max_resistance: 1000.0,
            measurement_noise: 3e-4,
            forgetting_factor: 0.85,
            min_pressure: 0.4,
            convergence_delay_s: 0.5,
        }
    }
}

/// Scalar recursive least squares on `P = Q * R` with exponential forgetting.
pub struct RlsResistanceEstimator {
    config: RlsConfig,
    resistance: f32,
    covariance: f32,
    elapsed_s: f32,
    samples: u32,
}

const NUMERICAL_EPSILON: f32 = 1e-12;

impl RlsResistanceEstimator {
    pub fn new(config: RlsConfig) -> Self {
        Self {
            resistance: config.initial_resistance,
            covariance: config.initial_covariance,
            config,
            elapsed_s: 0.0,
            samples: 0,
        }
    }

    pub fn covariance(&self) -> f32 {
        self.covariance
    }

    pub fn samples(&self) -> u32 {
        self.samples
    }

    pub fn is_healthy(&self) -> bool {
        self.resistance.is_finite() && self.covariance.is_finite() && self.covariance > 0.0
    }
}

impl ResistanceEstimator for RlsResistanceEstimator {
    fn update(&mut self, inflow_ml_s: f32, pressure_bar: f32, dt: f32) -> bool {
        if !inflow_ml_s.is_finite() || !pressure_bar.is_finite() || pressure_bar < self.config.min_pressure {
            return false;
        }
        self.samples += 1;
        if dt.is_finite() && dt > 0.0 {
            self.elapsed_s += dt;
        }

        let prev_resistance = self.resistance;
        let prev_covariance = self.covariance;

        let q = inflow_ml_s;
        let cov = self.covariance / self.config.forgetting_factor;
        let gain = cov * q / (1.0 + q * cov * q + NUMERICAL_EPSILON);
        self.resistance += gain * (pressure_bar - q * self.resistance);

        // Joseph form
        let keep = 1.0 - gain * q;
        self.covariance = keep * cov * keep + gain * gain * self.config.measurement_noise;

        if !self.covariance.is_finite() || self.covariance <= 0.0 || !self.resistance.is_finite() {
            debug!("RLS rollback: cov={} R={}", self.covariance, self.resistance);
            self.resistance = prev_resistance;
            self.covariance = prev_covariance;
            return false;
        }

        self.resistance = self
            .resistance
            .clamp(self.config.min_resistance, self.config.max_resistance);
        true
    }

    fn reset(&mut self) {
        self.resistance = self.config.initial_resistance;
        self.covariance = self.config.initial_covariance;
        self.elapsed_s = 0.0;
        self.samples = 0;
    }

    fn resistance(&self) -> f32 {
        self.resistance
    }

    fn convergence_score(&self) -> f32 {
        convergence_score(
            self.resistance,
            self.covariance,
            self.elapsed_s > self.config.convergence_delay_s,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_converges_on_constant_resistance() {
        let mut rls = RlsResistanceEstimator::new(RlsConfig::default());
        for _ in 0..100 {
            assert!(rls.update(2.0, 9.0, 0.03));
        }
        assert_abs_diff_eq!(rls.resistance(), 4.5, epsilon = 1e-3);
        assert_abs_diff_eq!(rls.convergence_score(), 1.0);
    }

    #[test]
    fn test_score_gated_by_delay() {
        let mut rls = RlsResistanceEstimator::new(RlsConfig::default());
        for _ in 0..10 {
            rls.update(2.0, 9.0, 0.03);
        }
        // 0.3 s of data is not enough
        assert_eq!(rls.convergence_score(), 0.0);
    }

    #[test]
    fn test_rejects_low_pressure_and_nan() {
        let mut rls = RlsResistanceEstimator::new(RlsConfig::default());
        assert!(!rls.update(2.0, 0.2, 0.03));
        assert!(!rls.update(f32::NAN, 9.0, 0.03));
        assert_eq!(rls.samples(), 0);
        assert_eq!(rls.resistance(), RlsConfig::default().initial_resistance);
    }

    #[test]
    fn test_reset_restores_initial_state() {
        let mut rls = RlsResistanceEstimator::new(RlsConfig::default());
        for _ in 0..50 {
            rls.update(3.0, 6.0, 0.03);
        }
        rls.reset();
        assert_eq!(rls.resistance(), 5.0);
        assert_eq!(rls.covariance(), 100.0);
        assert!(rls.is_healthy());
    }
}
