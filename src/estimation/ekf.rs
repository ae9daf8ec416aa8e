//! Three-state extended Kalman filter over the group-head hydraulics.
//!
//! State is `[P, k, Qout]` with the puck modelled as `Qout = k * sqrt(P)`. The
//! line compliance relaxes from a large pre-saturation value towards the
//! nominal puck compliance as water goes in, so the first millilitres that only
//! wet the puck do not read as a very permeable puck.

use super::{convergence_score, ResistanceEstimator};
use log::debug;
use nalgebra::{Matrix3, RowVector3, Vector3};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EstimatorConfig {
    /// ml/bar once the puck is saturated
    pub nominal_compliance: f32,
    /// ml/bar while the headspace is still filling
    pub pre_saturation_compliance: f32,
    /// Inflow volume over which compliance relaxes (ml)
    pub saturation_volume_ml: f32,
    /// ml/s per sqrt(bar)
    pub initial_coefficient: f32,
    /// Initial variances of `[P, k, Qout]`
    pub initial_variance: [f32; 3],
    /// Process noise of `[P, k, Qout]` per step
    pub process_noise: [f32; 3],
    /// Pressure measurement variance (bar^2)
    pub measurement_noise: f32,
    /// Below this the puck is not under load and updates are skipped
    pub min_pressure: f32,
    pub pressure_floor: f32,
    pub convergence_delay_s: f32,
}

impl Default for EstimatorConfig {
    fn default() -> Self {
        Self {
            nominal_compliance: 1.2,
            pre_saturation_compliance: 6.0,
            saturation_volume_ml: 15.0,
            initial_coefficient: 0.5,
            initial_variance: [1.0, 1.0, 1.0],
            process_noise: [1e-4, 1e-7, 1e-4],
            measurement_noise: 1e-3,
            min_pressure: 0.3,
            pressure_floor: 1e-3,
            convergence_delay_s: 0.5,
        }
    }
}

pub struct HydraulicEstimator {
    config: EstimatorConfig,
    x: Vector3<f32>,
    p: Matrix3<f32>,
    q: Matrix3<f32>,
    inflow_volume: f32,
    elapsed_s: f32,
    samples: u32,
    seeded: bool,
}

impl HydraulicEstimator {
    pub fn new(config: EstimatorConfig) -> Self {
        let mut estimator = Self {
            config,
            x: Vector3::zeros(),
            p: Matrix3::zeros(),
            q: Matrix3::from_diagonal(&Vector3::from(config.process_noise)),
            inflow_volume: 0.0,
            elapsed_s: 0.0,
            samples: 0,
            seeded: false,
        };
        estimator.reset();
        estimator
    }

    pub fn effective_compliance(&self) -> f32 {
        let c = &self.config;
        let relax = if c.saturation_volume_ml > 0.0 {
            (-self.inflow_volume / c.saturation_volume_ml).exp()
        } else {
            0.0
        };
        c.nominal_compliance + (c.pre_saturation_compliance - c.nominal_compliance) * relax
    }

    pub fn pressure(&self) -> f32 {
        self.x[0]
    }

    /// Flow coefficient `k` in `Qout = k * sqrt(P)`
    pub fn coefficient(&self) -> f32 {
        self.x[1]
    }

    pub fn outflow(&self) -> f32 {
        self.x[2]
    }

    pub fn coefficient_variance(&self) -> f32 {
        self.p[(1, 1)]
    }

    pub fn covariance(&self) -> &Matrix3<f32> {
        &self.p
    }

    pub fn inflow_volume(&self) -> f32 {
        self.inflow_volume
    }

    pub fn samples(&self) -> u32 {
        self.samples
    }

    fn covariance_is_sane(p: &Matrix3<f32>) -> bool {
        p.iter().all(|v| v.is_finite()) && (0..3).all(|i| p[(i, i)] > 0.0)
    }
}

impl ResistanceEstimator for HydraulicEstimator {
    fn update(&mut self, inflow_ml_s: f32, pressure_bar: f32, dt: f32) -> bool {
        if !inflow_ml_s.is_finite()
            || !pressure_bar.is_finite()
            || !(dt > 0.0)
            || pressure_bar < self.config.min_pressure
        {
            return false;
        }
        let inflow = inflow_ml_s.max(0.0);

        if !self.seeded {
            self.x[0] = pressure_bar;
            self.x[2] = self.x[1] * pressure_bar.sqrt();
            self.seeded = true;
        }

        let prev_x = self.x;
        let prev_p = self.p;
        let prev_volume = self.inflow_volume;

        self.inflow_volume += inflow * dt;
        let c_eff = self.effective_compliance();

        // predict
        let pressure = self.x[0];
        let k = self.x[1];
        let sqrt_p = pressure.max(self.config.pressure_floor).sqrt();
        let outflow = k * sqrt_p;
        let x_pred = Vector3::new(pressure + dt * (inflow - outflow) / c_eff, k, outflow);

        let f = Matrix3::new(
            1.0 - dt * k / (2.0 * c_eff * sqrt_p), -dt * sqrt_p / c_eff, 0.0,
            0.0, 1.0, 0.0,
            k / (2.0 * sqrt_p), sqrt_p, 0.0,
        );
        let p_pred = f * self.p * f.transpose() + self.q;

        // correct on pressure only
        let h = RowVector3::new(1.0, 0.0, 0.0);
        let innovation_var = p_pred[(0, 0)] + self.config.measurement_noise;
        let gain: Vector3<f32> = p_pred * h.transpose() / innovation_var;
        let residual = pressure_bar - x_pred[0];

        self.x = x_pred + gain * residual;
        let i_kh = Matrix3::identity() - gain * h;
        let joseph = i_kh * p_pred * i_kh.transpose()
            + gain * gain.transpose() * self.config.measurement_noise;
        self.p = (joseph + joseph.transpose()) * 0.5;

        self.x[1] = self.x[1].max(0.0);
        self.x[2] = self.x[2].max(0.0);

        if !Self::covariance_is_sane(&self.p) || self.x.iter().any(|v| !v.is_finite()) {
            debug!("EKF rollback at P={:.3} Qin={:.3}", pressure_bar, inflow);
            self.x = prev_x;
            self.p = prev_p;
            self.inflow_volume = prev_volume;
            return false;
        }

        self.samples += 1;
        self.elapsed_s += dt;
        true
    }

    fn reset(&mut self) {
        let c = &self.config;
        self.x = Vector3::new(0.0, c.initial_coefficient, 0.0);
        self.p = Matrix3::from_diagonal(&Vector3::from(c.initial_variance));
        self.q = Matrix3::from_diagonal(&Vector3::from(c.process_noise));
        self.inflow_volume = 0.0;
        self.elapsed_s = 0.0;
        self.samples = 0;
        self.seeded = false;
    }

    fn resistance(&self) -> f32 {
        self.x[0].max(0.0) / self.x[2].max(1e-6)
    }

    fn convergence_score(&self) -> f32 {
        convergence_score(
            self.x[1],
            self.p[(1, 1)],
            self.elapsed_s > self.config.convergence_delay_s,
        )
    }
}
