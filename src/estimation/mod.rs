pub mod ekf;
pub mod kalman;
pub mod rls;

pub use ekf::{EstimatorConfig, HydraulicEstimator};
pub use kalman::ScalarKalman;
pub use rls::{RlsConfig, RlsResistanceEstimator};

/// Online puck resistance identification from pump inflow and measured pressure.
///
/// Resistance is in bar·s/ml. A failed update (gated input or numerical rollback)
/// leaves the previous estimate untouched.
pub trait ResistanceEstimator {
    fn update(&mut self, inflow_ml_s: f32, pressure_bar: f32, dt: f32) -> bool;
    fn reset(&mut self);
    fn resistance(&self) -> f32;
    /// 0 = no confidence, 1 = converged
    fn convergence_score(&self) -> f32;
}

/// `clamp(log10(estimate / sigma) / log10(20), 0, 1)`, zero until `gate_passed`.
pub(crate) fn convergence_score(estimate: f32, variance: f32, gate_passed: bool) -> f32 {
    if !gate_passed || !(variance > 0.0) || !(estimate > 0.0) {
        return 0.0;
    }
    let score = (estimate / variance.sqrt()).log10() / 20f32.log10();
    if score.is_finite() {
        score.clamp(0.0, 1.0)
    } else {
        0.0
    }
}

impl<T: ResistanceEstimator + ?Sized> ResistanceEstimator for Box<T> {
    fn update(&mut self, inflow_ml_s: f32, pressure_bar: f32, dt: f32) -> bool {
        (**self).update(inflow_ml_s, pressure_bar, dt)
    }

    fn reset(&mut self) {
        (**self).reset()
    }

    fn resistance(&self) -> f32 {
        (**self).resistance()
    }

    fn convergence_score(&self) -> f32 {
        (**self).convergence_score()
    }
}
