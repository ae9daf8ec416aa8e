use serde::{Deserialize, Serialize};

/// Flow the pump delivers at full duty as a cubic in pressure (ml/s), linear in duty.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PumpFlowModel {
    /// `[a, b, c, d]` for `a*P^3 + b*P^2 + c*P + d`
    pub coefficients: [f32; 4],
}

impl Default for PumpFlowModel {
    fn default() -> Self {
        Self {
            coefficients: [0.0, 0.0, -0.5854, 10.79],
        }
    }
}

impl PumpFlowModel {
    pub fn from_polynomial(a: f32, b: f32, c: f32, d: f32) -> Self {
        Self {
            coefficients: [a, b, c, d],
        }
    }

    /// Affine model through the measured full-duty flow at 1 bar and at 9 bar.
    pub fn from_calibration(one_bar_flow: f32, nine_bar_flow: f32) -> Self {
        let slope = (nine_bar_flow - one_bar_flow) / 8.0;
        Self::from_polynomial(0.0, 0.0, slope, one_bar_flow - slope)
    }

    /// Full-duty flow at `pressure`, never negative.
    pub fn available_flow(&self, pressure: f32) -> f32 {
        let [a, b, c, d] = self.coefficients;
        let p = pressure.max(0.0);
        (((a * p + b) * p + c) * p + d).max(0.0)
    }

    pub fn flow_at(&self, pressure: f32, duty: f32) -> f32 {
        self.available_flow(pressure) * duty.clamp(0.0, 100.0) / 100.0
    }

    /// Duty (0-100 %) that delivers `flow` at `pressure`.
    pub fn duty_for_flow(&self, flow: f32, pressure: f32) -> f32 {
        let available = self.available_flow(pressure);
        if available <= 0.0 || !flow.is_finite() {
            return 0.0;
        }
        (flow / available * 100.0).clamp(0.0, 100.0)
    }

    pub fn is_valid(&self) -> bool {
        self.coefficients.iter().all(|c| c.is_finite()) && self.available_flow(0.0) > 0.0
    }
}
