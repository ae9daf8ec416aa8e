/// Scalar random-walk Kalman filter used to smooth the pressure transducer.
#[derive(Debug, Clone)]
pub struct ScalarKalman {
    measurement_error: f32,
    estimate_error: f32,
    process_noise: f32,
    estimate: f32,
    gain: f32,
}

impl ScalarKalman {
    pub fn new(measurement_error: f32, estimate_error: f32, process_noise: f32) -> Self {
        Self {
            measurement_error,
            estimate_error,
            process_noise,
            estimate: 0.0,
            gain: 0.0,
        }
    }

    /// Pressure smoother tuned for a loop running every `dt` seconds.
    pub fn for_pressure(dt: f32) -> Self {
        Self::new(0.1, 10.0, (4.0 * dt).powi(2))
    }

    pub fn update(&mut self, measurement: f32) -> f32 {
        if !measurement.is_finite() {
            return self.estimate;
        }
        self.estimate_error += self.process_noise;
        self.gain = self.estimate_error / (self.estimate_error + self.measurement_error);
        self.estimate += self.gain * (measurement - self.estimate);
        self.estimate_error *= 1.0 - self.gain;
        self.estimate
    }

    pub fn estimate(&self) -> f32 {
        self.estimate
    }

    pub fn gain(&self) -> f32 {
        self.gain
    }

    pub fn set_estimate(&mut self, value: f32) {
        self.estimate = value;
    }

    pub fn set_process_noise(&mut self, q: f32) {
        self.process_noise = q;
    }
}
