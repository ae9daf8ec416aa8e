//! Pump control: sliding-mode pressure tracking, open-loop flow, direct power.
//!
//! The pressure law linearizes the pump through the flow model and the line
//! compliance, and scales its switching and integral gains by the headroom left
//! below the maximum pressure. A resistance estimator runs alongside whenever
//! the valve is open and feeds the virtual scale.

use crate::control::pid::winds_up;
use crate::control::pump_model::PumpFlowModel;
use crate::control::setpoint::{SetpointShaper, SetpointShaperConfig};
use crate::control::virtual_scale::{VirtualScale, VirtualScaleConfig};
use crate::estimation::{HydraulicEstimator, ResistanceEstimator, ScalarKalman};
use crate::types::{is_valid_reading, PUMP_CONTROL_PERIOD_S};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PressureControllerConfig {
    /// Line compliance seen by the pump (ml/bar)
    pub compliance: f32,
    pub max_pressure: f32,
    pub switching_gain: f32,
    pub convergence_gain: f32,
    pub integral_gain: f32,
    /// Weight of the error derivative in the switching surface
    pub derivative_weight: f32,
    /// Switching band as a fraction of the shaped target
    pub band_ratio: f32,
    pub deadband_ratio: f32,
    pub min_band: f32,
    pub min_headroom: f32,
    /// Below this the boiler is still filling and the pump runs flat out
    pub pressurized_threshold: f32,
    /// Lag on the modelled pump flow fed to the estimator (s)
    pub inflow_lag_s: f32,
    /// Lag on the filtered pressure derivative (s)
    pub derivative_lag_s: f32,
    pub shaper: SetpointShaperConfig,
    pub pump: PumpFlowModel,
    pub scale: VirtualScaleConfig,
}

impl Default for PressureControllerConfig {
    fn default() -> Self {
        Self {
            compliance: 0.66,
            max_pressure: 15.0,
            switching_gain: 0.7,
            convergence_gain: 1.0,
            integral_gain: 0.05,
            derivative_weight: 0.1,
            band_ratio: 0.3,
            deadband_ratio: 0.1,
            min_band: 0.05,
            min_headroom: 0.05,
            pressurized_threshold: 0.5,
            inflow_lag_s: 0.3,
            derivative_lag_s: 0.5,
            shaper: SetpointShaperConfig::default().with_rate_limits(Some(-9.0), Some(9.0)),
            pump: PumpFlowModel::default(),
            scale: VirtualScaleConfig::default(),
        }
    }
}

/// What the pump is asked to do this tick. A limit of 0 means "no limit".
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum PumpDemand {
    #[default]
    Off,
    /// Direct duty cycle, 0-100 %
    Power { duty: f32 },
    Pressure { pressure: f32, flow_limit: f32 },
    Flow { flow: f32, pressure_limit: f32 },
}

pub struct PressureFlowController<E = HydraulicEstimator> {
    config: PressureControllerConfig,
    estimator: E,
    shaper: SetpointShaper,
    sensor: ScalarKalman,
    scale: VirtualScale,
    filtered_pressure: f32,
    pressure_derivative: f32,
    last_pressure: Option<f32>,
    integral: f32,
    inflow: f32,
    pumped_volume: f32,
    duty: f32,
    valve_was_open: bool,
    pressurized: bool,
}

impl<E: ResistanceEstimator> PressureFlowController<E> {
    pub fn new(config: PressureControllerConfig, estimator: E) -> Self {
        Self {
            shaper: SetpointShaper::new(config.shaper),
            sensor: ScalarKalman::for_pressure(PUMP_CONTROL_PERIOD_S),
            scale: VirtualScale::new(config.scale),
            config,
            estimator,
            filtered_pressure: 0.0,
            pressure_derivative: 0.0,
            last_pressure: None,
            integral: 0.0,
            inflow: 0.0,
            pumped_volume: 0.0,
            duty: 0.0,
            valve_was_open: false,
            pressurized: false,
        }
    }

    /// Run one pump tick and return the duty cycle (0-100 %).
    ///
    /// `measured_inflow` overrides the pump model when a flow meter is fitted.
    pub fn update(
        &mut self,
        demand: PumpDemand,
        raw_pressure: f32,
        measured_inflow: Option<f32>,
        valve_open: bool,
        dt: f32,
    ) -> f32 {
        if !(dt > 0.0) {
            return self.duty;
        }
        if valve_open && !self.valve_was_open {
            self.reset();
        }
        self.valve_was_open = valve_open;

        if !is_valid_reading(raw_pressure) {
            warn!("Pressure reading invalid ({}), pump off", raw_pressure);
            self.integral = 0.0;
            self.shaper.invalidate();
            self.duty = 0.0;
            self.track_inflow(measured_inflow, dt);
            return self.duty;
        }
        self.filter_sensor(raw_pressure, dt);

        self.duty = match demand {
            PumpDemand::Off => {
                self.hold_idle();
                0.0
            }
            PumpDemand::Power { duty } => {
                self.hold_idle();
                if duty.is_finite() {
                    duty.clamp(0.0, 100.0)
                } else {
                    0.0
                }
            }
            PumpDemand::Pressure {
                pressure,
                flow_limit,
            } => self.limited(pressure, flow_limit, dt),
            PumpDemand::Flow {
                flow,
                pressure_limit,
            } => {
                if pressure_limit > 0.0 && flow > 0.0 {
                    self.limited(pressure_limit, flow, dt)
                } else {
                    self.shaper.invalidate();
                    self.integral = 0.0;
                    self.flow_duty(flow)
                }
            }
        };

        self.track_inflow(measured_inflow, dt);
        if valve_open {
            self.pressurized = self
                .estimator
                .update(self.inflow, self.filtered_pressure, dt);
            self.scale.update(
                self.filtered_pressure,
                self.estimator.resistance(),
                self.estimator.convergence_score(),
                self.pressurized,
                dt,
            );
        } else {
            self.pressurized = false;
            self.scale.update(0.0, 0.0, 0.0, false, dt);
        }

        self.duty
    }

    /// Pressure target with an optional flow ceiling: the smaller duty wins.
    fn limited(&mut self, pressure: f32, flow_limit: f32, dt: f32) -> f32 {
        let pressure_duty = self.pressure_duty(pressure, dt);
        if pressure > 0.0 && flow_limit > 0.0 {
            let flow_duty = self.flow_duty(flow_limit);
            if flow_duty < pressure_duty {
                // flow is in charge, do not let pressure error build up
                self.integral = 0.0;
                return flow_duty;
            }
        }
        pressure_duty
    }

    fn flow_duty(&self, flow: f32) -> f32 {
        self.config.pump.duty_for_flow(flow, self.filtered_pressure)
    }

    fn pressure_duty(&mut self, target: f32, dt: f32) -> f32 {
        let c = self.config;
        let p = self.filtered_pressure;

        if !target.is_finite() || target <= 0.0 {
            self.hold_idle();
            return 0.0;
        }
        if p < c.pressurized_threshold {
            // still filling; start shaping from wherever pressure is once it builds
            self.integral = 0.0;
            self.shaper.invalidate();
            return 100.0;
        }

        if !self.shaper.is_initialized() {
            self.shaper.reset(p);
        }
        let reference = self.shaper.update(target, dt);

        let error = p - reference.value;
        let error_dot = self.pressure_derivative - reference.derivative;

        let band = (c.band_ratio * reference.value).max(c.min_band);
        let deadband = c.deadband_ratio * reference.value;
        let s = c.convergence_gain * error + c.derivative_weight * error_dot;
        let offset = deadband * c.convergence_gain / band;
        let sat = if error > 0.0 {
            (s / band - offset).tanh().max(0.0)
        } else if error < 0.0 {
            (s / band + offset).tanh().min(0.0)
        } else {
            0.0
        };

        let headroom = (1.0 - p / c.max_pressure).max(c.min_headroom);
        let ki = c.integral_gain / headroom;
        let available = c.pump.available_flow(p).max(0.1);
        let k = c.switching_gain / headroom * available / c.compliance;

        self.integral += error * dt;
        let mut alpha =
            c.compliance / available * (-c.convergence_gain * error - k * sat) - ki * self.integral;

        let saturated = !(0.0..=1.0).contains(&alpha);
        if saturated && winds_up(error, -alpha) {
            self.integral -= error * dt;
            alpha = c.compliance / available * (-c.convergence_gain * error - k * sat)
                - ki * self.integral;
        }

        debug!(
            "P={:.2} r={:.2} e={:.3} s={:.3} sat={:.3} alpha={:.3}",
            p, reference.value, error, s, sat, alpha
        );
        (alpha * 100.0).clamp(0.0, 100.0)
    }

    fn hold_idle(&mut self) {
        // estimator is left alone, it still has to converge
        self.shaper.invalidate();
        self.integral = 0.0;
    }

    fn filter_sensor(&mut self, raw: f32, dt: f32) {
        let filtered = self.sensor.update(raw);
        if let Some(last) = self.last_pressure {
            let alpha = self.config.derivative_lag_s / (self.config.derivative_lag_s + dt);
            self.pressure_derivative =
                alpha * self.pressure_derivative + (1.0 - alpha) * (filtered - last) / dt;
        }
        self.last_pressure = Some(filtered);
        self.filtered_pressure = filtered;
    }

    fn track_inflow(&mut self, measured: Option<f32>, dt: f32) {
        let target = match measured {
            Some(flow) if flow.is_finite() && flow >= 0.0 => flow,
            _ => self.config.pump.flow_at(self.filtered_pressure, self.duty),
        };
        let alpha = self.config.inflow_lag_s / (self.config.inflow_lag_s + dt);
        self.inflow = alpha * self.inflow + (1.0 - alpha) * target;
        self.pumped_volume += self.inflow * dt;
    }

    /// Start of a new shot: forget the puck and the setpoint history.
    pub fn reset(&mut self) {
        info!("Pressure controller reset");
        self.estimator.reset();
        self.shaper.invalidate();
        self.integral = 0.0;
        self.scale.reset();
        self.pressurized = false;
    }

    pub fn tare(&mut self) {
        self.scale.tare();
        self.pumped_volume = 0.0;
    }

    pub fn set_pump_model(&mut self, model: PumpFlowModel) {
        info!("Pump model: {:?}", model.coefficients);
        self.config.pump = model;
    }

    pub fn pump_model(&self) -> &PumpFlowModel {
        &self.config.pump
    }

    pub fn set_shaper(&mut self, shaper: SetpointShaperConfig) {
        self.config.shaper = shaper;
        self.shaper.set_config(shaper);
    }

    pub fn filtered_pressure(&self) -> f32 {
        self.filtered_pressure
    }

    pub fn pressure_derivative(&self) -> f32 {
        self.pressure_derivative
    }

    pub fn shaped_setpoint(&self) -> f32 {
        self.shaper.current().value
    }

    pub fn integral(&self) -> f32 {
        self.integral
    }

    pub fn duty(&self) -> f32 {
        self.duty
    }

    /// Lagged pump flow (ml/s)
    pub fn pump_flow(&self) -> f32 {
        self.inflow
    }

    pub fn pumped_volume(&self) -> f32 {
        self.pumped_volume
    }

    pub fn coffee_flow(&self) -> f32 {
        self.scale.flow()
    }

    pub fn coffee_output(&self) -> f32 {
        self.scale.output()
    }

    pub fn resistance(&self) -> f32 {
        self.estimator.resistance()
    }

    pub fn convergence_score(&self) -> f32 {
        self.estimator.convergence_score()
    }

    pub fn is_pressurized(&self) -> bool {
        self.pressurized
    }

    pub fn estimator(&self) -> &E {
        &self.estimator
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::estimation::{EstimatorConfig, RlsConfig, RlsResistanceEstimator};
    use approx::assert_abs_diff_eq;

    const DT: f32 = 0.03;

    fn controller() -> PressureFlowController {
        PressureFlowController::new(
            PressureControllerConfig::default(),
            HydraulicEstimator::new(EstimatorConfig::default()),
        )
    }

    /// Compliance 1 ml/bar, puck passing 4.5 ml/s at 9 bar.
    struct Group {
        pressure: f32,
    }

    impl Group {
        fn step(&mut self, pump: &PumpFlowModel, duty: f32) -> f32 {
            let outflow = 1.5 * self.pressure.max(0.0).sqrt();
            let inflow = pump.flow_at(self.pressure, duty);
            self.pressure = (self.pressure + DT * (inflow - outflow) / 1.0).max(0.0);
            self.pressure
        }
    }

    fn settle<E: ResistanceEstimator>(
        ctrl: &mut PressureFlowController<E>,
        demand: PumpDemand,
        pressure: f32,
        ticks: usize,
    ) -> f32 {
        let mut duty = 0.0;
        for _ in 0..ticks {
            duty = ctrl.update(demand, pressure, None, true, DT);
        }
        duty
    }

    #[test]
    fn test_zero_setpoint_idles_and_clears_integral() {
        let mut ctrl = controller();
        let demand = PumpDemand::Pressure {
            pressure: 9.0,
            flow_limit: 0.0,
        };
        settle(&mut ctrl, demand, 8.5, 100);
        assert!(ctrl.integral() != 0.0);

        let idle = PumpDemand::Pressure {
            pressure: 0.0,
            flow_limit: 0.0,
        };
        for pressure in [0.0, 4.0, 12.0] {
            assert_eq!(ctrl.update(idle, pressure, None, true, DT), 0.0);
            assert_eq!(ctrl.integral(), 0.0);
        }
    }

    #[test]
    fn test_unpressurized_boiler_runs_flat_out() {
        let mut ctrl = controller();
        let demand = PumpDemand::Pressure {
            pressure: 9.0,
            flow_limit: 0.0,
        };
        assert_eq!(settle(&mut ctrl, demand, 0.2, 20), 100.0);
    }

    #[test]
    fn test_closed_loop_reaches_nine_bar() {
        let mut ctrl = controller();
        let pump = *ctrl.pump_model();
        let mut group = Group { pressure: 0.0 };
        let demand = PumpDemand::Pressure {
            pressure: 9.0,
            flow_limit: 0.0,
        };
        let mut duty = 0.0;
        let mut tail = Vec::new();
        for tick in 0..(20.0 / DT) as usize {
            let p = group.step(&pump, duty);
            duty = ctrl.update(demand, p, None, true, DT);
            assert!((0.0..=100.0).contains(&duty));
            if tick as f32 * DT > 19.0 {
                tail.push(p);
            }
        }
        let mean = tail.iter().sum::<f32>() / tail.len() as f32;
        assert_abs_diff_eq!(mean, 9.0, epsilon = 0.3);
    }

    #[test]
    fn test_flow_mode_uses_pump_model() {
        let mut ctrl = controller();
        let demand = PumpDemand::Flow {
            flow: 3.0,
            pressure_limit: 0.0,
        };
        let duty = settle(&mut ctrl, demand, 5.0, 200);
        let expected = 3.0 / ctrl.pump_model().available_flow(ctrl.filtered_pressure()) * 100.0;
        assert_abs_diff_eq!(duty, expected, epsilon = 1e-3);
    }

    #[test]
    fn test_flow_limit_wins_and_clears_integral() {
        let mut ctrl = controller();
        let demand = PumpDemand::Pressure {
            pressure: 9.0,
            flow_limit: 2.0,
        };
        let duty = settle(&mut ctrl, demand, 3.0, 200);
        let flow_duty = 2.0 / ctrl.pump_model().available_flow(ctrl.filtered_pressure()) * 100.0;
        assert_abs_diff_eq!(duty, flow_duty, epsilon = 1e-3);
        assert_eq!(ctrl.integral(), 0.0);
    }

    #[test]
    fn test_invalid_pressure_stops_pump() {
        let mut ctrl = controller();
        let demand = PumpDemand::Power { duty: 80.0 };
        assert_eq!(ctrl.update(demand, 5.0, None, true, DT), 80.0);
        assert_eq!(ctrl.update(demand, f32::NAN, None, true, DT), 0.0);
    }

    #[test]
    fn test_tare_and_rls_estimator() {
        let mut ctrl = PressureFlowController::new(
            PressureControllerConfig::default(),
            RlsResistanceEstimator::new(RlsConfig::default()),
        );
        let demand = PumpDemand::Power { duty: 60.0 };
        settle(&mut ctrl, demand, 6.0, 300);
        assert!(ctrl.pumped_volume() > 0.0);
        ctrl.tare();
        assert_eq!(ctrl.pumped_volume(), 0.0);
        assert_eq!(ctrl.coffee_output(), 0.0);
    }
}
