use crate::types::clamp_duty;
use embedded_hal::PwmPin;
use log::debug;

/// Percentage duty cycle on an `embedded-hal` PWM channel (heater SSR, pump).
pub struct PwmOutput<P> {
    pin: P,
    name: &'static str,
    percent: f32,
}

impl<P> PwmOutput<P>
where
    P: PwmPin<Duty = u32>,
{
    pub fn new(mut pin: P, name: &'static str) -> Self {
        pin.set_duty(0);
        pin.enable();
        Self {
            pin,
            name,
            percent: 0.0,
        }
    }

    /// Set the duty cycle in percent. NaN and out-of-range values are clamped.
    pub fn set_percent(&mut self, percent: f32) {
        let percent = clamp_duty(percent);
        let max = self.pin.get_max_duty();
        let duty = ((max as f32) * percent / 100.0).round() as u32;
        self.pin.set_duty(duty.min(max));
        if (percent - self.percent).abs() >= 1.0 {
            debug!("PWM '{}': {:.0}%", self.name, percent);
        }
        self.percent = percent;
    }

    pub fn percent(&self) -> f32 {
        self.percent
    }

    pub fn release(mut self) -> P {
        self.pin.set_duty(0);
        self.pin.disable();
        self.pin
    }
}
