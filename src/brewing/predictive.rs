use crate::math::least_squares_slope;
use crate::types::PREDICTIVE_WINDOW_MS;
use embassy_time::{Duration, Instant};
use heapless::Deque;
use log::{debug, info};

pub const RATE_HISTORY_SIZE: usize = 64;

/// Output rate over a trailing time window, used to stop early by however much
/// will still land in the cup during the actuation delay.
#[derive(Debug, Clone)]
pub struct VolumetricRateCalculator {
    window: Duration,
    samples: Deque<(Instant, f32), RATE_HISTORY_SIZE>,
}

impl Default for VolumetricRateCalculator {
    fn default() -> Self {
        Self::new(Duration::from_millis(PREDICTIVE_WINDOW_MS))
    }
}

impl VolumetricRateCalculator {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            samples: Deque::new(),
        }
    }

    /// Store a reading. Samples must be strictly later than the previous one.
    pub fn add_measurement(&mut self, now: Instant, volume: f32) -> bool {
        if !volume.is_finite() {
            return false;
        }
        if let Some(&(last, _)) = self.samples.back() {
            if now <= last {
                debug!("Rate calculator: dropping out-of-order sample");
                return false;
            }
        }

        while let Some(&(t, _)) = self.samples.front() {
            if now.duration_since(t) > self.window {
                self.samples.pop_front();
            } else {
                break;
            }
        }
        if self.samples.is_full() {
            self.samples.pop_front();
        }
        let _ = self.samples.push_back((now, volume));
        true
    }

    /// Least-squares rate (units/s) over the window ending at `now`, never negative.
    pub fn get_rate(&self, now: Instant) -> f32 {
        let Some(&(first, _)) = self.samples.front() else {
            return 0.0;
        };
        let cutoff = now.as_millis().saturating_sub(self.window.as_millis());
        let points = self
            .samples
            .iter()
            .filter(move |(t, _)| t.as_millis() >= cutoff && *t <= now)
            .map(move |&(t, v)| ((t.as_millis() - first.as_millis()) as f64 / 1000.0, v as f64));
        match least_squares_slope(points) {
            Some(rate) if rate > 0.0 => rate as f32,
            _ => 0.0,
        }
    }

    /// Rate as of the newest sample.
    pub fn get_latest_rate(&self) -> f32 {
        match self.samples.back() {
            Some(&(last, _)) => self.get_rate(last),
            None => 0.0,
        }
    }

    /// How much longer (ms, signed) the stop should have come to hit `expected`.
    pub fn get_overshoot_adjust_ms(&self, expected: f32, actual: f32) -> f32 {
        if self.samples.len() < 2 {
            return 0.0;
        }
        let rate = self.get_latest_rate();
        if rate <= 0.0 {
            return 0.0;
        }
        (actual - expected) / rate * 1000.0
    }

    /// Updated actuation delay after a run that ended at `actual` instead of `expected`.
    pub fn get_new_delay(&self, current: Duration, expected: f32, actual: f32) -> Duration {
        let adjust = self.get_overshoot_adjust_ms(expected, actual);
        let window_ms = self.window.as_millis() as f32;
        let new_ms = (current.as_millis() as f32 + adjust).clamp(0.0, window_ms);
        info!(
            "Delay update: {}ms -> {:.0}ms (expected {:.1}, got {:.1})",
            current.as_millis(),
            new_ms,
            expected,
            actual
        );
        Duration::from_millis(new_ms.round() as u64)
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }
}
