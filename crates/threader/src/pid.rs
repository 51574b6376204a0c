//! PID controller over a measured host signal
//!
//! Maps the measured CPU usage to a bounded integer thread target. The
//! output bounds are retuned by the engine before every update, so the
//! upper bound follows the current exploration ceiling.

use crate::config::PidGains;

/// Scalar PID controller with clamped integer output.
#[derive(Debug, Clone)]
pub struct PidController {
    gains: PidGains,
    integral: f64,
    last_error: f64,
    last_time_ms: Option<i64>,
    output_min: i64,
    output_max: i64,
}

impl PidController {
    pub fn new(gains: PidGains) -> Self {
        Self {
            gains,
            integral: 0.0,
            last_error: 0.0,
            last_time_ms: None,
            output_min: 1,
            output_max: i64::MAX,
        }
    }

    /// Set the output clamp for the next update.
    pub fn set_output_bounds(&mut self, min: i64, max: i64) {
        self.output_min = min;
        self.output_max = max.max(min);
    }

    /// Advance the controller with a new measurement at `now_ms`.
    pub fn update(&mut self, measured: f64, now_ms: i64) -> i64 {
        let error = self.gains.setpoint - measured;
        let dt = match self.last_time_ms {
            Some(last) => (now_ms - last) as f64 / 1000.0,
            None => 1.0,
        };

        self.integral += error * dt;
        let derivative = if dt > 0.0 {
            (error - self.last_error) / dt
        } else {
            0.0
        };

        self.last_error = error;
        self.last_time_ms = Some(now_ms);

        let out = self.gains.kp * error + self.gains.ki * self.integral + self.gains.kd * derivative;
        (out.round() as i64).clamp(self.output_min, self.output_max)
    }

    /// Drop accumulated state, keeping the gains.
    pub fn reset(&mut self) {
        self.integral = 0.0;
        self.last_error = 0.0;
        self.last_time_ms = None;
    }
}
