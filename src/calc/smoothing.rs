//! Per-register smoothing estimator
//!
//! A scalar constant-model recursive filter. Each register with smoothing
//! enabled owns one [`SmoothingState`]; the first measurement seeds the
//! estimate and passes through unchanged.

use std::collections::HashMap;

use super::RegisterIndex;

/// Default process noise
pub const DEFAULT_Q: f64 = 0.01;

/// Default measurement noise
pub const DEFAULT_R: f64 = 0.1;

/// Process noise, or the default when not finite and strictly positive
pub fn sanitize_q(q: f64) -> f64 {
    if q.is_finite() && q > 0.0 {
        q
    } else {
        DEFAULT_Q
    }
}

/// Measurement noise, or the default when not finite and strictly positive
pub fn sanitize_r(r: f64) -> f64 {
    if r.is_finite() && r > 0.0 {
        r
    } else {
        DEFAULT_R
    }
}

/// Filter state for one register
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SmoothingState {
    pub estimate: f64,
    pub error_covariance: f64,
    pub initialized: bool,
}

impl Default for SmoothingState {
    fn default() -> Self {
        Self {
            estimate: 0.0,
            error_covariance: 1.0,
            initialized: false,
        }
    }
}

impl SmoothingState {
    /// Feed one measurement and return the filtered value
    pub fn update(&mut self, measurement: f64, q: f64, r: f64) -> f64 {
        if !self.initialized {
            self.estimate = measurement;
            self.error_covariance = 1.0;
            self.initialized = true;
            return measurement;
        }

        let q = sanitize_q(q);
        let r = sanitize_r(r);

        let predicted_covariance = self.error_covariance + q;
        let gain = predicted_covariance / (predicted_covariance + r);
        self.estimate += gain * (measurement - self.estimate);
        self.error_covariance = (1.0 - gain) * predicted_covariance;

        self.estimate
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Smoothing states keyed by device and register index
#[derive(Debug, Default, Clone)]
pub struct SmoothingBank {
    states: HashMap<RegisterIndex, SmoothingState>,
}

impl SmoothingBank {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a measurement to the register's state, creating it on first use
    pub fn update(&mut self, index: RegisterIndex, measurement: f64, q: f64, r: f64) -> f64 {
        self.states
            .entry(index)
            .or_default()
            .update(measurement, q, r)
    }

    /// Estimate for a register, if its state has seen a measurement
    pub fn estimate(&self, index: RegisterIndex) -> Option<f64> {
        self.states
            .get(&index)
            .filter(|state| state.initialized)
            .map(|state| state.estimate)
    }

    /// Drop a register's state so the next measurement starts fresh
    pub fn reset(&mut self, index: RegisterIndex) {
        if let Some(state) = self.states.get_mut(&index) {
            state.reset();
        }
    }

    pub fn reset_all(&mut self) {
        self.states.clear();
    }

    pub fn len(&self) -> usize {
        self.states.values().filter(|s| s.initialized).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
