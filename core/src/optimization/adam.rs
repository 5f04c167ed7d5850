//! Adam first-order optimizer over flat parameter vectors
//!
//! # Mathematical Foundations
//!
//! ```text
//! mₜ = β₁ mₜ₋₁ + (1 − β₁) gₜ
//! vₜ = β₂ vₜ₋₁ + (1 − β₂) gₜ²
//! θₜ = θₜ₋₁ − η m̂ₜ / (√v̂ₜ + ε),   m̂ₜ = mₜ/(1 − β₁ᵗ), v̂ₜ = vₜ/(1 − β₂ᵗ)
//! ```
//!
//! Copyright (c) 2025 Mohammad Atashi <mohammadaliatashi@icloud.com>

use nalgebra::DVector;
use serde::{Deserialize, Serialize};

/// Adam hyperparameters
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AdamConfig {
    pub learning_rate: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub epsilon: f64,
}

impl Default for AdamConfig {
    fn default() -> Self {
        Self {
            learning_rate: 0.1,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
        }
    }
}

/// Adam moment state
#[derive(Debug, Clone)]
pub struct Adam {
    config: AdamConfig,
    /// First moment estimate
    m: DVector<f64>,
    /// Second moment estimate
    v: DVector<f64>,
    step: i32,
}

impl Adam {
    pub fn new(config: AdamConfig, dim: usize) -> Self {
        Self {
            config,
            m: DVector::zeros(dim),
            v: DVector::zeros(dim),
            step: 0,
        }
    }

    pub fn config(&self) -> &AdamConfig {
        &self.config
    }

    pub fn steps_taken(&self) -> usize {
        self.step as usize
    }

    /// Descend one step along `gradient`, updating `params` in place
    pub fn step(&mut self, params: &mut DVector<f64>, gradient: &DVector<f64>) {
        let AdamConfig {
            learning_rate,
            beta1,
            beta2,
            epsilon,
        } = self.config;

        self.step += 1;
        self.m = &self.m * beta1 + gradient * (1.0 - beta1);
        self.v = &self.v * beta2 + gradient.component_mul(gradient) * (1.0 - beta2);

        let m_correction = 1.0 - beta1.powi(self.step);
        let v_correction = 1.0 - beta2.powi(self.step);

        for i in 0..params.len() {
            let m_hat = self.m[i] / m_correction;
            let v_hat = self.v[i] / v_correction;
            params[i] -= learning_rate * m_hat / (v_hat.sqrt() + epsilon);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_first_step_moves_by_learning_rate() {
        let mut adam = Adam::new(AdamConfig::default(), 2);
        let mut params = DVector::from_vec(vec![1.0, -1.0]);
        adam.step(&mut params, &DVector::from_vec(vec![3.0, -0.5]));
        // bias-corrected first step is ±η regardless of gradient scale
        assert_relative_eq!(params[0], 0.9, epsilon = 1e-6);
        assert_relative_eq!(params[1], -0.9, epsilon = 1e-6);
        assert_eq!(adam.steps_taken(), 1);
    }

    #[test]
    fn test_minimizes_quadratic() {
        let config = AdamConfig {
            learning_rate: 0.05,
            ..AdamConfig::default()
        };
        let mut adam = Adam::new(config, 2);
        let target = DVector::from_vec(vec![2.0, -3.0]);
        let mut params = DVector::zeros(2);
        for _ in 0..2000 {
            let gradient = (&params - &target) * 2.0;
            adam.step(&mut params, &gradient);
        }
        assert_relative_eq!(params, target, epsilon = 1e-2);
    }
}
