//! Affine-in-control safety and goal constraints
//!
//! # Mathematical Foundations
//!
//! ## Control Barrier Condition
//! ```text
//! ḣ + γ h = ∇hᵀ(f + g u) + γ h ≥ 0
//! ⇔  −∇hᵀg u ≤ ∇hᵀf + γ h          (A u ≤ b)
//! ```
//!
//! ## Chance Tightening
//! With `∇hᵀ(f + g u) = (ũ ⊗ ∇h)ᵀ vec(F)` and `vec(F) ~ N(μ, Σ)`:
//! ```text
//! σ² = (ũ ⊗ ∇h)ᵀ Σ (ũ ⊗ ∇h),   z = √2 · erf⁻¹(1 − 2 p_unsafe)
//! b ← b − z σ
//! ```
//! `σ` is evaluated at a reference control, so the tightened constraint is
//! a linearization of the chance constraint rather than a certificate.
//!
//! ## Control Lyapunov Condition
//! ```text
//! ∇ₓVᵀ(f + g u) + ∇_{x_p}Vᵀ ẋ_p + γ_V V ≤ δ
//! ```
//!
//! Copyright (c) 2025 Mohammad Atashi <mohammadaliatashi@icloud.com>

use nalgebra::DVector;
use serde::{Deserialize, Serialize};
use statrs::function::erf::erf_inv;
use thiserror::Error;

use crate::control::barrier::{QuadraticTracking, ScalarField};
use crate::control::dynamics::DynamicsEstimate;

/// Tolerance used by [`AffineConstraint::is_satisfied`]
pub const SATISFACTION_TOLERANCE: f64 = 1e-8;

/// Constraint construction errors
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConstraintError {
    #[error("Unsafe probability {0} outside (0, 0.5]")]
    InvalidProbability(f64),

    #[error("Dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
}

/// Linear inequality `aᵀu ≤ b` over the control
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AffineConstraint {
    pub name: String,
    pub a: DVector<f64>,
    pub b: f64,
    /// Chance margin `z σ` already subtracted from `b`
    pub margin: f64,
}

impl AffineConstraint {
    /// `aᵀu − b`; non-positive when satisfied
    pub fn residual(&self, u: &DVector<f64>) -> f64 {
        self.a.dot(u) - self.b
    }

    pub fn is_satisfied(&self, u: &DVector<f64>) -> bool {
        self.residual(u) <= SATISFACTION_TOLERANCE * (1.0 + self.b.abs())
    }
}

/// Standard-normal quantile `z` with `P(N(0,1) > z) = p_unsafe`
pub fn chance_quantile(max_unsafe_prob: f64) -> Result<f64, ConstraintError> {
    if !(max_unsafe_prob > 0.0 && max_unsafe_prob <= 0.5) {
        return Err(ConstraintError::InvalidProbability(max_unsafe_prob));
    }
    Ok(std::f64::consts::SQRT_2 * erf_inv(1.0 - 2.0 * max_unsafe_prob))
}

fn check_dims(
    estimate: &DynamicsEstimate,
    x: &DVector<f64>,
    u_ref: &DVector<f64>,
) -> Result<(), ConstraintError> {
    if x.len() != estimate.state_size() {
        return Err(ConstraintError::DimensionMismatch {
            expected: estimate.state_size(),
            actual: x.len(),
        });
    }
    if u_ref.len() != estimate.ctrl_size() {
        return Err(ConstraintError::DimensionMismatch {
            expected: estimate.ctrl_size(),
            actual: u_ref.len(),
        });
    }
    Ok(())
}

/// Chance-tightened barrier constraint for `h`
pub fn barrier_constraint<B: ScalarField>(
    name: &str,
    barrier: &B,
    gamma: f64,
    x: &DVector<f64>,
    estimate: &DynamicsEstimate,
    quantile: f64,
    u_ref: &DVector<f64>,
) -> Result<AffineConstraint, ConstraintError> {
    check_dims(estimate, x, u_ref)?;
    let (h, grad) = barrier.linearize(x);

    let a = -(estimate.g.tr_mul(&grad));
    let sigma = estimate.directional_variance(&grad, u_ref).sqrt();
    let margin = quantile * sigma;
    let b = grad.dot(&estimate.f) + gamma * h - margin;

    Ok(AffineConstraint {
        name: name.to_string(),
        a,
        b,
        margin,
    })
}

/// Chance-tightened tracking constraint `aᵀu ≤ b + δ` for `V(x, x_p)`
///
/// The slack `δ` is not part of the returned constraint; callers add it.
#[allow(clippy::too_many_arguments)]
pub fn lyapunov_constraint(
    name: &str,
    tracking: &QuadraticTracking,
    gamma: f64,
    x: &DVector<f64>,
    x_p: &DVector<f64>,
    xdot_p: &DVector<f64>,
    estimate: &DynamicsEstimate,
    quantile: f64,
    u_ref: &DVector<f64>,
) -> Result<AffineConstraint, ConstraintError> {
    check_dims(estimate, x, u_ref)?;
    let p = x.len();
    if x_p.len() != p || xdot_p.len() != p || tracking.state_dim() != p {
        return Err(ConstraintError::DimensionMismatch {
            expected: p,
            actual: x_p.len(),
        });
    }

    let (v, grad) = tracking.linearize(&tracking.input(x, x_p));
    let grad_x = grad.rows(0, p).into_owned();
    let grad_p = grad.rows(p, p).into_owned();

    let a = estimate.g.tr_mul(&grad_x);
    let sigma = estimate.directional_variance(&grad_x, u_ref).sqrt();
    let margin = quantile * sigma;
    let b = -grad_x.dot(&estimate.f) - grad_p.dot(xdot_p) - gamma * v - margin;

    Ok(AffineConstraint {
        name: name.to_string(),
        a,
        b,
        margin,
    })
}
