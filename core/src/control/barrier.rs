//! Scalar fields with forward-mode automatic differentiation
//!
//! Barrier functions, tracking functions and goal costs are written once,
//! generic over dual numbers. Evaluating with `f64` gives the value,
//! with [`Dual64`] a directional derivative and with [`HyperDual64`] a
//! second-order mixed partial.
//!
//! # Mathematical Foundations
//!
//! ```text
//! f(z + ε eᵢ)                    = f(z) + ε ∂ᵢf(z)
//! f(z + ε₁ eᵢ + ε₂ eⱼ)           = … + ε₁ε₂ ∂ᵢ∂ⱼf(z)
//! ```
//! `linearize` takes `n` dual passes and `quadratize` takes `n(n+1)/2`
//! hyper-dual passes; both are exact up to rounding.
//!
//! Copyright (c) 2025 Mohammad Atashi <mohammadaliatashi@icloud.com>

use nalgebra::{DMatrix, DVector};
use num_dual::{Dual64, DualNum, HyperDual64};
use serde::{Deserialize, Serialize};

/// Scalar function `ℝᵈ → ℝ` evaluable on any dual number type
pub trait ScalarField {
    fn input_dim(&self) -> usize;

    fn eval<D: DualNum<f64> + Copy>(&self, z: &[D]) -> D;

    fn value(&self, z: &DVector<f64>) -> f64
    where
        Self: Sized,
    {
        self.eval::<f64>(z.as_slice())
    }

    /// `(f(z), ∇f(z))`
    fn linearize(&self, z: &DVector<f64>) -> (f64, DVector<f64>)
    where
        Self: Sized,
    {
        let n = z.len();
        let mut gradient = DVector::zeros(n);
        let mut value = self.value(z);
        for k in 0..n {
            let duals: Vec<Dual64> = (0..n)
                .map(|i| Dual64::new(z[i], if i == k { 1.0 } else { 0.0 }))
                .collect();
            let result = self.eval(&duals);
            value = result.re;
            gradient[k] = result.eps;
        }
        (value, gradient)
    }

    /// `(f(z), ∇f(z), ∇²f(z))`
    fn quadratize(&self, z: &DVector<f64>) -> (f64, DVector<f64>, DMatrix<f64>)
    where
        Self: Sized,
    {
        let n = z.len();
        let mut gradient = DVector::zeros(n);
        let mut hessian = DMatrix::zeros(n, n);
        let mut value = self.value(z);
        for i in 0..n {
            for j in i..n {
                let duals: Vec<HyperDual64> = (0..n)
                    .map(|k| {
                        HyperDual64::new(
                            z[k],
                            if k == i { 1.0 } else { 0.0 },
                            if k == j { 1.0 } else { 0.0 },
                            0.0,
                        )
                    })
                    .collect();
                let result = self.eval(&duals);
                if i == j {
                    value = result.re;
                    gradient[i] = result.eps1;
                }
                hessian[(i, j)] = result.eps1eps2;
                hessian[(j, i)] = result.eps1eps2;
            }
        }
        (value, gradient, hessian)
    }
}

/// `Σₛₜ eₛ Pₛₜ eₜ` with constant weights
fn weighted_square<D: DualNum<f64> + Copy>(e: &[D], weight: &DMatrix<f64>) -> D {
    let mut acc = D::from(0.0);
    for s in 0..e.len() {
        for t in 0..e.len() {
            acc += e[s] * e[t] * weight[(s, t)];
        }
    }
    acc
}

/// Circular keep-out region on two consecutive state coordinates
///
/// `h(x) = ‖x[o..o+2] − c‖² − r²`, safe where `h ≥ 0`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircularObstacle {
    pub center: [f64; 2],
    pub radius: f64,
    /// Index of the first planar coordinate
    pub offset: usize,
    pub state_dim: usize,
}

impl CircularObstacle {
    pub fn new(center: [f64; 2], radius: f64, state_dim: usize) -> Self {
        Self {
            center,
            radius,
            offset: 0,
            state_dim,
        }
    }
}

impl ScalarField for CircularObstacle {
    fn input_dim(&self) -> usize {
        self.state_dim
    }

    fn eval<D: DualNum<f64> + Copy>(&self, z: &[D]) -> D {
        let dx = z[self.offset] - self.center[0];
        let dy = z[self.offset + 1] - self.center[1];
        dx * dx + dy * dy - self.radius * self.radius
    }
}

/// Tracking function `V(x, x_p) = (x − x_p)ᵀ P (x − x_p)` over `z = [x; x_p]`
#[derive(Debug, Clone, PartialEq)]
pub struct QuadraticTracking {
    pub weight: DMatrix<f64>,
}

impl QuadraticTracking {
    pub fn new(weight: DMatrix<f64>) -> Self {
        Self { weight }
    }

    pub fn state_dim(&self) -> usize {
        self.weight.nrows()
    }

    /// Stack `x` and `x_p` into the function's input
    pub fn input(&self, x: &DVector<f64>, x_p: &DVector<f64>) -> DVector<f64> {
        let p = self.state_dim();
        let mut z = DVector::zeros(2 * p);
        z.rows_mut(0, p).copy_from(x);
        z.rows_mut(p, p).copy_from(x_p);
        z
    }
}

impl ScalarField for QuadraticTracking {
    fn input_dim(&self) -> usize {
        2 * self.state_dim()
    }

    fn eval<D: DualNum<f64> + Copy>(&self, z: &[D]) -> D {
        let p = self.state_dim();
        let e: Vec<D> = (0..p).map(|s| z[s] - z[p + s]).collect();
        weighted_square(&e, &self.weight)
    }
}

/// One-step goal cost as a function of the control
///
/// ```text
/// J(u) = (1 − λ)(x⁺ − x_g)ᵀ P (x⁺ − x_g) + λ uᵀ R u,   x⁺ = x + dt (f + g u)
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct GoalCost<'a> {
    pub x: &'a DVector<f64>,
    pub f: &'a DVector<f64>,
    pub g: &'a DMatrix<f64>,
    pub goal: &'a DVector<f64>,
    pub state_weight: &'a DMatrix<f64>,
    pub ctrl_weight: &'a DMatrix<f64>,
    pub lambda: f64,
    pub dt: f64,
}

impl ScalarField for GoalCost<'_> {
    fn input_dim(&self) -> usize {
        self.g.ncols()
    }

    fn eval<D: DualNum<f64> + Copy>(&self, u: &[D]) -> D {
        let p = self.x.len();
        let error: Vec<D> = (0..p)
            .map(|s| {
                let mut e = D::from(self.x[s] + self.dt * self.f[s] - self.goal[s]);
                for (j, uj) in u.iter().enumerate() {
                    e += *uj * (self.dt * self.g[(s, j)]);
                }
                e
            })
            .collect();
        weighted_square(&error, self.state_weight) * (1.0 - self.lambda)
            + weighted_square(u, self.ctrl_weight) * self.lambda
    }
}
