//! Control-affine system interfaces and dynamics estimates
//!
//! ```text
//! ẋ = f(x) + g(x) u,   F(x) = [f(x) g(x)]ᵀ ∈ ℝⁿˣᵖ,   ẋ = F(x)ᵀ ũ,   ũ = [1, u]
//! ```
//!
//! A [`DynamicsEstimate`] carries the mean of `f` and `g` at one state and,
//! for learned models, the covariance of the row-major `vec(F(x))`.
//!
//! Copyright (c) 2025 Mohammad Atashi <mohammadaliatashi@icloud.com>

use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

use crate::control::retrain::{RetrainError, SharedModel};
use crate::ml::batch::Observation;
use crate::ml::gp::{ControlAffineGp, FitReport, GpError, RetrainBudget};

/// Plant or model of the form `ẋ = f(x) + g(x)u`
pub trait ControlAffine {
    fn state_size(&self) -> usize;

    fn ctrl_size(&self) -> usize;

    /// Drift `f(x) ∈ ℝᵖ`
    fn f_func(&self, x: &DVector<f64>) -> DVector<f64>;

    /// Input matrix `g(x) ∈ ℝᵖˣᵐ`
    fn g_func(&self, x: &DVector<f64>) -> DMatrix<f64>;

    /// Map a raw state into the model's canonical range
    fn normalize_state(&self, x: &DVector<f64>) -> DVector<f64> {
        x.clone()
    }

    fn xdot(&self, x: &DVector<f64>, u: &DVector<f64>) -> DVector<f64> {
        self.f_func(x) + self.g_func(x) * u
    }
}

/// `f = 0`, `g = 0`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ZeroDynamics {
    pub state_size: usize,
    pub ctrl_size: usize,
}

impl ZeroDynamics {
    pub fn new(state_size: usize, ctrl_size: usize) -> Self {
        Self { state_size, ctrl_size }
    }
}

impl ControlAffine for ZeroDynamics {
    fn state_size(&self) -> usize {
        self.state_size
    }

    fn ctrl_size(&self) -> usize {
        self.ctrl_size
    }

    fn f_func(&self, _x: &DVector<f64>) -> DVector<f64> {
        DVector::zeros(self.state_size)
    }

    fn g_func(&self, _x: &DVector<f64>) -> DMatrix<f64> {
        DMatrix::zeros(self.state_size, self.ctrl_size)
    }
}

/// Reference trajectory source for tracking constraints
pub trait Planner {
    fn plan(&self, t: f64) -> DVector<f64>;

    fn dot_plan(&self, t: f64) -> DVector<f64>;
}

/// Stationary plan at a fixed goal
#[derive(Debug, Clone, PartialEq)]
pub struct ConstantPlanner {
    pub goal: DVector<f64>,
}

impl Planner for ConstantPlanner {
    fn plan(&self, _t: f64) -> DVector<f64> {
        self.goal.clone()
    }

    fn dot_plan(&self, _t: f64) -> DVector<f64> {
        DVector::zeros(self.goal.len())
    }
}

/// Write-only observer of the control loop
pub trait Visualizer {
    fn set_state_control(
        &mut self,
        x: &DVector<f64>,
        u: &DVector<f64>,
        t: f64,
        predicted_next_state: &DVector<f64>,
        predicted_next_covariance: &DMatrix<f64>,
    );
}

/// Mean dynamics and optional uncertainty at one state
#[derive(Debug, Clone, PartialEq)]
pub struct DynamicsEstimate {
    pub f: DVector<f64>,
    pub g: DMatrix<f64>,
    /// Covariance of row-major `vec(F(x))`, `n·p × n·p`
    pub covariance: Option<DMatrix<f64>>,
}

impl DynamicsEstimate {
    pub fn deterministic(f: DVector<f64>, g: DMatrix<f64>) -> Self {
        Self {
            f,
            g,
            covariance: None,
        }
    }

    pub fn from_model(model: &dyn ControlAffine, x: &DVector<f64>) -> Self {
        let x = model.normalize_state(x);
        Self::deterministic(model.f_func(&x), model.g_func(&x))
    }

    pub fn state_size(&self) -> usize {
        self.f.len()
    }

    pub fn ctrl_size(&self) -> usize {
        self.g.ncols()
    }

    pub fn xdot(&self, u: &DVector<f64>) -> DVector<f64> {
        &self.f + &self.g * u
    }

    /// `ũ ⊗ w`: the weights of `wᵀ(f + g u)` over row-major `vec(F)`
    pub fn directional_weights(&self, w: &DVector<f64>, u: &DVector<f64>) -> DVector<f64> {
        let p = self.state_size();
        let mut weights = DVector::zeros((1 + u.len()) * p);
        for s in 0..p {
            weights[s] = w[s];
        }
        for (j, uj) in u.iter().enumerate() {
            for s in 0..p {
                weights[(1 + j) * p + s] = uj * w[s];
            }
        }
        weights
    }

    /// `Var(wᵀ(f + g u))`, zero for deterministic estimates
    pub fn directional_variance(&self, w: &DVector<f64>, u: &DVector<f64>) -> f64 {
        match &self.covariance {
            Some(covariance) => {
                let weights = self.directional_weights(w, u);
                weights.dot(&(covariance * &weights)).max(0.0)
            }
            None => 0.0,
        }
    }

    /// `Cov(ẋ)` under control `u`
    pub fn xdot_covariance(&self, u: &DVector<f64>) -> DMatrix<f64> {
        let p = self.state_size();
        match &self.covariance {
            Some(covariance) => {
                // M[(c·p + s), s] = ũ_c
                let mut m = DMatrix::zeros(covariance.nrows(), p);
                for s in 0..p {
                    m[(s, s)] = 1.0;
                    for (j, uj) in u.iter().enumerate() {
                        m[((1 + j) * p + s, s)] = *uj;
                    }
                }
                m.tr_mul(&(covariance * &m))
            }
            None => DMatrix::zeros(p, p),
        }
    }
}

/// GP residual model on top of a prior mean model
pub struct LearnedDynamics {
    model: SharedModel,
    mean_model: Box<dyn ControlAffine + Send + Sync>,
}

impl std::fmt::Debug for LearnedDynamics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LearnedDynamics")
            .field("model", &self.model)
            .field("state_size", &self.mean_model.state_size())
            .field("ctrl_size", &self.mean_model.ctrl_size())
            .finish()
    }
}

impl LearnedDynamics {
    pub fn new(gp: ControlAffineGp, mean_model: Box<dyn ControlAffine + Send + Sync>) -> Self {
        Self {
            model: SharedModel::new(gp),
            mean_model,
        }
    }

    /// GP on a zero prior mean
    pub fn with_zero_mean(gp: ControlAffineGp) -> Self {
        let mean = ZeroDynamics::new(gp.state_dim(), gp.ctrl_dim());
        Self::new(gp, Box::new(mean))
    }

    pub fn shared_model(&self) -> &SharedModel {
        &self.model
    }

    pub fn mean_model(&self) -> &dyn ControlAffine {
        self.mean_model.as_ref()
    }

    /// Posterior estimate, or the prior before the first fit
    pub fn estimate(&self, x: &DVector<f64>) -> Result<DynamicsEstimate, RetrainError> {
        let x = self.mean_model.normalize_state(x);
        let query = DMatrix::from_row_slice(1, x.len(), x.as_slice());
        let prediction = self.model.with_model(|gp| {
            if gp.is_fitted() {
                gp.predict(&query, true)
            } else {
                gp.prior_estimate(&query, true)
            }
        })??;

        let mean = prediction.means.first().ok_or(GpError::EmptyTrainingSet)?;
        let m = self.mean_model.ctrl_size();
        let f = mean.row(0).transpose() + self.mean_model.f_func(&x);
        let g = mean.rows(1, m).transpose() + self.mean_model.g_func(&x);
        Ok(DynamicsEstimate {
            f,
            g,
            covariance: prediction.covariance,
        })
    }

    /// Subtract the prior mean model from an observation
    pub fn residual(&self, observation: &Observation) -> Observation {
        match observation {
            Observation::Derivative { x, u, xdot } => {
                let xn = self.mean_model.normalize_state(x);
                Observation::Derivative {
                    x: xn.clone(),
                    u: u.clone(),
                    xdot: xdot - self.mean_model.xdot(&xn, u),
                }
            }
            Observation::Value { x, f, g } => {
                let xn = self.mean_model.normalize_state(x);
                Observation::Value {
                    x: xn.clone(),
                    f: f - self.mean_model.f_func(&xn),
                    g: g - self.mean_model.g_func(&xn),
                }
            }
        }
    }

    /// Refit on the residuals of `observations`, swapping only on success
    pub fn retrain<'a, I>(
        &self,
        observations: I,
        iterations: usize,
        learning_rate: f64,
        budget: &RetrainBudget,
    ) -> Result<FitReport, RetrainError>
    where
        I: IntoIterator<Item = &'a Observation>,
    {
        let residuals: Vec<Observation> =
            observations.into_iter().map(|o| self.residual(o)).collect();
        self.model.retrain(&residuals, iterations, learning_rate, budget)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ml::gp::GpConfig;
    use approx::assert_relative_eq;

    struct Nominal;

    impl ControlAffine for Nominal {
        fn state_size(&self) -> usize {
            2
        }
        fn ctrl_size(&self) -> usize {
            1
        }
        fn f_func(&self, x: &DVector<f64>) -> DVector<f64> {
            DVector::from_vec(vec![x[1], 0.0])
        }
        fn g_func(&self, _x: &DVector<f64>) -> DMatrix<f64> {
            DMatrix::from_column_slice(2, 1, &[0.0, 1.0])
        }
    }

    #[test]
    fn test_directional_variance_matches_weights() {
        let covariance = DMatrix::from_fn(6, 6, |i, j| if i == j { 1.0 + i as f64 } else { 0.1 });
        let estimate = DynamicsEstimate {
            f: DVector::zeros(2),
            g: DMatrix::zeros(2, 2),
            covariance: Some(covariance.clone()),
        };
        let w = DVector::from_vec(vec![1.0, -2.0]);
        let u = DVector::from_vec(vec![0.5, 3.0]);

        let weights = estimate.directional_weights(&w, &u);
        assert_eq!(weights.as_slice(), &[1.0, -2.0, 0.5, -1.0, 3.0, -6.0]);
        assert_relative_eq!(
            estimate.directional_variance(&w, &u),
            weights.dot(&(&covariance * &weights)),
            epsilon = 1e-12
        );

        // wᵀ Cov(ẋ) w equals the directional variance
        let cov_xdot = estimate.xdot_covariance(&u);
        assert_relative_eq!(
            w.dot(&(&cov_xdot * &w)),
            estimate.directional_variance(&w, &u),
            epsilon = 1e-10
        );
    }

    #[test]
    fn test_deterministic_estimate_has_no_variance() {
        let estimate = DynamicsEstimate::from_model(&Nominal, &DVector::from_vec(vec![0.0, 2.0]));
        let u = DVector::from_vec(vec![1.0]);
        assert_eq!(estimate.xdot(&u).as_slice(), &[2.0, 1.0]);
        assert_eq!(estimate.directional_variance(&DVector::from_vec(vec![1.0, 1.0]), &u), 0.0);
    }

    #[test]
    fn test_prior_estimate_adds_mean_model() {
        let gp = ControlAffineGp::new(2, 1, GpConfig::default());
        let learned = LearnedDynamics::new(gp, Box::new(Nominal));
        let x = DVector::from_vec(vec![0.3, -0.4]);
        let estimate = learned.estimate(&x).unwrap();
        assert_relative_eq!(estimate.f, Nominal.f_func(&x), epsilon = 1e-12);
        assert_relative_eq!(estimate.g, Nominal.g_func(&x), epsilon = 1e-12);
        assert!(estimate.covariance.is_some());
    }

    #[test]
    fn test_residual_subtracts_prior() {
        let gp = ControlAffineGp::new(2, 1, GpConfig::default());
        let learned = LearnedDynamics::new(gp, Box::new(Nominal));
        let observation = Observation::Derivative {
            x: DVector::from_vec(vec![0.0, 1.0]),
            u: DVector::from_vec(vec![2.0]),
            xdot: DVector::from_vec(vec![1.5, 2.5]),
        };
        match learned.residual(&observation) {
            Observation::Derivative { xdot, .. } => assert_eq!(xdot.as_slice(), &[0.5, 0.5]),
            other => panic!("unexpected {:?}", other),
        }
    }
}
