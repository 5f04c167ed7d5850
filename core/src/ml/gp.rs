//! Control-Affine Gaussian Process Regression Engine
//!
//! This module learns the control-affine dynamics `ẋ = f(x) + g(x)u` from a
//! stream of heterogeneous observations with a single matrix-variate GP
//! prior over `F(x) = [f(x) g(x)]ᵀ`.
//!
//! # Mathematical Foundations
//!
//! ## Exact Marginal Likelihood
//! ```text
//! −log p(y | θ) = ½ rᵀ K⁻¹ r + ½ log|K| + (N/2) log 2π,   r = y − m(θ)
//! ```
//! The optimizer descends the negative log-likelihood divided by `N`.
//!
//! ## Hyperparameter Gradients
//! ```text
//! ∂/∂θ = −½ tr((ααᵀ − K⁻¹) ∂K/∂θ),   α = K⁻¹ r
//! ∂/∂m = −Jᵀ α
//! ```
//! The kernel is multilinear in `(Kxx, U, V)`, so `∂K/∂θ` is the same block
//! assembly with one factor replaced by its derivative.
//!
//! ## Posterior
//! ```text
//! μ* = m* + K*ₓ α
//! Σ* = K** − K*ₓ K⁻¹ Kₓ*
//! ```
//!
//! Copyright (c) 2025 Mohammad Atashi <mohammadaliatashi@icloud.com>

use std::f64::consts::PI;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, info};
use nalgebra::{DMatrix, DVector};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Normal};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::data_structures::encoding::EncodingError;
use crate::linalg::cholesky::{jittered_cholesky, CholeskyError, JitteredCholesky};
use crate::ml::batch::{BatchLayout, DecodedBatch, Observation};
use crate::ml::kernel::{
    squared_distances, HeterogeneousKernel, KernelError, KernelHyperparameters,
    MatrixVariateCovariance, RbfKernel, TaskCovariance,
};
use crate::ml::mean::HeterogeneousMean;
use crate::optimization::adam::{Adam, AdamConfig};

/// GP engine errors
#[derive(Debug, Error, Clone, PartialEq)]
pub enum GpError {
    #[error("Model has not been fitted")]
    NotFitted,

    #[error("Training diverged at iteration {iteration}: {reason}")]
    TrainingDiverged { iteration: usize, reason: String },

    #[error("Training cancelled at iteration {iteration}")]
    Cancelled { iteration: usize },

    #[error("Empty training set")]
    EmptyTrainingSet,

    #[error("Invalid input dimensions: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("Kernel failure: {0}")]
    Kernel(#[from] KernelError),

    #[error("Encoding failure: {0}")]
    Encoding(#[from] EncodingError),

    #[error("Posterior factorization failed: {0}")]
    Factorization(#[from] CholeskyError),
}

/// GP engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GpConfig {
    /// Default optimizer iterations per fit
    pub iterations: usize,
    /// Adam learning rate
    pub learning_rate: f64,
    /// Fixed observation noise variance
    pub noise_variance: f64,
    /// Rank of the low-rank part of each task covariance
    pub task_rank: usize,
    /// Jitter of the first Cholesky retry
    pub initial_jitter: f64,
    /// Cholesky retries, each with ten times the previous jitter
    pub max_jitter_retries: usize,
    /// Seed for task-factor initialization
    pub seed: u64,
}

impl Default for GpConfig {
    fn default() -> Self {
        Self {
            iterations: 50,
            learning_rate: 0.1,
            noise_variance: 1e-6,
            task_rank: 1,
            initial_jitter: 1e-8,
            max_jitter_retries: 3,
            seed: 0,
        }
    }
}

/// Complete set of GP hyperparameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hyperparameters {
    pub kernel: KernelHyperparameters,
    pub mean: HeterogeneousMean,
}

impl Hyperparameters {
    /// Softplus-zero scales, random-normal task factors, zero mean
    pub fn initial(channels: usize, state_dim: usize, rank: usize, seed: u64) -> Self {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let mut factor = |rows: usize| -> DMatrix<f64> {
            match Normal::new(0.0, 1.0) {
                Ok(normal) => DMatrix::from_fn(rows, rank, |_, _| normal.sample(&mut rng)),
                Err(_) => DMatrix::zeros(rows, rank),
            }
        };
        let ctrl_factor = factor(channels);
        let state_factor = factor(state_dim);

        Self {
            kernel: KernelHyperparameters {
                data: RbfKernel::default(),
                task: MatrixVariateCovariance {
                    ctrl: TaskCovariance::new(ctrl_factor, DVector::zeros(channels)),
                    state: TaskCovariance::new(state_factor, DVector::zeros(state_dim)),
                },
            },
            mean: HeterogeneousMean::zeros(channels, state_dim),
        }
    }

    pub fn num_kernel_parameters(&self) -> usize {
        2 + self.kernel.task.ctrl.num_parameters() + self.kernel.task.state.num_parameters()
    }

    pub fn num_parameters(&self) -> usize {
        self.num_kernel_parameters() + self.mean.num_parameters()
    }

    /// Flatten as `[ℓ, s, U factor, U var, V factor, V var, mean]`
    pub fn to_vector(&self) -> DVector<f64> {
        let mut values = Vec::with_capacity(self.num_parameters());
        values.push(self.kernel.data.raw_lengthscale);
        values.push(self.kernel.data.raw_outputscale);
        for task in [&self.kernel.task.ctrl, &self.kernel.task.state] {
            values.extend(task.factor.transpose().iter().copied());
            values.extend(task.raw_var.iter().copied());
        }
        values.extend(self.mean.to_vec());
        DVector::from_vec(values)
    }

    /// Inverse of [`Hyperparameters::to_vector`]
    pub fn set_from_vector(&mut self, values: &DVector<f64>) {
        let mut offset = 0;
        self.kernel.data.raw_lengthscale = values[0];
        self.kernel.data.raw_outputscale = values[1];
        offset += 2;

        for task in [&mut self.kernel.task.ctrl, &mut self.kernel.task.state] {
            let (rows, rank) = task.factor.shape();
            let block = &values.as_slice()[offset..offset + rows * rank];
            task.factor = DMatrix::from_row_slice(rows, rank, block);
            offset += rows * rank;
            for i in 0..rows {
                task.raw_var[i] = values[offset + i];
            }
            offset += rows;
        }

        let count = self.mean.num_parameters();
        self.mean.set_from_slice(&values.as_slice()[offset..offset + count]);
    }
}

/// Deadline and cooperative cancellation for a fit
#[derive(Debug, Clone, Default)]
pub struct RetrainBudget {
    pub deadline: Option<Instant>,
    pub cancel: Option<Arc<AtomicBool>>,
}

impl RetrainBudget {
    pub fn unlimited() -> Self {
        Self::default()
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            deadline: Some(Instant::now() + timeout),
            cancel: None,
        }
    }

    pub fn with_cancel(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancel = Some(flag);
        self
    }

    pub fn is_exhausted(&self) -> bool {
        let cancelled = self
            .cancel
            .as_ref()
            .map_or(false, |flag| flag.load(Ordering::Relaxed));
        let expired = self.deadline.map_or(false, |d| Instant::now() >= d);
        cancelled || expired
    }
}

/// Summary of a successful fit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FitReport {
    pub model_id: Uuid,
    pub final_loss: f64,
    pub iterations: usize,
    pub training_points: usize,
    pub elapsed: Duration,
    pub lengthscale: f64,
}

/// Posterior predictive distribution at a set of states
#[derive(Debug, Clone)]
pub struct Prediction {
    /// Per-point `n×p` means: row 0 is `f(x)ᵀ`, row `1+j` is column `j` of `g(x)`
    pub means: Vec<DMatrix<f64>>,
    /// Marginal variances of the flattened outputs
    pub variance: DVector<f64>,
    /// Full joint covariance of the flattened outputs, when requested
    pub covariance: Option<DMatrix<f64>>,
}

/// Conditioned GP state, replaced wholesale by each successful fit
#[derive(Debug, Clone)]
struct Posterior {
    batch: DecodedBatch,
    training_points: usize,
    cholesky: JitteredCholesky,
    alpha: DVector<f64>,
}

/// Loss, gradient and factorization at one hyperparameter setting
struct Objective {
    loss: f64,
    gradient: DVector<f64>,
}

/// One kernel hyperparameter direction
#[derive(Debug, Clone, Copy)]
enum Direction {
    Lengthscale,
    Outputscale,
    Ctrl(usize),
    State(usize),
}

/// Heterogeneous matrix-variate GP over control-affine dynamics
#[derive(Debug, Clone)]
pub struct ControlAffineGp {
    config: GpConfig,
    kernel: HeterogeneousKernel,
    hyper: Hyperparameters,
    posterior: Option<Posterior>,
    model_id: Option<Uuid>,
}

impl ControlAffineGp {
    pub fn new(state_dim: usize, ctrl_dim: usize, config: GpConfig) -> Self {
        let layout = BatchLayout::new(state_dim, ctrl_dim);
        let hyper = Hyperparameters::initial(
            layout.channels(),
            state_dim,
            config.task_rank.max(1),
            config.seed,
        );
        Self {
            config,
            kernel: HeterogeneousKernel::new(layout),
            hyper,
            posterior: None,
            model_id: None,
        }
    }

    pub fn config(&self) -> &GpConfig {
        &self.config
    }

    pub fn layout(&self) -> &BatchLayout {
        self.kernel.layout()
    }

    pub fn state_dim(&self) -> usize {
        self.layout().state_dim()
    }

    pub fn ctrl_dim(&self) -> usize {
        self.layout().ctrl_dim()
    }

    pub fn hyperparameters(&self) -> &Hyperparameters {
        &self.hyper
    }

    pub fn is_fitted(&self) -> bool {
        self.posterior.is_some()
    }

    pub fn model_id(&self) -> Option<Uuid> {
        self.model_id
    }

    pub fn training_points(&self) -> usize {
        self.posterior.as_ref().map_or(0, |p| p.training_points)
    }

    /// Fit to derivative observations `ẋᵢ = f(xᵢ) + g(xᵢ)uᵢ`
    pub fn fit(
        &mut self,
        x: &DMatrix<f64>,
        u: &DMatrix<f64>,
        xdot: &DMatrix<f64>,
        iterations: usize,
        learning_rate: f64,
    ) -> Result<FitReport, GpError> {
        self.check_columns(x.ncols(), self.state_dim())?;
        self.check_columns(u.ncols(), self.ctrl_dim())?;
        self.check_columns(xdot.ncols(), self.state_dim())?;
        if xdot.nrows() != x.nrows() {
            return Err(GpError::DimensionMismatch {
                expected: x.nrows(),
                actual: xdot.nrows(),
            });
        }

        let encoded = self.layout().encode_derivative(x, u)?;
        let targets = DVector::from_column_slice(xdot.transpose().as_slice());
        self.fit_encoded(&encoded, &targets, iterations, learning_rate, &RetrainBudget::unlimited())
    }

    /// Fit to mixed derivative/value observations
    pub fn fit_observations(
        &mut self,
        observations: &[Observation],
        iterations: usize,
        learning_rate: f64,
    ) -> Result<FitReport, GpError> {
        self.fit_with_budget(observations, iterations, learning_rate, &RetrainBudget::unlimited())
    }

    /// Fit under a deadline/cancellation budget checked every iteration
    pub fn fit_with_budget(
        &mut self,
        observations: &[Observation],
        iterations: usize,
        learning_rate: f64,
        budget: &RetrainBudget,
    ) -> Result<FitReport, GpError> {
        let (encoded, targets) = self.layout().encode_observations(observations)?;
        self.fit_encoded(&encoded, &targets, iterations, learning_rate, budget)
    }

    fn fit_encoded(
        &mut self,
        encoded: &DMatrix<f64>,
        targets: &DVector<f64>,
        iterations: usize,
        learning_rate: f64,
        budget: &RetrainBudget,
    ) -> Result<FitReport, GpError> {
        let start = Instant::now();
        let batch = self.layout().decode(encoded)?;
        if batch.is_empty() {
            return Err(GpError::EmptyTrainingSet);
        }
        let expected = batch.output_len(self.state_dim(), self.layout().channels());
        if targets.len() != expected {
            return Err(GpError::DimensionMismatch {
                expected,
                actual: targets.len(),
            });
        }

        // Warm start; self is untouched until the whole fit succeeds
        let mut candidate = self.hyper.clone();
        let mut params = candidate.to_vector();
        let mut adam = Adam::new(
            AdamConfig {
                learning_rate,
                ..AdamConfig::default()
            },
            params.len(),
        );

        for iteration in 0..iterations {
            if budget.is_exhausted() {
                return Err(GpError::Cancelled { iteration });
            }

            let objective = self
                .objective(&candidate, &batch, targets)
                .map_err(|e| diverged(iteration, e))?;
            if !objective.loss.is_finite() || objective.gradient.iter().any(|g| !g.is_finite()) {
                return Err(GpError::TrainingDiverged {
                    iteration,
                    reason: format!("non-finite loss {}", objective.loss),
                });
            }

            adam.step(&mut params, &objective.gradient);
            candidate.set_from_vector(&params);
            debug!("GP iteration {}: loss {:.6}", iteration, objective.loss);
        }

        let (cholesky, alpha, final_loss) = self
            .condition(&candidate, &batch, targets)
            .map_err(|e| diverged(iterations, e))?;
        if !final_loss.is_finite() {
            return Err(GpError::TrainingDiverged {
                iteration: iterations,
                reason: format!("non-finite loss {}", final_loss),
            });
        }

        let training_points = batch.len();
        let model_id = Uuid::new_v4();
        self.hyper = candidate;
        self.posterior = Some(Posterior {
            batch,
            training_points,
            cholesky,
            alpha,
        });
        self.model_id = Some(model_id);

        let report = FitReport {
            model_id,
            final_loss,
            iterations,
            training_points,
            elapsed: start.elapsed(),
            lengthscale: self.hyper.kernel.data.lengthscale(),
        };
        info!(
            "GP fit {}: {} points, {} iterations, loss {:.6}, lengthscale {:.4}",
            report.model_id,
            report.training_points,
            report.iterations,
            report.final_loss,
            report.lengthscale
        );
        Ok(report)
    }

    /// Training covariance with observation noise
    fn training_covariance(
        &self,
        hyper: &Hyperparameters,
        batch: &DecodedBatch,
    ) -> Result<DMatrix<f64>, GpError> {
        let mut k = self.kernel.covariance(&hyper.kernel, batch, batch)?.evaluate();
        for i in 0..k.nrows() {
            k[(i, i)] += self.config.noise_variance;
        }
        Ok(k)
    }

    /// Factorize, solve for `α` and evaluate the normalized loss
    fn condition(
        &self,
        hyper: &Hyperparameters,
        batch: &DecodedBatch,
        targets: &DVector<f64>,
    ) -> Result<(JitteredCholesky, DVector<f64>, f64), GpError> {
        let k = self.training_covariance(hyper, batch)?;
        let cholesky =
            jittered_cholesky(&k, self.config.initial_jitter, self.config.max_jitter_retries)?;
        let residual = targets - hyper.mean.forward(batch);
        let alpha = cholesky.factor.solve(&residual);

        let n = targets.len() as f64;
        let log_det: f64 =
            2.0 * cholesky.factor.l_dirty().diagonal().iter().map(|d| d.ln()).sum::<f64>();
        let loss = 0.5 * (residual.dot(&alpha) + log_det + n * (2.0 * PI).ln()) / n;
        Ok((cholesky, alpha, loss))
    }

    fn objective(
        &self,
        hyper: &Hyperparameters,
        batch: &DecodedBatch,
        targets: &DVector<f64>,
    ) -> Result<Objective, GpError> {
        let (cholesky, alpha, loss) = self.condition(hyper, batch, targets)?;
        let n = targets.len() as f64;

        // W = ααᵀ − K⁻¹
        let weights = &alpha * alpha.transpose() - cholesky.factor.inverse();

        let data = &hyper.kernel.data;
        let sq_dist = squared_distances(&batch.x, &batch.x);
        let kxx = data.from_distances(&sq_dist);
        let u = hyper.kernel.task.ctrl.covar_matrix();
        let v = hyper.kernel.task.state.covar_matrix();

        let mut directions = vec![Direction::Lengthscale, Direction::Outputscale];
        directions.extend((0..hyper.kernel.task.ctrl.num_parameters()).map(Direction::Ctrl));
        directions.extend((0..hyper.kernel.task.state.num_parameters()).map(Direction::State));

        let kernel_gradient: Vec<f64> = directions
            .par_iter()
            .map(|direction| -> Result<f64, KernelError> {
                let dk = match *direction {
                    Direction::Lengthscale => {
                        let dkxx = data.lengthscale_gradient(&kxx, &sq_dist);
                        self.kernel.assemble(batch, batch, &dkxx, &u, &v)?
                    }
                    Direction::Outputscale => {
                        let dkxx = data.outputscale_gradient(&kxx);
                        self.kernel.assemble(batch, batch, &dkxx, &u, &v)?
                    }
                    Direction::Ctrl(i) => {
                        let du = hyper.kernel.task.ctrl.parameter_gradient(i);
                        self.kernel.assemble(batch, batch, &kxx, &du, &v)?
                    }
                    Direction::State(i) => {
                        let dv = hyper.kernel.task.state.parameter_gradient(i);
                        self.kernel.assemble(batch, batch, &kxx, &u, &dv)?
                    }
                };
                Ok(-0.5 * weights.dot(&dk.evaluate()) / n)
            })
            .collect::<Result<Vec<f64>, KernelError>>()?;

        let mean_gradient = -hyper.mean.jacobian_transpose_apply(batch, &alpha) / n;

        let mut gradient = DVector::zeros(hyper.num_parameters());
        for (i, g) in kernel_gradient.iter().enumerate() {
            gradient[i] = *g;
        }
        gradient
            .rows_mut(hyper.num_kernel_parameters(), mean_gradient.len())
            .copy_from(&mean_gradient);

        Ok(Objective { loss, gradient })
    }

    /// Posterior prediction of `F(x)` at the rows of `x`
    pub fn predict(
        &self,
        x: &DMatrix<f64>,
        return_covariance: bool,
    ) -> Result<Prediction, GpError> {
        let posterior = self.posterior.as_ref().ok_or(GpError::NotFitted)?;
        self.check_columns(x.ncols(), self.state_dim())?;

        let test = self.layout().decode(&self.layout().encode_values(x)?)?;
        let hyper = &self.hyper.kernel;
        let cross = self
            .kernel
            .covariance(hyper, &test, &posterior.batch)?
            .evaluate();

        let mean = self.hyper.mean.forward(&test) + &cross * &posterior.alpha;

        // v = L⁻¹ Kₓ*
        let l = posterior.cholesky.factor.l();
        let reduced = l
            .solve_lower_triangular(&cross.transpose())
            .ok_or(GpError::Factorization(CholeskyError::NotPositiveDefinite {
                attempts: 0,
                jitter: posterior.cholesky.jitter,
            }))?;

        let (variance, covariance) = if return_covariance {
            let prior = self.kernel.covariance(hyper, &test, &test)?.evaluate();
            let covariance = prior - reduced.tr_mul(&reduced);
            (covariance.diagonal(), Some(covariance))
        } else {
            let prior = self.kernel.covariance_diag(hyper, &test)?;
            let explained = DVector::from_iterator(
                reduced.ncols(),
                reduced.column_iter().map(|c| c.norm_squared()),
            );
            (prior - explained, None)
        };

        Ok(Prediction {
            means: self.split_means(&mean, x.nrows()),
            variance,
            covariance,
        })
    }

    /// Predictive distribution under the current hyperparameters and no data
    pub fn prior_estimate(
        &self,
        x: &DMatrix<f64>,
        return_covariance: bool,
    ) -> Result<Prediction, GpError> {
        self.check_columns(x.ncols(), self.state_dim())?;
        let test = self.layout().decode(&self.layout().encode_values(x)?)?;
        let hyper = &self.hyper.kernel;
        let mean = self.hyper.mean.forward(&test);

        let (variance, covariance) = if return_covariance {
            let covariance = self.kernel.covariance(hyper, &test, &test)?.evaluate();
            (covariance.diagonal(), Some(covariance))
        } else {
            (self.kernel.covariance_diag(hyper, &test)?, None)
        };

        Ok(Prediction {
            means: self.split_means(&mean, x.nrows()),
            variance,
            covariance,
        })
    }

    fn split_means(&self, flat: &DVector<f64>, points: usize) -> Vec<DMatrix<f64>> {
        let n = self.layout().channels();
        let p = self.state_dim();
        (0..points)
            .map(|i| DMatrix::from_row_slice(n, p, &flat.as_slice()[i * n * p..(i + 1) * n * p]))
            .collect()
    }

    fn check_columns(&self, actual: usize, expected: usize) -> Result<(), GpError> {
        if actual != expected {
            return Err(GpError::DimensionMismatch { expected, actual });
        }
        Ok(())
    }
}

fn diverged(iteration: usize, error: GpError) -> GpError {
    match error {
        GpError::Factorization(e) => GpError::TrainingDiverged {
            iteration,
            reason: e.to_string(),
        },
        other => other,
    }
}
