//! Heterogeneous Matrix-Variate Kernel
//!
//! This module implements the joint covariance of a batch that mixes
//! state-derivative observations and direct evaluations of the matrix
//! valued function `F(x) = [f(x) g(x)]ᵀ ∈ ℝⁿˣᵖ`.
//!
//! # Mathematical Foundations
//!
//! ## Matrix Normal Prior
//! ```text
//! Cov(F(x)ₐₛ, F(x')ᵦₜ) = k(x, x') Uₐᵦ Vₛₜ
//! ```
//! where `U` (n×n) couples the drift/control channels and `V` (p×p) couples
//! the state outputs. Under row-major flattening the task covariance is
//! `U ⊗ V`.
//!
//! ## Heterogeneous Blocks
//! With `H = blkdiag(ũ₁ᵀ, …, ũ_kᵀ)` built from derivative rows:
//! ```text
//! K_dd = (H₁ (Kxx ⊗ U) H₂ᵀ) ⊗ V
//! K_dv = (H₁ (Kxx ⊗ U))     ⊗ V
//! K_vd = ((Kxx ⊗ U) H₂ᵀ)    ⊗ V
//! K_vv = Kxx ⊗ U ⊗ V
//! ```
//!
//! ## Task Factorization
//! ```text
//! U = W Wᵀ + diag(softplus(ρ))
//! ```
//! keeps every task covariance positive semi-definite for unconstrained
//! parameters `W`, `ρ`.
//!
//! Copyright (c) 2025 Mohammad Atashi <mohammadaliatashi@icloud.com>

use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::data_structures::encoding::EncodingError;
use crate::linalg::operator::{LinearOperator, OperatorError};
use crate::ml::batch::{BatchLayout, DecodedBatch};

/// Kernel evaluation errors
#[derive(Debug, Error, Clone, PartialEq)]
pub enum KernelError {
    #[error("Unsorted batch: derivative row {row} follows value rows starting at {split}")]
    UnsortedBatch { row: usize, split: usize },

    #[error("Invalid mask value {value} at row {row}; expected 0 or 1")]
    InvalidMask { row: usize, value: f64 },

    #[error("Unsupported kernel option: {0}")]
    Unsupported(String),

    #[error("Encoding failure: {0}")]
    Encoding(#[from] EncodingError),

    #[error("Operator failure: {0}")]
    Operator(#[from] OperatorError),
}

/// Numerically stable `log(1 + eˣ)`
pub fn softplus(x: f64) -> f64 {
    if x > 30.0 {
        x
    } else {
        x.exp().ln_1p()
    }
}

/// Derivative of [`softplus`]
pub fn sigmoid(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}

/// Inverse of [`softplus`] for positive arguments
pub fn inverse_softplus(y: f64) -> f64 {
    if y > 30.0 {
        y
    } else {
        y.exp_m1().ln()
    }
}

/// Pairwise squared Euclidean distances between the rows of `x1` and `x2`
pub fn squared_distances(x1: &DMatrix<f64>, x2: &DMatrix<f64>) -> DMatrix<f64> {
    DMatrix::from_fn(x1.nrows(), x2.nrows(), |i, j| {
        (x1.row(i) - x2.row(j)).norm_squared()
    })
}

/// Scaled squared-exponential data kernel
///
/// `k(x, x') = s · exp(-‖x - x'‖² / 2ℓ²)` with `s = softplus(raw_outputscale)`
/// and `ℓ = softplus(raw_lengthscale)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RbfKernel {
    pub raw_lengthscale: f64,
    pub raw_outputscale: f64,
}

impl Default for RbfKernel {
    fn default() -> Self {
        Self {
            raw_lengthscale: 0.0,
            raw_outputscale: 0.0,
        }
    }
}

impl RbfKernel {
    pub fn lengthscale(&self) -> f64 {
        softplus(self.raw_lengthscale)
    }

    pub fn outputscale(&self) -> f64 {
        softplus(self.raw_outputscale)
    }

    /// Kernel matrix from precomputed squared distances
    pub fn from_distances(&self, sq_dist: &DMatrix<f64>) -> DMatrix<f64> {
        let ell = self.lengthscale();
        let scale = self.outputscale();
        sq_dist.map(|d| scale * (-0.5 * d / (ell * ell)).exp())
    }

    pub fn matrix(&self, x1: &DMatrix<f64>, x2: &DMatrix<f64>) -> DMatrix<f64> {
        self.from_distances(&squared_distances(x1, x2))
    }

    /// `∂K/∂raw_lengthscale`
    pub fn lengthscale_gradient(&self, kxx: &DMatrix<f64>, sq_dist: &DMatrix<f64>) -> DMatrix<f64> {
        let ell = self.lengthscale();
        let chain = sigmoid(self.raw_lengthscale);
        kxx.zip_map(sq_dist, |k, d| k * d / (ell * ell * ell) * chain)
    }

    /// `∂K/∂raw_outputscale`
    pub fn outputscale_gradient(&self, kxx: &DMatrix<f64>) -> DMatrix<f64> {
        let chain = sigmoid(self.raw_outputscale) / self.outputscale();
        kxx * chain
    }
}

/// Low-rank-plus-diagonal task covariance `W Wᵀ + diag(softplus(ρ))`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskCovariance {
    pub factor: DMatrix<f64>,
    pub raw_var: DVector<f64>,
}

impl TaskCovariance {
    pub fn new(factor: DMatrix<f64>, raw_var: DVector<f64>) -> Self {
        Self { factor, raw_var }
    }

    pub fn size(&self) -> usize {
        self.raw_var.len()
    }

    pub fn rank(&self) -> usize {
        self.factor.ncols()
    }

    pub fn covar_matrix(&self) -> DMatrix<f64> {
        let mut covar = &self.factor * self.factor.transpose();
        for i in 0..self.size() {
            covar[(i, i)] += softplus(self.raw_var[i]);
        }
        covar
    }

    /// Number of free parameters (`factor` entries then `raw_var` entries)
    pub fn num_parameters(&self) -> usize {
        self.factor.len() + self.raw_var.len()
    }

    /// `∂(W Wᵀ + diag(softplus(ρ)))/∂θ` for parameter `index`
    ///
    /// Indices `0..n·r` address `W` row-major, the remainder address `ρ`.
    pub fn parameter_gradient(&self, index: usize) -> DMatrix<f64> {
        let n = self.size();
        let rank = self.rank();
        let mut grad = DMatrix::zeros(n, n);
        if index < n * rank {
            let (a, r) = (index / rank, index % rank);
            for b in 0..n {
                grad[(a, b)] += self.factor[(b, r)];
                grad[(b, a)] += self.factor[(b, r)];
            }
        } else {
            let i = index - n * rank;
            grad[(i, i)] = sigmoid(self.raw_var[i]);
        }
        grad
    }
}

/// Task covariance pair `(U, V)` with joint covariance `U ⊗ V`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatrixVariateCovariance {
    /// Channel covariance `U` over drift plus control inputs
    pub ctrl: TaskCovariance,
    /// Output covariance `V` over state dimensions
    pub state: TaskCovariance,
}

impl MatrixVariateCovariance {
    /// Joint task covariance as a lazy Kronecker operator
    pub fn operator(&self) -> LinearOperator {
        LinearOperator::kron(
            LinearOperator::dense(self.ctrl.covar_matrix()),
            LinearOperator::dense(self.state.covar_matrix()),
        )
    }

    pub fn matshape(&self) -> (usize, usize) {
        (self.ctrl.size(), self.state.size())
    }
}

/// Kernel hyperparameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KernelHyperparameters {
    pub data: RbfKernel,
    pub task: MatrixVariateCovariance,
}

/// Result of a kernel call
#[derive(Debug, Clone)]
pub enum KernelEvaluation {
    Full(LinearOperator),
    Diagonal(DVector<f64>),
}

/// Joint covariance over heterogeneous derivative/value batches
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeterogeneousKernel {
    layout: BatchLayout,
}

impl HeterogeneousKernel {
    pub fn new(layout: BatchLayout) -> Self {
        Self { layout }
    }

    pub fn layout(&self) -> &BatchLayout {
        &self.layout
    }

    /// Flattened output length produced for an encoded batch
    pub fn num_outputs(&self, encoded: &DMatrix<f64>) -> Result<usize, KernelError> {
        let batch = self.layout.decode(encoded)?;
        Ok(batch.output_len(self.layout.state_dim(), self.layout.channels()))
    }

    /// Evaluate the kernel on two encoded batches
    pub fn forward(
        &self,
        hyper: &KernelHyperparameters,
        encoded1: &DMatrix<f64>,
        encoded2: &DMatrix<f64>,
        diag: bool,
        last_dim_is_batch: bool,
    ) -> Result<KernelEvaluation, KernelError> {
        if last_dim_is_batch {
            return Err(KernelError::Unsupported(
                "the heterogeneous matrix-variate kernel does not accept last_dim_is_batch"
                    .to_string(),
            ));
        }

        let batch1 = self.layout.decode(encoded1)?;
        let batch2 = self.layout.decode(encoded2)?;
        let covar = self.covariance(hyper, &batch1, &batch2)?;
        if diag {
            Ok(KernelEvaluation::Diagonal(covar.diagonal()))
        } else {
            Ok(KernelEvaluation::Full(covar))
        }
    }

    /// Lazy joint covariance between two decoded batches
    pub fn covariance(
        &self,
        hyper: &KernelHyperparameters,
        batch1: &DecodedBatch,
        batch2: &DecodedBatch,
    ) -> Result<LinearOperator, KernelError> {
        let kxx = hyper.data.matrix(&batch1.x, &batch2.x);
        let u = hyper.task.ctrl.covar_matrix();
        let v = hyper.task.state.covar_matrix();
        self.assemble(batch1, batch2, &kxx, &u, &v)
    }

    /// Predictive-variance diagonal of a single batch
    pub fn covariance_diag(
        &self,
        hyper: &KernelHyperparameters,
        batch: &DecodedBatch,
    ) -> Result<DVector<f64>, KernelError> {
        Ok(self.covariance(hyper, batch, batch)?.diagonal())
    }

    /// Assemble the four heterogeneous blocks from explicit factors
    ///
    /// The result is linear in each of `kxx`, `u` and `v`, so passing a
    /// factor derivative yields the matching covariance derivative.
    pub fn assemble(
        &self,
        batch1: &DecodedBatch,
        batch2: &DecodedBatch,
        kxx: &DMatrix<f64>,
        u: &DMatrix<f64>,
        v: &DMatrix<f64>,
    ) -> Result<LinearOperator, KernelError> {
        let (k1, k2) = (batch1.split, batch2.split);
        let (n1, n2) = (batch1.len(), batch2.len());

        let data_block = |rows: std::ops::Range<usize>, cols: std::ops::Range<usize>| {
            LinearOperator::kron(
                LinearOperator::dense(
                    kxx.view((rows.start, cols.start), (rows.len(), cols.len()))
                        .into_owned(),
                ),
                LinearOperator::dense(u.clone()),
            )
        };
        let state = || LinearOperator::dense(v.clone());

        let h1 = selection_operator(batch1)?;
        let h2t = selection_operator(batch2)?.transpose();

        let mut row_blocks = Vec::with_capacity(2);
        if k1 > 0 {
            let mut cols = Vec::with_capacity(2);
            if k2 > 0 {
                let weighted = h1.clone().matmul(data_block(0..k1, 0..k2))?.matmul(h2t.clone())?;
                cols.push(LinearOperator::kron(weighted, state()));
            }
            if n2 > k2 {
                let weighted = h1.clone().matmul(data_block(0..k1, k2..n2))?;
                cols.push(LinearOperator::kron(weighted, state()));
            }
            row_blocks.push(LinearOperator::hcat(cols)?);
        }
        if n1 > k1 {
            let mut cols = Vec::with_capacity(2);
            if k2 > 0 {
                let weighted = data_block(k1..n1, 0..k2).matmul(h2t.clone())?;
                cols.push(LinearOperator::kron(weighted, state()));
            }
            if n2 > k2 {
                cols.push(LinearOperator::kron(data_block(k1..n1, k2..n2), state()));
            }
            row_blocks.push(LinearOperator::hcat(cols)?);
        }

        Ok(LinearOperator::vcat(row_blocks)?)
    }
}

/// `H = blkdiag(ũ₁ᵀ, …, ũ_kᵀ)` over the derivative rows of a batch
fn selection_operator(batch: &DecodedBatch) -> Result<LinearOperator, OperatorError> {
    let blocks = (0..batch.split)
        .map(|i| batch.aux.rows(i, 1).into_owned())
        .collect();
    LinearOperator::block_diag(blocks)
}
