//! Jitter-escalating Cholesky factorization
//!
//! Kernel matrices built from near-duplicate inputs are positive definite
//! only in exact arithmetic. The factorization retries with a growing
//! diagonal jitter before giving up:
//!
//! ```text
//! K + 0·I, K + ε·I, K + 10ε·I, …, K + 10^(r−1)ε·I
//! ```
//!
//! Copyright (c) 2025 Mohammad Atashi <mohammadaliatashi@icloud.com>

use log::warn;
use nalgebra::{Cholesky, DMatrix, Dyn};
use thiserror::Error;

/// Cholesky failure after all retries
#[derive(Debug, Error, Clone, PartialEq)]
pub enum CholeskyError {
    #[error("Matrix not positive definite after {attempts} attempts (last jitter {jitter:e})")]
    NotPositiveDefinite { attempts: usize, jitter: f64 },

    #[error("Matrix is not square: {rows}×{cols}")]
    NotSquare { rows: usize, cols: usize },
}

/// Factorization together with the jitter that made it succeed
#[derive(Debug, Clone)]
pub struct JitteredCholesky {
    pub factor: Cholesky<f64, Dyn>,
    pub jitter: f64,
}

/// Factor `matrix`, adding `initial_jitter · 10^k` to the diagonal on retry `k`
pub fn jittered_cholesky(
    matrix: &DMatrix<f64>,
    initial_jitter: f64,
    max_retries: usize,
) -> Result<JitteredCholesky, CholeskyError> {
    if !matrix.is_square() {
        return Err(CholeskyError::NotSquare {
            rows: matrix.nrows(),
            cols: matrix.ncols(),
        });
    }

    if let Some(factor) = matrix.clone().cholesky() {
        return Ok(JitteredCholesky { factor, jitter: 0.0 });
    }

    let n = matrix.nrows();
    let mut jitter = initial_jitter;
    for attempt in 0..max_retries {
        let mut shifted = matrix.clone();
        for i in 0..n {
            shifted[(i, i)] += jitter;
        }
        if let Some(factor) = shifted.cholesky() {
            warn!("Cholesky succeeded with jitter {:e} on retry {}", jitter, attempt + 1);
            return Ok(JitteredCholesky { factor, jitter });
        }
        jitter *= 10.0;
    }

    Err(CholeskyError::NotPositiveDefinite {
        attempts: max_retries + 1,
        jitter: jitter / 10.0,
    })
}
