//! Heterogeneous constant mean
//!
//! Every entry of `F(x) ∈ ℝⁿˣᵖ` carries its own constant prior mean `M`.
//! A derivative row sees `ũᵀM`, a value row sees `vec(M)` (row-major).
//!
//! Copyright (c) 2025 Mohammad Atashi <mohammadaliatashi@icloud.com>

use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

use crate::ml::batch::DecodedBatch;

/// Per-task constant mean
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeterogeneousMean {
    /// Constants, one per (channel, state) pair
    pub constants: DMatrix<f64>,
}

impl HeterogeneousMean {
    pub fn zeros(channels: usize, state_dim: usize) -> Self {
        Self {
            constants: DMatrix::zeros(channels, state_dim),
        }
    }

    pub fn num_parameters(&self) -> usize {
        self.constants.len()
    }

    /// Flattened prior mean of a decoded batch
    pub fn forward(&self, batch: &DecodedBatch) -> DVector<f64> {
        let (n, p) = self.constants.shape();
        let mut out = DVector::zeros(batch.output_len(p, n));
        let mut offset = 0;

        for i in 0..batch.split {
            let aux = batch.aux.row(i);
            for s in 0..p {
                out[offset + s] = (0..n).map(|c| aux[c] * self.constants[(c, s)]).sum();
            }
            offset += p;
        }
        for _ in batch.split..batch.len() {
            for c in 0..n {
                for s in 0..p {
                    out[offset + c * p + s] = self.constants[(c, s)];
                }
            }
            offset += n * p;
        }
        out
    }

    /// `Jᵀ r` where `J = ∂forward/∂vec(M)`; the result is row-major over `M`
    pub fn jacobian_transpose_apply(&self, batch: &DecodedBatch, r: &DVector<f64>) -> DVector<f64> {
        let (n, p) = self.constants.shape();
        let mut grad = DVector::zeros(n * p);
        let mut offset = 0;

        for i in 0..batch.split {
            let aux = batch.aux.row(i);
            for c in 0..n {
                for s in 0..p {
                    grad[c * p + s] += aux[c] * r[offset + s];
                }
            }
            offset += p;
        }
        for _ in batch.split..batch.len() {
            for k in 0..n * p {
                grad[k] += r[offset + k];
            }
            offset += n * p;
        }
        grad
    }

    /// Overwrite the constants from a row-major parameter slice
    pub fn set_from_slice(&mut self, values: &[f64]) {
        let (n, p) = self.constants.shape();
        self.constants = DMatrix::from_row_slice(n, p, values);
    }

    /// Constants as a row-major vector
    pub fn to_vec(&self) -> Vec<f64> {
        self.constants.transpose().as_slice().to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn batch() -> DecodedBatch {
        DecodedBatch {
            x: DMatrix::zeros(3, 2),
            aux: DMatrix::from_row_slice(3, 2, &[1.0, 2.0, 1.0, -1.0, 0.0, 0.0]),
            split: 2,
        }
    }

    #[test]
    fn test_forward_layout() {
        let mean = HeterogeneousMean {
            constants: DMatrix::from_row_slice(2, 2, &[1.0, 2.0, 3.0, 4.0]),
        };
        let out = mean.forward(&batch());
        // [1,2]ᵀM, [1,-1]ᵀM, vec(M)
        assert_eq!(out.as_slice(), &[7.0, 10.0, -2.0, -2.0, 1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_jacobian_transpose_matches_finite_difference() {
        let mut mean = HeterogeneousMean::zeros(2, 2);
        mean.set_from_slice(&[0.3, -0.1, 0.7, 0.2]);
        let b = batch();
        let r = DVector::from_fn(8, |i, _| (i as f64 * 0.7).cos());
        let analytic = mean.jacobian_transpose_apply(&b, &r);

        let base = mean.to_vec();
        for k in 0..4 {
            let mut bumped = base.clone();
            bumped[k] += 1.0;
            let mut shifted = mean.clone();
            shifted.set_from_slice(&bumped);
            // forward is linear in M, so a unit bump is exact
            let delta = shifted.forward(&b) - mean.forward(&b);
            assert_relative_eq!(analytic[k], delta.dot(&r), epsilon = 1e-12);
        }
    }

    #[test]
    fn test_to_vec_is_row_major() {
        let mean = HeterogeneousMean {
            constants: DMatrix::from_row_slice(2, 3, &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]),
        };
        assert_eq!(mean.to_vec(), vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
    }
}
