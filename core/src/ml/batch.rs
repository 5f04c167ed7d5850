//! Heterogeneous observation batches
//!
//! A training batch mixes two observation types of the control-affine model
//! `ẋ = f(x) + g(x)u`, written with `F(x) = [f(x) g(x)]ᵀ ∈ ℝⁿˣᵖ`:
//!
//! ```text
//! mask = 1 :  ẋ    = F(x)ᵀ ũ      ũ = [1, u]      (derivative type)
//! mask = 0 :  F(x)                                 (value type)
//! ```
//!
//! Rows are encoded as `[mask | x | ũ]` (ũ zero for value rows) and all
//! derivative rows precede all value rows.
//!
//! Copyright (c) 2025 Mohammad Atashi <mohammadaliatashi@icloud.com>

use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

use crate::data_structures::encoding::{CatEncoder, EncodingError};
use crate::ml::kernel::KernelError;

/// Mask value for derivative-type rows
pub const DERIVATIVE_MASK: f64 = 1.0;

/// Mask value for value-type rows
pub const VALUE_MASK: f64 = 0.0;

/// One observation of the control-affine system
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Observation {
    /// Measured state derivative under control `u`
    Derivative {
        x: DVector<f64>,
        u: DVector<f64>,
        xdot: DVector<f64>,
    },
    /// Direct evaluation of `f(x)` and `g(x)`
    Value {
        x: DVector<f64>,
        f: DVector<f64>,
        g: DMatrix<f64>,
    },
}

impl Observation {
    pub fn state(&self) -> &DVector<f64> {
        match self {
            Observation::Derivative { x, .. } | Observation::Value { x, .. } => x,
        }
    }

    pub fn is_derivative(&self) -> bool {
        matches!(self, Observation::Derivative { .. })
    }
}

/// Column layout of encoded heterogeneous rows
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchLayout {
    encoder: CatEncoder,
    state_dim: usize,
    ctrl_dim: usize,
}

impl BatchLayout {
    /// Layout `[mask (1) | x (p) | ũ (1 + m)]`
    pub fn new(state_dim: usize, ctrl_dim: usize) -> Self {
        Self {
            encoder: CatEncoder::new(vec![1, state_dim, 1 + ctrl_dim]),
            state_dim,
            ctrl_dim,
        }
    }

    pub fn state_dim(&self) -> usize {
        self.state_dim
    }

    pub fn ctrl_dim(&self) -> usize {
        self.ctrl_dim
    }

    /// Number of control channels `n = 1 + m` (drift plus inputs)
    pub fn channels(&self) -> usize {
        1 + self.ctrl_dim
    }

    pub fn encoder(&self) -> &CatEncoder {
        &self.encoder
    }

    /// Encode derivative-type rows with auxiliary vector `[1, u]`
    pub fn encode_derivative(
        &self,
        x: &DMatrix<f64>,
        u: &DMatrix<f64>,
    ) -> Result<DMatrix<f64>, EncodingError> {
        if u.nrows() != x.nrows() {
            return Err(EncodingError::RowMismatch {
                field: 2,
                expected: x.nrows(),
                actual: u.nrows(),
            });
        }
        let mask = DMatrix::from_element(x.nrows(), 1, DERIVATIVE_MASK);
        let mut aux = DMatrix::from_element(x.nrows(), self.channels(), 1.0);
        if u.ncols() != self.ctrl_dim {
            return Err(EncodingError::ShapeMismatch {
                expected: self.ctrl_dim,
                actual: u.ncols(),
            });
        }
        aux.columns_mut(1, self.ctrl_dim).copy_from(u);
        self.encoder.encode(&[&mask, x, &aux])
    }

    /// Encode value-type rows with a zero auxiliary vector
    pub fn encode_values(&self, x: &DMatrix<f64>) -> Result<DMatrix<f64>, EncodingError> {
        let mask = DMatrix::from_element(x.nrows(), 1, VALUE_MASK);
        let aux = DMatrix::zeros(x.nrows(), self.channels());
        self.encoder.encode(&[&mask, x, &aux])
    }

    /// Encode a list of observations, derivative rows first, and stack their targets
    pub fn encode_observations(
        &self,
        observations: &[Observation],
    ) -> Result<(DMatrix<f64>, DVector<f64>), EncodingError> {
        let p = self.state_dim;
        let n = self.channels();
        let derivative: Vec<&Observation> =
            observations.iter().filter(|o| o.is_derivative()).collect();
        let value: Vec<&Observation> = observations.iter().filter(|o| !o.is_derivative()).collect();

        let rows = observations.len();
        let mut mask = DMatrix::zeros(rows, 1);
        let mut x = DMatrix::zeros(rows, p);
        let mut aux = DMatrix::zeros(rows, n);
        let mut targets = Vec::with_capacity(derivative.len() * p + value.len() * n * p);

        for (row, observation) in derivative.iter().chain(value.iter()).enumerate() {
            let state = observation.state();
            if state.len() != p {
                return Err(EncodingError::ShapeMismatch {
                    expected: p,
                    actual: state.len(),
                });
            }
            x.row_mut(row).copy_from(&state.transpose());

            match observation {
                Observation::Derivative { u, xdot, .. } => {
                    if u.len() != self.ctrl_dim {
                        return Err(EncodingError::ShapeMismatch {
                            expected: self.ctrl_dim,
                            actual: u.len(),
                        });
                    }
                    if xdot.len() != p {
                        return Err(EncodingError::ShapeMismatch {
                            expected: p,
                            actual: xdot.len(),
                        });
                    }
                    mask[(row, 0)] = DERIVATIVE_MASK;
                    aux[(row, 0)] = 1.0;
                    for j in 0..self.ctrl_dim {
                        aux[(row, 1 + j)] = u[j];
                    }
                    targets.extend(xdot.iter().copied());
                }
                Observation::Value { f, g, .. } => {
                    if f.len() != p {
                        return Err(EncodingError::ShapeMismatch {
                            expected: p,
                            actual: f.len(),
                        });
                    }
                    if g.shape() != (p, self.ctrl_dim) {
                        return Err(EncodingError::ShapeMismatch {
                            expected: p * self.ctrl_dim,
                            actual: g.len(),
                        });
                    }
                    targets.extend(f.iter().copied());
                    for j in 0..self.ctrl_dim {
                        targets.extend(g.column(j).iter().copied());
                    }
                }
            }
        }

        let encoded = self.encoder.encode(&[&mask, &x, &aux])?;
        Ok((encoded, DVector::from_vec(targets)))
    }

    /// Decode an encoded batch and locate the derivative/value split
    pub fn decode(&self, encoded: &DMatrix<f64>) -> Result<DecodedBatch, KernelError> {
        let mut fields = self.encoder.decode(encoded)?.into_iter();
        let (mask, x, aux) = match (fields.next(), fields.next(), fields.next()) {
            (Some(mask), Some(x), Some(aux)) => (mask, x, aux),
            _ => {
                return Err(KernelError::Encoding(EncodingError::FieldCountMismatch {
                    expected: 3,
                    actual: self.encoder.widths().len(),
                }))
            }
        };
        let split = derivative_split(&mask)?;
        Ok(DecodedBatch { x, aux, split })
    }
}

/// Number of leading derivative rows; the remainder must all be value rows
pub fn derivative_split(mask: &DMatrix<f64>) -> Result<usize, KernelError> {
    let rows = mask.nrows();
    let split = (0..rows)
        .find(|&i| mask[(i, 0)] != DERIVATIVE_MASK)
        .unwrap_or(rows);

    for row in split..rows {
        let value = mask[(row, 0)];
        if value == DERIVATIVE_MASK {
            return Err(KernelError::UnsortedBatch { row, split });
        }
        if value != VALUE_MASK {
            return Err(KernelError::InvalidMask { row, value });
        }
    }
    Ok(split)
}

/// Decoded batch with its derivative/value split
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedBatch {
    pub x: DMatrix<f64>,
    pub aux: DMatrix<f64>,
    pub split: usize,
}

impl DecodedBatch {
    pub fn len(&self) -> usize {
        self.x.nrows()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn derivative_rows(&self) -> usize {
        self.split
    }

    pub fn value_rows(&self) -> usize {
        self.len() - self.split
    }

    /// Flattened output length: `p` per derivative row, `n·p` per value row
    pub fn output_len(&self, state_dim: usize, channels: usize) -> usize {
        self.derivative_rows() * state_dim + self.value_rows() * channels * state_dim
    }
}
