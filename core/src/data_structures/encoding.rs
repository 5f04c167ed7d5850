//! Concatenation encoder for heterogeneous observation rows
//!
//! Heterogeneous training sets mix two kinds of rows: state-derivative
//! measurements and plain function evaluations. Every row is packed into
//! one flat feature vector so a single kernel can consume the whole batch:
//!
//! ```text
//! row = [ mask | x₁ … x_p | a₁ … a_n ]
//! ```
//!
//! The encoder records the width of every field the first time it sees
//! data and splits rows back at exactly those offsets afterwards.
//!
//! Copyright (c) 2025 Mohammad Atashi <mohammadaliatashi@icloud.com>

use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Encoding errors
#[derive(Debug, Error, Clone, PartialEq)]
pub enum EncodingError {
    #[error("Shape mismatch: expected {expected} columns, got {actual}")]
    ShapeMismatch { expected: usize, actual: usize },

    #[error("Row count mismatch: field {field} has {actual} rows, expected {expected}")]
    RowMismatch {
        field: usize,
        expected: usize,
        actual: usize,
    },

    #[error("Field count mismatch: encoder expects {expected} fields, got {actual}")]
    FieldCountMismatch { expected: usize, actual: usize },
}

/// Encodes several row-aligned matrices by column concatenation.
///
/// Widths are fixed at construction; an encoder never changes shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatEncoder {
    widths: Vec<usize>,
}

impl CatEncoder {
    /// Create an encoder from explicit field widths
    pub fn new(widths: Vec<usize>) -> Self {
        Self { widths }
    }

    /// Record the trailing widths of `arrays` and encode them in one pass
    pub fn from_data(arrays: &[&DMatrix<f64>]) -> Result<(Self, DMatrix<f64>), EncodingError> {
        let encoder = Self::new(arrays.iter().map(|a| a.ncols()).collect());
        let encoded = encoder.encode(arrays)?;
        Ok((encoder, encoded))
    }

    /// Recorded field widths, in encoding order
    pub fn widths(&self) -> &[usize] {
        &self.widths
    }

    /// Total encoded width
    pub fn total_width(&self) -> usize {
        self.widths.iter().sum()
    }

    /// Column offset at which field `index` starts
    pub fn offset(&self, index: usize) -> usize {
        self.widths.iter().take(index).sum()
    }

    /// Concatenate `arrays` along columns
    pub fn encode(&self, arrays: &[&DMatrix<f64>]) -> Result<DMatrix<f64>, EncodingError> {
        if arrays.len() != self.widths.len() {
            return Err(EncodingError::FieldCountMismatch {
                expected: self.widths.len(),
                actual: arrays.len(),
            });
        }

        let rows = arrays.first().map(|a| a.nrows()).unwrap_or(0);
        for (field, (array, &width)) in arrays.iter().zip(&self.widths).enumerate() {
            if array.ncols() != width {
                return Err(EncodingError::ShapeMismatch {
                    expected: width,
                    actual: array.ncols(),
                });
            }
            if array.nrows() != rows {
                return Err(EncodingError::RowMismatch {
                    field,
                    expected: rows,
                    actual: array.nrows(),
                });
            }
        }

        let mut encoded = DMatrix::zeros(rows, self.total_width());
        let mut offset = 0;
        for (array, &width) in arrays.iter().zip(&self.widths) {
            if width > 0 {
                encoded.view_mut((0, offset), (rows, width)).copy_from(*array);
            }
            offset += width;
        }
        Ok(encoded)
    }

    /// Split `encoded` back into its fields, in recorded order
    pub fn decode(&self, encoded: &DMatrix<f64>) -> Result<Vec<DMatrix<f64>>, EncodingError> {
        let expected = self.total_width();
        if encoded.ncols() != expected {
            return Err(EncodingError::ShapeMismatch {
                expected,
                actual: encoded.ncols(),
            });
        }

        let rows = encoded.nrows();
        let mut fields = Vec::with_capacity(self.widths.len());
        let mut offset = 0;
        for &width in &self.widths {
            fields.push(encoded.view((0, offset), (rows, width)).into_owned());
            offset += width;
        }
        Ok(fields)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn matrix(rows: usize, cols: usize, seed: f64) -> DMatrix<f64> {
        DMatrix::from_fn(rows, cols, |i, j| seed + i as f64 * 10.0 + j as f64)
    }

    #[test]
    fn test_from_data_records_widths() {
        let mask = matrix(4, 1, 1.0);
        let x = matrix(4, 3, 2.0);
        let a = matrix(4, 2, 3.0);

        let (encoder, encoded) = CatEncoder::from_data(&[&mask, &x, &a]).unwrap();
        assert_eq!(encoder.widths(), &[1, 3, 2]);
        assert_eq!(encoder.offset(2), 4);
        assert_eq!(encoded.ncols(), 6);
        assert_eq!(encoded[(2, 1)], x[(2, 0)]);
        assert_eq!(encoded[(3, 5)], a[(3, 1)]);
    }

    #[test]
    fn test_decode_rejects_wrong_width() {
        let encoder = CatEncoder::new(vec![1, 2, 3]);
        let bad = DMatrix::zeros(2, 5);
        assert_eq!(
            encoder.decode(&bad),
            Err(EncodingError::ShapeMismatch { expected: 6, actual: 5 })
        );
    }

    #[test]
    fn test_encode_rejects_mismatched_rows() {
        let encoder = CatEncoder::new(vec![1, 1]);
        let a = DMatrix::zeros(2, 1);
        let b = DMatrix::zeros(3, 1);
        assert!(matches!(
            encoder.encode(&[&a, &b]),
            Err(EncodingError::RowMismatch { field: 1, .. })
        ));
    }

    #[test]
    fn test_empty_batch() {
        let encoder = CatEncoder::new(vec![1, 2]);
        let decoded = encoder.decode(&DMatrix::zeros(0, 3)).unwrap();
        assert_eq!(decoded.len(), 2);
        assert_eq!(decoded[1].shape(), (0, 2));
    }

    proptest! {
        #[test]
        fn prop_decode_inverts_encode(
            rows in 0usize..6,
            w1 in 0usize..4,
            w2 in 1usize..4,
            w3 in 0usize..4,
            seed in -5.0f64..5.0,
        ) {
            let a = matrix(rows, w1, seed);
            let b = matrix(rows, w2, seed * 2.0);
            let c = matrix(rows, w3, seed - 1.0);
            let (encoder, encoded) = CatEncoder::from_data(&[&a, &b, &c]).unwrap();

            let decoded = encoder.decode(&encoded).unwrap();
            prop_assert_eq!(&decoded[0], &a);
            prop_assert_eq!(&decoded[1], &b);
            prop_assert_eq!(&decoded[2], &c);

            let parts: Vec<&DMatrix<f64>> = decoded.iter().collect();
            prop_assert_eq!(encoder.encode(&parts).unwrap(), encoded);
        }
    }
}
