//! Structured Linear Operators for Matrix-Variate Covariances
//!
//! This module implements a small algebra of lazily evaluated linear
//! operators. Covariances of matrix-shaped quantities factor as Kronecker
//! products of much smaller matrices, and the heterogeneous kernel only
//! ever needs a handful of structural combinators on top of them.
//!
//! # Mathematical Foundations
//!
//! ## Kronecker Identities
//! ```text
//! (A₁ ⊗ B₁)(A₂ ⊗ B₂) = (A₁A₂) ⊗ (B₁B₂)
//! (A ⊗ B)ᵀ           = Aᵀ ⊗ Bᵀ
//! (A ⊗ B) vec(X)     = vec(A X Bᵀ)        (row-major vec)
//! ```
//!
//! ## Block-Diagonal Embedding
//! ```text
//! blkdiag(H₁, …, H_k) v = [H₁ v₁; …; H_k v_k]
//! ```
//! Off-diagonal zeros are never stored.
//!
//! Every operator can be densified on demand; all other operations work on
//! the structure directly.
//!
//! Copyright (c) 2025 Mohammad Atashi <mohammadaliatashi@icloud.com>

use std::ops::Range;

use nalgebra::{DMatrix, DVector};
use thiserror::Error;

/// Linear operator errors
#[derive(Debug, Error, Clone, PartialEq)]
pub enum OperatorError {
    #[error("Incompatible shapes for {operation}: {left:?} and {right:?}")]
    IncompatibleShapes {
        operation: &'static str,
        left: (usize, usize),
        right: (usize, usize),
    },

    #[error("Block-diagonal blocks must share one shape: {expected:?} vs {actual:?}")]
    RaggedBlocks {
        expected: (usize, usize),
        actual: (usize, usize),
    },

    #[error("Index range {start}..{end} out of bounds for dimension {dim}")]
    RangeOutOfBounds { start: usize, end: usize, dim: usize },

    #[error("Vector length {actual} does not match operator dimension {expected}")]
    VectorLength { expected: usize, actual: usize },
}

/// Concatenation direction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Axis {
    /// Stack vertically (parts share column count)
    Rows,
    /// Stack horizontally (parts share row count)
    Columns,
}

/// Lazily evaluated structured linear operator
#[derive(Debug, Clone)]
pub enum LinearOperator {
    /// Materialized matrix
    Dense(DMatrix<f64>),

    /// Kronecker product `A ⊗ B`
    Kronecker(Box<LinearOperator>, Box<LinearOperator>),

    /// Block-diagonal stack of equally shaped blocks
    BlockDiag(Vec<DMatrix<f64>>),

    /// Deferred product `A B`
    Product(Box<LinearOperator>, Box<LinearOperator>),

    /// Deferred transpose `Aᵀ`
    Transpose(Box<LinearOperator>),

    /// Rectangular window into another operator
    SubBlock {
        base: Box<LinearOperator>,
        rows: Range<usize>,
        cols: Range<usize>,
    },

    /// Concatenation of compatible operators
    Concat {
        parts: Vec<LinearOperator>,
        axis: Axis,
    },
}

impl LinearOperator {
    /// Wrap a dense matrix
    pub fn dense(matrix: DMatrix<f64>) -> Self {
        LinearOperator::Dense(matrix)
    }

    /// Kronecker product `a ⊗ b`
    pub fn kron(a: LinearOperator, b: LinearOperator) -> Self {
        LinearOperator::Kronecker(Box::new(a), Box::new(b))
    }

    /// Block-diagonal embedding of equally shaped blocks
    pub fn block_diag(blocks: Vec<DMatrix<f64>>) -> Result<Self, OperatorError> {
        if let Some(first) = blocks.first() {
            let expected = first.shape();
            if let Some(bad) = blocks.iter().find(|b| b.shape() != expected) {
                return Err(OperatorError::RaggedBlocks {
                    expected,
                    actual: bad.shape(),
                });
            }
        }
        Ok(LinearOperator::BlockDiag(blocks))
    }

    /// Horizontal concatenation `[a₁ a₂ …]`
    pub fn hcat(parts: Vec<LinearOperator>) -> Result<Self, OperatorError> {
        Self::concat(parts, Axis::Columns)
    }

    /// Vertical concatenation `[a₁; a₂; …]`
    pub fn vcat(parts: Vec<LinearOperator>) -> Result<Self, OperatorError> {
        Self::concat(parts, Axis::Rows)
    }

    fn concat(mut parts: Vec<LinearOperator>, axis: Axis) -> Result<Self, OperatorError> {
        if let Some(first) = parts.first() {
            let reference = first.shape();
            for part in &parts[1..] {
                let shape = part.shape();
                let compatible = match axis {
                    Axis::Rows => shape.1 == reference.1,
                    Axis::Columns => shape.0 == reference.0,
                };
                if !compatible {
                    return Err(OperatorError::IncompatibleShapes {
                        operation: "concatenation",
                        left: reference,
                        right: shape,
                    });
                }
            }
        }
        if parts.len() == 1 {
            return Ok(parts.remove(0));
        }
        Ok(LinearOperator::Concat { parts, axis })
    }

    /// Operator shape `(rows, cols)`
    pub fn shape(&self) -> (usize, usize) {
        match self {
            LinearOperator::Dense(m) => m.shape(),
            LinearOperator::Kronecker(a, b) => {
                let (ar, ac) = a.shape();
                let (br, bc) = b.shape();
                (ar * br, ac * bc)
            }
            LinearOperator::BlockDiag(blocks) => {
                let (r, c) = blocks.first().map(|b| b.shape()).unwrap_or((0, 0));
                (r * blocks.len(), c * blocks.len())
            }
            LinearOperator::Product(a, b) => (a.nrows(), b.ncols()),
            LinearOperator::Transpose(a) => (a.ncols(), a.nrows()),
            LinearOperator::SubBlock { rows, cols, .. } => (rows.len(), cols.len()),
            LinearOperator::Concat { parts, axis } => match axis {
                Axis::Rows => (
                    parts.iter().map(|p| p.nrows()).sum(),
                    parts.first().map(|p| p.ncols()).unwrap_or(0),
                ),
                Axis::Columns => (
                    parts.first().map(|p| p.nrows()).unwrap_or(0),
                    parts.iter().map(|p| p.ncols()).sum(),
                ),
            },
        }
    }

    pub fn nrows(&self) -> usize {
        self.shape().0
    }

    pub fn ncols(&self) -> usize {
        self.shape().1
    }

    /// Transpose, pushed through the structure where it is free
    ///
    /// Products are wrapped rather than rebuilt factor by factor.
    pub fn transpose(self) -> Self {
        match self {
            LinearOperator::Dense(m) => LinearOperator::Dense(m.transpose()),
            LinearOperator::Kronecker(a, b) => LinearOperator::kron(a.transpose(), b.transpose()),
            LinearOperator::BlockDiag(blocks) => {
                LinearOperator::BlockDiag(blocks.iter().map(|b| b.transpose()).collect())
            }
            product @ LinearOperator::Product(_, _) => LinearOperator::Transpose(Box::new(product)),
            LinearOperator::Transpose(a) => *a,
            LinearOperator::SubBlock { base, rows, cols } => LinearOperator::SubBlock {
                base: Box::new(base.transpose()),
                rows: cols,
                cols: rows,
            },
            LinearOperator::Concat { parts, axis } => LinearOperator::Concat {
                parts: parts.into_iter().map(|p| p.transpose()).collect(),
                axis: match axis {
                    Axis::Rows => Axis::Columns,
                    Axis::Columns => Axis::Rows,
                },
            },
        }
    }

    /// Operator product `self · rhs`
    ///
    /// Conformal Kronecker factors are multiplied factor-wise and dense
    /// operands eagerly; everything else stays deferred.
    pub fn matmul(self, rhs: LinearOperator) -> Result<Self, OperatorError> {
        if self.ncols() != rhs.nrows() {
            return Err(OperatorError::IncompatibleShapes {
                operation: "matmul",
                left: self.shape(),
                right: rhs.shape(),
            });
        }

        match (self, rhs) {
            (LinearOperator::Dense(a), LinearOperator::Dense(b)) => {
                Ok(LinearOperator::Dense(a * b))
            }
            (LinearOperator::Kronecker(a1, b1), LinearOperator::Kronecker(a2, b2))
                if a1.ncols() == a2.nrows() && b1.ncols() == b2.nrows() =>
            {
                Ok(LinearOperator::kron(a1.matmul(*a2)?, b1.matmul(*b2)?))
            }
            (lhs, rhs) => Ok(LinearOperator::Product(Box::new(lhs), Box::new(rhs))),
        }
    }

    /// Rectangular window `self[rows, cols]`
    pub fn sub_block(&self, rows: Range<usize>, cols: Range<usize>) -> Result<Self, OperatorError> {
        let (nr, nc) = self.shape();
        for (range, dim) in [(&rows, nr), (&cols, nc)] {
            if range.start > range.end || range.end > dim {
                return Err(OperatorError::RangeOutOfBounds {
                    start: range.start,
                    end: range.end,
                    dim,
                });
            }
        }

        match self {
            LinearOperator::Dense(m) => Ok(LinearOperator::Dense(
                m.view((rows.start, cols.start), (rows.len(), cols.len()))
                    .into_owned(),
            )),
            LinearOperator::SubBlock {
                base,
                rows: base_rows,
                cols: base_cols,
            } => Ok(LinearOperator::SubBlock {
                base: base.clone(),
                rows: base_rows.start + rows.start..base_rows.start + rows.end,
                cols: base_cols.start + cols.start..base_cols.start + cols.end,
            }),
            other => Ok(LinearOperator::SubBlock {
                base: Box::new(other.clone()),
                rows,
                cols,
            }),
        }
    }

    /// Single entry `self[i, j]` without densifying
    pub fn entry(&self, i: usize, j: usize) -> f64 {
        match self {
            LinearOperator::Dense(m) => m[(i, j)],
            LinearOperator::Kronecker(a, b) => {
                let (br, bc) = b.shape();
                a.entry(i / br, j / bc) * b.entry(i % br, j % bc)
            }
            LinearOperator::BlockDiag(blocks) => {
                let (r, c) = blocks[0].shape();
                let (bi, bj) = (i / r, j / c);
                if bi == bj {
                    blocks[bi][(i % r, j % c)]
                } else {
                    0.0
                }
            }
            LinearOperator::Product(a, b) => {
                let left = a.row_support(i);
                let right = b.col_support(j);
                let inner = left.start.max(right.start)..left.end.min(right.end);
                inner.map(|k| a.entry(i, k) * b.entry(k, j)).sum()
            }
            LinearOperator::Transpose(a) => a.entry(j, i),
            LinearOperator::SubBlock { base, rows, cols } => {
                base.entry(rows.start + i, cols.start + j)
            }
            LinearOperator::Concat { parts, axis } => {
                let (mut i, mut j) = (i, j);
                for part in parts {
                    let (pr, pc) = part.shape();
                    match axis {
                        Axis::Rows if i < pr => return part.entry(i, j),
                        Axis::Rows => i -= pr,
                        Axis::Columns if j < pc => return part.entry(i, j),
                        Axis::Columns => j -= pc,
                    }
                }
                0.0
            }
        }
    }

    /// Columns that may be non-zero in row `i`
    fn row_support(&self, i: usize) -> Range<usize> {
        match self {
            LinearOperator::BlockDiag(blocks) => {
                let (r, c) = blocks[0].shape();
                let block = i / r;
                block * c..(block + 1) * c
            }
            LinearOperator::Kronecker(a, b) => {
                let (br, bc) = b.shape();
                let outer = a.row_support(i / br);
                let inner = b.row_support(i % br);
                if outer.is_empty() || inner.is_empty() {
                    return 0..0;
                }
                outer.start * bc + inner.start..(outer.end - 1) * bc + inner.end
            }
            LinearOperator::SubBlock { base, rows, cols } => {
                let support = base.row_support(rows.start + i);
                let start = support.start.max(cols.start);
                let end = support.end.min(cols.end);
                if start >= end {
                    0..0
                } else {
                    start - cols.start..end - cols.start
                }
            }
            LinearOperator::Transpose(a) => a.col_support(i),
            _ => 0..self.ncols(),
        }
    }

    /// Rows that may be non-zero in column `j`
    fn col_support(&self, j: usize) -> Range<usize> {
        match self {
            LinearOperator::BlockDiag(blocks) => {
                let (r, c) = blocks[0].shape();
                let block = j / c;
                block * r..(block + 1) * r
            }
            LinearOperator::Kronecker(a, b) => {
                let (br, bc) = b.shape();
                let outer = a.col_support(j / bc);
                let inner = b.col_support(j % bc);
                if outer.is_empty() || inner.is_empty() {
                    return 0..0;
                }
                outer.start * br + inner.start..(outer.end - 1) * br + inner.end
            }
            LinearOperator::SubBlock { base, rows, cols } => {
                let support = base.col_support(cols.start + j);
                let start = support.start.max(rows.start);
                let end = support.end.min(rows.end);
                if start >= end {
                    0..0
                } else {
                    start - rows.start..end - rows.start
                }
            }
            LinearOperator::Transpose(a) => a.row_support(j),
            _ => 0..self.nrows(),
        }
    }

    /// Main diagonal, entry by entry
    pub fn diagonal(&self) -> DVector<f64> {
        let (r, c) = self.shape();
        DVector::from_iterator(r.min(c), (0..r.min(c)).map(|i| self.entry(i, i)))
    }

    /// Matrix-vector product `self · v`
    pub fn matvec(&self, v: &DVector<f64>) -> Result<DVector<f64>, OperatorError> {
        if v.len() != self.ncols() {
            return Err(OperatorError::VectorLength {
                expected: self.ncols(),
                actual: v.len(),
            });
        }
        Ok(self.apply(v))
    }

    /// Transposed product `selfᵀ · v`
    pub fn rmatvec(&self, v: &DVector<f64>) -> Result<DVector<f64>, OperatorError> {
        if v.len() != self.nrows() {
            return Err(OperatorError::VectorLength {
                expected: self.nrows(),
                actual: v.len(),
            });
        }
        Ok(self.apply_transpose(v))
    }

    fn apply(&self, v: &DVector<f64>) -> DVector<f64> {
        match self {
            LinearOperator::Dense(m) => m * v,
            LinearOperator::Kronecker(a, b) => kron_apply(a, b, v, false),
            LinearOperator::BlockDiag(blocks) => {
                let (r, c) = blocks.first().map(|b| b.shape()).unwrap_or((0, 0));
                let mut out = DVector::zeros(r * blocks.len());
                for (k, block) in blocks.iter().enumerate() {
                    let segment = v.rows(k * c, c);
                    out.rows_mut(k * r, r).copy_from(&(block * segment));
                }
                out
            }
            LinearOperator::Product(a, b) => a.apply(&b.apply(v)),
            LinearOperator::Transpose(a) => a.apply_transpose(v),
            LinearOperator::SubBlock { base, rows, cols } => {
                let mut padded = DVector::zeros(base.ncols());
                padded.rows_mut(cols.start, cols.len()).copy_from(v);
                base.apply(&padded).rows(rows.start, rows.len()).into_owned()
            }
            LinearOperator::Concat { parts, axis } => match axis {
                Axis::Rows => {
                    let pieces: Vec<DVector<f64>> = parts.iter().map(|p| p.apply(v)).collect();
                    stack(&pieces)
                }
                Axis::Columns => {
                    let mut out = DVector::zeros(self.nrows());
                    let mut offset = 0;
                    for part in parts {
                        let width = part.ncols();
                        out += part.apply(&v.rows(offset, width).into_owned());
                        offset += width;
                    }
                    out
                }
            },
        }
    }

    fn apply_transpose(&self, v: &DVector<f64>) -> DVector<f64> {
        match self {
            LinearOperator::Dense(m) => m.tr_mul(v),
            LinearOperator::Kronecker(a, b) => kron_apply(a, b, v, true),
            LinearOperator::BlockDiag(blocks) => {
                let (r, c) = blocks.first().map(|b| b.shape()).unwrap_or((0, 0));
                let mut out = DVector::zeros(c * blocks.len());
                for (k, block) in blocks.iter().enumerate() {
                    let segment = v.rows(k * r, r);
                    out.rows_mut(k * c, c).copy_from(&block.tr_mul(&segment));
                }
                out
            }
            LinearOperator::Product(a, b) => b.apply_transpose(&a.apply_transpose(v)),
            LinearOperator::Transpose(a) => a.apply(v),
            LinearOperator::SubBlock { base, rows, cols } => {
                let mut padded = DVector::zeros(base.nrows());
                padded.rows_mut(rows.start, rows.len()).copy_from(v);
                base.apply_transpose(&padded)
                    .rows(cols.start, cols.len())
                    .into_owned()
            }
            LinearOperator::Concat { parts, axis } => match axis {
                Axis::Columns => {
                    let pieces: Vec<DVector<f64>> =
                        parts.iter().map(|p| p.apply_transpose(v)).collect();
                    stack(&pieces)
                }
                Axis::Rows => {
                    let mut out = DVector::zeros(self.ncols());
                    let mut offset = 0;
                    for part in parts {
                        let height = part.nrows();
                        out += part.apply_transpose(&v.rows(offset, height).into_owned());
                        offset += height;
                    }
                    out
                }
            },
        }
    }

    /// Densify the operator
    pub fn evaluate(&self) -> DMatrix<f64> {
        match self {
            LinearOperator::Dense(m) => m.clone(),
            LinearOperator::Kronecker(a, b) => a.evaluate().kronecker(&b.evaluate()),
            LinearOperator::BlockDiag(blocks) => {
                let (r, c) = blocks.first().map(|b| b.shape()).unwrap_or((0, 0));
                let mut out = DMatrix::zeros(r * blocks.len(), c * blocks.len());
                for (k, block) in blocks.iter().enumerate() {
                    out.view_mut((k * r, k * c), (r, c)).copy_from(block);
                }
                out
            }
            LinearOperator::Product(a, b) => match (a.as_ref(), b.as_ref()) {
                (LinearOperator::BlockDiag(blocks), rhs) => {
                    block_diag_left(blocks, &rhs.evaluate())
                }
                (lhs, LinearOperator::BlockDiag(blocks)) => {
                    block_diag_right(&lhs.evaluate(), blocks)
                }
                (lhs, rhs) => lhs.evaluate() * rhs.evaluate(),
            },
            LinearOperator::Transpose(a) => a.evaluate().transpose(),
            LinearOperator::SubBlock { base, rows, cols } => base
                .evaluate()
                .view((rows.start, cols.start), (rows.len(), cols.len()))
                .into_owned(),
            LinearOperator::Concat { parts, axis } => {
                let (r, c) = self.shape();
                let mut out = DMatrix::zeros(r, c);
                let mut offset = 0;
                for part in parts {
                    let (pr, pc) = part.shape();
                    match axis {
                        Axis::Rows => {
                            out.view_mut((offset, 0), (pr, pc)).copy_from(&part.evaluate());
                            offset += pr;
                        }
                        Axis::Columns => {
                            out.view_mut((0, offset), (pr, pc)).copy_from(&part.evaluate());
                            offset += pc;
                        }
                    }
                }
                out
            }
        }
    }
}

/// `(A ⊗ B) v` (or its transpose) via `vec(A X Bᵀ)` without forming `A ⊗ B`
fn kron_apply(
    a: &LinearOperator,
    b: &LinearOperator,
    v: &DVector<f64>,
    transpose: bool,
) -> DVector<f64> {
    let (ar, ac) = if transpose {
        let (r, c) = a.shape();
        (c, r)
    } else {
        a.shape()
    };
    let (br, bc) = if transpose {
        let (r, c) = b.shape();
        (c, r)
    } else {
        b.shape()
    };

    // Z = X Bᵀ, one row of X at a time
    let mut z = DMatrix::zeros(ac, br);
    for row in 0..ac {
        let x_row = v.rows(row * bc, bc).into_owned();
        let mapped = if transpose {
            b.apply_transpose(&x_row)
        } else {
            b.apply(&x_row)
        };
        z.row_mut(row).copy_from(&mapped.transpose());
    }

    // Y = A Z, one column of Z at a time
    let mut out = DVector::zeros(ar * br);
    for col in 0..br {
        let z_col = z.column(col).into_owned();
        let mapped = if transpose {
            a.apply_transpose(&z_col)
        } else {
            a.apply(&z_col)
        };
        for row in 0..ar {
            out[row * br + col] = mapped[row];
        }
    }
    out
}

fn stack(pieces: &[DVector<f64>]) -> DVector<f64> {
    let total = pieces.iter().map(|p| p.len()).sum();
    let mut out = DVector::zeros(total);
    let mut offset = 0;
    for piece in pieces {
        out.rows_mut(offset, piece.len()).copy_from(piece);
        offset += piece.len();
    }
    out
}

/// `blkdiag(blocks) · rhs` touching only the non-zero blocks
fn block_diag_left(blocks: &[DMatrix<f64>], rhs: &DMatrix<f64>) -> DMatrix<f64> {
    let (r, c) = blocks.first().map(|b| b.shape()).unwrap_or((0, 0));
    let mut out = DMatrix::zeros(r * blocks.len(), rhs.ncols());
    for (k, block) in blocks.iter().enumerate() {
        let rows = rhs.rows(k * c, c);
        out.rows_mut(k * r, r).copy_from(&(block * rows));
    }
    out
}

/// `lhs · blkdiag(blocks)` touching only the non-zero blocks
fn block_diag_right(lhs: &DMatrix<f64>, blocks: &[DMatrix<f64>]) -> DMatrix<f64> {
    let (r, c) = blocks.first().map(|b| b.shape()).unwrap_or((0, 0));
    let mut out = DMatrix::zeros(lhs.nrows(), c * blocks.len());
    for (k, block) in blocks.iter().enumerate() {
        let cols = lhs.columns(k * r, r);
        out.columns_mut(k * c, c).copy_from(&(cols * block));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use proptest::prelude::*;
    use rand::{Rng, SeedableRng};
    use rand_chacha::ChaCha8Rng;

    fn random_matrix(rng: &mut ChaCha8Rng, rows: usize, cols: usize) -> DMatrix<f64> {
        DMatrix::from_fn(rows, cols, |_, _| rng.gen_range(-1.0..1.0))
    }

    fn random_psd(rng: &mut ChaCha8Rng, n: usize) -> DMatrix<f64> {
        let w = random_matrix(rng, n, n);
        &w * w.transpose() + DMatrix::identity(n, n) * 0.1
    }

    fn explicit_kron(a: &DMatrix<f64>, b: &DMatrix<f64>) -> DMatrix<f64> {
        let (ar, ac) = a.shape();
        let (br, bc) = b.shape();
        DMatrix::from_fn(ar * br, ac * bc, |i, j| a[(i / br, j / bc)] * b[(i % br, j % bc)])
    }

    #[test]
    fn test_block_diag_rejects_ragged_blocks() {
        let blocks = vec![DMatrix::zeros(1, 3), DMatrix::zeros(1, 2)];
        assert!(matches!(
            LinearOperator::block_diag(blocks),
            Err(OperatorError::RaggedBlocks { .. })
        ));
    }

    #[test]
    fn test_block_diag_matches_dense() {
        let blocks = vec![
            DMatrix::from_row_slice(1, 3, &[1.0, 2.0, 3.0]),
            DMatrix::from_row_slice(1, 3, &[4.0, 5.0, 6.0]),
        ];
        let op = LinearOperator::block_diag(blocks).unwrap();
        let dense = op.evaluate();
        assert_eq!(dense.shape(), (2, 6));
        assert_eq!(dense[(0, 3)], 0.0);
        assert_eq!(dense[(1, 4)], 5.0);

        let v = DVector::from_iterator(6, (0..6).map(|i| i as f64));
        assert_relative_eq!(op.matvec(&v).unwrap(), &dense * &v, epsilon = 1e-12);
    }

    #[test]
    fn test_mixed_product_identity() {
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        let (a1, b1) = (random_matrix(&mut rng, 2, 3), random_matrix(&mut rng, 3, 2));
        let (a2, b2) = (random_matrix(&mut rng, 3, 2), random_matrix(&mut rng, 2, 4));

        let lhs = LinearOperator::kron(
            LinearOperator::dense(a1.clone()),
            LinearOperator::dense(b1.clone()),
        );
        let rhs = LinearOperator::kron(
            LinearOperator::dense(a2.clone()),
            LinearOperator::dense(b2.clone()),
        );
        let product = lhs.clone().matmul(rhs.clone()).unwrap();
        assert!(matches!(product, LinearOperator::Kronecker(_, _)));

        let dense_product = lhs.evaluate() * rhs.evaluate();
        assert_relative_eq!(product.evaluate(), dense_product, epsilon = 1e-12);
        assert_relative_eq!(
            product.evaluate(),
            explicit_kron(&(&a1 * &a2), &(&b1 * &b2)),
            epsilon = 1e-12
        );
    }

    #[test]
    fn test_kronecker_transpose_identity() {
        let mut rng = ChaCha8Rng::seed_from_u64(11);
        let a = random_matrix(&mut rng, 2, 3);
        let b = random_matrix(&mut rng, 4, 2);
        let op = LinearOperator::kron(
            LinearOperator::dense(a.clone()),
            LinearOperator::dense(b.clone()),
        );
        let dense_t = op.evaluate().transpose();
        let lazy_t = op.transpose();
        assert!(matches!(lazy_t, LinearOperator::Kronecker(_, _)));
        assert_relative_eq!(lazy_t.evaluate(), dense_t, epsilon = 1e-12);
        assert_relative_eq!(
            lazy_t.evaluate(),
            explicit_kron(&a.transpose(), &b.transpose()),
            epsilon = 1e-12
        );
    }

    #[test]
    fn test_deferred_product_transpose() {
        let mut rng = ChaCha8Rng::seed_from_u64(13);
        let blocks: Vec<DMatrix<f64>> = (0..2).map(|_| random_matrix(&mut rng, 1, 3)).collect();
        let h = LinearOperator::block_diag(blocks).unwrap();
        let k = LinearOperator::dense(random_psd(&mut rng, 6));
        let product = h.matmul(k).unwrap();
        let dense = product.evaluate();

        let transposed = product.transpose();
        assert!(matches!(transposed, LinearOperator::Transpose(_)));
        assert_eq!(transposed.shape(), (6, 2));
        assert_relative_eq!(transposed.evaluate(), dense.transpose(), epsilon = 1e-12);
        assert_relative_eq!(transposed.entry(4, 1), dense[(1, 4)], epsilon = 1e-12);

        let v = DVector::from_vec(vec![1.5, -0.5]);
        assert_relative_eq!(transposed.matvec(&v).unwrap(), dense.tr_mul(&v), epsilon = 1e-10);
        assert!(matches!(transposed.transpose(), LinearOperator::Product(_, _)));
    }

    #[test]
    fn test_concat_and_sub_block() {
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        let a = random_matrix(&mut rng, 2, 3);
        let b = random_matrix(&mut rng, 2, 1);
        let c = random_matrix(&mut rng, 1, 4);

        let top = LinearOperator::hcat(vec![
            LinearOperator::dense(a.clone()),
            LinearOperator::dense(b.clone()),
        ])
        .unwrap();
        let full = LinearOperator::vcat(vec![top, LinearOperator::dense(c.clone())]).unwrap();
        assert_eq!(full.shape(), (3, 4));

        let dense = full.evaluate();
        assert_eq!(dense[(1, 3)], b[(1, 0)]);
        assert_eq!(dense[(2, 2)], c[(0, 2)]);
        assert_eq!(full.entry(0, 1), a[(0, 1)]);

        let window = full.sub_block(1..3, 2..4).unwrap();
        assert_relative_eq!(
            window.evaluate(),
            dense.view((1, 2), (2, 2)).into_owned(),
            epsilon = 1e-12
        );

        let v = DVector::from_vec(vec![1.0, -2.0]);
        assert_relative_eq!(window.matvec(&v).unwrap(), window.evaluate() * &v, epsilon = 1e-12);
        let w = DVector::from_vec(vec![0.5, 3.0]);
        assert_relative_eq!(
            window.rmatvec(&w).unwrap(),
            window.evaluate().tr_mul(&w),
            epsilon = 1e-12
        );
    }

    #[test]
    fn test_concat_rejects_incompatible_parts() {
        let parts = vec![
            LinearOperator::dense(DMatrix::zeros(2, 2)),
            LinearOperator::dense(DMatrix::zeros(3, 2)),
        ];
        assert!(LinearOperator::hcat(parts).is_err());
    }

    #[test]
    fn test_sub_block_bounds() {
        let op = LinearOperator::dense(DMatrix::zeros(2, 2));
        assert!(matches!(
            op.sub_block(0..3, 0..1),
            Err(OperatorError::RangeOutOfBounds { dim: 2, .. })
        ));
    }

    #[test]
    fn test_matvec_length_checked() {
        let op = LinearOperator::dense(DMatrix::zeros(2, 3));
        assert_eq!(
            op.matvec(&DVector::zeros(2)),
            Err(OperatorError::VectorLength { expected: 3, actual: 2 })
        );
    }

    #[test]
    fn test_sandwich_product_entries_and_diagonal() {
        let mut rng = ChaCha8Rng::seed_from_u64(5);
        let kxx = random_psd(&mut rng, 3);
        let u = random_psd(&mut rng, 2);
        let blocks: Vec<DMatrix<f64>> = (0..3).map(|_| random_matrix(&mut rng, 1, 2)).collect();

        let h = LinearOperator::block_diag(blocks).unwrap();
        let inner = LinearOperator::kron(LinearOperator::dense(kxx), LinearOperator::dense(u));
        let sandwich = h.clone().matmul(inner).unwrap().matmul(h.transpose()).unwrap();

        let dense = sandwich.evaluate();
        for i in 0..3 {
            for j in 0..3 {
                assert_relative_eq!(sandwich.entry(i, j), dense[(i, j)], epsilon = 1e-12);
            }
        }
        assert_relative_eq!(sandwich.diagonal(), dense.diagonal(), epsilon = 1e-12);

        let v = DVector::from_vec(vec![0.3, -1.0, 2.0]);
        assert_relative_eq!(sandwich.matvec(&v).unwrap(), &dense * &v, epsilon = 1e-10);
    }

    proptest! {
        #[test]
        fn prop_lazy_kronecker_matches_elementwise(
            n in 1usize..4,
            p in 1usize..4,
            seed in 0u64..1000,
        ) {
            let mut rng = ChaCha8Rng::seed_from_u64(seed);
            let u = random_psd(&mut rng, n);
            let v = random_psd(&mut rng, p);
            let op = LinearOperator::kron(
                LinearOperator::dense(u.clone()),
                LinearOperator::dense(v.clone()),
            );

            let expected = explicit_kron(&u, &v);
            let dense = op.evaluate();
            prop_assert!((dense.clone() - &expected).abs().max() < 1e-12);

            let x = DVector::from_fn(n * p, |i, _| (i as f64 * 0.37).sin());
            let lazy = op.matvec(&x).unwrap();
            prop_assert!((lazy - &expected * &x).abs().max() < 1e-10);

            let lazy_t = op.rmatvec(&x).unwrap();
            prop_assert!((lazy_t - expected.transpose() * &x).abs().max() < 1e-10);

            prop_assert!((op.diagonal() - expected.diagonal()).abs().max() < 1e-12);
        }
    }
}
