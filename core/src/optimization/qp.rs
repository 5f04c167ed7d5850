//! Small Dense Quadratic Programs
//!
//! Solves strictly convex inequality-constrained quadratic programs of the
//! size that appears in per-step safe control (a handful of decision
//! variables and constraints) by exact active-set enumeration.
//!
//! # Mathematical Foundations
//!
//! ```text
//! minimize   ½ xᵀ Q x + qᵀ x
//! subject to G x ≤ h
//! ```
//!
//! For a candidate active set `S` the KKT system
//! ```text
//! [ Q    G_Sᵀ ] [ x ]   [ −q  ]
//! [ G_S  0    ] [ λ ] = [ h_S ]
//! ```
//! is solved by LU. The candidate is optimal iff `λ ≥ 0` and `G x ≤ h`.
//! With `Q ≻ 0` the optimum is unique and is reached with at most `dim`
//! active constraints.
//!
//! Copyright (c) 2025 Mohammad Atashi <mohammadaliatashi@icloud.com>

use log::debug;
use nalgebra::{DMatrix, DVector};
use thiserror::Error;

/// Feasibility and multiplier tolerance
const TOLERANCE: f64 = 1e-9;

/// Upper bound on the number of inequality rows accepted
pub const MAX_CONSTRAINTS: usize = 24;

/// Quadratic program errors
#[derive(Debug, Error, Clone, PartialEq)]
pub enum QpError {
    #[error("Infeasible program: no point satisfies all {constraints} constraints")]
    Infeasible { constraints: usize },

    #[error("Hessian is not positive definite")]
    NotConvex,

    #[error("Dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("Too many constraints: {count} > {limit}")]
    TooManyConstraints { count: usize, limit: usize },

    #[error("Non-finite problem data")]
    NonFinite,
}

/// Solution of a quadratic program
#[derive(Debug, Clone, PartialEq)]
pub struct QpSolution {
    pub x: DVector<f64>,
    pub objective: f64,
    /// Indices of constraints active at the optimum
    pub active: Vec<usize>,
    /// Lagrange multipliers aligned with `active`
    pub multipliers: Vec<f64>,
}

/// Strictly convex quadratic program with linear inequalities
#[derive(Debug, Clone, PartialEq)]
pub struct QuadraticProgram {
    hessian: DMatrix<f64>,
    linear: DVector<f64>,
    rows: Vec<DVector<f64>>,
    bounds: Vec<f64>,
}

impl QuadraticProgram {
    /// Objective `½ xᵀ Q x + qᵀ x`
    pub fn new(hessian: DMatrix<f64>, linear: DVector<f64>) -> Result<Self, QpError> {
        if !hessian.is_square() || hessian.nrows() != linear.len() {
            return Err(QpError::DimensionMismatch {
                expected: linear.len(),
                actual: hessian.nrows(),
            });
        }
        Ok(Self {
            hessian,
            linear,
            rows: Vec::new(),
            bounds: Vec::new(),
        })
    }

    pub fn dim(&self) -> usize {
        self.linear.len()
    }

    pub fn num_constraints(&self) -> usize {
        self.rows.len()
    }

    /// Add `rowᵀ x ≤ bound`
    pub fn add_inequality(&mut self, row: DVector<f64>, bound: f64) -> Result<(), QpError> {
        if row.len() != self.dim() {
            return Err(QpError::DimensionMismatch {
                expected: self.dim(),
                actual: row.len(),
            });
        }
        self.rows.push(row);
        self.bounds.push(bound);
        Ok(())
    }

    /// Add `lower[i] ≤ x[i] ≤ upper[i]` for the first `lower.len()` variables
    pub fn add_box(&mut self, lower: &DVector<f64>, upper: &DVector<f64>) -> Result<(), QpError> {
        if lower.len() != upper.len() || lower.len() > self.dim() {
            return Err(QpError::DimensionMismatch {
                expected: lower.len(),
                actual: upper.len(),
            });
        }
        let dim = self.dim();
        for i in 0..lower.len() {
            let mut e = DVector::zeros(dim);
            e[i] = 1.0;
            self.add_inequality(e.clone(), upper[i])?;
            self.add_inequality(-e, -lower[i])?;
        }
        Ok(())
    }

    pub fn objective(&self, x: &DVector<f64>) -> f64 {
        0.5 * x.dot(&(&self.hessian * x)) + self.linear.dot(x)
    }

    /// Largest constraint violation at `x` (non-positive when feasible)
    pub fn max_violation(&self, x: &DVector<f64>) -> f64 {
        self.rows
            .iter()
            .zip(&self.bounds)
            .map(|(row, bound)| row.dot(x) - bound)
            .fold(f64::NEG_INFINITY, f64::max)
    }

    /// Solve by enumerating active sets of increasing size
    pub fn solve(&self) -> Result<QpSolution, QpError> {
        let count = self.rows.len();
        if count > MAX_CONSTRAINTS {
            return Err(QpError::TooManyConstraints {
                count,
                limit: MAX_CONSTRAINTS,
            });
        }
        let finite = self.hessian.iter().all(|v| v.is_finite())
            && self.linear.iter().all(|v| v.is_finite())
            && self.rows.iter().all(|r| r.iter().all(|v| v.is_finite()))
            && self.bounds.iter().all(|v| v.is_finite());
        if !finite {
            return Err(QpError::NonFinite);
        }
        if self.hessian.clone().cholesky().is_none() {
            return Err(QpError::NotConvex);
        }

        let scale = 1.0 + self.bounds.iter().fold(0.0_f64, |acc, b| acc.max(b.abs()));
        let mut best: Option<QpSolution> = None;
        let mut examined = 0usize;

        for size in 0..=self.dim().min(count) {
            for subset in Combinations::new(count, size) {
                examined += 1;
                let Some((x, lambda)) = self.solve_kkt(&subset) else {
                    continue;
                };
                if lambda.iter().any(|&l| l < -TOLERANCE * scale) {
                    continue;
                }
                if count > 0 && self.max_violation(&x) > TOLERANCE * scale {
                    continue;
                }

                let objective = self.objective(&x);
                let improves = best
                    .as_ref()
                    .map_or(true, |b| objective < b.objective - TOLERANCE * scale);
                if improves {
                    best = Some(QpSolution {
                        x,
                        objective,
                        active: subset,
                        multipliers: lambda.iter().copied().collect(),
                    });
                }
            }
            // The KKT point of a strictly convex program is unique
            if best.is_some() {
                break;
            }
        }

        debug!("QP: examined {} active sets over {} constraints", examined, count);
        best.ok_or(QpError::Infeasible { constraints: count })
    }

    fn solve_kkt(&self, active: &[usize]) -> Option<(DVector<f64>, DVector<f64>)> {
        let d = self.dim();
        let k = active.len();
        let mut kkt = DMatrix::zeros(d + k, d + k);
        let mut rhs = DVector::zeros(d + k);

        kkt.view_mut((0, 0), (d, d)).copy_from(&self.hessian);
        rhs.rows_mut(0, d).copy_from(&(-&self.linear));
        for (j, &index) in active.iter().enumerate() {
            let row = &self.rows[index];
            for i in 0..d {
                kkt[(i, d + j)] = row[i];
                kkt[(d + j, i)] = row[i];
            }
            rhs[d + j] = self.bounds[index];
        }

        let solution = kkt.lu().solve(&rhs)?;
        if solution.iter().any(|v| !v.is_finite()) {
            return None;
        }
        Some((
            solution.rows(0, d).into_owned(),
            solution.rows(d, k).into_owned(),
        ))
    }
}

/// Lexicographic `k`-subsets of `0..n`
struct Combinations {
    n: usize,
    indices: Vec<usize>,
    done: bool,
}

impl Combinations {
    fn new(n: usize, k: usize) -> Self {
        Self {
            n,
            indices: (0..k).collect(),
            done: k > n,
        }
    }
}

impl Iterator for Combinations {
    type Item = Vec<usize>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let current = self.indices.clone();

        let k = self.indices.len();
        let mut i = k;
        loop {
            if i == 0 {
                self.done = true;
                break;
            }
            i -= 1;
            if self.indices[i] < self.n - k + i {
                self.indices[i] += 1;
                for j in i + 1..k {
                    self.indices[j] = self.indices[j - 1] + 1;
                }
                break;
            }
        }
        Some(current)
    }
}
