//! Structured linear operators and robust factorizations
//! Copyright (c) 2025 Mohammad Atashi <mohammadaliatashi@icloud.com>

pub mod cholesky;
pub mod operator;

pub use self::cholesky::{jittered_cholesky, CholeskyError, JitteredCholesky};
pub use self::operator::{LinearOperator, OperatorError};
