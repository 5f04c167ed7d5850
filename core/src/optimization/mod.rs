//! Gradient and quadratic-program solvers
//! Copyright (c) 2025 Mohammad Atashi <mohammadaliatashi@icloud.com>

pub mod adam;
pub mod qp;

pub use self::adam::{Adam, AdamConfig};
pub use self::qp::{QpError, QpSolution, QuadraticProgram};
