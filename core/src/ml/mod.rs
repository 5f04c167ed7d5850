//! Matrix-variate Gaussian process over control-affine dynamics
//! Copyright (c) 2025 Mohammad Atashi <mohammadaliatashi@icloud.com>

pub mod batch;
pub mod gp;
pub mod kernel;
pub mod mean;

pub use self::batch::{BatchLayout, DecodedBatch, Observation};
pub use self::gp::{ControlAffineGp, FitReport, GpConfig, GpError, Prediction, RetrainBudget};
pub use self::kernel::{
    HeterogeneousKernel, KernelError, KernelEvaluation, KernelHyperparameters, RbfKernel,
    TaskCovariance,
};
pub use self::mean::HeterogeneousMean;
