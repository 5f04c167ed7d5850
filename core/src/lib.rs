//! BASTION Core
//! Bayesian safe control with online-learned control-affine dynamics
//!
//! A matrix-variate Gaussian process learns `ẋ = f(x) + g(x) u` from
//! measured transitions, and its posterior uncertainty tightens control
//! barrier conditions into chance constraints solved as a small QP at
//! every step.
//!
//! Copyright (c) 2025 Mohammad Atashi <mohammadaliatashi@icloud.com>

pub mod config;
pub mod control;
pub mod data_structures;
pub mod linalg;
pub mod ml;
pub mod optimization;

pub use self::config::{ControllerConfig, ModelSource, RetentionPolicy};
pub use self::control::{run_episode, ControlAffine, Episode, SafeController};
pub use self::ml::ControlAffineGp;
