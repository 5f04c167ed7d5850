//! Controller configuration
//!
//! Every tunable of the safe control loop lives in one serde-backed
//! structure tree with defaults, so experiments can be described in JSON
//! and validated before a controller is built.
//!
//! Copyright (c) 2025 Mohammad Atashi <mohammadaliatashi@icloud.com>

use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::control::barrier::CircularObstacle;
use crate::control::schedule::EpsilonSchedule;
use crate::ml::gp::GpConfig;
use crate::optimization::qp::MAX_CONSTRAINTS;

/// Configuration errors
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConfigError {
    #[error("Invalid configuration: {field}: {reason}")]
    Invalid { field: String, reason: String },

    #[error("Malformed configuration JSON: {0}")]
    Parse(String),
}

fn invalid(field: &str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field: field.to_string(),
        reason: reason.into(),
    }
}

/// Where the controller's dynamics estimate comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ModelSource {
    /// GP residual on top of a prior mean model
    #[default]
    Learned,
    /// Caller-supplied exact model
    GroundTruth,
}

/// Bound on the observation log and what to discard when it is full
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RetentionPolicy {
    /// Ring buffer: discard the oldest observation
    #[default]
    DropOldest,
    /// Halve the log by keeping every other observation
    Decimate,
}

/// Quadratic one-step goal cost
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GoalConfig {
    pub state: Vec<f64>,
    /// Diagonal of the state weight `P`
    pub state_weight: Vec<f64>,
    /// Diagonal of the control weight `R`
    pub ctrl_weight: Vec<f64>,
    /// Trade-off `λ` between reaching the goal and control effort
    pub lambda: f64,
}

impl Default for GoalConfig {
    fn default() -> Self {
        Self {
            state: vec![1.0, 1.0],
            state_weight: vec![1.0, 1.0],
            ctrl_weight: vec![1.0, 1.0],
            lambda: 0.5,
        }
    }
}

impl GoalConfig {
    pub fn goal(&self) -> DVector<f64> {
        DVector::from_column_slice(&self.state)
    }

    pub fn state_weight_matrix(&self) -> DMatrix<f64> {
        DMatrix::from_diagonal(&DVector::from_column_slice(&self.state_weight))
    }

    pub fn ctrl_weight_matrix(&self) -> DMatrix<f64> {
        DMatrix::from_diagonal(&DVector::from_column_slice(&self.ctrl_weight))
    }
}

/// Circular obstacle barrier
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BarrierConfig {
    pub center: [f64; 2],
    pub radius: f64,
    /// Class-K gain `γ`
    pub gamma: f64,
    #[serde(default)]
    pub offset: usize,
}

impl Default for BarrierConfig {
    fn default() -> Self {
        Self {
            center: [0.0, 0.0],
            radius: 0.5,
            gamma: 1.0,
            offset: 0,
        }
    }
}

impl BarrierConfig {
    pub fn obstacle(&self, state_dim: usize) -> CircularObstacle {
        CircularObstacle {
            center: self.center,
            radius: self.radius,
            offset: self.offset,
            state_dim,
        }
    }
}

/// Optional Lyapunov tracking constraint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClfConfig {
    /// Diagonal of the tracking weight
    pub weight: Vec<f64>,
    pub gamma: f64,
    /// Quadratic penalty on the slack `δ`
    pub slack_weight: f64,
}

impl Default for ClfConfig {
    fn default() -> Self {
        Self {
            weight: vec![1.0, 1.0],
            gamma: 1.0,
            slack_weight: 100.0,
        }
    }
}

/// Full controller configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// Integration step used in the goal cost
    pub dt: f64,
    /// Number of control steps the loop will serve
    pub horizon: usize,
    pub train_every_n_steps: usize,
    pub min_train_points: usize,
    pub max_train: usize,
    pub retention: RetentionPolicy,
    pub max_unsafe_prob: f64,
    pub ctrl_lower: Vec<f64>,
    pub ctrl_upper: Vec<f64>,
    pub epsilon: EpsilonSchedule,
    pub goal: GoalConfig,
    pub barriers: Vec<BarrierConfig>,
    pub clf: Option<ClfConfig>,
    pub model: ModelSource,
    pub gp: GpConfig,
    /// Wall-clock limit for one retrain, in milliseconds
    pub retrain_timeout_ms: Option<u64>,
    /// Re-solves after re-evaluating the chance margin at the solution
    pub refinement_passes: usize,
    pub seed: u64,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            dt: 0.01,
            horizon: 1000,
            train_every_n_steps: 10,
            min_train_points: 10,
            max_train: 200,
            retention: RetentionPolicy::DropOldest,
            max_unsafe_prob: 0.01,
            ctrl_lower: vec![-1.0, -1.0],
            ctrl_upper: vec![1.0, 1.0],
            epsilon: EpsilonSchedule::default(),
            goal: GoalConfig::default(),
            barriers: vec![BarrierConfig::default()],
            clf: None,
            model: ModelSource::Learned,
            gp: GpConfig {
                iterations: 100,
                ..GpConfig::default()
            },
            retrain_timeout_ms: None,
            refinement_passes: 2,
            seed: 0,
        }
    }
}

impl ControllerConfig {
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(json).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    pub fn to_json(&self) -> Result<String, ConfigError> {
        serde_json::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    pub fn ctrl_bounds(&self) -> (DVector<f64>, DVector<f64>) {
        (
            DVector::from_column_slice(&self.ctrl_lower),
            DVector::from_column_slice(&self.ctrl_upper),
        )
    }

    /// Dimension-independent checks
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.dt > 0.0 && self.dt.is_finite()) {
            return Err(invalid("dt", format!("must be positive, got {}", self.dt)));
        }
        if self.horizon == 0 {
            return Err(invalid("horizon", "must be positive"));
        }
        if self.train_every_n_steps == 0 {
            return Err(invalid("train_every_n_steps", "must be positive"));
        }
        if self.min_train_points == 0 {
            return Err(invalid("min_train_points", "must be at least 1"));
        }
        if self.max_train == 0 || self.max_train < self.min_train_points {
            return Err(invalid(
                "max_train",
                format!(
                    "{} must be positive and at least min_train_points {}",
                    self.max_train, self.min_train_points
                ),
            ));
        }
        if !(self.max_unsafe_prob > 0.0 && self.max_unsafe_prob <= 0.5) {
            let reason = format!("{} outside (0, 0.5]", self.max_unsafe_prob);
            return Err(invalid("max_unsafe_prob", reason));
        }
        if self.ctrl_lower.len() != self.ctrl_upper.len() {
            return Err(invalid("ctrl_range", "lower and upper bounds differ in length"));
        }
        let empty = (0..self.ctrl_lower.len())
            .find(|&i| !(self.ctrl_lower[i] < self.ctrl_upper[i]));
        if let Some(i) = empty {
            return Err(invalid("ctrl_range", format!("empty range in dimension {}", i)));
        }
        if !self.epsilon.is_valid() {
            return Err(invalid("epsilon", "requires 0 < end <= start <= 1"));
        }
        if !(self.goal.lambda > 0.0 && self.goal.lambda <= 1.0) {
            return Err(invalid("goal.lambda", format!("{} outside (0, 1]", self.goal.lambda)));
        }
        if self.goal.ctrl_weight.iter().any(|&w| w <= 0.0) {
            return Err(invalid("goal.ctrl_weight", "weights must be positive"));
        }
        if self.goal.state_weight.iter().any(|&w| w < 0.0) {
            return Err(invalid("goal.state_weight", "weights must be non-negative"));
        }
        for (i, barrier) in self.barriers.iter().enumerate() {
            if !(barrier.radius > 0.0) || !(barrier.gamma > 0.0) {
                return Err(invalid(
                    &format!("barriers[{}]", i),
                    "radius and gamma must be positive",
                ));
            }
        }
        if let Some(clf) = &self.clf {
            if !(clf.gamma > 0.0) || !(clf.slack_weight > 0.0) {
                return Err(invalid("clf", "gamma and slack_weight must be positive"));
            }
        }
        if !(self.gp.noise_variance > 0.0) || !(self.gp.learning_rate > 0.0) {
            return Err(invalid("gp", "noise_variance and learning_rate must be positive"));
        }
        let clf_rows = if self.clf.is_some() { 2 } else { 0 };
        let rows = 2 * self.ctrl_lower.len() + self.barriers.len() + clf_rows;
        if rows > MAX_CONSTRAINTS {
            let reason = format!("{} constraint rows exceed {}", rows, MAX_CONSTRAINTS);
            return Err(invalid("barriers", reason));
        }
        Ok(())
    }

    /// Full validation against the system's dimensions
    pub fn validate_for(&self, state_dim: usize, ctrl_dim: usize) -> Result<(), ConfigError> {
        self.validate()?;
        let expect = |field: &str, actual: usize, expected: usize| {
            if actual == expected {
                Ok(())
            } else {
                Err(invalid(
                    field,
                    format!("length {} does not match dimension {}", actual, expected),
                ))
            }
        };
        expect("ctrl_lower", self.ctrl_lower.len(), ctrl_dim)?;
        expect("goal.state", self.goal.state.len(), state_dim)?;
        expect("goal.state_weight", self.goal.state_weight.len(), state_dim)?;
        expect("goal.ctrl_weight", self.goal.ctrl_weight.len(), ctrl_dim)?;
        if let Some(clf) = &self.clf {
            expect("clf.weight", clf.weight.len(), state_dim)?;
        }
        for (i, barrier) in self.barriers.iter().enumerate() {
            if barrier.offset + 2 > state_dim {
                return Err(invalid(
                    &format!("barriers[{}].offset", i),
                    format!("{} + 2 exceeds state dimension {}", barrier.offset, state_dim),
                ));
            }
        }
        Ok(())
    }
}
