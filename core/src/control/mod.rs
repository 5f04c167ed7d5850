//! Safe control on learned control-affine dynamics
//! Barrier and tracking functions, chance constraints and the exploring controller
//! Copyright (c) 2025 Mohammad Atashi <mohammadaliatashi@icloud.com>

pub mod barrier;
pub mod constraint;
pub mod controller;
pub mod dynamics;
pub mod retrain;
pub mod schedule;
pub mod simulate;

pub use self::barrier::{CircularObstacle, GoalCost, QuadraticTracking, ScalarField};
pub use self::constraint::{
    barrier_constraint, chance_quantile, lyapunov_constraint, AffineConstraint, ConstraintError,
};
pub use self::controller::{
    ControlError, ControlStep, Fallback, Mode, RetrainOutcome, SafeController, Severity, StepStatus,
    TrainingLog,
};
pub use self::dynamics::{
    ConstantPlanner, ControlAffine, DynamicsEstimate, LearnedDynamics, Planner, Visualizer,
    ZeroDynamics,
};
pub use self::retrain::{retrain_with_timeout, RetrainError, SharedModel};
pub use self::schedule::EpsilonSchedule;
pub use self::simulate::{run_episode, Episode};
