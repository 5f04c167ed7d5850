//! Safe Control-Loop Orchestrator
//!
//! Each step either explores with a safety-filtered random action or
//! exploits the learned model by minimizing a one-step goal cost, always
//! subject to chance-tightened barrier constraints.
//!
//! # Control Step
//! ```text
//! 1. retrain   if step > 0 ∧ step mod N = 0 ∧ |log| ≥ n_min
//! 2. explore   with probability ε(step)
//!      explore:  min ‖u − u_rand‖²           s.t. A u ≤ b, u ∈ U
//!      exploit:  min J(u) (+ w δ²)           s.t. A u ≤ b, CLF ≤ δ, u ∈ U
//! 3. fallback  last safe action if it satisfies A u ≤ b, else 0
//! ```
//!
//! Copyright (c) 2025 Mohammad Atashi <mohammadaliatashi@icloud.com>

use std::collections::VecDeque;
use std::time::Duration;

use log::{debug, info, warn};
use nalgebra::{DMatrix, DVector};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::config::{ClfConfig, ConfigError, ControllerConfig, ModelSource, RetentionPolicy};
use crate::control::barrier::{CircularObstacle, GoalCost, QuadraticTracking, ScalarField};
use crate::control::constraint::{
    barrier_constraint, chance_quantile, lyapunov_constraint, AffineConstraint, ConstraintError,
};
use crate::control::dynamics::{
    ConstantPlanner, ControlAffine, DynamicsEstimate, LearnedDynamics, Planner, Visualizer,
    ZeroDynamics,
};
use crate::control::retrain::{RetrainError, SharedModel};
use crate::ml::batch::Observation;
use crate::ml::gp::{ControlAffineGp, FitReport, GpError, RetrainBudget};
use crate::optimization::qp::{QpError, QuadraticProgram};

/// Convergence threshold of the chance-margin refinement
const REFINEMENT_TOLERANCE: f64 = 1e-6;

/// Control loop errors
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ControlError {
    #[error("Safety constraints infeasible ({constraints} rows)")]
    InfeasibleConstraint { constraints: usize },

    #[error("QP failure: {0}")]
    Qp(QpError),

    #[error("GP failure: {0}")]
    Gp(#[from] GpError),

    #[error("Retraining failure: {0}")]
    Retrain(#[from] RetrainError),

    #[error("Constraint failure: {0}")]
    Constraint(#[from] ConstraintError),

    #[error("Configuration failure: {0}")]
    Config(#[from] ConfigError),

    #[error("Dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("Step budget of {horizon} steps exhausted")]
    StepBudgetExhausted { horizon: usize },
}

impl From<QpError> for ControlError {
    fn from(error: QpError) -> Self {
        match error {
            QpError::Infeasible { constraints } => {
                ControlError::InfeasibleConstraint { constraints }
            }
            other => ControlError::Qp(other),
        }
    }
}

/// Which branch of the epsilon-greedy decision produced the action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Mode {
    Explore,
    ExploitSafe,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Severity {
    Info,
    Warning,
}

/// Action substituted for an infeasible safe program
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Fallback {
    /// Previous safe action, still satisfying the current constraints
    LastSafe,
    /// Zero control
    Zero,
}

/// Result of a scheduled retrain
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RetrainOutcome {
    Retrained(FitReport),
    /// Fit failed or was cancelled; the previous model stays in place
    KeptPrevious { reason: String },
}

/// Diagnostic record of one control step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepStatus {
    pub step: usize,
    pub mode: Mode,
    pub epsilon: f64,
    pub model_id: Option<Uuid>,
    pub retrain: Option<RetrainOutcome>,
    pub fallback: Option<Fallback>,
    /// QP solves spent on chance-margin refinement
    pub solves: usize,
    /// Chance margins `z σ` of the barrier constraints in force
    pub margins: Vec<f64>,
}

impl StepStatus {
    pub fn severity(&self) -> Severity {
        let kept_previous = matches!(self.retrain, Some(RetrainOutcome::KeptPrevious { .. }));
        if self.fallback.is_some() || kept_previous {
            Severity::Warning
        } else {
            Severity::Info
        }
    }
}

/// Action chosen for a step together with its diagnostics
#[derive(Debug, Clone, PartialEq)]
pub struct ControlStep {
    pub action: DVector<f64>,
    pub status: StepStatus,
}

/// Bounded observation log
#[derive(Debug, Clone, PartialEq)]
pub struct TrainingLog {
    entries: VecDeque<Observation>,
    capacity: usize,
    policy: RetentionPolicy,
    total_recorded: usize,
}

impl TrainingLog {
    pub fn new(capacity: usize, policy: RetentionPolicy) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
            policy,
            total_recorded: 0,
        }
    }

    pub fn push(&mut self, observation: Observation) {
        if self.entries.len() >= self.capacity {
            match self.policy {
                RetentionPolicy::DropOldest => {
                    self.entries.pop_front();
                }
                RetentionPolicy::Decimate => {
                    // Keep every other entry, counting back from the newest
                    let len = self.entries.len();
                    let mut index = 0;
                    self.entries.retain(|_| {
                        let keep = (len - 1 - index) % 2 == 0;
                        index += 1;
                        keep
                    });
                    while self.entries.len() >= self.capacity {
                        self.entries.pop_front();
                    }
                }
            }
        }
        self.entries.push_back(observation);
        self.total_recorded += 1;
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn total_recorded(&self) -> usize {
        self.total_recorded
    }

    pub fn iter(&self) -> impl Iterator<Item = &Observation> {
        self.entries.iter()
    }
}

enum Backend {
    Learned(LearnedDynamics),
    GroundTruth(Box<dyn ControlAffine + Send + Sync>),
}

/// Chance-constrained epsilon-greedy controller with online model learning
pub struct SafeController {
    config: ControllerConfig,
    state_dim: usize,
    ctrl_dim: usize,
    backend: Backend,
    barriers: Vec<(CircularObstacle, f64)>,
    tracking: Option<(QuadraticTracking, ClfConfig)>,
    planner: Box<dyn Planner + Send + Sync>,
    visualizer: Option<Box<dyn Visualizer + Send>>,
    log: TrainingLog,
    step: usize,
    last_safe: Option<DVector<f64>>,
    quantile: f64,
    rng: ChaCha8Rng,
}

impl std::fmt::Debug for SafeController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SafeController")
            .field("state_dim", &self.state_dim)
            .field("ctrl_dim", &self.ctrl_dim)
            .field("step", &self.step)
            .field("log_len", &self.log.len())
            .field("last_safe", &self.last_safe)
            .finish()
    }
}

impl SafeController {
    /// Learned model on a zero prior mean
    pub fn learned(
        config: ControllerConfig,
        state_dim: usize,
        ctrl_dim: usize,
    ) -> Result<Self, ControlError> {
        Self::learned_with_prior(config, Box::new(ZeroDynamics::new(state_dim, ctrl_dim)))
    }

    /// Learned GP residual on top of `prior`
    pub fn learned_with_prior(
        config: ControllerConfig,
        prior: Box<dyn ControlAffine + Send + Sync>,
    ) -> Result<Self, ControlError> {
        let (state_dim, ctrl_dim) = (prior.state_size(), prior.ctrl_size());
        let gp = ControlAffineGp::new(state_dim, ctrl_dim, config.gp.clone());
        let backend = Backend::Learned(LearnedDynamics::new(gp, prior));
        Self::build(config, state_dim, ctrl_dim, backend)
    }

    /// Exact model supplied by the caller
    pub fn ground_truth(
        config: ControllerConfig,
        model: Box<dyn ControlAffine + Send + Sync>,
    ) -> Result<Self, ControlError> {
        let (state_dim, ctrl_dim) = (model.state_size(), model.ctrl_size());
        Self::build(config, state_dim, ctrl_dim, Backend::GroundTruth(model))
    }

    /// Select the backend from `config.model`
    ///
    /// `system` is used as the model for [`ModelSource::GroundTruth`] and
    /// only for its dimensions otherwise.
    pub fn from_config(
        config: ControllerConfig,
        system: Box<dyn ControlAffine + Send + Sync>,
    ) -> Result<Self, ControlError> {
        match config.model {
            ModelSource::GroundTruth => Self::ground_truth(config, system),
            ModelSource::Learned => {
                let (state_dim, ctrl_dim) = (system.state_size(), system.ctrl_size());
                Self::learned(config, state_dim, ctrl_dim)
            }
        }
    }

    fn build(
        config: ControllerConfig,
        state_dim: usize,
        ctrl_dim: usize,
        backend: Backend,
    ) -> Result<Self, ControlError> {
        config.validate_for(state_dim, ctrl_dim)?;
        let quantile = chance_quantile(config.max_unsafe_prob)?;
        let barriers = config
            .barriers
            .iter()
            .map(|b| (b.obstacle(state_dim), b.gamma))
            .collect();
        let tracking = config.clf.as_ref().map(|clf| {
            let weight = DMatrix::from_diagonal(&DVector::from_column_slice(&clf.weight));
            (QuadraticTracking::new(weight), clf.clone())
        });
        let planner = Box::new(ConstantPlanner {
            goal: config.goal.goal(),
        });

        info!(
            "Safe controller: {} states, {} inputs, {} barriers, model {:?}",
            state_dim,
            ctrl_dim,
            config.barriers.len(),
            config.model
        );

        Ok(Self {
            log: TrainingLog::new(config.max_train, config.retention),
            rng: ChaCha8Rng::seed_from_u64(config.seed),
            config,
            state_dim,
            ctrl_dim,
            backend,
            barriers,
            tracking,
            planner,
            visualizer: None,
            step: 0,
            last_safe: None,
            quantile,
        })
    }

    pub fn with_planner(mut self, planner: Box<dyn Planner + Send + Sync>) -> Self {
        self.planner = planner;
        self
    }

    pub fn with_visualizer(mut self, visualizer: Box<dyn Visualizer + Send>) -> Self {
        self.visualizer = Some(visualizer);
        self
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    pub fn step_count(&self) -> usize {
        self.step
    }

    pub fn log(&self) -> &TrainingLog {
        &self.log
    }

    pub fn last_safe_action(&self) -> Option<&DVector<f64>> {
        self.last_safe.as_ref()
    }

    /// Shared GP handle when the model is learned
    pub fn shared_model(&self) -> Option<&SharedModel> {
        match &self.backend {
            Backend::Learned(learned) => Some(learned.shared_model()),
            Backend::GroundTruth(_) => None,
        }
    }

    pub fn model_id(&self) -> Option<Uuid> {
        self.shared_model()
            .and_then(|shared| shared.with_model(|gp| gp.model_id()).ok())
            .flatten()
    }

    /// Barrier values `h(x)`, one per obstacle
    pub fn barrier_values(&self, x: &DVector<f64>) -> Vec<f64> {
        self.barriers.iter().map(|(obstacle, _)| obstacle.value(x)).collect()
    }

    /// Current dynamics estimate at `x`
    pub fn estimate(&self, x: &DVector<f64>) -> Result<DynamicsEstimate, ControlError> {
        self.check_len(x.len(), self.state_dim)?;
        match &self.backend {
            Backend::Learned(learned) => Ok(learned.estimate(x)?),
            Backend::GroundTruth(model) => Ok(DynamicsEstimate::from_model(&**model, x)),
        }
    }

    /// Append a derivative observation to the training log
    pub fn record(
        &mut self,
        x: &DVector<f64>,
        u: &DVector<f64>,
        xdot: &DVector<f64>,
    ) -> Result<(), ControlError> {
        self.check_len(x.len(), self.state_dim)?;
        self.check_len(u.len(), self.ctrl_dim)?;
        self.check_len(xdot.len(), self.state_dim)?;
        self.log.push(Observation::Derivative {
            x: x.clone(),
            u: u.clone(),
            xdot: xdot.clone(),
        });
        Ok(())
    }

    /// Append any observation to the training log
    pub fn record_observation(&mut self, observation: Observation) -> Result<(), ControlError> {
        self.check_len(observation.state().len(), self.state_dim)?;
        match &observation {
            Observation::Derivative { u, xdot, .. } => {
                self.check_len(u.len(), self.ctrl_dim)?;
                self.check_len(xdot.len(), self.state_dim)?;
            }
            Observation::Value { f, g, .. } => {
                self.check_len(f.len(), self.state_dim)?;
                self.check_len(g.nrows(), self.state_dim)?;
                self.check_len(g.ncols(), self.ctrl_dim)?;
            }
        }
        self.log.push(observation);
        Ok(())
    }

    /// Unconstrained goal-seeking action `u* = argmin J(u)`
    pub fn goal_control(&self, x: &DVector<f64>) -> Result<DVector<f64>, ControlError> {
        let estimate = self.estimate(x)?;
        let (hessian, linear) = self.goal_quadratic(x, &estimate);
        let cholesky = hessian.cholesky().ok_or(ControlError::Qp(QpError::NotConvex))?;
        Ok(cholesky.solve(&(-linear)))
    }

    /// Choose the action for state `x` at time `t`
    pub fn control(&mut self, x: &DVector<f64>, t: f64) -> Result<ControlStep, ControlError> {
        self.check_len(x.len(), self.state_dim)?;
        if self.step >= self.config.horizon {
            return Err(ControlError::StepBudgetExhausted {
                horizon: self.config.horizon,
            });
        }

        let retrain = self.maybe_retrain()?;
        let estimate = self.estimate(x)?;
        let epsilon = self.config.epsilon.epsilon(self.step);
        let explore = self.rng.gen_bool(epsilon);

        let (mode, random_action) = if explore {
            let u: Vec<f64> = self
                .config
                .ctrl_lower
                .iter()
                .zip(&self.config.ctrl_upper)
                .map(|(&lo, &hi)| self.rng.gen_range(lo..hi))
                .collect();
            (Mode::Explore, Some(DVector::from_vec(u)))
        } else {
            (Mode::ExploitSafe, None)
        };

        let (action, fallback, solves, margins) =
            match self.solve_safe(x, t, &estimate, random_action.as_ref()) {
                Ok((u, solves, margins)) => {
                    self.last_safe = Some(u.clone());
                    (u, None, solves, margins)
                }
                Err(ControlError::InfeasibleConstraint { constraints }) => {
                    let reference = self
                        .last_safe
                        .clone()
                        .unwrap_or_else(|| DVector::zeros(self.ctrl_dim));
                    let current = self.barrier_constraints(x, &estimate, &reference)?;
                    let (lower, upper) = self.config.ctrl_bounds();
                    let (u, fallback) =
                        select_fallback(self.last_safe.as_ref(), &current, &lower, &upper);
                    warn!(
                        "Step {}: {} constraints infeasible in {:?} mode, falling back to {:?}",
                        self.step, constraints, mode, fallback
                    );
                    let margins = current.iter().map(|c| c.margin).collect();
                    (u, Some(fallback), 0, margins)
                }
                Err(other) => return Err(other),
            };

        if let Some(visualizer) = self.visualizer.as_mut() {
            let dt = self.config.dt;
            let next = x + estimate.xdot(&action) * dt;
            let covariance = estimate.xdot_covariance(&action) * (dt * dt);
            visualizer.set_state_control(x, &action, t, &next, &covariance);
        }

        let status = StepStatus {
            step: self.step,
            mode,
            epsilon,
            model_id: self.model_id(),
            retrain,
            fallback,
            solves,
            margins,
        };
        debug!("Step {}: {:?} action {:?}", self.step, mode, action.as_slice());
        self.step += 1;

        Ok(ControlStep { action, status })
    }

    fn maybe_retrain(&self) -> Result<Option<RetrainOutcome>, ControlError> {
        let Backend::Learned(learned) = &self.backend else {
            return Ok(None);
        };
        let due = self.step > 0 && self.step % self.config.train_every_n_steps == 0;
        if !due || self.log.is_empty() || self.log.len() < self.config.min_train_points {
            return Ok(None);
        }

        let budget = self
            .config
            .retrain_timeout_ms
            .map(|ms| RetrainBudget::with_timeout(Duration::from_millis(ms)))
            .unwrap_or_default();
        let gp = &self.config.gp;

        match learned.retrain(self.log.iter(), gp.iterations, gp.learning_rate, &budget) {
            Ok(report) => {
                info!(
                    "Step {}: retrained on {} observations, model {}",
                    self.step, report.training_points, report.model_id
                );
                Ok(Some(RetrainOutcome::Retrained(report)))
            }
            Err(RetrainError::Gp(
                error @ (GpError::TrainingDiverged { .. } | GpError::Cancelled { .. }),
            )) => {
                warn!("Step {}: retrain failed, keeping previous model: {}", self.step, error);
                Ok(Some(RetrainOutcome::KeptPrevious {
                    reason: error.to_string(),
                }))
            }
            Err(error @ RetrainError::TimedOut { .. }) => {
                warn!("Step {}: {}, keeping previous model", self.step, error);
                Ok(Some(RetrainOutcome::KeptPrevious {
                    reason: error.to_string(),
                }))
            }
            Err(other) => Err(other.into()),
        }
    }

    fn barrier_constraints(
        &self,
        x: &DVector<f64>,
        estimate: &DynamicsEstimate,
        u_ref: &DVector<f64>,
    ) -> Result<Vec<AffineConstraint>, ControlError> {
        self.barriers
            .iter()
            .enumerate()
            .map(|(i, (obstacle, gamma))| {
                barrier_constraint(
                    &format!("obstacle_{}", i),
                    obstacle,
                    *gamma,
                    x,
                    estimate,
                    self.quantile,
                    u_ref,
                )
                .map_err(ControlError::from)
            })
            .collect()
    }

    /// `(H, c)` with `J(u) = J(0) + cᵀu + ½ uᵀHu`
    fn goal_quadratic(
        &self,
        x: &DVector<f64>,
        estimate: &DynamicsEstimate,
    ) -> (DMatrix<f64>, DVector<f64>) {
        let goal = self.config.goal.goal();
        let state_weight = self.config.goal.state_weight_matrix();
        let ctrl_weight = self.config.goal.ctrl_weight_matrix();
        let cost = GoalCost {
            x,
            f: &estimate.f,
            g: &estimate.g,
            goal: &goal,
            state_weight: &state_weight,
            ctrl_weight: &ctrl_weight,
            lambda: self.config.goal.lambda,
            dt: self.config.dt,
        };
        let (_, linear, hessian) = cost.quadratize(&DVector::zeros(self.ctrl_dim));
        (hessian, linear)
    }

    /// Solve the safe program, re-evaluating chance margins at the solution
    fn solve_safe(
        &self,
        x: &DVector<f64>,
        t: f64,
        estimate: &DynamicsEstimate,
        random_action: Option<&DVector<f64>>,
    ) -> Result<(DVector<f64>, usize, Vec<f64>), ControlError> {
        let m = self.ctrl_dim;
        let mut u_ref = match random_action {
            Some(u) => u.clone(),
            None => self.last_safe.clone().unwrap_or_else(|| DVector::zeros(m)),
        };

        let passes = if estimate.covariance.is_some() {
            self.config.refinement_passes + 1
        } else {
            1
        };

        let mut solves = 0;
        let mut result = None;
        for _ in 0..passes {
            let barriers = self.barrier_constraints(x, estimate, &u_ref)?;
            let program = match random_action {
                Some(target) => self.filter_program(target, &barriers)?,
                None => self.goal_program(x, t, estimate, &barriers, &u_ref)?,
            };

            let solution = program.solve()?;
            solves += 1;
            let u = solution.x.rows(0, m).into_owned();
            let converged = (&u - &u_ref).norm() < REFINEMENT_TOLERANCE;
            u_ref = u.clone();
            result = Some((u, barriers.iter().map(|c| c.margin).collect::<Vec<_>>()));
            if converged {
                break;
            }
        }

        match result {
            Some((u, margins)) => Ok((u, solves, margins)),
            None => Err(ControlError::InfeasibleConstraint { constraints: 0 }),
        }
    }

    /// `min ‖u − u_rand‖²` subject to the barriers and the box
    fn filter_program(
        &self,
        target: &DVector<f64>,
        barriers: &[AffineConstraint],
    ) -> Result<QuadraticProgram, ControlError> {
        let m = self.ctrl_dim;
        let mut program = QuadraticProgram::new(DMatrix::identity(m, m), -target)?;
        for constraint in barriers {
            program.add_inequality(constraint.a.clone(), constraint.b)?;
        }
        let (lower, upper) = self.config.ctrl_bounds();
        program.add_box(&lower, &upper)?;
        Ok(program)
    }

    /// Goal cost with optional slack-relaxed tracking constraint
    fn goal_program(
        &self,
        x: &DVector<f64>,
        t: f64,
        estimate: &DynamicsEstimate,
        barriers: &[AffineConstraint],
        u_ref: &DVector<f64>,
    ) -> Result<QuadraticProgram, ControlError> {
        let m = self.ctrl_dim;
        let (hessian, linear) = self.goal_quadratic(x, estimate);
        let slack = usize::from(self.tracking.is_some());
        let dim = m + slack;

        let mut h = DMatrix::zeros(dim, dim);
        h.view_mut((0, 0), (m, m)).copy_from(&hessian);
        let mut q = DVector::zeros(dim);
        q.rows_mut(0, m).copy_from(&linear);
        if let Some((_, clf)) = &self.tracking {
            h[(m, m)] = 2.0 * clf.slack_weight;
        }

        let mut program = QuadraticProgram::new(h, q)?;
        let pad = |a: &DVector<f64>, slack_coefficient: f64| {
            let mut row = DVector::zeros(dim);
            row.rows_mut(0, m).copy_from(a);
            if slack == 1 {
                row[m] = slack_coefficient;
            }
            row
        };

        for constraint in barriers {
            program.add_inequality(pad(&constraint.a, 0.0), constraint.b)?;
        }
        if let Some((tracking, clf)) = &self.tracking {
            let x_p = self.planner.plan(t);
            let xdot_p = self.planner.dot_plan(t);
            let lyapunov = lyapunov_constraint(
                "tracking",
                tracking,
                clf.gamma,
                x,
                &x_p,
                &xdot_p,
                estimate,
                self.quantile,
                u_ref,
            )?;
            program.add_inequality(pad(&lyapunov.a, -1.0), lyapunov.b)?;

            let mut nonnegative = DVector::zeros(dim);
            nonnegative[m] = -1.0;
            program.add_inequality(nonnegative, 0.0)?;
        }

        let (lower, upper) = self.config.ctrl_bounds();
        program.add_box(&lower, &upper)?;
        Ok(program)
    }

    fn check_len(&self, actual: usize, expected: usize) -> Result<(), ControlError> {
        if actual != expected {
            return Err(ControlError::DimensionMismatch { expected, actual });
        }
        Ok(())
    }
}

/// Last safe action when it satisfies `constraints` and the box, else zero
pub fn select_fallback(
    last_safe: Option<&DVector<f64>>,
    constraints: &[AffineConstraint],
    lower: &DVector<f64>,
    upper: &DVector<f64>,
) -> (DVector<f64>, Fallback) {
    if let Some(u) = last_safe {
        let in_box =
            u.iter().zip(lower.iter().zip(upper.iter())).all(|(v, (lo, hi))| v >= lo && v <= hi);
        if in_box && constraints.iter().all(|c| c.is_satisfied(u)) {
            return (u.clone(), Fallback::LastSafe);
        }
    }
    (DVector::zeros(lower.len()), Fallback::Zero)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BarrierConfig, GoalConfig};
    use crate::control::schedule::EpsilonSchedule;
    use approx::assert_relative_eq;
    use std::sync::{Arc, Mutex};

    /// `ẋ = u` in the plane
    struct SingleIntegrator;

    impl ControlAffine for SingleIntegrator {
        fn state_size(&self) -> usize {
            2
        }
        fn ctrl_size(&self) -> usize {
            2
        }
        fn f_func(&self, _x: &DVector<f64>) -> DVector<f64> {
            DVector::zeros(2)
        }
        fn g_func(&self, _x: &DVector<f64>) -> DMatrix<f64> {
            DMatrix::identity(2, 2)
        }
    }

    fn exploit_config() -> ControllerConfig {
        ControllerConfig {
            dt: 0.05,
            horizon: 50,
            epsilon: EpsilonSchedule::new(1e-9, 1e-9, 1),
            goal: GoalConfig {
                state: vec![2.0, 0.0],
                state_weight: vec![100.0, 100.0],
                ctrl_weight: vec![1.0, 1.0],
                lambda: 0.5,
            },
            barriers: vec![BarrierConfig {
                center: [0.0, 0.0],
                radius: 0.5,
                gamma: 1.0,
                offset: 0,
            }],
            model: ModelSource::GroundTruth,
            ..ControllerConfig::default()
        }
    }

    fn point(a: f64, b: f64) -> DVector<f64> {
        DVector::from_vec(vec![a, b])
    }

    fn derivative(i: usize) -> Observation {
        Observation::Derivative {
            x: point(i as f64, 0.0),
            u: point(0.0, 0.0),
            xdot: point(0.0, 0.0),
        }
    }

    #[test]
    fn test_drop_oldest_ring_buffer() {
        let mut log = TrainingLog::new(3, RetentionPolicy::DropOldest);
        for i in 0..5 {
            log.push(derivative(i));
        }
        assert_eq!(log.len(), 3);
        assert_eq!(log.total_recorded(), 5);
        let first: Vec<f64> = log.iter().map(|o| o.state()[0]).collect();
        assert_eq!(first, vec![2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_decimate_keeps_newest_and_spreads() {
        let mut log = TrainingLog::new(4, RetentionPolicy::Decimate);
        for i in 0..5 {
            log.push(derivative(i));
        }
        let kept: Vec<f64> = log.iter().map(|o| o.state()[0]).collect();
        assert_eq!(kept, vec![1.0, 3.0, 4.0]);
        assert!(log.len() <= log.capacity());
    }

    #[test]
    fn test_exploit_moves_toward_goal_and_respects_barrier() {
        let mut controller =
            SafeController::ground_truth(exploit_config(), Box::new(SingleIntegrator)).unwrap();
        let x = point(-2.0, 0.3);
        let step = controller.control(&x, 0.0).unwrap();

        assert_eq!(step.status.mode, Mode::ExploitSafe);
        assert!(step.status.fallback.is_none());
        assert_eq!(step.status.severity(), Severity::Info);
        assert!(step.action[0] > 0.0);

        // ḣ + γh ≥ 0 with exact dynamics
        let (h, grad) = CircularObstacle::new([0.0, 0.0], 0.5, 2).linearize(&x);
        assert!(grad.dot(&step.action) + h >= -1e-8);
        assert!(step.action.iter().all(|u| u.abs() <= 1.0 + 1e-9));
    }

    #[test]
    fn test_goal_control_matches_unconstrained_qp() {
        let mut config = exploit_config();
        config.barriers.clear();
        config.ctrl_lower = vec![-100.0, -100.0];
        config.ctrl_upper = vec![100.0, 100.0];
        let mut controller =
            SafeController::ground_truth(config, Box::new(SingleIntegrator)).unwrap();

        let x = point(-1.0, 0.5);
        let closed_form = controller.goal_control(&x).unwrap();
        let step = controller.control(&x, 0.0).unwrap();
        assert_relative_eq!(closed_form, step.action, epsilon = 1e-8);

        // u* = (1−λ) dt P (x_g − x) / (λ + (1−λ) dt² P) for g = I
        let expected = (point(2.0, 0.0) - &x) * (0.5 * 0.05 * 100.0 / (0.5 + 0.5 * 0.0025 * 100.0));
        assert_relative_eq!(closed_form, expected, epsilon = 1e-8);
    }

    #[test]
    fn test_infeasible_falls_back_to_zero() {
        let mut controller =
            SafeController::ground_truth(exploit_config(), Box::new(SingleIntegrator)).unwrap();
        // Inside the obstacle the barrier demands u₀ ≥ 1.2, outside the box
        let step = controller.control(&point(0.1, 0.0), 0.0).unwrap();
        assert_eq!(step.status.fallback, Some(Fallback::Zero));
        assert_eq!(step.status.severity(), Severity::Warning);
        assert_eq!(step.action, DVector::zeros(2));
        assert!(controller.last_safe_action().is_none());
    }

    #[test]
    fn test_select_fallback_prefers_satisfying_last_safe() {
        let constraint = AffineConstraint {
            name: "c".to_string(),
            a: point(1.0, 0.0),
            b: 0.5,
            margin: 0.0,
        };
        let (lower, upper) = (point(-1.0, -1.0), point(1.0, 1.0));

        let last = point(0.2, 0.9);
        let (u, fallback) = select_fallback(Some(&last), &[constraint.clone()], &lower, &upper);
        assert_eq!((u, fallback), (last, Fallback::LastSafe));

        let violating = point(0.8, 0.0);
        let (u, fallback) = select_fallback(Some(&violating), &[constraint], &lower, &upper);
        assert_eq!((u, fallback), (DVector::zeros(2), Fallback::Zero));
    }

    #[test]
    fn test_step_budget_exhausted() {
        let mut config = exploit_config();
        config.horizon = 2;
        let mut controller =
            SafeController::ground_truth(config, Box::new(SingleIntegrator)).unwrap();
        let x = point(-2.0, 0.0);
        controller.control(&x, 0.0).unwrap();
        controller.control(&x, 0.05).unwrap();
        assert_eq!(
            controller.control(&x, 0.1).unwrap_err(),
            ControlError::StepBudgetExhausted { horizon: 2 }
        );
    }

    #[test]
    fn test_explore_action_within_bounds_and_filtered() {
        let mut config = exploit_config();
        config.epsilon = EpsilonSchedule::new(1.0, 1.0, 1);
        let mut controller =
            SafeController::ground_truth(config, Box::new(SingleIntegrator)).unwrap();
        let x = point(-0.6, 0.0);
        for i in 0..10 {
            let step = controller.control(&x, i as f64 * 0.05).unwrap();
            assert_eq!(step.status.mode, Mode::Explore);
            assert!(step.action.iter().all(|u| u.abs() <= 1.0 + 1e-9));
            let (h, grad) = CircularObstacle::new([0.0, 0.0], 0.5, 2).linearize(&x);
            assert!(grad.dot(&step.action) + h >= -1e-8);
        }
    }

    #[test]
    fn test_clf_slack_program_tracks_goal() {
        let mut config = exploit_config();
        config.clf = Some(ClfConfig {
            weight: vec![1.0, 1.0],
            gamma: 1.0,
            slack_weight: 10.0,
        });
        let mut controller =
            SafeController::ground_truth(config, Box::new(SingleIntegrator)).unwrap();
        let step = controller.control(&point(1.0, 1.0), 0.0).unwrap();
        assert!(step.status.fallback.is_none());
        // Moving toward (2, 0)
        assert!(step.action[0] > 0.0);
        assert!(step.action[1] < 0.0);
    }

    #[test]
    fn test_learned_controller_retrains_on_schedule() {
        let _ = env_logger::builder().is_test(true).try_init();
        let mut config = exploit_config();
        config.model = ModelSource::Learned;
        config.epsilon = EpsilonSchedule::new(1.0, 1.0, 1);
        config.barriers.clear();
        config.gp.iterations = 3;
        config.min_train_points = 5;
        let mut controller =
            SafeController::from_config(config, Box::new(SingleIntegrator)).unwrap();
        assert!(controller.model_id().is_none());

        let mut x = point(-2.0, 0.5);
        let mut retrained = None;
        for i in 0..11 {
            let step = controller.control(&x, i as f64 * 0.05).unwrap();
            if let Some(outcome) = step.status.retrain.clone() {
                retrained = Some((i, outcome, step.status.model_id));
            }
            let u = step.action.clone();
            let xdot = SingleIntegrator.xdot(&x, &u);
            controller.record(&x, &u, &xdot).unwrap();
            x += xdot * 0.05;
        }

        let (index, outcome, model_id) = retrained.unwrap();
        assert_eq!(index, 10);
        match outcome {
            RetrainOutcome::Retrained(report) => {
                assert_eq!(report.training_points, 10);
                assert_eq!(model_id, Some(report.model_id));
            }
            other => panic!("expected a successful retrain, got {:?}", other),
        }
        assert_eq!(controller.log().len(), 11);
    }

    #[test]
    fn test_failed_retrain_keeps_previous_model() {
        let _ = env_logger::builder().is_test(true).try_init();
        let mut config = exploit_config();
        config.model = ModelSource::Learned;
        config.epsilon = EpsilonSchedule::new(1.0, 1.0, 1);
        config.barriers.clear();
        config.gp.iterations = 3;
        config.min_train_points = 5;
        let mut controller =
            SafeController::from_config(config, Box::new(SingleIntegrator)).unwrap();

        let mut x = point(-2.0, 0.5);
        let mut statuses = Vec::new();
        for i in 0..21 {
            if i == 11 {
                // Every later fit runs out of time before its first step
                controller.config.retrain_timeout_ms = Some(0);
            }
            let step = controller.control(&x, i as f64 * 0.05).unwrap();
            let u = step.action.clone();
            statuses.push(step.status);
            let xdot = SingleIntegrator.xdot(&x, &u);
            controller.record(&x, &u, &xdot).unwrap();
            x += xdot * 0.05;
        }

        let fitted = match &statuses[10].retrain {
            Some(RetrainOutcome::Retrained(report)) => report.model_id,
            other => panic!("expected a successful retrain, got {:?}", other),
        };
        assert_eq!(statuses[10].severity(), Severity::Info);

        let failed = &statuses[20];
        assert!(matches!(failed.retrain, Some(RetrainOutcome::KeptPrevious { .. })));
        assert_eq!(failed.severity(), Severity::Warning);
        assert!(failed.fallback.is_none());
        assert_eq!(failed.model_id, Some(fitted));
        assert_eq!(controller.model_id(), Some(fitted));
        assert!(statuses[11..20].iter().all(|s| s.retrain.is_none()));
    }

    #[test]
    fn test_empty_log_never_triggers_retrain() {
        let mut config = exploit_config();
        config.model = ModelSource::Learned;
        config.epsilon = EpsilonSchedule::new(1.0, 1.0, 1);
        config.barriers.clear();
        let mut controller =
            SafeController::from_config(config, Box::new(SingleIntegrator)).unwrap();
        controller.config.min_train_points = 0;

        let x = point(-2.0, 0.5);
        for i in 0..11 {
            let step = controller.control(&x, i as f64 * 0.05).unwrap();
            assert!(step.status.retrain.is_none());
        }
        assert!(controller.model_id().is_none());
    }

    #[test]
    fn test_record_observation_rejects_malformed_payloads() {
        let mut controller =
            SafeController::ground_truth(exploit_config(), Box::new(SingleIntegrator)).unwrap();

        let short_f = Observation::Value {
            x: point(0.0, 0.0),
            f: DVector::zeros(5),
            g: DMatrix::identity(2, 2),
        };
        assert!(matches!(
            controller.record_observation(short_f),
            Err(ControlError::DimensionMismatch { expected: 2, actual: 5 })
        ));

        let wide_g = Observation::Value {
            x: point(0.0, 0.0),
            f: DVector::zeros(2),
            g: DMatrix::zeros(2, 3),
        };
        assert!(matches!(
            controller.record_observation(wide_g),
            Err(ControlError::DimensionMismatch { expected: 2, actual: 3 })
        ));

        let tall_g = Observation::Value {
            x: point(0.0, 0.0),
            f: DVector::zeros(2),
            g: DMatrix::zeros(4, 2),
        };
        assert!(matches!(
            controller.record_observation(tall_g),
            Err(ControlError::DimensionMismatch { expected: 2, actual: 4 })
        ));

        let short_u = Observation::Derivative {
            x: point(0.0, 0.0),
            u: DVector::zeros(1),
            xdot: DVector::zeros(2),
        };
        assert!(matches!(
            controller.record_observation(short_u),
            Err(ControlError::DimensionMismatch { expected: 2, actual: 1 })
        ));

        let long_xdot = Observation::Derivative {
            x: point(0.0, 0.0),
            u: DVector::zeros(2),
            xdot: DVector::zeros(3),
        };
        assert!(matches!(
            controller.record_observation(long_xdot),
            Err(ControlError::DimensionMismatch { expected: 2, actual: 3 })
        ));
        assert!(controller.log().is_empty());

        let valid = Observation::Value {
            x: point(0.0, 0.0),
            f: DVector::zeros(2),
            g: DMatrix::identity(2, 2),
        };
        controller.record_observation(valid).unwrap();
        assert_eq!(controller.log().len(), 1);
    }

    #[test]
    fn test_visualizer_receives_prediction() {
        struct Recorder(Arc<Mutex<Vec<(DVector<f64>, DMatrix<f64>)>>>);

        impl Visualizer for Recorder {
            fn set_state_control(
                &mut self,
                _x: &DVector<f64>,
                _u: &DVector<f64>,
                _t: f64,
                next: &DVector<f64>,
                covariance: &DMatrix<f64>,
            ) {
                if let Ok(mut calls) = self.0.lock() {
                    calls.push((next.clone(), covariance.clone()));
                }
            }
        }

        let calls = Arc::new(Mutex::new(Vec::new()));
        let mut controller =
            SafeController::ground_truth(exploit_config(), Box::new(SingleIntegrator))
                .unwrap()
            .with_visualizer(Box::new(Recorder(Arc::clone(&calls))));
        let x = point(-2.0, 0.0);
        let step = controller.control(&x, 0.0).unwrap();

        let calls = calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_relative_eq!(calls[0].0, &x + &step.action * 0.05, epsilon = 1e-12);
        assert_eq!(calls[0].1, DMatrix::zeros(2, 2));
    }

    #[test]
    fn test_dimension_checks() {
        let mut controller =
            SafeController::ground_truth(exploit_config(), Box::new(SingleIntegrator)).unwrap();
        assert_eq!(
            controller.control(&DVector::zeros(3), 0.0).unwrap_err(),
            ControlError::DimensionMismatch { expected: 2, actual: 3 }
        );
        assert!(controller
            .record(&DVector::zeros(2), &DVector::zeros(1), &DVector::zeros(2))
            .is_err());
    }
}
