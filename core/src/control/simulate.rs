//! Closed-loop rollout
//!
//! Drives a [`SafeController`] against a plant with forward-Euler
//! integration, feeding every measured transition back into the
//! controller's training log.
//!
//! Copyright (c) 2025 Mohammad Atashi <mohammadaliatashi@icloud.com>

use log::info;
use nalgebra::DVector;
use serde::{Deserialize, Serialize};

use crate::control::controller::{ControlError, SafeController, Severity, StepStatus};
use crate::control::dynamics::ControlAffine;

/// Trajectory of one closed-loop run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Episode {
    /// `steps + 1` states, starting with the initial one
    pub states: Vec<DVector<f64>>,
    pub actions: Vec<DVector<f64>>,
    pub times: Vec<f64>,
    /// Barrier values at every state, one entry per obstacle
    pub barrier_values: Vec<Vec<f64>>,
    pub statuses: Vec<StepStatus>,
}

impl Episode {
    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    pub fn final_state(&self) -> Option<&DVector<f64>> {
        self.states.last()
    }

    /// States at which some barrier is negative
    pub fn violations(&self) -> usize {
        self.barrier_values
            .iter()
            .filter(|values| values.iter().any(|&h| h < 0.0))
            .count()
    }

    pub fn min_barrier(&self) -> f64 {
        self.barrier_values
            .iter()
            .flatten()
            .fold(f64::INFINITY, |acc, &h| acc.min(h))
    }

    pub fn warnings(&self) -> usize {
        self.statuses.iter().filter(|s| s.severity() == Severity::Warning).count()
    }
}

/// Run up to `steps` control steps from `x0`
///
/// Stops early when the controller's horizon is reached.
pub fn run_episode(
    controller: &mut SafeController,
    plant: &dyn ControlAffine,
    x0: &DVector<f64>,
    steps: usize,
) -> Result<Episode, ControlError> {
    let dt = controller.config().dt;
    let remaining = controller.config().horizon.saturating_sub(controller.step_count());
    let steps = steps.min(remaining);

    let mut episode = Episode::default();
    let mut x = plant.normalize_state(x0);
    episode.barrier_values.push(controller.barrier_values(&x));
    episode.states.push(x.clone());

    for k in 0..steps {
        let t = k as f64 * dt;
        let step = controller.control(&x, t)?;
        let xdot = plant.xdot(&x, &step.action);
        controller.record(&x, &step.action, &xdot)?;

        x = plant.normalize_state(&(&x + xdot * dt));
        episode.times.push(t);
        episode.actions.push(step.action);
        episode.statuses.push(step.status);
        episode.barrier_values.push(controller.barrier_values(&x));
        episode.states.push(x.clone());
    }

    info!(
        "Episode: {} steps, {} violations, {} warnings, min barrier {:.4}",
        episode.len(),
        episode.violations(),
        episode.warnings(),
        episode.min_barrier()
    );
    Ok(episode)
}
