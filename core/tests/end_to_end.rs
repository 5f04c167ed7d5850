//! Closed-loop safe control around an obstacle with a learned model
//! Copyright (c) 2025 Mohammad Atashi <mohammadaliatashi@icloud.com>

use bastion_core::config::{BarrierConfig, ControllerConfig, GoalConfig, ModelSource};
use bastion_core::control::{
    run_episode, ControlAffine, EpsilonSchedule, RetrainOutcome, SafeController,
};
use bastion_core::ml::GpConfig;
use nalgebra::{DMatrix, DVector};

/// Planar point mass driven directly by its velocity
struct PointMass;

impl ControlAffine for PointMass {
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

fn config(model: ModelSource) -> ControllerConfig {
    ControllerConfig {
        dt: 0.02,
        horizon: 200,
        train_every_n_steps: 10,
        min_train_points: 10,
        max_train: 60,
        max_unsafe_prob: 0.05,
        ctrl_lower: vec![-2.0, -2.0],
        ctrl_upper: vec![2.0, 2.0],
        epsilon: EpsilonSchedule::new(1.0, 0.05, 100),
        goal: GoalConfig {
            state: vec![2.0, 1.5],
            state_weight: vec![200.0, 200.0],
            ctrl_weight: vec![1.0, 1.0],
            lambda: 0.5,
        },
        barriers: vec![BarrierConfig {
            center: [0.0, 0.0],
            radius: 0.5,
            gamma: 10.0,
            offset: 0,
        }],
        model,
        gp: GpConfig {
            iterations: 20,
            ..GpConfig::default()
        },
        seed: 7,
        ..ControllerConfig::default()
    }
}

fn goal_distance(x: &DVector<f64>) -> f64 {
    (x - DVector::from_vec(vec![2.0, 1.5])).norm()
}

#[test]
fn test_learned_controller_stays_safe_and_approaches_goal() {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut controller =
        SafeController::from_config(config(ModelSource::Learned), Box::new(PointMass)).unwrap();
    let x0 = DVector::from_vec(vec![-2.5, -2.0]);

    let episode = run_episode(&mut controller, &PointMass, &x0, 200).unwrap();

    assert_eq!(episode.len(), 200);
    assert_eq!(episode.violations(), 0);
    assert!(episode.min_barrier() >= 0.0);

    let initial = goal_distance(&x0);
    let last = episode.final_state().unwrap();
    assert!(goal_distance(last) < initial);

    let retrains = episode
        .statuses
        .iter()
        .filter(|s| matches!(s.retrain, Some(RetrainOutcome::Retrained(_))))
        .count();
    assert!(retrains > 0);
    assert!(controller.model_id().is_some());
    assert!(controller.log().len() <= 60);
    assert_eq!(controller.log().total_recorded(), 200);
}

#[test]
fn test_ground_truth_controller_reaches_goal_side() {
    let mut controller =
        SafeController::from_config(config(ModelSource::GroundTruth), Box::new(PointMass)).unwrap();
    let x0 = DVector::from_vec(vec![-2.5, -2.0]);

    let episode = run_episode(&mut controller, &PointMass, &x0, 200).unwrap();

    assert_eq!(episode.violations(), 0);
    assert!(goal_distance(episode.final_state().unwrap()) < goal_distance(&x0));
    assert!(episode.statuses.iter().all(|s| s.retrain.is_none()));
    assert!(controller.model_id().is_none());
}

#[test]
fn test_config_from_json_drives_controller() {
    let json = r#"{
        "dt": 0.02,
        "horizon": 20,
        "ctrl_lower": [-1.0, -1.0],
        "ctrl_upper": [1.0, 1.0],
        "goal": {"state": [2.0, 1.5]},
        "barriers": [{"center": [0.0, 0.0], "radius": 0.5, "gamma": 5.0}],
        "model": "ground_truth",
        "retention": "decimate"
    }"#;
    let config = ControllerConfig::from_json(json).unwrap();
    let mut controller = SafeController::from_config(config, Box::new(PointMass)).unwrap();
    let episode =
        run_episode(&mut controller, &PointMass, &DVector::from_vec(vec![-1.0, -1.0]), 50).unwrap();

    assert_eq!(episode.len(), 20);
    assert_eq!(episode.violations(), 0);
}
