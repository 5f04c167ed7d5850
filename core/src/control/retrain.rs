//! Shared model handle and bounded retraining
//!
//! The GP is owned behind a mutex that is held only to take a snapshot or
//! to swap in a refitted model; fitting itself runs on a private copy.
//!
//! Copyright (c) 2025 Mohammad Atashi <mohammadaliatashi@icloud.com>

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use log::{info, warn};
use thiserror::Error;

use crate::ml::batch::Observation;
use crate::ml::gp::{ControlAffineGp, FitReport, GpError, RetrainBudget};

/// Retraining errors
#[derive(Debug, Error, Clone, PartialEq)]
pub enum RetrainError {
    #[error("Model lock poisoned")]
    Poisoned,

    #[error("Retraining timed out after {timeout:?}")]
    TimedOut { timeout: Duration },

    #[error("Retraining task failed: {0}")]
    Join(String),

    #[error("GP failure: {0}")]
    Gp(#[from] GpError),
}

/// Thread-safe handle to the current dynamics model
#[derive(Debug, Clone)]
pub struct SharedModel {
    inner: Arc<Mutex<ControlAffineGp>>,
}

impl SharedModel {
    pub fn new(gp: ControlAffineGp) -> Self {
        Self {
            inner: Arc::new(Mutex::new(gp)),
        }
    }

    /// Copy of the current model
    pub fn snapshot(&self) -> Result<ControlAffineGp, RetrainError> {
        self.with_model(|gp| gp.clone())
    }

    /// Replace the current model
    pub fn swap(&self, gp: ControlAffineGp) -> Result<(), RetrainError> {
        let mut guard = self.inner.lock().map_err(|_| RetrainError::Poisoned)?;
        *guard = gp;
        Ok(())
    }

    /// Run `f` against the current model under the lock
    pub fn with_model<R>(&self, f: impl FnOnce(&ControlAffineGp) -> R) -> Result<R, RetrainError> {
        let guard = self.inner.lock().map_err(|_| RetrainError::Poisoned)?;
        Ok(f(&guard))
    }

    /// Fit a snapshot and swap it in on success
    pub fn retrain(
        &self,
        observations: &[Observation],
        iterations: usize,
        learning_rate: f64,
        budget: &RetrainBudget,
    ) -> Result<FitReport, RetrainError> {
        let mut candidate = self.snapshot()?;
        let report = candidate.fit_with_budget(observations, iterations, learning_rate, budget)?;
        self.swap(candidate)?;
        Ok(report)
    }
}

/// Fit on a blocking worker, giving up after `timeout`
///
/// On timeout the worker's cancel flag is raised and the shared model is
/// left as it was.
pub async fn retrain_with_timeout(
    model: &SharedModel,
    observations: Vec<Observation>,
    iterations: usize,
    learning_rate: f64,
    timeout: Duration,
) -> Result<FitReport, RetrainError> {
    let mut candidate = model.snapshot()?;
    let cancel = Arc::new(AtomicBool::new(false));
    let budget = RetrainBudget {
        deadline: Some(Instant::now() + timeout),
        cancel: Some(Arc::clone(&cancel)),
    };

    let worker = tokio::task::spawn_blocking(move || {
        candidate
            .fit_with_budget(&observations, iterations, learning_rate, &budget)
            .map(|report| (candidate, report))
    });

    match tokio::time::timeout(timeout, worker).await {
        Ok(Ok(Ok((fitted, report)))) => {
            model.swap(fitted)?;
            info!("Async retrain swapped in model {}", report.model_id);
            Ok(report)
        }
        Ok(Ok(Err(error))) => {
            warn!("Async retrain failed, keeping previous model: {}", error);
            Err(RetrainError::Gp(error))
        }
        Ok(Err(join)) => Err(RetrainError::Join(join.to_string())),
        Err(_) => {
            cancel.store(true, Ordering::Relaxed);
            warn!("Async retrain timed out after {:?}, keeping previous model", timeout);
            Err(RetrainError::TimedOut { timeout })
        }
    }
}
