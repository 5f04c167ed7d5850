//! Exploration schedule
//!
//! ```text
//! ε(t) = ε₀ (ε₁/ε₀)^(t/T)   for t ≤ T
//! ε(t) = ε₁                 for t > T
//! ```
//!
//! Copyright (c) 2025 Mohammad Atashi <mohammadaliatashi@icloud.com>

use serde::{Deserialize, Serialize};

/// Exponentially decaying exploration probability
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EpsilonSchedule {
    pub start: f64,
    pub end: f64,
    /// Step at which `end` is reached
    pub horizon: usize,
}

impl Default for EpsilonSchedule {
    fn default() -> Self {
        Self {
            start: 1.0,
            end: 0.01,
            horizon: 1000,
        }
    }
}

impl EpsilonSchedule {
    pub fn new(start: f64, end: f64, horizon: usize) -> Self {
        Self { start, end, horizon }
    }

    /// `0 < end ≤ start ≤ 1`
    pub fn is_valid(&self) -> bool {
        self.end > 0.0 && self.end <= self.start && self.start <= 1.0
    }

    pub fn epsilon(&self, step: usize) -> f64 {
        if self.horizon == 0 || step >= self.horizon {
            return self.end;
        }
        let fraction = step as f64 / self.horizon as f64;
        let value = self.start * (self.end / self.start).powf(fraction);
        value.min(self.start.max(self.end)).max(self.end.min(self.start))
    }
}
