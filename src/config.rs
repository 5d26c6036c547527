//! Tracker configuration and combine functions

use std::time::Duration;

use crate::error::{FairnessError, Result};
use crate::tuning;

/// Configuration for the fairness tracker's bucket matrices.
///
/// Most callers should not fill this in by hand: the auto-tuner
/// ([`crate::tuning::generate_tuned_config`]) derives a working set of
/// parameters from the expected scale of the application, and the builder
/// defaults to it.
#[derive(Debug, Clone)]
pub struct FairnessTrackerConfig {
    /// Number of levels (L) in each bucket matrix
    pub levels: u32,

    /// Number of buckets per level (M)
    pub buckets_per_level: u32,

    /// Probability added to a bucket when a flow reports a resource failure
    pub pi: f64,

    /// Probability subtracted from a bucket when a flow reports a success
    pub pd: f64,

    /// Exponential decay rate for bucket probabilities, per second
    pub lambda: f64,

    /// How often the matrices are rotated under a fresh hash seed
    pub rotation_frequency: Duration,

    /// Attach per-level probabilities to register responses. Useful for
    /// debugging, at a small allocation cost per request.
    pub include_stats: bool,

    /// How the per-level probabilities are folded into the final throttle
    /// probability
    pub combine_function: CombineFunction,
}

impl FairnessTrackerConfig {
    /// Check the construction-time invariants.
    ///
    /// Throttling must ramp up faster than it eases off (`pi > pd`), or a
    /// misbehaving flow could hold its probability down with a retry storm.
    pub fn validate(&self) -> Result<()> {
        if self.levels == 0 || self.buckets_per_level == 0 {
            return Err(FairnessError::config_invalid(format!(
                "levels and buckets_per_level must be at least 1, got L={} and M={}",
                self.levels, self.buckets_per_level
            )));
        }

        if self.pd <= 0.0 || self.pi <= 0.0 {
            return Err(FairnessError::config_invalid(format!(
                "pi and pd must be positive, got pi={} and pd={}",
                self.pi, self.pd
            )));
        }

        if self.pd > 1.0 || self.pi >= 1.0 {
            return Err(FairnessError::config_invalid(format!(
                "pi must be below 1 and pd at most 1, got pi={} and pd={}",
                self.pi, self.pd
            )));
        }

        if self.pi <= self.pd {
            return Err(FairnessError::config_invalid(format!(
                "pi must be greater than pd, got pi={} and pd={}",
                self.pi, self.pd
            )));
        }

        // A negative decay rate would grow probabilities past 1 over time
        if !self.lambda.is_finite() || self.lambda < 0.0 {
            return Err(FairnessError::config_invalid(format!(
                "lambda must be a finite non-negative decay rate, got {}",
                self.lambda
            )));
        }

        Ok(())
    }
}

impl Default for FairnessTrackerConfig {
    /// The auto-tuned configuration for a typical deployment
    /// (1000 expected flows, 1000 buckets per level, 25 tolerable bad
    /// requests per bad flow).
    fn default() -> Self {
        tuning::default_tuned_config()
    }
}

/// Folds the L per-level bucket probabilities into the single probability
/// used for the throttle decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CombineFunction {
    /// The minimum across levels. A request is only throttled when every
    /// level independently votes against the flow, which gives the strongest
    /// protection against hash collisions with a genuinely bad flow.
    #[default]
    Min,

    /// The arithmetic mean across levels, for deployments that want a
    /// smoother ramp-up than the minimum provides.
    Mean,
}

impl CombineFunction {
    /// Combine per-level probabilities into the final throttle probability.
    ///
    /// An empty slice yields 0 (never throttle); the config invariant
    /// `L >= 1` means that can only happen through misuse.
    pub fn combine(&self, probabilities: &[f64]) -> f64 {
        debug_assert!(!probabilities.is_empty());
        if probabilities.is_empty() {
            return 0.0;
        }

        match self {
            Self::Min => probabilities.iter().copied().fold(1.0, f64::min),
            Self::Mean => probabilities.iter().sum::<f64>() / probabilities.len() as f64,
        }
    }
}
