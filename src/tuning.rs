//! Configuration auto-tuning
//!
//! Translates operator intent (expected flow counts, tolerable failures)
//! into the structural parameters of the bucket matrices. The level count
//! formula comes from the Stochastic Fair BLUE paper:
//! <https://rtcl.eecs.umich.edu/rtclweb/assets/publications/2001/feng2001fair.pdf>

use std::time::Duration;

use crate::config::{CombineFunction, FairnessTrackerConfig};
use crate::error::{FairnessError, Result};

/// Number of concurrent client flows assumed when not caller-provided
pub(crate) const DEFAULT_EXPECTED_CLIENT_FLOWS: u32 = 1000;
/// Number of buckets per level assumed when not caller-provided
pub(crate) const DEFAULT_BUCKETS_PER_LEVEL: u32 = 1000;
/// Bad requests tolerated before a flow is fully shut down, by default
pub(crate) const DEFAULT_TOLERABLE_BAD_REQUESTS: u32 = 25;

/// Fraction of the expected flows assumed to misbehave (0.1%)
const PERCENT_BAD_CLIENT_FLOWS: f64 = 0.001;
/// Target probability of an innocent flow colliding with a bad one on all
/// levels at once
const LOW_COLLISION_PROBABILITY: f64 = 1e-4;
/// Slowing factor from pi to pd; recovery is 1000x slower than condemnation
/// to keep retry storms from oscillating the probabilities
const PD_SLOWING_FACTOR: f64 = 0.001;
/// Minimum number of levels regardless of what the formula says
const MIN_LEVELS: u32 = 3;
/// Default probability decay rate per second
const DEFAULT_DECAY_RATE: f64 = 0.01;
/// Default matrix rotation period
const DEFAULT_ROTATION_FREQUENCY: Duration = Duration::from_secs(5 * 60);

/// Generate a tuned configuration for the expected scale of the application.
///
/// Parameters:
/// - `expected_client_flows`: number of concurrent client flows expected
/// - `buckets_per_level`: number of buckets per level in the matrices
/// - `tolerable_bad_requests_per_bad_flow`: failed requests tolerated before
///   a flow is fully blocked
///
/// Returns a [`FairnessError::ConfigInvalid`] when
/// `tolerable_bad_requests_per_bad_flow` is zero, since that would require an
/// infinite per-failure increment.
pub fn generate_tuned_config(
    expected_client_flows: u32,
    buckets_per_level: u32,
    tolerable_bad_requests_per_bad_flow: u32,
) -> Result<FairnessTrackerConfig> {
    if tolerable_bad_requests_per_bad_flow == 0 {
        return Err(FairnessError::config_invalid(
            "tolerable_bad_requests_per_bad_flow must be at least 1",
        ));
    }

    Ok(tuned_config(
        expected_client_flows,
        buckets_per_level,
        tolerable_bad_requests_per_bad_flow,
    ))
}

/// The tuned configuration for the default scale assumptions
pub(crate) fn default_tuned_config() -> FairnessTrackerConfig {
    tuned_config(
        DEFAULT_EXPECTED_CLIENT_FLOWS,
        DEFAULT_BUCKETS_PER_LEVEL,
        DEFAULT_TOLERABLE_BAD_REQUESTS,
    )
}

/// Tuner body; callers have already established that
/// `tolerable_bad_requests_per_bad_flow >= 1`.
fn tuned_config(
    expected_client_flows: u32,
    buckets_per_level: u32,
    tolerable_bad_requests_per_bad_flow: u32,
) -> FairnessTrackerConfig {
    let expected_bad_flows =
        (f64::from(expected_client_flows) * PERCENT_BAD_CLIENT_FLOWS).ceil() as u32;
    let levels = calculate_levels(
        buckets_per_level,
        expected_bad_flows,
        LOW_COLLISION_PROBABILITY,
    )
    .max(MIN_LEVELS);

    // Fully block a flow after the tolerable number of failures
    let pi = 1.0 / f64::from(tolerable_bad_requests_per_bad_flow);
    let pd = PD_SLOWING_FACTOR * pi;

    FairnessTrackerConfig {
        levels,
        buckets_per_level,
        pi,
        pd,
        lambda: DEFAULT_DECAY_RATE,
        rotation_frequency: DEFAULT_ROTATION_FREQUENCY,
        include_stats: false,
        combine_function: CombineFunction::Min,
    }
}

/// Number of levels needed to push the probability of an innocent flow
/// colliding with a bad one on every level below `target_probability`.
///
/// Solves for L in `p = (1 - (1 - 1/B)^M)^L` where `B` is the buckets per
/// level and `M` the expected number of bad flows.
pub fn calculate_levels(
    buckets_per_level: u32,
    expected_bad_flows: u32,
    target_probability: f64,
) -> u32 {
    let term = 1.0 - (1.0 - 1.0 / f64::from(buckets_per_level)).powf(f64::from(expected_bad_flows));
    let levels = target_probability.ln() / term.ln();
    if !levels.is_finite() {
        // Degenerate geometry (e.g. a single bucket per level); the floor
        // applied by the tuner is the only sensible answer.
        return MIN_LEVELS;
    }
    levels.ceil() as u32
}
