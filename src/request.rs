//! Request and outcome types exchanged with callers

/// The result of a request for the contended resource, as classified by the
/// caller.
///
/// Only report outcomes for requests that conclusively obtained the resource
/// or conclusively failed to because of contention. Validation errors, user
/// errors, upstream network failures and the like say nothing about resource
/// consumption, and reporting them corrupts the fairness signal. Not every
/// registered request needs an outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The request obtained the resource
    Success,
    /// The request failed to obtain the resource because of contention
    Failure,
}

/// The throttle decision for a registered request
#[derive(Debug, Clone)]
pub struct RegisterResponse {
    /// When true, the caller should reject this request instead of letting
    /// it compete for the resource
    pub should_throttle: bool,

    /// Per-level detail behind the decision; populated only when the tracker
    /// was configured with `include_stats`
    pub stats: Option<ResultStats>,
}

/// Debugging detail collected while registering a request
#[derive(Debug, Clone)]
pub struct ResultStats {
    /// The combined probability the throttle decision was drawn against
    pub final_probability: f64,

    /// The bucket column chosen at each level of the primary matrix
    pub bucket_indices: Vec<u32>,

    /// The decayed probability found in each of those buckets
    pub bucket_probabilities: Vec<f64>,
}
