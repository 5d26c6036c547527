//! The fairness tracker
//!
//! Public entry point of the library. Holds two bucket matrices (primary and
//! secondary) behind a single reader/writer rotation lock: the hot paths
//! take the read side and update both matrices, the rotation task
//! periodically retires the primary under the write side so the hash seed
//! keeps moving and no innocent flow stays colocated with a bad one.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use rand::Rng;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::clock::{Clock, IntervalTicker, SystemClock, Ticker};
use crate::config::FairnessTrackerConfig;
use crate::error::{FairnessError, Result};
use crate::matrix::BucketMatrix;
use crate::request::{Outcome, RegisterResponse, ResultStats};
use crate::snapshot::TrackerSnapshot;
use crate::tuning;

/// The pair of matrices guarded by the rotation lock. The primary serves
/// throttle decisions; the secondary shadows every update so a rotation does
/// not forgive flows that are currently being throttled.
struct MatrixPair {
    primary: BucketMatrix,
    secondary: BucketMatrix,
}

/// Tracks the flows of an application for fairness of their resource usage.
///
/// Thread-safe; all operations may be called concurrently. The hot paths
/// ([`register_request`](Self::register_request) and
/// [`report_outcome`](Self::report_outcome)) are infallible and complete in
/// time bounded by the level count, independent of the number of flows.
pub struct FairnessTracker {
    config: Arc<FairnessTrackerConfig>,
    clock: Arc<dyn Clock>,
    matrices: Arc<RwLock<MatrixPair>>,
    structure_id_counter: Arc<AtomicU64>,
    stop_tx: watch::Sender<bool>,
    rotation_task: JoinHandle<()>,
    ticker: Box<dyn Ticker>,
    closed: AtomicBool,
}

impl std::fmt::Debug for FairnessTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FairnessTracker").finish_non_exhaustive()
    }
}

impl FairnessTracker {
    fn new(
        config: Arc<FairnessTrackerConfig>,
        clock: Arc<dyn Clock>,
        mut ticker: Box<dyn Ticker>,
    ) -> Result<Self> {
        let ticks = ticker
            .channel()
            .ok_or_else(|| FairnessError::construction("ticker tick channel was already taken"))?;

        let primary = BucketMatrix::new(Arc::clone(&config), 1, Arc::clone(&clock))?;
        let secondary = BucketMatrix::new(Arc::clone(&config), 2, Arc::clone(&clock))?;
        let matrices = Arc::new(RwLock::new(MatrixPair { primary, secondary }));

        // Matrices 1 and 2 are the initial pair; rotation continues from 3
        let structure_id_counter = Arc::new(AtomicU64::new(3));

        let (stop_tx, stop_rx) = watch::channel(false);
        let rotation_task = tokio::spawn(run_rotation(
            Arc::clone(&matrices),
            Arc::clone(&config),
            Arc::clone(&clock),
            Arc::clone(&structure_id_counter),
            ticks,
            stop_rx,
        ));

        info!(
            levels = config.levels,
            buckets_per_level = config.buckets_per_level,
            pi = config.pi,
            pd = config.pd,
            "fairness tracker started"
        );

        Ok(Self {
            config,
            clock,
            matrices,
            structure_id_counter,
            stop_tx,
            rotation_task,
            ticker,
            closed: AtomicBool::new(false),
        })
    }

    /// Register an incoming request from the flow identified by `client_id`
    /// and decide whether it should be throttled.
    ///
    /// The identifier must be unique and stable per flow; it is hashed, not
    /// stored. The cancellation token is accepted for API uniformity and not
    /// observed: the operation never waits and cannot fail.
    pub fn register_request(&self, _cancel: &CancellationToken, client_id: &[u8]) -> RegisterResponse {
        let levels = self.config.levels as usize;
        let mut bucket_indices = Vec::with_capacity(levels);
        let mut bucket_probabilities = Vec::with_capacity(levels);

        {
            let pair = self.matrices.read();
            pair.primary.visit_buckets(client_id, |_, column, bucket| {
                bucket_indices.push(column);
                bucket_probabilities.push(bucket.probability());
            });
            // The visit decays the secondary's buckets so the flow's state
            // stays warm for the next rotation; its values don't vote.
            pair.secondary.visit_buckets(client_id, |_, _, _| {});
        }

        let final_probability = self.config.combine_function.combine(&bucket_probabilities);

        // r is uniform on (0, 1], so a probability of 0 can never throttle
        // and a probability of 1 always does.
        let r = 1.0 - rand::thread_rng().gen::<f64>();
        let should_throttle = r <= final_probability;

        let stats = self.config.include_stats.then(|| ResultStats {
            final_probability,
            bucket_indices,
            bucket_probabilities,
        });

        RegisterResponse {
            should_throttle,
            stats,
        }
    }

    /// Report the outcome of a previously registered request so the flow's
    /// throttling probabilities can be adjusted.
    ///
    /// Report only outcomes that conclusively obtained the resource or
    /// conclusively hit contention; see [`Outcome`]. Both matrices are
    /// updated so the signal survives the next rotation. Infallible.
    pub fn report_outcome(&self, _cancel: &CancellationToken, client_id: &[u8], outcome: Outcome) {
        let adjustment = match outcome {
            Outcome::Failure => self.config.pi,
            Outcome::Success => -self.config.pd,
        };

        let pair = self.matrices.read();
        for matrix in [&pair.primary, &pair.secondary] {
            matrix.visit_buckets(client_id, |_, _, bucket| {
                bucket.adjust(adjustment);
            });
        }
    }

    /// Stop the rotation task and the ticker. Idempotent.
    ///
    /// In-flight hot-path calls are not drained; callers must stop issuing
    /// requests once `close` returns.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        let _ = self.stop_tx.send(true);
        self.ticker.stop();
        info!("fairness tracker closed");
    }

    /// The `(primary, secondary)` matrix ids, for rotation tracing. The
    /// secondary id always exceeds the primary id by exactly one.
    pub fn matrix_ids(&self) -> (u64, u64) {
        let pair = self.matrices.read();
        (pair.primary.id(), pair.secondary.id())
    }

    /// Whether the rotation task has terminated (after [`close`](Self::close)
    /// or a fatal rotation fault).
    pub fn is_rotation_finished(&self) -> bool {
        self.rotation_task.is_finished()
    }

    /// The id the next rotation will assign, for rotation tracing
    pub fn next_structure_id(&self) -> u64 {
        self.structure_id_counter.load(Ordering::Relaxed)
    }

    /// Export the decayed state of both matrices for debugging or offline
    /// analysis.
    pub fn snapshot(&self) -> TrackerSnapshot {
        let pair = self.matrices.read();
        TrackerSnapshot {
            captured_at_ms: self.clock.now_ms(),
            levels: self.config.levels,
            buckets_per_level: self.config.buckets_per_level,
            primary: pair.primary.snapshot(),
            secondary: pair.secondary.snapshot(),
        }
    }
}

impl Drop for FairnessTracker {
    fn drop(&mut self) {
        self.close();
    }
}

/// The rotation loop: one fresh matrix per tick, swapped in under the write
/// side of the rotation lock. Exits on the stop signal, on ticker teardown,
/// or on a construction fault (which cannot happen once the initial build
/// validated the config, and is fatal to rotation if it somehow does).
async fn run_rotation(
    matrices: Arc<RwLock<MatrixPair>>,
    config: Arc<FairnessTrackerConfig>,
    clock: Arc<dyn Clock>,
    structure_id_counter: Arc<AtomicU64>,
    mut ticks: mpsc::Receiver<()>,
    mut stop_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            changed = stop_rx.changed() => {
                if changed.is_err() || *stop_rx.borrow() {
                    debug!("rotation task stopping");
                    break;
                }
            }
            tick = ticks.recv() => {
                match tick {
                    Some(()) => {
                        let id = structure_id_counter.fetch_add(1, Ordering::Relaxed);
                        match BucketMatrix::new(Arc::clone(&config), id, Arc::clone(&clock)) {
                            Ok(fresh) => {
                                let mut pair = matrices.write();
                                pair.primary = std::mem::replace(&mut pair.secondary, fresh);
                                debug!(
                                    primary = pair.primary.id(),
                                    secondary = pair.secondary.id(),
                                    "rotated bucket matrices"
                                );
                            }
                            Err(err) => {
                                error!(error = %err, "failed to build a replacement matrix; rotation disabled");
                                break;
                            }
                        }
                    }
                    None => {
                        debug!("tick channel closed, rotation task stopping");
                        break;
                    }
                }
            }
        }
    }
}

/// Configures and constructs a [`FairnessTracker`].
///
/// Starts from the auto-tuned default configuration; every setter overrides
/// one knob. Building spawns the rotation task, so all build methods must be
/// called within a Tokio runtime.
pub struct FairnessTrackerBuilder {
    config: FairnessTrackerConfig,
    clock: Option<Arc<dyn Clock>>,
    ticker: Option<Box<dyn Ticker>>,
}

impl FairnessTrackerBuilder {
    /// Create a builder pre-populated with the default configuration
    pub fn new() -> Self {
        Self {
            config: FairnessTrackerConfig::default(),
            clock: None,
            ticker: None,
        }
    }

    /// Set the number of levels in each matrix
    pub fn levels(mut self, levels: u32) -> Self {
        self.config.levels = levels;
        self
    }

    /// Set the number of buckets per level
    pub fn buckets_per_level(mut self, buckets_per_level: u32) -> Self {
        self.config.buckets_per_level = buckets_per_level;
        self
    }

    /// Set the probability increment applied on reported failures
    pub fn pi(mut self, pi: f64) -> Self {
        self.config.pi = pi;
        self
    }

    /// Set the probability decrement applied on reported successes
    pub fn pd(mut self, pd: f64) -> Self {
        self.config.pd = pd;
        self
    }

    /// Set the per-second exponential decay rate
    pub fn lambda(mut self, lambda: f64) -> Self {
        self.config.lambda = lambda;
        self
    }

    /// Set how often the matrices rotate under a fresh seed
    pub fn rotation_frequency(mut self, frequency: std::time::Duration) -> Self {
        self.config.rotation_frequency = frequency;
        self
    }

    /// Attach per-level statistics to register responses
    pub fn include_stats(mut self, include_stats: bool) -> Self {
        self.config.include_stats = include_stats;
        self
    }

    /// Set how per-level probabilities fold into the throttle probability
    pub fn combine_function(mut self, combine_function: crate::config::CombineFunction) -> Self {
        self.config.combine_function = combine_function;
        self
    }

    /// Substitute the wall clock; tests use [`crate::clock::ManualClock`]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Substitute the rotation tick source; tests use
    /// [`crate::clock::ManualTicker`]
    pub fn ticker(mut self, ticker: Box<dyn Ticker>) -> Self {
        self.ticker = Some(ticker);
        self
    }

    /// Build a tracker from the accumulated configuration
    pub fn build(self) -> Result<FairnessTracker> {
        let config = Arc::new(self.config);
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let ticker = self
            .ticker
            .unwrap_or_else(|| Box::new(IntervalTicker::new(config.rotation_frequency)));

        FairnessTracker::new(config, clock, ticker)
    }

    /// Build a tracker with the auto-tuned default configuration, discarding
    /// any knobs set on the builder
    pub fn build_with_defaults(mut self) -> Result<FairnessTracker> {
        self.config = FairnessTrackerConfig::default();
        self.build()
    }

    /// Build a tracker tuned for the given scale (see
    /// [`tuning::generate_tuned_config`])
    pub fn build_with_tuning(
        mut self,
        expected_client_flows: u32,
        buckets_per_level: u32,
        tolerable_bad_requests_per_bad_flow: u32,
    ) -> Result<FairnessTracker> {
        self.config = tuning::generate_tuned_config(
            expected_client_flows,
            buckets_per_level,
            tolerable_bad_requests_per_bad_flow,
        )?;
        self.build()
    }

    /// Build a tracker from an explicit configuration
    pub fn build_with_config(mut self, config: FairnessTrackerConfig) -> Result<FairnessTracker> {
        self.config = config;
        self.build()
    }
}

impl Default for FairnessTrackerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use crate::clock::{ManualClock, ManualTicker, ManualTickerHandle};
    use crate::config::CombineFunction;

    use super::*;

    fn cancel() -> CancellationToken {
        CancellationToken::new()
    }

    /// Builder wired to a manual clock and ticker; returns the ticker handle
    /// so tests can drive rotation by hand.
    fn manual_builder() -> (FairnessTrackerBuilder, ManualTickerHandle, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(1_000_000));
        let ticker = ManualTicker::new();
        let handle = ticker.handle();
        let builder = FairnessTrackerBuilder::new()
            .clock(clock.clone())
            .ticker(Box::new(ticker));
        (builder, handle, clock)
    }

    async fn wait_for_ids(tracker: &FairnessTracker, expected: (u64, u64)) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while tracker.matrix_ids() != expected {
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        })
        .await
        .expect("rotation did not reach the expected matrix ids in time");
    }

    #[tokio::test]
    async fn test_calibration_scenario() {
        let (builder, _handle, _clock) = manual_builder();
        let tracker = builder
            .levels(2)
            .buckets_per_level(24)
            .pd(0.1)
            .pi(0.15)
            .lambda(0.0)
            .combine_function(CombineFunction::Mean)
            .include_stats(true)
            .build()
            .unwrap();

        let id = b"hello_world";

        // Fresh tracker: all buckets zero, never throttles
        let response = tracker.register_request(&cancel(), id);
        assert!(!response.should_throttle);
        let stats = response.stats.unwrap();
        assert_eq!(stats.final_probability, 0.0);
        assert_eq!(stats.bucket_indices.len(), 2);
        assert_eq!(stats.bucket_probabilities, vec![0.0, 0.0]);

        // A success on zeroed buckets clamps at zero
        tracker.report_outcome(&cancel(), id, Outcome::Success);
        let stats = tracker.register_request(&cancel(), id).stats.unwrap();
        assert_eq!(stats.bucket_probabilities, vec![0.0, 0.0]);

        // Hammering failures saturates both selected buckets
        for _ in 0..1000 {
            tracker.report_outcome(&cancel(), id, Outcome::Failure);
        }
        let response = tracker.register_request(&cancel(), id);
        assert!(response.should_throttle);
        assert_eq!(response.stats.unwrap().final_probability, 1.0);

        tracker.close();
    }

    #[tokio::test]
    async fn test_stats_omitted_by_default() {
        let (builder, _handle, _clock) = manual_builder();
        let tracker = builder.build().unwrap();

        let response = tracker.register_request(&cancel(), b"flow");
        assert!(response.stats.is_none());
        tracker.close();
    }

    #[tokio::test]
    async fn test_empty_identifier_is_accepted() {
        let (builder, _handle, _clock) = manual_builder();
        let tracker = builder.include_stats(true).build().unwrap();

        let first = tracker.register_request(&cancel(), b"");
        let second = tracker.register_request(&cancel(), b"");
        assert!(!first.should_throttle);
        assert_eq!(
            first.stats.unwrap().bucket_indices,
            second.stats.unwrap().bucket_indices
        );
        tracker.close();
    }

    #[tokio::test]
    async fn test_zero_probability_never_throttles() {
        let (builder, _handle, _clock) = manual_builder();
        let tracker = builder.build().unwrap();

        for _ in 0..200 {
            assert!(!tracker.register_request(&cancel(), b"innocent").should_throttle);
        }
        tracker.close();
    }

    #[tokio::test]
    async fn test_saturated_probability_always_throttles() {
        let (builder, _handle, _clock) = manual_builder();
        let tracker = builder
            .levels(1)
            .buckets_per_level(1)
            .pi(0.5)
            .pd(0.001)
            .lambda(0.0)
            .build()
            .unwrap();

        tracker.report_outcome(&cancel(), b"greedy", Outcome::Failure);
        tracker.report_outcome(&cancel(), b"greedy", Outcome::Failure);

        for _ in 0..200 {
            assert!(tracker.register_request(&cancel(), b"greedy").should_throttle);
        }
        tracker.close();
    }

    #[tokio::test]
    async fn test_condemnation_and_slow_recovery() {
        let (builder, _handle, _clock) = manual_builder();
        let tracker = builder.build().unwrap();
        let id = b"client_id";

        assert!(!tracker.register_request(&cancel(), id).should_throttle);

        // Default tuning fully blocks a flow after 25 failures
        for _ in 0..30 {
            tracker.report_outcome(&cancel(), id, Outcome::Failure);
        }
        assert!(tracker.register_request(&cancel(), id).should_throttle);

        // Recovery is 1000x slower than condemnation
        for _ in 0..30_000 {
            tracker.report_outcome(&cancel(), id, Outcome::Success);
        }
        assert!(!tracker.register_request(&cancel(), id).should_throttle);

        tracker.close();
    }

    #[tokio::test]
    async fn test_rotation_id_progression() {
        let (builder, handle, _clock) = manual_builder();
        let tracker = builder.build().unwrap();

        assert_eq!(tracker.matrix_ids(), (1, 2));
        assert_eq!(tracker.next_structure_id(), 3);

        for expected in [(2, 3), (3, 4), (4, 5)] {
            handle.fire().await;
            wait_for_ids(&tracker, expected).await;
            let (primary, secondary) = tracker.matrix_ids();
            assert_eq!(secondary - primary, 1);
        }

        assert_eq!(tracker.next_structure_id(), 6);
        tracker.close();
    }

    #[tokio::test]
    async fn test_rotation_keeps_bad_flows_throttled() {
        let (builder, handle, _clock) = manual_builder();
        let tracker = builder
            .levels(2)
            .buckets_per_level(64)
            .pi(0.5)
            .pd(0.001)
            .lambda(0.0)
            .include_stats(true)
            .build()
            .unwrap();
        let id = b"persistent-offender";

        // Saturate in both matrices
        for _ in 0..4 {
            tracker.report_outcome(&cancel(), id, Outcome::Failure);
        }

        handle.fire().await;
        wait_for_ids(&tracker, (2, 3)).await;

        // The old secondary is now primary and still remembers the flow
        let response = tracker.register_request(&cancel(), id);
        assert!(response.should_throttle);
        assert_eq!(response.stats.unwrap().final_probability, 1.0);

        tracker.close();
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_stops_rotation() {
        let (builder, handle, _clock) = manual_builder();
        let tracker = builder.build().unwrap();

        tracker.close();
        tracker.close();

        assert!(handle.is_stopped());
        tokio::time::timeout(Duration::from_secs(5), async {
            while !tracker.is_rotation_finished() {
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        })
        .await
        .expect("rotation task did not stop after close");

        // The hot path stays usable until the caller stops issuing requests
        assert!(!tracker.register_request(&cancel(), b"flow").should_throttle);
    }

    #[tokio::test]
    async fn test_build_rejects_invalid_config() {
        let (builder, _handle, _clock) = manual_builder();
        let err = builder.pi(0.1).pd(0.2).build().unwrap_err();
        assert!(matches!(err, FairnessError::ConfigInvalid { .. }));
    }

    #[tokio::test]
    async fn test_build_with_tuning_rejects_zero_tolerance() {
        let err = FairnessTrackerBuilder::new()
            .build_with_tuning(1000, 1000, 0)
            .unwrap_err();
        assert!(matches!(err, FairnessError::ConfigInvalid { .. }));
    }

    #[tokio::test]
    async fn test_build_with_explicit_config() {
        let (builder, _handle, _clock) = manual_builder();
        let config = FairnessTrackerConfig {
            levels: 4,
            buckets_per_level: 16,
            pi: 0.25,
            pd: 0.01,
            lambda: 0.0,
            rotation_frequency: Duration::from_secs(60),
            include_stats: true,
            combine_function: CombineFunction::Min,
        };

        let tracker = builder.build_with_config(config).unwrap();
        let stats = tracker.register_request(&cancel(), b"flow").stats.unwrap();
        assert_eq!(stats.bucket_indices.len(), 4);
        tracker.close();
    }

    #[tokio::test]
    async fn test_snapshot_reflects_reported_state() {
        let (builder, _handle, clock) = manual_builder();
        let tracker = builder
            .levels(2)
            .buckets_per_level(8)
            .pi(0.5)
            .pd(0.01)
            .lambda(0.0)
            .build()
            .unwrap();

        for _ in 0..2 {
            tracker.report_outcome(&cancel(), b"flow", Outcome::Failure);
        }

        let snapshot = tracker.snapshot();
        assert_eq!(snapshot.captured_at_ms, clock.now_ms());
        assert_eq!(snapshot.levels, 2);
        assert_eq!(snapshot.buckets_per_level, 8);
        assert_eq!(snapshot.primary.id, 1);
        assert_eq!(snapshot.secondary.id, 2);

        // Both matrices carry the saturated buckets
        for matrix in [&snapshot.primary, &snapshot.secondary] {
            let saturated: usize = matrix
                .probabilities
                .iter()
                .flatten()
                .filter(|&&p| p == 1.0)
                .count();
            assert!(saturated >= 1);
        }

        let json = snapshot.to_json().unwrap();
        assert_eq!(TrackerSnapshot::from_json(&json).unwrap(), snapshot);

        tracker.close();
    }
}
