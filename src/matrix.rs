//! The bucket matrix
//!
//! A fixed `L x M` grid of throttling probabilities, the state carrier of
//! the tracker. Every cell is independently mutex-guarded; there is no
//! matrix-wide lock, so flows hashing to disjoint buckets never contend.

use std::sync::Arc;

use parking_lot::Mutex;
use rand::Rng;

use crate::clock::Clock;
use crate::config::FairnessTrackerConfig;
use crate::error::Result;
use crate::hashing;
use crate::snapshot::MatrixSnapshot;

/// One cell of the matrix: a throttling probability and the timestamp of the
/// last visit, used to apply decay lazily.
#[derive(Debug)]
pub(crate) struct Bucket {
    probability: f64,
    last_updated_ms: u64,
}

impl Bucket {
    fn new(now_ms: u64) -> Self {
        Self {
            probability: 0.0,
            last_updated_ms: now_ms,
        }
    }

    /// Apply exponential decay for the time elapsed since the last visit.
    ///
    /// The stamp only ever moves forward: when the wall clock appears to
    /// have rewound, no decay is applied and the stamp is left alone rather
    /// than letting an unsigned subtraction wrap.
    fn decay(&mut self, now_ms: u64, lambda: f64) {
        if now_ms < self.last_updated_ms {
            return;
        }

        let delta_sec = (now_ms - self.last_updated_ms) as f64 / 1000.0;
        self.probability *= (-lambda * delta_sec).exp();
        self.last_updated_ms = now_ms;
    }

    pub(crate) fn probability(&self) -> f64 {
        self.probability
    }

    /// Shift the probability, clamped to [0, 1]
    pub(crate) fn adjust(&mut self, delta: f64) {
        self.probability = (self.probability + delta).clamp(0.0, 1.0);
    }

    #[cfg(test)]
    pub(crate) fn set_probability(&mut self, probability: f64) {
        self.probability = probability;
    }
}

/// A multi-level Bloom-filter-shaped grid of buckets with a matrix-global
/// hash seed. The seed is drawn at construction and never changes; rotation
/// replaces the whole matrix instead.
pub(crate) struct BucketMatrix {
    levels: Vec<Vec<Mutex<Bucket>>>,
    config: Arc<FairnessTrackerConfig>,
    clock: Arc<dyn Clock>,
    id: u64,
    seed: u32,
}

impl BucketMatrix {
    /// Build a zero-initialized matrix. Fails when the config violates its
    /// construction invariants.
    pub(crate) fn new(
        config: Arc<FairnessTrackerConfig>,
        id: u64,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;

        let now_ms = clock.now_ms();
        let levels = (0..config.levels)
            .map(|_| {
                (0..config.buckets_per_level)
                    .map(|_| Mutex::new(Bucket::new(now_ms)))
                    .collect()
            })
            .collect();

        Ok(Self {
            levels,
            config,
            clock,
            id,
            seed: rand::thread_rng().gen(),
        })
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    #[cfg(test)]
    pub(crate) fn seed(&self) -> u32 {
        self.seed
    }

    /// Visit the L buckets belonging to `client_id`, in level order.
    ///
    /// For each bucket: take its lock, apply time decay, hand
    /// `(level, column, bucket)` to the closure, release. Locks are held one
    /// at a time and never across levels. This is the only way any caller
    /// touches bucket state, so decay is guaranteed to run before every read
    /// or write.
    pub(crate) fn visit_buckets<F>(&self, client_id: &[u8], mut visit: F)
    where
        F: FnMut(u32, u32, &mut Bucket),
    {
        let indices = hashing::bucket_indices(
            client_id,
            self.seed,
            self.config.levels,
            self.config.buckets_per_level,
        );

        for (level, &column) in indices.iter().enumerate() {
            let mut bucket = self.levels[level][column as usize].lock();
            bucket.decay(self.clock.now_ms(), self.config.lambda);
            visit(level as u32, column, &mut bucket);
        }
    }

    /// Decayed probabilities of every bucket, for state export. Walks the
    /// whole grid one lock at a time.
    pub(crate) fn snapshot(&self) -> MatrixSnapshot {
        let now_ms = self.clock.now_ms();
        let probabilities = self
            .levels
            .iter()
            .map(|row| {
                row.iter()
                    .map(|cell| {
                        let mut bucket = cell.lock();
                        bucket.decay(now_ms, self.config.lambda);
                        bucket.probability()
                    })
                    .collect()
            })
            .collect();

        MatrixSnapshot {
            id: self.id,
            seed: self.seed,
            probabilities,
        }
    }
}
