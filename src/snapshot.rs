//! Point-in-time state export
//!
//! A snapshot captures the decayed probabilities of both matrices for
//! debugging and offline analysis. It is a read-only export: snapshots are
//! never loaded back into a live tracker.

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// The full tracker state at a single point in time
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TrackerSnapshot {
    /// Wall-clock milliseconds when the snapshot was taken
    pub captured_at_ms: u64,

    /// Level count of both matrices
    pub levels: u32,

    /// Buckets per level of both matrices
    pub buckets_per_level: u32,

    /// The matrix currently serving throttle decisions
    pub primary: MatrixSnapshot,

    /// The matrix that will become primary at the next rotation
    pub secondary: MatrixSnapshot,
}

/// One matrix's state within a [`TrackerSnapshot`]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MatrixSnapshot {
    /// Unique id of the matrix instance
    pub id: u64,

    /// The hash seed the matrix fingerprints identifiers with
    pub seed: u32,

    /// Decayed per-bucket probabilities, indexed `[level][column]`
    pub probabilities: Vec<Vec<f64>>,
}

impl TrackerSnapshot {
    /// Serialize the snapshot to a JSON string
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse a snapshot back from its JSON form
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}
