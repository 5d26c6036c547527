//! Error types for the fairness tracker

use thiserror::Error;

/// Result type for fairness tracker operations
pub type Result<T> = std::result::Result<T, FairnessError>;

/// Errors surfaced while building or exporting a tracker.
///
/// The hot-path operations (`register_request`, `report_outcome`) are
/// infallible; once a tracker is built it never returns an error.
#[derive(Error, Debug)]
pub enum FairnessError {
    /// A configuration invariant was violated
    #[error("invalid configuration: {message}")]
    ConfigInvalid { message: String },

    /// Tracker state could not be constructed
    #[error("construction failed: {message}")]
    Construction { message: String },

    /// Snapshot serialization or deserialization failed
    #[error("snapshot serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl FairnessError {
    /// Create a configuration error
    pub fn config_invalid(message: impl Into<String>) -> Self {
        Self::ConfigInvalid {
            message: message.into(),
        }
    }

    /// Create a construction error
    pub fn construction(message: impl Into<String>) -> Self {
        Self::Construction {
            message: message.into(),
        }
    }
}
