//! # fair
//!
//! An in-process fairness primitive for servers that dispense a scarce
//! resource to many concurrent clients. When the resource is contended, the
//! tracker probabilistically rejects requests from the flows that are
//! overconsuming it, so better-behaved flows continue to receive service.
//!
//! The tracker is derived from Stochastic Fair BLUE: per-flow state lives in
//! a fixed-size, multi-level Bloom-filter-shaped matrix of throttling
//! probabilities that decays with wall-clock time and is periodically
//! rotated under a fresh hash seed to bound correlated false positives.
//! Flows are identified by opaque byte strings, which are hashed and never
//! stored.
//!
//! Callers feed two signals per request: a registration at arrival (which
//! returns the throttle decision) and, once the request is decided, an
//! outcome — [`Outcome::Success`] when the resource was obtained,
//! [`Outcome::Failure`] only when it was lost to contention.
//!
//! ```no_run
//! use fair::{CancellationToken, FairnessTrackerBuilder, Outcome};
//!
//! #[tokio::main]
//! async fn main() -> fair::Result<()> {
//!     let tracker = FairnessTrackerBuilder::new().build_with_defaults()?;
//!     let cancel = CancellationToken::new();
//!
//!     let decision = tracker.register_request(&cancel, b"tenant-42");
//!     if !decision.should_throttle {
//!         // ... try to obtain the resource ...
//!         tracker.report_outcome(&cancel, b"tenant-42", Outcome::Success);
//!     }
//!
//!     tracker.close();
//!     Ok(())
//! }
//! ```

pub mod clock;
pub mod config;
pub mod error;
pub mod request;
pub mod snapshot;
pub mod tracker;
pub mod tuning;

mod hashing;
mod matrix;

pub use clock::{
    Clock, IntervalTicker, ManualClock, ManualTicker, ManualTickerHandle, SystemClock, Ticker,
};
pub use config::{CombineFunction, FairnessTrackerConfig};
pub use error::{FairnessError, Result};
pub use request::{Outcome, RegisterResponse, ResultStats};
pub use snapshot::{MatrixSnapshot, TrackerSnapshot};
pub use tracker::{FairnessTracker, FairnessTrackerBuilder};
pub use tuning::{calculate_levels, generate_tuned_config};

// Hot-path signatures take a cancellation token; re-exported so callers
// don't need their own tokio-util dependency just to build one.
pub use tokio_util::sync::CancellationToken;
