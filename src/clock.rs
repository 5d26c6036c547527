//! Clock and ticker abstractions
//!
//! The tracker only needs two things from the outside world: a millisecond
//! wall clock for probability decay and a periodic tick stream for matrix
//! rotation. Both are behind traits so tests can drive time by hand.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::sync::mpsc;
use tokio::time::{self, MissedTickBehavior};
use tracing::trace;

/// A millisecond-resolution wall clock
pub trait Clock: Send + Sync {
    /// Milliseconds since the Unix epoch
    fn now_ms(&self) -> u64;
}

/// The system wall clock
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_millis() as u64)
            .unwrap_or(0)
    }
}

/// A manually advanced clock for tests and simulations
#[derive(Debug)]
pub struct ManualClock {
    millis: AtomicU64,
}

impl ManualClock {
    /// Create a clock frozen at the given millisecond timestamp
    pub fn new(start_ms: u64) -> Self {
        Self {
            millis: AtomicU64::new(start_ms),
        }
    }

    /// Move the clock forward
    pub fn advance(&self, delta: Duration) {
        self.millis
            .fetch_add(delta.as_millis() as u64, Ordering::SeqCst);
    }

    /// Set the clock to an absolute timestamp; may move it backwards
    pub fn set(&self, now_ms: u64) {
        self.millis.store(now_ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.millis.load(Ordering::SeqCst)
    }
}

/// A periodic tick source driving matrix rotation.
///
/// The tracker takes the tick channel exactly once at build time and then
/// listens on it from the rotation task; `stop` and `reset` stay available
/// through the tracker for shutdown and reconfiguration.
pub trait Ticker: Send + Sync {
    /// Take the stream of tick events. Returns `None` if the channel was
    /// already taken.
    fn channel(&mut self) -> Option<mpsc::Receiver<()>>;

    /// Stop producing ticks. Idempotent.
    fn stop(&self);

    /// Restart the period; the next tick arrives after the new period
    /// elapses.
    fn reset(&self, period: Duration);
}

enum TickerCommand {
    Reset(Duration),
    Stop,
}

/// Tick source backed by a Tokio interval.
///
/// The first tick arrives one full period after creation. Ticks that the
/// consumer has not drained are coalesced rather than queued.
pub struct IntervalTicker {
    commands: mpsc::UnboundedSender<TickerCommand>,
    ticks: Option<mpsc::Receiver<()>>,
}

impl IntervalTicker {
    /// Create a ticker firing every `period`. Must be called within a Tokio
    /// runtime.
    pub fn new(period: Duration) -> Self {
        let (tick_tx, tick_rx) = mpsc::channel(1);
        let (command_tx, mut command_rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            let mut interval = time::interval_at(time::Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    command = command_rx.recv() => match command {
                        Some(TickerCommand::Reset(period)) => {
                            interval = time::interval_at(time::Instant::now() + period, period);
                            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
                        }
                        Some(TickerCommand::Stop) | None => break,
                    },
                    _ = interval.tick() => {
                        // A full channel means the consumer is still working
                        // on the previous tick; coalesce.
                        if tick_tx.try_send(()).is_err() && tick_tx.is_closed() {
                            break;
                        }
                    }
                }
            }
            trace!("interval ticker task exited");
        });

        Self {
            commands: command_tx,
            ticks: Some(tick_rx),
        }
    }
}

impl Ticker for IntervalTicker {
    fn channel(&mut self) -> Option<mpsc::Receiver<()>> {
        self.ticks.take()
    }

    fn stop(&self) {
        let _ = self.commands.send(TickerCommand::Stop);
    }

    fn reset(&self, period: Duration) {
        let _ = self.commands.send(TickerCommand::Reset(period));
    }
}

/// A ticker fired by hand, for deterministic rotation tests
pub struct ManualTicker {
    tick_tx: mpsc::Sender<()>,
    ticks: Option<mpsc::Receiver<()>>,
    stopped: Arc<AtomicBool>,
}

impl ManualTicker {
    pub fn new() -> Self {
        let (tick_tx, tick_rx) = mpsc::channel(16);
        Self {
            tick_tx,
            ticks: Some(tick_rx),
            stopped: Arc::new(AtomicBool::new(false)),
        }
    }

    /// A handle that stays usable after the ticker itself has been handed to
    /// the tracker builder.
    pub fn handle(&self) -> ManualTickerHandle {
        ManualTickerHandle {
            tick_tx: self.tick_tx.clone(),
            stopped: Arc::clone(&self.stopped),
        }
    }
}

impl Default for ManualTicker {
    fn default() -> Self {
        Self::new()
    }
}

impl Ticker for ManualTicker {
    fn channel(&mut self) -> Option<mpsc::Receiver<()>> {
        self.ticks.take()
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    fn reset(&self, _period: Duration) {}
}

/// Firing side of a [`ManualTicker`]
#[derive(Clone)]
pub struct ManualTickerHandle {
    tick_tx: mpsc::Sender<()>,
    stopped: Arc<AtomicBool>,
}

impl ManualTickerHandle {
    /// Queue one tick for the rotation task
    pub async fn fire(&self) {
        let _ = self.tick_tx.send(()).await;
    }

    /// Whether the consumer has stopped the ticker
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}
