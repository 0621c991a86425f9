//! Fractional progress reporting
//!
//! A [`Progress`] is handed to every condition check and action run. Values
//! are fractions in `[0, 1]`; anything outside that range is a contract
//! violation and is rejected, never clamped. Once the check or run it
//! belongs to has completed the handle is finished and rejects further
//! updates.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::{AutomationError, AutomationResult};

type Sink = dyn Fn(f64) -> AutomationResult<()> + Send + Sync;

/// Progress callback handed to conditions and actions
#[derive(Clone)]
pub struct Progress {
    sink: Arc<Sink>,
    finished: Arc<AtomicBool>,
}

impl Progress {
    pub fn new(sink: impl Fn(f64) -> AutomationResult<()> + Send + Sync + 'static) -> Self {
        Self {
            sink: Arc::new(sink),
            finished: Arc::new(AtomicBool::new(false)),
        }
    }

    /// A progress handle whose updates go nowhere
    pub fn noop() -> Self {
        Self::new(|_| Ok(()))
    }

    /// Report progress as a fraction in `[0, 1]`
    pub fn set(&self, value: f64) -> AutomationResult<()> {
        if !(0.0..=1.0).contains(&value) {
            return Err(AutomationError::Contract(format!(
                "progress must be between 0 and 1, got {value}"
            )));
        }
        if self.is_finished() {
            return Err(AutomationError::Contract(
                "progress reported after completion".to_string(),
            ));
        }
        (self.sink)(value)
    }

    /// A child handle whose `[0, 1]` maps onto `[lo, hi]` of this one
    ///
    /// The child finishes independently of the parent.
    pub fn band(&self, lo: f64, hi: f64) -> Progress {
        let parent = self.clone();
        Progress::new(move |value| parent.set(lo * (1.0 - value) + hi * value))
    }

    /// Mark the owning check or run as complete
    pub fn finish(&self) {
        self.finished.store(true, Ordering::SeqCst);
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for Progress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Progress")
            .field("finished", &self.is_finished())
            .finish()
    }
}
