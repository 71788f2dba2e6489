//! Single-slot debounced save scheduler.
//!
//! Holds at most one pending deadline. Scheduling again replaces it, so a
//! burst of mutations collapses into one save issued once the burst has been
//! quiet for `delay`. While executions are in flight the scheduler is
//! suppressed and remembers that a save is owed instead of arming a timer.

use std::time::Duration;

use tokio::time::Instant;

#[derive(Debug)]
pub struct AutosaveScheduler {
    delay: Duration,
    deadline: Option<Instant>,
    suppressed: bool,
    deferred: bool,
}

impl AutosaveScheduler {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            deadline: None,
            suppressed: false,
            deferred: false,
        }
    }

    /// Arm (or re-arm) the deadline. Deferred while suppressed.
    pub fn schedule(&mut self) {
        if self.suppressed {
            self.deferred = true;
            return;
        }
        self.deadline = Some(Instant::now() + self.delay);
    }

    /// Drop any pending or deferred save.
    pub fn cancel(&mut self) {
        self.deadline = None;
        self.deferred = false;
    }

    /// Stop arming timers. A pending deadline is converted into a deferred
    /// save so that partial output is never persisted.
    pub fn suppress(&mut self) {
        if self.suppressed {
            return;
        }
        self.suppressed = true;
        if self.deadline.take().is_some() {
            self.deferred = true;
        }
    }

    /// Re-enable saving and arm the timer if a save was deferred.
    pub fn resume(&mut self) {
        if !self.suppressed {
            return;
        }
        self.suppressed = false;
        if std::mem::take(&mut self.deferred) {
            self.schedule();
        }
    }

    /// True if a save is armed or owed.
    pub fn is_pending(&self) -> bool {
        self.deadline.is_some() || self.deferred
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Consume the deadline if it has passed. Returns true exactly once per
    /// armed deadline.
    pub fn take_due(&mut self, now: Instant) -> bool {
        match self.deadline {
            Some(deadline) if deadline <= now => {
                self.deadline = None;
                true
            }
            _ => false,
        }
    }

    /// Wait until the armed deadline passes. Never resolves when nothing is
    /// armed.
    pub async fn wait(deadline: Option<Instant>) {
        match deadline {
            Some(deadline) => tokio::time::sleep_until(deadline).await,
            None => std::future::pending::<()>().await,
        }
    }
}
