//! Auto-reset wake event shared between a device and its pump.

use core::time::Duration;

use parking_lot::{Condvar, Mutex};

/// A signal that wakes exactly one waiter and then resets itself.
///
/// Signals sent while nobody waits are remembered until the next wait.
#[derive(Debug, Default)]
pub struct PeriodEvent {
    signalled: Mutex<bool>,
    cond: Condvar,
}

impl PeriodEvent {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self) {
        let mut signalled = self.signalled.lock();
        *signalled = true;
        self.cond.notify_one();
    }

    /// Waits until the event is set or `timeout` elapses.
    ///
    /// Returns `true` if the event was set; the event is reset either way.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut signalled = self.signalled.lock();
        if !*signalled {
            let _ = self.cond.wait_for(&mut signalled, timeout);
        }
        core::mem::replace(&mut *signalled, false)
    }

    /// Clears a pending signal without waiting.
    pub fn reset(&self) {
        *self.signalled.lock() = false;
    }
}
