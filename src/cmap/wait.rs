//! The closed-once latch waiters block on while a keyed production is
//! pending.
//!
//! A `WaitGate` starts closed. Any number of threads may wait on it; a single
//! `release` (idempotent) opens it permanently and wakes everyone. Producers
//! release the gate *after* publishing the value it guards, so a woken waiter
//! can re-query its map and is guaranteed to observe the value.

use parking_lot::{Condvar, Mutex};
use std::time::Duration;

/// A one-shot latch shared between waiters and a producer.
#[derive(Debug, Default)]
pub struct WaitGate {
    released: Mutex<bool>,
    cond: Condvar,
}

impl WaitGate {
    /// Creates a new, closed gate.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens the gate and wakes all waiters. Idempotent.
    pub fn release(&self) {
        let mut released = self.released.lock();
        if !*released {
            *released = true;
            self.cond.notify_all();
        }
    }

    /// Returns true if the gate has been released.
    #[must_use]
    pub fn is_released(&self) -> bool {
        *self.released.lock()
    }

    /// Blocks until the gate is released.
    pub fn wait(&self) {
        let mut released = self.released.lock();
        while !*released {
            self.cond.wait(&mut released);
        }
    }

    /// Blocks until the gate is released or `timeout` elapses.
    /// Returns true if the gate was released.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut released = self.released.lock();
        if *released {
            return true;
        }
        self.cond.wait_for(&mut released, timeout);
        *released
    }
}
