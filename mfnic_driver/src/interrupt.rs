// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Interrupt signaling between the device and the event-queue threads.

use parking_lot::Condvar;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

/// A level-ish interrupt signal: `trigger` sets it, `wait_timeout`
/// consumes it. Cloned handles share the same underlying signal.
#[derive(Clone)]
pub struct DeviceInterrupt {
    inner: Arc<InterruptInner>,
}

struct InterruptInner {
    signaled: Mutex<bool>,
    cond: Condvar,
}

impl DeviceInterrupt {
    /// Creates an unsignaled interrupt.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(InterruptInner {
                signaled: Mutex::new(false),
                cond: Condvar::new(),
            }),
        }
    }

    /// Signals the interrupt, waking one waiter.
    pub fn trigger(&self) {
        let mut signaled = self.inner.signaled.lock();
        *signaled = true;
        self.inner.cond.notify_one();
    }

    /// Waits for the interrupt to fire, consuming the signal. Returns
    /// false if `timeout` elapsed first.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut signaled = self.inner.signaled.lock();
        if !*signaled {
            let _ = self.inner.cond.wait_for(&mut signaled, timeout);
        }
        std::mem::take(&mut signaled)
    }

    /// Consumes a pending signal without waiting.
    pub fn clear(&self) {
        *self.inner.signaled.lock() = false;
    }
}

impl Default for DeviceInterrupt {
    fn default() -> Self {
        Self::new()
    }
}
