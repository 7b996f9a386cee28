use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// Counting semaphore bounding how many expensive loads run at once.
pub struct Semaphore {
    state: Arc<SemaphoreState>,
}

struct SemaphoreState {
    count: Mutex<usize>,
    condition: Condvar,
}

pub struct SemaphoreGuard {
    state: Arc<SemaphoreState>,
}

impl Semaphore {
    pub fn new(permits: usize) -> Self {
        Self {
            state: Arc::new(SemaphoreState {
                count: Mutex::new(permits.max(1)),
                condition: Condvar::new(),
            }),
        }
    }

    /// `None` when no permit freed up within `timeout`.
    pub fn acquire_timeout(&self, timeout: Duration) -> Option<SemaphoreGuard> {
        let deadline = Instant::now() + timeout;
        let mut count = self.state.count.lock();
        while *count == 0 {
            if self
                .state
                .condition
                .wait_until(&mut count, deadline)
                .timed_out()
                && *count == 0
            {
                return None;
            }
        }
        *count -= 1;
        Some(SemaphoreGuard {
            state: self.state.clone(),
        })
    }

    pub fn available_permits(&self) -> usize {
        *self.state.count.lock()
    }
}

impl SemaphoreGuard {
    fn release(&self) {
        let mut count = self.state.count.lock();
        *count += 1;
        self.state.condition.notify_one();
    }
}

impl Drop for SemaphoreGuard {
    fn drop(&mut self) {
        self.release();
    }
}
