//! Counting semaphore and per-host download limiter.
//!
//! Uses `Mutex + Condvar` from std — no external dependencies.

use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex};

/// A counting semaphore that limits concurrent access to a shared resource.
pub struct Semaphore {
    state: Mutex<usize>,
    cond: Condvar,
}

/// RAII guard that releases one permit on drop.
pub struct SemaphoreGuard<'a>(&'a Semaphore);

/// Owned guard backed by an `Arc`, usable across call boundaries.
pub struct OwnedSemaphoreGuard(Arc<Semaphore>);

impl Semaphore {
    /// Create a semaphore with `permits` initial permits.
    pub fn new(permits: usize) -> Self {
        Self {
            state: Mutex::new(permits),
            cond: Condvar::new(),
        }
    }

    /// Block until a permit is available, then acquire it.
    pub fn acquire(&self) -> SemaphoreGuard<'_> {
        self.wait_and_take();
        SemaphoreGuard(self)
    }

    /// Like [`acquire`](Self::acquire), but the guard owns a clone of the
    /// `Arc` and can outlive the caller's borrow.
    pub fn acquire_owned(self: &Arc<Self>) -> OwnedSemaphoreGuard {
        self.wait_and_take();
        OwnedSemaphoreGuard(self.clone())
    }

    fn wait_and_take(&self) {
        let mut count = self.state.lock().unwrap();
        while *count == 0 {
            count = self.cond.wait(count).unwrap();
        }
        *count -= 1;
    }

    fn release(&self) {
        let mut count = self.state.lock().unwrap();
        *count += 1;
        self.cond.notify_one();
    }
}

impl Drop for SemaphoreGuard<'_> {
    fn drop(&mut self) {
        self.0.release();
    }
}

impl Drop for OwnedSemaphoreGuard {
    fn drop(&mut self) {
        self.0.release();
    }
}

/// Caps concurrent downloads per remote host, independent of the worker
/// pool size, so a burst of workers landing on one publisher does not trip
/// its rate limiting.
pub struct HostLimiter {
    permits_per_host: usize,
    hosts: Mutex<HashMap<String, Arc<Semaphore>>>,
}

impl HostLimiter {
    pub fn new(permits_per_host: usize) -> Self {
        Self {
            permits_per_host: permits_per_host.max(1),
            hosts: Mutex::new(HashMap::new()),
        }
    }

    /// Block until the host has a free download slot.
    pub fn acquire(&self, host: &str) -> OwnedSemaphoreGuard {
        let sem = {
            let mut hosts = self.hosts.lock().unwrap();
            hosts
                .entry(host.to_string())
                .or_insert_with(|| Arc::new(Semaphore::new(self.permits_per_host)))
                .clone()
        };
        sem.acquire_owned()
    }
}
