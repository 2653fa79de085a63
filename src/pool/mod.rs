//! # Fixed-Size Resource Pool
//!
//! A pool of exactly `size` reusable resources — engine sessions, client
//! connections — for callers that fan work across threads without paying
//! a construction cost per request.
//!
//! ## Contract
//!
//! - `request` blocks on a condition variable until a resource is free.
//!   The wait is a real block; there is no spin-and-recheck window.
//! - A dropped lease returns its resource to the pool that issued it.
//!   `release` does the same with an ownership check: releasing a lease
//!   against a pool that did not issue it is a usage error, and the
//!   lease still drains back to its own pool.
//! - The pool never grows: every resource is created up front and leases
//!   always return to their issuing pool's slot set, so no path — not
//!   even churn under load — can push it past `size`.
//! - `shutdown` succeeds only once every lease is back; shutting down
//!   with leases outstanding is a usage error, as is requesting from a
//!   pool that is shut down.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use eyre::{ensure, Result};
use parking_lot::{Condvar, Mutex};

static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(1);

struct PoolState<T> {
    free: Vec<T>,
    outstanding: usize,
    closed: bool,
}

struct PoolInner<T> {
    id: u64,
    size: usize,
    state: Mutex<PoolState<T>>,
    available: Condvar,
}

impl<T> PoolInner<T> {
    fn put_back(&self, resource: T) {
        let mut state = self.state.lock();
        state.outstanding = state.outstanding.saturating_sub(1);
        if !state.closed {
            debug_assert!(state.free.len() < self.size);
            state.free.push(resource);
        }
        drop(state);
        self.available.notify_one();
    }
}

/// A blocking, fixed-size pool.
pub struct FixedPool<T> {
    inner: Arc<PoolInner<T>>,
}

impl<T> FixedPool<T> {
    /// Builds a pool of `size` resources created by `make`.
    pub fn new<F>(size: usize, mut make: F) -> Result<Self>
    where
        F: FnMut() -> Result<T>,
    {
        ensure!(size > 0, "pool size must be positive");
        let mut free = Vec::with_capacity(size);
        for _ in 0..size {
            free.push(make()?);
        }
        Ok(Self {
            inner: Arc::new(PoolInner {
                id: NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed),
                size,
                state: Mutex::new(PoolState {
                    free,
                    outstanding: 0,
                    closed: false,
                }),
                available: Condvar::new(),
            }),
        })
    }

    pub fn size(&self) -> usize {
        self.inner.size
    }

    /// Blocks until a resource is free and leases it out.
    pub fn request(&self) -> Result<Lease<T>> {
        let mut state = self.inner.state.lock();
        loop {
            ensure!(!state.closed, "pool is shut down");
            if let Some(resource) = state.free.pop() {
                state.outstanding += 1;
                return Ok(Lease {
                    inner: Arc::clone(&self.inner),
                    resource: Some(resource),
                });
            }
            self.inner.available.wait(&mut state);
        }
    }

    /// Returns `lease` with an ownership check. The lease drains back to
    /// its issuing pool either way; the error only reports the misuse.
    pub fn release(&self, lease: Lease<T>) -> Result<()> {
        ensure!(
            lease.inner.id == self.inner.id,
            "cannot release a lease that this pool does not own"
        );
        drop(lease);
        Ok(())
    }

    /// Shuts the pool down. Every lease must already be back.
    pub fn shutdown(&self) -> Result<()> {
        let mut state = self.inner.state.lock();
        ensure!(
            state.outstanding == 0,
            "cannot shut down with {} lease(s) outstanding",
            state.outstanding
        );
        state.closed = true;
        state.free.clear();
        drop(state);
        self.inner.available.notify_all();
        Ok(())
    }
}

/// A leased resource; dereferences to `T` and returns to its pool on
/// drop.
pub struct Lease<T> {
    inner: Arc<PoolInner<T>>,
    resource: Option<T>,
}

impl<T> Drop for Lease<T> {
    fn drop(&mut self) {
        if let Some(resource) = self.resource.take() {
            self.inner.put_back(resource);
        }
    }
}

impl<T> std::ops::Deref for Lease<T> {
    type Target = T;

    fn deref(&self) -> &T {
        match &self.resource {
            Some(resource) => resource,
            // The resource only leaves in Drop.
            None => unreachable!("lease accessed after drop"),
        }
    }
}

impl<T> std::ops::DerefMut for Lease<T> {
    fn deref_mut(&mut self) -> &mut T {
        match &mut self.resource {
            Some(resource) => resource,
            None => unreachable!("lease accessed after drop"),
        }
    }
}
