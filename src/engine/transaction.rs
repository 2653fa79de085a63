//! # Transactions
//!
//! A transaction is an atomic operation stretched across a client
//! session: opened with [`crate::engine::Engine::stage`], carried
//! between calls, and resolved with `commit` or `abort`. It inherits the
//! atomic operation's optimistic validation, staged visibility, and
//! version-change notification wholesale; the only difference is the
//! session-shaped surface.

use std::ops::{Deref, DerefMut};

use eyre::Result;

use super::atomic::AtomicOperation;

pub struct Transaction<'a> {
    operation: AtomicOperation<'a>,
}

impl<'a> Transaction<'a> {
    pub(crate) fn open(operation: AtomicOperation<'a>) -> Self {
        Self { operation }
    }

    /// Commits the staged writes; false when a watched region changed.
    pub fn commit(self) -> Result<bool> {
        self.operation.commit()
    }

    /// Discards the session's staged writes.
    pub fn abort(self) {
        self.operation.abort();
    }
}

impl<'a> Deref for Transaction<'a> {
    type Target = AtomicOperation<'a>;

    fn deref(&self) -> &Self::Target {
        &self.operation
    }
}

impl DerefMut for Transaction<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.operation
    }
}
