//! # Atomic Operations
//!
//! An atomic operation stages writes against the engine without making
//! them visible, watches the version of everything it reads, and commits
//! all-or-nothing: if any watched token moved since observation, the
//! commit fails and the caller may retry.
//!
//! ## State Machine
//!
//! ```text
//!            commit ok             external version change
//! ┌──────┐ ───────────> COMMITTED        │
//! │ OPEN │ ───────────> ABORTED          v
//! └──────┘    abort /          <──── NOTIFIED ── commit attempt
//!             failed commit
//! ```
//!
//! Terminal states are absorbing. Commit and abort consume the
//! operation, so double-commit is unrepresentable; `NOTIFIED` arrives
//! asynchronously through the registry and turns any later commit into
//! a clean `false`.
//!
//! ## Read-Your-Writes
//!
//! Every read folds the staged writes over the engine overlay, so an
//! operation observes its own pending mutations the way a committed
//! reader eventually will.
//!
//! ## Watches
//!
//! The first read of a region records the region token's version and
//! registers the operation as a change listener:
//!
//! - `select` / `verify` / `add` / `remove` watch the (key, record) field
//! - `find` watches the whole key (range reads see inserts anywhere)
//! - `describe` watches the whole record
//!
//! Commit acquires the watched tokens shared and the staged writes'
//! tokens exclusive — in canonical order, all-or-nothing — then takes
//! the version-broadcast latch, revalidates every watch, and applies the
//! staged writes in order. A read-then-write of the same key never
//! deadlocks: the grant is computed as one canonical set with the
//! strongest intent per token.

use std::collections::BTreeMap;
use std::sync::Arc;

use eyre::Result;
use hashbrown::HashMap;
use smallvec::SmallVec;

use super::locks::{Intent, Token};
use super::registry::OperationState;
use super::EngineShared;
use crate::bitset::LongBitSet;
use crate::db::fold_value;
use crate::types::{Action, Operator, Value, Write};

/// A staged, optimistically validated batch of reads and writes.
pub struct AtomicOperation<'a> {
    shared: &'a EngineShared,
    state: Arc<OperationState>,
    staged: SmallVec<[Write; 16]>,
    watches: HashMap<Token, i64>,
}

impl<'a> AtomicOperation<'a> {
    pub(crate) fn open(shared: &'a EngineShared) -> Self {
        Self {
            shared,
            state: OperationState::new_open(),
            staged: SmallVec::new(),
            watches: HashMap::new(),
        }
    }

    /// False once the operation was notified of a conflicting write or
    /// reached a terminal state.
    pub fn is_open(&self) -> bool {
        self.state.is_open()
    }

    /// True when a watched region changed while the operation was open.
    pub fn was_notified(&self) -> bool {
        self.state.was_notified()
    }

    /// All values of (key, record), including staged writes.
    pub fn select(&mut self, key: &str, record: i64) -> Result<Vec<Value>> {
        self.watch(Token::Field(key.to_string(), record));
        let mut values = self
            .shared
            .buffer
            .select(key, record, None, &self.shared.database)?;
        for write in &self.staged {
            if write.key == key && write.record == record {
                fold_value(&mut values, write.action, &write.value);
            }
        }
        Ok(values)
    }

    /// True iff (key, value, record) is present, including staged writes.
    pub fn verify(&mut self, key: &str, value: &Value, record: i64) -> Result<bool> {
        self.watch(Token::Field(key.to_string(), record));
        let mut present = self
            .shared
            .buffer
            .verify(key, value, record, None, &self.shared.database)?;
        for write in &self.staged {
            if write.key == key && write.record == record && &write.value == value {
                present = write.action == Action::Add;
            }
        }
        Ok(present)
    }

    /// The keys of `record` holding at least one value, including staged
    /// writes.
    pub fn describe(&mut self, record: i64) -> Result<Vec<String>> {
        self.watch(Token::Record(record));
        let mut keys = self
            .shared
            .buffer
            .describe(record, None, &self.shared.database)?;
        let staged_keys: Vec<String> = self
            .staged
            .iter()
            .filter(|w| w.record == record)
            .map(|w| w.key.clone())
            .collect();
        for key in staged_keys {
            let present = !self.select(&key, record)?.is_empty();
            let listed = keys.contains(&key);
            if present && !listed {
                keys.push(key);
            } else if !present && listed {
                keys.retain(|k| k != &key);
            }
        }
        keys.sort();
        Ok(keys)
    }

    /// The records where `key` satisfies `operator`, including staged
    /// writes. Watches the whole key, so any later write to it conflicts.
    pub fn find(
        &mut self,
        key: &str,
        operator: Operator,
        values: &[Value],
    ) -> Result<LongBitSet> {
        self.watch(Token::Key(key.to_string()));
        let matcher = operator.bind(values)?;
        let mut index: BTreeMap<Value, LongBitSet> =
            self.shared
                .buffer
                .explore(key, &matcher, None, &self.shared.database)?;
        for write in &self.staged {
            if write.key == key && matcher.matches(&write.value) {
                let records = index.entry(write.value.clone()).or_default();
                records.set_value(write.record, write.action == Action::Add);
            }
        }
        let mut records = LongBitSet::new();
        for qualifying in index.values() {
            records.union_with(qualifying);
        }
        Ok(records)
    }

    /// Stages an ADD. Returns false when the value is already present
    /// under the operation's view.
    pub fn add(&mut self, key: &str, value: Value, record: i64) -> Result<bool> {
        if self.verify(key, &value, record)? {
            return Ok(false);
        }
        self.staged.push(Write::add(key, value, record));
        Ok(true)
    }

    /// Stages a REMOVE. Returns false when the value is not present
    /// under the operation's view.
    pub fn remove(&mut self, key: &str, value: Value, record: i64) -> Result<bool> {
        if !self.verify(key, &value, record)? {
            return Ok(false);
        }
        self.staged.push(Write::remove(key, value, record));
        Ok(true)
    }

    /// Stages the replacement of every value of (key, record) with
    /// exactly `value`.
    pub fn set(&mut self, key: &str, value: Value, record: i64) -> Result<()> {
        let current = self.select(key, record)?;
        for existing in current {
            self.staged.push(Write::remove(key, existing, record));
        }
        self.staged.push(Write::add(key, value, record));
        Ok(())
    }

    /// Validates every watch and applies the staged writes in order
    /// inside a short exclusive critical section. Returns false — and
    /// closes the operation — when a watched region changed since
    /// observation.
    pub fn commit(self) -> Result<bool> {
        if !self.state.is_open() {
            return Ok(false);
        }
        self.shared.check_writable()?;

        let mut requests: Vec<(Token, Intent)> = self
            .watches
            .keys()
            .map(|token| (token.clone(), Intent::Shared))
            .collect();
        for write in &self.staged {
            for token in Token::for_write(&write.key, write.record) {
                requests.push((token, Intent::Exclusive));
            }
        }

        let _grant = self.shared.locks.acquire(requests);
        let _latch = self.shared.commit_latch.lock();
        if !self.state.is_open() {
            return Ok(false);
        }
        for (token, observed) in &self.watches {
            if self.shared.registry.version_of(token) > *observed {
                self.state.close();
                return Ok(false);
            }
        }
        for write in &self.staged {
            self.shared.apply(write.clone())?;
        }
        self.state.close();
        Ok(true)
    }

    /// Discards the staged writes and closes.
    pub fn abort(self) {
        self.state.close();
    }

    fn watch(&mut self, token: Token) {
        if self.watches.contains_key(&token) {
            return;
        }
        let observed = self.shared.registry.version_of(&token);
        self.shared
            .registry
            .observe(token.clone(), &self.state, observed);
        self.watches.insert(token, observed);
    }
}

impl Drop for AtomicOperation<'_> {
    fn drop(&mut self) {
        // Commit and abort already closed; an operation dropped mid-flight
        // aborts implicitly.
        self.state.close();
    }
}
