//! # Engine
//!
//! The composition of one write buffer and one database as a single
//! versioned store. Writes validate, append durably to the buffer, and
//! acknowledge; reads overlay the buffer (newest) on the database
//! (older). A background transporter drains aged buffer prefixes into
//! sealed database blocks.
//!
//! ```text
//!             writes                reads
//!               │                     │
//!               v                     v
//!        ┌────────────────────────────────────┐
//!        │                Engine              │
//!        │  version registry · token locks    │
//!        ├──────────────┬─────────────────────┤
//!        │ Write Buffer │──transport──> Database
//!        │ (append log) │               (blocks)
//!        └──────────────┴─────────────────────┘
//! ```
//!
//! ## Versioning
//!
//! One monotonic counter stamps every accepted write; at startup it is
//! seeded past the newest version either store holds durably, so a
//! restarted engine never reissues a version.
//!
//! ## Atomic Operations
//!
//! [`Engine::start_atomic_operation`] opens an optimistic, staged
//! operation; [`Engine::stage`] opens the session-scoped flavor
//! ([`Transaction`]). Both validate observed token versions at commit
//! inside a short exclusive critical section (token locks in canonical
//! order, then the version-broadcast latch) and learn about conflicting
//! writes in between through the registry's notifications.
//!
//! ## Failure Policy
//!
//! A durability failure in the buffer poisons the engine for writes —
//! every later write is rejected — while reads continue against the
//! last good state. Transport failures are retried on the next
//! transporter wakeup. Stopping the engine parks the transporter,
//! stops both stores, and leaves everything replayable on disk.

mod atomic;
mod locks;
mod registry;
mod transaction;

pub use atomic::AtomicOperation;
pub use locks::{Intent, LockBroker, Token};
pub use registry::{OperationState, TokenRegistry};
pub use transaction::Transaction;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use eyre::{ensure, Result, WrapErr};
use parking_lot::{Condvar, Mutex};
use tracing::{info, warn};

use crate::bitset::LongBitSet;
use crate::buffer::Buffer;
use crate::config::{Config, TRANSPORT_IDLE_WAIT_MS};
use crate::db::Database;
use crate::store::Store;
use crate::types::{Operator, Revision, Value, Write};

pub(crate) struct EngineShared {
    pub(crate) environment: String,
    pub(crate) buffer: Buffer,
    pub(crate) database: Database,
    pub(crate) registry: TokenRegistry,
    pub(crate) locks: LockBroker,
    pub(crate) commit_latch: Mutex<()>,
    transport_batch: usize,
    running: AtomicBool,
    failed: AtomicBool,
    shutdown: AtomicBool,
    transport_pending: Mutex<bool>,
    transport_signal: Condvar,
}

impl EngineShared {
    pub(crate) fn check_readable(&self) -> Result<()> {
        ensure!(
            self.running.load(Ordering::Acquire),
            "engine for environment '{}' is not running",
            self.environment
        );
        Ok(())
    }

    pub(crate) fn check_writable(&self) -> Result<()> {
        self.check_readable()?;
        ensure!(
            !self.failed.load(Ordering::Acquire),
            "engine for environment '{}' rejected the write: a previous durability \
             failure poisoned it",
            self.environment
        );
        Ok(())
    }

    /// Appends a validated write and broadcasts the version change.
    /// Callers hold the token locks and the commit latch.
    pub(crate) fn apply(&self, write: Write) -> Result<Revision> {
        let revision = match self.buffer.append(write) {
            Ok(revision) => revision,
            Err(e) => {
                self.failed.store(true, Ordering::Release);
                return Err(e).wrap_err("durable append failed; engine now rejects writes");
            }
        };
        let tokens = Token::for_write(&revision.key, revision.record);
        self.registry.publish(&revision, &tokens);
        self.signal_transport();
        Ok(revision)
    }

    fn signal_transport(&self) {
        let mut pending = self.transport_pending.lock();
        *pending = true;
        self.transport_signal.notify_one();
    }
}

/// One environment's versioned store: a buffer and a database rooted at
/// two disjoint directories, plus the machinery for atomic operations.
pub struct Engine {
    shared: Arc<EngineShared>,
    transporter: Mutex<Option<JoinHandle<()>>>,
}

impl Engine {
    /// An engine for the config's default environment.
    pub fn new(config: &Config) -> Result<Self> {
        let default = config.default_environment.clone();
        Self::for_environment(config, &default)
    }

    /// An engine for a named environment. The name is sanitized; an
    /// empty sanitized name falls back to the config's default.
    pub fn for_environment(config: &Config, environment: &str) -> Result<Self> {
        config.validate()?;
        let (buffer_dir, database_dir) = config.environment_dirs(environment)?;
        let environment = crate::config::environment::sanitize_with_default(
            environment,
            &config.default_environment,
        );
        Ok(Self {
            shared: Arc::new(EngineShared {
                environment,
                buffer: Buffer::new(buffer_dir),
                database: Database::new(database_dir, config.block_seal_threshold),
                registry: TokenRegistry::new(),
                locks: LockBroker::new(),
                commit_latch: Mutex::new(()),
                transport_batch: config.transport_batch_size,
                running: AtomicBool::new(false),
                failed: AtomicBool::new(false),
                shutdown: AtomicBool::new(false),
                transport_pending: Mutex::new(false),
                transport_signal: Condvar::new(),
            }),
            transporter: Mutex::new(None),
        })
    }

    pub fn environment(&self) -> &str {
        &self.shared.environment
    }

    pub fn buffer_directory(&self) -> PathBuf {
        self.shared.buffer.directory().to_path_buf()
    }

    pub fn database_directory(&self) -> PathBuf {
        self.shared.database.directory().to_path_buf()
    }

    /// Starts both stores, aligns the version clock past everything
    /// durable, and launches the transporter.
    pub fn start(&self) -> Result<()> {
        ensure!(
            !self.shared.running.load(Ordering::Acquire),
            "engine for environment '{}' is already running",
            self.shared.environment
        );
        let database_max = self.shared.database.start()?;
        let buffer_max = self.shared.buffer.start()?;
        self.shared
            .buffer
            .align_version_clock(database_max.max(buffer_max));
        self.shared.shutdown.store(false, Ordering::Release);
        self.shared.running.store(true, Ordering::Release);

        let shared = Arc::clone(&self.shared);
        let handle = std::thread::Builder::new()
            .name(format!("transporter-{}", self.shared.environment))
            .spawn(move || transporter_loop(shared))
            .wrap_err("failed to spawn the transporter thread")?;
        *self.transporter.lock() = Some(handle);

        info!(
            environment = %self.shared.environment,
            version_floor = database_max.max(buffer_max),
            "engine started"
        );
        Ok(())
    }

    /// Parks the transporter and stops both stores. Untransported
    /// writes stay in the buffer's segments and replay on the next
    /// start.
    pub fn stop(&self) {
        if !self.shared.running.swap(false, Ordering::AcqRel) {
            return;
        }
        self.shared.shutdown.store(true, Ordering::Release);
        self.shared.signal_transport();
        if let Some(handle) = self.transporter.lock().take() {
            if handle.join().is_err() {
                warn!("transporter thread panicked during shutdown");
            }
        }
        self.shared.buffer.stop();
        self.shared.database.stop();
        info!(environment = %self.shared.environment, "engine stopped");
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    /// Adds `value` to (key, record). Returns false when the value is
    /// already present.
    pub fn add(&self, key: &str, value: Value, record: i64) -> Result<bool> {
        self.shared.check_writable()?;
        validate_key(key)?;
        let requests = Token::for_write(key, record)
            .into_iter()
            .map(|token| (token, Intent::Exclusive))
            .collect();
        let _grant = self.shared.locks.acquire(requests);
        let _latch = self.shared.commit_latch.lock();
        if self
            .shared
            .buffer
            .verify(key, &value, record, None, &self.shared.database)?
        {
            return Ok(false);
        }
        self.shared.apply(Write::add(key, value, record))?;
        Ok(true)
    }

    /// Removes `value` from (key, record). Returns false when the value
    /// is not present.
    pub fn remove(&self, key: &str, value: Value, record: i64) -> Result<bool> {
        self.shared.check_writable()?;
        validate_key(key)?;
        let requests = Token::for_write(key, record)
            .into_iter()
            .map(|token| (token, Intent::Exclusive))
            .collect();
        let _grant = self.shared.locks.acquire(requests);
        let _latch = self.shared.commit_latch.lock();
        if !self
            .shared
            .buffer
            .verify(key, &value, record, None, &self.shared.database)?
        {
            return Ok(false);
        }
        self.shared.apply(Write::remove(key, value, record))?;
        Ok(true)
    }

    /// Replaces every value of (key, record) with exactly `value`.
    pub fn set(&self, key: &str, value: Value, record: i64) -> Result<()> {
        self.shared.check_writable()?;
        validate_key(key)?;
        let requests = Token::for_write(key, record)
            .into_iter()
            .map(|token| (token, Intent::Exclusive))
            .collect();
        let _grant = self.shared.locks.acquire(requests);
        let _latch = self.shared.commit_latch.lock();
        let current = self
            .shared
            .buffer
            .select(key, record, None, &self.shared.database)?;
        for existing in current {
            self.shared.apply(Write::remove(key, existing, record))?;
        }
        self.shared.apply(Write::add(key, value, record))?;
        Ok(())
    }

    /// Opens an optimistic atomic operation over this engine.
    pub fn start_atomic_operation(&self) -> Result<AtomicOperation<'_>> {
        self.shared.check_readable()?;
        Ok(AtomicOperation::open(&self.shared))
    }

    /// Opens a session transaction (`stage` / `commit` / `abort`).
    pub fn stage(&self) -> Result<Transaction<'_>> {
        Ok(Transaction::open(self.start_atomic_operation()?))
    }

    /// Revisions waiting in the buffer, for observability and tests.
    pub fn backlog(&self) -> usize {
        self.shared.buffer.backlog()
    }

    /// Forces a full drain of the buffer into sealed, fsynced blocks.
    pub fn trigger_sync(&self) -> Result<()> {
        self.shared.check_readable()?;
        while self
            .shared
            .buffer
            .transport(&self.shared.database, self.shared.transport_batch)?
            > 0
        {}
        Ok(())
    }
}

impl Store for Engine {
    fn select(&self, key: &str, record: i64, ts: Option<i64>) -> Result<Vec<Value>> {
        self.shared.check_readable()?;
        self.shared
            .buffer
            .select(key, record, ts, &self.shared.database)
    }

    fn describe(&self, record: i64, ts: Option<i64>) -> Result<Vec<String>> {
        self.shared.check_readable()?;
        self.shared.buffer.describe(record, ts, &self.shared.database)
    }

    fn find(
        &self,
        key: &str,
        operator: Operator,
        values: &[Value],
        ts: Option<i64>,
    ) -> Result<LongBitSet> {
        self.shared.check_readable()?;
        let matcher = operator.bind(values)?;
        self.shared
            .buffer
            .find(key, &matcher, ts, &self.shared.database)
    }

    fn search(&self, key: &str, query: &str) -> Result<LongBitSet> {
        self.shared.check_readable()?;
        self.shared.buffer.search(key, query, &self.shared.database)
    }

    fn verify(&self, key: &str, value: &Value, record: i64, ts: Option<i64>) -> Result<bool> {
        self.shared.check_readable()?;
        self.shared
            .buffer
            .verify(key, value, record, ts, &self.shared.database)
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.stop();
    }
}

fn validate_key(key: &str) -> Result<()> {
    ensure!(!key.is_empty(), "keys must not be empty");
    Ok(())
}

fn transporter_loop(shared: Arc<EngineShared>) {
    loop {
        {
            let mut pending = shared.transport_pending.lock();
            if !*pending && !shared.shutdown.load(Ordering::Acquire) {
                shared.transport_signal.wait_for(
                    &mut pending,
                    Duration::from_millis(TRANSPORT_IDLE_WAIT_MS),
                );
            }
            *pending = false;
        }
        if shared.shutdown.load(Ordering::Acquire) {
            return;
        }
        while shared.buffer.backlog() > 0 && !shared.shutdown.load(Ordering::Acquire) {
            match shared.buffer.transport(&shared.database, shared.transport_batch) {
                Ok(0) => break,
                Ok(_) => continue,
                Err(e) => {
                    warn!(error = %e, "transport failed, retrying on next wakeup");
                    break;
                }
            }
        }
    }
}
