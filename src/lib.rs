//! # StrataDB - Versioned, Transactional Storage Engine
//!
//! StrataDB is an embedded, self-describing, versioned store: every write
//! is an immutable ADD or REMOVE of a typed (key, value) pair against a
//! 64-bit record, stamped with a monotonic version. Reads reconstruct
//! state by folding revisions, which makes history a first-class query
//! dimension rather than an afterthought.
//!
//! ## Architecture
//!
//! StrataDB uses a layered architecture:
//!
//! ```text
//! ┌─────────────────────────────────────┐
//! │      Public API (Engine / Store)     │
//! ├─────────────────────────────────────┤
//! │  Atomic Operations │  Transactions   │
//! ├────────────────────┴────────────────┤
//! │  Version Registry │   Token Locks    │
//! ├───────────────────┼─────────────────┤
//! │   Write Buffer    │    Database      │
//! │   (append log)    │ (block families) │
//! ├─────────────────────────────────────┤
//! │   Framed, checksummed file I/O       │
//! └─────────────────────────────────────┘
//! ```
//!
//! Writes append durably to the buffer and acknowledge; a background
//! transporter drains aged prefixes into three sealed, immutable block
//! families (by record, by value, by search token). Reads overlay the
//! buffer on the database, so a write is visible the moment its append
//! returns.
//!
//! ## File Layout
//!
//! ```text
//! buffer_dir/<environment>/
//! ├── 1.seg                    framed revisions awaiting transport
//! └── transport.cursor
//! database_dir/<environment>/
//! ├── cpb/<id>.{blk,idx}       primary blocks: record → key → values
//! ├── csb/<id>.{blk,idx}       secondary blocks: key → value → records
//! └── ctb/<id>.{blk,idx}       search blocks: key → token → records
//! ```
//!
//! ## Quick Start
//!
//! ```ignore
//! use stratadb::{Config, Engine, Store, Value};
//!
//! let config = Config::new("./data/buffer", "./data/database");
//! let engine = Engine::new(&config)?;
//! engine.start()?;
//!
//! engine.add("name", Value::String("ada".into()), 1)?;
//! let values = engine.select("name", 1, None)?;
//!
//! let mut op = engine.start_atomic_operation()?;
//! op.add("age", Value::Integer(36), 1)?;
//! assert!(op.commit()?);
//! ```
//!
//! ## Module Overview
//!
//! - [`engine`]: the composed store, atomic operations, transactions
//! - [`buffer`]: durable append log with overlay reads and transport
//! - [`db`]: the three block families, sealing, balance, record caches
//! - [`bitset`]: sparse long bit set indexing record identifiers
//! - [`types`]: typed values, operators, writes, the wire encoding
//! - [`pool`]: fixed-size blocking resource pool
//! - [`config`]: startup configuration and environment sanitization
//! - [`io`]: filesystem façade and the shared frame codec

pub mod bitset;
pub mod buffer;
pub mod config;
pub mod db;
pub mod engine;
pub mod io;
pub mod pool;
pub mod store;
pub mod types;

pub use bitset::LongBitSet;
pub use config::{sanitize, Config};
pub use db::Database;
pub use engine::{AtomicOperation, Engine, Transaction};
pub use pool::FixedPool;
pub use store::Store;
pub use types::{Action, Operator, Revision, Value, Write};
